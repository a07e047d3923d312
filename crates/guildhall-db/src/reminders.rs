use anyhow::Result;
use chrono::{DateTime, Utc};
use guildhall_types::Address;
use guildhall_types::models::Reminder;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::Database;
use crate::codec::{get_ts, get_utf8_blob, ts};

const REMINDER_COLUMNS: &str =
    "id, creator_id, interface, address, fire_at, text, attempts, failed, last_error, created_at";

impl Database {
    pub fn insert_reminder(
        &self,
        creator_id: Uuid,
        address: &Address,
        fire_at: DateTime<Utc>,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Reminder> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO reminders (creator_id, interface, address, fire_at, text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    creator_id,
                    address.interface,
                    address.target.as_bytes(),
                    ts(fire_at),
                    text,
                    ts(now),
                ],
            )?;
            Ok(Reminder {
                id: conn.last_insert_rowid(),
                creator_id,
                address: address.clone(),
                fire_at,
                text: text.to_string(),
                attempts: 0,
                failed: false,
                last_error: None,
                created_at: now,
            })
        })
    }

    pub fn get_reminder(&self, id: i64) -> Result<Option<Reminder>> {
        self.with_conn(|conn| query_reminder(conn, id))
    }

    /// Remove a reminder. Returns false if it was already gone.
    pub fn delete_reminder(&self, id: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute("DELETE FROM reminders WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
    }

    /// Every reminder still awaiting delivery, soonest first.
    pub fn pending_reminders(&self) -> Result<Vec<Reminder>> {
        self.with_conn(|conn| {
            query_reminders(
                conn,
                "WHERE failed = 0 ORDER BY fire_at, id",
                rusqlite::params![],
            )
        })
    }

    #[cfg(test)]
    pub fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>> {
        self.with_conn(|conn| {
            query_reminders(
                conn,
                "WHERE failed = 0 AND fire_at <= ?1 ORDER BY fire_at, id",
                rusqlite::params![ts(now)],
            )
        })
    }

    /// Count a failed delivery attempt. With `give_up` the reminder is
    /// parked as failed until its creator acknowledges it.
    pub fn record_reminder_failure(&self, id: i64, error: &str, give_up: bool) -> Result<u32> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE reminders SET attempts = attempts + 1, last_error = ?1,
                    failed = CASE WHEN ?2 THEN 1 ELSE failed END
                 WHERE id = ?3",
                rusqlite::params![error, give_up, id],
            )?;
            let attempts: Option<u32> = tx
                .query_row("SELECT attempts FROM reminders WHERE id = ?1", [id], |r| {
                    r.get(0)
                })
                .optional()?;
            Ok(attempts.unwrap_or(0))
        })
    }

    pub fn reminders_for(&self, creator_id: Uuid) -> Result<Vec<Reminder>> {
        self.with_conn(|conn| {
            query_reminders(
                conn,
                "WHERE creator_id = ?1 AND failed = 0 ORDER BY fire_at, id",
                rusqlite::params![creator_id],
            )
        })
    }

    /// Return and drop the creator's failed reminders.
    pub fn take_failed_reminders(&self, creator_id: Uuid) -> Result<Vec<Reminder>> {
        self.with_tx(|tx| {
            let failed = query_reminders(
                tx,
                "WHERE creator_id = ?1 AND failed = 1 ORDER BY fire_at, id",
                rusqlite::params![creator_id],
            )?;
            tx.execute(
                "DELETE FROM reminders WHERE creator_id = ?1 AND failed = 1",
                [creator_id],
            )?;
            Ok(failed)
        })
    }
}

fn query_reminder(conn: &Connection, id: i64) -> Result<Option<Reminder>> {
    let sql = format!("SELECT {} FROM reminders WHERE id = ?1", REMINDER_COLUMNS);
    Ok(conn.query_row(&sql, [id], reminder_from_row).optional()?)
}

fn query_reminders(
    conn: &Connection,
    tail: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<Reminder>> {
    let sql = format!("SELECT {} FROM reminders {}", REMINDER_COLUMNS, tail);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, reminder_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn reminder_from_row(row: &Row<'_>) -> rusqlite::Result<Reminder> {
    let interface: String = row.get(2)?;
    Ok(Reminder {
        id: row.get(0)?,
        creator_id: row.get(1)?,
        address: Address::new(interface, get_utf8_blob(row, 3)?),
        fire_at: get_ts(row, 4)?,
        text: row.get(5)?,
        attempts: row.get(6)?,
        failed: row.get(7)?,
        last_error: row.get(8)?,
        created_at: get_ts(row, 9)?,
    })
}
