use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use guildhall_types::models::{MmChoice, MmEvent, MmPhase, MmResponse};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::Database;
use crate::codec::{get_enum, get_opt_ts, get_ts, opt_ts, ts};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespondOutcome {
    Recorded {
        /// First response of this user to this lobby.
        first: bool,
        changed: bool,
    },
    NotFound,
    Closed,
}

const EVENT_COLUMNS: &str =
    "id, creator_id, title, description, starts_at, interface, interrupted, phase, interface_data, created_at";

pub struct NewEvent<'a> {
    pub creator_id: Uuid,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub when: Option<DateTime<Utc>>,
    pub interface: &'a str,
}

impl Database {
    pub fn create_event(&self, new: &NewEvent<'_>, now: DateTime<Utc>) -> Result<MmEvent> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO mm_events (creator_id, title, description, starts_at, interface, phase, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    new.creator_id,
                    new.title,
                    new.description,
                    opt_ts(new.when),
                    new.interface,
                    MmPhase::Created.as_str(),
                    ts(now),
                ],
            )?;
            Ok(MmEvent {
                id: conn.last_insert_rowid(),
                creator_id: new.creator_id,
                title: new.title.to_string(),
                description: new.description.map(str::to_string),
                when: new.when,
                interface: new.interface.to_string(),
                interrupted: false,
                phase: MmPhase::Created,
                interface_data: None,
                created_at: now,
            })
        })
    }

    pub fn get_event(&self, id: i64) -> Result<Option<MmEvent>> {
        self.with_conn(|conn| query_event(conn, id))
    }

    /// Lobbies still owned by a scheduler task.
    pub fn list_live_events(&self) -> Result<Vec<MmEvent>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM mm_events WHERE interrupted = 0 ORDER BY id",
                EVENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], event_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Persist the task's progress. Ignored once the lobby is interrupted so
    /// a racing task can never resurrect a cancelled event.
    pub fn update_event_state(
        &self,
        id: i64,
        phase: MmPhase,
        interface_data: Option<&[u8]>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE mm_events SET phase = ?1, interface_data = ?2
                 WHERE id = ?3 AND interrupted = 0",
                rusqlite::params![phase.as_str(), interface_data, id],
            )?;
            Ok(n > 0)
        })
    }

    /// Returns false if the event was already interrupted (or is missing).
    pub fn set_event_interrupted(&self, id: i64, phase: MmPhase) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE mm_events SET interrupted = 1, phase = ?1 WHERE id = ?2 AND interrupted = 0",
                rusqlite::params![phase.as_str(), id],
            )?;
            Ok(n > 0)
        })
    }

    /// Stop tracking a lobby without touching its phase.
    pub fn interrupt_event(&self, id: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE mm_events SET interrupted = 1 WHERE id = ?1 AND interrupted = 0",
                [id],
            )?;
            Ok(n > 0)
        })
    }

    pub fn set_event_start(&self, id: i64, when: DateTime<Utc>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE mm_events SET starts_at = ?1 WHERE id = ?2 AND interrupted = 0",
                rusqlite::params![ts(when), id],
            )?;
            Ok(n > 0)
        })
    }

    /// Record an RSVP. Rejected once the lobby is interrupted, has reached a
    /// terminal phase, or `now` is past the end of the grace window.
    pub fn upsert_response(
        &self,
        event_id: i64,
        user_id: Uuid,
        choice: MmChoice,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<RespondOutcome> {
        self.with_tx(|tx| {
            let Some(event) = query_event(tx, event_id)? else {
                return Ok(RespondOutcome::NotFound);
            };
            let past_grace = event.when.is_some_and(|w| now >= w + grace);
            if event.interrupted || event.phase.is_terminal() || past_grace {
                return Ok(RespondOutcome::Closed);
            }

            let previous: Option<MmChoice> = tx
                .query_row(
                    "SELECT choice FROM mm_responses WHERE event_id = ?1 AND user_id = ?2",
                    rusqlite::params![event_id, user_id],
                    |row| get_enum(row, 0),
                )
                .optional()?;
            if previous == Some(choice) {
                return Ok(RespondOutcome::Recorded {
                    first: false,
                    changed: false,
                });
            }

            tx.execute(
                "INSERT INTO mm_responses (event_id, user_id, choice, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(event_id, user_id) DO UPDATE SET
                    choice = excluded.choice,
                    updated_at = excluded.updated_at",
                rusqlite::params![event_id, user_id, choice.as_str(), ts(now)],
            )?;
            Ok(RespondOutcome::Recorded {
                first: previous.is_none(),
                changed: true,
            })
        })
    }

    pub fn list_responses(&self, event_id: i64) -> Result<Vec<MmResponse>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, user_id, choice, updated_at FROM mm_responses
                 WHERE event_id = ?1 ORDER BY updated_at, user_id",
            )?;
            let rows = stmt
                .query_map([event_id], |row| {
                    Ok(MmResponse {
                        event_id: row.get(0)?,
                        user_id: row.get(1)?,
                        choice: get_enum(row, 2)?,
                        updated_at: get_ts(row, 3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_event(conn: &Connection, id: i64) -> Result<Option<MmEvent>> {
    let sql = format!("SELECT {} FROM mm_events WHERE id = ?1", EVENT_COLUMNS);
    Ok(conn.query_row(&sql, [id], event_from_row).optional()?)
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<MmEvent> {
    Ok(MmEvent {
        id: row.get(0)?,
        creator_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        when: get_opt_ts(row, 4)?,
        interface: row.get(5)?,
        interrupted: row.get(6)?,
        phase: get_enum::<MmPhase>(row, 7)?,
        interface_data: row.get(8)?,
        created_at: get_ts(row, 9)?,
    })
}
