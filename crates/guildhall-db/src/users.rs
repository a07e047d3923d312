use std::collections::BTreeSet;

use anyhow::Result;
use guildhall_types::Address;
use guildhall_types::models::User;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::Database;

const USER_COLUMNS: &str = "id, handle, roles, contact_interface, contact_target";

impl Database {
    /// Insert or refresh a user. Identity is provisioned externally, so the
    /// handle, roles and contact route are overwritten on every call.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.with_conn_mut(|conn| {
            let roles = user.roles.iter().cloned().collect::<Vec<_>>().join(",");
            let (iface, target) = match &user.contact {
                Some(a) => (Some(a.interface.as_str()), Some(a.target.as_str())),
                None => (None, None),
            };
            conn.execute(
                "INSERT INTO users (id, handle, roles, contact_interface, contact_target)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    handle = excluded.handle,
                    roles = excluded.roles,
                    contact_interface = excluded.contact_interface,
                    contact_target = excluded.contact_target",
                rusqlite::params![user.id, user.handle, roles, iface, target],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| query_user(conn, id))
    }

    /// Batch-fetch users. Unknown ids are skipped.
    pub fn get_users(&self, ids: &[Uuid]) -> Result<Vec<User>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT {} FROM users WHERE id IN ({})",
                USER_COLUMNS,
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), user_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

pub(crate) fn query_user(conn: &Connection, id: Uuid) -> Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    Ok(conn.query_row(&sql, [id], user_from_row).optional()?)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let roles: String = row.get(2)?;
    let iface: Option<String> = row.get(3)?;
    let target: Option<String> = row.get(4)?;
    Ok(User {
        id: row.get(0)?,
        handle: row.get(1)?,
        roles: roles
            .split(',')
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>(),
        contact: iface.zip(target).map(|(i, t)| Address::new(i, t)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{db, user};

    #[test]
    fn upsert_overwrites_handle_and_roles() {
        let db = db();
        let mut alice = user(&db, "alice");
        alice.handle = "alice2".into();
        alice.roles.insert("banker".into());
        alice.contact = Some(Address::user("gateway", alice.id));
        db.upsert_user(&alice).unwrap();

        let stored = db.get_user(alice.id).unwrap().unwrap();
        assert_eq!(stored, alice);
        assert!(stored.has_role("banker"));
    }

    #[test]
    fn batch_fetch_skips_unknown_ids() {
        let db = db();
        let a = user(&db, "a");
        let b = user(&db, "b");
        let mut got = db.get_users(&[a.id, Uuid::new_v4(), b.id]).unwrap();
        got.sort_by(|x, y| x.handle.cmp(&y.handle));
        assert_eq!(got, vec![a, b]);
        assert!(db.get_users(&[]).unwrap().is_empty());
    }
}
