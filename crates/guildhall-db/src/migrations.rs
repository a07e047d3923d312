use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Database: running migration v1 (initial schema)");
        conn.execute_batch(
            "
            BEGIN;

            CREATE TABLE users (
                id                  BLOB PRIMARY KEY,
                handle              TEXT NOT NULL,
                roles               TEXT NOT NULL DEFAULT '',
                contact_interface   TEXT,
                contact_target      TEXT
            );

            -- Wallets and their ledger. The ledger is append-only and a wallet
            -- cannot disappear while it has entries.
            CREATE TABLE wallets (
                user_id     BLOB PRIMARY KEY REFERENCES users(id),
                balance     INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0)
            );

            CREATE TABLE transactions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     BLOB NOT NULL REFERENCES wallets(user_id) ON DELETE RESTRICT,
                delta       INTEGER NOT NULL CHECK (delta != 0),
                reason      TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_transactions_wallet ON transactions(user_id, id);

            CREATE TRIGGER transactions_no_update BEFORE UPDATE ON transactions
            BEGIN
                SELECT RAISE(ABORT, 'ledger entries are immutable');
            END;

            CREATE TRIGGER transactions_no_delete BEFORE DELETE ON transactions
            BEGIN
                SELECT RAISE(ABORT, 'ledger entries are immutable');
            END;

            CREATE TABLE treasures (
                code            TEXT PRIMARY KEY,
                value           INTEGER NOT NULL CHECK (value > 0),
                creator_id      BLOB NOT NULL REFERENCES users(id),
                creator_paid    INTEGER NOT NULL,
                redeemed_by     BLOB REFERENCES users(id),
                created_at      TEXT NOT NULL,
                redeemed_at     TEXT
            );

            CREATE INDEX idx_treasures_redeemer ON treasures(redeemed_by);

            CREATE TABLE polls (
                id              BLOB PRIMARY KEY,
                creator_id      BLOB NOT NULL REFERENCES users(id),
                question        TEXT NOT NULL,
                description     TEXT,
                created_at      TEXT NOT NULL,
                expires_at      TEXT,
                closed_at       TEXT,
                closed_yes      INTEGER,
                closed_maybe    INTEGER,
                closed_no       INTEGER
            );

            CREATE INDEX idx_polls_open ON polls(closed_at, expires_at);

            CREATE TABLE poll_votes (
                poll_id     BLOB NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
                voter_id    BLOB NOT NULL REFERENCES users(id),
                choice      TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                PRIMARY KEY (poll_id, voter_id)
            );

            CREATE TABLE poll_comments (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                poll_id     BLOB NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
                author_id   BLOB NOT NULL REFERENCES users(id),
                mood        TEXT NOT NULL,
                text        TEXT NOT NULL,
                posted_at   TEXT NOT NULL
            );

            CREATE INDEX idx_poll_comments_poll ON poll_comments(poll_id, id);

            CREATE TABLE mm_events (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                creator_id      BLOB NOT NULL REFERENCES users(id),
                title           TEXT NOT NULL,
                description     TEXT,
                starts_at       TEXT,
                interface       TEXT NOT NULL,
                interrupted     INTEGER NOT NULL DEFAULT 0,
                phase           TEXT NOT NULL,
                interface_data  BLOB,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_mm_events_interrupted ON mm_events(interrupted);

            CREATE TABLE mm_responses (
                event_id    INTEGER NOT NULL REFERENCES mm_events(id) ON DELETE CASCADE,
                user_id     BLOB NOT NULL REFERENCES users(id),
                choice      TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (event_id, user_id)
            );

            CREATE TABLE reminders (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                creator_id  BLOB NOT NULL REFERENCES users(id),
                interface   TEXT NOT NULL,
                address     BLOB NOT NULL,
                fire_at     TEXT NOT NULL,
                text        TEXT NOT NULL,
                attempts    INTEGER NOT NULL DEFAULT 0,
                failed      INTEGER NOT NULL DEFAULT 0,
                last_error  TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_reminders_fire_at ON reminders(failed, fire_at);

            INSERT INTO schema_version (version) VALUES (1);

            COMMIT;
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
