use anyhow::Result;
use chrono::{DateTime, Utc};
use guildhall_types::models::{Mood, Poll, PollChoice, PollComment, PollState, PollVote, Tally};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::Database;
use crate::codec::{get_enum, get_opt_ts, get_ts, opt_ts, ts};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// `changed` is false when the voter repeated their current choice.
    Recorded { changed: bool },
    NotFound,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed {
        poll: Poll,
        tally: Tally,
        /// False if the poll had already been closed before this call.
        just_closed: bool,
    },
    NotFound,
}

const POLL_COLUMNS: &str = "id, creator_id, question, description, created_at, expires_at, closed_at";

impl Database {
    pub fn create_poll(&self, poll: &Poll) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO polls (id, creator_id, question, description, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    poll.id,
                    poll.creator_id,
                    poll.question,
                    poll.description,
                    ts(poll.created_at),
                    opt_ts(poll.expires_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_poll(&self, id: Uuid) -> Result<Option<Poll>> {
        self.with_conn(|conn| query_poll(conn, id))
    }

    /// Upsert the voter's choice. The open check runs inside the same
    /// transaction as the write.
    pub fn cast_vote(
        &self,
        poll_id: Uuid,
        voter_id: Uuid,
        choice: PollChoice,
        now: DateTime<Utc>,
    ) -> Result<VoteOutcome> {
        self.with_tx(|tx| {
            let Some(poll) = query_poll(tx, poll_id)? else {
                return Ok(VoteOutcome::NotFound);
            };
            if poll.state_at(now) == PollState::Closed {
                return Ok(VoteOutcome::Closed);
            }

            let previous = query_vote(tx, poll_id, voter_id)?;
            if previous.as_ref().is_some_and(|v| v.choice == choice) {
                return Ok(VoteOutcome::Recorded { changed: false });
            }

            tx.execute(
                "INSERT INTO poll_votes (poll_id, voter_id, choice, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(poll_id, voter_id) DO UPDATE SET choice = excluded.choice",
                rusqlite::params![poll_id, voter_id, choice.as_str(), ts(now)],
            )?;
            Ok(VoteOutcome::Recorded { changed: true })
        })
    }

    #[cfg(test)]
    pub fn get_vote(&self, poll_id: Uuid, voter_id: Uuid) -> Result<Option<PollVote>> {
        self.with_conn(|conn| query_vote(conn, poll_id, voter_id))
    }

    /// Append a comment. Returns `None` if the poll does not exist.
    pub fn add_comment(
        &self,
        poll_id: Uuid,
        author_id: Uuid,
        mood: Mood,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PollComment>> {
        self.with_tx(|tx| {
            if query_poll(tx, poll_id)?.is_none() {
                return Ok(None);
            }
            tx.execute(
                "INSERT INTO poll_comments (poll_id, author_id, mood, text, posted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![poll_id, author_id, mood.as_str(), text, ts(now)],
            )?;
            Ok(Some(PollComment {
                id: tx.last_insert_rowid(),
                poll_id,
                author_id,
                mood,
                text: text.to_string(),
                posted_at: now,
            }))
        })
    }

    pub fn list_comments(&self, poll_id: Uuid) -> Result<Vec<PollComment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, poll_id, author_id, mood, text, posted_at FROM poll_comments
                 WHERE poll_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([poll_id], |row| {
                    Ok(PollComment {
                        id: row.get(0)?,
                        poll_id: row.get(1)?,
                        author_id: row.get(2)?,
                        mood: get_enum(row, 3)?,
                        text: row.get(4)?,
                        posted_at: get_ts(row, 5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Tally of a poll: the closing snapshot once closed, the current votes
    /// otherwise. `None` if the poll does not exist.
    pub fn tally(&self, poll_id: Uuid) -> Result<Option<Tally>> {
        self.with_conn(|conn| {
            let snapshot: Option<(Option<u32>, Option<u32>, Option<u32>)> = conn
                .query_row(
                    "SELECT closed_yes, closed_maybe, closed_no FROM polls WHERE id = ?1",
                    [poll_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            match snapshot {
                None => Ok(None),
                Some((Some(yes), Some(maybe), Some(no))) => Ok(Some(Tally { yes, maybe, no })),
                Some(_) => live_tally(conn, poll_id).map(Some),
            }
        })
    }

    /// Close a poll and freeze its tally. Calling it on a closed poll
    /// returns the stored snapshot unchanged.
    pub fn close_poll(&self, poll_id: Uuid, now: DateTime<Utc>) -> Result<CloseOutcome> {
        self.with_tx(|tx| {
            let Some(mut poll) = query_poll(tx, poll_id)? else {
                return Ok(CloseOutcome::NotFound);
            };
            if poll.closed_at.is_some() {
                let tally = tx.query_row(
                    "SELECT closed_yes, closed_maybe, closed_no FROM polls WHERE id = ?1",
                    [poll_id],
                    |r| {
                        Ok(Tally {
                            yes: r.get(0)?,
                            maybe: r.get(1)?,
                            no: r.get(2)?,
                        })
                    },
                )?;
                return Ok(CloseOutcome::Closed {
                    poll,
                    tally,
                    just_closed: false,
                });
            }

            let tally = live_tally(tx, poll_id)?;
            tx.execute(
                "UPDATE polls SET closed_at = ?1, closed_yes = ?2, closed_maybe = ?3, closed_no = ?4
                 WHERE id = ?5",
                rusqlite::params![ts(now), tally.yes, tally.maybe, tally.no, poll_id],
            )?;
            poll.closed_at = Some(now);
            Ok(CloseOutcome::Closed {
                poll,
                tally,
                just_closed: true,
            })
        })
    }

    /// Polls past their expiry that have not been snapshotted yet.
    pub fn due_polls(&self, now: DateTime<Utc>) -> Result<Vec<Poll>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM polls
                 WHERE closed_at IS NULL AND expires_at IS NOT NULL AND expires_at <= ?1
                 ORDER BY expires_at",
                POLL_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([ts(now)], poll_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_open_polls(&self, now: DateTime<Utc>) -> Result<Vec<Poll>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM polls
                 WHERE closed_at IS NULL AND (expires_at IS NULL OR expires_at > ?1)
                 ORDER BY created_at DESC",
                POLL_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([ts(now)], poll_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Delete a poll with its votes and comments.
    pub fn delete_poll(&self, poll_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute("DELETE FROM polls WHERE id = ?1", [poll_id])?;
            Ok(n > 0)
        })
    }
}

fn query_poll(conn: &Connection, id: Uuid) -> Result<Option<Poll>> {
    let sql = format!("SELECT {} FROM polls WHERE id = ?1", POLL_COLUMNS);
    Ok(conn.query_row(&sql, [id], poll_from_row).optional()?)
}

fn query_vote(conn: &Connection, poll_id: Uuid, voter_id: Uuid) -> Result<Option<PollVote>> {
    Ok(conn
        .query_row(
            "SELECT poll_id, voter_id, choice, created_at FROM poll_votes
             WHERE poll_id = ?1 AND voter_id = ?2",
            rusqlite::params![poll_id, voter_id],
            |row| {
                Ok(PollVote {
                    poll_id: row.get(0)?,
                    voter_id: row.get(1)?,
                    choice: get_enum(row, 2)?,
                    created_at: get_ts(row, 3)?,
                })
            },
        )
        .optional()?)
}

fn live_tally(conn: &Connection, poll_id: Uuid) -> Result<Tally> {
    let mut stmt = conn.prepare("SELECT choice FROM poll_votes WHERE poll_id = ?1")?;
    let mut tally = Tally::default();
    let choices = stmt.query_map([poll_id], |row| get_enum::<PollChoice>(row, 0))?;
    for choice in choices {
        tally.record(choice?);
    }
    Ok(tally)
}

fn poll_from_row(row: &Row<'_>) -> rusqlite::Result<Poll> {
    Ok(Poll {
        id: row.get(0)?,
        creator_id: row.get(1)?,
        question: row.get(2)?,
        description: row.get(3)?,
        created_at: get_ts(row, 4)?,
        expires_at: get_opt_ts(row, 5)?,
        closed_at: get_opt_ts(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{db, user};
    use chrono::Duration;

    fn poll(creator: Uuid, now: DateTime<Utc>, expires_in: Option<Duration>) -> Poll {
        Poll {
            id: Uuid::new_v4(),
            creator_id: creator,
            question: "Raid tonight?".into(),
            description: None,
            created_at: now,
            expires_at: expires_in.map(|d| now + d),
            closed_at: None,
        }
    }

    #[test]
    fn repeated_vote_is_a_no_op_and_last_write_wins() {
        let db = db();
        let c = user(&db, "c");
        let v = user(&db, "v");
        let now = Utc::now();
        let p = poll(c.id, now, None);
        db.create_poll(&p).unwrap();

        assert_eq!(
            db.cast_vote(p.id, v.id, PollChoice::Yes, now).unwrap(),
            VoteOutcome::Recorded { changed: true }
        );
        assert_eq!(
            db.cast_vote(p.id, v.id, PollChoice::Yes, now).unwrap(),
            VoteOutcome::Recorded { changed: false }
        );
        db.cast_vote(p.id, v.id, PollChoice::No, now).unwrap();
        assert_eq!(
            db.tally(p.id).unwrap(),
            Some(Tally {
                yes: 0,
                maybe: 0,
                no: 1
            })
        );
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let db = db();
        let c = user(&db, "c");
        let now = Utc::now();
        let p = poll(c.id, now, Some(Duration::hours(1)));
        db.create_poll(&p).unwrap();
        let exp = now + Duration::hours(1);

        assert_eq!(
            db.cast_vote(p.id, c.id, PollChoice::Yes, exp - Duration::nanoseconds(1))
                .unwrap(),
            VoteOutcome::Recorded { changed: true }
        );
        assert_eq!(
            db.cast_vote(p.id, c.id, PollChoice::No, exp).unwrap(),
            VoteOutcome::Closed
        );
    }

    #[test]
    fn close_freezes_snapshot() {
        let db = db();
        let c = user(&db, "c");
        let now = Utc::now();
        let p = poll(c.id, now, Some(Duration::minutes(5)));
        db.create_poll(&p).unwrap();
        db.cast_vote(p.id, c.id, PollChoice::Maybe, now).unwrap();

        assert!(db.due_polls(now).unwrap().is_empty());
        let later = now + Duration::minutes(5);
        assert_eq!(db.due_polls(later).unwrap().len(), 1);

        let CloseOutcome::Closed {
            tally, just_closed, ..
        } = db.close_poll(p.id, later).unwrap()
        else {
            panic!("poll missing");
        };
        assert!(just_closed);
        assert_eq!(tally.maybe, 1);
        assert!(db.due_polls(later).unwrap().is_empty());

        // Tamper with the live rows; the snapshot must not move.
        db.with_conn_mut(|conn| {
            conn.execute("DELETE FROM poll_votes", [])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.tally(p.id).unwrap(), Some(tally));
        assert!(matches!(
            db.close_poll(p.id, later).unwrap(),
            CloseOutcome::Closed { just_closed: false, .. }
        ));
    }

    #[test]
    fn delete_cascades_to_votes_and_comments() {
        let db = db();
        let c = user(&db, "c");
        let now = Utc::now();
        let p = poll(c.id, now, None);
        db.create_poll(&p).unwrap();
        db.cast_vote(p.id, c.id, PollChoice::Yes, now).unwrap();
        db.add_comment(p.id, c.id, Mood::Positive, "count me in", now)
            .unwrap();

        assert!(db.delete_poll(p.id).unwrap());
        assert!(db.get_vote(p.id, c.id).unwrap().is_none());
        assert!(db.list_comments(p.id).unwrap().is_empty());
        assert!(
            db.add_comment(p.id, c.id, Mood::Neutral, "late", now)
                .unwrap()
                .is_none()
        );
    }
}
