use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use guildhall_db::{CloseOutcome, Database, VoteOutcome};
use guildhall_types::api::PollResponse;
use guildhall_types::models::{Mood, Poll, PollChoice, PollComment, PollState, Tally, User};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::notify::Notifier;
use crate::{Error, Result, blocking, required_text};

const MAX_QUESTION_LEN: usize = 300;
const MAX_DESCRIPTION_LEN: usize = 2000;
const MAX_COMMENT_LEN: usize = 1000;

#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// How often expired polls are swept and snapshotted.
    pub sweep_interval: StdDuration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            sweep_interval: StdDuration::from_secs(60),
        }
    }
}

pub struct PollEngine {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    policy: PollPolicy,
}

impl PollEngine {
    pub(crate) fn new(
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        policy: PollPolicy,
    ) -> Self {
        Self {
            db,
            clock,
            notifier,
            policy,
        }
    }

    pub async fn create(
        &self,
        creator: &User,
        question: &str,
        description: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Poll> {
        let question = required_text("question", question, MAX_QUESTION_LEN)?;
        let description = description
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| required_text("description", d, MAX_DESCRIPTION_LEN))
            .transpose()?;
        let now = self.clock.now();
        if let Some(exp) = expires_at {
            if exp <= now {
                return Err(Error::InvalidTime(format!(
                    "poll expiry {} is not in the future",
                    exp
                )));
            }
        }

        let poll = Poll {
            id: Uuid::new_v4(),
            creator_id: creator.id,
            question,
            description,
            created_at: now,
            expires_at,
            closed_at: None,
        };
        let stored = poll.clone();
        blocking(&self.db, move |db| db.create_poll(&stored)).await?;
        info!(poll_id = %poll.id, "Poll created");
        Ok(poll)
    }

    /// Record or change a vote. Returns whether the stored choice changed.
    pub async fn vote(&self, poll_id: Uuid, voter: &User, choice: PollChoice) -> Result<bool> {
        let now = self.clock.now();
        let voter_id = voter.id;
        let outcome =
            blocking(&self.db, move |db| db.cast_vote(poll_id, voter_id, choice, now)).await?;
        match outcome {
            VoteOutcome::Recorded { changed } => {
                debug!(%poll_id, %voter_id, choice = choice.as_str(), changed, "Vote recorded");
                Ok(changed)
            }
            VoteOutcome::NotFound => Err(poll_not_found(poll_id)),
            VoteOutcome::Closed => Err(Error::PollClosed(poll_id)),
        }
    }

    /// Comments are accepted on closed polls too.
    pub async fn comment(
        &self,
        poll_id: Uuid,
        author: &User,
        mood: Mood,
        text: &str,
    ) -> Result<PollComment> {
        let text = required_text("comment", text, MAX_COMMENT_LEN)?;
        let now = self.clock.now();
        let author_id = author.id;
        blocking(&self.db, move |db| {
            db.add_comment(poll_id, author_id, mood, &text, now)
        })
        .await?
        .ok_or_else(|| poll_not_found(poll_id))
    }

    pub async fn tally(&self, poll_id: Uuid) -> Result<Tally> {
        blocking(&self.db, move |db| db.tally(poll_id))
            .await?
            .ok_or_else(|| poll_not_found(poll_id))
    }

    /// Close a poll ahead of its expiry. Creator or admin only.
    pub async fn close(&self, poll_id: Uuid, requester: &User) -> Result<(Poll, Tally)> {
        let poll = self.fetch(poll_id).await?;
        if poll.creator_id != requester.id && !requester.is_admin() {
            return Err(Error::Unauthorised(
                "only the creator or an admin can close this poll".into(),
            ));
        }
        let (poll, tally, _) = self.snapshot(poll_id).await?;
        Ok((poll, tally))
    }

    /// Snapshot the tally if the poll has expired. Returns the tally when the
    /// poll closed during this call.
    pub async fn close_if_due(&self, poll_id: Uuid) -> Result<Option<Tally>> {
        let poll = self.fetch(poll_id).await?;
        if poll.closed_at.is_some() || poll.state_at(self.clock.now()) == PollState::Open {
            return Ok(None);
        }
        let (_, tally, just_closed) = self.snapshot(poll_id).await?;
        Ok(just_closed.then_some(tally))
    }

    pub async fn get(&self, poll_id: Uuid) -> Result<PollResponse> {
        let now = self.clock.now();
        blocking(&self.db, move |db| {
            let Some(poll) = db.get_poll(poll_id)? else {
                return Ok(None);
            };
            let tally = db.tally(poll_id)?.unwrap_or_default();
            let comments = db.list_comments(poll_id)?;
            Ok(Some(PollResponse {
                state: poll.state_at(now),
                poll,
                tally,
                comments,
            }))
        })
        .await?
        .ok_or_else(|| poll_not_found(poll_id))
    }

    pub async fn list_open(&self) -> Result<Vec<Poll>> {
        let now = self.clock.now();
        blocking(&self.db, move |db| db.list_open_polls(now)).await
    }

    /// Delete a poll together with its votes and comments.
    pub async fn delete(&self, poll_id: Uuid, requester: &User) -> Result<()> {
        let poll = self.fetch(poll_id).await?;
        if poll.creator_id != requester.id && !requester.is_admin() {
            return Err(Error::Unauthorised(
                "only the creator or an admin can delete this poll".into(),
            ));
        }
        blocking(&self.db, move |db| db.delete_poll(poll_id)).await?;
        info!(%poll_id, "Poll deleted");
        Ok(())
    }

    /// Background task that snapshots polls as they expire.
    pub async fn run_close_sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.policy.sweep_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.sweep_once().await {
                Ok(count) => {
                    if count > 0 {
                        info!("Poll sweep: closed {} expired polls", count);
                    }
                }
                Err(e) => {
                    warn!("Poll sweep error: {}", e);
                }
            }
        }
    }

    pub(crate) async fn sweep_once(&self) -> Result<usize> {
        let now = self.clock.now();
        let due = blocking(&self.db, move |db| db.due_polls(now)).await?;
        let mut closed = 0;
        for poll in due {
            match self.snapshot(poll.id).await {
                Ok(_) => closed += 1,
                Err(e) => warn!(poll_id = %poll.id, "Failed to close expired poll: {}", e),
            }
        }
        Ok(closed)
    }

    async fn fetch(&self, poll_id: Uuid) -> Result<Poll> {
        blocking(&self.db, move |db| db.get_poll(poll_id))
            .await?
            .ok_or_else(|| poll_not_found(poll_id))
    }

    /// Freeze the tally and tell the creator, once.
    async fn snapshot(&self, poll_id: Uuid) -> Result<(Poll, Tally, bool)> {
        let now = self.clock.now();
        match blocking(&self.db, move |db| db.close_poll(poll_id, now)).await? {
            CloseOutcome::Closed {
                poll,
                tally,
                just_closed,
            } => {
                if just_closed {
                    info!(%poll_id, %tally, "Poll closed");
                    let text = format!("Your poll \"{}\" has closed: {}", poll.question, tally);
                    self.notifier.notify_user(poll.creator_id, &text);
                }
                Ok((poll, tally, just_closed))
            }
            CloseOutcome::NotFound => Err(poll_not_found(poll_id)),
        }
    }
}

fn poll_not_found(id: Uuid) -> Error {
    Error::NotFound(format!("poll {}", id))
}
