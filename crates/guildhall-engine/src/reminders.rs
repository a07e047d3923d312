//! Persistent delayed messages.
//!
//! Every pending reminder row is owned by one delivery task that sleeps until
//! `fire_at`, sends once, and deletes the row. Failed sends are counted on the
//! row and retried with backoff; after the last attempt (or a permanent
//! failure) the row is parked as failed until its creator looks at it.
//!
//! Reminders found past due at startup are delivered once, prefixed with
//! [`LATE_PREFIX`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use guildhall_db::Database;
use guildhall_types::Address;
use guildhall_types::api::RemindersResponse;
use guildhall_types::models::{Reminder, User};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{self, Clock};
use crate::retry::RetryPolicy;
use crate::sink::MessageSink;
use crate::tasks::{TaskCtx, TaskRegistry};
use crate::{Error, Result, blocking, required_text};

pub const LATE_PREFIX: &str = "[late] ";
const MAX_TEXT_LEN: usize = 2000;

#[derive(Debug, Clone)]
pub struct ReminderPolicy {
    pub retry: RetryPolicy,
    /// Furthest allowed `fire_at` from now.
    pub max_ahead: Duration,
}

impl Default for ReminderPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_ahead: Duration::days(365),
        }
    }
}

/// A freshly scheduled reminder, plus failures acknowledged by this call.
#[derive(Debug, Clone)]
pub struct Scheduled {
    pub reminder: Reminder,
    pub failed: Vec<Reminder>,
}

pub struct ReminderEngine {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MessageSink>,
    policy: ReminderPolicy,
    tasks: TaskRegistry<i64>,
    shutdown: CancellationToken,
}

impl ReminderEngine {
    pub(crate) fn new(
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MessageSink>,
        policy: ReminderPolicy,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            clock,
            sink,
            policy,
            tasks: TaskRegistry::new(),
            shutdown,
        })
    }

    pub async fn schedule(
        self: &Arc<Self>,
        creator: &User,
        address: Address,
        fire_at: DateTime<Utc>,
        text: &str,
    ) -> Result<Scheduled> {
        let text = required_text("reminder text", text, MAX_TEXT_LEN)?;
        if address.target.trim().is_empty() {
            return Err(Error::invalid("reminder target must not be empty"));
        }
        if !self.sink.supports(&address.interface) {
            return Err(Error::invalid(format!(
                "unknown interface '{}'",
                address.interface
            )));
        }
        let now = self.clock.now();
        if fire_at <= now {
            return Err(Error::InvalidTime(format!(
                "reminder time {} is not in the future",
                fire_at
            )));
        }
        if fire_at > now + self.policy.max_ahead {
            return Err(Error::UnreasonablyFar(fire_at));
        }

        let creator_id = creator.id;
        let reminder = blocking(&self.db, move |db| {
            db.insert_reminder(creator_id, &address, fire_at, &text, now)
        })
        .await?;
        info!(
            reminder_id = reminder.id,
            address = %reminder.address,
            %fire_at,
            "Reminder scheduled"
        );

        self.spawn_delivery(reminder.clone(), false);
        let failed = self.take_failed(creator_id).await?;
        Ok(Scheduled { reminder, failed })
    }

    /// Only the creator or an admin may cancel.
    pub async fn cancel(&self, id: i64, requester: &User) -> Result<()> {
        let reminder = blocking(&self.db, move |db| db.get_reminder(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("reminder {}", id)))?;
        if reminder.creator_id != requester.id && !requester.is_admin() {
            return Err(Error::Unauthorised(
                "only the creator or an admin can cancel this reminder".into(),
            ));
        }

        blocking(&self.db, move |db| db.delete_reminder(id)).await?;
        self.tasks.cancel(id);
        info!(reminder_id = id, "Reminder cancelled");
        Ok(())
    }

    /// Make sure every pending reminder has a delivery task. Rows already
    /// due are delivered immediately and marked late. Returns the number of
    /// tasks started.
    pub async fn tick(self: &Arc<Self>) -> Result<usize> {
        let now = self.clock.now();
        let pending = blocking(&self.db, |db| db.pending_reminders()).await?;
        let mut started = 0;
        for reminder in pending {
            let late = reminder.fire_at <= now;
            if self.spawn_delivery(reminder, late) {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Pending reminders of a user, acknowledging any failed ones.
    pub async fn list_for(&self, user_id: Uuid) -> Result<RemindersResponse> {
        let reminders = blocking(&self.db, move |db| db.reminders_for(user_id)).await?;
        let failed = self.take_failed(user_id).await?;
        Ok(RemindersResponse { reminders, failed })
    }

    pub async fn take_failed(&self, user_id: Uuid) -> Result<Vec<Reminder>> {
        blocking(&self.db, move |db| db.take_failed_reminders(user_id)).await
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) async fn shutdown(&self) {
        self.tasks.shutdown().await;
    }

    fn spawn_delivery(self: &Arc<Self>, reminder: Reminder, late: bool) -> bool {
        let engine = self.clone();
        self.tasks.spawn(reminder.id, &self.shutdown, move |ctx| {
            engine.deliver(reminder, late, ctx)
        })
    }

    async fn deliver(self: Arc<Self>, reminder: Reminder, late: bool, ctx: TaskCtx) {
        let id = reminder.id;
        if !clock::sleep_until(self.clock.as_ref(), reminder.fire_at, &ctx.cancel).await {
            debug!(reminder_id = id, "Reminder task stopped before firing");
            return;
        }

        let text = if late {
            format!("{}{}", LATE_PREFIX, reminder.text)
        } else {
            reminder.text.clone()
        };
        let retry = &self.policy.retry;
        let mut failures = reminder.attempts;

        loop {
            match blocking(&self.db, move |db| db.get_reminder(id)).await {
                Ok(Some(_)) => {}
                Ok(None) => return,
                Err(e) => {
                    error!(reminder_id = id, "Reminder lookup failed: {}", e);
                    return;
                }
            }

            let err = match retry.attempt(self.sink.send(&reminder.address, &text)).await {
                Ok(handle) => {
                    match blocking(&self.db, move |db| db.delete_reminder(id)).await {
                        Ok(_) => info!(reminder_id = id, %handle, "Reminder delivered"),
                        Err(e) => error!(reminder_id = id, "Delivered reminder not removed: {}", e),
                    }
                    return;
                }
                Err(e) => e,
            };

            let give_up = !err.is_transient() || failures + 1 >= retry.attempts;
            let message = err.to_string();
            match blocking(&self.db, move |db| {
                db.record_reminder_failure(id, &message, give_up)
            })
            .await
            {
                Ok(n) => failures = n,
                Err(e) => {
                    error!(reminder_id = id, "Could not record reminder failure: {}", e);
                    return;
                }
            }

            if give_up {
                warn!(reminder_id = id, attempts = failures, "Reminder delivery gave up: {}", err);
                return;
            }
            let delay = retry.delay_after(failures);
            warn!(
                reminder_id = id,
                attempts = failures,
                "Reminder delivery failed ({}), retrying in {:?}",
                err,
                delay
            );
            tokio::select! {
                _ = ctx.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::clock::{ManualClock, TokioClock};
    use crate::sink::{MemorySink, SinkError};
    use crate::test_support::{db, user};
    use std::time::Duration as StdDuration;

    fn engine(db: Arc<Database>, clock: Arc<dyn Clock>, sink: &MemorySink) -> Arc<ReminderEngine> {
        ReminderEngine::new(
            db,
            clock,
            Arc::new(sink.clone()),
            ReminderPolicy::default(),
            CancellationToken::new(),
        )
    }

    fn general() -> Address {
        Address::new("gateway", "general")
    }

    #[tokio::test]
    async fn fire_time_must_be_strictly_future() {
        let db = db();
        let clock = ManualClock::new(Utc::now());
        let sink = MemorySink::new();
        let reminders = engine(db.clone(), Arc::new(clock.clone()), &sink);
        let u = user(&db, "u", &[]);
        let now = clock.now();

        let err = reminders
            .schedule(&u, general(), now, "too soon")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(matches!(err, Error::InvalidTime(_)));

        reminders
            .schedule(&u, general(), now + Duration::nanoseconds(1), "ok")
            .await
            .unwrap();
        let err = reminders
            .schedule(&u, general(), now + Duration::days(400), "far")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnreasonablyFar(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_fire_order_and_never_early() {
        let db = db();
        let clock = Arc::new(TokioClock::new());
        let sink = MemorySink::new();
        let reminders = engine(db.clone(), clock.clone(), &sink);
        let u = user(&db, "u", &[]);
        let now = clock.now();

        for secs in [5, 1, 3] {
            reminders
                .schedule(&u, general(), now + Duration::seconds(secs), &format!("t{}", secs))
                .await
                .unwrap();
        }

        tokio::time::sleep(StdDuration::from_millis(900)).await;
        assert!(sink.sent_to("general").await.is_empty());

        tokio::time::sleep(StdDuration::from_secs(5)).await;
        assert_eq!(sink.sent_to("general").await, vec!["t1", "t3", "t5"]);
        assert!(db.pending_reminders().unwrap().is_empty());
        assert_eq!(reminders.active_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_does_not_redeliver() {
        let db = db();
        let clock = Arc::new(TokioClock::new());
        let sink = MemorySink::new();
        let u = user(&db, "u", &[]);
        let now = clock.now();

        let first = engine(db.clone(), clock.clone(), &sink);
        first
            .schedule(&u, general(), now + Duration::seconds(1), "once")
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_secs(2)).await;
        first.shutdown().await;

        let second = engine(db.clone(), clock.clone(), &sink);
        assert_eq!(second.tick().await.unwrap(), 0);
        tokio::time::sleep(StdDuration::from_secs(2)).await;
        assert_eq!(sink.sent_to("general").await, vec!["once"]);
    }

    #[tokio::test(start_paused = true)]
    async fn past_due_rows_are_delivered_late_on_startup() {
        let db = db();
        let clock = Arc::new(TokioClock::new());
        let sink = MemorySink::new();
        let u = user(&db, "u", &[]);
        let now = clock.now();
        db.insert_reminder(u.id, &general(), now - Duration::minutes(5), "missed", now)
            .unwrap();

        let reminders = engine(db.clone(), clock.clone(), &sink);
        assert_eq!(reminders.tick().await.unwrap(), 1);
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        assert_eq!(sink.sent_to("general").await, vec!["[late] missed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_park_as_failed() {
        let db = db();
        let clock = Arc::new(TokioClock::new());
        let sink = MemorySink::new();
        let reminders = engine(db.clone(), clock.clone(), &sink);
        let u = user(&db, "u", &[]);

        sink.fail_next(SinkError::Transient("down".into()), 2).await;
        reminders
            .schedule(&u, general(), clock.now() + Duration::seconds(1), "eventually")
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_secs(10)).await;
        assert_eq!(sink.sent_to("general").await, vec!["eventually"]);

        sink.break_target("dead", SinkError::Transient("still down".into()))
            .await;
        let r = reminders
            .schedule(
                &u,
                Address::new("gateway", "dead"),
                clock.now() + Duration::seconds(1),
                "never",
            )
            .await
            .unwrap();
        // 1 + 2 + 4 + 8 seconds of backoff across five attempts.
        tokio::time::sleep(StdDuration::from_secs(60)).await;
        assert_eq!(reminders.active_tasks(), 0);

        let listing = reminders.list_for(u.id).await.unwrap();
        assert!(listing.reminders.is_empty());
        assert_eq!(listing.failed.len(), 1);
        assert_eq!(listing.failed[0].id, r.reminder.id);
        assert_eq!(listing.failed[0].attempts, 5);
        assert!(reminders.list_for(u.id).await.unwrap().failed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_parks_immediately() {
        let db = db();
        let clock = Arc::new(TokioClock::new());
        let sink = MemorySink::new();
        let reminders = engine(db.clone(), clock.clone(), &sink);
        let u = user(&db, "u", &[]);

        sink.break_target("gone", SinkError::Permanent("channel deleted".into()))
            .await;
        reminders
            .schedule(&u, Address::new("gateway", "gone"), clock.now() + Duration::seconds(1), "x")
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_secs(2)).await;
        let failed = reminders.take_failed(u.id).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_restricted_and_stops_delivery() {
        let db = db();
        let clock = Arc::new(TokioClock::new());
        let sink = MemorySink::new();
        let reminders = engine(db.clone(), clock.clone(), &sink);
        let owner = user(&db, "owner", &[]);
        let other = user(&db, "other", &[]);
        let admin = user(&db, "admin", &["admin"]);

        let r = reminders
            .schedule(&owner, general(), clock.now() + Duration::seconds(30), "x")
            .await
            .unwrap()
            .reminder;
        let err = reminders.cancel(r.id, &other).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorised);
        reminders.cancel(r.id, &admin).await.unwrap();
        assert_eq!(
            reminders.cancel(r.id, &owner).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );

        tokio::time::sleep(StdDuration::from_secs(60)).await;
        assert!(sink.sent_to("general").await.is_empty());
    }
}
