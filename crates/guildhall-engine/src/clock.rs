//! Wall-clock abstraction.
//!
//! Every scheduling decision is expressed as a UTC wall-clock deadline. The
//! clock answers both `now` and `sleep_until`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Longest single nap of the system clock; the wall-clock deadline is
/// re-checked after each one.
const MAX_NAP: StdDuration = StdDuration::from_secs(60);

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Resolves once `now() >= deadline`.
    fn sleep_until(&self, deadline: DateTime<Utc>) -> BoxFuture<'_, ()>;
}

/// Sleep until `deadline` unless `cancel` fires first. Returns `true` when the
/// deadline was reached.
pub async fn sleep_until(
    clock: &dyn Clock,
    deadline: DateTime<Utc>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = clock.sleep_until(deadline) => {}
        }
        if clock.now() >= deadline {
            return true;
        }
    }
}

fn until(now: DateTime<Utc>, deadline: DateTime<Utc>) -> StdDuration {
    (deadline - now).to_std().unwrap_or(StdDuration::ZERO)
}

/// Real UTC time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep_until(&self, deadline: DateTime<Utc>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            loop {
                let left = until(Utc::now(), deadline);
                if left.is_zero() {
                    return;
                }
                tokio::time::sleep(left.min(MAX_NAP)).await;
            }
        })
    }
}

/// Wall clock driven by tokio's timer. Under `start_paused` tests the runtime
/// auto-advances this clock whenever every task is idle.
#[derive(Debug, Clone)]
pub struct TokioClock {
    base_wall: DateTime<Utc>,
    base_instant: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            base_wall: Utc::now(),
            base_instant: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now() - self.base_instant;
        self.base_wall + Duration::from_std(elapsed).unwrap_or_else(|_| Duration::zero())
    }

    fn sleep_until(&self, deadline: DateTime<Utc>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let offset = until(self.base_wall, deadline);
            tokio::time::sleep_until(self.base_instant + offset).await;
        })
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<ManualInner>,
}

#[derive(Debug)]
struct ManualInner {
    nanos: AtomicI64,
    moved: Notify,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(ManualInner {
                nanos: AtomicI64::new(start.timestamp_nanos_opt().unwrap_or(0)),
                moved: Notify::new(),
            }),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.inner
            .nanos
            .store(to.timestamp_nanos_opt().unwrap_or(0), Ordering::SeqCst);
        self.inner.moved.notify_waiters();
    }

    pub fn advance(&self, by: Duration) {
        self.set(self.now() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.inner.nanos.load(Ordering::SeqCst))
    }

    fn sleep_until(&self, deadline: DateTime<Utc>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            loop {
                let moved = self.inner.moved.notified();
                if self.now() >= deadline {
                    return;
                }
                moved.await;
            }
        })
    }
}
