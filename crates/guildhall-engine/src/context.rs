use std::sync::{Arc, Mutex};

use guildhall_db::Database;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::clock::Clock;
use crate::matchmaking::{MatchmakingEngine, MatchmakingPolicy};
use crate::notify::Notifier;
use crate::polls::{PollEngine, PollPolicy};
use crate::reminders::{ReminderEngine, ReminderPolicy};
use crate::retry::RetryPolicy;
use crate::sink::MessageSink;
use crate::treasure::TreasureEngine;
use crate::wallet::WalletEngine;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub matchmaking: MatchmakingPolicy,
    pub reminders: ReminderPolicy,
    pub polls: PollPolicy,
    /// Retry policy for personal notifications.
    pub notify_retry: RetryPolicy,
}

/// Every engine, wired to one store, clock and message sink, sharing a
/// single shutdown token.
pub struct Engines {
    pub wallet: Arc<WalletEngine>,
    pub treasures: Arc<TreasureEngine>,
    pub reminders: Arc<ReminderEngine>,
    pub polls: Arc<PollEngine>,
    pub matchmaking: Arc<MatchmakingEngine>,
    notifier: Notifier,
    shutdown: CancellationToken,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl Engines {
    pub fn new(
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MessageSink>,
        config: EngineConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let notifier = Notifier::new(
            db.clone(),
            sink.clone(),
            config.notify_retry,
            shutdown.clone(),
        );

        let wallet = Arc::new(WalletEngine::new(db.clone(), clock.clone(), notifier.clone()));
        let treasures = Arc::new(TreasureEngine::new(db.clone(), clock.clone(), wallet.clone()));
        let reminders = ReminderEngine::new(
            db.clone(),
            clock.clone(),
            sink.clone(),
            config.reminders,
            shutdown.child_token(),
        );
        let polls = Arc::new(PollEngine::new(
            db.clone(),
            clock.clone(),
            notifier.clone(),
            config.polls,
        ));
        let matchmaking = MatchmakingEngine::new(
            db,
            clock,
            sink,
            wallet.clone(),
            config.matchmaking,
            shutdown.child_token(),
        );

        Self {
            wallet,
            treasures,
            reminders,
            polls,
            matchmaking,
            notifier,
            shutdown,
            sweep: Mutex::new(None),
        }
    }

    /// Resume persisted work and start the background sweep.
    pub async fn start(&self) -> Result<()> {
        let reminders = self.reminders.tick().await?;
        let lobbies = self.matchmaking.recover().await?;

        let polls = self.polls.clone();
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(polls.run_close_sweep(cancel));
        let previous = self
            .sweep
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            warn!("Engines started twice, replacing poll sweep");
            previous.abort();
        }

        info!(reminders, lobbies, "Scheduler started");
        Ok(())
    }

    /// Stop every task. Persisted state is left as is and resumed by the
    /// next `start`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sweep = self.sweep.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = sweep {
            let _ = handle.await;
        }
        self.reminders.shutdown().await;
        self.matchmaking.shutdown().await;
        self.notifier.settled().await;
        info!("Scheduler stopped");
    }

    /// Wait for every personal notification queued so far to be delivered
    /// or dropped.
    pub async fn notifications_settled(&self) {
        self.notifier.settled().await;
    }
}
