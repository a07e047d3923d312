use std::sync::Arc;

use guildhall_db::Database;
use guildhall_types::Address;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::retry::RetryPolicy;
use crate::sink::MessageSink;

/// Best-effort personal notifications, sent after the state change they
/// describe has committed. Each one runs as its own task so the caller
/// never waits on delivery or retries. Failures are logged, never returned.
#[derive(Clone)]
pub(crate) struct Notifier {
    db: Arc<Database>,
    sink: Arc<dyn MessageSink>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    inflight: TaskTracker,
}

impl Notifier {
    pub fn new(
        db: Arc<Database>,
        sink: Arc<dyn MessageSink>,
        retry: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db,
            sink,
            retry,
            shutdown,
            inflight: TaskTracker::new(),
        }
    }

    /// Notify a user on their contact route, if they have one.
    pub fn notify_user(&self, user_id: Uuid, text: &str) {
        let this = self.clone();
        let text = text.to_string();
        self.inflight.spawn(async move {
            if let Some(address) = this.contact_of(user_id).await {
                this.deliver(&address, &text).await;
            }
        });
    }

    /// Resolves once every notification spawned so far has finished.
    pub async fn settled(&self) {
        self.inflight.close();
        self.inflight.wait().await;
        self.inflight.reopen();
    }

    async fn deliver(&self, address: &Address, text: &str) {
        let result = self
            .retry
            .run("notification", &self.shutdown, || self.sink.send(address, text))
            .await;
        if let Err(e) = result {
            warn!(%address, "Notification dropped: {}", e);
        }
    }

    async fn contact_of(&self, user_id: Uuid) -> Option<Address> {
        let db = self.db.clone();
        let user = match tokio::task::spawn_blocking(move || db.get_user(user_id)).await {
            Ok(Ok(user)) => user,
            Ok(Err(e)) => {
                warn!(%user_id, "Notification lookup failed: {}", e);
                return None;
            }
            Err(e) => {
                warn!(%user_id, "Notification lookup panicked: {}", e);
                return None;
            }
        };
        let contact = user.and_then(|u| u.contact);
        if contact.is_none() {
            debug!(%user_id, "No contact route, notification skipped");
        }
        contact
    }
}
