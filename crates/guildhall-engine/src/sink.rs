use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use guildhall_types::{Address, MessageHandle};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Worth retrying: timeouts, rate limits, connection resets.
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying cannot help: unknown target, deleted message, bad request.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// One-way messaging interface. Implementations must be safe to share
/// between tasks.
pub trait MessageSink: Send + Sync {
    fn send<'a>(
        &'a self,
        address: &'a Address,
        text: &'a str,
    ) -> BoxFuture<'a, Result<MessageHandle, SinkError>>;

    /// Replace the content of a delivered message. Re-sending the current
    /// content must succeed without visible effect.
    fn edit<'a>(
        &'a self,
        handle: &'a MessageHandle,
        text: &'a str,
    ) -> BoxFuture<'a, Result<(), SinkError>>;

    fn delete<'a>(&'a self, handle: &'a MessageHandle) -> BoxFuture<'a, Result<(), SinkError>>;

    /// Whether addresses on `interface` can be delivered at all.
    fn supports(&self, _interface: &str) -> bool {
        true
    }
}

/// Routes by the address's interface tag.
#[derive(Default, Clone)]
pub struct SinkRouter {
    routes: HashMap<String, Arc<dyn MessageSink>>,
}

impl SinkRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, interface: impl Into<String>, sink: Arc<dyn MessageSink>) -> Self {
        self.routes.insert(interface.into(), sink);
        self
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    fn lookup(&self, interface: &str) -> Result<&Arc<dyn MessageSink>, SinkError> {
        self.routes
            .get(interface)
            .ok_or_else(|| SinkError::Permanent(format!("no route for interface '{}'", interface)))
    }
}

impl MessageSink for SinkRouter {
    fn send<'a>(
        &'a self,
        address: &'a Address,
        text: &'a str,
    ) -> BoxFuture<'a, Result<MessageHandle, SinkError>> {
        Box::pin(async move { self.lookup(&address.interface)?.send(address, text).await })
    }

    fn edit<'a>(
        &'a self,
        handle: &'a MessageHandle,
        text: &'a str,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            self.lookup(&handle.address.interface)?
                .edit(handle, text)
                .await
        })
    }

    fn delete<'a>(&'a self, handle: &'a MessageHandle) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move { self.lookup(&handle.address.interface)?.delete(handle).await })
    }

    fn supports(&self, interface: &str) -> bool {
        self.routes
            .get(interface)
            .is_some_and(|s| s.supports(interface))
    }
}

/// Writes every delivery to the log. Always succeeds.
#[derive(Debug, Default)]
pub struct LogSink {
    next_id: AtomicU64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageSink for LogSink {
    fn send<'a>(
        &'a self,
        address: &'a Address,
        text: &'a str,
    ) -> BoxFuture<'a, Result<MessageHandle, SinkError>> {
        Box::pin(async move {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            info!(target: "guildhall::outbox", %address, message_id = id, "{}", text);
            Ok(MessageHandle::new(address.clone(), id.to_string()))
        })
    }

    fn edit<'a>(
        &'a self,
        handle: &'a MessageHandle,
        text: &'a str,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            info!(target: "guildhall::outbox", %handle, "edit: {}", text);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, handle: &'a MessageHandle) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            info!(target: "guildhall::outbox", %handle, "delete");
            Ok(())
        })
    }
}

/// What a [`MemorySink`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Send { handle: MessageHandle, text: String },
    Edit { handle: MessageHandle, text: String },
    Delete { handle: MessageHandle },
}

#[derive(Debug, Clone)]
struct StoredMessage {
    text: String,
    deleted: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    calls: Vec<SinkCall>,
    messages: HashMap<String, StoredMessage>,
    /// Failures handed out to the next calls, in order.
    scripted: Vec<SinkError>,
    /// Targets that always refuse delivery.
    broken_targets: HashMap<String, SinkError>,
}

/// In-memory sink that records every successful call and can be told to fail.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` calls fail with `error`.
    pub async fn fail_next(&self, error: SinkError, times: usize) {
        let mut state = self.state.lock().await;
        state.scripted.extend(std::iter::repeat_n(error, times));
    }

    pub async fn break_target(&self, target: &str, error: SinkError) {
        self.state
            .lock()
            .await
            .broken_targets
            .insert(target.to_string(), error);
    }

    pub async fn calls(&self) -> Vec<SinkCall> {
        self.state.lock().await.calls.clone()
    }

    /// Texts sent to `target`, in delivery order.
    pub async fn sent_to(&self, target: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::Send { handle, text } if handle.address.target == target => {
                    Some(text.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Content changes applied to a message, excluding no-op edits.
    pub async fn edits_of(&self, handle: &MessageHandle) -> Vec<String> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::Edit { handle: h, text } if h == handle => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Current content of a message, `None` if unknown or deleted.
    pub async fn text_of(&self, handle: &MessageHandle) -> Option<String> {
        self.state
            .lock()
            .await
            .messages
            .get(&handle.id)
            .filter(|m| !m.deleted)
            .map(|m| m.text.clone())
    }

    /// Forget a message as if it had been removed on the remote side.
    pub async fn vanish(&self, handle: &MessageHandle) {
        if let Some(m) = self.state.lock().await.messages.get_mut(&handle.id) {
            m.deleted = true;
        }
    }

    fn take_failure(state: &mut MemoryState, target: &str) -> Result<(), SinkError> {
        if let Some(err) = state.broken_targets.get(target) {
            return Err(err.clone());
        }
        if !state.scripted.is_empty() {
            return Err(state.scripted.remove(0));
        }
        Ok(())
    }
}

impl MessageSink for MemorySink {
    fn send<'a>(
        &'a self,
        address: &'a Address,
        text: &'a str,
    ) -> BoxFuture<'a, Result<MessageHandle, SinkError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Self::take_failure(&mut state, &address.target)?;
            state.next_id += 1;
            let handle = MessageHandle::new(address.clone(), format!("m{}", state.next_id));
            state.messages.insert(
                handle.id.clone(),
                StoredMessage {
                    text: text.to_string(),
                    deleted: false,
                },
            );
            state.calls.push(SinkCall::Send {
                handle: handle.clone(),
                text: text.to_string(),
            });
            Ok(handle)
        })
    }

    fn edit<'a>(
        &'a self,
        handle: &'a MessageHandle,
        text: &'a str,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Self::take_failure(&mut state, &handle.address.target)?;
            let msg = state
                .messages
                .get_mut(&handle.id)
                .filter(|m| !m.deleted)
                .ok_or_else(|| SinkError::Permanent(format!("unknown message {}", handle)))?;
            if msg.text == text {
                return Ok(());
            }
            msg.text = text.to_string();
            state.calls.push(SinkCall::Edit {
                handle: handle.clone(),
                text: text.to_string(),
            });
            Ok(())
        })
    }

    fn delete<'a>(&'a self, handle: &'a MessageHandle) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Self::take_failure(&mut state, &handle.address.target)?;
            if let Some(m) = state.messages.get_mut(&handle.id) {
                m.deleted = true;
            }
            state.calls.push(SinkCall::Delete {
                handle: handle.clone(),
            });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn router_rejects_unknown_interfaces_permanently() {
        let memory = MemorySink::new();
        let router = SinkRouter::new().route("gateway", Arc::new(memory.clone()));
        assert!(router.supports("gateway"));
        assert!(!router.supports("telegram"));

        let err = router
            .send(&Address::new("telegram", "42"), "hi")
            .await
            .unwrap_err();
        assert!(!err.is_transient());

        router
            .send(&Address::new("gateway", "general"), "hi")
            .await
            .unwrap();
        assert_eq!(memory.sent_to("general").await, vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn memory_sink_edits_are_idempotent() {
        let sink = MemorySink::new();
        let handle = sink
            .send(&Address::new("gateway", "general"), "v1")
            .await
            .unwrap();
        sink.edit(&handle, "v2").await.unwrap();
        sink.edit(&handle, "v2").await.unwrap();
        assert_eq!(sink.edits_of(&handle).await, vec!["v2".to_string()]);

        sink.vanish(&handle).await;
        assert!(matches!(
            sink.edit(&handle, "v3").await,
            Err(SinkError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let sink = MemorySink::new();
        let addr = Address::new("gateway", "general");
        sink.fail_next(SinkError::Transient("flaky".into()), 2).await;
        assert!(sink.send(&addr, "a").await.is_err());
        assert!(sink.send(&addr, "a").await.is_err());
        assert!(sink.send(&addr, "a").await.is_ok());
    }
}
