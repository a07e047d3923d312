use chrono::Utc;
use futures_util::future::BoxFuture;
use guildhall_engine::sink::{MessageSink, SinkError};
use guildhall_types::events::GatewayEvent;
use guildhall_types::{Address, MessageHandle};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;

/// Delivers bot messages to WebSocket clients. Message ids are UUIDs, so a
/// handle stays editable across server restarts.
#[derive(Clone)]
pub struct GatewaySink {
    dispatcher: Dispatcher,
}

impl GatewaySink {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    async fn deliver(&self, address: &Address, event: GatewayEvent) -> Result<(), SinkError> {
        match address.user_id() {
            Some(user_id) => {
                if self.dispatcher.send_to_user(user_id, event).await {
                    Ok(())
                } else {
                    Err(SinkError::Transient(format!("user {} is not connected", user_id)))
                }
            }
            None => {
                let receivers = self.dispatcher.broadcast(event);
                trace!(channel = %address.target, receivers, "Gateway broadcast");
                Ok(())
            }
        }
    }
}

impl MessageSink for GatewaySink {
    fn send<'a>(
        &'a self,
        address: &'a Address,
        text: &'a str,
    ) -> BoxFuture<'a, Result<MessageHandle, SinkError>> {
        Box::pin(async move {
            let handle = MessageHandle::new(address.clone(), Uuid::new_v4().to_string());
            let event = GatewayEvent::MessagePost {
                id: handle.id.clone(),
                target: address.target.clone(),
                text: text.to_string(),
                timestamp: Utc::now(),
            };
            self.deliver(address, event).await?;
            debug!(%handle, "Gateway message posted");
            Ok(handle)
        })
    }

    fn edit<'a>(
        &'a self,
        handle: &'a MessageHandle,
        text: &'a str,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let event = GatewayEvent::MessageEdit {
                id: handle.id.clone(),
                target: handle.address.target.clone(),
                text: text.to_string(),
                timestamp: Utc::now(),
            };
            self.deliver(&handle.address, event).await
        })
    }

    fn delete<'a>(&'a self, handle: &'a MessageHandle) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let event = GatewayEvent::MessageDelete {
                id: handle.id.clone(),
                target: handle.address.target.clone(),
            };
            self.deliver(&handle.address, event).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_posts_are_broadcast_and_edits_reuse_the_id() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.connect(Uuid::new_v4(), "watcher".into()).await.broadcast;
        let sink = GatewaySink::new(dispatcher);

        let handle = sink
            .send(&Address::new("gateway", "general"), "hello")
            .await
            .unwrap();
        sink.edit(&handle, "hello again").await.unwrap();

        match rx.recv().await.unwrap() {
            GatewayEvent::MessagePost { id, target, text, .. } => {
                assert_eq!(id, handle.id);
                assert_eq!(target, "general");
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await.unwrap() {
            GatewayEvent::MessageEdit { id, text, .. } => {
                assert_eq!(id, handle.id);
                assert_eq!(text, "hello again");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn direct_messages_need_a_connection() {
        let dispatcher = Dispatcher::new();
        let sink = GatewaySink::new(dispatcher.clone());
        let user = Uuid::new_v4();
        let address = Address::user("gateway", user);

        let err = sink.send(&address, "psst").await.unwrap_err();
        assert!(err.is_transient());

        let mut attached = dispatcher.connect(user, "ann".into()).await;
        sink.send(&address, "psst").await.unwrap();
        assert!(matches!(
            attached.direct.recv().await,
            Some(GatewayEvent::MessagePost { .. })
        ));
    }
}
