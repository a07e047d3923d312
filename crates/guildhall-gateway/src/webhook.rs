//! Outgoing HTTP webhook interface.
//!
//! Every call is a JSON POST to one URL:
//!
//! ```json
//! {"action": "post", "target": "general", "text": "..."}
//! {"action": "edit", "id": "...", "target": "general", "text": "..."}
//! {"action": "delete", "id": "...", "target": "general"}
//! ```
//!
//! A `post` response may carry `{"id": "..."}`; otherwise an id is generated.
//! 5xx, 429 and network failures are transient; any other non-success status
//! is permanent.

use std::time::Duration;

use futures_util::future::BoxFuture;
use guildhall_engine::sink::{MessageSink, SinkError};
use guildhall_types::{Address, MessageHandle};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum WebhookCall<'a> {
    Post {
        target: &'a str,
        text: &'a str,
    },
    Edit {
        id: &'a str,
        target: &'a str,
        text: &'a str,
    },
    Delete {
        id: &'a str,
        target: &'a str,
    },
}

#[derive(Deserialize)]
struct PostReply {
    id: Option<String>,
}

#[derive(Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn call(&self, body: &WebhookCall<'_>) -> Result<reqwest::Response, SinkError> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(classify_error)?;
        match classify_status(response.status()) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }
}

fn classify_status(status: StatusCode) -> Option<SinkError> {
    if status.is_success() {
        None
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(SinkError::Transient(format!("webhook returned {}", status)))
    } else {
        Some(SinkError::Permanent(format!("webhook returned {}", status)))
    }
}

fn classify_error(e: reqwest::Error) -> SinkError {
    if e.is_builder() {
        SinkError::Permanent(format!("webhook request invalid: {}", e))
    } else {
        SinkError::Transient(format!("webhook unreachable: {}", e))
    }
}

impl MessageSink for WebhookSink {
    fn send<'a>(
        &'a self,
        address: &'a Address,
        text: &'a str,
    ) -> BoxFuture<'a, Result<MessageHandle, SinkError>> {
        Box::pin(async move {
            let response = self
                .call(&WebhookCall::Post {
                    target: &address.target,
                    text,
                })
                .await?;
            // Receivers are free to answer with an empty body.
            let id = response
                .json::<PostReply>()
                .await
                .ok()
                .and_then(|r| r.id)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            debug!(%address, %id, "Webhook message posted");
            Ok(MessageHandle::new(address.clone(), id))
        })
    }

    fn edit<'a>(
        &'a self,
        handle: &'a MessageHandle,
        text: &'a str,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            self.call(&WebhookCall::Edit {
                id: &handle.id,
                target: &handle.address.target,
                text,
            })
            .await
            .map(drop)
        })
    }

    fn delete<'a>(&'a self, handle: &'a MessageHandle) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            self.call(&WebhookCall::Delete {
                id: &handle.id,
                target: &handle.address.target,
            })
            .await
            .map(drop)
        })
    }
}
