use std::collections::HashSet;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use guildhall_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::{Attached, Dispatcher};

/// Server sends a Ping every 15 seconds; two missed Pongs drop the client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_PONGS: u8 = 2;

/// Per-connection view: which channel targets the client asked for.
#[derive(Debug, Default)]
struct Subscriptions {
    targets: HashSet<String>,
}

impl Subscriptions {
    fn apply(&mut self, username: &str, cmd: GatewayCommand) {
        match cmd {
            GatewayCommand::Subscribe { targets } => {
                debug!("{} subscribing to {} targets", username, targets.len());
                self.targets = targets.into_iter().collect();
            }
        }
    }

    /// Untargeted events reach everyone; channel events only subscribers.
    fn wants(&self, event: &GatewayEvent) -> bool {
        event.target().is_none_or(|t| self.targets.contains(t))
    }
}

/// Serve a WebSocket whose bearer token was validated at the upgrade.
pub async fn handle_connection(
    mut socket: WebSocket,
    dispatcher: Dispatcher,
    user_id: Uuid,
    username: String,
) {
    info!("{} ({}) connected to gateway", username, user_id);
    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if !send_event(&mut socket, &ready).await {
        return;
    }

    let Attached {
        conn_id,
        mut direct,
        mut broadcast,
    } = dispatcher.connect(user_id, username.clone()).await;
    let mut subscriptions = Subscriptions::default();

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut ponged = true;
    let mut missed: u8 = 0;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<GatewayCommand>(&text) {
                            Ok(cmd) => subscriptions.apply(&username, cmd),
                            Err(e) => warn!(
                                "{} ({}) bad command: {} -- raw: {}",
                                username,
                                user_id,
                                e,
                                text.chars().take(200).collect::<String>()
                            ),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => ponged = true,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            event = broadcast.recv() => {
                match event {
                    Ok(event) if subscriptions.wants(&event) => {
                        if !send_event(&mut socket, &event).await {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(%user_id, "Gateway connection lagged by {} messages", n)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            event = direct.recv() => {
                // a newer connection took over the session
                let Some(event) = event else { break };
                if !send_event(&mut socket, &event).await {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if std::mem::replace(&mut ponged, false) {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= MAX_MISSED_PONGS {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed);
                        break;
                    }
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    dispatcher.disconnect(user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn send_event(socket: &mut WebSocket, event: &GatewayEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Dropping unserializable gateway event: {}", e);
            return true;
        }
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}
