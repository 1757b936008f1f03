//! Subscriber Gateway Connection Handler
//!
//! One task per WebSocket connection. The client authenticates once at
//! handshake with an opaque bearer token, then subscribes to market and
//! user channels; user channels are only granted for the authenticated
//! user's own id.
//!
//! Backpressure: outbound frames go through a bounded queue drained by a
//! dedicated writer task. A consumer that lets the queue overflow is
//! disconnected rather than ever blocking the bus. Idle connections are
//! torn down after the configured timeout; heartbeats keep them alive.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::bus::Envelope;
use crate::metrics::names;

use super::rate_limit::SlidingWindow;
use super::GatewayState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Authenticate with an opaque bearer token
    Auth { token: String },
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    AuthResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Subscribed {
        channel: String,
    },
    Unsubscribed {
        channel: String,
    },
    Error {
        code: String,
        message: String,
    },
    Pong,
}

/// A subscription target, parsed and validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedChannel {
    MarketBook(Uuid),
    MarketTrades(Uuid),
    UserOrders(Uuid),
    UserBalance(Uuid),
}

/// Parse `market.{id}.book`, `market.{id}.trades`, `user.{id}.orders`,
/// `user.{id}.balance`.
pub fn parse_channel(channel: &str) -> Option<ParsedChannel> {
    let mut parts = channel.splitn(3, '.');
    let scope = parts.next()?;
    let id: Uuid = parts.next()?.parse().ok()?;
    let kind = parts.next()?;
    match (scope, kind) {
        ("market", "book") => Some(ParsedChannel::MarketBook(id)),
        ("market", "trades") => Some(ParsedChannel::MarketTrades(id)),
        ("user", "orders") => Some(ParsedChannel::UserOrders(id)),
        ("user", "balance") => Some(ParsedChannel::UserBalance(id)),
        _ => None,
    }
}

/// Whether `user` may subscribe to `channel`. Market channels are public;
/// user channels belong to their owner alone.
pub fn may_subscribe(channel: ParsedChannel, user: Uuid) -> bool {
    match channel {
        ParsedChannel::MarketBook(_) | ParsedChannel::MarketTrades(_) => true,
        ParsedChannel::UserOrders(owner) | ParsedChannel::UserBalance(owner) => owner == user,
    }
}

pub async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    metrics::gauge!(names::WS_CONNECTIONS_ACTIVE).increment(1.0);
    run_connection(socket, state).await;
    metrics::gauge!(names::WS_CONNECTIONS_ACTIVE).decrement(1.0);
}

async fn run_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let (ws_sender, mut receiver) = socket.split();

    // Writer task behind a bounded queue; overflow means the consumer is
    // too slow and the connection dies.
    let (out_tx, out_rx) = mpsc::channel::<Message>(state.config.outbound_buffer);
    let writer = tokio::spawn(drain_outbound(out_rx, ws_sender));

    let mut user_id: Option<Uuid> = None;
    let mut subscriptions: HashSet<String> = HashSet::new();
    let mut churn_window = SlidingWindow::per_minute(state.config.churn_ceiling_per_min);
    let mut message_window = SlidingWindow::per_minute(state.config.message_ceiling_per_min);
    let mut last_activity = Instant::now();

    let mut bus_rx = state.bus.subscribe();
    let mut idle_check = tokio::time::interval(state.config.idle_timeout / 4);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        if !message_window.allow() {
                            tracing::warn!("connection exceeded message ceiling, dropping");
                            break;
                        }
                        if !handle_client_message(
                            &text,
                            &state,
                            &mut user_id,
                            &mut subscriptions,
                            &mut churn_window,
                            &out_tx,
                        )
                        .await
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_activity = Instant::now();
                        if out_tx.try_send(Message::Pong(data)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        // connection reset without a close handshake is routine
                        tracing::debug!("websocket read error: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            envelope = bus_rx.recv() => {
                match envelope {
                    Ok(envelope) => {
                        if subscriptions.contains(&envelope.channel) {
                            if !forward_envelope(&envelope, &out_tx) {
                                tracing::warn!("slow consumer disconnected");
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // the client will see the sequence jump and resync
                        tracing::warn!("subscriber lagged {n} envelopes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = idle_check.tick() => {
                if last_activity.elapsed() >= state.config.idle_timeout {
                    tracing::info!(user_id = ?user_id, "idle timeout, tearing down connection");
                    break;
                }
            }
        }
    }

    // Dropping the queue ends the writer; subscriptions die with the task.
    drop(out_tx);
    let _ = writer.await;
    tracing::info!(user_id = ?user_id, "websocket connection closed");
}

async fn drain_outbound(
    mut out_rx: mpsc::Receiver<Message>,
    mut ws_sender: SplitSink<WebSocket, Message>,
) {
    while let Some(message) = out_rx.recv().await {
        if ws_sender.send(message).await.is_err() {
            break;
        }
        metrics::counter!(names::WS_MESSAGES_SENT_TOTAL).increment(1);
    }
    let _ = ws_sender.close().await;
}

fn forward_envelope(envelope: &Envelope, out_tx: &mpsc::Sender<Message>) -> bool {
    match serde_json::to_string(envelope) {
        Ok(json) => out_tx.try_send(Message::Text(json)).is_ok(),
        Err(e) => {
            tracing::error!("unserializable envelope: {e}");
            true
        }
    }
}

/// Returns false when the connection should close.
async fn handle_client_message(
    text: &str,
    state: &Arc<GatewayState>,
    user_id: &mut Option<Uuid>,
    subscriptions: &mut HashSet<String>,
    churn_window: &mut SlidingWindow,
    out_tx: &mpsc::Sender<Message>,
) -> bool {
    let send = |msg: ControlMessage| {
        let json = serde_json::to_string(&msg).unwrap_or_default();
        out_tx.try_send(Message::Text(json)).is_ok()
    };

    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return send(ControlMessage::Error {
                code: "INVALID_MESSAGE".into(),
                message: format!("failed to parse message: {e}"),
            });
        }
    };

    match client_msg {
        ClientMessage::Auth { token } => match state.auth.resolve_token(&token).await {
            Ok(user) => {
                *user_id = Some(user.id);
                tracing::info!(user_id = %user.id, "websocket authenticated");
                send(ControlMessage::AuthResult {
                    success: true,
                    user_id: Some(user.id),
                    message: None,
                })
            }
            Err(e) => {
                tracing::info!("websocket auth failed: {e}");
                send(ControlMessage::AuthResult {
                    success: false,
                    user_id: None,
                    message: Some(e.to_string()),
                })
            }
        },

        ClientMessage::Subscribe { channel } => {
            if !churn_window.allow() {
                return send(ControlMessage::Error {
                    code: "CHURN_LIMIT".into(),
                    message: "subscription churn ceiling reached".into(),
                });
            }
            let Some(authenticated) = *user_id else {
                return send(ControlMessage::Error {
                    code: "AUTH_REQUIRED".into(),
                    message: "authenticate before subscribing".into(),
                });
            };
            let Some(parsed) = parse_channel(&channel) else {
                return send(ControlMessage::Error {
                    code: "UNKNOWN_CHANNEL".into(),
                    message: format!("unrecognised channel: {channel}"),
                });
            };
            if !may_subscribe(parsed, authenticated) {
                return send(ControlMessage::Error {
                    code: "FORBIDDEN_CHANNEL".into(),
                    message: "user channels are private to their owner".into(),
                });
            }
            subscriptions.insert(channel.clone());
            tracing::debug!(%channel, total = subscriptions.len(), "subscribed");
            send(ControlMessage::Subscribed { channel })
        }

        ClientMessage::Unsubscribe { channel } => {
            if !churn_window.allow() {
                return send(ControlMessage::Error {
                    code: "CHURN_LIMIT".into(),
                    message: "subscription churn ceiling reached".into(),
                });
            }
            subscriptions.remove(&channel);
            send(ControlMessage::Unsubscribed { channel })
        }

        ClientMessage::Ping => send(ControlMessage::Pong),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_parse_and_reject() {
        let id = Uuid::new_v4();
        assert_eq!(
            parse_channel(&format!("market.{id}.book")),
            Some(ParsedChannel::MarketBook(id))
        );
        assert_eq!(
            parse_channel(&format!("market.{id}.trades")),
            Some(ParsedChannel::MarketTrades(id))
        );
        assert_eq!(
            parse_channel(&format!("user.{id}.orders")),
            Some(ParsedChannel::UserOrders(id))
        );
        assert_eq!(
            parse_channel(&format!("user.{id}.balance")),
            Some(ParsedChannel::UserBalance(id))
        );
        assert_eq!(parse_channel("market.not-a-uuid.book"), None);
        assert_eq!(parse_channel(&format!("market.{id}.candles")), None);
        assert_eq!(parse_channel("trades"), None);
    }

    #[test]
    fn user_channels_are_private() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        assert!(may_subscribe(ParsedChannel::MarketBook(other), me));
        assert!(may_subscribe(ParsedChannel::UserOrders(me), me));
        assert!(!may_subscribe(ParsedChannel::UserOrders(other), me));
        assert!(!may_subscribe(ParsedChannel::UserBalance(other), me));
    }

    #[test]
    fn client_messages_deserialize() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"auth","token":"abc"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Auth { .. }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","channel":"market.x.book"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { .. }));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }
}
