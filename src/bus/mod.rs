//! Broadcast Bus
//!
//! Every committed state change is published as a typed envelope on an
//! in-process firehose. The subscriber gateway and the optional Redis
//! mirror consume it at their own pace; slow consumers lag and resync,
//! publishers never block.
//!
//! Envelope sequences: market-scoped events carry the per-market commit
//! counter; user-scoped events carry a per-user counter assigned at publish
//! time. Both are strictly monotonic within a channel, which is what lets
//! subscribers detect gaps and refetch a snapshot.

pub mod redis;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{BalanceView, OrderEventKind, OrderResponse, Outcome, TradeView};
use crate::services::matching::types::{CancelReason, LevelView};

// ============================================================================
// Channels
// ============================================================================

pub mod channels {
    use uuid::Uuid;

    pub fn market_book(market_id: Uuid) -> String {
        format!("market.{}.book", market_id)
    }

    pub fn market_trades(market_id: Uuid) -> String {
        format!("market.{}.trades", market_id)
    }

    pub fn user_orders(user_id: Uuid) -> String {
        format!("user.{}.orders", user_id)
    }

    pub fn user_balance(user_id: Uuid) -> String {
        format!("user.{}.balance", user_id)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Everything the core announces, as one tagged union. Subscribers branch on
/// the tag, never on field presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeEvent {
    OrderCreated {
        order: OrderResponse,
    },
    OrderPartial {
        order: OrderResponse,
    },
    OrderFilled {
        order: OrderResponse,
    },
    OrderCancelled {
        order: OrderResponse,
        reason: CancelReason,
    },
    SelfTradePrevented {
        market_id: Uuid,
        order_id: Uuid,
        resting_order_id: Uuid,
    },
    Trade {
        trade: TradeView,
    },
    BookDelta {
        market_id: Uuid,
        bids: Vec<LevelView>,
        asks: Vec<LevelView>,
    },
    BalanceUpdated {
        balance: BalanceView,
    },
    MarketClosed {
        market_id: Uuid,
    },
    MarketResolved {
        market_id: Uuid,
        outcome: Outcome,
    },
    MarketCancelled {
        market_id: Uuid,
    },
}

impl ExchangeEvent {
    /// The serde content half of the adjacently tagged representation; this
    /// is what the order-event log persists for replay.
    pub fn payload_value(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.get("payload").cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

/// The published wrapper. `sequence` is per-market for market channels and
/// per-user for user channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub sequence: i64,
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: ExchangeEvent,
}

// ============================================================================
// Bus
// ============================================================================

pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
    user_sequences: DashMap<Uuid, i64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            user_sequences: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish a market-scoped event with the market's commit sequence.
    pub fn publish_market(&self, channel: String, market_id: Uuid, sequence: i64, event: ExchangeEvent) {
        let envelope = Envelope {
            channel,
            market_id: Some(market_id),
            user_id: None,
            sequence,
            timestamp: Utc::now().timestamp_millis(),
            event,
        };
        // SendError just means nobody is listening right now
        let _ = self.sender.send(envelope);
    }

    /// Publish a user-scoped event, assigning the user's next sequence.
    pub fn publish_user(&self, channel: String, user_id: Uuid, event: ExchangeEvent) {
        let sequence = self.next_user_sequence(user_id);
        let envelope = Envelope {
            channel,
            market_id: None,
            user_id: Some(user_id),
            sequence,
            timestamp: Utc::now().timestamp_millis(),
            event,
        };
        let _ = self.sender.send(envelope);
    }

    fn next_user_sequence(&self, user_id: Uuid) -> i64 {
        let mut entry = self.user_sequences.entry(user_id).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Re-emit a market's order and trade events from the audit log, for
    /// reconciliation after a publish failure. Replayed envelopes carry the
    /// ledger's market sequence; BOOK_DELTA and BALANCE_UPDATED are derived
    /// views with no log row, so subscribers refetch a snapshot for those.
    pub async fn replay_market(
        &self,
        pool: &PgPool,
        market_id: Uuid,
        from_sequence: i64,
    ) -> Result<usize, sqlx::Error> {
        let envelopes = envelopes_from_log(pool, market_id, from_sequence).await?;
        let count = envelopes.len();
        for envelope in envelopes {
            let _ = self.sender.send(envelope);
        }
        Ok(count)
    }
}

/// Rebuild publishable envelopes from the order-event log. Shared by the
/// in-process replay and the Redis reconciler.
pub async fn envelopes_from_log(
    pool: &PgPool,
    market_id: Uuid,
    from_sequence: i64,
) -> Result<Vec<Envelope>, sqlx::Error> {
    let rows = crate::services::ledger::events_since(pool, market_id, from_sequence).await?;
    let mut envelopes = Vec::with_capacity(rows.len());
    for (_order_id, user_id, kind, sequence, payload, created_at) in rows {
        let Some(event) = event_from_log(kind, payload) else {
            continue;
        };
        let (channel, scope_user) = match &event {
            ExchangeEvent::Trade { .. } => (channels::market_trades(market_id), None),
            _ => (channels::user_orders(user_id), Some(user_id)),
        };
        envelopes.push(Envelope {
            channel,
            market_id: Some(market_id),
            user_id: scope_user,
            sequence,
            timestamp: created_at.timestamp_millis(),
            event,
        });
    }
    Ok(envelopes)
}

/// Rebuild a typed event from an audit-log row. REJECTED rows are audit-only
/// and never re-broadcast.
fn event_from_log(kind: OrderEventKind, payload: Value) -> Option<ExchangeEvent> {
    let tag = match kind {
        OrderEventKind::Created => "ORDER_CREATED",
        OrderEventKind::PartialFill => "ORDER_PARTIAL",
        OrderEventKind::Filled => "ORDER_FILLED",
        OrderEventKind::Cancelled => "ORDER_CANCELLED",
        OrderEventKind::SelfTradePrevented => "SELF_TRADE_PREVENTED",
        OrderEventKind::Trade => "TRADE",
        OrderEventKind::Rejected => return None,
    };
    serde_json::from_value(serde_json::json!({ "type": tag, "payload": payload })).ok()
}

/// Convenience for the BOOK_DELTA payload.
pub fn book_delta(market_id: Uuid, bids: Vec<LevelView>, asks: Vec<LevelView>) -> ExchangeEvent {
    ExchangeEvent::BookDelta {
        market_id,
        bids,
        asks,
    }
}

/// Convenience for the BALANCE_UPDATED payload.
pub fn balance_updated(available: Decimal, locked: Decimal) -> ExchangeEvent {
    ExchangeEvent::BalanceUpdated {
        balance: BalanceView {
            available,
            locked,
            total: available + locked,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn channel_names_are_stable() {
        let id = Uuid::nil();
        assert_eq!(
            channels::market_book(id),
            "market.00000000-0000-0000-0000-000000000000.book"
        );
        assert_eq!(
            channels::user_balance(id),
            "user.00000000-0000-0000-0000-000000000000.balance"
        );
    }

    #[test]
    fn envelope_serializes_with_tag_and_payload() {
        let envelope = Envelope {
            channel: channels::market_trades(Uuid::nil()),
            market_id: Some(Uuid::nil()),
            user_id: None,
            sequence: 7,
            timestamp: 1_700_000_000_000,
            event: ExchangeEvent::Trade {
                trade: TradeView {
                    trade_id: Uuid::nil(),
                    market_id: Uuid::nil(),
                    price: dec!(0.40),
                    quantity: dec!(60),
                    timestamp: 1_700_000_000_000,
                },
            },
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "TRADE");
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["payload"]["trade"]["price"], "0.40");
        assert!(json.get("user_id").is_none());
    }

    #[test]
    fn user_sequences_are_monotonic_per_user() {
        let bus = EventBus::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        assert_eq!(bus.next_user_sequence(alice), 1);
        assert_eq!(bus.next_user_sequence(alice), 2);
        assert_eq!(bus.next_user_sequence(bob), 1);
        assert_eq!(bus.next_user_sequence(alice), 3);
    }

    #[test]
    fn published_envelopes_reach_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let market = Uuid::new_v4();

        bus.publish_market(
            channels::market_book(market),
            market,
            1,
            book_delta(market, vec![], vec![]),
        );

        let got = rx.try_recv().unwrap();
        assert_eq!(got.sequence, 1);
        assert_eq!(got.market_id, Some(market));
    }

    #[test]
    fn log_rows_roundtrip_into_events() {
        let event = ExchangeEvent::SelfTradePrevented {
            market_id: Uuid::nil(),
            order_id: Uuid::nil(),
            resting_order_id: Uuid::nil(),
        };
        let payload = event.payload_value();
        let rebuilt = event_from_log(OrderEventKind::SelfTradePrevented, payload).unwrap();
        assert!(matches!(rebuilt, ExchangeEvent::SelfTradePrevented { .. }));

        // rejected entries are audit-only
        assert!(event_from_log(OrderEventKind::Rejected, Value::Null).is_none());
    }
}
