use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Audit log entry kinds. One row exists per observable order transition;
/// `(order_id, kind, sequence)` is the idempotency key for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_event_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderEventKind {
    Created,
    Trade,
    PartialFill,
    Filled,
    Cancelled,
    SelfTradePrevented,
    Rejected,
}

impl fmt::Display for OrderEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderEventKind::Created => write!(f, "created"),
            OrderEventKind::Trade => write!(f, "trade"),
            OrderEventKind::PartialFill => write!(f, "partial_fill"),
            OrderEventKind::Filled => write!(f, "filled"),
            OrderEventKind::Cancelled => write!(f, "cancelled"),
            OrderEventKind::SelfTradePrevented => write!(f, "self_trade_prevented"),
            OrderEventKind::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderEvent {
    pub id: i64,
    pub order_id: Uuid,
    pub market_id: Uuid,
    pub user_id: Uuid,
    pub kind: OrderEventKind,
    pub sequence: i64,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}
