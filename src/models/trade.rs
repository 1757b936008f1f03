use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::market::Outcome;

/// An executed trade. Prices live in the YES price space; the maker's price
/// is the trade price. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trade {
    pub id: Uuid,
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub price: Decimal,
    pub quantity: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeView {
    pub trade_id: Uuid,
    pub market_id: Uuid,
    pub price: Decimal,
    pub quantity: Decimal,
    pub timestamp: i64,
}

impl From<&Trade> for TradeView {
    fn from(trade: &Trade) -> Self {
        Self {
            trade_id: trade.id,
            market_id: trade.market_id,
            price: trade.price,
            quantity: trade.quantity,
            timestamp: trade.created_at.timestamp_millis(),
        }
    }
}
