use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::market::Outcome;

/// Holdings of one outcome in one market. `committed` tracks shares escrowed
/// behind resting sell orders and never exceeds `quantity`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Position {
    pub user_id: Uuid,
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub quantity: Decimal,
    pub committed: Decimal,
    /// Weighted-average cost in the outcome's own price space; None when flat.
    pub average_price: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn uncommitted(&self) -> Decimal {
        self.quantity - self.committed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionView {
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub quantity: Decimal,
    pub committed: Decimal,
    pub average_price: Option<Decimal>,
}

impl From<Position> for PositionView {
    fn from(p: Position) -> Self {
        Self {
            market_id: p.market_id,
            outcome: p.outcome,
            quantity: p.quantity,
            committed: p.committed,
            average_price: p.average_price,
        }
    }
}
