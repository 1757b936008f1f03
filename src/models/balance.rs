use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Balance {
    pub user_id: Uuid,
    pub available: Decimal,
    pub locked: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceView {
    pub available: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
}

impl From<Balance> for BalanceView {
    fn from(balance: Balance) -> Self {
        Self {
            total: balance.total(),
            available: balance.available,
            locked: balance.locked,
        }
    }
}
