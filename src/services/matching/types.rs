//! Matching Engine Types
//!
//! Fixed-point price/quantity/money units, the YES/NO price map, and the
//! command and result DTOs shared across the engine.
//!
//! All engine arithmetic is integer fixed-point so every identity is exact:
//! prices are hundredths, quantities ten-thousandths, money millionths of a
//! dollar. `Decimal` appears only at the ledger and wire boundaries.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{OrderEventKind, OrderResponse, OrderSide, Outcome, TradeView};

// ============================================================================
// Fixed-point units
// ============================================================================

/// A price in hundredths of a dollar. Resting prices are confined to
/// [0.01, 0.99]; 0.00 and 1.00 exist only as market-order sentinels and are
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Price(i64);

impl Price {
    pub const MIN: Price = Price(1);
    pub const MAX: Price = Price(99);
    /// One whole dollar; the escrow ceiling for market buys.
    pub const ONE: Price = Price(100);

    pub fn from_cents(cents: i64) -> Self {
        Price(cents)
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    /// Parse a wire price. Must land exactly on a cent, on the tick grid,
    /// and inside [0.01, 0.99].
    pub fn from_decimal(price: Decimal, tick_cents: i64) -> Result<Self, MatchingError> {
        let scaled = price * Decimal::from(100);
        if scaled.fract() != Decimal::ZERO {
            return Err(MatchingError::InvalidPrice(format!(
                "price {} has sub-cent precision",
                price
            )));
        }
        let cents = scaled
            .to_i64()
            .ok_or_else(|| MatchingError::InvalidPrice(format!("price {} out of range", price)))?;
        if !(Self::MIN.0..=Self::MAX.0).contains(&cents) {
            return Err(MatchingError::InvalidPrice(format!(
                "price {} outside [0.01, 0.99]",
                price
            )));
        }
        if cents % tick_cents != 0 {
            return Err(MatchingError::InvalidPrice(format!(
                "price {} not aligned to tick",
                price
            )));
        }
        Ok(Price(cents))
    }

    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0, 2)
    }

    /// The same probability quoted from the other outcome: `1 - p`.
    pub fn complement(&self) -> Price {
        Price(100 - self.0)
    }

    /// Exact cost of `qty` shares at this price.
    pub fn cost(&self, qty: Qty) -> Money {
        // cents (1e-2) x share e4 units (1e-4) = micro-dollars (1e-6)
        Money(self.0 * qty.0)
    }
}

/// A share quantity in ten-thousandths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Qty(i64);

impl Qty {
    pub const ZERO: Qty = Qty(0);

    pub fn from_raw(raw: i64) -> Self {
        Qty(raw)
    }

    pub fn raw(&self) -> i64 {
        self.0
    }

    pub fn from_decimal(qty: Decimal) -> Result<Self, MatchingError> {
        let scaled = qty * Decimal::from(10_000);
        if scaled.fract() != Decimal::ZERO {
            return Err(MatchingError::InvalidQuantity(format!(
                "quantity {} exceeds 4 decimal places",
                qty
            )));
        }
        let raw = scaled.to_i64().ok_or_else(|| {
            MatchingError::InvalidQuantity(format!("quantity {} out of range", qty))
        })?;
        if raw <= 0 {
            return Err(MatchingError::InvalidQuantity(format!(
                "quantity {} must be positive",
                qty
            )));
        }
        Ok(Qty(raw))
    }

    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0, 4)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn min(self, other: Qty) -> Qty {
        Qty(self.0.min(other.0))
    }

    /// Payout of one dollar per share at resolution.
    pub fn payout(&self) -> Money {
        Money(self.0 * 100)
    }
}

impl std::ops::Add for Qty {
    type Output = Qty;
    fn add(self, rhs: Qty) -> Qty {
        Qty(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Qty {
    type Output = Qty;
    fn sub(self, rhs: Qty) -> Qty {
        Qty(self.0 - rhs.0)
    }
}

impl std::ops::AddAssign for Qty {
    fn add_assign(&mut self, rhs: Qty) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Qty {
    fn sub_assign(&mut self, rhs: Qty) {
        self.0 -= rhs.0;
    }
}

/// Money in millionths of a dollar, the exact granularity of
/// price x quantity products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_micros(micros: i64) -> Self {
        Money(micros)
    }

    pub fn micros(&self) -> i64 {
        self.0
    }

    pub fn from_decimal(amount: Decimal) -> Result<Self, MatchingError> {
        let scaled = amount * Decimal::from(1_000_000);
        if scaled.fract() != Decimal::ZERO {
            return Err(MatchingError::Internal(format!(
                "amount {} exceeds 6 decimal places",
                amount
            )));
        }
        scaled
            .to_i64()
            .map(Money)
            .ok_or_else(|| MatchingError::Internal(format!("amount {} out of range", amount)))
    }

    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0, 6)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl std::ops::AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

// ============================================================================
// Price map
// ============================================================================

/// The side of the YES-space book an order lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    pub fn opposite(&self) -> BookSide {
        match self {
            BookSide::Bid => BookSide::Ask,
            BookSide::Ask => BookSide::Bid,
        }
    }
}

/// Map an order's own-space intent onto the YES book.
///
/// Binary markets quote one probability two ways: `buy NO @ p` is the same
/// commitment as `sell YES @ 1-p`, and symmetrically for the other three
/// intents. All book state, matching, and trade prices live in YES space.
pub fn book_placement(side: OrderSide, outcome: Outcome, price: Price) -> (BookSide, Price) {
    match (side, outcome) {
        (OrderSide::Buy, Outcome::Yes) => (BookSide::Bid, price),
        (OrderSide::Sell, Outcome::Yes) => (BookSide::Ask, price),
        (OrderSide::Buy, Outcome::No) => (BookSide::Ask, price.complement()),
        (OrderSide::Sell, Outcome::No) => (BookSide::Bid, price.complement()),
    }
}

/// The side of the YES book a (side, outcome) intent occupies, independent
/// of price; used for market orders, which carry no limit.
pub fn book_side_of(side: OrderSide, outcome: Outcome) -> BookSide {
    match (side, outcome) {
        (OrderSide::Buy, Outcome::Yes) | (OrderSide::Sell, Outcome::No) => BookSide::Bid,
        (OrderSide::Sell, Outcome::Yes) | (OrderSide::Buy, Outcome::No) => BookSide::Ask,
    }
}

/// Convert a YES-space trade price back into an outcome's own space.
pub fn own_space_price(outcome: Outcome, yes_price: Price) -> Price {
    match outcome {
        Outcome::Yes => yes_price,
        Outcome::No => yes_price.complement(),
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Why a resting order left the book without the owner asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserRequested,
    InsufficientLiquidity,
    MarketResolved,
    MarketCancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum MatchingError {
    #[error("unknown market: {0}")]
    UnknownMarket(Uuid),

    #[error("unknown order: {0}")]
    UnknownOrder(Uuid),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("market {0} is not open")]
    MarketNotOpen(Uuid),

    #[error("market {0} is not in a settleable state")]
    MarketNotSettleable(Uuid),

    #[error("order {0} is filled and cannot be cancelled")]
    NotCancellable(Uuid),

    #[error("order {0} belongs to another user")]
    NotOwner(Uuid),

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    #[error("insufficient shares: required {required}, available {available}")]
    InsufficientShares {
        required: Decimal,
        available: Decimal,
    },

    #[error("order submission rate ceiling reached")]
    RateLimited,

    #[error("admin role required")]
    Unauthorized,

    #[error("ledger conflict: {0}")]
    LedgerConflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MatchingError {
    /// Stable wire code per the error taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            MatchingError::UnknownMarket(_) => "UNKNOWN_MARKET",
            MatchingError::UnknownOrder(_) => "UNKNOWN_ORDER",
            MatchingError::InvalidPrice(_) => "INVALID_PRICE",
            MatchingError::InvalidQuantity(_) => "INVALID_QUANTITY",
            MatchingError::MarketNotOpen(_) => "MARKET_NOT_OPEN",
            MatchingError::MarketNotSettleable(_) => "MARKET_NOT_SETTLEABLE",
            MatchingError::NotCancellable(_) => "NOT_CANCELLABLE",
            MatchingError::NotOwner(_) => "NOT_OWNER",
            MatchingError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            MatchingError::InsufficientShares { .. } => "INSUFFICIENT_SHARES",
            MatchingError::RateLimited => "RATE_LIMITED",
            MatchingError::Unauthorized => "UNAUTHORIZED",
            MatchingError::LedgerConflict(_) => "LEDGER_CONFLICT",
            MatchingError::Internal(_) => "INTERNAL",
        }
    }

    /// Only transient infrastructure faults are worth retrying.
    pub fn is_retriable(&self) -> bool {
        matches!(self, MatchingError::LedgerConflict(_))
    }
}

impl From<sqlx::Error> for MatchingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("40001") => {
                MatchingError::LedgerConflict(e.to_string())
            }
            other => MatchingError::Internal(other.to_string()),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionResult {
    pub order: OrderResponse,
    pub trades: Vec<TradeView>,
    pub events: Vec<OrderEventKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancellationResult {
    pub order: OrderResponse,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionResult {
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub orders_cancelled: usize,
    pub positions_settled: usize,
    pub total_payout: Decimal,
}

/// Aggregated book level as served in snapshots and depth deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelView {
    pub price: Decimal,
    pub quantity: Decimal,
    pub order_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideView {
    pub bids: Vec<LevelView>,
    pub asks: Vec<LevelView>,
}

/// Top-of-book snapshot for both outcomes. The NO view is the YES view
/// mirrored through `1 - p`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub market_id: Uuid,
    pub yes: SideView,
    pub no: SideView,
    pub implied_probability: Decimal,
    pub sequence: i64,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderSide, Outcome};
    use rust_decimal_macros::dec;

    #[test]
    fn price_parses_only_on_tick() {
        assert!(Price::from_decimal(dec!(0.40), 1).is_ok());
        assert!(Price::from_decimal(dec!(0.405), 1).is_err());
        assert!(Price::from_decimal(dec!(0.00), 1).is_err());
        assert!(Price::from_decimal(dec!(1.00), 1).is_err());
        // a 5-cent tick rejects prices between its gridpoints
        assert!(Price::from_decimal(dec!(0.40), 5).is_ok());
        assert!(Price::from_decimal(dec!(0.41), 5).is_err());
    }

    #[test]
    fn cost_is_exact() {
        let p = Price::from_decimal(dec!(0.40), 1).unwrap();
        let q = Qty::from_decimal(dec!(80)).unwrap();
        assert_eq!(p.cost(q).to_decimal(), dec!(32.000000));

        let p = Price::from_decimal(dec!(0.33), 1).unwrap();
        let q = Qty::from_decimal(dec!(0.0001)).unwrap();
        assert_eq!(p.cost(q).to_decimal(), dec!(0.000033));
    }

    #[test]
    fn complement_spans_the_probability() {
        let p = Price::from_decimal(dec!(0.65), 1).unwrap();
        assert_eq!(p.complement().to_decimal(), dec!(0.35));
        assert_eq!(p.complement().complement(), p);
    }

    #[test]
    fn price_map_covers_all_four_intents() {
        let p = Price::from_decimal(dec!(0.65), 1).unwrap();
        assert_eq!(
            book_placement(OrderSide::Buy, Outcome::Yes, p),
            (BookSide::Bid, p)
        );
        assert_eq!(
            book_placement(OrderSide::Sell, Outcome::Yes, p),
            (BookSide::Ask, p)
        );
        // buy NO @ 0.65 is sell YES @ 0.35
        assert_eq!(
            book_placement(OrderSide::Buy, Outcome::No, p),
            (BookSide::Ask, p.complement())
        );
        assert_eq!(
            book_placement(OrderSide::Sell, Outcome::No, p),
            (BookSide::Bid, p.complement())
        );
    }

    #[test]
    fn payout_is_one_dollar_per_share() {
        let q = Qty::from_decimal(dec!(30)).unwrap();
        assert_eq!(q.payout().to_decimal(), dec!(30.000000));
    }

    #[test]
    fn quantity_rejects_sub_tick_and_nonpositive() {
        assert!(Qty::from_decimal(dec!(0.00001)).is_err());
        assert!(Qty::from_decimal(dec!(0)).is_err());
        assert!(Qty::from_decimal(dec!(-5)).is_err());
        assert_eq!(Qty::from_decimal(dec!(2.5)).unwrap().raw(), 25_000);
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            MatchingError::InsufficientBalance {
                required: dec!(50000),
                available: dec!(10000)
            }
            .code(),
            "INSUFFICIENT_BALANCE"
        );
        assert!(MatchingError::LedgerConflict("serialize".into()).is_retriable());
        assert!(!MatchingError::RateLimited.is_retriable());
    }
}
