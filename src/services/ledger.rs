//! Ledger Access
//!
//! Typed SQL for the authoritative store: orders, trades, balances,
//! positions, markets, and the append-only order-event log. Mutations run
//! inside the per-market writer's transaction; reads here serve the query
//! commands and recovery.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{
    Balance, Market, Order, OrderEventKind, OrderStatus, Position, Trade, User,
};

use super::matching::types::MatchingError;

/// Row-lock the balance rows for a set of users in a fixed global order so
/// two markets touching the same users cannot deadlock.
pub async fn lock_accounts(
    tx: &mut Transaction<'_, Postgres>,
    user_ids: &[Uuid],
) -> Result<(), MatchingError> {
    let mut ids: Vec<Uuid> = user_ids.to_vec();
    ids.sort();
    ids.dedup();
    for user_id in ids {
        sqlx::query("SELECT user_id FROM balances WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

pub async fn insert_order(
    tx: &mut Transaction<'_, Postgres>,
    order: &Order,
) -> Result<(), MatchingError> {
    sqlx::query(
        r#"
        INSERT INTO orders (id, market_id, user_id, side, kind, outcome, price,
                            quantity, filled, status, client_key, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
        "#,
    )
    .bind(order.id)
    .bind(order.market_id)
    .bind(order.user_id)
    .bind(order.side)
    .bind(order.kind)
    .bind(order.outcome)
    .bind(order.price)
    .bind(order.quantity)
    .bind(order.filled)
    .bind(order.status)
    .bind(&order.client_key)
    .bind(order.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn update_order_fill(
    tx: &mut Transaction<'_, Postgres>,
    order_id: Uuid,
    filled: Decimal,
    status: OrderStatus,
) -> Result<(), MatchingError> {
    sqlx::query(
        r#"
        UPDATE orders SET filled = $1, status = $2, updated_at = NOW()
        WHERE id = $3
        "#,
    )
    .bind(filled)
    .bind(status)
    .bind(order_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn mark_order_status(
    tx: &mut Transaction<'_, Postgres>,
    order_id: Uuid,
    status: OrderStatus,
) -> Result<(), MatchingError> {
    sqlx::query("UPDATE orders SET status = $1, updated_at = NOW() WHERE id = $2")
        .bind(status)
        .bind(order_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn insert_trade(
    tx: &mut Transaction<'_, Postgres>,
    trade: &Trade,
) -> Result<(), MatchingError> {
    sqlx::query(
        r#"
        INSERT INTO trades (id, market_id, outcome, buy_order_id, sell_order_id,
                            buyer_id, seller_id, price, quantity, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(trade.id)
    .bind(trade.market_id)
    .bind(trade.outcome)
    .bind(trade.buy_order_id)
    .bind(trade.sell_order_id)
    .bind(trade.buyer_id)
    .bind(trade.seller_id)
    .bind(trade.price)
    .bind(trade.quantity)
    .bind(trade.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Append to the audit log. The (order_id, kind, sequence) unique key makes
/// replayed appends no-ops.
pub async fn append_event(
    tx: &mut Transaction<'_, Postgres>,
    order_id: Uuid,
    market_id: Uuid,
    user_id: Uuid,
    kind: OrderEventKind,
    sequence: i64,
    payload: Value,
) -> Result<(), MatchingError> {
    sqlx::query(
        r#"
        INSERT INTO order_events (order_id, market_id, user_id, kind, sequence, payload)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (order_id, kind, sequence) DO NOTHING
        "#,
    )
    .bind(order_id)
    .bind(market_id)
    .bind(user_id)
    .bind(kind)
    .bind(sequence)
    .bind(payload)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn set_market_sequence(
    tx: &mut Transaction<'_, Postgres>,
    market_id: Uuid,
    sequence: i64,
) -> Result<(), MatchingError> {
    sqlx::query("UPDATE markets SET last_sequence = $1, updated_at = NOW() WHERE id = $2")
        .bind(sequence)
        .bind(market_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

// ============================================================================
// Reads
// ============================================================================

pub async fn fetch_user(pool: &PgPool, user_id: Uuid) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

pub async fn fetch_order(pool: &PgPool, order_id: Uuid) -> Result<Option<Order>, sqlx::Error> {
    sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
        .bind(order_id)
        .fetch_optional(pool)
        .await
}

/// Read an order inside the writer's transaction, seeing its own updates.
pub async fn fetch_order_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    order_id: Uuid,
) -> Result<Option<Order>, MatchingError> {
    let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(order)
}

pub async fn fetch_market(pool: &PgPool, market_id: Uuid) -> Result<Option<Market>, sqlx::Error> {
    sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE id = $1")
        .bind(market_id)
        .fetch_optional(pool)
        .await
}

pub async fn fetch_balance(pool: &PgPool, user_id: Uuid) -> Result<Option<Balance>, sqlx::Error> {
    sqlx::query_as::<_, Balance>("SELECT * FROM balances WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

pub async fn fetch_positions(pool: &PgPool, user_id: Uuid) -> Result<Vec<Position>, sqlx::Error> {
    sqlx::query_as::<_, Position>(
        "SELECT * FROM positions WHERE user_id = $1 AND quantity > 0 ORDER BY market_id, outcome",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

/// Markets the engine must host a writer for.
pub async fn live_markets(pool: &PgPool) -> Result<Vec<Market>, sqlx::Error> {
    sqlx::query_as::<_, Market>(
        "SELECT * FROM markets WHERE status IN ('open', 'closed') ORDER BY created_at",
    )
    .fetch_all(pool)
    .await
}

/// Resting orders for book recovery, in admission order.
pub async fn resting_orders(pool: &PgPool, market_id: Uuid) -> Result<Vec<Order>, sqlx::Error> {
    sqlx::query_as::<_, Order>(
        r#"
        SELECT * FROM orders
        WHERE market_id = $1 AND status IN ('open', 'partially_filled')
        ORDER BY created_at
        "#,
    )
    .bind(market_id)
    .fetch_all(pool)
    .await
}

pub async fn recent_trades(
    pool: &PgPool,
    market_id: Uuid,
    limit: i64,
) -> Result<Vec<Trade>, sqlx::Error> {
    sqlx::query_as::<_, Trade>(
        "SELECT * FROM trades WHERE market_id = $1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(market_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

// ============================================================================
// Invariant verification
// ============================================================================

/// Violations found by a conservation sweep. Any entry is fatal for the
/// market's writer.
#[derive(Debug)]
pub struct ConservationReport {
    pub violations: Vec<String>,
}

impl ConservationReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Recompute the cheap global invariants for one market: no negative
/// balances, committed shares within position bounds, share pairing intact
/// (every YES share was minted against a NO share), fills within order
/// quantity.
pub async fn verify_market_conservation(
    pool: &PgPool,
    market_id: Uuid,
) -> Result<ConservationReport, sqlx::Error> {
    let mut violations = Vec::new();

    let negative: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM balances WHERE available < 0 OR locked < 0",
    )
    .fetch_one(pool)
    .await?;
    if negative > 0 {
        violations.push(format!("{} balance rows are negative", negative));
    }

    let overcommitted: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM positions WHERE market_id = $1 AND committed > quantity",
    )
    .bind(market_id)
    .fetch_one(pool)
    .await?;
    if overcommitted > 0 {
        violations.push(format!(
            "{} positions have committed > quantity",
            overcommitted
        ));
    }

    let (yes_total, no_total): (Option<Decimal>, Option<Decimal>) = sqlx::query_as(
        r#"
        SELECT
            SUM(quantity) FILTER (WHERE outcome = 'yes'),
            SUM(quantity) FILTER (WHERE outcome = 'no')
        FROM positions WHERE market_id = $1
        "#,
    )
    .bind(market_id)
    .fetch_one(pool)
    .await?;
    let yes_total = yes_total.unwrap_or(Decimal::ZERO);
    let no_total = no_total.unwrap_or(Decimal::ZERO);
    if yes_total != no_total {
        violations.push(format!(
            "share pairing broken: {} YES vs {} NO outstanding",
            yes_total, no_total
        ));
    }

    let overfilled: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM orders WHERE market_id = $1 AND (filled > quantity OR filled < 0)",
    )
    .bind(market_id)
    .fetch_one(pool)
    .await?;
    if overfilled > 0 {
        violations.push(format!("{} orders have filled outside [0, quantity]", overfilled));
    }

    Ok(ConservationReport { violations })
}

/// Event rows scoped to one market from a sequence onward, for replaying
/// missed broadcasts.
pub async fn events_since(
    pool: &PgPool,
    market_id: Uuid,
    from_sequence: i64,
) -> Result<Vec<(Uuid, Uuid, OrderEventKind, i64, Value, DateTime<Utc>)>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT order_id, user_id, kind, sequence, payload, created_at
        FROM order_events
        WHERE market_id = $1 AND sequence > $2
        ORDER BY sequence
        "#,
    )
    .bind(market_id)
    .bind(from_sequence)
    .fetch_all(pool)
    .await
}
