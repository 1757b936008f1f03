//! Settlement Service
//!
//! Terminal market transitions. Resolution cancels every resting order,
//! releases its escrow, pays the winning outcome one dollar per share, and
//! zeroes positions, all inside one market-scoped transaction. Market
//! cancellation does the same minus the payout: shares die worthless, cash
//! escrow comes back.

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::bus::ExchangeEvent;
use crate::metrics::names;
use crate::models::{
    OrderEventKind, OrderKind, OrderResponse, OrderSide, OrderStatus, Outcome,
};

use super::ledger;
use super::matching::book::BookEntry;
use super::matching::escrow;
use super::matching::types::{CancelReason, MatchingError, Qty};

/// What a terminal transition did, for the worker to publish.
#[derive(Debug)]
pub struct SettlementSummary {
    pub final_sequence: i64,
    pub orders_cancelled: usize,
    pub positions_settled: usize,
    pub total_payout: Decimal,
    pub cancelled_events: Vec<(Uuid, ExchangeEvent)>,
    pub affected_users: Vec<Uuid>,
}

/// CLOSED -> RESOLVED with outcome `winning`.
pub async fn settle_resolution(
    pool: &PgPool,
    market_id: Uuid,
    winning: Outcome,
    resting: &[BookEntry],
    base_sequence: i64,
) -> Result<SettlementSummary, MatchingError> {
    settle(pool, market_id, Some(winning), resting, base_sequence).await
}

/// Any non-terminal status -> CANCELLED. Escrow released, no payout.
pub async fn settle_cancellation(
    pool: &PgPool,
    market_id: Uuid,
    resting: &[BookEntry],
    base_sequence: i64,
) -> Result<SettlementSummary, MatchingError> {
    settle(pool, market_id, None, resting, base_sequence).await
}

async fn settle(
    pool: &PgPool,
    market_id: Uuid,
    winning: Option<Outcome>,
    resting: &[BookEntry],
    base_sequence: i64,
) -> Result<SettlementSummary, MatchingError> {
    let mut tx = pool.begin().await?;

    let holders: Vec<Uuid> = sqlx::query_scalar(
        "SELECT DISTINCT user_id FROM positions WHERE market_id = $1 AND quantity > 0",
    )
    .bind(market_id)
    .fetch_all(&mut *tx)
    .await?;
    let mut users: Vec<Uuid> = resting.iter().map(|e| e.user_id).collect();
    users.extend(holders);
    ledger::lock_accounts(&mut tx, &users).await?;

    let reason = match winning {
        Some(_) => CancelReason::MarketResolved,
        None => CancelReason::MarketCancelled,
    };

    // 1. Cancel the book and release every reservation.
    let mut seq = base_sequence;
    let mut cancelled_events = Vec::with_capacity(resting.len());
    for entry in resting {
        let remaining = entry.remaining();
        match entry.side {
            OrderSide::Buy => {
                escrow::release_funds(&mut tx, entry.user_id, entry.limit_price.cost(remaining))
                    .await?
            }
            OrderSide::Sell => {
                escrow::release_shares(&mut tx, entry.user_id, market_id, entry.outcome, remaining)
                    .await?
            }
        }
        ledger::mark_order_status(&mut tx, entry.order_id, OrderStatus::Cancelled).await?;

        seq += 1;
        let event = ExchangeEvent::OrderCancelled {
            order: resting_order_response(market_id, entry),
            reason,
        };
        ledger::append_event(
            &mut tx,
            entry.order_id,
            market_id,
            entry.user_id,
            OrderEventKind::Cancelled,
            seq,
            event.payload_value(),
        )
        .await?;
        cancelled_events.push((entry.user_id, event));
    }

    // 2. Pay the winners and zero every position.
    let positions: Vec<(Uuid, Outcome, Decimal)> = sqlx::query_as(
        r#"
        SELECT user_id, outcome, quantity FROM positions
        WHERE market_id = $1 AND quantity > 0
        FOR UPDATE
        "#,
    )
    .bind(market_id)
    .fetch_all(&mut *tx)
    .await?;

    let mut total_payout = Decimal::ZERO;
    let mut affected: Vec<Uuid> = resting.iter().map(|e| e.user_id).collect();
    for (user_id, outcome, quantity) in &positions {
        if winning == Some(*outcome) {
            let payout = Qty::from_decimal(*quantity).unwrap_or(Qty::ZERO).payout();
            escrow::credit_available(&mut tx, *user_id, payout).await?;
            total_payout += payout.to_decimal();
        }
        affected.push(*user_id);
    }

    sqlx::query(
        r#"
        UPDATE positions
        SET quantity = 0, committed = 0, average_price = NULL, updated_at = NOW()
        WHERE market_id = $1
        "#,
    )
    .bind(market_id)
    .execute(&mut *tx)
    .await?;

    // 3. Flip the market row.
    seq += 1;
    match winning {
        Some(outcome) => {
            sqlx::query(
                r#"
                UPDATE markets
                SET status = 'resolved', outcome = $1, resolve_time = $2,
                    last_sequence = $3, updated_at = NOW()
                WHERE id = $4
                "#,
            )
            .bind(outcome)
            .bind(Utc::now())
            .bind(seq)
            .bind(market_id)
            .execute(&mut *tx)
            .await?;
        }
        None => {
            sqlx::query(
                r#"
                UPDATE markets
                SET status = 'cancelled', last_sequence = $1, updated_at = NOW()
                WHERE id = $2
                "#,
            )
            .bind(seq)
            .bind(market_id)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;

    tracing::info!(
        %market_id,
        outcome = ?winning,
        orders_cancelled = resting.len(),
        positions_settled = positions.len(),
        %total_payout,
        "market settled"
    );
    metrics::counter!(names::SETTLEMENT_PAYOUT_DOLLARS).increment(total_payout.to_u64().unwrap_or(0));

    affected.sort();
    affected.dedup();
    Ok(SettlementSummary {
        final_sequence: seq,
        orders_cancelled: resting.len(),
        positions_settled: positions.len(),
        total_payout,
        cancelled_events,
        affected_users: affected,
    })
}

fn resting_order_response(market_id: Uuid, entry: &BookEntry) -> OrderResponse {
    OrderResponse {
        order_id: entry.order_id,
        market_id,
        side: entry.side,
        kind: OrderKind::Limit,
        outcome: entry.outcome,
        price: Some(entry.limit_price.to_decimal()),
        quantity: entry.quantity.to_decimal(),
        filled: entry.filled.to_decimal(),
        remaining: entry.remaining().to_decimal(),
        status: OrderStatus::Cancelled,
        created_at: chrono::DateTime::from_timestamp_millis(entry.created_at_millis)
            .unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::matching::types::{Price, Qty};
    use rust_decimal_macros::dec;

    #[test]
    fn cancelled_order_view_reports_the_remainder() {
        let entry = BookEntry {
            order_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            side: OrderSide::Buy,
            outcome: Outcome::Yes,
            limit_price: Price::from_decimal(dec!(0.40), 1).unwrap(),
            yes_price: Price::from_decimal(dec!(0.40), 1).unwrap(),
            quantity: Qty::from_decimal(dec!(80)).unwrap(),
            filled: Qty::from_decimal(dec!(60)).unwrap(),
            created_at_millis: 1_700_000_000_000,
        };
        let view = resting_order_response(Uuid::new_v4(), &entry);
        assert_eq!(view.status, OrderStatus::Cancelled);
        assert_eq!(view.remaining, dec!(20.0000));
        assert_eq!(view.price, Some(dec!(0.40)));
    }
}
