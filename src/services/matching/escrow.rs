//! Escrow Admission and Fill Settlement
//!
//! Order processing is split into three individually testable steps:
//! admission (reserve funds or shares), matching (produce fills), and
//! settlement (reconcile reservations against fills, releasing any surplus).
//! This module owns the first and last: the reservation SQL that runs inside
//! the engine's ledger transaction, and the pure money/position arithmetic
//! for one leg of a fill.
//!
//! Buys lock cash at the taker's limit price (1.00/share for market buys)
//! and get the price improvement refunded per fill. Sells lock shares by
//! bumping the position's `committed` column; cash is never locked for a
//! sell.

use rust_decimal::Decimal;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::models::{OrderSide, Outcome};

use super::types::{own_space_price, MatchingError, Money, Price, Qty};

// ============================================================================
// Pure settlement math
// ============================================================================

/// One side of one fill, in the party's own outcome space.
#[derive(Debug, Clone)]
pub struct FillLeg {
    pub user_id: Uuid,
    pub order_id: Uuid,
    pub side: OrderSide,
    pub outcome: Outcome,
    /// Escrow basis: the party's limit price, or 1.00 for a market buy.
    pub escrow_price: Price,
    /// What this party actually pays or receives per share.
    pub own_price: Price,
    pub quantity: Qty,
}

impl FillLeg {
    pub fn new(
        user_id: Uuid,
        order_id: Uuid,
        side: OrderSide,
        outcome: Outcome,
        escrow_price: Price,
        yes_trade_price: Price,
        quantity: Qty,
    ) -> Self {
        Self {
            user_id,
            order_id,
            side,
            outcome,
            escrow_price,
            own_price: own_space_price(outcome, yes_trade_price),
            quantity,
        }
    }

    /// Cash consumed from `locked` by this leg. Zero for sells.
    pub fn locked_release(&self) -> Money {
        match self.side {
            OrderSide::Buy => self.escrow_price.cost(self.quantity),
            OrderSide::Sell => Money::ZERO,
        }
    }

    /// Cash returned to `available`: the improvement refund for buys, the
    /// proceeds for sells.
    pub fn available_credit(&self) -> Money {
        match self.side {
            OrderSide::Buy => (self.escrow_price.cost(self.quantity))
                - (self.own_price.cost(self.quantity)),
            OrderSide::Sell => self.own_price.cost(self.quantity),
        }
    }

    /// Net cash flow for the party (negative = pays).
    pub fn net_cash(&self) -> Money {
        self.available_credit() - self.locked_release()
    }

    /// Signed share delta for the party's position in its outcome.
    pub fn share_delta(&self) -> i64 {
        match self.side {
            OrderSide::Buy => self.quantity.raw(),
            OrderSide::Sell => -self.quantity.raw(),
        }
    }
}

/// Weighted-average cost after buying `fill` at `price` on top of
/// (`old_qty`, `old_avg`). Exact rational, rounded to 4 places.
pub fn blended_average(
    old_qty: Qty,
    old_avg: Option<Decimal>,
    fill: Qty,
    price: Price,
) -> Decimal {
    let old_cost = old_avg.unwrap_or(Decimal::ZERO) * old_qty.to_decimal();
    let new_cost = old_cost + price.to_decimal() * fill.to_decimal();
    (new_cost / (old_qty + fill).to_decimal()).round_dp(4)
}

// ============================================================================
// Reservation SQL
// ============================================================================

/// Move `amount` from available to locked, failing if the user cannot cover
/// it. The guarded UPDATE keeps the non-negative invariant inside the
/// statement itself.
pub async fn reserve_funds(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    amount: Money,
) -> Result<(), MatchingError> {
    let amount = amount.to_decimal();
    let updated = sqlx::query(
        r#"
        UPDATE balances
        SET available = available - $1, locked = locked + $1, updated_at = NOW()
        WHERE user_id = $2 AND available >= $1
        "#,
    )
    .bind(amount)
    .bind(user_id)
    .execute(&mut **tx)
    .await?;

    if updated.rows_affected() == 0 {
        let available: Decimal =
            sqlx::query_scalar("SELECT available FROM balances WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&mut **tx)
                .await?
                .unwrap_or(Decimal::ZERO);
        return Err(MatchingError::InsufficientBalance {
            required: amount,
            available,
        });
    }
    Ok(())
}

/// Return `amount` from locked to available (cancellation, market-order
/// surplus, resolution cleanup).
pub async fn release_funds(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    amount: Money,
) -> Result<(), MatchingError> {
    if amount.is_zero() {
        return Ok(());
    }
    sqlx::query(
        r#"
        UPDATE balances
        SET available = available + $1, locked = locked - $1, updated_at = NOW()
        WHERE user_id = $2
        "#,
    )
    .bind(amount.to_decimal())
    .bind(user_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Consume locked cash that leaves the user entirely (a fill), crediting the
/// refund portion back to available in the same statement.
pub async fn settle_buy_leg(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    locked_release: Money,
    available_credit: Money,
) -> Result<(), MatchingError> {
    sqlx::query(
        r#"
        UPDATE balances
        SET locked = locked - $1, available = available + $2, updated_at = NOW()
        WHERE user_id = $3
        "#,
    )
    .bind(locked_release.to_decimal())
    .bind(available_credit.to_decimal())
    .bind(user_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Credit sale proceeds or settlement payouts to available.
pub async fn credit_available(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    amount: Money,
) -> Result<(), MatchingError> {
    if amount.is_zero() {
        return Ok(());
    }
    sqlx::query(
        r#"
        UPDATE balances
        SET available = available + $1, updated_at = NOW()
        WHERE user_id = $2
        "#,
    )
    .bind(amount.to_decimal())
    .bind(user_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Commit `quantity` shares behind a resting sell. Fails unless the position
/// holds that many uncommitted shares.
pub async fn reserve_shares(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    market_id: Uuid,
    outcome: Outcome,
    quantity: Qty,
) -> Result<(), MatchingError> {
    let quantity = quantity.to_decimal();
    let updated = sqlx::query(
        r#"
        UPDATE positions
        SET committed = committed + $1, updated_at = NOW()
        WHERE user_id = $2 AND market_id = $3 AND outcome = $4
          AND quantity - committed >= $1
        "#,
    )
    .bind(quantity)
    .bind(user_id)
    .bind(market_id)
    .bind(outcome)
    .execute(&mut **tx)
    .await?;

    if updated.rows_affected() == 0 {
        let uncommitted: Decimal = sqlx::query_scalar(
            r#"
            SELECT quantity - committed FROM positions
            WHERE user_id = $1 AND market_id = $2 AND outcome = $3
            "#,
        )
        .bind(user_id)
        .bind(market_id)
        .bind(outcome)
        .fetch_optional(&mut **tx)
        .await?
        .unwrap_or(Decimal::ZERO);
        return Err(MatchingError::InsufficientShares {
            required: quantity,
            available: uncommitted,
        });
    }
    Ok(())
}

/// Release committed shares back to the free portion of the position.
pub async fn release_shares(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    market_id: Uuid,
    outcome: Outcome,
    quantity: Qty,
) -> Result<(), MatchingError> {
    if quantity.is_zero() {
        return Ok(());
    }
    sqlx::query(
        r#"
        UPDATE positions
        SET committed = committed - $1, updated_at = NOW()
        WHERE user_id = $2 AND market_id = $3 AND outcome = $4
        "#,
    )
    .bind(quantity.to_decimal())
    .bind(user_id)
    .bind(market_id)
    .bind(outcome)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Apply one leg's position change. Buys upsert and re-blend the average
/// cost; sells consume committed shares and clear the average when the
/// position goes flat.
pub async fn apply_position_leg(
    tx: &mut Transaction<'_, Postgres>,
    market_id: Uuid,
    leg: &FillLeg,
) -> Result<(), MatchingError> {
    match leg.side {
        OrderSide::Buy => {
            let row: Option<(Decimal, Option<Decimal>)> = sqlx::query_as(
                r#"
                SELECT quantity, average_price FROM positions
                WHERE user_id = $1 AND market_id = $2 AND outcome = $3
                FOR UPDATE
                "#,
            )
            .bind(leg.user_id)
            .bind(market_id)
            .bind(leg.outcome)
            .fetch_optional(&mut **tx)
            .await?;

            let (old_qty, old_avg) = match row {
                Some((q, avg)) => (qty_from_row(q), avg),
                None => (Qty::ZERO, None),
            };
            let new_avg = blended_average(old_qty, old_avg, leg.quantity, leg.own_price);

            sqlx::query(
                r#"
                INSERT INTO positions (user_id, market_id, outcome, quantity, committed, average_price)
                VALUES ($1, $2, $3, $4, 0, $5)
                ON CONFLICT (user_id, market_id, outcome) DO UPDATE SET
                    quantity = positions.quantity + $4,
                    average_price = $5,
                    updated_at = NOW()
                "#,
            )
            .bind(leg.user_id)
            .bind(market_id)
            .bind(leg.outcome)
            .bind(leg.quantity.to_decimal())
            .bind(new_avg)
            .execute(&mut **tx)
            .await?;
        }
        OrderSide::Sell => {
            sqlx::query(
                r#"
                UPDATE positions
                SET quantity = quantity - $1,
                    committed = committed - $1,
                    average_price = CASE WHEN quantity - $1 = 0 THEN NULL ELSE average_price END,
                    updated_at = NOW()
                WHERE user_id = $2 AND market_id = $3 AND outcome = $4
                "#,
            )
            .bind(leg.quantity.to_decimal())
            .bind(leg.user_id)
            .bind(market_id)
            .bind(leg.outcome)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

/// Ledger quantities are always 4dp; reading a row back into engine units
/// cannot fail in practice.
fn qty_from_row(d: Decimal) -> Qty {
    Qty::from_decimal(d).unwrap_or(Qty::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn price(d: Decimal) -> Price {
        Price::from_decimal(d, 1).unwrap()
    }

    fn qty(d: Decimal) -> Qty {
        Qty::from_decimal(d).unwrap()
    }

    #[test]
    fn buy_leg_refunds_improvement() {
        // taker bid limit 0.65 NO, trade at YES 0.40 => own price 0.60
        let leg = FillLeg::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            OrderSide::Buy,
            Outcome::No,
            price(dec!(0.65)),
            price(dec!(0.40)),
            qty(dec!(60)),
        );
        assert_eq!(leg.own_price, price(dec!(0.60)));
        assert_eq!(leg.locked_release().to_decimal(), dec!(39.000000));
        assert_eq!(leg.available_credit().to_decimal(), dec!(3.000000));
        assert_eq!(leg.net_cash().to_decimal(), dec!(-36.000000));
        assert_eq!(leg.share_delta(), 600_000);
    }

    #[test]
    fn maker_buy_leg_at_own_price_has_no_refund() {
        // maker bid at 0.40 YES filled at its own price
        let leg = FillLeg::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            OrderSide::Buy,
            Outcome::Yes,
            price(dec!(0.40)),
            price(dec!(0.40)),
            qty(dec!(60)),
        );
        assert_eq!(leg.locked_release().to_decimal(), dec!(24.000000));
        assert_eq!(leg.available_credit(), Money::ZERO);
        assert_eq!(leg.net_cash().to_decimal(), dec!(-24.000000));
    }

    #[test]
    fn sell_leg_receives_proceeds() {
        let leg = FillLeg::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            OrderSide::Sell,
            Outcome::Yes,
            price(dec!(0.55)),
            price(dec!(0.60)),
            qty(dec!(10)),
        );
        assert_eq!(leg.locked_release(), Money::ZERO);
        assert_eq!(leg.available_credit().to_decimal(), dec!(6.000000));
        assert_eq!(leg.share_delta(), -100_000);
    }

    #[test]
    fn value_is_conserved_across_every_pairing() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let yes_price = price(dec!(0.40));
        let q = qty(dec!(60));

        // mint: buy YES x buy NO; cash entering the share float is $1/share
        let buy_yes = FillLeg::new(a, Uuid::new_v4(), OrderSide::Buy, Outcome::Yes, price(dec!(0.40)), yes_price, q);
        let buy_no = FillLeg::new(b, Uuid::new_v4(), OrderSide::Buy, Outcome::No, price(dec!(0.65)), yes_price, q);
        let minted = buy_yes.net_cash() + buy_no.net_cash();
        assert_eq!(minted.to_decimal(), dec!(-60.000000));

        // transfer: buy YES x sell YES; no cash enters or leaves the float
        let sell_yes = FillLeg::new(b, Uuid::new_v4(), OrderSide::Sell, Outcome::Yes, price(dec!(0.35)), yes_price, q);
        let transferred = buy_yes.net_cash() + sell_yes.net_cash();
        assert_eq!(transferred, Money::ZERO);

        // merge: sell YES x sell NO; the float pays out $1/share
        let sell_no = FillLeg::new(a, Uuid::new_v4(), OrderSide::Sell, Outcome::No, price(dec!(0.70)), yes_price, q);
        let merged = sell_yes.net_cash() + sell_no.net_cash();
        assert_eq!(merged.to_decimal(), dec!(60.000000));
    }

    #[test]
    fn blended_average_weights_by_quantity() {
        let avg = blended_average(qty(dec!(10)), Some(dec!(0.40)), qty(dec!(30)), price(dec!(0.60)));
        assert_eq!(avg, dec!(0.5500));

        // first fill starts the average at the fill price
        let avg = blended_average(Qty::ZERO, None, qty(dec!(60)), price(dec!(0.60)));
        assert_eq!(avg, dec!(0.6000));
    }
}
