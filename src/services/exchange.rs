//! Exchange Service
//!
//! The in-process command surface the ingress collaborator calls. Validates
//! identity-level concerns (rate ceiling, idempotent resubmission, admin
//! role), then routes to the owning market's writer. Read queries go
//! straight to committed state and never queue behind a writer.

use dashmap::DashMap;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::metrics::names;
use crate::models::{BalanceView, OrderIntent, Outcome, PositionView};

use super::auth::AuthService;
use super::ledger;
use super::matching::{
    BookSnapshot, CancellationResult, MarketRegistry, MatchingError, ResolutionResult,
    SubmissionResult,
};

const RETRY_LIMIT: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(10);

/// Sliding one-minute submission window per user.
struct RateWindow {
    count: u32,
    window_start: Instant,
}

pub struct ExchangeService {
    pool: PgPool,
    registry: Arc<MarketRegistry>,
    auth: Arc<AuthService>,
    submit_ceiling_per_min: u32,
    windows: DashMap<Uuid, RateWindow>,
}

impl ExchangeService {
    pub fn new(
        pool: PgPool,
        registry: Arc<MarketRegistry>,
        auth: Arc<AuthService>,
        submit_ceiling_per_min: u32,
    ) -> Self {
        Self {
            pool,
            registry,
            auth,
            submit_ceiling_per_min,
            windows: DashMap::new(),
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    pub async fn submit_order(
        &self,
        intent: OrderIntent,
    ) -> Result<SubmissionResult, MatchingError> {
        self.check_rate(intent.user_id, Instant::now())?;

        // Idempotent resubmission: a known client key returns the recorded
        // outcome instead of running the command again.
        if let Some(key) = &intent.client_key {
            if let Some(existing) = sqlx::query_as::<_, crate::models::Order>(
                "SELECT * FROM orders WHERE user_id = $1 AND client_key = $2",
            )
            .bind(intent.user_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(MatchingError::from)?
            {
                tracing::info!(order_id = %existing.id, "idempotent resubmission replayed");
                return Ok(SubmissionResult {
                    order: existing.into(),
                    trades: vec![],
                    events: vec![],
                });
            }
        }

        self.auth
            .ensure_user_funded(intent.user_id)
            .await
            .map_err(|e| MatchingError::Internal(e.to_string()))?;

        let handle = self.registry.acquire(intent.market_id).await?;
        let mut attempt = 0;
        loop {
            match handle.submit(intent.clone()).await {
                Err(e) if e.is_retriable() && attempt < RETRY_LIMIT => {
                    attempt += 1;
                    tracing::warn!(
                        market_id = %intent.market_id,
                        attempt,
                        "retrying after transient ledger conflict: {e}"
                    );
                    tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
                }
                other => return other,
            }
        }
    }

    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<CancellationResult, MatchingError> {
        let order = ledger::fetch_order(&self.pool, order_id)
            .await?
            .ok_or(MatchingError::UnknownOrder(order_id))?;
        let handle = self.registry.acquire(order.market_id).await?;
        handle.cancel(order_id, user_id).await
    }

    pub async fn order_book_snapshot(
        &self,
        market_id: Uuid,
        depth: usize,
    ) -> Result<BookSnapshot, MatchingError> {
        let handle = self.registry.acquire(market_id).await?;
        Ok(handle.snapshot(depth))
    }

    pub async fn user_balance(&self, user_id: Uuid) -> Result<BalanceView, MatchingError> {
        self.auth
            .ensure_user_funded(user_id)
            .await
            .map_err(|e| MatchingError::Internal(e.to_string()))?;
        let balance = ledger::fetch_balance(&self.pool, user_id)
            .await?
            .ok_or_else(|| MatchingError::Internal("balance row missing after grant".into()))?;
        Ok(balance.into())
    }

    pub async fn user_positions(&self, user_id: Uuid) -> Result<Vec<PositionView>, MatchingError> {
        let positions = ledger::fetch_positions(&self.pool, user_id).await?;
        Ok(positions.into_iter().map(Into::into).collect())
    }

    pub async fn close_market(
        &self,
        market_id: Uuid,
        admin_user_id: Uuid,
    ) -> Result<(), MatchingError> {
        self.require_admin(admin_user_id).await?;
        let handle = self.registry.acquire(market_id).await?;
        handle.close().await
    }

    pub async fn resolve_market(
        &self,
        market_id: Uuid,
        outcome: Outcome,
        admin_user_id: Uuid,
    ) -> Result<ResolutionResult, MatchingError> {
        self.require_admin(admin_user_id).await?;
        let handle = self.registry.acquire(market_id).await?;
        handle.resolve(outcome).await
    }

    pub async fn cancel_market(
        &self,
        market_id: Uuid,
        admin_user_id: Uuid,
    ) -> Result<(), MatchingError> {
        self.require_admin(admin_user_id).await?;
        let handle = self.registry.acquire(market_id).await?;
        handle.cancel_market().await
    }

    // ========================================================================
    // Guards
    // ========================================================================

    async fn require_admin(&self, user_id: Uuid) -> Result<(), MatchingError> {
        let is_admin = self
            .auth
            .is_admin(user_id)
            .await
            .map_err(|e| MatchingError::Internal(e.to_string()))?;
        if is_admin {
            Ok(())
        } else {
            Err(MatchingError::Unauthorized)
        }
    }

    fn check_rate(&self, user_id: Uuid, now: Instant) -> Result<(), MatchingError> {
        let mut window = self.windows.entry(user_id).or_insert_with(|| RateWindow {
            count: 0,
            window_start: now,
        });
        if admit(&mut window, self.submit_ceiling_per_min, now) {
            Ok(())
        } else {
            metrics::counter!(names::ORDERS_RATE_LIMITED_TOTAL).increment(1);
            Err(MatchingError::RateLimited)
        }
    }
}

/// One-minute sliding window admission.
fn admit(window: &mut RateWindow, ceiling: u32, now: Instant) -> bool {
    if now.duration_since(window.window_start) >= Duration::from_secs(60) {
        window.count = 0;
        window.window_start = now;
    }
    window.count += 1;
    window.count <= ceiling
}

#[cfg(test)]
mod tests {
    use super::*;

    // the window is the only pure piece here; command paths are exercised
    // end to end against a live ledger
    #[test]
    fn ceiling_blocks_the_excess_and_resets_next_window() {
        let t0 = Instant::now();
        let mut window = RateWindow {
            count: 0,
            window_start: t0,
        };

        assert!(admit(&mut window, 3, t0));
        assert!(admit(&mut window, 3, t0));
        assert!(admit(&mut window, 3, t0));
        assert!(!admit(&mut window, 3, t0));

        // a fresh window admits again
        assert!(admit(&mut window, 3, t0 + Duration::from_secs(61)));
    }
}
