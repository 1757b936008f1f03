//! Market Registry
//!
//! Each live market is a first-class owned resource: a dedicated writer task,
//! its command channel, and the shared read view of its book. The registry is
//! the only way to reach a market; there is no process-global book map.

use dashmap::DashMap;
use parking_lot::RwLock;
use sqlx::PgPool;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::models::{Market, OrderIntent, Outcome};
use crate::services::ledger;

use super::book::Book;
use super::engine::{snapshot_from_book, EngineCommand, EngineConfig, MarketWorker};
use super::types::{
    BookSnapshot, CancellationResult, MatchingError, ResolutionResult, SubmissionResult,
};

/// A claim on one market's writer. Cloneable; commands funnel through the
/// bounded channel, snapshots read the shared book directly.
#[derive(Clone)]
pub struct MarketHandle {
    market_id: Uuid,
    sender: mpsc::Sender<EngineCommand>,
    book: Arc<RwLock<Book>>,
    sequence: Arc<AtomicI64>,
    pool: PgPool,
}

impl MarketHandle {
    pub async fn submit(&self, intent: OrderIntent) -> Result<SubmissionResult, MatchingError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Submit { intent, reply }).await?;
        self.receive(rx).await
    }

    pub async fn cancel(
        &self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<CancellationResult, MatchingError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Cancel {
            order_id,
            user_id,
            reply,
        })
        .await?;
        self.receive(rx).await
    }

    pub async fn close(&self) -> Result<(), MatchingError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Close { reply }).await?;
        self.receive(rx).await
    }

    pub async fn resolve(&self, outcome: Outcome) -> Result<ResolutionResult, MatchingError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Resolve { outcome, reply }).await?;
        self.receive(rx).await
    }

    pub async fn cancel_market(&self) -> Result<(), MatchingError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::CancelMarket { reply }).await?;
        self.receive(rx).await
    }

    /// Consistent top-of-book view from committed state; never queues behind
    /// the writer.
    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        let book = self.book.read();
        snapshot_from_book(&book, depth, self.sequence.load(Ordering::Acquire))
    }

    async fn send(&self, command: EngineCommand) -> Result<(), MatchingError> {
        if self.sender.send(command).await.is_ok() {
            return Ok(());
        }
        // The writer is gone: terminal market or a halted writer.
        match ledger::fetch_market(&self.pool, self.market_id).await {
            Ok(Some(market)) if market.status.is_terminal() => {
                Err(MatchingError::MarketNotOpen(self.market_id))
            }
            _ => Err(MatchingError::Internal(format!(
                "market writer unavailable for {}",
                self.market_id
            ))),
        }
    }

    async fn receive<T>(&self, rx: oneshot::Receiver<Result<T, MatchingError>>) -> Result<T, MatchingError> {
        rx.await
            .map_err(|_| MatchingError::Internal("market writer dropped the command".into()))?
    }
}

pub struct MarketRegistry {
    pool: PgPool,
    bus: Arc<EventBus>,
    config: EngineConfig,
    markets: DashMap<Uuid, MarketHandle>,
}

impl MarketRegistry {
    /// Load every live market from the ledger and spawn its writer with the
    /// book rebuilt from resting orders and the sequence resumed.
    pub async fn recover(
        pool: PgPool,
        bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Result<Arc<Self>, MatchingError> {
        let registry = Arc::new(Self {
            pool,
            bus,
            config,
            markets: DashMap::new(),
        });
        let markets = ledger::live_markets(&registry.pool).await?;
        for market in &markets {
            registry.spawn_worker(market).await?;
        }
        tracing::info!("market registry recovered {} live markets", markets.len());
        Ok(registry)
    }

    /// Handle for a market, hosting it on demand if it was created since
    /// startup. Unknown and terminal markets are refused.
    pub async fn acquire(&self, market_id: Uuid) -> Result<MarketHandle, MatchingError> {
        if let Some(handle) = self.markets.get(&market_id) {
            return Ok(handle.clone());
        }
        let market = ledger::fetch_market(&self.pool, market_id)
            .await?
            .ok_or(MatchingError::UnknownMarket(market_id))?;
        if market.status.is_terminal() {
            return Err(MatchingError::MarketNotOpen(market_id));
        }
        self.spawn_worker(&market).await?;
        self.markets
            .get(&market_id)
            .map(|h| h.clone())
            .ok_or_else(|| MatchingError::Internal("market registration raced".into()))
    }

    pub fn hosted_markets(&self) -> Vec<Uuid> {
        self.markets.iter().map(|e| *e.key()).collect()
    }

    /// Close open markets whose close_time has passed. Runs forever; the
    /// transition itself goes through the market's writer like any admin
    /// close.
    pub fn spawn_close_scheduler(self: Arc<Self>, interval: std::time::Duration) {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let due: Vec<Uuid> = match sqlx::query_scalar(
                    "SELECT id FROM markets WHERE status = 'open' AND close_time IS NOT NULL AND close_time <= NOW()",
                )
                .fetch_all(&registry.pool)
                .await
                {
                    Ok(due) => due,
                    Err(e) => {
                        tracing::warn!("close scheduler query failed: {e}");
                        continue;
                    }
                };
                for market_id in due {
                    match registry.acquire(market_id).await {
                        Ok(handle) => match handle.close().await {
                            Ok(()) => tracing::info!(%market_id, "market closed on schedule"),
                            Err(e) => tracing::warn!(%market_id, "scheduled close failed: {e}"),
                        },
                        Err(e) => tracing::warn!(%market_id, "scheduled close skipped: {e}"),
                    }
                }
            }
        });
    }

    async fn spawn_worker(&self, market: &Market) -> Result<(), MatchingError> {
        let resting = ledger::resting_orders(&self.pool, market.id).await?;
        let (sender, rx) = mpsc::channel(self.config.command_buffer);
        let book = Arc::new(RwLock::new(Book::new(market.id)));
        let sequence = Arc::new(AtomicI64::new(0));

        let worker = MarketWorker::recover(
            market,
            &resting,
            self.pool.clone(),
            self.bus.clone(),
            self.config.clone(),
            rx,
            book.clone(),
            sequence.clone(),
        )?;
        tokio::spawn(worker.run());

        self.markets.insert(
            market.id,
            MarketHandle {
                market_id: market.id,
                sender,
                book,
                sequence,
                pool: self.pool.clone(),
            },
        );
        tracing::info!(
            market_id = %market.id,
            resting = resting.len(),
            sequence = market.last_sequence,
            "market writer hosted"
        );
        Ok(())
    }
}
