//! Redis Mirror
//!
//! Mirrors every bus envelope onto Redis pub/sub channels of the same name
//! so subscriber processes outside this one can serve live feeds. Redis
//! being down never blocks the core: publishes fail soft, the market is
//! marked dirty, and a background reconciler ships the missed events from
//! the order-event log.

use dashmap::{DashMap, DashSet};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::metrics::names;

use super::{envelopes_from_log, Envelope, EventBus};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

pub struct RedisMirror {
    manager: ConnectionManager,
    /// Highest market sequence successfully mirrored, per market.
    mirrored: DashMap<Uuid, i64>,
    /// Markets with a failed publish awaiting log replay.
    dirty: DashSet<Uuid>,
}

impl RedisMirror {
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            mirrored: DashMap::new(),
            dirty: DashSet::new(),
        })
    }

    /// Forward the firehose to Redis and run the reconciler. Consumes a
    /// fresh bus subscription; lagging just means the reconciler catches up
    /// from the log.
    pub fn spawn(self: Arc<Self>, bus: Arc<EventBus>, pool: PgPool) {
        let forward = self.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            tracing::info!("redis mirror started");
            loop {
                match rx.recv().await {
                    Ok(envelope) => forward.publish(&envelope).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("redis mirror lagged {n} envelopes, marking all dirty");
                        for entry in forward.mirrored.iter() {
                            forward.dirty.insert(*entry.key());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("event bus closed, redis mirror stopping");
                        break;
                    }
                }
            }
        });

        let reconciler = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
            loop {
                interval.tick().await;
                reconciler.reconcile(&pool).await;
            }
        });
    }

    async fn publish(&self, envelope: &Envelope) {
        let payload = match serde_json::to_string(envelope) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("unserializable envelope dropped: {e}");
                return;
            }
        };
        let mut conn = self.manager.clone();
        match conn.publish::<_, _, i64>(&envelope.channel, payload).await {
            Ok(_) => {
                if let Some(market_id) = envelope.market_id {
                    self.mirrored
                        .entry(market_id)
                        .and_modify(|s| *s = (*s).max(envelope.sequence))
                        .or_insert(envelope.sequence);
                }
                metrics::counter!(names::BUS_REDIS_PUBLISHED_TOTAL).increment(1);
            }
            Err(e) => {
                tracing::warn!(channel = %envelope.channel, "redis publish failed: {e}");
                if let Some(market_id) = envelope.market_id {
                    self.dirty.insert(market_id);
                }
                metrics::counter!(names::BUS_REDIS_FAILURES_TOTAL).increment(1);
            }
        }
    }

    /// Replay missed events for dirty markets from the order-event log. The
    /// commit already stood; this only closes the broadcast gap.
    async fn reconcile(&self, pool: &PgPool) {
        let markets: Vec<Uuid> = self.dirty.iter().map(|m| *m).collect();
        for market_id in markets {
            let from = self.mirrored.get(&market_id).map(|s| *s).unwrap_or(0);
            let envelopes = match envelopes_from_log(pool, market_id, from).await {
                Ok(envelopes) => envelopes,
                Err(e) => {
                    tracing::warn!(%market_id, "reconcile read failed: {e}");
                    continue;
                }
            };
            let mut all_ok = true;
            for envelope in &envelopes {
                let payload = match serde_json::to_string(envelope) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let mut conn = self.manager.clone();
                if let Err(e) = conn
                    .publish::<_, _, i64>(&envelope.channel, payload)
                    .await
                {
                    tracing::warn!(%market_id, "reconcile publish failed: {e}");
                    all_ok = false;
                    break;
                }
                self.mirrored
                    .entry(market_id)
                    .and_modify(|s| *s = (*s).max(envelope.sequence))
                    .or_insert(envelope.sequence);
            }
            if all_ok {
                self.dirty.remove(&market_id);
                if !envelopes.is_empty() {
                    tracing::info!(
                        %market_id,
                        replayed = envelopes.len(),
                        "redis mirror reconciled"
                    );
                }
            }
        }
    }
}
