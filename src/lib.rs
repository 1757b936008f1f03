//! Predix - Binary Prediction Market Exchange Core
//!
//! A CLOB matching engine for binary (YES/NO) markets with escrow-backed
//! settlement and a real-time broadcast fabric. The crate exposes an
//! in-process service surface ([`services::exchange::ExchangeService`]) for
//! ingress collaborators and hosts the subscriber gateway itself.

pub mod bus;
pub mod config;
pub mod db;
pub mod gateway;
pub mod metrics;
pub mod models;
pub mod services;

use std::sync::Arc;

use bus::EventBus;
use config::AppConfig;
use db::Database;
use services::auth::AuthService;
use services::exchange::ExchangeService;
use services::matching::MarketRegistry;

/// Everything a collaborator in this process needs to drive the core.
pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub bus: Arc<EventBus>,
    pub auth: Arc<AuthService>,
    pub registry: Arc<MarketRegistry>,
    pub exchange: Arc<ExchangeService>,
}
