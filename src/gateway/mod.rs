//! Subscriber Gateway
//!
//! Long-lived WebSocket connections that subscribe to broadcast-bus
//! channels on behalf of authenticated sessions.

pub mod handler;
pub mod rate_limit;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use crate::bus::EventBus;
use crate::services::auth::AuthService;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub idle_timeout: Duration,
    pub outbound_buffer: usize,
    pub churn_ceiling_per_min: u32,
    pub message_ceiling_per_min: u32,
}

pub struct GatewayState {
    pub bus: Arc<EventBus>,
    pub auth: Arc<AuthService>,
    pub config: GatewayConfig,
}
