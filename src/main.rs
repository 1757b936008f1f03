use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use predix_backend::bus::redis::RedisMirror;
use predix_backend::bus::EventBus;
use predix_backend::config::AppConfig;
use predix_backend::db::Database;
use predix_backend::gateway::{self, GatewayState};
use predix_backend::metrics::init_metrics;
use predix_backend::services::auth::AuthService;
use predix_backend::services::exchange::ExchangeService;
use predix_backend::services::matching::MarketRegistry;
use predix_backend::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "predix_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting Predix exchange core v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.environment);

    let metrics_handle = init_metrics();

    // Initialize database and apply migrations
    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    tracing::info!("Database connected, schema up to date");

    // Broadcast bus
    let bus = Arc::new(EventBus::new(config.bus.capacity));

    // Auth collaborator (session resolution + starter-balance grants)
    let auth = Arc::new(AuthService::new(
        db.pool.clone(),
        config.engine.starter_balance,
    ));

    // Recover per-market writers: rebuild books from resting orders and
    // resume sequence counters
    let registry =
        MarketRegistry::recover(db.pool.clone(), bus.clone(), config.engine_config()).await?;
    tracing::info!(
        "Matching engine recovered; hosting {} markets",
        registry.hosted_markets().len()
    );

    // Time-based OPEN -> CLOSED transitions
    registry
        .clone()
        .spawn_close_scheduler(std::time::Duration::from_secs(30));

    // In-process command surface for ingress collaborators
    let exchange = Arc::new(ExchangeService::new(
        db.pool.clone(),
        registry.clone(),
        auth.clone(),
        config.engine.submit_ceiling_per_min,
    ));

    // Optional Redis mirror so external subscriber processes get the feed
    match &config.redis_url {
        Some(redis_url) => match RedisMirror::connect(redis_url).await {
            Ok(mirror) => {
                Arc::new(mirror).spawn(bus.clone(), db.pool.clone());
                tracing::info!("Redis mirror publishing to {}", redis_url);
            }
            Err(e) => {
                tracing::warn!("Redis unavailable, running without mirror: {}", e);
            }
        },
        None => tracing::info!("No redis_url configured, running without mirror"),
    }

    // Subscriber gateway
    let gateway_state = Arc::new(GatewayState {
        bus: bus.clone(),
        auth: auth.clone(),
        config: config.gateway_config(),
    });

    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        bus,
        auth,
        registry,
        exchange,
    });

    // Build router: health, metrics, and the websocket gateway. HTTP order
    // ingress is a separate collaborator that mounts on this state.
    let app = Router::new()
        .route("/health", get(health_check))
        .route(
            "/metrics",
            get(move || {
                let handle = metrics_handle.clone();
                async move { handle.render() }
            }),
        )
        .nest(
            "/ws",
            gateway::routes::create_router(gateway_state.clone()).with_state(gateway_state),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}
