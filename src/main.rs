use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seat_reservation::{
    AppState,
    cache::ReservationCache,
    config::{Config, LogFormat},
    controllers,
    database::Database,
    redis_client::RedisClient,
    services::ExpirySweeper,
    storage::PgStorage,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::new(&config.app.rust_log);
    let registry = tracing_subscriber::registry().with(filter);
    match config.app.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(&config);

    info!("Starting Seat Reservation API ({})", config.app.environment);

    // Connect to the database
    let db = Database::connect(&config.database)
        .await
        .context("failed to connect to database")?;
    info!("Database connected");

    db.migrate().await.context("failed to run migrations")?;

    // Redis нужен только для кеша - без него сервис работает
    let cache = match &config.redis.url {
        Some(url) => match RedisClient::new(url).await {
            Ok(redis) => {
                info!("Redis connected");
                Some(ReservationCache::new(
                    redis,
                    std::time::Duration::from_secs(config.redis.cache_ttl_seconds),
                ))
            }
            Err(e) => {
                warn!("Redis unavailable, reservation cache disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let storage = Arc::new(PgStorage::new(db, config.database.lock_timeout()));
    let app_state = AppState::new(storage, cache);

    // --- Start background tasks ---

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = ExpirySweeper::new(
        app_state.reservations.clone(),
        config.reservations.hold_ttl(),
        config.reservations.sweep_interval(),
    )
    .spawn(shutdown_rx);

    // --- Start the web server ---

    let app = controllers::app(app_state.clone()).layer(TraceLayer::new_for_http());

    let host: std::net::IpAddr = config
        .app
        .host
        .parse()
        .context("HOST must be an IP address")?;
    let addr = SocketAddr::new(host, config.app.port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Сначала останавливаем источники событий, потом очередь
    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        warn!("Expiry sweeper task failed: {}", e);
    }

    let outcome = app_state
        .reservations
        .notifications()
        .shutdown(config.reservations.notification_shutdown_grace())
        .await;
    info!("Notification dispatcher stopped: {:?}", outcome);

    Ok(())
}
