use intraday_engine::application::actors::engine_registry::EngineRegistry;
use intraday_engine::application::actors::execution_engine::{
    EngineDeps, EngineSettings, OrderExecutionEngine,
};
use intraday_engine::application::actors::market_stream::{MarketDataStream, StreamConfig};
use intraday_engine::application::handlers;
use intraday_engine::config::EngineConfig;
use intraday_engine::domain::repositories::signal_source::ChannelSignalSource;
use intraday_engine::infrastructure::smartapi_client::{SmartApiClient, SmartApiConfig};
use intraday_engine::persistence::init_database;
use intraday_engine::persistence::repository::SqliteActivityStore;
use intraday_engine::rate_limit::{create_rate_limiter, RateLimiterConfig};
use intraday_engine::secrets::BrokerCredentials;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Status surface requests allowed per second
const STATUS_REQUESTS_PER_SECOND: u32 = 20;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intraday_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if dotenvy::dotenv().is_ok() {
        info!("Loaded environment from .env");
    }

    let config = EngineConfig::from_env();
    config.validate()?;
    let status_addr = config.status_socket_addr()?;
    info!("Intraday engine starting for account {}", config.account_id);

    let credentials = BrokerCredentials::from_env()?;
    let pool = init_database(&config.database_url).await?;

    let broker_limiter = create_rate_limiter(RateLimiterConfig {
        requests_per_second: config.broker_requests_per_second,
        burst: config.broker_requests_per_second,
    })?;
    let broker = Arc::new(SmartApiClient::new(
        SmartApiConfig {
            base_url: config.smartapi_base_url.clone(),
            timeout: config.http_timeout(),
        },
        credentials.clone(),
        broker_limiter,
    )?);

    let stream = MarketDataStream::new(
        StreamConfig::new(&config.smartstream_url),
        credentials.feed_credentials(),
    );

    // Strategies push signals into this channel
    let signals = Arc::new(ChannelSignalSource::new(config.tick_queue_capacity));

    let engine = OrderExecutionEngine::new(
        EngineSettings::from_config(&config),
        EngineDeps {
            broker,
            store: Arc::new(SqliteActivityStore::new(pool)),
            signals,
            stream,
        },
    );

    let registry = EngineRegistry::new();
    registry.register(engine).await?;

    let status_limiter = create_rate_limiter(RateLimiterConfig {
        requests_per_second: STATUS_REQUESTS_PER_SECOND,
        burst: STATUS_REQUESTS_PER_SECOND,
    })?;
    let app = handlers::router(registry.clone(), status_limiter);

    info!("Status surface listening on {}", status_addr);
    let listener = tokio::net::TcpListener::bind(status_addr).await?;
    let server = axum::serve(listener, app);

    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    info!("Engine started. Press Ctrl+C to stop.");
    server.with_graceful_shutdown(shutdown_signal).await?;

    info!("Server shutting down gracefully...");
    registry.shutdown_all().await;

    info!("Shutdown complete");
    Ok(())
}
