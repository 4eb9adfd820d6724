use eyre::Result;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

use apm_engine::adapters::binance::BinanceKlineFeed;
use apm_engine::adapters::database::Database;
use apm_engine::adapters::hermes::HermesFeed;
use apm_engine::adapters::relay::RelayClient;
use apm_engine::api;
use apm_engine::config::Config;
use apm_engine::domain::TickerUpdate;
use apm_engine::engine::BasketEngine;
use apm_engine::feeds::{TickerAggregator, TickerBook};
use apm_engine::service::Service;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "apm_engine=info,tower_http=info".into()),
        )
        .init();

    info!("🪙 APM basket engine starting up...");

    let config = Config::load()?;
    info!(
        "Config loaded. V0 ${:.2}, P0 ${:.4}, {} governance authorities",
        config.engine.valuation.initial_basket_value,
        config.engine.valuation.initial_token_price,
        config.engine.breaker.governance_authorities.len()
    );
    if config.engine.breaker.governance_authorities.is_empty() {
        warn!("GOVERNANCE_AUTHORITIES is empty, every admin breaker action will be rejected");
    }

    // Database
    let db = Database::new(&config.db_path).await?;
    info!("Database initialized at {}", config.db_path);

    let io_timeout = Duration::from_secs(config.service.io_timeout_secs);
    let feed = Arc::new(HermesFeed::new(&config.hermes_url, io_timeout)?);
    let relay = Arc::new(RelayClient::new(config.relay.clone(), io_timeout)?);
    let engine = BasketEngine::new(config.engine.clone())?;
    let shutdown = Arc::new(AtomicBool::new(false));

    // Kline stream: second price source and per-minute volume input
    let (ticker_tx, ticker_rx) = broadcast::channel::<TickerUpdate>(1024);
    let tickers = TickerBook::new();
    let binance_ws = BinanceKlineFeed::new(ticker_tx, config.binance_symbols.clone(), shutdown.clone());
    let aggregator = TickerAggregator::new(ticker_rx, tickers.clone());

    let service = Arc::new(
        Service::new(engine, feed, relay, config.service.clone(), config.relay.price_decimals)
            .with_database(db)
            .with_tickers(tickers)
            .with_shutdown(shutdown),
    );
    service.restore_baseline().await?;

    // --- Operator API ---
    let app_state = Arc::new(api::AppState {
        service: service.clone(),
        start_time: Instant::now(),
    });
    let app = api::router(app_state);
    let port = config.api_port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Operator API running on http://0.0.0.0:{}", port);

    // --- Spawn everything ---
    tokio::spawn(async move { binance_ws.run().await });
    tokio::spawn(async move { aggregator.run().await });
    tokio::spawn(service.clone().run_evaluation_loop());
    tokio::spawn(service.clone().run_swap_guard_loop());
    tokio::spawn(service.clone().run_health_loop());

    // Serve API + graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service))
        .await?;

    info!("🛑 Engine shutting down gracefully");
    Ok(())
}

async fn shutdown_signal(service: Arc<Service>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
    service.shutdown();
}
