// =============================================================================
// Meridian Perp Engine — Main Entry Point
// =============================================================================
//
// The engine starts in Demo mode unless the config explicitly says otherwise.
// Exit codes: 0 clean shutdown, 1 fatal before startup completed, 2 the
// worker died after startup.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analyzers;
mod clock;
mod config;
mod data;
mod engine;
mod entry;
mod error;
mod exchange;
mod exit;
mod filters;
mod gate;
mod indicators;
mod lifecycle;
mod notify;
mod orchestrator;
mod queue;
mod repository;
mod risk;
mod session;
mod trend;
mod types;

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::analyzers::AnalyzerRegistry;
use crate::clock::{SharedClock, SystemClock};
use crate::config::{EngineConfig, ExchangeName};
use crate::data::{CandleProvider, TimeframeProvider};
use crate::engine::{run_action_worker, run_event_loop, EngineEvent, ShutdownCoordinator};
use crate::entry::EntryOrchestrator;
use crate::exchange::binance::BinanceExchange;
use crate::exchange::bybit::BybitExchange;
use crate::exchange::paper::PaperExchange;
use crate::exchange::{stream, Exchange};
use crate::exit::ExitOrchestrator;
use crate::filters::FilterChain;
use crate::gate::SnapshotGate;
use crate::indicators::{IndicatorCache, PreCalculator};
use crate::lifecycle::{PositionClosedSink, PositionLifecycle};
use crate::notify::{LogNotifier, NotificationEvent, Notifier};
use crate::orchestrator::TradingOrchestrator;
use crate::queue::{ActionQueue, ActionType, HandlerRegistry};
use crate::repository::{JournalRepository, MarketDataRepository, PositionRepository};
use crate::risk::RiskManager;
use crate::session::SessionTracker;
use crate::types::TimeframeRole;

/// Default simulated balance when demo mode has no funded account behind it.
const DEMO_STARTING_BALANCE: f64 = 10_000.0;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Meridian Perp Engine — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal error before startup completed");
            ExitCode::from(1)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    // ── 1. Configuration ─────────────────────────────────────────────────
    let config = EngineConfig::load("meridian_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    let symbol = config.exchange.symbol.clone();
    let clock: SharedClock = Arc::new(SystemClock);

    info!(
        exchange = %config.exchange.name,
        symbol = %symbol,
        demo = config.exchange.demo,
        testnet = config.exchange.testnet,
        "engine configuration resolved"
    );

    // ── 2. Exchange ──────────────────────────────────────────────────────
    let api_key = std::env::var("MERIDIAN_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("MERIDIAN_API_SECRET").unwrap_or_default();
    if !config.exchange.demo && (api_key.is_empty() || api_secret.is_empty()) {
        anyhow::bail!("live mode requires MERIDIAN_API_KEY and MERIDIAN_API_SECRET");
    }

    let venue: Arc<dyn Exchange> = match config.exchange.name {
        ExchangeName::Bybit => Arc::new(BybitExchange::new(
            api_key.clone(),
            api_secret.clone(),
            config.exchange.testnet,
            config.exchange.request_timeout_seconds,
            clock.clone(),
        )),
        ExchangeName::Binance => Arc::new(BinanceExchange::new(
            api_key.clone(),
            api_secret.clone(),
            config.exchange.testnet,
            config.exchange.request_timeout_seconds,
            clock.clone(),
        )),
    };

    let exchange: Arc<dyn Exchange> = if config.exchange.demo {
        info!("demo mode — orders are simulated, market data is live");
        Arc::new(PaperExchange::wrapping(
            venue.clone(),
            clock.clone(),
            DEMO_STARTING_BALANCE,
        ))
    } else {
        venue.clone()
    };

    exchange.connect().await.map_err(|e| {
        anyhow::anyhow!("exchange connect failed ({}): {e}", config.exchange.name)
    })?;

    // ── 3. Repositories & data plane ─────────────────────────────────────
    let repository = Arc::new(MarketDataRepository::new(clock.clone()));
    let positions = Arc::new(PositionRepository::new());
    let journal = Arc::new(JournalRepository::open("data"));
    let cache = Arc::new(IndicatorCache::new(repository.clone()));

    let timeframes = TimeframeProvider::from_config(&config);
    let provider = Arc::new(CandleProvider::new(
        exchange.clone(),
        repository.clone(),
        timeframes.clone(),
        symbol.clone(),
        clock.clone(),
    ));

    let mut precalc = PreCalculator::new(repository.clone(), cache.clone(), symbol.clone());
    register_default_calculators(&mut precalc, &timeframes);
    let precalc = Arc::new(precalc);

    // ── 4. Pipeline ──────────────────────────────────────────────────────
    let registry = AnalyzerRegistry::from_config(
        &config.analyzers,
        &HashMap::new(),
        config.risk_management.clone(),
    );
    let filters = FilterChain::from_config(&config.filters);
    let risk = Arc::new(RiskManager::new(
        config.risk_manager.clone(),
        journal.clone(),
        clock.clone(),
    ));
    let entry = EntryOrchestrator::new(config.weight_matrix.min_confidence_to_enter, risk);
    let exit = ExitOrchestrator::new(
        config.risk_management.trailing_stop_percent,
        config.risk_management.breakeven_offset_percent,
    );
    let gate = Arc::new(SnapshotGate::new(clock.clone(), config.mtf_snapshot.ttl_ms));
    let queue = Arc::new(ActionQueue::new(clock.clone()));

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let session = Arc::new(SessionTracker::new(journal.clone(), clock.clone()));
    let closed_sinks: Vec<Arc<dyn PositionClosedSink>> = vec![session.clone()];

    let lifecycle = Arc::new(PositionLifecycle::new(
        exchange.clone(),
        positions.clone(),
        journal.clone(),
        notifier.clone(),
        closed_sinks,
        clock.clone(),
        symbol.clone(),
        config.risk_management.take_profits.clone(),
    ));

    let mut handlers = HandlerRegistry::new();
    for action_type in [
        ActionType::OpenPosition,
        ActionType::ClosePercent,
        ActionType::UpdateStopLoss,
        ActionType::ActivateTrailing,
    ] {
        handlers.register(action_type, lifecycle.clone());
    }
    let handlers = Arc::new(handlers);

    let orchestrator = Arc::new(TradingOrchestrator::new(
        provider.clone(),
        precalc,
        registry,
        filters,
        entry,
        exit,
        gate,
        positions.clone(),
        repository,
        queue.clone(),
        lifecycle.clone(),
        exchange.clone(),
        timeframes.clone(),
        symbol.clone(),
        config.exchange.leverage,
        clock.clone(),
    ));

    // ── 5. Initial data load ─────────────────────────────────────────────
    provider.initialize().await;
    if let Err(e) = exchange
        .set_leverage(&symbol, config.exchange.leverage)
        .await
    {
        warn!(error = %e, "initial set_leverage failed — continuing");
    }

    notifier.notify(&NotificationEvent::EngineStarted {
        symbol: symbol.clone(),
        exchange: config.exchange.name.to_string(),
        demo: config.exchange.demo,
    });

    // ── 6. Streams ───────────────────────────────────────────────────────
    let (tx, rx) = mpsc::channel::<EngineEvent>(256);
    spawn_streams(&config, &symbol, &timeframes, &api_key, &api_secret, &tx);

    // ── 7. Workers ───────────────────────────────────────────────────────
    let worker = tokio::spawn(run_action_worker(queue.clone(), handlers.clone()));
    let event_loop = tokio::spawn(run_event_loop(orchestrator, rx));

    info!("all subsystems running — waiting for shutdown signal");

    // ── 8. Graceful shutdown on SIGINT / SIGTERM ─────────────────────────
    let coordinator = ShutdownCoordinator::new(
        queue,
        handlers,
        exchange,
        lifecycle,
        positions,
        session,
        notifier,
        config.graceful_shutdown.clone(),
        symbol,
    );

    let signal_name = wait_for_signal().await;
    warn!(signal = signal_name, "shutdown signal received");

    if config.graceful_shutdown.enabled {
        coordinator.execute(signal_name).await;
    }
    let _ = tx.send(EngineEvent::Shutdown).await;

    let mut exit_code = ExitCode::from(0);
    let drain_budget = std::time::Duration::from_secs(5);
    if let Ok(joined) = tokio::time::timeout(drain_budget, event_loop).await {
        if joined.is_err() {
            error!("event loop terminated abnormally");
            exit_code = ExitCode::from(2);
        }
    } else {
        warn!("event loop did not stop inside the drain budget");
    }
    worker.abort();

    info!("Meridian Perp Engine shut down complete");
    Ok(exit_code)
}

/// Default pre-warmed indicator set: RSI and ATR on the decision timeframe,
/// the trend EMA on HTF1.
fn register_default_calculators(precalc: &mut PreCalculator, timeframes: &TimeframeProvider) {
    let primary = timeframes.interval(TimeframeRole::Primary).to_string();
    let htf1 = timeframes.interval(TimeframeRole::Htf1).to_string();

    precalc.register(
        "RSI",
        14,
        TimeframeRole::Primary,
        primary.clone(),
        indicators::rsi_calculator(14),
    );
    precalc.register(
        "ATR",
        14,
        TimeframeRole::Primary,
        primary,
        indicators::atr_calculator(14),
    );
    precalc.register(
        "EMA",
        21,
        TimeframeRole::Htf1,
        htf1,
        indicators::ema_calculator(21),
    );
}

/// Spawn the exchange-appropriate stream tasks, each with a 5-second
/// reconnect loop.
fn spawn_streams(
    config: &EngineConfig,
    symbol: &str,
    timeframes: &TimeframeProvider,
    api_key: &str,
    api_secret: &str,
    tx: &mpsc::Sender<EngineEvent>,
) {
    match config.exchange.name {
        ExchangeName::Bybit => {
            let subscriptions = timeframes.subscriptions();
            let sym = symbol.to_string();
            let tx_market = tx.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) =
                        stream::run_market_stream(&sym, &subscriptions, tx_market.clone()).await
                    {
                        error!(symbol = %sym, error = %e, "market stream error — reconnecting in 5s");
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            });

            if !config.exchange.demo && !api_key.is_empty() {
                let key = api_key.to_string();
                let secret = api_secret.to_string();
                let tx_exec = tx.clone();
                tokio::spawn(async move {
                    loop {
                        if let Err(e) =
                            stream::run_execution_stream(&key, &secret, tx_exec.clone()).await
                        {
                            error!(error = %e, "execution stream error — reconnecting in 5s");
                        }
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                });
            }
        }
        ExchangeName::Binance => {
            for (role, interval) in timeframes.subscriptions() {
                let sym = symbol.to_string();
                let tx_kline = tx.clone();
                tokio::spawn(async move {
                    loop {
                        if let Err(e) =
                            stream::run_binance_kline_stream(&sym, role, &interval, tx_kline.clone())
                                .await
                        {
                            error!(
                                symbol = %sym,
                                interval = %interval,
                                error = %e,
                                "kline stream error — reconnecting in 5s"
                            );
                        }
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                });
            }

            let sym = symbol.to_string();
            let tx_depth = tx.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = stream::run_binance_depth_stream(&sym, tx_depth.clone()).await {
                        error!(symbol = %sym, error = %e, "depth stream error — reconnecting in 5s");
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            });
        }
    }
}

/// Block until SIGINT or SIGTERM arrives; both trigger the same shutdown.
async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
