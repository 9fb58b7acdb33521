//! SENTINEL: AI-gated on-chain trade execution engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the trade history, trains the ensemble and runs the
//! auto-trading scheduler until Ctrl+C.

use alloy::primitives::Address;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sentinel::config::{self, AppConfig, CollectorProvider};
use sentinel::data::coingecko::CoinGeckoCollector;
use sentinel::data::{PriceCollector, StaticCollector};
use sentinel::engine::pipeline::{PipelineConfig, TradingPipeline};
use sentinel::engine::submitter::TransactionSubmitter;
use sentinel::engine::validator::TradeValidator;
use sentinel::engine::TradingSystem;
use sentinel::ledger::confirmation::ConfirmationTracker;
use sentinel::ledger::gas::GasPriceOracle;
use sentinel::ledger::rpc::ProviderLedger;
use sentinel::ledger::LedgerRpc;
use sentinel::models::ensemble::EnsemblePredictor;
use sentinel::storage;
use sentinel::types::{TradeHistory, TradingError};

const BANNER: &str = r#"
  ____  _____ _   _ _____ ___ _   _ _____ _
 / ___|| ____| \ | |_   _|_ _| \ | | ____| |
 \___ \|  _| |  \| | | |  | ||  \| |  _| | |
  ___) | |___| |\  | | |  | || |\  | |___| |___
 |____/|_____|_| \_| |_| |___|_| \_|_____|_____|

  AI-gated on-chain trade execution
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("SENTINEL_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    let strategy = cfg.strategy.resolve()?;
    info!(
        agent_name = %cfg.agent.name,
        tick_interval_secs = cfg.agent.tick_interval_secs,
        strategy = %strategy,
        dry_run = cfg.submitter.dry_run,
        "SENTINEL starting up"
    );

    // -- Ledger ----------------------------------------------------------

    let contract = config::parse_address("ledger.contract_address", &cfg.ledger.contract_address)?;
    let wrapped_native =
        config::parse_address("ledger.wrapped_native", &cfg.ledger.wrapped_native)?;
    let trade_token = config::parse_address("ledger.trade_token", &cfg.ledger.trade_token)?;

    let rpc_url = AppConfig::resolve_secret(&cfg.ledger.rpc_url_env)?;
    let signer_key = AppConfig::resolve_secret(&cfg.ledger.signer_key_env)?;
    let ledger = ProviderLedger::connect(&rpc_url, &signer_key, cfg.ledger.chain_id)?;
    let user = resolve_user(&cfg.agent.user_address, ledger.signer_address())?;
    info!(user = %user, "Signing wallet loaded");
    let rpc: Arc<dyn LedgerRpc> = Arc::new(ledger);

    let oracle = Arc::new(GasPriceOracle::new(rpc.clone(), cfg.gas.clone()));
    let tracker = ConfirmationTracker::new(rpc.clone())
        .with_poll_interval(Duration::from_secs(cfg.ledger.poll_interval_secs.max(1)));
    let submitter = Arc::new(TransactionSubmitter::new(
        rpc.clone(),
        oracle,
        tracker,
        contract,
        cfg.submitter.clone(),
    ));

    // -- Data + models ---------------------------------------------------

    let collector = build_collector(&cfg)?;
    let ensemble = Arc::new(EnsemblePredictor::new(
        cfg.ensemble.clone(),
        cfg.sequence_model.clone(),
        cfg.policy_agent.clone(),
        collector.clone(),
    ));

    match ensemble.retrain().await {
        Ok(()) => info!("Initial training complete"),
        Err(e) => warn!(
            error = %e,
            "Initial training failed; ticks will skip until a retrain succeeds"
        ),
    }

    // -- History + pipeline ----------------------------------------------

    let history_path = cfg.agent.history_file.clone();
    let history = match storage::load_history(history_path.as_deref())? {
        Some(h) => {
            info!(entries = h.len(), "Resumed trade history");
            h
        }
        None => TradeHistory::new(),
    };

    let pipeline = Arc::new(TradingPipeline::new(
        PipelineConfig {
            user,
            wrapped_native,
            trade_token,
            price_quote: cfg.ledger.price_quote,
            token_decimals: cfg.ledger.token_decimals,
            slippage_pct: cfg.ledger.slippage_pct,
            sources: cfg.ensemble.sources.clone(),
            window_hours: cfg.ensemble.window_hours,
            history_path: Some(
                history_path
                    .clone()
                    .unwrap_or_else(|| storage::DEFAULT_HISTORY_FILE.to_string()),
            ),
        },
        collector,
        ensemble.clone(),
        TradeValidator::new(cfg.validator.clone()),
        submitter,
        history,
    ));

    let system = Arc::new(TradingSystem::new(
        ensemble,
        pipeline,
        Duration::from_secs(cfg.agent.tick_interval_secs.max(1)),
    ));

    let shutdown = CancellationToken::new();
    let retrainer = (cfg.agent.retrain_interval_hours > 0).then(|| {
        tokio::spawn(retrain_loop(
            system.clone(),
            Duration::from_secs(cfg.agent.retrain_interval_hours * 3600),
            shutdown.clone(),
        ))
    });

    if cfg.agent.auto_start {
        system.start_auto_trading(strategy).await?;
    } else {
        info!("auto_start disabled; scheduler left stopped");
    }

    info!("Running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received.");

    shutdown.cancel();
    system.shutdown().await;
    if let Some(task) = retrainer {
        if let Err(e) = task.await {
            error!(error = %e, "Retrain task ended abnormally");
        }
    }

    let history = system.history().await;
    storage::save_history(&history, history_path.as_deref())?;
    let state = system.system_state().await;
    info!(
        trades = history.len(),
        predictions = state.total_predictions,
        accuracy = format!("{:.3}", state.average_accuracy),
        "SENTINEL shut down cleanly."
    );

    Ok(())
}

/// The trading account is the signer unless configured; a configured
/// address must match the signer, since the wallet cannot sign for others.
fn resolve_user(configured: &str, signer: Address) -> Result<Address> {
    if configured.trim().is_empty() {
        return Ok(signer);
    }
    let user = config::parse_address("agent.user_address", configured)?;
    anyhow::ensure!(
        user == signer,
        "agent.user_address {user} does not match the signing key ({signer})"
    );
    Ok(user)
}

fn build_collector(cfg: &AppConfig) -> Result<Arc<dyn PriceCollector>> {
    match cfg.collector.provider {
        CollectorProvider::Coingecko => {
            let api_key = match &cfg.collector.api_key_env {
                Some(env) => match AppConfig::resolve_secret(env) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!(error = %e, "CoinGecko key not set, using the public tier");
                        None
                    }
                },
                None => None,
            };
            let mut collector = CoinGeckoCollector::new(&cfg.collector.vs_currency, api_key)?;
            if let Some(url) = &cfg.collector.base_url {
                collector = collector.with_base_url(url);
            }
            Ok(Arc::new(collector))
        }
        CollectorProvider::File => {
            let path = cfg
                .collector
                .replay_file
                .as_deref()
                .context("collector.replay_file is required for the file provider")?;
            Ok(Arc::new(StaticCollector::from_file(path)?))
        }
    }
}

/// Retrain on a fixed period until cancelled. Failures keep the current
/// models serving.
async fn retrain_loop(system: Arc<TradingSystem>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    // The first tick fires immediately; startup already trained.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => match system.retrain().await {
                Ok(()) => {
                    let state = system.system_state().await;
                    info!(
                        predictions = state.total_predictions,
                        accuracy = format!("{:.3}", state.average_accuracy),
                        "Periodic retrain complete"
                    );
                }
                Err(TradingError::RetrainInProgress) => {
                    warn!("Retrain already in progress, skipping")
                }
                Err(e) => error!(error = %e, "Periodic retrain failed"),
            },
        }
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sentinel=info"));

    if std::env::var("SENTINEL_LOG_JSON").is_ok() {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
