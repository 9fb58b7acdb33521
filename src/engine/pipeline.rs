//! Trading pipeline.
//!
//! One tick: collect prices, forecast, map the direction to a trade,
//! validate against the strategy and history, submit, record. The final
//! validation, the submission and the history update happen under one
//! lock so two submissions can never both pass a limit meant for one.

use alloy::primitives::{Address, U256};
use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::submitter::TransactionSubmitter;
use super::validator::{RejectionReason, TradeValidator};
use crate::data::{CollectionWindow, PriceCollector};
use crate::ledger::{from_base_units, to_base_units, NATIVE_DECIMALS};
use crate::models::Forecaster;
use crate::storage;
use crate::types::{
    Direction, ExecutionResult, PredictionResult, PriceSeries, Strategy, TradeAction, TradeHistory,
    TradeHistoryEntry, TradeParams, TradeStatus, TradeType, TradingError,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Account that trades and whose balance sizes positions.
    pub user: Address,
    /// Wrapped native token used in swap paths.
    pub wrapped_native: Address,
    /// Token bought on an up signal and sold on a down signal.
    pub trade_token: Address,
    /// How the collected series quotes the pair.
    pub price_quote: PriceQuote,
    /// Decimals of `trade_token`.
    pub token_decimals: u32,
    /// Tolerated shortfall against the quoted output, in percent.
    pub slippage_pct: Decimal,
    pub sources: Vec<String>,
    pub window_hours: u32,
    /// JSON file the history is persisted to after each record.
    pub history_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Upstream failure (data, model, balance); nothing submitted.
    Skipped(String),
    /// Neutral forecast.
    NoSignal,
    Rejected(RejectionReason),
    /// Stopped between validation and submission.
    Cancelled(TradeHistoryEntry),
    Executed(TradeHistoryEntry),
    Failed(TradeHistoryEntry),
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickOutcome::Skipped(reason) => write!(f, "skipped: {reason}"),
            TickOutcome::NoSignal => write!(f, "no signal"),
            TickOutcome::Rejected(reason) => write!(f, "rejected: {reason}"),
            TickOutcome::Cancelled(e) => write!(f, "cancelled: {e}"),
            TickOutcome::Executed(e) => write!(f, "executed: {e}"),
            TickOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Quoting
// ---------------------------------------------------------------------------

/// Orientation of the collected price series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriceQuote {
    /// Native units per trade token: the series tracks the token.
    NativePerToken,
    /// Trade tokens per native unit: the series tracks the native asset,
    /// e.g. ETH priced in USDC.
    TokenPerNative,
}

impl PriceQuote {
    /// Trade tokens that `native` units buy at `price`.
    pub fn native_to_tokens(self, native: Decimal, price: Decimal) -> Decimal {
        match self {
            PriceQuote::NativePerToken => native / price,
            PriceQuote::TokenPerNative => native * price,
        }
    }

    /// Native units that `tokens` fetch at `price`.
    pub fn tokens_to_native(self, tokens: Decimal, price: Decimal) -> Decimal {
        match self {
            PriceQuote::NativePerToken => tokens * price,
            PriceQuote::TokenPerNative => tokens / price,
        }
    }

    /// Trade side for a forecast. Buying moves native into the trade token,
    /// which pays off when the token gains against native.
    pub fn action_for(self, direction: Direction) -> Option<TradeAction> {
        let token_gains = match (self, direction) {
            (_, Direction::Neutral) => return None,
            (PriceQuote::NativePerToken, d) => d == Direction::Up,
            (PriceQuote::TokenPerNative, d) => d == Direction::Down,
        };
        Some(if token_gains { TradeAction::Buy } else { TradeAction::Sell })
    }
}

fn price_decimal(price: f64) -> Result<Decimal, TradingError> {
    Decimal::from_f64(price)
        .filter(|p| *p > Decimal::ZERO)
        .ok_or_else(|| TradingError::ValidationFailure(format!("unusable price {price}")))
}

fn base_units(amount: Decimal, decimals: u32) -> Result<U256, TradingError> {
    to_base_units(amount, decimals).map_err(|e| TradingError::ValidationFailure(e.to_string()))
}

/// Build swap params for a position of `size` native units.
///
/// Buys spend `size` native and expect it converted at the predicted price.
/// Sells spend the trade tokens `size` native buys at the last price and
/// expect them converted back at the predicted price. The minimum output is
/// the expectation less the slippage tolerance, in the output asset's units.
pub fn quote_trade(
    action: TradeAction,
    size: Decimal,
    predicted_price: f64,
    last_price: f64,
    config: &PipelineConfig,
) -> Result<TradeParams, TradingError> {
    let quote = config.price_quote;
    let predicted = price_decimal(predicted_price)?;
    let last = price_decimal(last_price)?;
    let keep = (dec!(100) - config.slippage_pct).max(Decimal::ZERO) / dec!(100);
    let token = config.token_decimals;

    let params = match action {
        TradeAction::Buy => TradeParams::new(
            config.wrapped_native,
            config.trade_token,
            base_units(size, NATIVE_DECIMALS)?,
            base_units(quote.native_to_tokens(size, predicted) * keep, token)?,
            action.trade_type(),
        ),
        TradeAction::Sell => {
            let tokens = quote.native_to_tokens(size, last);
            TradeParams::new(
                config.trade_token,
                config.wrapped_native,
                base_units(tokens, token)?,
                base_units(quote.tokens_to_native(tokens, predicted) * keep, NATIVE_DECIMALS)?,
                action.trade_type(),
            )
        }
    };
    Ok(params)
}

/// History id and status for a submission result. A failure keeps the last
/// broadcast hash so the entry still counts against cooldown and exposure.
fn history_id(result: &ExecutionResult) -> (String, TradeStatus) {
    let status = if result.success {
        TradeStatus::Confirmed
    } else {
        TradeStatus::Failed
    };
    let id = result
        .tx_hash
        .clone()
        .unwrap_or_else(|| format!("failed-{}", uuid::Uuid::new_v4()));
    (id, status)
}


// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct TradingPipeline {
    config: PipelineConfig,
    collector: Arc<dyn PriceCollector>,
    forecaster: Arc<dyn Forecaster>,
    validator: TradeValidator,
    submitter: Arc<TransactionSubmitter>,
    history: RwLock<TradeHistory>,
    /// Held from final validation until the history is updated.
    submit_lock: Mutex<()>,
    /// Held for a whole tick so ticks never overlap.
    tick_lock: Mutex<()>,
}

impl TradingPipeline {
    pub fn new(
        config: PipelineConfig,
        collector: Arc<dyn PriceCollector>,
        forecaster: Arc<dyn Forecaster>,
        validator: TradeValidator,
        submitter: Arc<TransactionSubmitter>,
        history: TradeHistory,
    ) -> Self {
        Self {
            config,
            collector,
            forecaster,
            validator,
            submitter,
            history: RwLock::new(history),
            submit_lock: Mutex::new(()),
            tick_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Snapshot of the trade history.
    pub async fn history(&self) -> TradeHistory {
        self.history.read().await.clone()
    }

    /// Fetch the configured price window.
    pub async fn collect(&self) -> Result<PriceSeries, TradingError> {
        let window = CollectionWindow {
            hours: self.config.window_hours,
        };
        self.collector
            .collect(&self.config.sources, window)
            .await
            .map_err(|e| TradingError::Collector(e.to_string()))
    }

    /// Run one tick under `strategy`. `cancel` is checked just before
    /// submitting; a cancelled tick records a cancelled entry instead.
    pub async fn run_tick(&self, strategy: &Strategy, cancel: &CancellationToken) -> TickOutcome {
        let _tick = self.tick_lock.lock().await;

        let series = match self.collect().await {
            Ok(series) => series,
            Err(e) => return TickOutcome::Skipped(e.to_string()),
        };
        let last_price = match series.last_price() {
            Some(price) => price,
            None => return TickOutcome::Skipped("empty price series".to_string()),
        };

        let prediction = match self.forecaster.forecast(&series).await {
            Ok(p) => p,
            Err(e) => return TickOutcome::Skipped(e.to_string()),
        };

        let action = match self.config.price_quote.action_for(prediction.direction) {
            Some(action) => action,
            None => {
                debug!(price = prediction.price, "Neutral forecast, no trade");
                return TickOutcome::NoSignal;
            }
        };

        let portfolio = match self.submitter.portfolio_value(self.config.user).await {
            Ok(value) => value,
            Err(e) => return TickOutcome::Skipped(e.to_string()),
        };

        let _submit = self.submit_lock.lock().await;

        let decision = {
            let history = self.history.read().await;
            self.validator.evaluate(&prediction, strategy, &history, portfolio)
        };
        let size = match (decision.allow, decision.position_size, decision.rejection) {
            (true, Some(size), _) => size,
            (_, _, Some(reason)) => {
                warn!(strategy = %strategy.name, reason = %reason, "Trade rejected");
                return TickOutcome::Rejected(reason);
            }
            _ => return TickOutcome::Skipped(decision.reason),
        };

        if cancel.is_cancelled() {
            let entry = self.entry(
                format!("cancelled-{}", uuid::Uuid::new_v4()),
                action,
                size,
                &prediction,
                TradeStatus::Cancelled,
            );
            info!(action = %action, "Submission suppressed by stop");
            self.record(entry.clone()).await;
            return TickOutcome::Cancelled(entry);
        }

        let params = match quote_trade(action, size, prediction.price, last_price, &self.config) {
            Ok(params) => params,
            Err(e) => return TickOutcome::Skipped(e.to_string()),
        };

        let result = self.submitter.submit(&params, self.config.user).await;
        let entry = self.entry_for_result(&result, action, size, &prediction);
        self.record(entry.clone()).await;

        if result.success {
            TickOutcome::Executed(entry)
        } else {
            TickOutcome::Failed(entry)
        }
    }

    /// Submit caller-built params. When `strategy` is set, cooldown and
    /// hourly limits are enforced first. The attempt is recorded either way.
    pub async fn execute_trade(
        &self,
        params: &TradeParams,
        strategy: Option<&Strategy>,
        reference: Option<&PredictionResult>,
    ) -> ExecutionResult {
        let _submit = self.submit_lock.lock().await;

        if let Some(strategy) = strategy {
            let history = self.history.read().await;
            if let Err(reason) = self.validator.check_rate_limits(strategy, &history, Utc::now()) {
                let err = TradingError::ValidationFailure(reason.to_string());
                warn!(error = %err, "Manual trade rejected");
                return ExecutionResult::failed(err.to_string());
            }
        }

        let action = match params.trade_type {
            TradeType::NativeToToken => TradeAction::Buy,
            TradeType::TokenToNative | TradeType::TokenToToken => TradeAction::Sell,
        };
        let price = reference.map(|p| p.price).unwrap_or(0.0);
        let size = match action {
            TradeAction::Buy => {
                from_base_units(params.amount_in, NATIVE_DECIMALS).unwrap_or(Decimal::ZERO)
            }
            // Sells spend tokens; express the size in native units when a price is known.
            TradeAction::Sell => {
                let tokens = from_base_units(params.amount_in, self.config.token_decimals)
                    .unwrap_or(Decimal::ZERO);
                match price_decimal(price) {
                    Ok(p) => self.config.price_quote.tokens_to_native(tokens, p),
                    Err(_) => tokens,
                }
            }
        };

        let result = self.submitter.submit(params, self.config.user).await;

        let (id, status) = history_id(&result);
        let entry = TradeHistoryEntry {
            id,
            timestamp: Utc::now(),
            action,
            amount: size,
            price,
            status,
            confidence: reference.map(|p| p.confidence).unwrap_or(0.0),
        };
        self.record(entry).await;
        result
    }

    fn entry(
        &self,
        id: String,
        action: TradeAction,
        size: Decimal,
        prediction: &PredictionResult,
        status: TradeStatus,
    ) -> TradeHistoryEntry {
        TradeHistoryEntry {
            id,
            timestamp: Utc::now(),
            action,
            amount: size,
            price: prediction.price,
            status,
            confidence: prediction.confidence,
        }
    }

    fn entry_for_result(
        &self,
        result: &ExecutionResult,
        action: TradeAction,
        size: Decimal,
        prediction: &PredictionResult,
    ) -> TradeHistoryEntry {
        let (id, status) = history_id(result);
        self.entry(id, action, size, prediction, status)
    }

    async fn record(&self, entry: TradeHistoryEntry) {
        info!(
            id = %entry.id,
            action = %entry.action,
            amount = %entry.amount,
            status = %entry.status,
            "Trade recorded"
        );
        let mut history = self.history.write().await;
        history.push(entry);
        if let Some(path) = &self.config.history_path {
            if let Err(e) = storage::save_history(&history, Some(path)) {
                warn!(error = %e, "Failed to persist trade history");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
