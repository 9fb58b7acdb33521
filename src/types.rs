//! Shared types for the SENTINEL engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that model, ledger, and engine
//! modules can depend on them without circular references.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Upper bound for every confidence score produced by the models.
pub const MAX_CONFIDENCE: f64 = 0.95;

/// Seconds added to "now" when building a trade deadline.
pub const DEADLINE_WINDOW_SECS: u64 = 1200;

/// Trade history keeps only the most recent entries.
pub const TRADE_HISTORY_CAP: usize = 100;

// ---------------------------------------------------------------------------
// Price series
// ---------------------------------------------------------------------------

/// A single observed price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

/// Ordered price samples with strictly increasing timestamps.
///
/// Constructed once and never mutated; components that need a different
/// window build a new series.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceSeries {
    points: Vec<PricePoint>,
}

impl PriceSeries {
    /// Build a series, rejecting out-of-order timestamps and non-finite prices.
    pub fn new(points: Vec<PricePoint>) -> Result<Self, TradingError> {
        for pair in points.windows(2) {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(TradingError::InvalidSeries(format!(
                    "timestamps not strictly increasing at {}",
                    pair[1].timestamp
                )));
            }
        }
        if let Some(bad) = points.iter().find(|p| !p.price.is_finite() || p.price <= 0.0) {
            return Err(TradingError::InvalidSeries(format!(
                "invalid price {} at {}",
                bad.price, bad.timestamp
            )));
        }
        Ok(Self { points })
    }

    /// Build a series from bare prices spaced `step` apart, starting at `start`.
    pub fn from_prices(
        start: DateTime<Utc>,
        step: Duration,
        prices: &[f64],
    ) -> Result<Self, TradingError> {
        let points = prices
            .iter()
            .enumerate()
            .map(|(i, &price)| PricePoint {
                timestamp: start + step * i as i32,
                price,
            })
            .collect();
        Self::new(points)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    /// Price values only, oldest first.
    pub fn prices(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.price).collect()
    }

    pub fn last(&self) -> Option<&PricePoint> {
        self.points.last()
    }

    pub fn last_price(&self) -> Option<f64> {
        self.points.last().map(|p| p.price)
    }

    /// The most recent `n` prices (fewer if the series is shorter).
    pub fn tail_prices(&self, n: usize) -> Vec<f64> {
        let start = self.points.len().saturating_sub(n);
        self.points[start..].iter().map(|p| p.price).collect()
    }

    /// First point observed strictly after `timestamp`.
    pub fn first_after(&self, timestamp: DateTime<Utc>) -> Option<&PricePoint> {
        self.points.iter().find(|p| p.timestamp > timestamp)
    }
}

// ---------------------------------------------------------------------------
// Predictions
// ---------------------------------------------------------------------------

/// Forecast direction relative to the last observed price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Neutral,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
            Direction::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Which model produced a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Sequence,
    Policy,
    Ensemble,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelType::Sequence => write!(f, "sequence"),
            ModelType::Policy => write!(f, "policy"),
            ModelType::Ensemble => write!(f, "ensemble"),
        }
    }
}

/// A single-step forecast. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub price: f64,
    pub direction: Direction,
    /// Confidence in [0, MAX_CONFIDENCE].
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub model_type: ModelType,
    /// Most recent prices the forecast was made from, oldest first.
    pub features: Vec<f64>,
}

impl fmt::Display for PredictionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} → {:.4} (conf {:.0}%)",
            self.model_type,
            self.direction,
            self.price,
            self.confidence * 100.0,
        )
    }
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

/// The three call shapes the trading contract accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeType {
    NativeToToken,
    TokenToNative,
    TokenToToken,
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeType::NativeToToken => write!(f, "NATIVE_TO_TOKEN"),
            TradeType::TokenToNative => write!(f, "TOKEN_TO_NATIVE"),
            TradeType::TokenToToken => write!(f, "TOKEN_TO_TOKEN"),
        }
    }
}

/// Parameters of one trade attempt. Built fresh for every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeParams {
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub amount_out_min: U256,
    /// Unix seconds after which the contract rejects the call.
    pub deadline: u64,
    pub trade_type: TradeType,
}

impl TradeParams {
    /// Build params with a deadline `DEADLINE_WINDOW_SECS` from now.
    pub fn new(
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        amount_out_min: U256,
        trade_type: TradeType,
    ) -> Self {
        Self {
            token_in,
            token_out,
            amount_in,
            amount_out_min,
            deadline: Utc::now().timestamp().max(0) as u64 + DEADLINE_WINDOW_SECS,
            trade_type,
        }
    }

    /// Whether the deadline has already passed at `now_unix`.
    pub fn is_expired_at(&self, now_unix: u64) -> bool {
        self.deadline <= now_unix
    }
}

/// Side of a recorded trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn trade_type(&self) -> TradeType {
        match self {
            TradeAction::Buy => TradeType::NativeToToken,
            TradeAction::Sell => TradeType::TokenToNative,
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeAction::Buy => write!(f, "BUY"),
            TradeAction::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Confirmed,
    Failed,
    Cancelled,
}


impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeStatus::Pending => write!(f, "pending"),
            TradeStatus::Confirmed => write!(f, "confirmed"),
            TradeStatus::Failed => write!(f, "failed"),
            TradeStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One recorded trade attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeHistoryEntry {
    /// Transaction hash, or a synthetic id when nothing was sent.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: TradeAction,
    /// Position size in native units.
    pub amount: Decimal,
    pub price: f64,
    pub status: TradeStatus,
    pub confidence: f64,
}

impl TradeHistoryEntry {
    /// Whether the id is a transaction hash, i.e. something was broadcast.
    pub fn was_broadcast(&self) -> bool {
        self.id.starts_with("0x")
    }

    /// Whether the trade landed or may still land. A failed entry that
    /// carries a hash may have timed out while the transaction was pending.
    pub fn may_have_landed(&self) -> bool {
        match self.status {
            TradeStatus::Pending | TradeStatus::Confirmed => true,
            TradeStatus::Failed => self.was_broadcast(),
            TradeStatus::Cancelled => false,
        }
    }
}

impl fmt::Display for TradeHistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @ {:.4} [{}] conf={:.0}% id={}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.action,
            self.amount,
            self.price,
            self.status,
            self.confidence * 100.0,
            self.id,
        )
    }
}

/// Append-only trade log holding the most recent `TRADE_HISTORY_CAP` entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeHistory {
    entries: VecDeque<TradeHistoryEntry>,
}

impl TradeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries, keeping only the newest ones.
    pub fn from_entries(entries: Vec<TradeHistoryEntry>) -> Self {
        let mut history = Self::new();
        for entry in entries {
            history.push(entry);
        }
        history
    }

    /// Append an entry, dropping the oldest once the cap is reached.
    pub fn push(&mut self, entry: TradeHistoryEntry) {
        if self.entries.len() == TRADE_HISTORY_CAP {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TradeHistoryEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&TradeHistoryEntry> {
        self.entries.back()
    }

    /// Timestamp of the most recent trade that landed or may still land.
    pub fn last_trade_time(&self) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.may_have_landed())
            .map(|e| e.timestamp)
    }

    /// Number of entries of any status at or after `since`.
    pub fn trades_since(&self, since: DateTime<Utc>) -> usize {
        self.entries.iter().filter(|e| e.timestamp >= since).count()
    }

    /// Summed size of trades at or after `since` that landed or may still land.
    pub fn exposure_since(&self, since: DateTime<Utc>) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.may_have_landed() && e.timestamp >= since)
            .map(|e| e.amount)
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// Appetite for cumulative exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Maximum summed exposure over the exposure window, as a percentage of
    /// portfolio value.
    pub fn max_cumulative_exposure_pct(&self) -> Decimal {
        match self {
            RiskLevel::Low => dec!(20),
            RiskLevel::Medium => dec!(40),
            RiskLevel::High => dec!(60),
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// Caller-selected trading limits. Immutable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    pub risk_level: RiskLevel,
    pub max_trades_per_hour: u32,
    pub min_minutes_between_trades: u32,
    /// Minimum prediction confidence in [0, 1].
    pub ai_confidence_threshold: f64,
    /// Largest single position as a percentage of portfolio value.
    pub max_portfolio_exposure: Decimal,
}

impl Strategy {
    pub fn conservative() -> Self {
        Self {
            name: "conservative".to_string(),
            risk_level: RiskLevel::Low,
            max_trades_per_hour: 2,
            min_minutes_between_trades: 30,
            ai_confidence_threshold: 0.8,
            max_portfolio_exposure: dec!(5),
        }
    }

    pub fn moderate() -> Self {
        Self {
            name: "moderate".to_string(),
            risk_level: RiskLevel::Medium,
            max_trades_per_hour: 4,
            min_minutes_between_trades: 15,
            ai_confidence_threshold: 0.7,
            max_portfolio_exposure: dec!(10),
        }
    }

    pub fn aggressive() -> Self {
        Self {
            name: "aggressive".to_string(),
            risk_level: RiskLevel::High,
            max_trades_per_hour: 10,
            min_minutes_between_trades: 5,
            ai_confidence_threshold: 0.6,
            max_portfolio_exposure: dec!(20),
        }
    }

    /// Look up a preset by name (case-insensitive).
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "conservative" => Some(Self::conservative()),
            "moderate" => Some(Self::moderate()),
            "aggressive" => Some(Self::aggressive()),
            _ => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (risk={} | max {}/h | cooldown {}m | conf ≥ {:.0}% | exposure ≤ {}%)",
            self.name,
            self.risk_level,
            self.max_trades_per_hour,
            self.min_minutes_between_trades,
            self.ai_confidence_threshold * 100.0,
            self.max_portfolio_exposure,
        )
    }
}

// ---------------------------------------------------------------------------
// Results exposed to callers
// ---------------------------------------------------------------------------

/// Outcome of a submission. Never a partial success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn confirmed(tx_hash: impl Into<String>) -> Self {
        Self {
            success: true,
            tx_hash: Some(tx_hash.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            tx_hash: None,
            error: Some(error.into()),
        }
    }

    /// Failure after `tx_hash` was broadcast; its fate may be unknown.
    pub fn failed_after(tx_hash: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            tx_hash: Some(tx_hash.into()),
            error: Some(error.into()),
        }
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.tx_hash, &self.error) {
            (Some(hash), _) if self.success => write!(f, "confirmed {hash}"),
            (_, Some(err)) => write!(f, "failed: {err}"),
            _ => write!(f, "failed"),
        }
    }
}

/// Snapshot of the prediction engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub is_initialized: bool,
    pub last_training_time: Option<DateTime<Utc>>,
    pub total_predictions: u64,
    /// Running mean of scored prediction accuracy in [0, 1].
    pub average_accuracy: f64,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trained = self
            .last_training_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        write!(
            f,
            "initialized={} | last_training={} | predictions={} | accuracy={:.1}%",
            self.is_initialized,
            trained,
            self.total_predictions,
            self.average_accuracy * 100.0,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for SENTINEL.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TradingError {
    #[error("Insufficient data: need {needed} samples, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("Model not trained")]
    NotTrained,

    #[error("Training failed: {0}")]
    TrainingFailed(String),

    #[error("Ensemble not initialized: train before predicting")]
    NotInitialized,

    #[error("Invalid price series: {0}")]
    InvalidSeries(String),

    #[error("Trade rejected: {0}")]
    ValidationFailure(String),

    #[error("Gas estimation failed: {0}")]
    GasEstimationFailure(String),

    #[error("Transaction failed: {0}")]
    TransactionFailure(String),

    #[error("Transaction {tx_hash} not confirmed within {blocks} blocks")]
    ConfirmationTimeout { tx_hash: String, blocks: u64 },

    #[error("Submission failed after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Trade deadline {deadline} already passed")]
    DeadlineExpired { deadline: u64 },

    #[error("On-chain prediction is no longer valid")]
    PredictionInvalid,

    #[error("Retrain already in progress")]
    RetrainInProgress,

    #[error("Cannot {action} while scheduler is {state}")]
    InvalidTransition { action: String, state: String },

    #[error("Ledger RPC error: {0}")]
    Rpc(String),

    #[error("Market data error: {0}")]
    Collector(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
