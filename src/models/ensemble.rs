//! Ensemble predictor: weighted blend of the sequence and policy models.
//!
//! Owns both sub-models behind async locks. Inference runs the two models
//! concurrently on the blocking pool; retraining builds new model state off
//! to the side and swaps it in only when both halves succeed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::policy::{PolicyConfig, TabularPolicyAgent};
use super::sequence::{SequenceModel, SequenceModelConfig, FEATURE_WINDOW};
use super::Forecaster;
use crate::data::{CollectionWindow, PriceCollector};
use crate::types::{
    Direction, ModelType, PredictionResult, PriceSeries, SystemState, TradingError, MAX_CONFIDENCE,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct EnsembleWeights {
    pub sequence: f64,
    pub policy: f64,
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self {
            sequence: 0.7,
            policy: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub weights: EnsembleWeights,
    /// Relative band around the last price inside which the blend is neutral.
    pub dead_band: f64,
    /// Fewest samples a retrain will accept.
    pub min_training_samples: usize,
    /// Source identifiers passed to the collector on retrain.
    pub sources: Vec<String>,
    pub window_hours: u32,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            weights: EnsembleWeights::default(),
            dead_band: 0.001,
            min_training_samples: 100,
            sources: vec!["ethereum".to_string()],
            window_hours: 168,
        }
    }
}

// ---------------------------------------------------------------------------
// Blending
// ---------------------------------------------------------------------------

/// Combine the two sub-model forecasts into the ensemble forecast.
pub fn combine(
    sequence: &PredictionResult,
    policy: &PredictionResult,
    last_price: f64,
    weights: EnsembleWeights,
    dead_band: f64,
    features: Vec<f64>,
) -> PredictionResult {
    let total = weights.sequence + weights.policy;
    let (ws, wp) = if total > 0.0 {
        (weights.sequence / total, weights.policy / total)
    } else {
        (0.5, 0.5)
    };

    let price = ws * sequence.price + wp * policy.price;
    let confidence = (ws * sequence.confidence + wp * policy.confidence).clamp(0.0, MAX_CONFIDENCE);

    let direction = if price > last_price * (1.0 + dead_band) {
        Direction::Up
    } else if price < last_price * (1.0 - dead_band) {
        Direction::Down
    } else {
        Direction::Neutral
    };

    PredictionResult {
        price,
        direction,
        confidence,
        timestamp: Utc::now(),
        model_type: ModelType::Ensemble,
        features,
    }
}

/// Accuracy of a forecast against the realised price, in [0, 1].
pub fn prediction_accuracy(predicted: f64, actual: f64) -> f64 {
    if actual <= 0.0 || !actual.is_finite() || !predicted.is_finite() {
        return 0.0;
    }
    (1.0 - (predicted - actual).abs() / actual).max(0.0)
}

// ---------------------------------------------------------------------------
// Predictor
// ---------------------------------------------------------------------------

/// A forecast awaiting its realised price.
#[derive(Debug, Clone, Copy)]
struct PendingScore {
    /// Timestamp of the last sample the forecast was made from.
    as_of: DateTime<Utc>,
    predicted: f64,
}

#[derive(Debug, Default)]
struct EnsembleStats {
    initialized: bool,
    last_training_time: Option<DateTime<Utc>>,
    total_predictions: u64,
    accuracy_sum: f64,
    accuracy_count: u64,
    pending: Option<PendingScore>,
    last_prediction: Option<PredictionResult>,
}

pub struct EnsemblePredictor {
    config: EnsembleConfig,
    sequence: Arc<RwLock<SequenceModel>>,
    policy: Arc<RwLock<TabularPolicyAgent>>,
    collector: Arc<dyn PriceCollector>,
    retrain_lock: Mutex<()>,
    stats: RwLock<EnsembleStats>,
}

impl EnsemblePredictor {
    pub fn new(
        config: EnsembleConfig,
        sequence: SequenceModelConfig,
        policy: PolicyConfig,
        collector: Arc<dyn PriceCollector>,
    ) -> Self {
        Self {
            config,
            sequence: Arc::new(RwLock::new(SequenceModel::new(sequence))),
            policy: Arc::new(RwLock::new(TabularPolicyAgent::new(policy))),
            collector,
            retrain_lock: Mutex::new(()),
            stats: RwLock::new(EnsembleStats::default()),
        }
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Collect fresh data and retrain both models.
    ///
    /// Fails with `RetrainInProgress` when another retrain holds the lock and
    /// with `InsufficientData` when the collector returns too few samples;
    /// in both cases the current models keep serving.
    pub async fn retrain(&self) -> Result<(), TradingError> {
        let _guard = self
            .retrain_lock
            .try_lock()
            .map_err(|_| TradingError::RetrainInProgress)?;

        let window = CollectionWindow {
            hours: self.config.window_hours,
        };
        let series = self
            .collector
            .collect(&self.config.sources, window)
            .await
            .map_err(|e| TradingError::Collector(e.to_string()))?;

        self.train_locked(series).await
    }

    /// Train both models on a caller-supplied series.
    pub async fn train(&self, series: &PriceSeries) -> Result<(), TradingError> {
        let _guard = self
            .retrain_lock
            .try_lock()
            .map_err(|_| TradingError::RetrainInProgress)?;
        self.train_locked(series.clone()).await
    }

    async fn train_locked(&self, series: PriceSeries) -> Result<(), TradingError> {
        if series.len() < self.config.min_training_samples {
            warn!(
                samples = series.len(),
                needed = self.config.min_training_samples,
                "Not enough data to retrain, keeping current models"
            );
            return Err(TradingError::InsufficientData {
                needed: self.config.min_training_samples,
                available: series.len(),
            });
        }

        let series = Arc::new(series);
        let seq_config = self.sequence.read().await.config().clone();
        let mut candidate = self.policy.read().await.clone();
        let episodes = candidate.config().episodes;

        let seq_series = Arc::clone(&series);
        let seq_task =
            tokio::task::spawn_blocking(move || SequenceModel::fit(&seq_config, &seq_series));
        let pol_series = Arc::clone(&series);
        let pol_task = tokio::task::spawn_blocking(move || {
            candidate.train(&pol_series, episodes);
            candidate
        });

        let (seq_res, pol_res) = tokio::join!(seq_task, pol_task);
        let seq_state = seq_res.map_err(|e| TradingError::TrainingFailed(e.to_string()))??;
        let policy = pol_res.map_err(|e| TradingError::TrainingFailed(e.to_string()))?;

        self.sequence.write().await.install(seq_state);
        *self.policy.write().await = policy;

        let mut stats = self.stats.write().await;
        stats.initialized = true;
        stats.last_training_time = Some(Utc::now());

        info!(samples = series.len(), "Ensemble retrained");
        Ok(())
    }

    /// Produce a blended forecast for the series.
    pub async fn predict(&self, series: &PriceSeries) -> Result<PredictionResult, TradingError> {
        if !self.stats.read().await.initialized {
            return Err(TradingError::NotInitialized);
        }
        let last = series.last().copied().ok_or(TradingError::InsufficientData {
            needed: 1,
            available: 0,
        })?;

        let shared = Arc::new(series.clone());
        let (sequence, policy) = (Arc::clone(&self.sequence), Arc::clone(&self.policy));
        let seq_series = Arc::clone(&shared);
        let seq_task =
            tokio::task::spawn_blocking(move || sequence.blocking_read().predict(&seq_series));
        let pol_series = Arc::clone(&shared);
        let pol_task =
            tokio::task::spawn_blocking(move || policy.blocking_write().predict(&pol_series));

        let (seq_res, pol_res) = tokio::join!(seq_task, pol_task);
        let seq = seq_res.map_err(|e| TradingError::TrainingFailed(e.to_string()))??;
        let pol = pol_res.map_err(|e| TradingError::TrainingFailed(e.to_string()))??;

        let prediction = combine(
            &seq,
            &pol,
            last.price,
            self.config.weights,
            self.config.dead_band,
            series.tail_prices(FEATURE_WINDOW),
        );

        let mut stats = self.stats.write().await;
        if let Some(pending) = stats.pending.take() {
            match series.first_after(pending.as_of) {
                Some(realised) => {
                    stats.accuracy_sum += prediction_accuracy(pending.predicted, realised.price);
                    stats.accuracy_count += 1;
                }
                // Not realised yet; keep waiting.
                None => stats.pending = Some(pending),
            }
        }
        if stats.pending.is_none() {
            stats.pending = Some(PendingScore {
                as_of: last.timestamp,
                predicted: prediction.price,
            });
        }
        stats.total_predictions += 1;
        stats.last_prediction = Some(prediction.clone());
        drop(stats);

        info!(
            price = format!("{:.4}", prediction.price),
            direction = %prediction.direction,
            confidence = format!("{:.2}", prediction.confidence),
            sequence = format!("{:.4}", seq.price),
            policy = %pol.direction,
            "Ensemble prediction"
        );

        Ok(prediction)
    }

    /// Read-only snapshot. Calling it has no side effects.
    pub async fn system_state(&self) -> SystemState {
        let stats = self.stats.read().await;
        SystemState {
            is_initialized: stats.initialized,
            last_training_time: stats.last_training_time,
            total_predictions: stats.total_predictions,
            average_accuracy: if stats.accuracy_count == 0 {
                0.0
            } else {
                stats.accuracy_sum / stats.accuracy_count as f64
            },
        }
    }

    pub async fn last_prediction(&self) -> Option<PredictionResult> {
        self.stats.read().await.last_prediction.clone()
    }
}

#[async_trait]
impl Forecaster for EnsemblePredictor {
    async fn forecast(&self, series: &PriceSeries) -> Result<PredictionResult, TradingError> {
        self.predict(series).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
