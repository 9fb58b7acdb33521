//! Sequence model: stacked LSTM price regressor.
//!
//! Trains on sliding windows of length `sequence_length`, each window
//! normalised with its own median/MAD so the network only ever sees
//! scale-free inputs. Early stopping keeps the best weights seen on the
//! held-out tail of the windows.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use tracing::{debug, info};

use super::lstm::{huber, Adam, Gradients, RecurrentRegressor};
use crate::types::{
    Direction, ModelType, PredictionResult, PriceSeries, TradingError, MAX_CONFIDENCE,
};

/// Denominator floor for the robust scaler.
pub const MAD_EPSILON: f64 = 1e-8;

/// Fixed stand-in for the volume component of the confidence score.
pub const VOLUME_CONSISTENCY_PLACEHOLDER: f64 = 0.7;

/// Prices considered by the trend-consistency component.
const TREND_LOOKBACK: usize = 10;

/// Moving-average length for the technical-alignment component.
const SMA_PERIOD: usize = 20;

/// Number of trailing prices attached to each prediction.
pub const FEATURE_WINDOW: usize = 10;

/// Normalised targets are clamped here so flat windows cannot blow up the loss.
const TARGET_CLAMP: f64 = 10.0;

const GRAD_CLIP_NORM: f64 = 5.0;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SequenceModelConfig {
    pub sequence_length: usize,
    /// Widths of the stacked recurrent layers, outermost first.
    pub hidden_sizes: Vec<usize>,
    pub dropout: f64,
    pub learning_rate: f64,
    pub max_epochs: usize,
    pub batch_size: usize,
    /// Fraction of windows (the most recent ones) held out for early stopping.
    pub validation_split: f64,
    pub patience: usize,
    pub huber_delta: f64,
    /// Fixed seed for reproducible training. `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for SequenceModelConfig {
    fn default() -> Self {
        Self {
            sequence_length: 60,
            hidden_sizes: vec![32, 16, 8],
            dropout: 0.2,
            learning_rate: 0.001,
            max_epochs: 50,
            batch_size: 16,
            validation_split: 0.2,
            patience: 10,
            huber_delta: 1.0,
            seed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Scaler
// ---------------------------------------------------------------------------

/// Median / median-absolute-deviation scaler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustScaler {
    pub median: f64,
    pub mad: f64,
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

impl RobustScaler {
    pub fn fit(values: &[f64]) -> Self {
        let mut sorted = values.to_vec();
        let med = median(&mut sorted);
        let mut deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
        let mad = median(&mut deviations);
        Self { median: med, mad }
    }

    pub fn transform(&self, value: f64) -> f64 {
        (value - self.median) / (self.mad + MAD_EPSILON)
    }

    pub fn inverse(&self, scaled: f64) -> f64 {
        scaled * (self.mad + MAD_EPSILON) + self.median
    }
}

// ---------------------------------------------------------------------------
// Confidence components
// ---------------------------------------------------------------------------

/// Share of the recent moves that agree in sign with the latest move.
pub fn trend_consistency(prices: &[f64]) -> f64 {
    let start = prices.len().saturating_sub(TREND_LOOKBACK);
    let recent = &prices[start..];
    if recent.len() < 2 {
        return 0.5;
    }
    let moves: Vec<f64> = recent.windows(2).map(|w| w[1] - w[0]).collect();
    let last_sign = moves.last().map(|m| m.signum()).unwrap_or(0.0);
    let agreeing = moves.iter().filter(|m| m.signum() == last_sign).count();
    agreeing as f64 / moves.len() as f64
}

/// Closeness of the prediction to the simple moving average.
pub fn technical_alignment(predicted: f64, prices: &[f64]) -> f64 {
    let start = prices.len().saturating_sub(SMA_PERIOD);
    let recent = &prices[start..];
    if recent.is_empty() {
        return 0.0;
    }
    let sma = recent.iter().sum::<f64>() / recent.len() as f64;
    if sma <= 0.0 {
        return 0.0;
    }
    (1.0 - (predicted - sma).abs() / sma).max(0.0)
}

/// Mean of the three components, clamped to [0, MAX_CONFIDENCE].
pub fn confidence_score(predicted: f64, prices: &[f64]) -> f64 {
    let raw = (trend_consistency(prices)
        + VOLUME_CONSISTENCY_PLACEHOLDER
        + technical_alignment(predicted, prices))
        / 3.0;
    if raw.is_finite() {
        raw.clamp(0.0, MAX_CONFIDENCE)
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Everything produced by one successful training run.
#[derive(Debug, Clone)]
pub struct TrainingState {
    pub network: RecurrentRegressor,
    /// Scaler of the last training window.
    pub scaler: RobustScaler,
    pub trained_at: DateTime<Utc>,
    pub epochs_run: usize,
    pub best_loss: f64,
}

struct Sample {
    inputs: Vec<f64>,
    target: f64,
}

#[derive(Debug, Clone)]
pub struct SequenceModel {
    config: SequenceModelConfig,
    state: Option<TrainingState>,
}

impl SequenceModel {
    pub fn new(config: SequenceModelConfig) -> Self {
        Self { config, state: None }
    }

    pub fn config(&self) -> &SequenceModelConfig {
        &self.config
    }

    pub fn is_trained(&self) -> bool {
        self.state.is_some()
    }

    pub fn training_state(&self) -> Option<&TrainingState> {
        self.state.as_ref()
    }

    /// Train in place. On error the previous state is kept.
    pub fn train(&mut self, series: &PriceSeries) -> Result<(), TradingError> {
        let state = Self::fit(&self.config, series)?;
        self.install(state);
        Ok(())
    }

    /// Replace the trained state wholesale.
    pub fn install(&mut self, state: TrainingState) {
        self.state = Some(state);
    }

    /// Train a fresh network without touching any existing model.
    pub fn fit(
        config: &SequenceModelConfig,
        series: &PriceSeries,
    ) -> Result<TrainingState, TradingError> {
        let len = config.sequence_length;
        let prices = series.prices();
        if len == 0 || prices.len() <= len {
            return Err(TradingError::InsufficientData {
                needed: len + 1,
                available: prices.len(),
            });
        }

        let mut samples = Vec::with_capacity(prices.len() - len);
        let mut last_scaler = RobustScaler::fit(&prices[..len]);
        for start in 0..prices.len() - len {
            let window = &prices[start..start + len];
            let scaler = RobustScaler::fit(window);
            samples.push(Sample {
                inputs: window.iter().map(|&p| scaler.transform(p)).collect(),
                target: scaler
                    .transform(prices[start + len])
                    .clamp(-TARGET_CLAMP, TARGET_CLAMP),
            });
            last_scaler = scaler;
        }

        let split = config.validation_split.clamp(0.0, 0.9);
        let n_val = (samples.len() as f64 * split).floor() as usize;
        let n_train = samples.len() - n_val;
        let (train, val) = if n_val == 0 || n_train == 0 {
            (&samples[..], &samples[..0])
        } else {
            samples.split_at(n_train)
        };

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut net = RecurrentRegressor::new(1, &config.hidden_sizes, config.dropout, &mut rng);
        let mut optimiser = Adam::new(&net, config.learning_rate);
        let mut order: Vec<usize> = (0..train.len()).collect();
        let batch = config.batch_size.max(1);

        let mut best: Option<(f64, RecurrentRegressor)> = None;
        let mut stale = 0;
        let mut epochs_run = 0;

        for epoch in 0..config.max_epochs.max(1) {
            epochs_run = epoch + 1;
            order.shuffle(&mut rng);

            let mut train_loss = 0.0;
            for chunk in order.chunks(batch) {
                let mut grads = Gradients::zeros_like(&net);
                for &idx in chunk {
                    let sample = &train[idx];
                    let (loss, g) = net.loss_and_grads(
                        &sample.inputs,
                        sample.target,
                        config.huber_delta,
                        &mut rng,
                    );
                    train_loss += loss;
                    grads.accumulate(&g);
                }
                grads.scale(1.0 / chunk.len() as f64);
                grads.clip(GRAD_CLIP_NORM);
                optimiser.step(&mut net, &grads);
            }
            train_loss /= train.len() as f64;

            let monitored = if val.is_empty() {
                train_loss
            } else {
                val.iter()
                    .map(|s| huber(net.predict(&s.inputs) - s.target, config.huber_delta))
                    .sum::<f64>()
                    / val.len() as f64
            };

            if !monitored.is_finite() {
                return Err(TradingError::TrainingFailed(format!(
                    "loss diverged at epoch {epochs_run}"
                )));
            }

            debug!(epoch = epochs_run, train_loss, monitored, "Sequence epoch");

            match &best {
                Some((best_loss, _)) if monitored >= *best_loss => {
                    stale += 1;
                    if stale >= config.patience.max(1) {
                        debug!(epoch = epochs_run, "Early stopping");
                        break;
                    }
                }
                _ => {
                    best = Some((monitored, net.clone()));
                    stale = 0;
                }
            }
        }

        let (best_loss, network) = best.ok_or_else(|| {
            TradingError::TrainingFailed("no epoch completed".to_string())
        })?;

        info!(
            windows = samples.len(),
            validation = val.len(),
            epochs = epochs_run,
            best_loss = format!("{best_loss:.5}"),
            "Sequence model trained"
        );

        Ok(TrainingState {
            network,
            scaler: last_scaler,
            trained_at: Utc::now(),
            epochs_run,
            best_loss,
        })
    }

    /// Forecast the next price from the most recent `sequence_length` prices.
    pub fn predict(&self, series: &PriceSeries) -> Result<PredictionResult, TradingError> {
        let state = self.state.as_ref().ok_or(TradingError::NotTrained)?;
        let len = self.config.sequence_length;
        let prices = series.prices();
        if prices.len() < len || prices.is_empty() {
            return Err(TradingError::InsufficientData {
                needed: len.max(1),
                available: prices.len(),
            });
        }

        let window = &prices[prices.len() - len..];
        let scaler = RobustScaler::fit(window);
        let inputs: Vec<f64> = window.iter().map(|&p| scaler.transform(p)).collect();
        let last = prices[prices.len() - 1];

        let mut price = scaler.inverse(state.network.predict(&inputs));
        if !price.is_finite() || price <= 0.0 {
            price = last;
        }

        let direction = if price > last {
            Direction::Up
        } else if price < last {
            Direction::Down
        } else {
            Direction::Neutral
        };

        Ok(PredictionResult {
            price,
            direction,
            confidence: confidence_score(price, &prices),
            timestamp: Utc::now(),
            model_type: ModelType::Sequence,
            features: series.tail_prices(FEATURE_WINDOW),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
