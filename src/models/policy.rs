//! Tabular Q-learning policy over discretised price-move patterns.
//!
//! The state is the sign pattern of the last `state_window - 1` price moves,
//! so the table is bounded by 3^(state_window - 1) rows. Training runs
//! epsilon-greedy episodes over a historical series; inference is greedy.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

use crate::types::{
    Direction, ModelType, PredictionResult, PriceSeries, TradingError, MAX_CONFIDENCE,
};

pub const ACTION_COUNT: usize = 3;

/// Discrete action. The discriminant is the column in the value table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Hold = 0,
    Buy = 1,
    Sell = 2,
}

impl PolicyAction {
    pub fn all() -> [PolicyAction; ACTION_COUNT] {
        [PolicyAction::Hold, PolicyAction::Buy, PolicyAction::Sell]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::all().get(idx).copied()
    }

    pub fn direction(self) -> Direction {
        match self {
            PolicyAction::Hold => Direction::Neutral,
            PolicyAction::Buy => Direction::Up,
            PolicyAction::Sell => Direction::Down,
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyAction::Hold => write!(f, "HOLD"),
            PolicyAction::Buy => write!(f, "BUY"),
            PolicyAction::Sell => write!(f, "SELL"),
        }
    }
}

/// Configuration for the policy agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Prices per state; the key has `state_window - 1` signs.
    pub state_window: usize,
    /// Learning rate (alpha).
    pub learning_rate: f64,
    /// Discount factor (gamma).
    pub discount: f64,
    /// Initial exploration rate.
    pub epsilon: f64,
    pub epsilon_min: f64,
    /// Multiplicative decay applied after each episode.
    pub epsilon_decay: f64,
    /// Relative move that earns a full reward.
    pub move_threshold: f64,
    /// Move implied by a buy or sell when turning the policy into a price.
    pub expected_move: f64,
    pub episodes: usize,
    pub seed: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            state_window: 10,
            learning_rate: 0.1,
            discount: 0.95,
            epsilon: 0.1,
            epsilon_min: 0.01,
            epsilon_decay: 0.995,
            move_threshold: 0.01,
            expected_move: 0.01,
            episodes: 50,
            seed: None,
        }
    }
}

/// Q-value table stored as an arena: keys index into a flat row vector.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    index: HashMap<String, usize>,
    rows: Vec<[f64; ACTION_COUNT]>,
}

impl PolicyTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&[f64; ACTION_COUNT]> {
        self.index.get(key).map(|&i| &self.rows[i])
    }

    /// Row for `key`, inserting a zero row on first sight.
    pub fn row_mut(&mut self, key: &str) -> &mut [f64; ACTION_COUNT] {
        let idx = match self.index.get(key) {
            Some(&i) => i,
            None => {
                self.rows.push([0.0; ACTION_COUNT]);
                let i = self.rows.len() - 1;
                self.index.insert(key.to_string(), i);
                i
            }
        };
        &mut self.rows[idx]
    }
}

fn max_value(row: &[f64; ACTION_COUNT]) -> f64 {
    row.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// First action holding the maximum value (ties resolve to Hold, then Buy).
fn greedy(row: &[f64; ACTION_COUNT]) -> PolicyAction {
    let mut best = 0;
    for i in 1..ACTION_COUNT {
        if row[i] > row[best] {
            best = i;
        }
    }
    PolicyAction::from_index(best).unwrap_or(PolicyAction::Hold)
}

/// Encode the last `window` prices as signs of consecutive changes.
/// Shorter inputs are left-padded with their earliest price.
pub fn encode_state(prices: &[f64], window: usize) -> String {
    let window = window.max(2);
    let start = prices.len().saturating_sub(window);
    let recent = &prices[start..];
    let pad = recent.first().copied().unwrap_or(0.0);
    let mut padded = vec![pad; window - recent.len()];
    padded.extend_from_slice(recent);

    padded
        .windows(2)
        .map(|w| {
            let d = w[1] - w[0];
            if d > 0.0 {
                "1"
            } else if d < 0.0 {
                "-1"
            } else {
                "0"
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Reward for taking `action` when the price then moves by `change` (relative).
/// A buy or sell that the move does not clear by `threshold` is penalised.
pub fn reward(action: PolicyAction, change: f64, threshold: f64) -> f64 {
    match action {
        PolicyAction::Buy if change > threshold => 1.0,
        PolicyAction::Sell if change < -threshold => 1.0,
        PolicyAction::Buy | PolicyAction::Sell => -1.0,
        PolicyAction::Hold if change.abs() < threshold => 0.1,
        PolicyAction::Hold => -0.1,
    }
}

/// Confidence from the spread of action values, capped.
pub fn value_confidence(row: &[f64; ACTION_COUNT]) -> f64 {
    let best = max_value(row);
    let worst = row.iter().copied().fold(f64::INFINITY, f64::min);
    let denom = best.abs() + worst.abs();
    if denom <= 0.0 || !denom.is_finite() {
        return 0.0;
    }
    ((best - worst) / denom).clamp(0.0, MAX_CONFIDENCE)
}

#[derive(Debug, Clone)]
pub struct TabularPolicyAgent {
    config: PolicyConfig,
    table: PolicyTable,
    epsilon: f64,
    episodes_trained: u64,
    rng: StdRng,
}

impl TabularPolicyAgent {
    pub fn new(config: PolicyConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            epsilon: config.epsilon,
            config,
            table: PolicyTable::default(),
            episodes_trained: 0,
            rng,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn table(&self) -> &PolicyTable {
        &self.table
    }

    pub fn episodes_trained(&self) -> u64 {
        self.episodes_trained
    }

    fn choose_action(&mut self, key: &str) -> PolicyAction {
        if self.rng.gen::<f64>() < self.epsilon {
            let idx = self.rng.gen_range(0..ACTION_COUNT);
            PolicyAction::from_index(idx).unwrap_or(PolicyAction::Hold)
        } else {
            self.table.get(key).map(greedy).unwrap_or(PolicyAction::Hold)
        }
    }

    fn update(&mut self, state: &str, action: PolicyAction, reward: f64, next_state: &str) {
        let next_max = self.table.get(next_state).map(max_value).unwrap_or(0.0);
        let alpha = self.config.learning_rate;
        let gamma = self.config.discount;
        let row = self.table.row_mut(state);
        let q = &mut row[action.index()];
        *q += alpha * (reward + gamma * next_max - *q);
    }

    /// Run `episodes` passes over the series. A series with fewer than two
    /// prices has no transitions and leaves the table untouched.
    pub fn train(&mut self, series: &PriceSeries, episodes: usize) {
        let prices = series.prices();
        if prices.len() < 2 {
            debug!(len = prices.len(), "Policy training skipped: no transitions");
            return;
        }
        let window = self.config.state_window;
        let threshold = self.config.move_threshold;

        for _ in 0..episodes {
            let mut total = 0.0;
            for t in 0..prices.len() - 1 {
                let state = encode_state(&prices[..=t], window);
                let action = self.choose_action(&state);
                let change = (prices[t + 1] - prices[t]) / prices[t];
                let r = reward(action, change, threshold);
                let next_state = encode_state(&prices[..=t + 1], window);
                self.update(&state, action, r, &next_state);
                total += r;
            }
            self.epsilon = (self.epsilon * self.config.epsilon_decay).max(self.config.epsilon_min);
            self.episodes_trained += 1;
            debug!(reward = total, epsilon = self.epsilon, "Policy episode");
        }

        info!(
            episodes,
            states = self.table.len(),
            epsilon = format!("{:.4}", self.epsilon),
            "Policy agent trained"
        );
    }

    /// Greedy prediction for the latest state. Inserts a zero row for a
    /// state never seen before.
    pub fn predict(&mut self, series: &PriceSeries) -> Result<PredictionResult, TradingError> {
        let last = series.last_price().ok_or(TradingError::InsufficientData {
            needed: 1,
            available: 0,
        })?;
        let key = encode_state(&series.prices(), self.config.state_window);
        let row = *self.table.row_mut(&key);
        let action = greedy(&row);

        let price = match action {
            PolicyAction::Buy => last * (1.0 + self.config.expected_move),
            PolicyAction::Sell => last * (1.0 - self.config.expected_move),
            PolicyAction::Hold => last,
        };

        Ok(PredictionResult {
            price,
            direction: action.direction(),
            confidence: value_confidence(&row),
            timestamp: Utc::now(),
            model_type: ModelType::Policy,
            features: series.tail_prices(super::sequence::FEATURE_WINDOW),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
