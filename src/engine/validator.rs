//! Trade validator.
//!
//! Pure, synchronous gate between a prediction and a submission: checks
//! confidence, cooldown, hourly rate and cumulative exposure against the
//! active strategy, and sizes the position. Every history entry counts
//! toward the hourly cap. Cooldown and exposure only see entries that
//! landed or may still land.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fmt;
use tracing::debug;

use crate::types::{PredictionResult, Strategy, TradeHistory};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Trailing window over which cumulative exposure is summed.
    pub exposure_window_hours: i64,
    /// Smallest position as a percentage of portfolio value.
    pub min_position_pct: Decimal,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            exposure_window_hours: 24,
            min_position_pct: dec!(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RejectionReason {
    LowConfidence { confidence: f64, threshold: f64 },
    Cooldown { elapsed_mins: i64, required_mins: u32 },
    HourlyCap { trades: usize, max: u32 },
    EmptyPortfolio,
    ExposureLimit { current: Decimal, proposed: Decimal, limit: Decimal },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::LowConfidence { confidence, threshold } => write!(
                f,
                "confidence {:.0}% below threshold {:.0}%",
                confidence * 100.0,
                threshold * 100.0
            ),
            RejectionReason::Cooldown { elapsed_mins, required_mins } => write!(
                f,
                "cooldown: {elapsed_mins}m since last trade, {required_mins}m required"
            ),
            RejectionReason::HourlyCap { trades, max } => {
                write!(f, "hourly cap reached: {trades} trades in the last hour (max {max})")
            }
            RejectionReason::EmptyPortfolio => write!(f, "portfolio value is zero"),
            RejectionReason::ExposureLimit { current, proposed, limit } => write!(
                f,
                "exposure limit: {current} open + {proposed} proposed exceeds {limit}"
            ),
        }
    }
}

/// Outcome of validating one prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationDecision {
    pub allow: bool,
    pub reason: String,
    /// Recommended size in native units; `None` when rejected.
    pub position_size: Option<Decimal>,
    pub rejection: Option<RejectionReason>,
}

impl ValidationDecision {
    fn approve(size: Decimal) -> Self {
        Self {
            allow: true,
            reason: format!("approved: size {size}"),
            position_size: Some(size),
            rejection: None,
        }
    }

    fn reject(reason: RejectionReason) -> Self {
        Self {
            allow: false,
            reason: reason.to_string(),
            position_size: None,
            rejection: Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

pub struct TradeValidator {
    config: ValidatorConfig,
}

impl TradeValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Evaluate against the wall clock.
    pub fn evaluate(
        &self,
        prediction: &PredictionResult,
        strategy: &Strategy,
        history: &TradeHistory,
        portfolio_value: Decimal,
    ) -> ValidationDecision {
        self.evaluate_at(prediction, strategy, history, portfolio_value, Utc::now())
    }

    /// Evaluate as of `now`. Checks run in a fixed order and the first
    /// failing check decides the reason.
    pub fn evaluate_at(
        &self,
        prediction: &PredictionResult,
        strategy: &Strategy,
        history: &TradeHistory,
        portfolio_value: Decimal,
        now: DateTime<Utc>,
    ) -> ValidationDecision {
        if prediction.confidence < strategy.ai_confidence_threshold {
            return ValidationDecision::reject(RejectionReason::LowConfidence {
                confidence: prediction.confidence,
                threshold: strategy.ai_confidence_threshold,
            });
        }

        if let Err(reason) = self.check_rate_limits(strategy, history, now) {
            return ValidationDecision::reject(reason);
        }

        if portfolio_value <= Decimal::ZERO {
            return ValidationDecision::reject(RejectionReason::EmptyPortfolio);
        }

        let size = self.position_size(prediction.confidence, strategy, portfolio_value);

        let since = now - Duration::hours(self.config.exposure_window_hours);
        let current = history.exposure_since(since);
        let limit = portfolio_value * strategy.risk_level.max_cumulative_exposure_pct() / dec!(100);
        if current + size > limit {
            return ValidationDecision::reject(RejectionReason::ExposureLimit {
                current,
                proposed: size,
                limit,
            });
        }

        debug!(
            strategy = %strategy.name,
            confidence = prediction.confidence,
            size = %size,
            exposure = %current,
            "Trade validated"
        );
        ValidationDecision::approve(size)
    }

    /// Cooldown and hourly-cap checks only. Also used as the final gate for
    /// manually submitted trades.
    pub fn check_rate_limits(
        &self,
        strategy: &Strategy,
        history: &TradeHistory,
        now: DateTime<Utc>,
    ) -> Result<(), RejectionReason> {
        if let Some(last) = history.last_trade_time() {
            let elapsed = now - last;
            if elapsed < Duration::minutes(i64::from(strategy.min_minutes_between_trades)) {
                return Err(RejectionReason::Cooldown {
                    elapsed_mins: elapsed.num_minutes(),
                    required_mins: strategy.min_minutes_between_trades,
                });
            }
        }

        let trades = history.trades_since(now - Duration::hours(1));
        if trades >= strategy.max_trades_per_hour as usize {
            return Err(RejectionReason::HourlyCap {
                trades,
                max: strategy.max_trades_per_hour,
            });
        }

        Ok(())
    }

    /// Position size in native units: confidence-scaled share of the
    /// strategy's max exposure, clamped to [min_position_pct, max exposure].
    pub fn position_size(
        &self,
        confidence: f64,
        strategy: &Strategy,
        portfolio_value: Decimal,
    ) -> Decimal {
        let max_pct = strategy.max_portfolio_exposure;
        let min_pct = self.config.min_position_pct.min(max_pct);
        let confidence = Decimal::from_f64(confidence.clamp(0.0, 1.0)).unwrap_or(Decimal::ZERO);
        let pct = (max_pct * confidence).clamp(min_pct, max_pct);
        portfolio_value * pct / dec!(100)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, ModelType, TradeAction, TradeHistoryEntry, TradeStatus};

    fn prediction(confidence: f64) -> PredictionResult {
        PredictionResult {
            price: 101.0,
            direction: Direction::Up,
            confidence,
            timestamp: Utc::now(),
            model_type: ModelType::Ensemble,
            features: vec![],
        }
    }

    fn entry(at: DateTime<Utc>, amount: Decimal, status: TradeStatus) -> TradeHistoryEntry {
        TradeHistoryEntry {
            id: format!("0x{}", uuid::Uuid::new_v4().simple()),
            timestamp: at,
            action: TradeAction::Buy,
            amount,
            price: 100.0,
            status,
            confidence: 0.9,
        }
    }

    fn validator() -> TradeValidator {
        TradeValidator::new(ValidatorConfig::default())
    }

    fn capped(max_trades_per_hour: u32) -> Strategy {
        Strategy {
            name: "capped".to_string(),
            max_trades_per_hour,
            min_minutes_between_trades: 0,
            ..Strategy::moderate()
        }
    }

    #[test]
    fn test_approves_and_sizes() {
        let d = validator().evaluate(
            &prediction(0.8),
            &Strategy::moderate(),
            &TradeHistory::new(),
            dec!(100),
        );
        assert!(d.allow);
        // 10% * 0.8 = 8% of 100
        assert_eq!(d.position_size, Some(dec!(8)));
    }

    #[test]
    fn test_size_clamped_to_bounds() {
        let v = validator();
        let s = Strategy::moderate();
        assert_eq!(v.position_size(0.05, &s, dec!(100)), dec!(1));
        assert_eq!(v.position_size(1.0, &s, dec!(100)), dec!(10));
    }

    #[test]
    fn test_rejects_low_confidence() {
        let d = validator().evaluate(
            &prediction(0.65),
            &Strategy::moderate(),
            &TradeHistory::new(),
            dec!(100),
        );
        assert!(!d.allow);
        assert!(matches!(d.rejection, Some(RejectionReason::LowConfidence { .. })));
        assert!(d.position_size.is_none());
    }

    #[test]
    fn test_rejects_during_cooldown() {
        let now = Utc::now();
        let mut history = TradeHistory::new();
        history.push(entry(now - Duration::minutes(10), dec!(1), TradeStatus::Confirmed));

        let d = validator().evaluate_at(
            &prediction(0.9),
            &Strategy::moderate(),
            &history,
            dec!(100),
            now,
        );
        assert!(!d.allow);
        assert!(d.reason.contains("cooldown"));
    }

    #[test]
    fn test_hourly_cap_rejects_fifth_trade() {
        let now = Utc::now();
        let mut history = TradeHistory::new();
        for mins in [55, 40, 25, 16] {
            history.push(entry(now - Duration::minutes(mins), dec!(1), TradeStatus::Confirmed));
        }
        let d = validator().evaluate_at(
            &prediction(0.9),
            &Strategy::moderate(),
            &history,
            dec!(1000),
            now,
        );
        assert!(!d.allow);
        assert!(d.reason.contains("hourly"));
    }

    #[test]
    fn test_hourly_cap_releases_after_the_window() {
        let now = Utc::now();
        let strategy = capped(2);
        let mut history = TradeHistory::new();
        history.push(entry(now - Duration::minutes(50), dec!(1), TradeStatus::Confirmed));
        history.push(entry(now - Duration::minutes(20), dec!(1), TradeStatus::Confirmed));

        let v = validator();
        let d = v.evaluate_at(&prediction(0.9), &strategy, &history, dec!(1000), now);
        assert!(!d.allow);
        assert_eq!(d.rejection, Some(RejectionReason::HourlyCap { trades: 2, max: 2 }));
        assert!(d.reason.contains("hourly cap"));

        let later = now + Duration::minutes(61);
        let d = v.evaluate_at(&prediction(0.9), &strategy, &history, dec!(1000), later);
        assert!(d.allow, "{}", d.reason);
    }

    #[test]
    fn test_failed_entries_count_toward_hourly_cap() {
        let now = Utc::now();
        let mut history = TradeHistory::new();
        for mins in [50, 20] {
            history.push(entry(now - Duration::minutes(mins), dec!(1), TradeStatus::Failed));
        }
        assert_eq!(
            validator().check_rate_limits(&capped(2), &history, now),
            Err(RejectionReason::HourlyCap { trades: 2, max: 2 })
        );
    }

    #[test]
    fn test_unsent_failures_skip_cooldown_and_exposure() {
        let now = Utc::now();
        let mut history = TradeHistory::new();
        let mut unsent = entry(now - Duration::minutes(2), dec!(50), TradeStatus::Failed);
        unsent.id = "failed-1".to_string();
        history.push(unsent);
        history.push(entry(now - Duration::minutes(1), dec!(50), TradeStatus::Cancelled));

        let d = validator().evaluate_at(
            &prediction(0.9),
            &Strategy::moderate(),
            &history,
            dec!(100),
            now,
        );
        assert!(d.allow, "{}", d.reason);
    }

    #[test]
    fn test_broadcast_failure_starts_cooldown() {
        let now = Utc::now();
        let mut history = TradeHistory::new();
        // Timed out with a hash: it may still confirm.
        history.push(entry(now - Duration::minutes(2), dec!(1), TradeStatus::Failed));

        let d = validator().evaluate_at(
            &prediction(0.9),
            &Strategy::moderate(),
            &history,
            dec!(100),
            now,
        );
        assert!(matches!(d.rejection, Some(RejectionReason::Cooldown { .. })));
    }

    #[test]
    fn test_cumulative_exposure_limit() {
        let now = Utc::now();
        let v = validator();
        let mut history = TradeHistory::new();
        // Medium risk: 40% of 100 = 40 over 24h.
        history.push(entry(now - Duration::hours(3), dec!(35), TradeStatus::Confirmed));

        let d = v.evaluate_at(&prediction(0.9), &Strategy::moderate(), &history, dec!(100), now);
        assert!(!d.allow);
        assert!(matches!(d.rejection, Some(RejectionReason::ExposureLimit { .. })));

        // Exposure older than the window is forgotten.
        let mut old = TradeHistory::new();
        old.push(entry(now - Duration::hours(30), dec!(35), TradeStatus::Confirmed));
        let d = v.evaluate_at(&prediction(0.9), &Strategy::moderate(), &old, dec!(100), now);
        assert!(d.allow);
    }

    #[test]
    fn test_empty_portfolio() {
        let d = validator().evaluate(
            &prediction(0.9),
            &Strategy::aggressive(),
            &TradeHistory::new(),
            Decimal::ZERO,
        );
        assert_eq!(d.rejection, Some(RejectionReason::EmptyPortfolio));
    }
}
