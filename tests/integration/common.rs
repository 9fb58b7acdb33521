//! Shared fixtures for the integration tests.

use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use sentinel::data::{PriceCollector, StaticCollector};
use sentinel::engine::pipeline::{PipelineConfig, PriceQuote, TradingPipeline};
use sentinel::engine::submitter::{SubmitterConfig, TransactionSubmitter};
use sentinel::engine::validator::{TradeValidator, ValidatorConfig};
use sentinel::ledger::confirmation::ConfirmationTracker;
use sentinel::ledger::gas::{GasOracleConfig, GasPriceOracle};
use sentinel::ledger::mock::MockLedger;
use sentinel::models::Forecaster;
use sentinel::types::*;

/// Replays a queue of (direction, confidence) answers; the last one repeats.
pub struct ScriptedForecaster {
    script: Mutex<VecDeque<(Direction, f64)>>,
}

impl ScriptedForecaster {
    pub fn new(script: &[(Direction, f64)]) -> Self {
        Self {
            script: Mutex::new(script.iter().copied().collect()),
        }
    }
}

#[async_trait]
impl Forecaster for ScriptedForecaster {
    async fn forecast(&self, series: &PriceSeries) -> Result<PredictionResult, TradingError> {
        let (direction, confidence) = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                *script.front().unwrap()
            }
        };
        let last = series.last_price().ok_or(TradingError::InsufficientData {
            needed: 1,
            available: 0,
        })?;
        let price = match direction {
            Direction::Up => last * 1.05,
            Direction::Down => last * 0.95,
            Direction::Neutral => last,
        };
        Ok(PredictionResult {
            price,
            direction,
            confidence,
            timestamp: Utc::now(),
            model_type: ModelType::Ensemble,
            features: vec![],
        })
    }
}

pub fn user() -> Address {
    Address::repeat_byte(0xaa)
}

pub fn contract() -> Address {
    Address::repeat_byte(0xcc)
}

/// Hourly samples of a slow wave around 2.0, ending now.
pub fn wave_series(n: usize) -> PriceSeries {
    let start = Utc::now() - Duration::hours(n as i64);
    let prices: Vec<f64> = (0..n).map(|i| 2.0 + (i as f64 * 0.15).sin() * 0.1).collect();
    PriceSeries::from_prices(start, Duration::hours(1), &prices).unwrap()
}

pub fn pipeline_config(history_path: Option<String>) -> PipelineConfig {
    PipelineConfig {
        user: user(),
        wrapped_native: Address::repeat_byte(0x01),
        trade_token: Address::repeat_byte(0x02),
        price_quote: PriceQuote::NativePerToken,
        token_decimals: 18,
        slippage_pct: dec!(0.5),
        sources: vec!["ethereum".to_string()],
        window_hours: 168,
        history_path,
    }
}

pub fn submitter(ledger: &Arc<MockLedger>, config: SubmitterConfig) -> Arc<TransactionSubmitter> {
    let oracle = Arc::new(GasPriceOracle::new(ledger.clone(), GasOracleConfig::default()));
    Arc::new(TransactionSubmitter::new(
        ledger.clone(),
        oracle,
        ConfirmationTracker::new(ledger.clone()),
        contract(),
        config,
    ))
}

pub struct Harness {
    pub ledger: Arc<MockLedger>,
    pub pipeline: Arc<TradingPipeline>,
}

impl Harness {
    pub fn new(forecaster: Arc<dyn Forecaster>) -> Self {
        Self::with(forecaster, SubmitterConfig::default(), TradeHistory::new(), None)
    }

    pub fn with(
        forecaster: Arc<dyn Forecaster>,
        submitter_config: SubmitterConfig,
        history: TradeHistory,
        history_path: Option<String>,
    ) -> Self {
        let ledger = Arc::new(MockLedger::new());
        let collector: Arc<dyn PriceCollector> = Arc::new(StaticCollector::new(wave_series(200)));
        let pipeline = Arc::new(TradingPipeline::new(
            pipeline_config(history_path),
            collector,
            forecaster,
            TradeValidator::new(ValidatorConfig::default()),
            submitter(&ledger, submitter_config),
            history,
        ));
        Self { ledger, pipeline }
    }
}

pub fn temp_path(tag: &str) -> String {
    std::env::temp_dir()
        .join(format!("sentinel_it_{tag}_{}.json", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string()
}
