//! Trading engine: validation, submission, the tick pipeline, the
//! auto-trading scheduler, and the `TradingSystem` facade tying them to
//! the ensemble predictor.

pub mod pipeline;
pub mod scheduler;
pub mod submitter;
pub mod validator;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::models::ensemble::EnsemblePredictor;
use crate::types::{
    ExecutionResult, PredictionResult, Strategy, SystemState, TradeHistory, TradeParams,
    TradingError,
};
use pipeline::TradingPipeline;
use scheduler::{AutoTradingScheduler, SchedulerState};

/// Public surface of the engine.
pub struct TradingSystem {
    ensemble: Arc<EnsemblePredictor>,
    pipeline: Arc<TradingPipeline>,
    scheduler: AutoTradingScheduler,
}

impl TradingSystem {
    pub fn new(
        ensemble: Arc<EnsemblePredictor>,
        pipeline: Arc<TradingPipeline>,
        tick_interval: Duration,
    ) -> Self {
        let scheduler = AutoTradingScheduler::new(Arc::clone(&pipeline), tick_interval);
        Self {
            ensemble,
            pipeline,
            scheduler,
        }
    }

    /// Forecast from freshly collected prices.
    pub async fn predict(&self) -> Result<PredictionResult, TradingError> {
        let series = self.pipeline.collect().await?;
        self.ensemble.predict(&series).await
    }

    /// Submit a caller-built trade. While auto-trading is running its
    /// strategy's cooldown and hourly cap apply to manual trades too.
    pub async fn execute_trade(&self, params: &TradeParams) -> ExecutionResult {
        let strategy = self.scheduler.active_strategy().await;
        let reference = self.ensemble.last_prediction().await;
        self.pipeline
            .execute_trade(params, strategy.as_ref(), reference.as_ref())
            .await
    }

    pub async fn system_state(&self) -> SystemState {
        self.ensemble.system_state().await
    }

    pub async fn retrain(&self) -> Result<(), TradingError> {
        info!("Retraining ensemble");
        self.ensemble.retrain().await
    }

    pub async fn history(&self) -> TradeHistory {
        self.pipeline.history().await
    }

    pub async fn start_auto_trading(
        &self,
        strategy: Strategy,
    ) -> Result<SchedulerState, TradingError> {
        self.scheduler.start(strategy).await
    }

    pub async fn stop_auto_trading(&self) -> SchedulerState {
        self.scheduler.stop().await
    }

    pub async fn emergency_stop(&self) -> SchedulerState {
        self.scheduler.emergency_stop().await
    }

    pub async fn resume(&self) -> Result<SchedulerState, TradingError> {
        self.scheduler.resume().await
    }

    pub async fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state().await
    }

    /// Stop the scheduler and wait for an in-flight tick to finish.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{PriceCollector, StaticCollector};
    use crate::models::ensemble::EnsembleConfig;
    use crate::models::policy::PolicyConfig;
    use crate::models::sequence::SequenceModelConfig;
    use crate::types::PriceSeries;
    use chrono::Utc;
    use super::testing::{FixedForecaster, TestRig};

    fn untrained_ensemble() -> Arc<EnsemblePredictor> {
        let collector: Arc<dyn PriceCollector> =
            Arc::new(StaticCollector::new(PriceSeries::default()));
        Arc::new(EnsemblePredictor::new(
            EnsembleConfig::default(),
            SequenceModelConfig::default(),
            PolicyConfig::default(),
            collector,
        ))
    }

    fn system_over(rig: &TestRig) -> TradingSystem {
        TradingSystem::new(untrained_ensemble(), rig.pipeline.clone(), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_predict_before_training_fails() {
        let rig = TestRig::new(FixedForecaster::up(0.9));
        let system = system_over(&rig);

        assert!(matches!(system.predict().await, Err(TradingError::NotInitialized)));
        let state = system.system_state().await;
        assert!(!state.is_initialized);
        assert_eq!(state.total_predictions, 0);
    }

    #[tokio::test]
    async fn test_retrain_with_empty_collector_is_insufficient() {
        let rig = TestRig::new(FixedForecaster::up(0.9));
        let system = system_over(&rig);
        assert!(matches!(
            system.retrain().await,
            Err(TradingError::InsufficientData { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trade_uses_active_strategy_limits() {
        let rig = TestRig::new(FixedForecaster::up(0.9));
        let system = system_over(&rig);
        let params = pipeline::quote_trade(
            crate::types::TradeAction::Buy,
            rust_decimal_macros::dec!(0.5),
            2.0,
            2.0,
            rig.pipeline.config(),
        )
        .unwrap();

        // Stopped: no strategy, so no rate limits.
        assert!(system.execute_trade(&params).await.success);
        assert!(system.execute_trade(&params).await.success);
        assert_eq!(rig.ledger.sent_transactions().len(), 2);

        // Running: the auto tick and manual trades share one cooldown.
        system.start_auto_trading(Strategy::moderate()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let result = system.execute_trade(&params).await;
        assert!(!result.success);
        assert!(result.error.unwrap_or_default().contains("cooldown"));

        system.shutdown().await;
        assert_eq!(system.scheduler_state().await, SchedulerState::Stopped);
        assert!(system.history().await.iter().all(|e| e.timestamp <= Utc::now()));
    }
}
