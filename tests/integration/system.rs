//! The `TradingSystem` facade with a really trained ensemble.

use std::sync::Arc;
use std::time::Duration;

use sentinel::data::{PriceCollector, StaticCollector};
use sentinel::engine::pipeline::TradingPipeline;
use sentinel::engine::scheduler::SchedulerState;
use sentinel::engine::submitter::SubmitterConfig;
use sentinel::engine::validator::{TradeValidator, ValidatorConfig};
use sentinel::engine::TradingSystem;
use sentinel::ledger::mock::MockLedger;
use sentinel::models::ensemble::{EnsembleConfig, EnsemblePredictor};
use sentinel::models::policy::PolicyConfig;
use sentinel::models::sequence::SequenceModelConfig;
use sentinel::types::*;

use crate::common::{pipeline_config, submitter, wave_series};

struct Deployed {
    ledger: Arc<MockLedger>,
    system: TradingSystem,
}

fn deploy(series: PriceSeries) -> Deployed {
    let collector: Arc<dyn PriceCollector> = Arc::new(StaticCollector::new(series));
    let ensemble = Arc::new(EnsemblePredictor::new(
        EnsembleConfig::default(),
        SequenceModelConfig {
            sequence_length: 12,
            hidden_sizes: vec![6, 4, 2],
            max_epochs: 3,
            patience: 2,
            seed: Some(7),
            ..SequenceModelConfig::default()
        },
        PolicyConfig {
            episodes: 5,
            seed: Some(7),
            ..PolicyConfig::default()
        },
        collector.clone(),
    ));

    let ledger = Arc::new(MockLedger::new());
    let pipeline = Arc::new(TradingPipeline::new(
        pipeline_config(None),
        collector,
        ensemble.clone(),
        TradeValidator::new(ValidatorConfig::default()),
        submitter(&ledger, SubmitterConfig::default()),
        TradeHistory::new(),
    ));
    let system = TradingSystem::new(ensemble, pipeline, Duration::from_secs(30));
    Deployed { ledger, system }
}

/// Aggressive limits with no confidence floor, so any directional call trades.
fn eager() -> Strategy {
    Strategy {
        name: "eager".to_string(),
        ai_confidence_threshold: 0.0,
        ..Strategy::aggressive()
    }
}

#[tokio::test]
async fn test_retrain_then_predict_updates_state() {
    let d = deploy(wave_series(200));
    assert!(matches!(d.system.predict().await, Err(TradingError::NotInitialized)));

    d.system.retrain().await.unwrap();
    let state = d.system.system_state().await;
    assert!(state.is_initialized);
    assert!(state.last_training_time.is_some());
    assert_eq!(state.total_predictions, 0);

    let prediction = d.system.predict().await.unwrap();
    assert_eq!(prediction.model_type, ModelType::Ensemble);
    assert!(prediction.price.is_finite() && prediction.price > 0.0);
    assert!((0.0..=MAX_CONFIDENCE).contains(&prediction.confidence));
    assert_eq!(prediction.features.len(), 10);

    d.system.predict().await.unwrap();
    let state = d.system.system_state().await;
    assert_eq!(state.total_predictions, 2);
    assert!((0.0..=1.0).contains(&state.average_accuracy));
}

#[tokio::test]
async fn test_retrain_rejects_short_history() {
    let d = deploy(wave_series(50));
    assert!(matches!(
        d.system.retrain().await,
        Err(TradingError::InsufficientData { needed: 100, available: 50 })
    ));
    assert!(!d.system.system_state().await.is_initialized);
}

#[tokio::test(start_paused = true)]
async fn test_untrained_ticks_never_submit() {
    let d = deploy(wave_series(200));
    d.system.start_auto_trading(eager()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    d.system.shutdown().await;

    assert_eq!(d.ledger.send_attempts(), 0);
    assert!(d.system.history().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_auto_trading_lifecycle() {
    let d = deploy(wave_series(200));
    d.system.retrain().await.unwrap();

    assert_eq!(d.system.start_auto_trading(eager()).await.unwrap(), SchedulerState::Running);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(d.system.emergency_stop().await, SchedulerState::EmergencyStopped);
    assert!(matches!(
        d.system.start_auto_trading(eager()).await,
        Err(TradingError::InvalidTransition { .. })
    ));

    // Let an in-flight tick drain; nothing new is scheduled afterwards.
    tokio::time::sleep(Duration::from_secs(120)).await;
    let sent_after_stop = d.ledger.sent_transactions().len();
    // The first tick traded once, saw a neutral forecast or was cancelled.
    assert!(sent_after_stop <= 1);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(d.ledger.sent_transactions().len(), sent_after_stop);

    assert_eq!(d.system.resume().await.unwrap(), SchedulerState::Running);
    d.system.shutdown().await;
    assert_eq!(d.system.scheduler_state().await, SchedulerState::Stopped);

    let history = d.system.history().await;
    assert!(history
        .iter()
        .all(|e| matches!(e.status, TradeStatus::Confirmed | TradeStatus::Cancelled)));
    assert!(d.system.system_state().await.total_predictions >= 1);
}
