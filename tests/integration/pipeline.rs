//! Single ticks driven through the full pipeline against the mock ledger.

use alloy::primitives::U256;
use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use sentinel::engine::pipeline::TickOutcome;
use sentinel::engine::submitter::SubmitterConfig;
use sentinel::engine::validator::RejectionReason;
use sentinel::ledger::contract::classify_call;
use sentinel::ledger::native_to_wei;
use sentinel::storage;
use sentinel::types::*;

use crate::common::{contract, temp_path, Harness, ScriptedForecaster};

fn forecaster(direction: Direction, confidence: f64) -> Arc<ScriptedForecaster> {
    Arc::new(ScriptedForecaster::new(&[(direction, confidence)]))
}

fn executed(outcome: TickOutcome) -> TradeHistoryEntry {
    match outcome {
        TickOutcome::Executed(entry) => entry,
        other => panic!("expected an executed trade, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_up_signal_buys_with_native_value() {
    let h = Harness::new(forecaster(Direction::Up, 0.8));
    let token = CancellationToken::new();
    let entry = executed(h.pipeline.run_tick(&Strategy::moderate(), &token).await);

    assert_eq!(entry.action, TradeAction::Buy);
    // 10 native balance * 10% * 0.8
    assert_eq!(entry.amount, dec!(0.8));
    assert_eq!(entry.status, TradeStatus::Confirmed);

    let sent = h.ledger.sent_transactions();
    assert_eq!(sent.len(), 1);
    let tx = &sent[0];
    assert_eq!(tx.to, contract());
    assert_eq!(classify_call(&tx.data), Some(TradeType::NativeToToken));
    assert_eq!(tx.value, native_to_wei(dec!(0.8)).unwrap());
    // 20 gwei + 10% buffer; 150k estimate + 20% buffer.
    assert_eq!(tx.gas_price, Some(U256::from(22_000_000_000u64)));
    assert_eq!(tx.gas, Some(180_000));
    assert_eq!(tx.nonce, Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_down_signal_sells_tokens() {
    let h = Harness::new(forecaster(Direction::Down, 0.9));
    let token = CancellationToken::new();
    let entry = executed(h.pipeline.run_tick(&Strategy::moderate(), &token).await);

    assert_eq!(entry.action, TradeAction::Sell);
    let tx = &h.ledger.sent_transactions()[0];
    assert_eq!(classify_call(&tx.data), Some(TradeType::TokenToNative));
    assert_eq!(tx.value, U256::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_transient_send_failures_are_retried() {
    let h = Harness::new(forecaster(Direction::Up, 0.9));
    h.ledger.fail_next_sends(2);

    let token = CancellationToken::new();
    let entry = executed(h.pipeline.run_tick(&Strategy::moderate(), &token).await);
    assert!(entry.id.starts_with("0x"));
    assert_eq!(h.ledger.send_attempts(), 3);
    assert_eq!(h.ledger.sent_transactions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_revert_then_success_uses_next_nonce() {
    let h = Harness::new(forecaster(Direction::Up, 0.9));
    h.ledger.revert_next(1);

    executed(h.pipeline.run_tick(&Strategy::moderate(), &CancellationToken::new()).await);
    let sent = h.ledger.sent_transactions();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].nonce, Some(0));
    assert_eq!(sent[1].nonce, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_records_failure() {
    let h = Harness::new(forecaster(Direction::Up, 0.9));
    h.ledger.revert_next(3);

    let outcome = h.pipeline.run_tick(&Strategy::moderate(), &CancellationToken::new()).await;
    let entry = match outcome {
        TickOutcome::Failed(entry) => entry,
        other => panic!("expected failure, got {other}"),
    };
    assert_eq!(entry.status, TradeStatus::Failed);
    assert_eq!(h.ledger.sent_transactions().len(), 3);

    // The entry keeps the last broadcast hash and counts against the limits.
    assert!(entry.id.starts_with("0x"));
    let history = h.pipeline.history().await;
    assert!(history.last_trade_time().is_some());
    assert_eq!(history.trades_since(Utc::now() - Duration::hours(1)), 1);
    assert_eq!(history.exposure_since(Utc::now() - Duration::hours(1)), dec!(0.9));
}

#[tokio::test(start_paused = true)]
async fn test_unsent_failure_only_counts_toward_hourly_cap() {
    let h = Harness::new(forecaster(Direction::Up, 0.9));
    h.ledger.fail_next_sends(3);

    let outcome = h.pipeline.run_tick(&Strategy::moderate(), &CancellationToken::new()).await;
    let entry = match outcome {
        TickOutcome::Failed(entry) => entry,
        other => panic!("expected failure, got {other}"),
    };
    assert!(entry.id.starts_with("failed-"));

    let history = h.pipeline.history().await;
    assert!(history.last_trade_time().is_none());
    assert_eq!(history.trades_since(Utc::now() - Duration::hours(1)), 1);
    assert_eq!(history.exposure_since(Utc::now() - Duration::hours(1)), dec!(0));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_onchain_prediction_blocks_send() {
    let h = Harness::new(forecaster(Direction::Up, 0.9));
    h.ledger.set_prediction_valid(false);

    let outcome = h.pipeline.run_tick(&Strategy::moderate(), &CancellationToken::new()).await;
    assert!(matches!(outcome, TickOutcome::Failed(_)));
    assert_eq!(h.ledger.send_attempts(), 0);
}

#[tokio::test]
async fn test_dry_run_never_touches_ledger() {
    let config = SubmitterConfig {
        dry_run: true,
        ..SubmitterConfig::default()
    };
    let h = Harness::with(forecaster(Direction::Up, 0.9), config, TradeHistory::new(), None);

    let token = CancellationToken::new();
    let entry = executed(h.pipeline.run_tick(&Strategy::moderate(), &token).await);
    assert!(entry.id.starts_with("dry-run-"));
    assert_eq!(h.ledger.send_attempts(), 0);
    assert_eq!(h.ledger.gas_price_calls(), 0);
}

#[tokio::test]
async fn test_exposure_limit_counts_confirmed_history() {
    let mut history = TradeHistory::new();
    // Outside the hour and the cooldown, inside the 24h exposure window.
    history.push(TradeHistoryEntry {
        id: "0xabc".to_string(),
        timestamp: Utc::now() - Duration::hours(20),
        action: TradeAction::Buy,
        amount: dec!(3.5),
        price: 2.0,
        status: TradeStatus::Confirmed,
        confidence: 0.9,
    });
    let h = Harness::with(
        forecaster(Direction::Up, 0.9),
        SubmitterConfig::default(),
        history,
        None,
    );

    // Medium risk allows 40% of 10 = 4; 3.5 + 0.9 exceeds it.
    let outcome = h.pipeline.run_tick(&Strategy::moderate(), &CancellationToken::new()).await;
    assert!(matches!(outcome, TickOutcome::Rejected(RejectionReason::ExposureLimit { .. })));
    assert_eq!(h.ledger.send_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_history_persisted_after_each_trade() {
    let path = temp_path("history");
    let h = Harness::with(
        forecaster(Direction::Up, 0.9),
        SubmitterConfig::default(),
        TradeHistory::new(),
        Some(path.clone()),
    );
    let token = CancellationToken::new();
    executed(h.pipeline.run_tick(&Strategy::aggressive(), &token).await);

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    // Cooldown applies, so the second tick is rejected and not recorded.
    let second = h.pipeline.run_tick(&Strategy::aggressive(), &cancelled).await;
    assert!(matches!(second, TickOutcome::Rejected(RejectionReason::Cooldown { .. })));

    let loaded = storage::load_history(Some(&path)).unwrap().unwrap();
    assert_eq!(loaded, h.pipeline.history().await);
    assert_eq!(loaded.len(), 1);
    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_stop_before_submission_records_cancelled() {
    let h = Harness::new(forecaster(Direction::Up, 0.9));
    let token = CancellationToken::new();
    token.cancel();

    let outcome = h.pipeline.run_tick(&Strategy::moderate(), &token).await;
    let entry = match outcome {
        TickOutcome::Cancelled(entry) => entry,
        other => panic!("expected cancellation, got {other}"),
    };
    assert!(entry.id.starts_with("cancelled-"));
    assert_eq!(h.ledger.send_attempts(), 0);
}
