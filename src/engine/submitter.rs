//! Transaction submitter.
//!
//! Turns validated `TradeParams` into a contract call and drives it through
//! gas pricing, gas estimation, local signing, submission and
//! confirmation, with bounded retries. All attempts of one submission share
//! a nonce so at most one of them can land.

use alloy::primitives::{Address, B256, U256};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::ledger::confirmation::{ConfirmationTracker, DEFAULT_MAX_BLOCKS};
use crate::ledger::contract::{classify_call, decode_bool, encode_prediction_check, encode_trade};
use crate::ledger::gas::GasPriceOracle;
use crate::ledger::{hash_hex, wei_to_native, LedgerRpc, TxRequest};
use crate::types::{ExecutionResult, TradeParams, TradeType, TradingError};

/// Static gas limits used when estimation fails.
const FALLBACK_GAS_NATIVE_TO_TOKEN: u64 = 300_000;
const FALLBACK_GAS_TOKEN_TO_NATIVE: u64 = 250_000;
const FALLBACK_GAS_DEFAULT: u64 = 200_000;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubmitterConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Percentage added on top of the node's gas estimate.
    pub gas_buffer_pct: u64,
    pub max_confirmation_blocks: u64,
    /// Log the built call and return a synthetic hash instead of sending.
    pub dry_run: bool,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 10_000,
            gas_buffer_pct: 20,
            max_confirmation_blocks: DEFAULT_MAX_BLOCKS,
            dry_run: false,
        }
    }
}

/// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped.
pub fn backoff_delay(retry: u32, base_ms: u64, max_ms: u64) -> Duration {
    let factor = 2u64.saturating_pow(retry.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

/// Gas limit to use when the node cannot estimate the call.
pub fn fallback_gas_limit(data: &[u8]) -> u64 {
    match classify_call(data) {
        Some(TradeType::NativeToToken) => FALLBACK_GAS_NATIVE_TO_TOKEN,
        Some(TradeType::TokenToNative) => FALLBACK_GAS_TOKEN_TO_NATIVE,
        _ => FALLBACK_GAS_DEFAULT,
    }
}

// ---------------------------------------------------------------------------
// Submitter
// ---------------------------------------------------------------------------

pub struct TransactionSubmitter {
    rpc: Arc<dyn LedgerRpc>,
    gas_oracle: Arc<GasPriceOracle>,
    tracker: ConfirmationTracker,
    contract: Address,
    config: SubmitterConfig,
}

impl TransactionSubmitter {
    pub fn new(
        rpc: Arc<dyn LedgerRpc>,
        gas_oracle: Arc<GasPriceOracle>,
        tracker: ConfirmationTracker,
        contract: Address,
        config: SubmitterConfig,
    ) -> Self {
        Self {
            rpc,
            gas_oracle,
            tracker,
            contract,
            config,
        }
    }

    pub fn config(&self) -> &SubmitterConfig {
        &self.config
    }

    /// Native balance of `user`, used as the portfolio value for sizing.
    pub async fn portfolio_value(&self, user: Address) -> Result<Decimal, TradingError> {
        let wei = self
            .rpc
            .balance(user)
            .await
            .map_err(|e| TradingError::Rpc(e.to_string()))?;
        wei_to_native(wei).map_err(|e| TradingError::Rpc(e.to_string()))
    }

    /// Build the unsigned contract call for `params`.
    pub fn build_transaction(&self, params: &TradeParams, user: Address) -> TxRequest {
        let encoded = encode_trade(params, user);
        TxRequest::new(user, self.contract, encoded.data, encoded.value)
    }

    /// Node estimate plus the configured buffer; static table on failure.
    pub async fn estimate_gas(&self, tx: &TxRequest) -> u64 {
        match self.rpc.estimate_gas(tx).await {
            Ok(estimate) => estimate.saturating_mul(100 + self.config.gas_buffer_pct) / 100,
            Err(e) => {
                let fallback = fallback_gas_limit(&tx.data);
                let err = TradingError::GasEstimationFailure(e.to_string());
                warn!(error = %err, fallback, "Using static gas limit");
                fallback
            }
        }
    }

    async fn prediction_is_valid(&self, user: Address) -> Result<bool, TradingError> {
        let check = TxRequest::new(user, self.contract, encode_prediction_check(), U256::ZERO);
        let raw = self
            .rpc
            .call(&check)
            .await
            .map_err(|e| TradingError::Rpc(e.to_string()))?;
        decode_bool(&raw)
            .ok_or_else(|| TradingError::Rpc("malformed isPredictionValid return".to_string()))
    }

    /// Submit one trade end to end. Never returns a partial success.
    pub async fn submit(&self, params: &TradeParams, user: Address) -> ExecutionResult {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if params.is_expired_at(now) {
            let err = TradingError::DeadlineExpired {
                deadline: params.deadline,
            };
            warn!(error = %err, "Refusing expired trade");
            return ExecutionResult::failed(err.to_string());
        }

        if self.config.dry_run {
            let tx = self.build_transaction(params, user);
            info!(
                trade_type = %params.trade_type,
                to = %tx.to,
                value = %tx.value,
                amount_in = %params.amount_in,
                amount_out_min = %params.amount_out_min,
                data = %format!("0x{}", hex::encode(&tx.data)),
                "[DRY RUN] Would submit trade"
            );
            return ExecutionResult::confirmed(format!("dry-run-{}", uuid::Uuid::new_v4()));
        }

        match self.prediction_is_valid(user).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(user = %user, "On-chain prediction not valid, refusing trade");
                return ExecutionResult::failed(TradingError::PredictionInvalid.to_string());
            }
            Err(e) => return ExecutionResult::failed(e.to_string()),
        }

        let mut tx = self.build_transaction(params, user);
        tx.gas_price = Some(self.gas_oracle.get_price().await);
        tx.gas = Some(self.estimate_gas(&tx).await);

        info!(
            trade_type = %params.trade_type,
            amount_in = %params.amount_in,
            gas = tx.gas.unwrap_or_default(),
            "Submitting trade"
        );
        self.execute_with_retry(tx, self.config.max_attempts).await
    }

    /// Send `tx` and wait for a successful receipt, retrying up to
    /// `max_attempts` times with exponential backoff between attempts.
    pub async fn execute_with_retry(
        &self,
        mut tx: TxRequest,
        max_attempts: u32,
    ) -> ExecutionResult {
        let max_attempts = max_attempts.max(1);
        if tx.nonce.is_none() {
            match self.rpc.transaction_count(tx.from).await {
                Ok(nonce) => tx.nonce = Some(nonce),
                Err(e) => warn!(error = %e, "Could not pin nonce, leaving it to the node"),
            }
        }

        let mut sent: Vec<B256> = Vec::new();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = backoff_delay(
                    attempt - 1,
                    self.config.base_backoff_ms,
                    self.config.max_backoff_ms,
                );
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying submission");
                tokio::time::sleep(delay).await;

                if let Some(hash) = self.late_success(&sent).await {
                    info!(tx_hash = %hash_hex(&hash), attempt, "Earlier attempt confirmed late");
                    return ExecutionResult::confirmed(hash_hex(&hash));
                }
            }

            let hash = match self.rpc.send_transaction(&tx).await {
                Ok(hash) => hash,
                Err(e) => {
                    last_error = TradingError::TransactionFailure(e.to_string()).to_string();
                    warn!(attempt, error = %e, "Send failed");
                    continue;
                }
            };
            sent.push(hash);
            info!(tx_hash = %hash_hex(&hash), attempt, "Transaction sent");

            match self
                .tracker
                .wait_for_confirmation(hash, self.config.max_confirmation_blocks)
                .await
            {
                Ok(receipt) if receipt.status => {
                    info!(
                        tx_hash = %hash_hex(&hash),
                        block = receipt.block_number,
                        gas_used = receipt.gas_used,
                        "Trade confirmed"
                    );
                    return ExecutionResult::confirmed(hash_hex(&hash));
                }
                Ok(receipt) => {
                    last_error = TradingError::TransactionFailure(format!(
                        "transaction {} reverted in block {}",
                        hash_hex(&hash),
                        receipt.block_number
                    ))
                    .to_string();
                    warn!(tx_hash = %hash_hex(&hash), attempt, "Transaction reverted");
                    // A mined revert consumes the nonce.
                    match self.rpc.transaction_count(tx.from).await {
                        Ok(nonce) => tx.nonce = Some(nonce),
                        Err(_) => tx.nonce = tx.nonce.map(|n| n + 1),
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(tx_hash = %hash_hex(&hash), attempt, error = %e, "Confirmation failed");
                }
            }
        }

        let exhausted = TradingError::RetryExhausted {
            attempts: max_attempts,
            last_error: last_error.clone(),
        };
        error!(error = %exhausted, "Submission failed");
        match sent.last() {
            Some(hash) => ExecutionResult::failed_after(hash_hex(hash), last_error),
            None => ExecutionResult::failed(last_error),
        }
    }

    /// First earlier hash that has since been mined successfully.
    async fn late_success(&self, sent: &[B256]) -> Option<B256> {
        for hash in sent {
            if let Ok(Some(receipt)) = self.rpc.transaction_receipt(*hash).await {
                if receipt.status {
                    return Some(*hash);
                }
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
