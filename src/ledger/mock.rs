//! In-memory ledger for tests and offline simulation.
//!
//! Deterministic `LedgerRpc` implementation with a simulated block height
//! and scriptable failures. Every `block_number` call advances the chain by
//! `blocks_per_poll`, so confirmation polling makes progress on its own.

use alloy::primitives::{Address, B256, U256};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::contract::{classify_call, encode_prediction_check};
use super::{LedgerRpc, TxReceipt, TxRequest};

const MOCK_GAS_USED: u64 = 120_000;

#[derive(Debug, Clone, Copy)]
struct PendingTx {
    ready_at: u64,
    status: bool,
}

#[derive(Debug)]
struct LedgerState {
    block: u64,
    blocks_per_poll: u64,
    gas_price: U256,
    fail_gas_price: bool,
    gas_price_calls: u32,
    estimate: Option<u64>,
    send_failures: u32,
    receipt_failures: u32,
    block_failures: u32,
    reverts: u32,
    receipt_delay: Option<u64>,
    prediction_valid: bool,
    balance: U256,
    nonce: u64,
    hashes_issued: u64,
    send_attempts: u32,
    block_calls: u32,
    sent: Vec<TxRequest>,
    pending: HashMap<B256, PendingTx>,
}

/// A scriptable ledger. Defaults: block 100, 20 gwei gas, estimate 150k,
/// receipts one block after sending, predictions valid, 10 native balance.
#[derive(Debug)]
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                block: 100,
                blocks_per_poll: 1,
                gas_price: U256::from(20_000_000_000u64),
                fail_gas_price: false,
                gas_price_calls: 0,
                estimate: Some(150_000),
                send_failures: 0,
                receipt_failures: 0,
                block_failures: 0,
                reverts: 0,
                receipt_delay: Some(1),
                prediction_valid: true,
                balance: U256::from(10_000_000_000_000_000_000u128),
                nonce: 0,
                hashes_issued: 0,
                send_attempts: 0,
                block_calls: 0,
                sent: Vec::new(),
                pending: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- Scripting --

    pub fn set_gas_price(&self, wei: U256) {
        self.state().gas_price = wei;
    }

    pub fn fail_gas_price(&self, fail: bool) {
        self.state().fail_gas_price = fail;
    }

    /// `None` makes every estimate fail.
    pub fn set_estimate(&self, gas: Option<u64>) {
        self.state().estimate = gas;
    }

    /// Reject the next `n` sends before they reach the chain.
    pub fn fail_next_sends(&self, n: u32) {
        self.state().send_failures = n;
    }

    /// Fail the next `n` receipt lookups with a transport error.
    pub fn fail_next_receipts(&self, n: u32) {
        self.state().receipt_failures = n;
    }

    /// Fail the next `n` block height reads with a transport error.
    pub fn fail_next_block_numbers(&self, n: u32) {
        self.state().block_failures = n;
    }

    /// Mine the next `n` accepted transactions as reverted.
    pub fn revert_next(&self, n: u32) {
        self.state().reverts = n;
    }

    /// Blocks between sending and the receipt appearing. `None` never mines.
    pub fn set_receipt_delay(&self, blocks: Option<u64>) {
        self.state().receipt_delay = blocks;
    }

    pub fn set_blocks_per_poll(&self, blocks: u64) {
        self.state().blocks_per_poll = blocks;
    }

    pub fn set_prediction_valid(&self, valid: bool) {
        self.state().prediction_valid = valid;
    }

    pub fn set_balance(&self, wei: U256) {
        self.state().balance = wei;
    }

    /// Mine every pending transaction at the current height.
    pub fn mine_pending(&self) {
        let mut s = self.state();
        let block = s.block;
        for tx in s.pending.values_mut() {
            tx.ready_at = tx.ready_at.min(block);
        }
    }

    // -- Inspection --

    pub fn sent_transactions(&self) -> Vec<TxRequest> {
        self.state().sent.clone()
    }

    pub fn send_attempts(&self) -> u32 {
        self.state().send_attempts
    }

    pub fn gas_price_calls(&self) -> u32 {
        self.state().gas_price_calls
    }

    pub fn block_number_calls(&self) -> u32 {
        self.state().block_calls
    }

    pub fn current_block(&self) -> u64 {
        self.state().block
    }
}

#[async_trait]
impl LedgerRpc for MockLedger {
    async fn block_number(&self) -> Result<u64> {
        let mut s = self.state();
        s.block_calls += 1;
        if s.block_failures > 0 {
            s.block_failures -= 1;
            return Err(anyhow!("mock: 503 upstream"));
        }
        let current = s.block;
        s.block += s.blocks_per_poll;
        Ok(current)
    }

    async fn gas_price(&self) -> Result<U256> {
        let mut s = self.state();
        s.gas_price_calls += 1;
        if s.fail_gas_price {
            return Err(anyhow!("mock: gas price unavailable"));
        }
        Ok(s.gas_price)
    }

    async fn estimate_gas(&self, _tx: &TxRequest) -> Result<u64> {
        self.state()
            .estimate
            .ok_or_else(|| anyhow!("mock: execution reverted during estimation"))
    }

    async fn send_transaction(&self, tx: &TxRequest) -> Result<B256> {
        let mut s = self.state();
        s.send_attempts += 1;
        if s.send_failures > 0 {
            s.send_failures -= 1;
            return Err(anyhow!("mock: connection reset"));
        }
        if classify_call(&tx.data).is_none() {
            return Err(anyhow!("mock: unknown function selector"));
        }

        s.hashes_issued += 1;
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&s.hashes_issued.to_be_bytes());
        let hash = B256::from(bytes);

        let status = if s.reverts > 0 {
            s.reverts -= 1;
            false
        } else {
            true
        };
        if let Some(delay) = s.receipt_delay {
            let ready_at = s.block + delay;
            s.pending.insert(hash, PendingTx { ready_at, status });
        }
        s.nonce += 1;
        s.sent.push(tx.clone());
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>> {
        let mut s = self.state();
        if s.receipt_failures > 0 {
            s.receipt_failures -= 1;
            return Err(anyhow!("mock: 503 upstream"));
        }
        Ok(s.pending.get(&hash).and_then(|tx| {
            (s.block >= tx.ready_at).then_some(TxReceipt {
                transaction_hash: hash,
                block_number: tx.ready_at,
                status: tx.status,
                gas_used: MOCK_GAS_USED,
            })
        }))
    }

    async fn call(&self, tx: &TxRequest) -> Result<Vec<u8>> {
        if tx.data != encode_prediction_check() {
            return Err(anyhow!("mock: unsupported call"));
        }
        let mut word = vec![0u8; 32];
        word[31] = u8::from(self.state().prediction_valid);
        Ok(word)
    }

    async fn balance(&self, _address: Address) -> Result<U256> {
        Ok(self.state().balance)
    }

    async fn transaction_count(&self, _address: Address) -> Result<u64> {
        Ok(self.state().nonce)
    }
}
