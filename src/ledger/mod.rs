//! Ledger access.
//!
//! `LedgerRpc` is the seam between the trading engine and the chain node:
//! `ProviderLedger` implements it for real runs and `MockLedger` for
//! tests and simulation.

pub mod confirmation;
pub mod contract;
pub mod gas;
pub mod mock;
pub mod rpc;

use alloy::primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Decimals of the native asset. Also the largest token precision supported.
pub const NATIVE_DECIMALS: u32 = 18;

/// A transaction (or read-only call) to send to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub data: Vec<u8>,
    pub value: U256,
    pub gas: Option<u64>,
    pub gas_price: Option<U256>,
    pub nonce: Option<u64>,
}

impl TxRequest {
    pub fn new(from: Address, to: Address, data: Vec<u8>, value: U256) -> Self {
        Self {
            from,
            to,
            data,
            value,
            gas: None,
            gas_price: None,
            nonce: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    /// `false` when the transaction reverted.
    pub status: bool,
    pub gas_used: u64,
}

/// Node operations used by the engine.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    /// Current network gas price in wei.
    async fn gas_price(&self) -> Result<U256>;

    async fn estimate_gas(&self, tx: &TxRequest) -> Result<u64>;

    async fn send_transaction(&self, tx: &TxRequest) -> Result<B256>;

    /// `None` while the transaction is not yet mined.
    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>>;

    /// Read-only call; returns the raw return data.
    async fn call(&self, tx: &TxRequest) -> Result<Vec<u8>>;

    async fn balance(&self, address: Address) -> Result<U256>;

    async fn transaction_count(&self, address: Address) -> Result<u64>;
}

/// 0x-prefixed lowercase hex of a hash.
pub fn hash_hex(hash: &B256) -> String {
    format!("0x{}", hex::encode(hash))
}

/// Convert raw base units of an asset with `decimals` places to a decimal amount.
pub fn from_base_units(raw: U256, decimals: u32) -> Result<Decimal> {
    anyhow::ensure!(decimals <= NATIVE_DECIMALS, "Unsupported precision: {decimals} decimals");
    let raw = u128::try_from(raw).ok().context("Amount does not fit in 128 bits")?;
    let raw = i128::try_from(raw).context("Amount does not fit in i128")?;
    Decimal::try_from_i128_with_scale(raw, decimals).context("Amount out of decimal range")
}

/// Convert a decimal amount to base units with `decimals` places, truncating
/// dust below one unit. Negative amounts map to zero.
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<U256> {
    anyhow::ensure!(decimals <= NATIVE_DECIMALS, "Unsupported precision: {decimals} decimals");
    if amount <= Decimal::ZERO {
        return Ok(U256::ZERO);
    }
    let scaled = amount
        .checked_mul(Decimal::from(10u64.pow(decimals)))
        .context("Amount too large to convert to base units")?
        .trunc();
    let raw = scaled.to_u128().context("Amount not representable in base units")?;
    Ok(U256::from(raw))
}

pub fn wei_to_native(wei: U256) -> Result<Decimal> {
    from_base_units(wei, NATIVE_DECIMALS)
}

pub fn native_to_wei(amount: Decimal) -> Result<U256> {
    to_base_units(amount, NATIVE_DECIMALS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_wei_conversions() {
        let one = U256::from(1_000_000_000_000_000_000u128);
        assert_eq!(wei_to_native(one).unwrap(), dec!(1));
        assert_eq!(native_to_wei(dec!(1.5)).unwrap(), U256::from(1_500_000_000_000_000_000u128));
        assert_eq!(native_to_wei(dec!(-2)).unwrap(), U256::ZERO);
        assert!(wei_to_native(U256::MAX).is_err());
    }

    #[test]
    fn test_six_decimal_token_units() {
        assert_eq!(to_base_units(dec!(1980.123456789), 6).unwrap(), U256::from(1_980_123_456u64));
        assert_eq!(from_base_units(U256::from(2_500_000u64), 6).unwrap(), dec!(2.5));
        assert!(to_base_units(dec!(1), 24).is_err());
    }

    #[test]
    fn test_hash_hex() {
        let hash = B256::repeat_byte(0xab);
        let s = hash_hex(&hash);
        assert!(s.starts_with("0xabab"));
        assert_eq!(s.len(), 66);
    }
}
