//! Gas price oracle.
//!
//! Caches the buffered network gas price for a short TTL so a burst of
//! submissions costs one RPC call. Fetch failures fall back to a fixed
//! price; fallbacks are never cached.

use alloy::primitives::U256;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::LedgerRpc;

const WEI_PER_GWEI: u64 = 1_000_000_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasOracleConfig {
    pub cache_ttl_secs: u64,
    /// Percentage added on top of the network price.
    pub buffer_pct: u64,
    pub fallback_gwei: u64,
}

impl Default for GasOracleConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 60,
            buffer_pct: 10,
            fallback_gwei: 50,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GasPriceCache {
    pub price: U256,
    pub captured_at: Instant,
}

pub struct GasPriceOracle {
    rpc: Arc<dyn LedgerRpc>,
    config: GasOracleConfig,
    cache: RwLock<Option<GasPriceCache>>,
}

impl GasPriceOracle {
    pub fn new(rpc: Arc<dyn LedgerRpc>, config: GasOracleConfig) -> Self {
        Self {
            rpc,
            config,
            cache: RwLock::new(None),
        }
    }

    pub fn fallback_price(&self) -> U256 {
        U256::from(self.config.fallback_gwei) * U256::from(WEI_PER_GWEI)
    }

    /// Buffered gas price in wei.
    pub async fn get_price(&self) -> U256 {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        if let Some(cached) = *self.cache.read().await {
            if cached.captured_at.elapsed() < ttl {
                return cached.price;
            }
        }

        match self.rpc.gas_price().await {
            Ok(network) => {
                let buffered =
                    network * U256::from(100 + self.config.buffer_pct) / U256::from(100u64);
                *self.cache.write().await = Some(GasPriceCache {
                    price: buffered,
                    captured_at: Instant::now(),
                });
                debug!(network = %network, buffered = %buffered, "Gas price refreshed");
                buffered
            }
            Err(e) => {
                let fallback = self.fallback_price();
                warn!(
                    error = %e,
                    fallback_wei = %fallback,
                    "Gas price fetch failed, using fallback"
                );
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::mock::MockLedger;

    fn oracle(ledger: &Arc<MockLedger>) -> GasPriceOracle {
        GasPriceOracle::new(ledger.clone(), GasOracleConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_and_cached_within_ttl() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_gas_price(U256::from(100u64));
        let oracle = oracle(&ledger);

        assert_eq!(oracle.get_price().await, U256::from(110u64));
        ledger.set_gas_price(U256::from(200u64));
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(oracle.get_price().await, U256::from(110u64));
        assert_eq!(ledger.gas_price_calls(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(oracle.get_price().await, U256::from(220u64));
        assert_eq!(ledger.gas_price_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_is_not_cached() {
        let ledger = Arc::new(MockLedger::new());
        ledger.fail_gas_price(true);
        let oracle = oracle(&ledger);

        assert_eq!(oracle.get_price().await, U256::from(50_000_000_000u64));
        ledger.fail_gas_price(false);
        ledger.set_gas_price(U256::from(10u64));
        assert_eq!(oracle.get_price().await, U256::from(11u64));
    }
}
