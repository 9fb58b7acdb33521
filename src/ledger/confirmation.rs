//! Confirmation tracking.
//!
//! Polls for a receipt until one appears or the chain has advanced
//! `max_blocks` past the height observed at the start.

use alloy::primitives::B256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{hash_hex, LedgerRpc, TxReceipt};
use crate::types::TradingError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_BLOCKS: u64 = 12;

pub struct ConfirmationTracker {
    rpc: Arc<dyn LedgerRpc>,
    poll_interval: Duration,
}

impl ConfirmationTracker {
    pub fn new(rpc: Arc<dyn LedgerRpc>) -> Self {
        Self {
            rpc,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Wait for the receipt of `tx_hash`. The receipt may report a revert;
    /// interpreting `status` is up to the caller.
    ///
    /// RPC errors are logged and polling continues. Only a receipt or the
    /// block budget ends the wait, so the budget starts counting from the
    /// first height the node reports.
    pub async fn wait_for_confirmation(
        &self,
        tx_hash: B256,
        max_blocks: u64,
    ) -> Result<TxReceipt, TradingError> {
        let mut start = match self.rpc.block_number().await {
            Ok(block) => Some(block),
            Err(e) => {
                warn!(tx_hash = %hash_hex(&tx_hash), error = %e, "Block height unavailable");
                None
            }
        };

        loop {
            match self.rpc.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    info!(
                        tx_hash = %hash_hex(&tx_hash),
                        block = receipt.block_number,
                        success = receipt.status,
                        "Transaction mined"
                    );
                    return Ok(receipt);
                }
                Ok(None) => {}
                Err(e) => warn!(tx_hash = %hash_hex(&tx_hash), error = %e, "Receipt poll failed"),
            }

            match self.rpc.block_number().await {
                Ok(current) => {
                    let advanced = current.saturating_sub(*start.get_or_insert(current));
                    if advanced >= max_blocks {
                        warn!(
                            tx_hash = %hash_hex(&tx_hash),
                            blocks = advanced,
                            "Confirmation timed out"
                        );
                        return Err(TradingError::ConfirmationTimeout {
                            tx_hash: hash_hex(&tx_hash),
                            blocks: advanced,
                        });
                    }
                    debug!(tx_hash = %hash_hex(&tx_hash), advanced, "Awaiting receipt");
                }
                Err(e) => {
                    warn!(tx_hash = %hash_hex(&tx_hash), error = %e, "Block height poll failed")
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::contract::{encode_trade, EncodedTrade};
    use crate::ledger::mock::MockLedger;
    use crate::ledger::TxRequest;
    use crate::types::{TradeParams, TradeType};
    use alloy::primitives::{Address, U256};
    use tokio::time::Instant;

    async fn send_one(ledger: &MockLedger) -> B256 {
        let params = TradeParams::new(
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            U256::from(10),
            U256::from(9),
            TradeType::NativeToToken,
        );
        let EncodedTrade { data, value } = encode_trade(&params, Address::repeat_byte(3));
        let tx = TxRequest::new(Address::repeat_byte(3), Address::repeat_byte(4), data, value);
        ledger.send_transaction(&tx).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_after_a_few_blocks() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_receipt_delay(Some(3));
        let hash = send_one(&ledger).await;

        let tracker = ConfirmationTracker::new(ledger.clone());
        let receipt = tracker.wait_for_confirmation(hash, DEFAULT_MAX_BLOCKS).await.unwrap();
        assert!(receipt.status);
        assert_eq!(receipt.block_number, 103);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_max_blocks_not_before() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_receipt_delay(None);
        let hash = send_one(&ledger).await;

        let tracker = ConfirmationTracker::new(ledger.clone());
        let started = Instant::now();
        let err = tracker.wait_for_confirmation(hash, 12).await.unwrap_err();

        match err {
            TradingError::ConfirmationTimeout { blocks, .. } => assert_eq!(blocks, 12),
            other => panic!("unexpected error: {other}"),
        }
        // Start call plus one height check per poll.
        assert_eq!(ledger.block_number_calls(), 13);
        // Eleven sleeps between twelve polls.
        assert_eq!(started.elapsed(), DEFAULT_POLL_INTERVAL * 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverted_receipt_is_returned() {
        let ledger = Arc::new(MockLedger::new());
        ledger.revert_next(1);
        ledger.set_receipt_delay(Some(0));
        let hash = send_one(&ledger).await;

        let tracker = ConfirmationTracker::new(ledger.clone());
        let receipt = tracker.wait_for_confirmation(hash, 12).await.unwrap();
        assert!(!receipt.status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_receipt_error_keeps_polling() {
        let ledger = Arc::new(MockLedger::new());
        let hash = send_one(&ledger).await;
        ledger.fail_next_receipts(1);

        let tracker = ConfirmationTracker::new(ledger.clone());
        let receipt = tracker.wait_for_confirmation(hash, DEFAULT_MAX_BLOCKS).await.unwrap();
        assert!(receipt.status);
        assert_eq!(receipt.transaction_hash, hash);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_height_errors_do_not_end_the_wait() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_receipt_delay(None);
        let hash = send_one(&ledger).await;
        // The start height and the first poll both fail.
        ledger.fail_next_block_numbers(2);

        let tracker = ConfirmationTracker::new(ledger.clone());
        match tracker.wait_for_confirmation(hash, 4).await {
            Err(TradingError::ConfirmationTimeout { blocks, .. }) => assert_eq!(blocks, 4),
            other => panic!("expected a timeout, got {other:?}"),
        }
        // Two failed calls, then a baseline and four polls of progress.
        assert_eq!(ledger.block_number_calls(), 7);
    }
}
