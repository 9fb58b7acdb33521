//! Ledger client over an alloy provider.
//!
//! Transactions are signed locally by a `PrivateKeySigner` and broadcast
//! raw, so any hosted RPC endpoint works. The engine pins gas, gas price
//! and nonce itself; the provider's fillers only complete what is missing.

use alloy::network::{EthereumWallet, ReceiptResponse, TransactionBuilder};
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::{LedgerRpc, TxReceipt, TxRequest};

/// Parse a hex private key held in a secret.
pub fn signer_from_secret(key: &SecretString) -> Result<PrivateKeySigner> {
    key.expose_secret()
        .trim()
        .parse::<PrivateKeySigner>()
        .context("Invalid signer private key")
}

/// Translate an engine request into an RPC transaction request.
pub fn to_rpc_request(tx: &TxRequest, chain_id: Option<u64>) -> Result<TransactionRequest> {
    let mut req = TransactionRequest::default()
        .with_from(tx.from)
        .with_to(tx.to)
        .with_input(tx.data.clone())
        .with_value(tx.value);
    if let Some(gas) = tx.gas {
        req = req.with_gas_limit(gas);
    }
    if let Some(price) = tx.gas_price {
        let price = u128::try_from(price).context("Gas price does not fit in 128 bits")?;
        req = req.with_gas_price(price);
    }
    if let Some(nonce) = tx.nonce {
        req = req.with_nonce(nonce);
    }
    if let Some(id) = chain_id {
        req = req.with_chain_id(id);
    }
    Ok(req)
}

pub struct ProviderLedger {
    provider: DynProvider,
    signer: Address,
    chain_id: Option<u64>,
}

impl ProviderLedger {
    /// Connect over HTTP with a local signing wallet.
    pub fn connect(url: &SecretString, key: &SecretString, chain_id: Option<u64>) -> Result<Self> {
        let signer = signer_from_secret(key)?;
        let address = signer.address();
        let url = url.expose_secret().parse().context("Invalid RPC URL")?;
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();
        Ok(Self {
            provider,
            signer: address,
            chain_id,
        })
    }

    /// Account the wallet signs for.
    pub fn signer_address(&self) -> Address {
        self.signer
    }
}

#[async_trait]
impl LedgerRpc for ProviderLedger {
    async fn block_number(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .context("eth_blockNumber failed")
    }

    async fn gas_price(&self) -> Result<U256> {
        let price = self.provider.get_gas_price().await.context("eth_gasPrice failed")?;
        Ok(U256::from(price))
    }

    async fn estimate_gas(&self, tx: &TxRequest) -> Result<u64> {
        self.provider
            .estimate_gas(to_rpc_request(tx, None)?)
            .await
            .context("eth_estimateGas failed")
    }

    async fn send_transaction(&self, tx: &TxRequest) -> Result<B256> {
        let pending = self
            .provider
            .send_transaction(to_rpc_request(tx, self.chain_id)?)
            .await
            .context("Failed to broadcast signed transaction")?;
        let hash = *pending.tx_hash();
        debug!(tx_hash = %super::hash_hex(&hash), nonce = ?tx.nonce, "Broadcast");
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .context("eth_getTransactionReceipt failed")?;
        let Some(receipt) = receipt else {
            return Ok(None);
        };
        Ok(Some(TxReceipt {
            transaction_hash: receipt.transaction_hash(),
            block_number: receipt.block_number().context("Receipt without block number")?,
            status: receipt.status(),
            gas_used: receipt.gas_used(),
        }))
    }

    async fn call(&self, tx: &TxRequest) -> Result<Vec<u8>> {
        let raw = self
            .provider
            .call(to_rpc_request(tx, None)?)
            .await
            .context("eth_call failed")?;
        Ok(raw.to_vec())
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.provider
            .get_balance(address)
            .await
            .context("eth_getBalance failed")
    }

    async fn transaction_count(&self, address: Address) -> Result<u64> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .context("eth_getTransactionCount failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::TxKind;

    // Well-known development key, never funded on a real chain.
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn secret(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    #[test]
    fn test_request_carries_pinned_fields() {
        let mut tx = TxRequest::new(
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            vec![0xde, 0xad],
            U256::from(255),
        );
        tx.gas = Some(21000);
        tx.gas_price = Some(U256::from(22_000_000_000u64));
        tx.nonce = Some(7);

        let req = to_rpc_request(&tx, Some(1)).unwrap();
        assert_eq!(req.from, Some(Address::repeat_byte(1)));
        assert_eq!(req.to, Some(TxKind::Call(Address::repeat_byte(2))));
        assert_eq!(req.value, Some(U256::from(255)));
        assert_eq!(req.input.input().map(|b| b.to_vec()), Some(vec![0xde, 0xad]));
        assert_eq!(req.gas, Some(21000));
        assert_eq!(req.gas_price, Some(22_000_000_000u128));
        assert_eq!(req.nonce, Some(7));
        assert_eq!(req.chain_id, Some(1));
    }

    #[test]
    fn test_unpinned_fields_left_to_fillers() {
        let tx = TxRequest::new(Address::ZERO, Address::repeat_byte(2), vec![], U256::ZERO);
        let req = to_rpc_request(&tx, None).unwrap();
        assert!(req.gas.is_none());
        assert!(req.gas_price.is_none());
        assert!(req.nonce.is_none());
        assert!(req.chain_id.is_none());

        let mut huge = tx.clone();
        huge.gas_price = Some(U256::MAX);
        assert!(to_rpc_request(&huge, None).is_err());
    }

    #[test]
    fn test_signer_from_secret() {
        let signer = signer_from_secret(&secret(DEV_KEY)).unwrap();
        let expected: Address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap();
        assert_eq!(signer.address(), expected);
        assert!(signer_from_secret(&secret("0x1234")).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_node_is_an_error() {
        let ledger =
            ProviderLedger::connect(&secret("http://127.0.0.1:9"), &secret(DEV_KEY), None).unwrap();
        assert!(ledger.block_number().await.is_err());
        assert!(ProviderLedger::connect(&secret("not a url"), &secret(DEV_KEY), None).is_err());
    }
}
