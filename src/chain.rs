// src/chain.rs
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::RpcError;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use tracing::{debug, info};

use crate::error::ChainError;
use crate::types::{GasFees, TxOutcome};

/// A read-only call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

/// A transaction the signer account signs and broadcasts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub nonce: U256,
    pub gas_limit: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Everything the bundler needs from the chain node and its own signer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayChain: Send + Sync + 'static {
    /// Address of the signer account that pays for batch transactions.
    fn signer_address(&self) -> Address;

    async fn chain_id(&self) -> Result<u64, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Transaction count of the signer including the pending block.
    async fn pending_nonce(&self) -> Result<U256, ChainError>;

    /// `eth_call`; a revert comes back as `ChainError::Revert` carrying the revert data.
    async fn call(&self, req: CallRequest) -> Result<Bytes, ChainError>;

    async fn estimate_gas(&self, req: CallRequest) -> Result<U256, ChainError>;

    /// Network fee suggestion for the next block.
    async fn suggested_fees(&self) -> Result<GasFees, ChainError>;

    /// Signs the request with the given nonce and broadcasts it.
    async fn send_transaction(&self, req: SendRequest) -> Result<H256, ChainError>;

    /// Waits until the transaction has `confirmations` blocks on top of it.
    async fn wait_for_transaction(
        &self,
        tx_hash: H256,
        confirmations: usize,
        timeout: Duration,
    ) -> Result<TxOutcome, ChainError>;
}

pub struct EthersChain {
    wallet: LocalWallet,
    client: Arc<Provider<Http>>,
    chain_id: u64,
    poll_interval: Duration,
}

impl EthersChain {
    pub fn new(private_key: &str, chain_id: u64, eth_rpc_url: &str) -> anyhow::Result<Self> {
        let wallet = private_key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()?
            .with_chain_id(chain_id);
        let provider = Provider::<Http>::try_from(eth_rpc_url)?;

        info!("Initialized signer with address: {:?}", wallet.address());

        Ok(Self {
            wallet,
            client: Arc::new(provider),
            chain_id,
            poll_interval: Duration::from_millis(500),
        })
    }
}

fn rpc_error(err: ProviderError) -> ChainError {
    if let Some(data) = revert_data(&err) {
        return ChainError::Revert(data);
    }
    ChainError::Rpc(err.to_string())
}

/// Pulls revert bytes out of a JSON-RPC error. Nodes put them either directly
/// in `data` or nested as `data.data`.
fn revert_data(err: &ProviderError) -> Option<Bytes> {
    let response = RpcError::as_error_response(err)?;
    let data = response.data.as_ref()?;
    let raw = match data {
        serde_json::Value::String(s) => s.as_str(),
        serde_json::Value::Object(map) => map.get("data")?.as_str()?,
        _ => return None,
    };
    raw.parse::<Bytes>().ok()
}

fn chain_id_from(id: U256) -> Result<u64, ChainError> {
    u64::try_from(id).map_err(|_| ChainError::Rpc(format!("chain id {id} does not fit in u64")))
}

fn typed_call(req: &CallRequest) -> TypedTransaction {
    let mut tx = Eip1559TransactionRequest::new()
        .to(req.to)
        .data(req.data.clone())
        .value(req.value);
    if let Some(from) = req.from {
        tx = tx.from(from);
    }
    TypedTransaction::Eip1559(tx)
}

#[async_trait]
impl RelayChain for EthersChain {
    fn signer_address(&self) -> Address {
        self.wallet.address()
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        let id = self.client.get_chainid().await.map_err(rpc_error)?;
        chain_id_from(id)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let number = self.client.get_block_number().await.map_err(rpc_error)?;
        Ok(number.as_u64())
    }

    async fn pending_nonce(&self) -> Result<U256, ChainError> {
        self.client
            .get_transaction_count(self.wallet.address(), Some(BlockNumber::Pending.into()))
            .await
            .map_err(rpc_error)
    }

    async fn call(&self, req: CallRequest) -> Result<Bytes, ChainError> {
        self.client
            .call(&typed_call(&req), None)
            .await
            .map_err(rpc_error)
    }

    async fn estimate_gas(&self, req: CallRequest) -> Result<U256, ChainError> {
        self.client
            .estimate_gas(&typed_call(&req), None)
            .await
            .map_err(rpc_error)
    }

    async fn suggested_fees(&self) -> Result<GasFees, ChainError> {
        let (max_fee_per_gas, max_priority_fee_per_gas) = self
            .client
            .estimate_eip1559_fees(None)
            .await
            .map_err(rpc_error)?;
        Ok(GasFees {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }

    async fn send_transaction(&self, req: SendRequest) -> Result<H256, ChainError> {
        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .from(self.wallet.address())
            .to(req.to)
            .data(req.data)
            .value(req.value)
            .nonce(req.nonce)
            .gas(req.gas_limit)
            .max_fee_per_gas(req.max_fee_per_gas)
            .max_priority_fee_per_gas(req.max_priority_fee_per_gas)
            .chain_id(self.chain_id)
            .into();

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| ChainError::Signer(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let pending = self
            .client
            .send_raw_transaction(raw)
            .await
            .map_err(rpc_error)?;
        let tx_hash = pending.tx_hash();
        debug!(?tx_hash, nonce = %req.nonce, "broadcast transaction");
        Ok(tx_hash)
    }

    async fn wait_for_transaction(
        &self,
        tx_hash: H256,
        confirmations: usize,
        timeout: Duration,
    ) -> Result<TxOutcome, ChainError> {
        let pending = PendingTransaction::new(tx_hash, self.client.as_ref())
            .interval(self.poll_interval)
            .confirmations(confirmations.max(1));

        let receipt = match tokio::time::timeout(timeout, pending).await {
            Err(_) => return Err(ChainError::Timeout(tx_hash)),
            Ok(result) => result.map_err(rpc_error)?,
        };
        let receipt = receipt.ok_or(ChainError::Dropped(tx_hash))?;

        Ok(TxOutcome {
            transaction_hash: receipt.transaction_hash,
            success: receipt.status == Some(U64::from(1)),
            gas_used: receipt.gas_used.unwrap_or_default(),
            effective_gas_price: receipt.effective_gas_price.unwrap_or_default(),
            block_number: receipt.block_number.map(|n| n.as_u64()).unwrap_or_default(),
        })
    }
}
