// src/types.rs
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// A user operation with every numeric field parsed to an exact integer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

/// Wire form of a user operation as received over JSON-RPC.
///
/// Numeric fields are `0x`-prefixed hex strings. The three gas fields may be
/// omitted, in which case they are estimated before submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationRequest {
    pub sender: String,
    pub nonce: String,
    #[serde(default)]
    pub init_code: Option<String>,
    pub call_data: String,
    #[serde(default)]
    pub call_gas_limit: Option<String>,
    #[serde(default)]
    pub verification_gas_limit: Option<String>,
    #[serde(default)]
    pub pre_verification_gas: Option<String>,
    pub max_fee_per_gas: String,
    pub max_priority_fee_per_gas: String,
    #[serde(default)]
    pub paymaster_and_data: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

/// Fee pair of an EIP-1559 transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasFees {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Outcome of a clean `simulateValidation` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub pre_op_gas: U256,
    pub prefund: U256,
    pub valid_after: u64,
    pub valid_until: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Succeeded,
    Reverted,
    Failed,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Succeeded => "succeeded",
            ReceiptStatus::Reverted => "reverted",
            ReceiptStatus::Failed => "failed",
        }
    }
}

/// Terminal record of a submitted user operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub user_op_hash: H256,
    pub entry_point: Address,
    pub sender: Address,
    /// Signer chain nonce of the last batch transaction, if one was sent.
    pub nonce: Option<U256>,
    pub success: bool,
    pub status: ReceiptStatus,
    pub actual_gas_used: Option<U256>,
    pub actual_gas_cost: Option<U256>,
    pub reason: Option<String>,
    pub transaction_hash: Option<H256>,
    pub received_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_op_hash: Option<H256>,
}

/// Mined transaction as reported by the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutcome {
    pub transaction_hash: H256,
    pub success: bool,
    pub gas_used: U256,
    pub effective_gas_price: U256,
    pub block_number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountResponse {
    pub account: Address,
    pub transaction_id: H256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundAccountResponse {
    pub transaction_id: H256,
}
