// src/validator.rs
use std::sync::Arc;

use ethers::types::{Address, Bytes, U256};
use tracing::debug;

use crate::chain::{CallRequest, RelayChain};
use crate::entry_point::{self, EntryPointRevert};
use crate::error::{BundlerError, ChainError};
use crate::types::{GasEstimate, SimulationResult, UserOperation};
use crate::user_op::{calldata_gas, now_millis};

pub const GAS_BUFFER_PERCENT: u64 = 20;
pub const GAS_BUFFER_FLOOR: u64 = 50_000;
/// Fixed part of `preVerificationGas` on top of the calldata cost.
pub const PRE_VERIFICATION_OVERHEAD: u64 = 21_000;
/// Verification limit used while measuring actual verification gas.
pub const VERIFICATION_GAS_PLACEHOLDER: u64 = 3_000_000;
/// Call gas used when the sender is not deployed yet and cannot be estimated.
pub const UNDEPLOYED_CALL_GAS: u64 = 200_000;
const DUMMY_SIGNATURE_LEN: usize = 65;

/// `v + max(v * pct / 100, floor)`
pub fn buffered(value: U256, percent: u64, floor: u64) -> U256 {
    let pct = value.saturating_mul(U256::from(percent)) / U256::from(100);
    value.saturating_add(pct.max(U256::from(floor)))
}

fn gas_buffered(value: U256) -> U256 {
    buffered(value, GAS_BUFFER_PERCENT, GAS_BUFFER_FLOOR)
}

/// Runs operations against the entry point before the bundler commits to them.
pub struct Validator<C> {
    chain: Arc<C>,
    entry_point: Address,
    beneficiary: Address,
}

impl<C: RelayChain> Validator<C> {
    pub fn new(chain: Arc<C>, entry_point: Address, beneficiary: Address) -> Self {
        Self {
            chain,
            entry_point,
            beneficiary,
        }
    }

    pub async fn simulate(&self, op: &UserOperation) -> Result<SimulationResult, BundlerError> {
        let call = CallRequest {
            from: None,
            to: self.entry_point,
            data: entry_point::simulate_validation_calldata(op),
            value: U256::zero(),
        };
        let data = match self.chain.call(call).await {
            Ok(_) => {
                return Err(BundlerError::ValidationFailed(
                    "simulateValidation returned without reverting".into(),
                ))
            }
            Err(ChainError::Revert(data)) => data,
            Err(e) => return Err(BundlerError::ValidationFailed(e.to_string())),
        };

        let result = match EntryPointRevert::decode(&data) {
            EntryPointRevert::ValidationResult { sig_failed: true, .. } => {
                return Err(BundlerError::ValidationFailed(
                    "signature validation failed".into(),
                ))
            }
            EntryPointRevert::ValidationResult { result, .. } => result,
            EntryPointRevert::ValidationResultWithAggregation { aggregator, .. } => {
                return Err(BundlerError::ValidationFailed(format!(
                    "signature aggregator {aggregator:?} is not supported"
                )))
            }
            EntryPointRevert::FailedOp { reason, .. } => {
                return Err(BundlerError::ValidationFailed(reason))
            }
            EntryPointRevert::SignatureValidationFailed(aggregator) => {
                return Err(BundlerError::ValidationFailed(format!(
                    "signature validation failed for aggregator {aggregator:?}"
                )))
            }
            EntryPointRevert::Error(reason) => return Err(BundlerError::ValidationFailed(reason)),
            EntryPointRevert::Panic(code) => {
                return Err(BundlerError::ValidationFailed(format!("panic code {code:#x}")))
            }
            EntryPointRevert::Unknown(data) => {
                return Err(BundlerError::ValidationFailed(format!(
                    "unrecognized revert {data}"
                )))
            }
        };

        let now = now_millis() / 1000;
        if result.valid_until != 0 && result.valid_until < now {
            return Err(BundlerError::ValidationFailed(format!(
                "operation expired at {}",
                result.valid_until
            )));
        }
        debug!(sender = ?op.sender, pre_op_gas = %result.pre_op_gas, "simulation passed");
        Ok(result)
    }

    /// Fills in the gas fields the caller left at zero. Supplied values are kept.
    pub async fn estimate_gas(&self, op: &UserOperation) -> Result<GasEstimate, BundlerError> {
        let mut draft = op.clone();

        if draft.call_gas_limit.is_zero() {
            draft.call_gas_limit = self.estimate_call_gas(op).await?;
        }
        if draft.pre_verification_gas.is_zero() {
            draft.pre_verification_gas = self.pre_verification_gas(&draft);
        }
        if draft.verification_gas_limit.is_zero() {
            draft.verification_gas_limit = U256::from(VERIFICATION_GAS_PLACEHOLDER);
            let result = self.simulate(&draft).await?;
            let used = result.pre_op_gas.saturating_sub(draft.pre_verification_gas);
            draft.verification_gas_limit = gas_buffered(used);
        }

        Ok(GasEstimate {
            call_gas_limit: draft.call_gas_limit,
            verification_gas_limit: draft.verification_gas_limit,
            pre_verification_gas: draft.pre_verification_gas,
        })
    }

    async fn estimate_call_gas(&self, op: &UserOperation) -> Result<U256, BundlerError> {
        let call = CallRequest {
            from: Some(self.entry_point),
            to: op.sender,
            data: op.call_data.clone(),
            value: U256::zero(),
        };
        match self.chain.estimate_gas(call).await {
            Ok(gas) => Ok(gas_buffered(gas)),
            Err(e) if !op.init_code.is_empty() => {
                debug!(sender = ?op.sender, error = %e, "sender not deployed, using default call gas");
                Ok(gas_buffered(U256::from(UNDEPLOYED_CALL_GAS)))
            }
            Err(e) => Err(BundlerError::ValidationFailed(format!(
                "call gas estimation failed: {e}"
            ))),
        }
    }

    /// Calldata cost of a `handleOps` batch carrying just this operation.
    pub fn pre_verification_gas(&self, op: &UserOperation) -> U256 {
        let mut sized = op.clone();
        if sized.signature.is_empty() {
            sized.signature = Bytes::from(vec![0xff; DUMMY_SIGNATURE_LEN]);
        }
        for field in [
            &mut sized.pre_verification_gas,
            &mut sized.verification_gas_limit,
            &mut sized.call_gas_limit,
        ] {
            if field.is_zero() {
                *field = U256::from(u32::MAX);
            }
        }
        let payload = entry_point::handle_ops_calldata(&[sized], self.beneficiary);
        calldata_gas(&payload) + U256::from(PRE_VERIFICATION_OVERHEAD)
    }
}
