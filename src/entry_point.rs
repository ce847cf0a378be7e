// src/entry_point.rs
//! Calldata builders for the v0.6 entry point and the passkey account
//! factory, plus decoding of the structured reverts `simulateValidation`
//! produces.
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::id;

use crate::error::BundlerError;
use crate::types::{SimulationResult, UserOperation};

const USER_OP_TUPLE: &str =
    "(address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes)";

const VALIDATION_RESULT: &str =
    "ValidationResult((uint256,uint256,bool,uint48,uint48,bytes),(uint256,uint256),(uint256,uint256),(uint256,uint256))";
const VALIDATION_RESULT_WITH_AGGREGATION: &str =
    "ValidationResultWithAggregation((uint256,uint256,bool,uint48,uint48,bytes),(uint256,uint256),(uint256,uint256),(uint256,uint256),(address,(uint256,uint256)))";
const FAILED_OP: &str = "FailedOp(uint256,string)";
const SIGNATURE_VALIDATION_FAILED: &str = "SignatureValidationFailed(address)";
const ERROR_STRING: &str = "Error(string)";
const PANIC: &str = "Panic(uint256)";

fn with_selector(signature: &str, tokens: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(tokens));
    Bytes::from(data)
}

pub fn user_op_token(op: &UserOperation) -> Token {
    Token::Tuple(vec![
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::Bytes(op.init_code.to_vec()),
        Token::Bytes(op.call_data.to_vec()),
        Token::Uint(op.call_gas_limit),
        Token::Uint(op.verification_gas_limit),
        Token::Uint(op.pre_verification_gas),
        Token::Uint(op.max_fee_per_gas),
        Token::Uint(op.max_priority_fee_per_gas),
        Token::Bytes(op.paymaster_and_data.to_vec()),
        Token::Bytes(op.signature.to_vec()),
    ])
}

/// `handleOps(UserOperation[] ops, address beneficiary)`
pub fn handle_ops_calldata(ops: &[UserOperation], beneficiary: Address) -> Bytes {
    let ops = ops.iter().map(user_op_token).collect();
    with_selector(
        &format!("handleOps({USER_OP_TUPLE}[],address)"),
        &[Token::Array(ops), Token::Address(beneficiary)],
    )
}

/// `simulateValidation(UserOperation op)`, which always reverts.
pub fn simulate_validation_calldata(op: &UserOperation) -> Bytes {
    with_selector(
        &format!("simulateValidation({USER_OP_TUPLE})"),
        &[user_op_token(op)],
    )
}

pub fn balance_of_calldata(account: Address) -> Bytes {
    with_selector("balanceOf(address)", &[Token::Address(account)])
}

pub fn deposit_to_calldata(account: Address) -> Bytes {
    with_selector("depositTo(address)", &[Token::Address(account)])
}

pub fn create_account_calldata(qx: U256, qy: U256, salt: U256) -> Bytes {
    with_selector(
        "createAccount(uint256,uint256,uint256)",
        &[Token::Uint(qx), Token::Uint(qy), Token::Uint(salt)],
    )
}

pub fn get_address_calldata(qx: U256, qy: U256, salt: U256) -> Bytes {
    with_selector(
        "getAddress(uint256,uint256,uint256)",
        &[Token::Uint(qx), Token::Uint(qy), Token::Uint(salt)],
    )
}

pub fn decode_uint(data: &[u8]) -> Result<U256, BundlerError> {
    match abi::decode(&[ParamType::Uint(256)], data) {
        Ok(tokens) => match tokens.into_iter().next() {
            Some(Token::Uint(v)) => Ok(v),
            _ => Err(BundlerError::InvalidParams("expected uint256 return".into())),
        },
        Err(e) => Err(BundlerError::InvalidParams(format!("bad uint256 return: {e}"))),
    }
}

pub fn decode_address(data: &[u8]) -> Result<Address, BundlerError> {
    match abi::decode(&[ParamType::Address], data) {
        Ok(tokens) => match tokens.into_iter().next() {
            Some(Token::Address(a)) => Ok(a),
            _ => Err(BundlerError::InvalidParams("expected address return".into())),
        },
        Err(e) => Err(BundlerError::InvalidParams(format!("bad address return: {e}"))),
    }
}

/// Every revert shape `simulateValidation` can come back with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPointRevert {
    /// Clean simulation. The entry point reports success by reverting.
    ValidationResult {
        result: SimulationResult,
        sig_failed: bool,
    },
    /// Clean simulation that names a signature aggregator.
    ValidationResultWithAggregation {
        result: SimulationResult,
        aggregator: Address,
    },
    FailedOp { op_index: U256, reason: String },
    SignatureValidationFailed(Address),
    Error(String),
    Panic(U256),
    Unknown(Bytes),
}

fn return_info_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Bool,
        ParamType::Uint(48),
        ParamType::Uint(48),
        ParamType::Bytes,
    ])
}

fn stake_info_type() -> ParamType {
    ParamType::Tuple(vec![ParamType::Uint(256), ParamType::Uint(256)])
}

fn decode_return_info(token: &Token) -> Option<(SimulationResult, bool)> {
    let Token::Tuple(fields) = token else {
        return None;
    };
    match fields.as_slice() {
        [Token::Uint(pre_op_gas), Token::Uint(prefund), Token::Bool(sig_failed), Token::Uint(valid_after), Token::Uint(valid_until), _] => {
            Some((
                SimulationResult {
                    pre_op_gas: *pre_op_gas,
                    prefund: *prefund,
                    valid_after: valid_after.low_u64(),
                    valid_until: valid_until.low_u64(),
                },
                *sig_failed,
            ))
        }
        _ => None,
    }
}

impl EntryPointRevert {
    pub fn decode(data: &[u8]) -> Self {
        let unknown = || EntryPointRevert::Unknown(Bytes::from(data.to_vec()));
        if data.len() < 4 {
            return unknown();
        }
        let (selector, body) = data.split_at(4);

        let decoded = if selector == id(VALIDATION_RESULT) {
            abi::decode(
                &[return_info_type(), stake_info_type(), stake_info_type(), stake_info_type()],
                body,
            )
            .ok()
            .and_then(|tokens| decode_return_info(tokens.first()?))
            .map(|(result, sig_failed)| EntryPointRevert::ValidationResult { result, sig_failed })
        } else if selector == id(VALIDATION_RESULT_WITH_AGGREGATION) {
            let aggregator_info = ParamType::Tuple(vec![ParamType::Address, stake_info_type()]);
            abi::decode(
                &[
                    return_info_type(),
                    stake_info_type(),
                    stake_info_type(),
                    stake_info_type(),
                    aggregator_info,
                ],
                body,
            )
            .ok()
            .and_then(|tokens| {
                let (result, _) = decode_return_info(tokens.first()?)?;
                let aggregator = match tokens.get(4)? {
                    Token::Tuple(info) => match info.first()? {
                        Token::Address(a) => *a,
                        _ => return None,
                    },
                    _ => return None,
                };
                Some(EntryPointRevert::ValidationResultWithAggregation { result, aggregator })
            })
        } else if selector == id(FAILED_OP) {
            match abi::decode(&[ParamType::Uint(256), ParamType::String], body).ok().as_deref() {
                Some([Token::Uint(op_index), Token::String(reason)]) => {
                    Some(EntryPointRevert::FailedOp { op_index: *op_index, reason: reason.clone() })
                }
                _ => None,
            }
        } else if selector == id(SIGNATURE_VALIDATION_FAILED) {
            match abi::decode(&[ParamType::Address], body).ok().as_deref() {
                Some([Token::Address(a)]) => Some(EntryPointRevert::SignatureValidationFailed(*a)),
                _ => None,
            }
        } else if selector == id(ERROR_STRING) {
            match abi::decode(&[ParamType::String], body).ok().as_deref() {
                Some([Token::String(reason)]) => Some(EntryPointRevert::Error(reason.clone())),
                _ => None,
            }
        } else if selector == id(PANIC) {
            match abi::decode(&[ParamType::Uint(256)], body).ok().as_deref() {
                Some([Token::Uint(code)]) => Some(EntryPointRevert::Panic(*code)),
                _ => None,
            }
        } else {
            None
        };

        decoded.unwrap_or_else(unknown)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn stake() -> Token {
        Token::Tuple(vec![Token::Uint(U256::zero()), Token::Uint(U256::zero())])
    }

    fn return_info(result: SimulationResult, sig_failed: bool) -> Token {
        Token::Tuple(vec![
            Token::Uint(result.pre_op_gas),
            Token::Uint(result.prefund),
            Token::Bool(sig_failed),
            Token::Uint(U256::from(result.valid_after)),
            Token::Uint(U256::from(result.valid_until)),
            Token::Bytes(vec![]),
        ])
    }

    pub(crate) fn encode_validation_result(result: SimulationResult, sig_failed: bool) -> Bytes {
        with_selector(
            VALIDATION_RESULT,
            &[return_info(result, sig_failed), stake(), stake(), stake()],
        )
    }

    pub(crate) fn encode_aggregated_result(result: SimulationResult, aggregator: Address) -> Bytes {
        with_selector(
            VALIDATION_RESULT_WITH_AGGREGATION,
            &[
                return_info(result, false),
                stake(),
                stake(),
                stake(),
                Token::Tuple(vec![Token::Address(aggregator), stake()]),
            ],
        )
    }

    pub(crate) fn encode_signature_failure(aggregator: Address) -> Bytes {
        with_selector(SIGNATURE_VALIDATION_FAILED, &[Token::Address(aggregator)])
    }

    pub(crate) fn encode_panic(code: u64) -> Bytes {
        with_selector(PANIC, &[Token::Uint(U256::from(code))])
    }

    pub(crate) fn encode_failed_op(reason: &str) -> Bytes {
        with_selector(
            FAILED_OP,
            &[Token::Uint(U256::zero()), Token::String(reason.to_string())],
        )
    }

    #[test]
    fn decodes_validation_result() {
        let result = SimulationResult {
            pre_op_gas: U256::from(80_000),
            prefund: U256::from(1_000_000),
            valid_after: 5,
            valid_until: 99,
        };
        let data = encode_validation_result(result, false);
        assert_eq!(
            EntryPointRevert::decode(&data),
            EntryPointRevert::ValidationResult { result, sig_failed: false }
        );
    }

    #[test]
    fn decodes_failed_op_and_error_string() {
        assert_eq!(
            EntryPointRevert::decode(&encode_failed_op("AA21 didn't pay prefund")),
            EntryPointRevert::FailedOp {
                op_index: U256::zero(),
                reason: "AA21 didn't pay prefund".into()
            }
        );
        let data = with_selector(ERROR_STRING, &[Token::String("nope".into())]);
        assert_eq!(EntryPointRevert::decode(&data), EntryPointRevert::Error("nope".into()));
    }

    #[test]
    fn decodes_aggregated_validation_result() {
        let result = SimulationResult {
            pre_op_gas: U256::from(120_000),
            prefund: U256::from(7),
            valid_after: 0,
            valid_until: 0,
        };
        let aggregator = Address::from_low_u64_be(0xa66);
        assert_eq!(
            EntryPointRevert::decode(&encode_aggregated_result(result, aggregator)),
            EntryPointRevert::ValidationResultWithAggregation { result, aggregator }
        );
    }

    #[test]
    fn decodes_signature_failure_and_panic() {
        let aggregator = Address::from_low_u64_be(0x51);
        assert_eq!(
            EntryPointRevert::decode(&encode_signature_failure(aggregator)),
            EntryPointRevert::SignatureValidationFailed(aggregator)
        );
        assert_eq!(
            EntryPointRevert::decode(&encode_panic(0x11)),
            EntryPointRevert::Panic(U256::from(0x11))
        );
    }

    #[test]
    fn truncated_aggregation_body_is_unknown() {
        let data = encode_aggregated_result(SimulationResult::default(), Address::zero());
        let truncated = &data[..data.len() - 32];
        assert!(matches!(EntryPointRevert::decode(truncated), EntryPointRevert::Unknown(_)));
    }

    #[test]
    fn unknown_selector_is_preserved() {
        let data = vec![0xde, 0xad, 0xbe, 0xef, 0x01];
        assert_eq!(
            EntryPointRevert::decode(&data),
            EntryPointRevert::Unknown(Bytes::from(data.clone()))
        );
        assert!(matches!(EntryPointRevert::decode(&[0x01]), EntryPointRevert::Unknown(_)));
    }

    #[test]
    fn handle_ops_uses_handle_ops_selector() {
        let data = handle_ops_calldata(&[UserOperation::default()], Address::zero());
        assert_eq!(
            &data[..4],
            &id("handleOps((address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes)[],address)")[..]
        );
    }
}
