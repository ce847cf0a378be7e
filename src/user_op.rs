// src/user_op.rs
use std::time::{SystemTime, UNIX_EPOCH};

use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

use crate::error::BundlerError;
use crate::types::{UserOperation, UserOperationRequest};

/// Calldata cost per zero byte.
pub const ZERO_BYTE_GAS: u64 = 4;
/// Calldata cost per non-zero byte.
pub const NON_ZERO_BYTE_GAS: u64 = 16;

/// ERC-4337 v0.6 operation hash.
///
/// The packed struct uses 32-byte ABI words with the dynamic fields replaced
/// by their keccak hashes, and the result is hashed again together with the
/// entry point and chain id. This has to match `EntryPoint.getUserOpHash`.
pub fn compute_hash(op: &UserOperation, entry_point: Address, chain_id: u64) -> H256 {
    let packed = abi::encode(&[
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::FixedBytes(keccak256(&op.init_code).to_vec()),
        Token::FixedBytes(keccak256(&op.call_data).to_vec()),
        Token::Uint(op.call_gas_limit),
        Token::Uint(op.verification_gas_limit),
        Token::Uint(op.pre_verification_gas),
        Token::Uint(op.max_fee_per_gas),
        Token::Uint(op.max_priority_fee_per_gas),
        Token::FixedBytes(keccak256(&op.paymaster_and_data).to_vec()),
    ]);
    let inner = keccak256(packed);

    let outer = abi::encode(&[
        Token::FixedBytes(inner.to_vec()),
        Token::Address(entry_point),
        Token::Uint(U256::from(chain_id)),
    ]);
    H256(keccak256(outer))
}

/// Converts the wire representation into a typed operation.
///
/// Omitted gas fields come back as zero and are filled in by gas estimation.
pub fn normalize(req: &UserOperationRequest) -> Result<UserOperation, BundlerError> {
    let op = UserOperation {
        sender: parse_address("sender", &req.sender)?,
        nonce: parse_quantity("nonce", &req.nonce)?,
        init_code: parse_optional_bytes("initCode", req.init_code.as_deref())?,
        call_data: parse_bytes("callData", &req.call_data)?,
        call_gas_limit: parse_optional_quantity("callGasLimit", req.call_gas_limit.as_deref())?,
        verification_gas_limit: parse_optional_quantity(
            "verificationGasLimit",
            req.verification_gas_limit.as_deref(),
        )?,
        pre_verification_gas: parse_optional_quantity(
            "preVerificationGas",
            req.pre_verification_gas.as_deref(),
        )?,
        max_fee_per_gas: parse_quantity("maxFeePerGas", &req.max_fee_per_gas)?,
        max_priority_fee_per_gas: parse_quantity(
            "maxPriorityFeePerGas",
            &req.max_priority_fee_per_gas,
        )?,
        paymaster_and_data: parse_optional_bytes(
            "paymasterAndData",
            req.paymaster_and_data.as_deref(),
        )?,
        signature: parse_optional_bytes("signature", req.signature.as_deref())?,
    };

    if op.max_priority_fee_per_gas > op.max_fee_per_gas {
        return Err(BundlerError::MalformedOperation(format!(
            "maxPriorityFeePerGas {} exceeds maxFeePerGas {}",
            op.max_priority_fee_per_gas, op.max_fee_per_gas
        )));
    }

    Ok(op)
}

/// Balance the sender must hold in the entry point to cover its own gas.
pub fn required_prefund(op: &UserOperation) -> U256 {
    op.call_gas_limit
        .saturating_add(op.verification_gas_limit)
        .saturating_add(op.pre_verification_gas)
        .saturating_mul(op.max_fee_per_gas)
}

/// Intrinsic calldata gas of a payload.
pub fn calldata_gas(data: &[u8]) -> U256 {
    let cost: u64 = data
        .iter()
        .map(|b| if *b == 0 { ZERO_BYTE_GAS } else { NON_ZERO_BYTE_GAS })
        .sum();
    U256::from(cost)
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn malformed(field: &str, reason: impl std::fmt::Display) -> BundlerError {
    BundlerError::MalformedOperation(format!("{field}: {reason}"))
}

fn strip_hex_prefix<'a>(field: &str, value: &'a str) -> Result<&'a str, BundlerError> {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| malformed(field, "expected 0x-prefixed hex"))
}

pub(crate) fn parse_quantity(field: &str, value: &str) -> Result<U256, BundlerError> {
    let digits = strip_hex_prefix(field, value)?;
    if digits.is_empty() {
        return Ok(U256::zero());
    }
    if digits.len() > 64 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(malformed(field, format!("invalid quantity {value}")));
    }
    U256::from_str_radix(digits, 16).map_err(|e| malformed(field, format!("{e:?}")))
}

fn parse_optional_quantity(field: &str, value: Option<&str>) -> Result<U256, BundlerError> {
    value.map_or(Ok(U256::zero()), |v| parse_quantity(field, v))
}

pub(crate) fn parse_bytes(field: &str, value: &str) -> Result<Bytes, BundlerError> {
    let digits = strip_hex_prefix(field, value)?;
    hex::decode(digits)
        .map(Bytes::from)
        .map_err(|e| malformed(field, e))
}

fn parse_optional_bytes(field: &str, value: Option<&str>) -> Result<Bytes, BundlerError> {
    value.map_or(Ok(Bytes::default()), |v| parse_bytes(field, v))
}

pub(crate) fn parse_address(field: &str, value: &str) -> Result<Address, BundlerError> {
    let raw = parse_bytes(field, value)?;
    if raw.len() != 20 {
        return Err(malformed(field, format!("expected 20 bytes, got {}", raw.len())));
    }
    Ok(Address::from_slice(&raw))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn entry_point() -> Address {
        Address::from_str("0x66a15edcc3b50a663e72f1457ffd49b9ae284ddc").unwrap()
    }

    fn request() -> UserOperationRequest {
        UserOperationRequest {
            sender: "0x1306b01bc3e4ad202612d3843387e94737673f53".into(),
            nonce: "0x22ee".into(),
            init_code: None,
            call_data: "0xdeadbeef".into(),
            call_gas_limit: Some("0x2710".into()),
            verification_gas_limit: None,
            pre_verification_gas: Some("0x64".into()),
            max_fee_per_gas: "0x0a".into(),
            max_priority_fee_per_gas: "0x01".into(),
            paymaster_and_data: None,
            signature: Some("0x".into()),
        }
    }

    #[test]
    fn hash_of_zeroed_operation_matches_entry_point() {
        let hash = compute_hash(&UserOperation::default(), entry_point(), 1337);
        assert_eq!(
            hash,
            H256::from_str("0xdca97c3b49558ab360659f6ead939773be8bf26631e61bb17045bb70dc983b2d")
                .unwrap()
        );
    }

    #[test]
    fn hash_of_populated_operation_matches_entry_point() {
        let op = UserOperation {
            sender: Address::from_str("0x1306b01bc3e4ad202612d3843387e94737673f53").unwrap(),
            nonce: U256::from(8942),
            init_code: Bytes::from_str("0x6942069420694206942069420694206942069420").unwrap(),
            call_data: Bytes::from_str("0x0000000000000000000000000000000000000000080085").unwrap(),
            call_gas_limit: U256::from(10_000),
            verification_gas_limit: U256::from(100_000),
            pre_verification_gas: U256::from(100),
            max_fee_per_gas: U256::from(99_999),
            max_priority_fee_per_gas: U256::from(9_999_999),
            paymaster_and_data: Bytes::from_str(
                "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
            )
            .unwrap(),
            signature: Bytes::from_str(
                "0xda0929f527cded8d0a1eaf2e8861d7f7e2d8160b7b13942f99dd367df4473a",
            )
            .unwrap(),
        };
        let hash = compute_hash(&op, entry_point(), 1337);
        assert_eq!(
            hash,
            H256::from_str("0x484add9e4d8c3172d11b5feb6a3cc712280e176d278027cfa02ee396eb28afa1")
                .unwrap()
        );
        // signature is not part of the hash
        let mut resigned = op.clone();
        resigned.signature = Bytes::from(vec![1u8, 2, 3]);
        assert_eq!(compute_hash(&resigned, entry_point(), 1337), hash);
        assert_ne!(compute_hash(&op, entry_point(), 1), hash);
    }

    #[test]
    fn normalize_parses_hex_fields() {
        let op = normalize(&request()).unwrap();
        assert_eq!(op.nonce, U256::from(0x22ee));
        assert_eq!(op.call_gas_limit, U256::from(10_000));
        assert_eq!(op.verification_gas_limit, U256::zero());
        assert_eq!(op.call_data.to_vec(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(op.init_code.is_empty());
    }

    #[test]
    fn normalize_rejects_priority_fee_above_max_fee() {
        let mut req = request();
        req.max_priority_fee_per_gas = "0x0b".into();
        assert!(matches!(normalize(&req), Err(BundlerError::MalformedOperation(_))));
    }

    #[test]
    fn normalize_rejects_unprefixed_numbers() {
        let mut req = request();
        req.nonce = "12".into();
        assert!(matches!(normalize(&req), Err(BundlerError::MalformedOperation(_))));

        let mut req = request();
        req.max_fee_per_gas = "0xzz".into();
        assert!(matches!(normalize(&req), Err(BundlerError::MalformedOperation(_))));
    }

    #[test]
    fn normalize_rejects_short_address() {
        let mut req = request();
        req.sender = "0x1306b01bc3e4ad202612d3843387e94737673f".into();
        assert!(matches!(normalize(&req), Err(BundlerError::MalformedOperation(_))));
    }

    #[test]
    fn prefund_is_total_gas_times_max_fee() {
        let op = UserOperation {
            call_gas_limit: U256::from(1000),
            verification_gas_limit: U256::from(2000),
            pre_verification_gas: U256::from(3000),
            max_fee_per_gas: U256::from(10),
            ..Default::default()
        };
        assert_eq!(required_prefund(&op), U256::from(60_000));
    }

    #[test]
    fn calldata_gas_counts_zero_and_non_zero_bytes() {
        assert_eq!(calldata_gas(&[0, 0, 1, 0xff]), U256::from(4 + 4 + 16 + 16));
    }
}
