// src/test_utils.rs
//! In-memory chain used by the engine and RPC tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use parking_lot::Mutex;

use crate::chain::{CallRequest, RelayChain, SendRequest};
use crate::entry_point::{self, tests::encode_failed_op, tests::encode_validation_result};
use crate::error::ChainError;
use crate::types::{GasFees, SimulationResult, TxOutcome, UserOperation};
use crate::user_op::required_prefund;

pub const FUNDED_SENDER: u64 = 0x1234;
const VERIFICATION_GAS_USED: u64 = 40_000;

#[derive(Default)]
struct FakeState {
    block: u64,
    pending_nonce: U256,
    deposits: HashMap<Address, U256>,
    sent: Vec<SendRequest>,
    mined: HashMap<H256, TxOutcome>,
    revert_next: usize,
    time_out_next: usize,
    reject_next: usize,
}

pub struct FakeChain {
    pub entry_point: Address,
    pub chain_id: u64,
    signer: Address,
    state: Mutex<FakeState>,
}

fn selector(data: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    if data.len() >= 4 {
        out.copy_from_slice(&data[..4]);
    }
    out
}

fn decode_user_op(body: &[u8]) -> Option<UserOperation> {
    let tuple = ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Bytes,
        ParamType::Bytes,
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Bytes,
        ParamType::Bytes,
    ]);
    let tokens = abi::decode(&[tuple], body).ok()?;
    let Some(Token::Tuple(fields)) = tokens.into_iter().next() else {
        return None;
    };
    let uint = |i: usize| fields.get(i).cloned().and_then(Token::into_uint);
    let bytes = |i: usize| fields.get(i).cloned().and_then(Token::into_bytes).map(Bytes::from);
    Some(UserOperation {
        sender: fields.first().cloned().and_then(Token::into_address)?,
        nonce: uint(1)?,
        init_code: bytes(2)?,
        call_data: bytes(3)?,
        call_gas_limit: uint(4)?,
        verification_gas_limit: uint(5)?,
        pre_verification_gas: uint(6)?,
        max_fee_per_gas: uint(7)?,
        max_priority_fee_per_gas: uint(8)?,
        paymaster_and_data: bytes(9)?,
        signature: bytes(10)?,
    })
}

fn decode_account(body: &[u8]) -> Option<Address> {
    abi::decode(&[ParamType::Address], body)
        .ok()?
        .into_iter()
        .next()?
        .into_address()
}

impl FakeChain {
    pub fn new() -> Self {
        Self {
            entry_point: Address::from_low_u64_be(0xe4),
            chain_id: 1337,
            signer: Address::from_low_u64_be(0x5167),
            state: Mutex::new(FakeState {
                block: 100,
                ..Default::default()
            }),
        }
    }

    pub fn revert_next(&self, n: usize) {
        self.state.lock().revert_next = n;
    }

    pub fn time_out_next(&self, n: usize) {
        self.state.lock().time_out_next = n;
    }

    pub fn reject_next(&self, n: usize) {
        self.state.lock().reject_next = n;
    }

    pub fn set_deposit(&self, account: Address, amount: U256) {
        self.state.lock().deposits.insert(account, amount);
    }

    pub fn deposit(&self, account: Address) -> U256 {
        self.state.lock().deposits.get(&account).copied().unwrap_or_default()
    }

    pub fn sent(&self) -> Vec<SendRequest> {
        self.state.lock().sent.clone()
    }

    fn simulate(&self, op: &UserOperation) -> Bytes {
        let required = required_prefund(op);
        if self.deposit(op.sender) < required {
            return encode_failed_op("AA21 didn't pay prefund");
        }
        encode_validation_result(
            SimulationResult {
                pre_op_gas: op.pre_verification_gas + U256::from(VERIFICATION_GAS_USED),
                prefund: required,
                valid_after: 0,
                valid_until: 0,
            },
            false,
        )
    }
}

/// A well-formed operation whose sender already holds a large deposit.
pub fn funded_op(chain: &FakeChain) -> UserOperation {
    let op = UserOperation {
        sender: Address::from_low_u64_be(FUNDED_SENDER),
        nonce: U256::zero(),
        call_data: Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
        call_gas_limit: U256::from(100_000),
        verification_gas_limit: U256::from(150_000),
        pre_verification_gas: U256::from(50_000),
        max_fee_per_gas: U256::from(1_000),
        max_priority_fee_per_gas: U256::from(100),
        signature: Bytes::from(vec![0x11; 65]),
        ..Default::default()
    };
    chain.set_deposit(op.sender, U256::from(10u64).pow(U256::from(18)));
    op
}

#[async_trait]
impl RelayChain for FakeChain {
    fn signer_address(&self) -> Address {
        self.signer
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().block)
    }

    async fn pending_nonce(&self) -> Result<U256, ChainError> {
        Ok(self.state.lock().pending_nonce)
    }

    async fn call(&self, req: CallRequest) -> Result<Bytes, ChainError> {
        let sel = selector(&req.data);
        let body = req.data.get(4..).unwrap_or_default();
        if sel == selector(&entry_point::balance_of_calldata(Address::zero())) {
            let account = decode_account(body).ok_or(ChainError::Revert(Bytes::default()))?;
            return Ok(Bytes::from(abi::encode(&[Token::Uint(self.deposit(account))])));
        }
        if sel == selector(&entry_point::simulate_validation_calldata(&UserOperation::default())) {
            let op = decode_user_op(body).ok_or(ChainError::Revert(Bytes::default()))?;
            return Err(ChainError::Revert(self.simulate(&op)));
        }
        if sel == selector(&entry_point::get_address_calldata(U256::zero(), U256::zero(), U256::zero())) {
            let hash = keccak256(body);
            return Ok(Bytes::from(abi::encode(&[Token::Address(Address::from_slice(&hash[12..]))])));
        }
        Ok(Bytes::default())
    }

    async fn estimate_gas(&self, _req: CallRequest) -> Result<U256, ChainError> {
        Ok(U256::from(50_000))
    }

    async fn suggested_fees(&self) -> Result<GasFees, ChainError> {
        Ok(GasFees {
            max_fee_per_gas: U256::from(100),
            max_priority_fee_per_gas: U256::from(10),
        })
    }

    async fn send_transaction(&self, req: SendRequest) -> Result<H256, ChainError> {
        let mut state = self.state.lock();
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return Err(ChainError::Rpc("replacement transaction underpriced".into()));
        }

        let mut preimage = [0u8; 64];
        req.nonce.to_big_endian(&mut preimage[..32]);
        U256::from(state.sent.len()).to_big_endian(&mut preimage[32..]);
        let tx_hash = H256(keccak256(preimage));

        let sel = selector(&req.data);
        let is_deposit = sel == selector(&entry_point::deposit_to_calldata(Address::zero()));
        let is_handle_ops = sel == selector(&entry_point::handle_ops_calldata(&[], Address::zero()));

        let success = if is_handle_ops && state.revert_next > 0 {
            state.revert_next -= 1;
            false
        } else {
            true
        };
        if is_deposit {
            if let Some(account) = decode_account(req.data.get(4..).unwrap_or_default()) {
                *state.deposits.entry(account).or_default() += req.value;
            }
        }

        state.sent.push(req);
        state.pending_nonce += U256::one();
        if state.time_out_next > 0 {
            state.time_out_next -= 1;
            return Ok(tx_hash);
        }
        state.block += 1;
        let block_number = state.block;
        state.mined.insert(
            tx_hash,
            TxOutcome {
                transaction_hash: tx_hash,
                success,
                gas_used: U256::from(120_000),
                effective_gas_price: U256::from(50),
                block_number,
            },
        );
        Ok(tx_hash)
    }

    async fn wait_for_transaction(
        &self,
        tx_hash: H256,
        _confirmations: usize,
        _timeout: Duration,
    ) -> Result<TxOutcome, ChainError> {
        self.state
            .lock()
            .mined
            .get(&tx_hash)
            .copied()
            .ok_or(ChainError::Timeout(tx_hash))
    }
}
