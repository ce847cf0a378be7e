// src/submitter.rs
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use tracing::{error, info, warn};

use crate::chain::{CallRequest, RelayChain, SendRequest};
use crate::entry_point;
use crate::error::{BundlerError, ChainError};
use crate::metrics::Metrics;
use crate::nonce::NonceManager;
use crate::queue::{JobProcessor, SubmissionJob};
use crate::store::Store;
use crate::types::{GasFees, LogLevel, Receipt, ReceiptStatus, TxOutcome, UserOperation};
use crate::user_op::{compute_hash, now_millis, required_prefund};

/// Gas added on top of the operation's own limits for the `handleOps` frame.
pub const HANDLE_OPS_OVERHEAD: u64 = 100_000;
/// Gas limit of a `depositTo` transaction.
pub const DEPOSIT_GAS_LIMIT: u64 = 100_000;

#[derive(Debug, Clone)]
pub struct SubmitterSettings {
    pub entry_point: Address,
    pub chain_id: u64,
    pub beneficiary: Address,
    pub max_attempts: u32,
    pub fee_bump_percent: u64,
    pub fee_bump_wei: U256,
    pub prefund_enabled: bool,
    pub max_prefund_wei: U256,
    pub submission_timeout: Duration,
    pub finality_depth: usize,
}

/// Raises each fee by `max(fee * percent / 100, absolute)`, never past the ceiling.
pub fn bump_fees(current: GasFees, ceiling: GasFees, percent: u64, absolute: U256) -> GasFees {
    let bump = |fee: U256, cap: U256| {
        let pct = fee.saturating_mul(U256::from(percent)) / U256::from(100);
        fee.saturating_add(pct.max(absolute)).min(cap)
    };
    let max_fee_per_gas = bump(current.max_fee_per_gas, ceiling.max_fee_per_gas);
    let max_priority_fee_per_gas =
        bump(current.max_priority_fee_per_gas, ceiling.max_priority_fee_per_gas)
            .min(max_fee_per_gas);
    GasFees {
        max_fee_per_gas,
        max_priority_fee_per_gas,
    }
}

fn op_fee_ceiling(op: &UserOperation) -> GasFees {
    GasFees {
        max_fee_per_gas: op.max_fee_per_gas,
        max_priority_fee_per_gas: op.max_priority_fee_per_gas,
    }
}

/// What the engine knows about a job when it reaches a terminal state.
#[derive(Debug, Default)]
struct Progress {
    nonce: Option<U256>,
    transaction_hash: Option<H256>,
}

/// Drives a job from dequeue to a terminal receipt.
pub struct Submitter<C> {
    chain: Arc<C>,
    nonces: Arc<NonceManager<C>>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    settings: SubmitterSettings,
}

impl<C: RelayChain> Submitter<C> {
    pub fn new(
        chain: Arc<C>,
        nonces: Arc<NonceManager<C>>,
        store: Arc<Store>,
        metrics: Arc<Metrics>,
        settings: SubmitterSettings,
    ) -> Self {
        Self {
            chain,
            nonces,
            store,
            metrics,
            settings,
        }
    }

    pub fn settings(&self) -> &SubmitterSettings {
        &self.settings
    }

    /// Runs a job to completion and records its receipt. Never fails.
    pub async fn submit(&self, job: SubmissionJob) -> Receipt {
        let started = Instant::now();
        let mut progress = Progress::default();
        let result = self.run(&job, &mut progress).await;

        let (status, outcome, reason) = match result {
            Ok(outcome) if outcome.success => (ReceiptStatus::Succeeded, Some(outcome), None),
            Ok(outcome) => (
                ReceiptStatus::Reverted,
                Some(outcome),
                Some("handleOps transaction reverted".to_string()),
            ),
            Err(e) => {
                if matches!(e, BundlerError::PrefundExceeded { .. }) {
                    self.metrics.prefund_failure();
                }
                (ReceiptStatus::Failed, None, Some(e.to_string()))
            }
        };

        let receipt = Receipt {
            user_op_hash: job.hash,
            entry_point: self.settings.entry_point,
            sender: job.op.sender,
            nonce: progress.nonce,
            success: status == ReceiptStatus::Succeeded,
            status,
            actual_gas_used: outcome.map(|o| o.gas_used),
            actual_gas_cost: outcome.map(|o| o.gas_used.saturating_mul(o.effective_gas_price)),
            reason: reason.clone(),
            transaction_hash: outcome.map(|o| o.transaction_hash).or(progress.transaction_hash),
            received_at: job.enqueued_at,
            updated_at: now_millis(),
        };

        let message = match &reason {
            Some(reason) => format!("user operation {}: {reason}", status.as_str()),
            None => format!("user operation {}", status.as_str()),
        };
        let level = match status {
            ReceiptStatus::Succeeded => LogLevel::Info,
            ReceiptStatus::Reverted => LogLevel::Warn,
            ReceiptStatus::Failed => LogLevel::Error,
        };
        self.store.log(level, message, Some(job.hash));
        info!(
            hash = ?job.hash,
            sender = ?job.op.sender,
            status = status.as_str(),
            request_id = %job.request_id,
            "user operation finished"
        );

        self.metrics.user_operation(status.as_str());
        self.metrics.observe_submission(started.elapsed().as_secs_f64());
        self.store.save_receipt(receipt.clone());
        receipt
    }

    async fn run(
        &self,
        job: &SubmissionJob,
        progress: &mut Progress,
    ) -> Result<TxOutcome, BundlerError> {
        let computed = compute_hash(&job.op, self.settings.entry_point, self.settings.chain_id);
        if computed != job.hash {
            error!(expected = ?job.hash, ?computed, "user operation hash mismatch");
            return Err(BundlerError::HashMismatch {
                expected: job.hash,
                computed,
            });
        }

        let ceiling = op_fee_ceiling(&job.op);
        let mut fees = match self.chain.suggested_fees().await {
            Ok(suggested) => GasFees {
                max_fee_per_gas: suggested.max_fee_per_gas.min(ceiling.max_fee_per_gas),
                max_priority_fee_per_gas: suggested
                    .max_priority_fee_per_gas
                    .min(ceiling.max_priority_fee_per_gas),
            },
            Err(e) => {
                warn!(error = %e, "fee suggestion unavailable, using operation fees");
                ceiling
            }
        };

        if self.settings.prefund_enabled {
            self.ensure_prefund(job, fees).await?;
        }

        let data = entry_point::handle_ops_calldata(
            std::slice::from_ref(&job.op),
            self.settings.beneficiary,
        );
        let gas_limit = job
            .op
            .call_gas_limit
            .saturating_add(job.op.verification_gas_limit)
            .saturating_add(job.op.pre_verification_gas)
            .saturating_add(U256::from(HANDLE_OPS_OVERHEAD));

        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                fees = bump_fees(
                    fees,
                    ceiling,
                    self.settings.fee_bump_percent,
                    self.settings.fee_bump_wei,
                );
            }

            match self.attempt(job, &data, gas_limit, fees, progress).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(hash = ?job.hash, attempt, error = %e, "submission attempt failed");
                    self.store.log(
                        LogLevel::Warn,
                        format!("attempt {attempt} failed: {e}"),
                        Some(job.hash),
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(BundlerError::SubmissionExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn attempt(
        &self,
        job: &SubmissionJob,
        data: &Bytes,
        gas_limit: U256,
        fees: GasFees,
        progress: &mut Progress,
    ) -> Result<TxOutcome, ChainError> {
        // retries take a fresh nonce instead of replacing the previous transaction
        let nonce = self.nonces.reserve().await?;
        progress.nonce = Some(nonce);

        let tx_hash = self
            .chain
            .send_transaction(SendRequest {
                to: self.settings.entry_point,
                data: data.clone(),
                value: U256::zero(),
                nonce,
                gas_limit,
                max_fee_per_gas: fees.max_fee_per_gas,
                max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            })
            .await?;
        progress.transaction_hash = Some(tx_hash);
        info!(hash = ?job.hash, ?tx_hash, nonce = %nonce, "broadcast handleOps");

        self.chain
            .wait_for_transaction(
                tx_hash,
                self.settings.finality_depth,
                self.settings.submission_timeout,
            )
            .await
    }

    async fn ensure_prefund(&self, job: &SubmissionJob, fees: GasFees) -> Result<(), BundlerError> {
        let required = required_prefund(&job.op);
        let deposit = self.deposit_of(job.op.sender).await?;
        if deposit >= required {
            return Ok(());
        }

        let shortfall = required - deposit;
        if shortfall > self.settings.max_prefund_wei {
            warn!(sender = ?job.op.sender, %shortfall, "prefund shortfall above ceiling");
            return Err(BundlerError::PrefundExceeded {
                shortfall,
                ceiling: self.settings.max_prefund_wei,
            });
        }

        self.metrics.prefund_attempt();
        info!(sender = ?job.op.sender, %shortfall, "prefunding sender");
        let deposited = self
            .send_and_wait(
                self.settings.entry_point,
                entry_point::deposit_to_calldata(job.op.sender),
                shortfall,
                U256::from(DEPOSIT_GAS_LIMIT),
                Some(fees),
            )
            .await;
        match deposited {
            Ok(outcome) if outcome.success => {
                self.store.log(
                    LogLevel::Info,
                    format!("prefunded {shortfall} wei in {:?}", outcome.transaction_hash),
                    Some(job.hash),
                );
                Ok(())
            }
            Ok(outcome) => {
                self.metrics.prefund_failure();
                Err(BundlerError::Chain(ChainError::Rpc(format!(
                    "prefund transaction {:?} reverted",
                    outcome.transaction_hash
                ))))
            }
            Err(e) => {
                self.metrics.prefund_failure();
                Err(e.into())
            }
        }
    }

    /// The sender's balance held by the entry point.
    pub async fn deposit_of(&self, account: Address) -> Result<U256, BundlerError> {
        let data = self
            .chain
            .call(CallRequest {
                from: None,
                to: self.settings.entry_point,
                data: entry_point::balance_of_calldata(account),
                value: U256::zero(),
            })
            .await?;
        entry_point::decode_uint(&data)
    }

    /// Sends a signer transaction outside the user operation flow and waits
    /// for it to reach the finality depth.
    pub async fn send_and_wait(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
        gas_limit: U256,
        fees: Option<GasFees>,
    ) -> Result<TxOutcome, ChainError> {
        let fees = match fees {
            Some(fees) => fees,
            None => self.chain.suggested_fees().await?,
        };
        let nonce = self.nonces.reserve().await?;
        let tx_hash = self
            .chain
            .send_transaction(SendRequest {
                to,
                data,
                value,
                nonce,
                gas_limit,
                max_fee_per_gas: fees.max_fee_per_gas,
                max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            })
            .await?;
        self.chain
            .wait_for_transaction(
                tx_hash,
                self.settings.finality_depth,
                self.settings.submission_timeout,
            )
            .await
    }
}

#[async_trait]
impl<C: RelayChain> JobProcessor for Submitter<C> {
    async fn process(&self, job: SubmissionJob) {
        self.submit(job).await;
    }
}
