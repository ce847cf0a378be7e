// src/lib.rs
//! ERC-4337 bundler for passkey smart accounts.
//!
//! Accepts user operations over JSON-RPC, validates them against the entry
//! point, and submits them one per `handleOps` transaction from a single
//! signer account.

pub mod chain;
pub mod config;
pub mod entry_point;
pub mod error;
pub mod metrics;
pub mod nonce;
pub mod queue;
pub mod rate_limit;
pub mod rpc;
pub mod store;
pub mod submitter;
pub mod types;
pub mod user_op;
pub mod validator;

#[cfg(test)]
mod test_utils;
