// src/config.rs
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use ethers::types::{Address, U256};
use tracing::Level;

use crate::submitter::SubmitterSettings;

/// Command line and environment configuration of the bundler.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "ERC-4337 bundler for passkey accounts", long_about = None)]
pub struct Config {
    /// Chain node JSON-RPC endpoint.
    #[clap(long, env = "RPC_URL")]
    pub rpc_url: String,

    /// Address of the entry point contract operations are relayed through.
    #[clap(long, env = "ENTRY_POINT")]
    pub entry_point: String,

    #[clap(long, env = "CHAIN_ID")]
    pub chain_id: u64,

    /// Hex private key of the account that signs batch transactions.
    #[clap(long, env = "BUNDLER_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: String,

    /// Receives the gas refund of each batch. Defaults to the signer.
    #[clap(long, env = "BENEFICIARY")]
    pub beneficiary: Option<String>,

    #[clap(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    pub listen_addr: SocketAddr,

    /// Port of the `/metrics`, `/health` and `/ready` server. 0 disables it.
    #[clap(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Accepted `x-api-key` values. Empty accepts every request.
    #[clap(long, env = "API_KEYS", value_delimiter = ',')]
    pub api_keys: Vec<String>,

    /// Requests per minute per caller. Zero or less disables limiting.
    #[clap(long, env = "RATE_LIMIT_PER_MINUTE", default_value_t = 60, allow_negative_numbers = true)]
    pub rate_limit_per_minute: i64,

    /// Key keyless callers by `x-forwarded-for`. Only enable behind a proxy
    /// that overwrites the header.
    #[clap(long, env = "TRUST_FORWARDED_FOR", default_value_t = false)]
    pub trust_forwarded_for: bool,

    #[clap(long, env = "QUEUE_MAX_SIZE", default_value_t = 100)]
    pub queue_max_size: usize,

    #[clap(long, env = "QUEUE_CONCURRENCY", default_value_t = 4)]
    pub queue_concurrency: usize,

    #[clap(long, env = "MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    #[clap(long, env = "FEE_BUMP_PERCENT", default_value_t = 15)]
    pub fee_bump_percent: u64,

    /// Minimum absolute fee increase per retry, in wei.
    #[clap(long, env = "FEE_BUMP_WEI", default_value_t = 1_000_000_000)]
    pub fee_bump_wei: u128,

    #[clap(long, env = "PREFUND_ENABLED", default_value_t = false)]
    pub prefund_enabled: bool,

    /// Largest deposit the bundler tops up for a single operation, in wei.
    #[clap(long, env = "MAX_PREFUND_WEI", default_value_t = 100_000_000_000_000_000)]
    pub max_prefund_wei: u128,

    /// Amount `passkey_fundAccount` deposits when the caller gives none, in wei.
    #[clap(long, env = "DEFAULT_FUND_WEI", default_value_t = 10_000_000_000_000_000)]
    pub default_fund_wei: u128,

    #[clap(long, env = "SUBMISSION_TIMEOUT_SECS", default_value_t = 60)]
    pub submission_timeout_secs: u64,

    #[clap(long, env = "FINALITY_DEPTH", default_value_t = 1)]
    pub finality_depth: usize,

    #[clap(long, env = "RECEIPT_CAPACITY", default_value_t = 1000)]
    pub receipt_capacity: usize,

    #[clap(long, env = "LOG_CAPACITY", default_value_t = 500)]
    pub log_capacity: usize,

    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn entry_point(&self) -> anyhow::Result<Address> {
        parse_address(&self.entry_point).context("invalid ENTRY_POINT")
    }

    /// Configured beneficiary, or `signer` when none is set.
    pub fn beneficiary(&self, signer: Address) -> anyhow::Result<Address> {
        match &self.beneficiary {
            Some(raw) => parse_address(raw).context("invalid BENEFICIARY"),
            None => Ok(signer),
        }
    }

    pub fn log_level(&self) -> anyhow::Result<Level> {
        Level::from_str(&self.log_level).map_err(|_| anyhow!("invalid LOG_LEVEL {}", self.log_level))
    }

    pub fn default_fund_wei(&self) -> U256 {
        U256::from(self.default_fund_wei)
    }

    /// API keys with surrounding whitespace and empty entries removed.
    pub fn api_keys(&self) -> Vec<String> {
        self.api_keys
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }

    pub fn submitter_settings(&self, signer: Address) -> anyhow::Result<SubmitterSettings> {
        Ok(SubmitterSettings {
            entry_point: self.entry_point()?,
            chain_id: self.chain_id,
            beneficiary: self.beneficiary(signer)?,
            max_attempts: self.max_attempts,
            fee_bump_percent: self.fee_bump_percent,
            fee_bump_wei: U256::from(self.fee_bump_wei),
            prefund_enabled: self.prefund_enabled,
            max_prefund_wei: U256::from(self.max_prefund_wei),
            submission_timeout: Duration::from_secs(self.submission_timeout_secs),
            finality_depth: self.finality_depth,
        })
    }
}

fn parse_address(raw: &str) -> anyhow::Result<Address> {
    let digits = raw.trim().trim_start_matches("0x");
    let bytes = hex::decode(digits)?;
    if bytes.len() != 20 {
        return Err(anyhow!("expected 20 bytes, got {}", bytes.len()));
    }
    Ok(Address::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 9] = [
        "passkey-bundler",
        "--rpc-url",
        "http://localhost:8545",
        "--entry-point",
        "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789",
        "--chain-id",
        "1337",
        "--private-key",
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
    ];

    #[test]
    fn defaults_apply() {
        let config = Config::try_parse_from(REQUIRED).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.rate_limit_per_minute, 60);
        assert_eq!(config.queue_max_size, 100);
        assert_eq!(config.queue_concurrency, 4);
        assert!(config.api_keys().is_empty());
        assert!(!config.trust_forwarded_for);
        assert_eq!(config.log_level().unwrap(), Level::INFO);

        let signer = Address::from_low_u64_be(7);
        let settings = config.submitter_settings(signer).unwrap();
        assert_eq!(settings.beneficiary, signer);
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.fee_bump_wei, U256::from(1_000_000_000u64));
        assert_eq!(settings.max_prefund_wei, U256::from(10u64).pow(U256::from(17)));
        assert!(!settings.prefund_enabled);
    }

    #[test]
    fn api_keys_split_on_commas() {
        let mut args = REQUIRED.to_vec();
        args.extend(["--api-keys", "alpha, beta,,gamma"]);
        let config = Config::try_parse_from(args).unwrap();
        assert_eq!(config.api_keys(), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn rejects_bad_entry_point() {
        let mut args = REQUIRED.to_vec();
        args[4] = "0x1234";
        let config = Config::try_parse_from(args).unwrap();
        assert!(config.entry_point().is_err());
    }
}
