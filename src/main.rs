// src/main.rs
use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use dotenv::dotenv;
use prometheus::Registry;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

use passkey_bundler::chain::{EthersChain, RelayChain};
use passkey_bundler::config::Config;
use passkey_bundler::metrics::{run_ops_server, Metrics};
use passkey_bundler::nonce::NonceManager;
use passkey_bundler::queue::{DepthCallback, WorkQueue};
use passkey_bundler::rate_limit::RateLimiter;
use passkey_bundler::rpc::{start_server, BundlerRpcImpl, RequestGuard};
use passkey_bundler::store::Store;
use passkey_bundler::submitter::Submitter;
use passkey_bundler::validator::Validator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Parse command line arguments
    let config = Config::parse();

    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level()?)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let chain = Arc::new(EthersChain::new(
        &config.private_key,
        config.chain_id,
        &config.rpc_url,
    )?);
    let node_chain_id = chain.chain_id().await?;
    if node_chain_id != config.chain_id {
        bail!(
            "configured chain id {} does not match node chain id {}",
            config.chain_id,
            node_chain_id
        );
    }

    let settings = config.submitter_settings(chain.signer_address())?;
    info!(
        entry_point = ?settings.entry_point,
        beneficiary = ?settings.beneficiary,
        chain_id = settings.chain_id,
        "bundler configured"
    );

    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(Metrics::new(registry)?);
    let store = Arc::new(Store::new(config.receipt_capacity, config.log_capacity));
    let nonces = Arc::new(NonceManager::new(chain.clone()));
    let validator = Validator::new(chain.clone(), settings.entry_point, settings.beneficiary);
    let submitter = Arc::new(Submitter::new(
        chain.clone(),
        nonces.clone(),
        store.clone(),
        metrics.clone(),
        settings,
    ));

    let depth_metrics = metrics.clone();
    let on_depth: DepthCallback = Box::new(move |depth| depth_metrics.set_queue_depth(depth));
    let queue = WorkQueue::with_depth_callback(
        submitter.clone(),
        config.queue_max_size,
        config.queue_concurrency,
        Some(on_depth),
    );

    if config.metrics_port != 0 {
        run_ops_server(config.metrics_port, metrics.clone(), chain.clone(), nonces);
    }

    let rpc = BundlerRpcImpl::new(
        chain,
        validator,
        queue,
        submitter,
        store,
        metrics,
        config.default_fund_wei(),
    );
    let guard = RequestGuard::new(
        config.api_keys(),
        Arc::new(RateLimiter::per_minute(config.rate_limit_per_minute)),
        config.trust_forwarded_for,
    );

    // Start the JSON-RPC server
    let (server_addr, server_handle) = start_server(config.listen_addr, rpc, guard).await?;
    info!("Starting ERC-4337 bundler RPC server on {}", server_addr);

    // Keep the server running until Ctrl+C is pressed
    tokio::signal::ctrl_c().await?;
    server_handle.stop()?;
    info!("Server stopped");

    Ok(())
}
