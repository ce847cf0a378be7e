// src/metrics.rs
//! Prometheus metrics and the ops HTTP server.

use std::convert::Infallible;
use std::sync::Arc;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use serde_json::json;
use tokio::task::JoinHandle;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Reply};

use crate::chain::RelayChain;
use crate::nonce::NonceManager;

const NAMESPACE: &str = "bundler";

pub struct Metrics {
    rpc_requests: IntCounterVec,
    rpc_failures: IntCounterVec,
    user_operations: IntCounterVec,
    queue_depth: IntGauge,
    submission_duration: Histogram,
    prefund_attempts: IntCounter,
    prefund_failures: IntCounter,
    registry: Arc<Registry>,
}

impl Metrics {
    pub fn new(registry: Arc<Registry>) -> prometheus::Result<Self> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(NAMESPACE)
                .const_label("VERSION", env!("CARGO_PKG_VERSION"))
        };
        let metrics = Metrics {
            rpc_requests: IntCounterVec::new(
                opts("rpc_requests_total", "JSON-RPC requests received"),
                &["method"],
            )?,
            rpc_failures: IntCounterVec::new(
                opts("rpc_failures_total", "JSON-RPC requests answered with an error"),
                &["method"],
            )?,
            user_operations: IntCounterVec::new(
                opts("user_operations_total", "User operations reaching a terminal state"),
                &["outcome"],
            )?,
            queue_depth: IntGauge::with_opts(opts(
                "queue_depth",
                "User operations queued or being submitted",
            ))?,
            submission_duration: Histogram::with_opts(
                HistogramOpts::new(
                    "submission_duration_seconds",
                    "Time from dequeue to terminal state",
                )
                .namespace(NAMESPACE)
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            )?,
            prefund_attempts: IntCounter::with_opts(opts(
                "prefund_attempts_total",
                "Deposits sent on behalf of senders",
            ))?,
            prefund_failures: IntCounter::with_opts(opts(
                "prefund_failures_total",
                "Deposits refused or failed",
            ))?,
            registry,
        };

        metrics.registry.register(Box::new(metrics.rpc_requests.clone()))?;
        metrics.registry.register(Box::new(metrics.rpc_failures.clone()))?;
        metrics.registry.register(Box::new(metrics.user_operations.clone()))?;
        metrics.registry.register(Box::new(metrics.queue_depth.clone()))?;
        metrics.registry.register(Box::new(metrics.submission_duration.clone()))?;
        metrics.registry.register(Box::new(metrics.prefund_attempts.clone()))?;
        metrics.registry.register(Box::new(metrics.prefund_failures.clone()))?;

        Ok(metrics)
    }

    pub fn rpc_request(&self, method: &str) {
        self.rpc_requests.with_label_values(&[method]).inc();
    }

    pub fn rpc_failure(&self, method: &str) {
        self.rpc_failures.with_label_values(&[method]).inc();
    }

    pub fn user_operation(&self, outcome: &str) {
        self.user_operations.with_label_values(&[outcome]).inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn observe_submission(&self, seconds: f64) {
        self.submission_duration.observe(seconds);
    }

    pub fn prefund_attempt(&self) {
        self.prefund_attempts.inc();
    }

    pub fn prefund_failure(&self) {
        self.prefund_failures.inc();
    }

    /// Gather available metrics into an encoded (plaintext) report.
    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let collected = self.registry.gather();
        let mut out = Vec::with_capacity(1024 * 16);
        prometheus::TextEncoder::new().encode(&collected, &mut out)?;
        Ok(out)
    }
}

async fn health<C: RelayChain>(chain: Arc<C>) -> Result<Response, Infallible> {
    let reply = match chain.block_number().await {
        Ok(block) => warp::reply::with_status(
            warp::reply::json(&json!({ "status": "ok", "blockNumber": block })),
            StatusCode::OK,
        ),
        Err(e) => warp::reply::with_status(
            warp::reply::json(&json!({ "status": "unavailable", "error": e.to_string() })),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
    };
    Ok(reply.into_response())
}

async fn ready<C: RelayChain>(
    chain: Arc<C>,
    nonces: Arc<NonceManager<C>>,
) -> Result<Response, Infallible> {
    let state = async {
        let block = chain.block_number().await?;
        let nonce = match nonces.peek().await {
            Some(n) => n,
            None => chain.pending_nonce().await?,
        };
        Ok::<_, crate::error::ChainError>((block, nonce))
    };
    let reply = match state.await {
        Ok((block, nonce)) => warp::reply::with_status(
            warp::reply::json(&json!({
                "status": "ready",
                "blockNumber": block,
                "pendingNonce": format!("{nonce:#x}"),
            })),
            StatusCode::OK,
        ),
        Err(e) => warp::reply::with_status(
            warp::reply::json(&json!({ "status": "unavailable", "error": e.to_string() })),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
    };
    Ok(reply.into_response())
}

fn metrics_reply(metrics: &Metrics) -> Response {
    let (body, status) = match metrics.gather() {
        Ok(body) => (body, StatusCode::OK),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (Vec::new(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    };
    warp::reply::with_status(
        warp::reply::with_header(body, "Content-Type", "text/plain; charset=utf-8"),
        status,
    )
    .into_response()
}

fn ops_routes<C: RelayChain>(
    metrics: Arc<Metrics>,
    chain: Arc<C>,
    nonces: Arc<NonceManager<C>>,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone + Send + Sync + 'static {
    let metrics_route = warp::path!("metrics")
        .and(warp::get())
        .map(move || metrics_reply(&metrics));

    let health_chain = chain.clone();
    let health_route = warp::path!("health")
        .and(warp::get())
        .and_then(move || health(health_chain.clone()));

    let ready_route = warp::path!("ready")
        .and(warp::get())
        .and_then(move || ready(chain.clone(), nonces.clone()));

    metrics_route.or(health_route).unify().or(ready_route).unify()
}

/// Serves `/metrics`, `/health` and `/ready` on `0.0.0.0:port`.
pub fn run_ops_server<C: RelayChain>(
    port: u16,
    metrics: Arc<Metrics>,
    chain: Arc<C>,
    nonces: Arc<NonceManager<C>>,
) -> JoinHandle<()> {
    tracing::info!(port, "starting ops server on 0.0.0.0:{port}");
    let routes = ops_routes(metrics, chain, nonces);
    tokio::spawn(async move {
        warp::serve(routes).run(([0, 0, 0, 0], port)).await;
    })
}
