// src/rpc.rs
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use ethers::types::{Address, H256, U256};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Request, Response, StatusCode};
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use serde_json::json;
use tower::{Layer, Service};
use tower_http::validate_request::{ValidateRequest, ValidateRequestHeaderLayer};
use tracing::{debug, info, warn};

use crate::chain::{CallRequest, RelayChain};
use crate::entry_point;
use crate::error::{BundlerError, ChainError, RATE_LIMITED_CODE};
use crate::metrics::Metrics;
use crate::queue::{SubmissionJob, WorkQueue};
use crate::rate_limit::RateLimiter;
use crate::store::Store;
use crate::submitter::Submitter;
use crate::types::{
    CreateAccountResponse, FundAccountResponse, GasEstimate, LogEntry, LogLevel, Receipt,
    UserOperation, UserOperationRequest,
};
use crate::user_op::{
    compute_hash, normalize, now_millis, parse_address, parse_bytes, parse_quantity,
    required_prefund,
};
use crate::validator::{buffered, Validator, GAS_BUFFER_FLOOR, GAS_BUFFER_PERCENT};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const ANONYMOUS_CALLER: &str = "anonymous";
const DEFAULT_LOG_LIMIT: usize = 100;
const ACCOUNT_SALT: u64 = 0;
/// Entry point revert code for a sender whose deposit cannot cover the prefund.
const UNPAID_PREFUND_CODE: &str = "AA21";

#[rpc(server)]
pub trait BundlerApi {
    #[method(name = "eth_chainId")]
    async fn chain_id(&self) -> RpcResult<String>;

    #[method(name = "eth_supportedEntryPoints")]
    async fn supported_entry_points(&self) -> RpcResult<Vec<Address>>;

    /// Validates and enqueues a user operation, returning its hash before inclusion.
    #[method(name = "eth_sendUserOperation")]
    async fn send_user_operation(
        &self,
        user_op: UserOperationRequest,
        entry_point: String,
    ) -> RpcResult<H256>;

    #[method(name = "eth_estimateUserOperationGas")]
    async fn estimate_user_operation_gas(
        &self,
        user_op: UserOperationRequest,
        entry_point: String,
    ) -> RpcResult<GasEstimate>;

    #[method(name = "eth_getUserOperationReceipt")]
    async fn get_user_operation_receipt(&self, hash: String) -> RpcResult<Option<Receipt>>;

    /// Deploys a passkey account for the public key `(qx, qy)` through `factory`.
    #[method(name = "passkey_createAccount")]
    async fn create_account(
        &self,
        qx: String,
        qy: String,
        factory: String,
    ) -> RpcResult<CreateAccountResponse>;

    /// Deposits into the entry point on behalf of `address`.
    #[method(name = "passkey_fundAccount")]
    async fn fund_account(
        &self,
        address: String,
        amount: Option<String>,
    ) -> RpcResult<FundAccountResponse>;

    #[method(name = "passkey_getLogs")]
    async fn get_logs(&self, limit: Option<usize>) -> RpcResult<Vec<LogEntry>>;
}

pub struct BundlerRpcImpl<C: RelayChain> {
    chain: Arc<C>,
    validator: Validator<C>,
    queue: WorkQueue<Submitter<C>>,
    submitter: Arc<Submitter<C>>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    default_fund_wei: U256,
    request_ids: AtomicU64,
}

fn invalid_param(err: BundlerError) -> BundlerError {
    match err {
        BundlerError::MalformedOperation(reason) => BundlerError::InvalidParams(reason),
        other => other,
    }
}

impl<C: RelayChain> BundlerRpcImpl<C> {
    pub fn new(
        chain: Arc<C>,
        validator: Validator<C>,
        queue: WorkQueue<Submitter<C>>,
        submitter: Arc<Submitter<C>>,
        store: Arc<Store>,
        metrics: Arc<Metrics>,
        default_fund_wei: U256,
    ) -> Self {
        Self {
            chain,
            validator,
            queue,
            submitter,
            store,
            metrics,
            default_fund_wei,
            request_ids: AtomicU64::new(1),
        }
    }

    fn entry_point(&self) -> Address {
        self.submitter.settings().entry_point
    }

    /// Counts the call and maps a failure into a JSON-RPC error object.
    fn finish<T>(&self, method: &str, result: Result<T, BundlerError>) -> RpcResult<T> {
        self.metrics.rpc_request(method);
        result.map_err(|e| {
            self.metrics.rpc_failure(method);
            debug!(method, code = e.code(), error = %e, "rpc call failed");
            e.into()
        })
    }

    fn check_entry_point(&self, raw: &str) -> Result<(), BundlerError> {
        let requested = parse_address("entryPoint", raw).map_err(invalid_param)?;
        if requested != self.entry_point() {
            return Err(BundlerError::InvalidParams(format!(
                "unsupported entry point {requested:?}, expected {:?}",
                self.entry_point()
            )));
        }
        Ok(())
    }

    async fn send(
        &self,
        request: UserOperationRequest,
        entry_point: String,
    ) -> Result<H256, BundlerError> {
        self.check_entry_point(&entry_point)?;
        let mut op = normalize(&request)?;

        let estimate = self.validator.estimate_gas(&op).await?;
        op.call_gas_limit = estimate.call_gas_limit;
        op.verification_gas_limit = estimate.verification_gas_limit;
        op.pre_verification_gas = estimate.pre_verification_gas;
        if let Err(e) = self.validator.simulate(&op).await {
            if !self.covered_by_prefund(&op, &e).await? {
                return Err(e);
            }
        }

        let settings = self.submitter.settings();
        let hash = compute_hash(&op, settings.entry_point, settings.chain_id);
        let request_id = self.request_ids.fetch_add(1, Ordering::Relaxed).to_string();
        let caller = current_caller();
        let sender = op.sender;

        self.queue.enqueue(SubmissionJob {
            op,
            hash,
            enqueued_at: now_millis(),
            caller: caller.clone(),
            request_id: request_id.clone(),
        })?;

        info!(?hash, ?sender, %caller, %request_id, "accepted user operation");
        self.store.log(
            LogLevel::Info,
            format!("accepted user operation from {sender:?} for {caller}"),
            Some(hash),
        );
        Ok(hash)
    }

    /// Whether a failed simulation only failed because the sender's deposit is
    /// short by an amount the engine will top up before submitting.
    async fn covered_by_prefund(
        &self,
        op: &UserOperation,
        err: &BundlerError,
    ) -> Result<bool, BundlerError> {
        let settings = self.submitter.settings();
        let unpaid = matches!(err, BundlerError::ValidationFailed(reason) if reason.starts_with(UNPAID_PREFUND_CODE));
        if !settings.prefund_enabled || !unpaid {
            return Ok(false);
        }

        let deposit = self.submitter.deposit_of(op.sender).await?;
        let shortfall = required_prefund(op).saturating_sub(deposit);
        if shortfall.is_zero() {
            return Ok(false);
        }
        if shortfall > settings.max_prefund_wei {
            return Err(BundlerError::PrefundExceeded {
                shortfall,
                ceiling: settings.max_prefund_wei,
            });
        }
        debug!(sender = ?op.sender, %shortfall, "admitting operation pending prefund");
        Ok(true)
    }

    async fn estimate(
        &self,
        request: UserOperationRequest,
        entry_point: String,
    ) -> Result<GasEstimate, BundlerError> {
        self.check_entry_point(&entry_point)?;
        let op = normalize(&request)?;
        self.validator.estimate_gas(&op).await
    }

    fn receipt(&self, raw: &str) -> Result<Option<Receipt>, BundlerError> {
        let bytes = parse_bytes("hash", raw).map_err(invalid_param)?;
        if bytes.len() != 32 {
            return Err(BundlerError::InvalidParams(format!(
                "hash: expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(self.store.get_receipt(&H256::from_slice(&bytes)))
    }

    async fn deploy_account(
        &self,
        qx: String,
        qy: String,
        factory: String,
    ) -> Result<CreateAccountResponse, BundlerError> {
        let qx = parse_quantity("qx", &qx).map_err(invalid_param)?;
        let qy = parse_quantity("qy", &qy).map_err(invalid_param)?;
        let factory = parse_address("factory", &factory).map_err(invalid_param)?;
        let salt = U256::from(ACCOUNT_SALT);

        let raw_account = self
            .chain
            .call(CallRequest {
                from: None,
                to: factory,
                data: entry_point::get_address_calldata(qx, qy, salt),
                value: U256::zero(),
            })
            .await?;
        let account = entry_point::decode_address(&raw_account)?;

        let data = entry_point::create_account_calldata(qx, qy, salt);
        let gas = self
            .chain
            .estimate_gas(CallRequest {
                from: Some(self.chain.signer_address()),
                to: factory,
                data: data.clone(),
                value: U256::zero(),
            })
            .await?;
        let outcome = self
            .submitter
            .send_and_wait(
                factory,
                data,
                U256::zero(),
                buffered(gas, GAS_BUFFER_PERCENT, GAS_BUFFER_FLOOR),
                None,
            )
            .await?;
        if !outcome.success {
            return Err(ChainError::Rpc(format!(
                "createAccount transaction {:?} reverted",
                outcome.transaction_hash
            ))
            .into());
        }

        info!(?account, ?factory, tx_hash = ?outcome.transaction_hash, "created passkey account");
        self.store
            .log(LogLevel::Info, format!("created account {account:?}"), None);
        Ok(CreateAccountResponse {
            account,
            transaction_id: outcome.transaction_hash,
        })
    }

    async fn deposit(
        &self,
        address: String,
        amount: Option<String>,
    ) -> Result<FundAccountResponse, BundlerError> {
        let account = parse_address("address", &address).map_err(invalid_param)?;
        let amount = match amount {
            Some(raw) => parse_quantity("amount", &raw).map_err(invalid_param)?,
            None => self.default_fund_wei,
        };

        let outcome = self
            .submitter
            .send_and_wait(
                self.entry_point(),
                entry_point::deposit_to_calldata(account),
                amount,
                U256::from(crate::submitter::DEPOSIT_GAS_LIMIT),
                None,
            )
            .await?;
        if !outcome.success {
            return Err(ChainError::Rpc(format!(
                "depositTo transaction {:?} reverted",
                outcome.transaction_hash
            ))
            .into());
        }

        info!(?account, %amount, tx_hash = ?outcome.transaction_hash, "funded account");
        self.store.log(
            LogLevel::Info,
            format!("deposited {amount} wei for {account:?}"),
            None,
        );
        Ok(FundAccountResponse {
            transaction_id: outcome.transaction_hash,
        })
    }
}

#[async_trait]
impl<C: RelayChain> BundlerApiServer for BundlerRpcImpl<C> {
    async fn chain_id(&self) -> RpcResult<String> {
        let chain_id = self.submitter.settings().chain_id;
        self.finish("eth_chainId", Ok(format!("{chain_id:#x}")))
    }

    async fn supported_entry_points(&self) -> RpcResult<Vec<Address>> {
        self.finish("eth_supportedEntryPoints", Ok(vec![self.entry_point()]))
    }

    async fn send_user_operation(
        &self,
        user_op: UserOperationRequest,
        entry_point: String,
    ) -> RpcResult<H256> {
        let result = self.send(user_op, entry_point).await;
        if let Err(e) = &result {
            self.store
                .log(LogLevel::Warn, format!("rejected user operation: {e}"), None);
        }
        self.finish("eth_sendUserOperation", result)
    }

    async fn estimate_user_operation_gas(
        &self,
        user_op: UserOperationRequest,
        entry_point: String,
    ) -> RpcResult<GasEstimate> {
        let result = self.estimate(user_op, entry_point).await;
        self.finish("eth_estimateUserOperationGas", result)
    }

    async fn get_user_operation_receipt(&self, hash: String) -> RpcResult<Option<Receipt>> {
        self.finish("eth_getUserOperationReceipt", self.receipt(&hash))
    }

    async fn create_account(
        &self,
        qx: String,
        qy: String,
        factory: String,
    ) -> RpcResult<CreateAccountResponse> {
        let result = self.deploy_account(qx, qy, factory).await;
        self.finish("passkey_createAccount", result)
    }

    async fn fund_account(
        &self,
        address: String,
        amount: Option<String>,
    ) -> RpcResult<FundAccountResponse> {
        let result = self.deposit(address, amount).await;
        self.finish("passkey_fundAccount", result)
    }

    async fn get_logs(&self, limit: Option<usize>) -> RpcResult<Vec<LogEntry>> {
        let logs = self.store.get_logs(limit.unwrap_or(DEFAULT_LOG_LIMIT));
        self.finish("passkey_getLogs", Ok(logs))
    }
}

/// Identity the admission middleware resolved for an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

tokio::task_local! {
    static CALLER: String;
}

/// Caller of the JSON-RPC request currently being handled, if it came
/// through [`CallerScopeLayer`].
pub fn current_caller() -> String {
    CALLER
        .try_with(|caller| caller.clone())
        .unwrap_or_else(|_| ANONYMOUS_CALLER.to_string())
}

/// HTTP-level admission check run before any JSON-RPC parsing: API key
/// allow-list, then the per-caller rate limit.
///
/// Callers are identified by API key. `x-forwarded-for` is only honoured when
/// the server sits behind a trusted proxy; otherwise keyless callers share
/// one bucket.
#[derive(Clone)]
pub struct RequestGuard {
    api_keys: Arc<HashSet<String>>,
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
}

impl RequestGuard {
    pub fn new(
        api_keys: impl IntoIterator<Item = String>,
        limiter: Arc<RateLimiter>,
        trust_forwarded_for: bool,
    ) -> Self {
        Self {
            api_keys: Arc::new(api_keys.into_iter().collect()),
            limiter,
            trust_forwarded_for,
        }
    }

    fn caller<B>(&self, request: &Request<B>) -> String {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let forwarded = || {
            header(FORWARDED_FOR_HEADER)
                .and_then(|v| v.split(',').next().map(|first| first.trim().to_string()))
                .filter(|v| !v.is_empty())
        };
        header(API_KEY_HEADER)
            .map(|key| format!("key:{key}"))
            .or_else(|| self.trust_forwarded_for.then(forwarded).flatten())
            .unwrap_or_else(|| ANONYMOUS_CALLER.to_string())
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

impl<B> ValidateRequest<B> for RequestGuard {
    type ResponseBody = Body;

    fn validate(&mut self, request: &mut Request<B>) -> Result<(), Response<Self::ResponseBody>> {
        if !self.api_keys.is_empty() {
            let key = request
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok());
            if !key.map_or(false, |k| self.api_keys.contains(k)) {
                warn!("rejected request with missing or unknown api key");
                return Err(json_response(
                    StatusCode::UNAUTHORIZED,
                    json!({ "error": "missing or invalid api key" }),
                ));
            }
        }

        let caller = self.caller(request);
        if !self.limiter.allow(&caller) {
            debug!(%caller, "rate limited");
            return Err(json_response(
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {
                        "code": RATE_LIMITED_CODE,
                        "message": BundlerError::RateLimited.to_string(),
                    },
                }),
            ));
        }
        request.extensions_mut().insert(Caller(caller));
        Ok(())
    }
}

/// Runs the inner service with the request's [`Caller`] in task-local scope,
/// where the JSON-RPC methods read it back through [`current_caller`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerScopeLayer;

impl<S> Layer<S> for CallerScopeLayer {
    type Service = CallerScope<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CallerScope { inner }
    }
}

#[derive(Debug, Clone)]
pub struct CallerScope<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for CallerScope<S>
where
    S: Service<Request<B>>,
    S::Future: Send + 'static,
    S::Response: 'static,
    S::Error: 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let caller = request
            .extensions()
            .get::<Caller>()
            .map(|c| c.0.clone())
            .unwrap_or_else(|| ANONYMOUS_CALLER.to_string());
        Box::pin(CALLER.scope(caller, self.inner.call(request)))
    }
}

/// Starts the JSON-RPC server behind the admission middleware.
pub async fn start_server<C: RelayChain>(
    server_addr: SocketAddr,
    rpc: BundlerRpcImpl<C>,
    guard: RequestGuard,
) -> anyhow::Result<(SocketAddr, ServerHandle)> {
    let middleware = tower::ServiceBuilder::new()
        .layer(ValidateRequestHeaderLayer::custom(guard))
        .layer(CallerScopeLayer);
    let server = ServerBuilder::default()
        .set_middleware(middleware)
        .build(server_addr)
        .await?;
    let local_addr = server.local_addr()?;
    let server_handle = server.start(rpc.into_rpc());

    Ok((local_addr, server_handle))
}
