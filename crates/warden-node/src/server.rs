//! mTLS API server
//!
//! Terminates TLS itself so the CN of the verified client certificate is
//! available as the caller's identity: each accepted connection gets the
//! router with a [`ClientIdentity`] extension layered in. Process endpoints
//! are additionally restricted to certificates belonging to configured
//! peers.
//!
//! Rule-level outcomes (denied, not found, locked) travel inside the JSON
//! `state`, not as HTTP status codes.

use crate::error::{NodeError, Result};
use crate::messages::{
    decode_hash256, AbortRequest, AccountMessage, CommitRequest, ContributeRequest,
    ContributeResponse, GenerateRequest, GenerateResponse, GenerateWalletRequest,
    ListAccountsRequest, ListAccountsResponse, LockRequest, PrepareRequest, RequestState,
    SignBeaconAttestationRequest, SignBeaconProposalRequest, SignRequest, SignResponse,
    StateResponse, UnlockRequest, VerifyAndSignRequest, VerifyAndSignResponse,
};
use crate::peers::Peers;
use crate::process::Process;
use crate::tls::{self, TlsMaterial};
use axum::extract::{Extension, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use warden_core::lister::Lister;
use warden_core::manager::{AccountManager, WalletManager};
use warden_core::signer::SignerService;
use warden_core::{
    AccountPath, AccountSpecifier, AttestationData, Checkpoint, ClientContext, Error,
    ProposalData,
};

/// Caller identity resolved from the client certificate
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// CN of the validated certificate
    pub name: String,
    /// Remote IP
    pub ip: String,
    /// Whether the CN belongs to a configured peer
    pub is_peer: bool,
}

impl ClientIdentity {
    fn context(&self) -> ClientContext {
        ClientContext::new(self.name.clone(), self.ip.clone())
    }
}

/// Shared service graph behind the router
pub struct AppState {
    pub signer: Arc<SignerService>,
    pub lister: Lister,
    pub accounts: AccountManager,
    pub wallets: WalletManager,
    pub process: Arc<Process>,
    pub peers: Arc<Peers>,
    pub ready: AtomicBool,
    pub started_at: Instant,
}

pub struct ApiServer {
    state: Arc<AppState>,
    tls: Arc<TlsMaterial>,
    listen_address: String,
    request_timeout: Duration,
    shutdown_grace: Duration,
}

impl ApiServer {
    pub fn new(
        state: Arc<AppState>,
        tls: Arc<TlsMaterial>,
        listen_address: impl Into<String>,
    ) -> Self {
        Self {
            state,
            tls,
            listen_address: listen_address.into(),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/ready", get(ready))
            // Signing surface
            .route("/v1/signer/sign", post(sign))
            .route(
                "/v1/signer/sign-beacon-attestation",
                post(sign_beacon_attestation),
            )
            .route(
                "/v1/signer/sign-beacon-proposal",
                post(sign_beacon_proposal),
            )
            // Accounts
            .route("/v1/lister/accounts", post(list_accounts))
            .route("/v1/accounts/generate", post(generate))
            .route("/v1/accounts/unlock", post(unlock))
            .route("/v1/accounts/lock", post(lock))
            .route("/v1/wallets/generate", post(generate_wallet))
            // Peer protocol
            .route("/v1/process/prepare", post(process_prepare))
            .route("/v1/process/commit", post(process_commit))
            .route("/v1/process/verify-and-sign", post(process_verify_and_sign))
            .route("/v1/process/abort", post(process_abort))
            .route("/v1/process/contribute", post(process_contribute))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(self.request_timeout)),
            )
            .with_state(Arc::clone(&self.state))
    }

    /// Accept loop with graceful shutdown
    ///
    /// Readiness flips true once the listener is bound and false on the
    /// shutdown signal; in-flight requests then get a short drain window.
    pub async fn serve(self) -> Result<()> {
        let acceptor = TlsAcceptor::from(Arc::new(self.tls.server_config()?));
        let address: SocketAddr = self
            .listen_address
            .parse()
            .map_err(|e| NodeError::Address(format!("{}: {e}", self.listen_address)))?;
        let listener = TcpListener::bind(address).await?;
        let router = self.router();

        self.state.ready.store(true, Ordering::SeqCst);
        info!(address = %address, "server listening");

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let acceptor = acceptor.clone();
                            let router = router.clone();
                            let peers = Arc::clone(&self.state.peers);
                            tokio::spawn(async move {
                                if let Err(e) =
                                    serve_connection(acceptor, stream, remote, router, peers).await
                                {
                                    debug!(remote = %remote, error = %e, "connection closed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }

        self.state.ready.store(false, Ordering::SeqCst);
        info!("shutdown signal received, draining in-flight requests");
        tokio::time::sleep(self.shutdown_grace).await;
        info!("server stopped");
        Ok(())
    }
}

async fn serve_connection(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    remote: SocketAddr,
    router: Router,
    peers: Arc<Peers>,
) -> Result<()> {
    let stream = acceptor.accept(stream).await?;

    let common_name = {
        let (_, session) = stream.get_ref();
        session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(tls::common_name)
    };
    let Some(name) = common_name else {
        return Err(NodeError::Tls(format!(
            "client certificate from {remote} has no CN"
        )));
    };

    let identity = ClientIdentity {
        is_peer: peers.by_name(&name).is_some(),
        name,
        ip: remote.ip().to_string(),
    };
    let service = TowerToHyperService::new(router.layer(Extension(identity)));
    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
        .map_err(|e| NodeError::Tls(format!("connection from {remote}: {e}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "warden",
        "version": warden_core::VERSION,
    }))
}

async fn ready(State(state): State<Arc<AppState>>) -> (axum::http::StatusCode, Json<serde_json::Value>) {
    let ready = state.ready.load(Ordering::SeqCst);
    let status = if ready {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "ready": ready,
            "uptime_secs": state.started_at.elapsed().as_secs(),
        })),
    )
}

// Exactly one of account path and public key addresses the account.
fn account_specifier(
    account: &Option<String>,
    public_key: &Option<String>,
) -> std::result::Result<AccountSpecifier, Error> {
    match (account, public_key) {
        (Some(path), None) => Ok(AccountSpecifier::Path(path.parse()?)),
        (None, Some(key)) => Ok(AccountSpecifier::PublicKey(crate::messages::decode_bytes(
            key,
        )?)),
        _ => Err(Error::Invalid(
            "exactly one of account and public_key is required".into(),
        )),
    }
}

async fn sign(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<SignRequest>,
) -> Json<SignResponse> {
    let result = async {
        let specifier = account_specifier(&request.account, &request.public_key)?;
        let domain = decode_hash256(&request.domain)?;
        let signing_root = decode_hash256(&request.signing_root)?;
        state
            .signer
            .sign(&identity.context(), &specifier, domain, signing_root)
            .await
    }
    .await;

    match result {
        Ok(signature) => Json(SignResponse::succeeded(&signature)),
        Err(e) => Json(SignResponse::failed(&e)),
    }
}

async fn sign_beacon_attestation(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<SignBeaconAttestationRequest>,
) -> Json<SignResponse> {
    let result = async {
        let specifier = account_specifier(&request.account, &request.public_key)?;
        let domain = decode_hash256(&request.domain)?;
        let data = AttestationData {
            slot: request.slot,
            committee_index: request.committee_index,
            beacon_block_root: decode_hash256(&request.beacon_block_root)?,
            source: Checkpoint {
                epoch: request.source.epoch,
                root: decode_hash256(&request.source.root)?,
            },
            target: Checkpoint {
                epoch: request.target.epoch,
                root: decode_hash256(&request.target.root)?,
            },
        };
        state
            .signer
            .sign_beacon_attestation(&identity.context(), &specifier, domain, &data)
            .await
    }
    .await;

    match result {
        Ok(signature) => Json(SignResponse::succeeded(&signature)),
        Err(e) => Json(SignResponse::failed(&e)),
    }
}

async fn sign_beacon_proposal(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<SignBeaconProposalRequest>,
) -> Json<SignResponse> {
    let result = async {
        let specifier = account_specifier(&request.account, &request.public_key)?;
        let domain = decode_hash256(&request.domain)?;
        let data = ProposalData {
            slot: request.slot,
            proposer_index: request.proposer_index,
            parent_root: decode_hash256(&request.parent_root)?,
            state_root: decode_hash256(&request.state_root)?,
            body_root: decode_hash256(&request.body_root)?,
        };
        state
            .signer
            .sign_beacon_proposal(&identity.context(), &specifier, domain, &data)
            .await
    }
    .await;

    match result {
        Ok(signature) => Json(SignResponse::succeeded(&signature)),
        Err(e) => Json(SignResponse::failed(&e)),
    }
}

async fn list_accounts(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<ListAccountsRequest>,
) -> Json<ListAccountsResponse> {
    let accounts = state
        .lister
        .list_accounts(&identity.context(), &request.paths)
        .into_iter()
        .map(|summary| AccountMessage {
            path: summary.path,
            public_key: hex::encode(summary.public_key),
            distributed: summary.distributed,
        })
        .collect();
    Json(ListAccountsResponse {
        state: RequestState::Succeeded,
        accounts,
    })
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<GenerateRequest>,
) -> Json<GenerateResponse> {
    let result = async {
        let path: AccountPath = request.account.parse()?;
        match (request.signing_threshold, request.participants.as_ref()) {
            (Some(threshold), Some(participants)) => {
                state
                    .process
                    .generate_distributed(&identity.context(), &path, threshold, participants)
                    .await
            }
            (None, None) => {
                state
                    .accounts
                    .generate(&identity.context(), &path, &request.passphrase)
                    .await
            }
            _ => Err(Error::Invalid(
                "signing_threshold and participants must be supplied together".into(),
            )),
        }
    }
    .await;

    match result {
        Ok(public_key) => Json(GenerateResponse {
            state: RequestState::Succeeded,
            public_key: Some(hex::encode(public_key)),
            error: None,
        }),
        Err(e) => Json(GenerateResponse {
            state: RequestState::from_error(&e),
            public_key: None,
            error: Some(e.to_string()),
        }),
    }
}

async fn unlock(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<UnlockRequest>,
) -> Json<StateResponse> {
    let result = async {
        let path: AccountPath = request.account.parse()?;
        state
            .accounts
            .unlock(&identity.context(), &path, request.passphrase.as_deref())
            .await
    }
    .await;

    match result {
        Ok(()) => Json(StateResponse::succeeded()),
        Err(e) => Json(StateResponse::failed(&e)),
    }
}

async fn lock(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<LockRequest>,
) -> Json<StateResponse> {
    let result = async {
        let path: AccountPath = request.account.parse()?;
        state.accounts.lock(&identity.context(), &path).await
    }
    .await;

    match result {
        Ok(()) => Json(StateResponse::succeeded()),
        Err(e) => Json(StateResponse::failed(&e)),
    }
}

async fn generate_wallet(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<GenerateWalletRequest>,
) -> Json<StateResponse> {
    let result = state
        .wallets
        .generate_wallet(
            &identity.context(),
            &request.wallet,
            request.wallet_type.as_deref().unwrap_or(""),
        )
        .await;

    match result {
        Ok(()) => Json(StateResponse::succeeded()),
        Err(e) => Json(StateResponse::failed(&e)),
    }
}

// ============================================================================
// Peer protocol handlers (CN-restricted to configured peers)
// ============================================================================

fn peer_only(identity: &ClientIdentity) -> std::result::Result<(), StateResponse> {
    if identity.is_peer {
        Ok(())
    } else {
        warn!(client = %identity.name, "non-peer called a process endpoint");
        Err(StateResponse::not_permitted(
            "process endpoints are restricted to cluster peers",
        ))
    }
}

async fn process_prepare(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<PrepareRequest>,
) -> Json<StateResponse> {
    if let Err(response) = peer_only(&identity) {
        return Json(response);
    }
    match state.process.handle_prepare(request).await {
        Ok(()) => Json(StateResponse::succeeded()),
        Err(e) => Json(StateResponse::failed(&e)),
    }
}

async fn process_commit(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<CommitRequest>,
) -> Json<StateResponse> {
    if let Err(response) = peer_only(&identity) {
        return Json(response);
    }
    match state.process.handle_commit(request).await {
        Ok(()) => Json(StateResponse::succeeded()),
        Err(e) => Json(StateResponse::failed(&e)),
    }
}

async fn process_verify_and_sign(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<VerifyAndSignRequest>,
) -> Json<VerifyAndSignResponse> {
    let own_id = state.peers.own_id();
    if peer_only(&identity).is_err() {
        return Json(VerifyAndSignResponse {
            state: RequestState::NotPermitted,
            participant_id: own_id,
            group_public_key: None,
            partial_signature: None,
            error: Some("process endpoints are restricted to cluster peers".into()),
        });
    }
    match state.process.handle_verify_and_sign(request).await {
        Ok(response) => Json(response),
        Err(e) => Json(VerifyAndSignResponse {
            state: RequestState::from_error(&e),
            participant_id: own_id,
            group_public_key: None,
            partial_signature: None,
            error: Some(e.to_string()),
        }),
    }
}

async fn process_abort(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<AbortRequest>,
) -> Json<StateResponse> {
    if let Err(response) = peer_only(&identity) {
        return Json(response);
    }
    match state.process.handle_abort(&request) {
        Ok(()) => Json(StateResponse::succeeded()),
        Err(e) => Json(StateResponse::failed(&e)),
    }
}

async fn process_contribute(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<ContributeRequest>,
) -> Json<ContributeResponse> {
    let own_id = state.peers.own_id();
    if peer_only(&identity).is_err() {
        return Json(ContributeResponse {
            state: RequestState::NotPermitted,
            participant_id: own_id,
            partial_signature: None,
            error: Some("process endpoints are restricted to cluster peers".into()),
        });
    }
    match state
        .process
        .handle_contribute(&identity.context(), &request)
        .await
    {
        Ok(response) => Json(response),
        Err(e) => Json(ContributeResponse {
            state: RequestState::from_error(&e),
            participant_id: own_id,
            partial_signature: None,
            error: Some(e.to_string()),
        }),
    }
}
