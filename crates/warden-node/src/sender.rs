//! Peer client
//!
//! One lazily-built HTTPS client per peer, presenting this server's
//! certificate and pinning the peer's expected CN: requests are addressed to
//! `https://<peer-name>:<port>` with DNS overridden to the configured
//! endpoint, so standard webpki verification enforces that the certificate
//! the peer presents was issued for its configured name.
//!
//! Peer messages are idempotent; transport failures are retried with
//! exponential backoff (base 100 ms, cap 30 s) until the retry deadline.

use crate::error::NodeError;
use crate::messages::{
    AbortRequest, CommitRequest, ContributeRequest, ContributeResponse, PrepareRequest,
    RequestState, StateResponse, VerifyAndSignRequest, VerifyAndSignResponse,
};
use crate::peers::Peer;
use crate::process::ProcessTransport;
use crate::tls::TlsMaterial;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use warden_core::{Error, Result};

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Exponential backoff schedule for retry `attempt` (0-based)
fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(BACKOFF_CAP)
}

enum Attempt {
    /// Worth retrying: connection refused, timeout, 5xx
    Retry(Error),
    /// The peer answered and said no
    Terminal(Error),
}

pub struct Sender {
    tls: Arc<TlsMaterial>,
    clients: DashMap<u64, reqwest::Client>,
    /// Per-request timeout
    request_timeout: Duration,
    /// Total budget for one logical send including retries
    retry_deadline: Duration,
}

impl Sender {
    pub fn new(tls: Arc<TlsMaterial>, request_timeout: Duration, retry_deadline: Duration) -> Self {
        Self {
            tls,
            clients: DashMap::new(),
            request_timeout,
            retry_deadline,
        }
    }

    async fn client(&self, peer: &Peer) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.get(&peer.id) {
            return Ok(client.clone());
        }

        let address = tokio::net::lookup_host(&peer.address)
            .await
            .map_err(|e| Error::Unavailable(format!("cannot resolve {}: {e}", peer.address)))?
            .next()
            .ok_or_else(|| {
                Error::Unavailable(format!("{} resolves to no addresses", peer.address))
            })?;
        let config = self
            .tls
            .client_config()
            .map_err(|e: NodeError| Error::Internal(e.to_string()))?;

        let client = reqwest::Client::builder()
            .use_preconfigured_tls(config)
            .resolve(&peer.name, address)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("cannot build peer client: {e}")))?;
        self.clients.insert(peer.id, client.clone());
        Ok(client)
    }

    fn url(&self, peer: &Peer, path: &str) -> Result<String> {
        let port = peer
            .address
            .rsplit_once(':')
            .map(|(_, port)| port)
            .ok_or_else(|| Error::Invalid(format!("peer address {} has no port", peer.address)))?;
        Ok(format!("https://{}:{port}{path}", peer.name))
    }

    async fn try_post<B: Serialize, T: DeserializeOwned>(
        &self,
        peer: &Peer,
        path: &str,
        body: &B,
    ) -> std::result::Result<T, Attempt> {
        let client = self.client(peer).await.map_err(Attempt::Retry)?;
        let url = self.url(peer, path).map_err(Attempt::Terminal)?;

        let response = client.post(&url).json(body).send().await.map_err(|e| {
            Attempt::Retry(Error::Unavailable(format!("peer {} unreachable: {e}", peer.id)))
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Attempt::Retry(Error::Unavailable(format!(
                "peer {} returned {status}",
                peer.id
            ))));
        }
        if !status.is_success() {
            return Err(Attempt::Terminal(Error::Internal(format!(
                "peer {} returned {status}",
                peer.id
            ))));
        }
        response.json::<T>().await.map_err(|e| {
            Attempt::Terminal(Error::Internal(format!(
                "bad response from peer {}: {e}",
                peer.id
            )))
        })
    }

    /// Send with retries until the retry deadline
    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        peer: &Peer,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            match self.try_post(peer, path, body).await {
                Ok(value) => return Ok(value),
                Err(Attempt::Terminal(error)) => return Err(error),
                Err(Attempt::Retry(error)) => {
                    let delay = backoff_delay(attempt);
                    if started.elapsed() + delay >= self.retry_deadline {
                        return Err(error);
                    }
                    debug!(
                        peer = peer.id,
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying peer call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    // State-only endpoints surface the peer's refusal as an error.
    fn expect_succeeded(peer: &Peer, response: StateResponse) -> Result<()> {
        if response.state == RequestState::Succeeded {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "peer {} refused: {}",
                peer.id,
                response.error.unwrap_or_else(|| format!("{:?}", response.state))
            )))
        }
    }
}

#[async_trait]
impl ProcessTransport for Sender {
    async fn prepare(&self, peer: &Peer, request: &PrepareRequest) -> Result<()> {
        let response = self
            .post_json::<_, StateResponse>(peer, "/v1/process/prepare", request)
            .await?;
        Self::expect_succeeded(peer, response)
    }

    async fn commit(&self, peer: &Peer, request: &CommitRequest) -> Result<()> {
        let response = self
            .post_json::<_, StateResponse>(peer, "/v1/process/commit", request)
            .await?;
        Self::expect_succeeded(peer, response)
    }

    async fn verify_and_sign(
        &self,
        peer: &Peer,
        request: &VerifyAndSignRequest,
    ) -> Result<VerifyAndSignResponse> {
        self.post_json(peer, "/v1/process/verify-and-sign", request)
            .await
    }

    async fn abort(&self, peer: &Peer, request: &AbortRequest) -> Result<()> {
        let response = self
            .post_json::<_, StateResponse>(peer, "/v1/process/abort", request)
            .await?;
        // An abort that cannot land is only logged; the session will expire.
        if response.state != RequestState::Succeeded {
            warn!(peer = peer.id, "peer did not acknowledge abort");
        }
        Ok(())
    }

    async fn contribute(
        &self,
        peer: &Peer,
        request: &ContributeRequest,
    ) -> Result<ContributeResponse> {
        self.post_json(peer, "/v1/process/contribute", request)
            .await
    }
}
