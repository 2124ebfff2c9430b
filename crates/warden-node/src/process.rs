//! Distributed key generation and threshold signing
//!
//! The process service plays both sides of the peer protocol: it coordinates
//! generations and signings it initiates, and participates in those driven
//! by other servers.
//!
//! Generation runs Prepare → Commit → VerifyAndSign (two waves) with Abort
//! as the bail-out. Nothing is persisted anywhere until a threshold-sized
//! subset's confirmation signatures have combined and verified under the
//! group key.
//!
//! Threshold signing collects Contribute partials; each peer re-runs its own
//! permission and slashing checks before contributing, so a coordinator can
//! never bypass another server's rule store.

use crate::messages::{
    decode_bytes, decode_hash256, AbortRequest, CommitRequest, ContributeRequest,
    ContributeResponse, ParticipantMessage, PrepareRequest, RequestState, VerifyAndSignRequest,
    VerifyAndSignResponse,
};
use crate::peers::{Peer, Peers};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use warden_core::accounts::Account;
use warden_core::bls;
use warden_core::checker::Checker;
use warden_core::fetcher::Fetcher;
use warden_core::ruler::RuleAction;
use warden_core::signer::{DistributedSigner, SignerService};
use warden_core::store::{DistributedInfo, Store, StoredAccount};
use warden_core::{
    AccountPath, AccountSpecifier, ClientContext, Error, Hash256, Operation, Result,
};

pub type SessionId = [u8; 32];

/// Transport to peer process services
///
/// Implemented over mTLS by the sender, and by an in-process loopback in
/// tests. All messages are idempotent.
#[async_trait]
pub trait ProcessTransport: Send + Sync {
    async fn prepare(&self, peer: &Peer, request: &PrepareRequest) -> Result<()>;
    async fn commit(&self, peer: &Peer, request: &CommitRequest) -> Result<()>;
    async fn verify_and_sign(
        &self,
        peer: &Peer,
        request: &VerifyAndSignRequest,
    ) -> Result<VerifyAndSignResponse>;
    async fn abort(&self, peer: &Peer, request: &AbortRequest) -> Result<()>;
    async fn contribute(
        &self,
        peer: &Peer,
        request: &ContributeRequest,
    ) -> Result<ContributeResponse>;
}

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Deadline for one round of contribution collection
    pub contribution_timeout: Duration,
    /// Rounds of contribution collection before giving up
    pub contribution_rounds: u32,
    /// How long a participant waits for the commits of the others
    pub dkg_timeout: Duration,
    /// Sessions older than this are garbage-collected
    pub session_expiry: Duration,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            contribution_timeout: Duration::from_secs(2),
            contribution_rounds: 3,
            dkg_timeout: Duration::from_secs(10),
            session_expiry: Duration::from_secs(300),
        }
    }
}

struct ReceivedCommit {
    vector: Vec<bls::PublicKey>,
    share: bls::SecretKey,
}

#[derive(Clone)]
struct Assembled {
    share: bls::SecretKey,
    vector: Vec<bls::PublicKey>,
    group: bls::PublicKey,
}

struct DkgSession {
    account: AccountPath,
    threshold: u32,
    participants: BTreeMap<u64, Peer>,
    commits: HashMap<u64, ReceivedCommit>,
    assembled: Option<Assembled>,
    created: Instant,
}

pub struct Process {
    peers: Arc<Peers>,
    transport: Arc<dyn ProcessTransport>,
    checker: Arc<Checker>,
    fetcher: Arc<Fetcher>,
    signer: Arc<SignerService>,
    store: Arc<dyn Store>,
    generation_passphrase: Option<String>,
    options: ProcessOptions,
    sessions: DashMap<SessionId, Arc<Mutex<DkgSession>>>,
    /// Commits that raced ahead of their Prepare
    pending_commits: DashMap<SessionId, Vec<CommitRequest>>,
}

impl Process {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peers: Arc<Peers>,
        transport: Arc<dyn ProcessTransport>,
        checker: Arc<Checker>,
        fetcher: Arc<Fetcher>,
        signer: Arc<SignerService>,
        store: Arc<dyn Store>,
        generation_passphrase: Option<String>,
        options: ProcessOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            peers,
            transport,
            checker,
            fetcher,
            signer,
            store,
            generation_passphrase,
            options,
            sessions: DashMap::new(),
            pending_commits: DashMap::new(),
        })
    }

    fn own_id(&self) -> u64 {
        self.peers.own_id()
    }

    // ========================================================================
    // Coordinator side
    // ========================================================================

    /// Run a distributed generation as coordinator
    ///
    /// Returns the group public key. On any failure every participant is told
    /// to abort and nothing is persisted.
    pub async fn generate_distributed(
        self: &Arc<Self>,
        client: &ClientContext,
        path: &AccountPath,
        threshold: u32,
        participant_ids: &[u64],
    ) -> Result<Vec<u8>> {
        if !self
            .checker
            .check(&client.name, &path.to_string(), Operation::CreateAccount)
        {
            return Err(Error::Denied(format!(
                "client {} does not hold create-account on {path}",
                client.name
            )));
        }

        let ids: HashSet<u64> = participant_ids.iter().copied().collect();
        if ids.len() != participant_ids.len() {
            return Err(Error::Invalid("duplicate participant ids".into()));
        }
        if threshold < 2 || threshold as usize > ids.len() {
            return Err(Error::Invalid(format!(
                "threshold {threshold} is not in 2..={}",
                ids.len()
            )));
        }
        if !ids.contains(&self.own_id()) {
            return Err(Error::Invalid(
                "the coordinating server must be a participant".into(),
            ));
        }

        let mut participants = BTreeMap::new();
        for id in participant_ids {
            let peer = self
                .peers
                .get(*id)
                .ok_or_else(|| Error::NotFound(format!("peer {id}")))?;
            participants.insert(
                *id,
                ParticipantMessage {
                    name: peer.name.clone(),
                    address: peer.address.clone(),
                },
            );
        }

        let session_id: SessionId = rand::random();
        info!(
            session = %hex::encode(session_id),
            account = %path,
            threshold,
            participants = participants.len(),
            "starting distributed key generation"
        );

        let prepare = PrepareRequest {
            session_id: hex::encode(session_id),
            account: path.to_string(),
            threshold,
            participants: participants.clone(),
        };
        let members: Vec<Peer> = participants
            .iter()
            .map(|(id, p)| Peer {
                id: *id,
                name: p.name.clone(),
                address: p.address.clone(),
            })
            .collect();

        for peer in &members {
            if let Err(e) = self.dispatch_prepare(peer, &prepare).await {
                self.abort_all(&session_id, &members, &format!("prepare failed on {}", peer.id))
                    .await;
                return Err(Error::Unavailable(format!(
                    "peer {} rejected prepare: {e}",
                    peer.id
                )));
            }
        }

        // Wave 1: every participant verifies shares, assembles, and signs the
        // session confirmation.
        let mut responses = Vec::new();
        for peer in &members {
            let request = VerifyAndSignRequest {
                session_id: hex::encode(session_id),
                commit: false,
            };
            match self.dispatch_verify_and_sign(peer, &request).await {
                Ok(response) if response.state == RequestState::Succeeded => {
                    responses.push(response)
                }
                Ok(response) => {
                    self.abort_all(&session_id, &members, "verification failed")
                        .await;
                    return Err(Error::Internal(format!(
                        "peer {} failed verification: {}",
                        peer.id,
                        response.error.unwrap_or_default()
                    )));
                }
                Err(e) => {
                    self.abort_all(&session_id, &members, "verification unreachable")
                        .await;
                    return Err(Error::Unavailable(format!(
                        "peer {} did not verify: {e}",
                        peer.id
                    )));
                }
            }
        }

        let result = self
            .check_confirmations(&session_id, threshold, &responses)
            .await;
        let group = match result {
            Ok(group) => group,
            Err(e) => {
                self.abort_all(&session_id, &members, "confirmation failed")
                    .await;
                return Err(e);
            }
        };

        // Wave 2: everyone persists. Past this point a partial failure leaves
        // the cluster inconsistent; report it rather than hiding it.
        let mut failures = Vec::new();
        for peer in &members {
            let request = VerifyAndSignRequest {
                session_id: hex::encode(session_id),
                commit: true,
            };
            match self.dispatch_verify_and_sign(peer, &request).await {
                Ok(response) if response.state == RequestState::Succeeded => {}
                Ok(response) => failures.push(format!(
                    "peer {}: {}",
                    peer.id,
                    response.error.unwrap_or_default()
                )),
                Err(e) => failures.push(format!("peer {}: {e}", peer.id)),
            }
        }
        if !failures.is_empty() {
            return Err(Error::Internal(format!(
                "generation committed incompletely: {}",
                failures.join("; ")
            )));
        }

        info!(
            account = %path,
            public_key = %hex::encode(group.to_bytes()),
            "distributed account generated"
        );
        Ok(group.to_bytes().to_vec())
    }

    /// Validate wave-1 responses: consistent group key and a combinable
    /// threshold of confirmation signatures.
    async fn check_confirmations(
        &self,
        session_id: &SessionId,
        threshold: u32,
        responses: &[VerifyAndSignResponse],
    ) -> Result<bls::PublicKey> {
        let group_hex = responses
            .first()
            .and_then(|r| r.group_public_key.clone())
            .ok_or_else(|| Error::Internal("no group public key returned".into()))?;
        if responses
            .iter()
            .any(|r| r.group_public_key.as_deref() != Some(group_hex.as_str()))
        {
            return Err(Error::Internal(
                "participants disagree on the group public key".into(),
            ));
        }
        let group = bls::PublicKey::from_bytes(&decode_bytes(&group_hex)?)?;

        let vector = {
            let session = self
                .sessions
                .get(session_id)
                .ok_or_else(|| Error::Internal("own session state missing".into()))?;
            let session = session.lock();
            session
                .assembled
                .as_ref()
                .map(|assembled| assembled.vector.clone())
                .ok_or_else(|| Error::Internal("own session not assembled".into()))?
        };

        let root = confirmation_root(session_id, &group);
        let mut partials = Vec::new();
        for response in responses {
            let Some(signature_hex) = &response.partial_signature else {
                continue;
            };
            let partial = bls::Signature::from_bytes(&decode_bytes(signature_hex)?)?;
            if bls::verify_partial(&vector, response.participant_id, &root, &partial) {
                partials.push((response.participant_id, partial));
            } else {
                warn!(
                    participant = response.participant_id,
                    "confirmation signature failed verification"
                );
            }
        }
        if partials.len() < threshold as usize {
            return Err(Error::Unavailable(format!(
                "only {} of {threshold} confirmation signatures verified",
                partials.len()
            )));
        }
        partials.truncate(threshold as usize);
        let combined = bls::lagrange_combine(&partials)?;
        if !group.verify(&root, &combined) {
            return Err(Error::Internal(
                "combined confirmation signature is invalid under the group key".into(),
            ));
        }
        Ok(group)
    }

    async fn abort_all(&self, session_id: &SessionId, members: &[Peer], reason: &str) {
        let request = AbortRequest {
            session_id: hex::encode(session_id),
            reason: reason.to_string(),
        };
        for peer in members {
            if let Err(e) = self.dispatch_abort(peer, &request).await {
                warn!(peer = peer.id, error = %e, "abort did not reach peer");
            }
        }
    }

    // ========================================================================
    // Participant side
    // ========================================================================

    /// Handle a Prepare: set up session state and fan our commitment out
    pub async fn handle_prepare(self: &Arc<Self>, request: PrepareRequest) -> Result<()> {
        self.prune_expired();

        let session_id = decode_session_id(&request.session_id)?;
        if self.sessions.contains_key(&session_id) {
            // Idempotent re-delivery.
            return Ok(());
        }

        if self.generation_passphrase.is_none() {
            return Err(Error::Invalid(
                "no generation passphrase configured on this server".into(),
            ));
        }

        let path: AccountPath = request.account.parse()?;
        let n = request.participants.len();
        if request.threshold < 2 || request.threshold as usize > n {
            return Err(Error::Invalid(format!(
                "threshold {} is not in 2..={n}",
                request.threshold
            )));
        }
        if !request.participants.contains_key(&self.own_id()) {
            return Err(Error::Invalid(
                "this server is not in the participant set".into(),
            ));
        }
        if self.store.has_account(&path).await? || self.fetcher.by_path(&path).is_ok() {
            return Err(Error::Invalid(format!("account {path} already exists")));
        }

        let participants: BTreeMap<u64, Peer> = request
            .participants
            .iter()
            .map(|(id, p)| {
                (
                    *id,
                    Peer {
                        id: *id,
                        name: p.name.clone(),
                        address: p.address.clone(),
                    },
                )
            })
            .collect();

        let polynomial = bls::Polynomial::random(request.threshold as usize)?;
        let vector = polynomial.commitments();
        let vector_hex: Vec<String> = vector
            .iter()
            .map(|point| hex::encode(point.to_bytes()))
            .collect();

        // Our own contribution is recorded as a commit from ourselves; the
        // outgoing commits carry each recipient's private evaluation.
        let mut outgoing = Vec::new();
        for peer in participants.values().filter(|p| p.id != self.own_id()) {
            outgoing.push((
                peer.clone(),
                CommitRequest {
                    session_id: request.session_id.clone(),
                    sender_id: self.own_id(),
                    verification_vector: vector_hex.clone(),
                    share: hex::encode(polynomial.secret_share(peer.id).to_bytes()),
                },
            ));
        }

        let mut commits = HashMap::new();
        commits.insert(
            self.own_id(),
            ReceivedCommit {
                vector,
                share: polynomial.secret_share(self.own_id()),
            },
        );

        let session = Arc::new(Mutex::new(DkgSession {
            account: path,
            threshold: request.threshold,
            participants,
            commits,
            assembled: None,
            created: Instant::now(),
        }));
        self.sessions.insert(session_id, Arc::clone(&session));
        debug!(session = %request.session_id, "prepared generation session");

        // Commits that arrived before this Prepare.
        if let Some((_, pending)) = self.pending_commits.remove(&session_id) {
            for commit in pending {
                self.apply_commit(&session_id, &session, commit).await?;
            }
        }

        let process = Arc::clone(self);
        tokio::spawn(async move {
            for (peer, commit) in outgoing {
                if let Err(e) = process.transport.commit(&peer, &commit).await {
                    warn!(peer = peer.id, error = %e, "commit did not reach peer");
                }
            }
        });

        Ok(())
    }

    /// Handle a Commit from another participant
    pub async fn handle_commit(self: &Arc<Self>, request: CommitRequest) -> Result<()> {
        let session_id = decode_session_id(&request.session_id)?;
        match self.sessions.get(&session_id).map(|s| Arc::clone(s.value())) {
            Some(session) => self.apply_commit(&session_id, &session, request).await,
            None => {
                // The sender's Prepare fan-out can outrun ours; buffer it.
                self.pending_commits
                    .entry(session_id)
                    .or_default()
                    .push(request);
                Ok(())
            }
        }
    }

    async fn apply_commit(
        self: &Arc<Self>,
        session_id: &SessionId,
        session: &Arc<Mutex<DkgSession>>,
        request: CommitRequest,
    ) -> Result<()> {
        let mut vector = Vec::new();
        for point in &request.verification_vector {
            vector.push(bls::PublicKey::from_bytes(&decode_bytes(point)?)?);
        }
        let share = bls::SecretKey::from_bytes(&decode_bytes(&request.share)?)?;

        let (valid, members) = {
            let session = session.lock();
            if !session.participants.contains_key(&request.sender_id) {
                return Err(Error::Invalid(format!(
                    "commit from non-participant {}",
                    request.sender_id
                )));
            }
            if vector.len() != session.threshold as usize {
                return Err(Error::Invalid(format!(
                    "verification vector has {} entries, expected {}",
                    vector.len(),
                    session.threshold
                )));
            }
            let valid = bls::verify_share(share.as_scalar(), &vector, self.own_id());
            let members: Vec<Peer> = session.participants.values().cloned().collect();
            (valid, members)
        };

        if !valid {
            // A bad share poisons the whole session: tell everyone and drop
            // our state so nothing can be persisted.
            warn!(
                session = %request.session_id,
                sender = request.sender_id,
                "share failed verification against its commitment"
            );
            self.sessions.remove(session_id);
            self.pending_commits.remove(session_id);
            self.abort_all(
                session_id,
                &members,
                &format!("bad share from {}", request.sender_id),
            )
            .await;
            return Err(Error::Invalid(format!(
                "share from participant {} does not match its verification vector",
                request.sender_id
            )));
        }

        let mut session = session.lock();
        session
            .commits
            .insert(request.sender_id, ReceivedCommit { vector, share });
        Ok(())
    }

    /// Handle VerifyAndSign: wave 1 assembles and signs the confirmation,
    /// wave 2 persists the account
    pub async fn handle_verify_and_sign(
        self: &Arc<Self>,
        request: VerifyAndSignRequest,
    ) -> Result<VerifyAndSignResponse> {
        let session_id = decode_session_id(&request.session_id)?;
        let session = self
            .sessions
            .get(&session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::NotFound(format!("session {}", request.session_id)))?;

        if request.commit {
            self.commit_session(&session_id, &session).await
        } else {
            self.assemble_session(&session_id, &session).await
        }
    }

    async fn assemble_session(
        &self,
        session_id: &SessionId,
        session: &Arc<Mutex<DkgSession>>,
    ) -> Result<VerifyAndSignResponse> {
        // Wait for the commits of every other participant.
        let deadline = Instant::now() + self.options.dkg_timeout;
        loop {
            let (have, want) = {
                let session = session.lock();
                (session.commits.len(), session.participants.len())
            };
            if have >= want {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::Unavailable(format!(
                    "received {have} of {want} commits before the deadline"
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut session = session.lock();
        if session.assembled.is_none() {
            let vectors: Vec<Vec<bls::PublicKey>> = session
                .commits
                .values()
                .map(|commit| commit.vector.clone())
                .collect();
            let vector = bls::aggregate_verification_vectors(&vectors)?;
            let share = bls::combine_shares(session.commits.values().map(|commit| &commit.share));
            if !bls::verify_share(share.as_scalar(), &vector, self.own_id()) {
                return Err(Error::Crypto(
                    "assembled share does not match the group verification vector".into(),
                ));
            }
            let group = vector[0];
            session.assembled = Some(Assembled {
                share,
                vector,
                group,
            });
        }

        let assembled = session
            .assembled
            .as_ref()
            .ok_or_else(|| Error::Internal("assembly state missing".into()))?;
        let root = confirmation_root(session_id, &assembled.group);
        Ok(VerifyAndSignResponse {
            state: RequestState::Succeeded,
            participant_id: self.own_id(),
            group_public_key: Some(hex::encode(assembled.group.to_bytes())),
            partial_signature: Some(hex::encode(assembled.share.sign(&root).to_bytes())),
            error: None,
        })
    }

    async fn commit_session(
        &self,
        session_id: &SessionId,
        session: &Arc<Mutex<DkgSession>>,
    ) -> Result<VerifyAndSignResponse> {
        let (account, threshold, participants, assembled) = {
            let session = session.lock();
            let assembled = session
                .assembled
                .clone()
                .ok_or_else(|| Error::Invalid("commit requested before verification".into()))?;
            (
                session.account.clone(),
                session.threshold,
                session.participants.clone(),
                assembled,
            )
        };
        let passphrase = self
            .generation_passphrase
            .as_deref()
            .ok_or_else(|| Error::Invalid("no generation passphrase configured".into()))?;

        if !self.store.has_wallet(account.wallet()).await? {
            self.store.create_wallet(account.wallet()).await?;
        }
        let info = DistributedInfo {
            id: self.own_id(),
            threshold,
            participants: participants
                .iter()
                .map(|(id, peer)| (*id, peer.address.clone()))
                .collect(),
            verification_vector: assembled
                .vector
                .iter()
                .map(|point| point.to_bytes().to_vec())
                .collect(),
        };
        let record = StoredAccount::seal(
            account.clone(),
            assembled.group.to_bytes().to_vec(),
            &assembled.share.to_bytes(),
            passphrase,
            Some(info),
        )?;
        self.store.save_account(&record).await?;
        self.fetcher.refresh_wallet(account.wallet()).await?;

        // Unlock immediately so the account can contribute without waiting
        // for an unlocker pass.
        let handle = self.fetcher.by_path(&account)?;
        handle.try_unlock(passphrase)?;

        self.sessions.remove(session_id);
        self.pending_commits.remove(session_id);
        info!(account = %account, "distributed account persisted");

        Ok(VerifyAndSignResponse {
            state: RequestState::Succeeded,
            participant_id: self.own_id(),
            group_public_key: Some(hex::encode(assembled.group.to_bytes())),
            partial_signature: None,
            error: None,
        })
    }

    /// Handle an Abort: discard all session state, persisting nothing
    pub fn handle_abort(&self, request: &AbortRequest) -> Result<()> {
        let session_id = decode_session_id(&request.session_id)?;
        if self.sessions.remove(&session_id).is_some() {
            info!(
                session = %request.session_id,
                reason = %request.reason,
                "generation session aborted"
            );
        }
        self.pending_commits.remove(&session_id);
        Ok(())
    }

    /// Handle a Contribute: re-run our own pipeline and return a partial
    pub async fn handle_contribute(
        &self,
        client: &ClientContext,
        request: &ContributeRequest,
    ) -> Result<ContributeResponse> {
        let path: AccountPath = request.account.parse()?;
        let signing_root = decode_hash256(&request.signing_root)?;

        let account = self.fetcher.by_path(&path)?;
        if !account.is_distributed() {
            return Err(Error::Invalid(format!(
                "{path} is not a distributed account"
            )));
        }

        let partial = self
            .signer
            .contribute(
                client,
                &AccountSpecifier::Path(path),
                request.action.clone(),
                signing_root,
            )
            .await?;
        Ok(ContributeResponse {
            state: RequestState::Succeeded,
            participant_id: self.own_id(),
            partial_signature: Some(hex::encode(partial)),
            error: None,
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn dispatch_prepare(self: &Arc<Self>, peer: &Peer, request: &PrepareRequest) -> Result<()> {
        if peer.id == self.own_id() {
            self.handle_prepare(request.clone()).await
        } else {
            self.transport.prepare(peer, request).await
        }
    }

    async fn dispatch_verify_and_sign(
        self: &Arc<Self>,
        peer: &Peer,
        request: &VerifyAndSignRequest,
    ) -> Result<VerifyAndSignResponse> {
        if peer.id == self.own_id() {
            self.handle_verify_and_sign(request.clone()).await
        } else {
            self.transport.verify_and_sign(peer, request).await
        }
    }

    async fn dispatch_abort(&self, peer: &Peer, request: &AbortRequest) -> Result<()> {
        if peer.id == self.own_id() {
            self.handle_abort(request)
        } else {
            self.transport.abort(peer, request).await
        }
    }

    fn prune_expired(&self) {
        let expiry = self.options.session_expiry;
        self.sessions
            .retain(|_, session| session.lock().created.elapsed() < expiry);
    }
}

#[async_trait]
impl DistributedSigner for Process {
    async fn threshold_sign(
        &self,
        account: &Arc<Account>,
        signing_root: &Hash256,
        action: &RuleAction,
    ) -> Result<Vec<u8>> {
        let info = account
            .distributed()
            .ok_or_else(|| Error::Invalid(format!("{} is not distributed", account.path())))?;
        let threshold = info.threshold as usize;
        let vector = account.verification_vector()?;
        let group = bls::PublicKey::from_bytes(account.public_key())?;

        // Our own partial first; the local pipeline has already approved.
        let own = account.sign(signing_root)?;
        let mut partials: Vec<(u64, bls::Signature)> = vec![(self.own_id(), own)];
        let mut settled: HashSet<u64> = HashSet::from([self.own_id()]);

        let request = ContributeRequest {
            account: account.path().to_string(),
            signing_root: hex::encode(signing_root),
            action: action.clone(),
        };

        for round in 0..self.options.contribution_rounds {
            if partials.len() >= threshold {
                break;
            }
            let targets: Vec<&Peer> = info
                .participants
                .keys()
                .filter(|id| !settled.contains(id))
                .filter_map(|id| {
                    let peer = self.peers.get(*id);
                    if peer.is_none() {
                        warn!(participant = *id, "participant is not a configured peer");
                    }
                    peer
                })
                .collect();
            if targets.is_empty() {
                break;
            }

            debug!(
                account = %account.path(),
                round,
                waiting = targets.len(),
                "collecting contributions"
            );
            let calls = targets.into_iter().map(|peer| {
                let request = request.clone();
                async move {
                    (
                        peer.id,
                        tokio::time::timeout(
                            self.options.contribution_timeout,
                            self.transport.contribute(peer, &request),
                        )
                        .await,
                    )
                }
            });
            for (peer_id, outcome) in futures_util::future::join_all(calls).await {
                match outcome {
                    Ok(Ok(response)) if response.state == RequestState::Succeeded => {
                        let parsed = response
                            .partial_signature
                            .as_deref()
                            .and_then(|hex| decode_bytes(hex).ok())
                            .and_then(|bytes| bls::Signature::from_bytes(&bytes).ok());
                        match parsed {
                            Some(partial)
                                if bls::verify_partial(
                                    &vector,
                                    peer_id,
                                    signing_root,
                                    &partial,
                                ) =>
                            {
                                partials.push((peer_id, partial));
                            }
                            Some(_) => {
                                warn!(peer = peer_id, "partial signature failed verification")
                            }
                            None => warn!(peer = peer_id, "unparseable partial signature"),
                        }
                        settled.insert(peer_id);
                    }
                    Ok(Ok(response)) => {
                        // A rule refusal on the peer is final; do not retry.
                        warn!(
                            peer = peer_id,
                            state = ?response.state,
                            error = response.error.as_deref().unwrap_or(""),
                            "peer refused to contribute"
                        );
                        settled.insert(peer_id);
                    }
                    Ok(Err(e)) => {
                        warn!(peer = peer_id, error = %e, "contribution failed, will retry");
                    }
                    Err(_) => {
                        warn!(peer = peer_id, "contribution timed out, will retry");
                    }
                }
            }
        }

        if partials.len() < threshold {
            return Err(Error::Unavailable(format!(
                "insufficient participants: {} of {threshold} contributed",
                partials.len()
            )));
        }
        partials.truncate(threshold);
        let combined = bls::lagrange_combine(&partials)?;
        if !group.verify(signing_root, &combined) {
            return Err(Error::Internal(
                "invalid aggregate: combined signature does not verify under the group key".into(),
            ));
        }
        Ok(combined.to_bytes().to_vec())
    }
}

fn decode_session_id(value: &str) -> Result<SessionId> {
    decode_hash256(value)
}

// Canonical root every participant signs to prove its share belongs to the
// assembled group key.
fn confirmation_root(session_id: &SessionId, group: &bls::PublicKey) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(b"warden-dkg-confirmation");
    hasher.update(session_id);
    hasher.update(group.to_bytes());
    hasher.finalize().into()
}
