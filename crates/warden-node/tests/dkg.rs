//! Multi-node distributed key generation and threshold signing, simulated
//! in-process with a loopback transport.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use warden_core::bls;
use warden_core::checker::{Checker, Permission};
use warden_core::config::PeerConfig;
use warden_core::fetcher::Fetcher;
use warden_core::locker::Locker;
use warden_core::observer::NullObserver;
use warden_core::rules::{RulesEngine, RulesStore};
use warden_core::ruler::Ruler;
use warden_core::signer::{DistributedSigner, SignerService};
use warden_core::store::{MemoryStore, Store};
use warden_core::unlocker::Unlocker;
use warden_core::{
    AccountPath, AccountSpecifier, AttestationData, Checkpoint, ClientContext, Error, Operation,
    ProposalData,
};
use warden_node::messages::{
    AbortRequest, CommitRequest, ContributeRequest, ContributeResponse, PrepareRequest,
    VerifyAndSignRequest, VerifyAndSignResponse,
};
use warden_node::{Peer, Peers, Process, ProcessOptions, ProcessTransport};

const GENERATION_PASSPHRASE: &str = "generation passphrase";

/// Routes peer calls straight into the target node's process service.
struct LoopbackNet {
    nodes: DashMap<u64, Arc<Process>>,
}

impl LoopbackNet {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
        })
    }

    fn node(&self, id: u64) -> Result<Arc<Process>, Error> {
        self.nodes
            .get(&id)
            .map(|node| Arc::clone(node.value()))
            .ok_or_else(|| Error::Unavailable(format!("peer {id} unreachable")))
    }
}

/// Per-node transport carrying the sending server's identity, as the peer
/// would see it from the client certificate.
struct LoopbackTransport {
    origin: String,
    net: Arc<LoopbackNet>,
}

#[async_trait]
impl ProcessTransport for LoopbackTransport {
    async fn prepare(&self, peer: &Peer, request: &PrepareRequest) -> Result<(), Error> {
        self.net.node(peer.id)?.handle_prepare(request.clone()).await
    }

    async fn commit(&self, peer: &Peer, request: &CommitRequest) -> Result<(), Error> {
        self.net.node(peer.id)?.handle_commit(request.clone()).await
    }

    async fn verify_and_sign(
        &self,
        peer: &Peer,
        request: &VerifyAndSignRequest,
    ) -> Result<VerifyAndSignResponse, Error> {
        self.net
            .node(peer.id)?
            .handle_verify_and_sign(request.clone())
            .await
    }

    async fn abort(&self, peer: &Peer, request: &AbortRequest) -> Result<(), Error> {
        self.net.node(peer.id)?.handle_abort(request)
    }

    async fn contribute(
        &self,
        peer: &Peer,
        request: &ContributeRequest,
    ) -> Result<ContributeResponse, Error> {
        let client = ClientContext::new(self.origin.clone(), "127.0.0.1");
        self.net
            .node(peer.id)?
            .handle_contribute(&client, request)
            .await
    }
}

/// A dishonest participant: every share it distributes is corrupted.
struct CorruptingTransport {
    inner: LoopbackTransport,
}

#[async_trait]
impl ProcessTransport for CorruptingTransport {
    async fn prepare(&self, peer: &Peer, request: &PrepareRequest) -> Result<(), Error> {
        self.inner.prepare(peer, request).await
    }

    async fn commit(&self, peer: &Peer, request: &CommitRequest) -> Result<(), Error> {
        let mut corrupted = request.clone();
        // Replace the share with a random scalar; the Feldman check on the
        // receiving side must catch this.
        corrupted.share = hex::encode(bls::SecretKey::random().to_bytes());
        self.inner.commit(peer, &corrupted).await
    }

    async fn verify_and_sign(
        &self,
        peer: &Peer,
        request: &VerifyAndSignRequest,
    ) -> Result<VerifyAndSignResponse, Error> {
        self.inner.verify_and_sign(peer, request).await
    }

    async fn abort(&self, peer: &Peer, request: &AbortRequest) -> Result<(), Error> {
        self.inner.abort(peer, request).await
    }

    async fn contribute(
        &self,
        peer: &Peer,
        request: &ContributeRequest,
    ) -> Result<ContributeResponse, Error> {
        self.inner.contribute(peer, request).await
    }
}

struct TestNode {
    process: Arc<Process>,
    signer: Arc<SignerService>,
    fetcher: Arc<Fetcher>,
    store: Arc<dyn Store>,
    _rules_dir: tempfile::TempDir,
}

fn peer_configs(n: u64) -> BTreeMap<u64, PeerConfig> {
    (1..=n)
        .map(|id| {
            (
                id,
                PeerConfig {
                    name: format!("signer{id}"),
                    address: format!("127.0.0.1:{}", 8880 + id),
                },
            )
        })
        .collect()
}

fn permissions(n: u64) -> HashMap<String, Vec<Permission>> {
    let sign_operations = vec![
        Operation::Sign,
        Operation::SignBeaconAttestation,
        Operation::SignBeaconProposal,
    ];
    let mut access = HashMap::new();
    access.insert(
        "admin-client".to_string(),
        vec![Permission {
            path: "*".to_string(),
            operations: vec![Operation::CreateAccount],
        }],
    );
    access.insert(
        "validator-client".to_string(),
        vec![Permission {
            path: "*".to_string(),
            operations: sign_operations.clone(),
        }],
    );
    // Coordinating peers re-run the pipeline here under their own CN.
    for id in 1..=n {
        access.insert(
            format!("signer{id}"),
            vec![Permission {
                path: "*".to_string(),
                operations: sign_operations.clone(),
            }],
        );
    }
    access
}

async fn build_node(
    id: u64,
    n: u64,
    net: &Arc<LoopbackNet>,
    corrupt: bool,
) -> TestNode {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let checker = Arc::new(Checker::new(permissions(n)).unwrap());
    let fetcher = Arc::new(Fetcher::new(vec![Arc::clone(&store)]).await.unwrap());
    let unlocker = Arc::new(Unlocker::new(vec![GENERATION_PASSPHRASE.to_string()], vec![]));

    let rules_dir = tempfile::tempdir().unwrap();
    let ruler = Arc::new(Ruler::new(
        Arc::new(Locker::new()),
        Arc::new(RulesEngine::new(
            RulesStore::open(rules_dir.path()).unwrap(),
            vec![],
        )),
    ));
    let signer = Arc::new(SignerService::new(
        Arc::clone(&checker),
        Arc::clone(&fetcher),
        unlocker,
        ruler,
        Arc::new(NullObserver),
    ));

    let loopback = LoopbackTransport {
        origin: format!("signer{id}"),
        net: Arc::clone(net),
    };
    let transport: Arc<dyn ProcessTransport> = if corrupt {
        Arc::new(CorruptingTransport { inner: loopback })
    } else {
        Arc::new(loopback)
    };

    let peers = Arc::new(Peers::new(id, &peer_configs(n)).unwrap());
    let options = ProcessOptions {
        contribution_timeout: Duration::from_millis(500),
        contribution_rounds: 2,
        dkg_timeout: Duration::from_secs(5),
        session_expiry: Duration::from_secs(300),
    };
    let process = Process::new(
        peers,
        transport,
        checker,
        Arc::clone(&fetcher),
        Arc::clone(&signer),
        Arc::clone(&store),
        Some(GENERATION_PASSPHRASE.to_string()),
        options,
    );
    signer.set_distributed_signer(Arc::clone(&process) as Arc<dyn DistributedSigner>);

    net.nodes.insert(id, Arc::clone(&process));
    TestNode {
        process,
        signer,
        fetcher,
        store,
        _rules_dir: rules_dir,
    }
}

async fn build_cluster(n: u64) -> (Arc<LoopbackNet>, Vec<TestNode>) {
    let net = LoopbackNet::new();
    let mut nodes = Vec::new();
    for id in 1..=n {
        nodes.push(build_node(id, n, &net, false).await);
    }
    (net, nodes)
}

fn admin() -> ClientContext {
    ClientContext::new("admin-client", "10.0.0.1")
}

fn validator() -> ClientContext {
    ClientContext::new("validator-client", "192.0.2.5")
}

fn attestation(source: u64, target: u64) -> AttestationData {
    AttestationData {
        slot: target * 32,
        committee_index: 1,
        beacon_block_root: [0xaa; 32],
        source: Checkpoint {
            epoch: source,
            root: [0xbb; 32],
        },
        target: Checkpoint {
            epoch: target,
            root: [0xcc; 32],
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dkg_then_threshold_sign() {
    let (net, nodes) = build_cluster(4).await;
    let path: AccountPath = "validators/0".parse().unwrap();

    // 3-of-4 generation coordinated by node 1.
    let group_key = nodes[0]
        .process
        .generate_distributed(&admin(), &path, 3, &[1, 2, 3, 4])
        .await
        .unwrap();

    // Every node persisted the same distributed account.
    for node in &nodes {
        assert!(node.store.has_account(&path).await.unwrap());
        let account = node.fetcher.by_path(&path).unwrap();
        assert!(account.is_distributed());
        assert_eq!(account.public_key(), group_key.as_slice());
        // Group key equals the constant term of the verification vector.
        let vector = account.verification_vector().unwrap();
        assert_eq!(vector[0].to_bytes().to_vec(), group_key);
        assert_eq!(vector.len(), 3);
    }

    // Threshold-sign an attestation through node 1's ordinary pipeline.
    let domain = [0x01; 32];
    let data = attestation(5, 10);
    let signature = nodes[0]
        .signer
        .sign_beacon_attestation(
            &validator(),
            &AccountSpecifier::Path(path.clone()),
            domain,
            &data,
        )
        .await
        .unwrap();

    let group = bls::PublicKey::from_bytes(&group_key).unwrap();
    let signature = bls::Signature::from_bytes(&signature).unwrap();
    assert!(group.verify(&data.signing_root(&domain), &signature));

    // A peer dropping out still leaves a threshold-sized subset.
    net.nodes.remove(&4);
    let data = attestation(10, 11);
    let signature = nodes[0]
        .signer
        .sign_beacon_attestation(
            &validator(),
            &AccountSpecifier::Path(path.clone()),
            domain,
            &data,
        )
        .await
        .unwrap();
    let signature = bls::Signature::from_bytes(&signature).unwrap();
    assert!(group.verify(&data.signing_root(&domain), &signature));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peers_enforce_their_own_slashing_rules() {
    let (_net, nodes) = build_cluster(3).await;
    let path: AccountPath = "validators/0".parse().unwrap();

    nodes[0]
        .process
        .generate_distributed(&admin(), &path, 2, &[1, 2, 3])
        .await
        .unwrap();

    let proposal = ProposalData {
        slot: 100,
        proposer_index: 7,
        parent_root: [0x01; 32],
        state_root: [0x02; 32],
        body_root: [0x03; 32],
    };
    nodes[0]
        .signer
        .sign_beacon_proposal(
            &validator(),
            &AccountSpecifier::Path(path.clone()),
            [0u8; 32],
            &proposal,
        )
        .await
        .unwrap();

    // Every participating node recorded slot 100 in its own store, so a
    // different coordinator cannot replay the same slot: its local rules
    // deny before any peer is even asked.
    let result = nodes[1]
        .signer
        .sign_beacon_proposal(
            &validator(),
            &AccountSpecifier::Path(path.clone()),
            [0u8; 32],
            &proposal,
        )
        .await;
    assert!(matches!(result, Err(Error::Denied(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_share_aborts_generation_everywhere() {
    let net = LoopbackNet::new();
    let mut nodes = Vec::new();
    for id in 1..=3u64 {
        // Node 2 corrupts every share it distributes.
        nodes.push(build_node(id, 3, &net, id == 2).await);
    }
    let path: AccountPath = "validators/0".parse().unwrap();

    let result = nodes[0]
        .process
        .generate_distributed(&admin(), &path, 2, &[1, 2, 3])
        .await;
    assert!(result.is_err(), "generation with a bad share must fail");

    // No server persisted anything.
    for node in &nodes {
        assert!(!node.store.has_account(&path).await.unwrap());
        assert!(node.fetcher.by_path(&path).is_err());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn insufficient_participants_is_unavailable() {
    let (net, nodes) = build_cluster(3).await;
    let path: AccountPath = "validators/0".parse().unwrap();

    nodes[0]
        .process
        .generate_distributed(&admin(), &path, 3, &[1, 2, 3])
        .await
        .unwrap();

    // With two peers gone only the coordinator can contribute.
    net.nodes.remove(&2);
    net.nodes.remove(&3);
    let result = nodes[0]
        .signer
        .sign_beacon_proposal(
            &validator(),
            &AccountSpecifier::Path(path.clone()),
            [0u8; 32],
            &ProposalData {
                slot: 1,
                proposer_index: 0,
                parent_root: [0u8; 32],
                state_root: [0u8; 32],
                body_root: [0u8; 32],
            },
        )
        .await;
    assert!(matches!(result, Err(Error::Unavailable(_))));
}
