//! End-to-end pipeline tests over an in-memory keystore and an on-disk
//! slashing-protection store.

use std::collections::HashMap;
use std::sync::Arc;

use warden_core::accounts::Account;
use warden_core::bls;
use warden_core::checker::{Checker, Permission};
use warden_core::fetcher::Fetcher;
use warden_core::locker::Locker;
use warden_core::observer::NullObserver;
use warden_core::rules::{RulesEngine, RulesStore};
use warden_core::ruler::Ruler;
use warden_core::signer::SignerService;
use warden_core::store::{MemoryStore, Store, StoredAccount};
use warden_core::unlocker::Unlocker;
use warden_core::{
    AccountPath, AccountSpecifier, AttestationData, Checkpoint, ClientContext, Error, Operation,
    ProposalData,
};

const PASSPHRASE: &str = "integration pass";

struct Harness {
    signer: SignerService,
    fetcher: Arc<Fetcher>,
    rules_dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store.create_wallet("w1").await.unwrap();
    for name in ["acct1", "acct2"] {
        let key = bls::SecretKey::random();
        let record = StoredAccount::seal(
            AccountPath::new("w1", name).unwrap(),
            key.public_key().to_bytes().to_vec(),
            &key.to_bytes(),
            PASSPHRASE,
            None,
        )
        .unwrap();
        store.save_account(&record).await.unwrap();
    }

    let mut access = HashMap::new();
    access.insert(
        "client1".to_string(),
        vec![Permission {
            path: "w1/*".to_string(),
            operations: vec![
                Operation::SignBeaconAttestation,
                Operation::SignBeaconProposal,
            ],
        }],
    );
    let checker = Arc::new(Checker::new(access).unwrap());
    let fetcher = Arc::new(Fetcher::new(vec![store]).await.unwrap());
    let unlocker = Arc::new(Unlocker::new(vec![PASSPHRASE.to_string()], vec![]));

    let rules_dir = tempfile::tempdir().unwrap();
    let rules = Arc::new(RulesEngine::new(
        RulesStore::open(rules_dir.path()).unwrap(),
        vec![],
    ));
    let ruler = Arc::new(Ruler::new(Arc::new(Locker::new()), rules));

    let signer = SignerService::new(
        checker,
        Arc::clone(&fetcher),
        unlocker,
        ruler,
        Arc::new(NullObserver),
    );

    Harness {
        signer,
        fetcher,
        rules_dir,
    }
}

fn client() -> ClientContext {
    ClientContext::new("client1", "192.0.2.10")
}

fn account_spec(path: &str) -> AccountSpecifier {
    AccountSpecifier::Path(path.parse().unwrap())
}

fn attestation(source: u64, target: u64) -> AttestationData {
    AttestationData {
        slot: target * 32,
        committee_index: 3,
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

fn proposal(slot: u64) -> ProposalData {
    ProposalData {
        slot,
        proposer_index: 11,
        parent_root: [0x01; 32],
        state_root: [0x02; 32],
        body_root: [0x03; 32],
    }
}

fn verify(account: &Account, data: &AttestationData, domain: &[u8; 32], signature: &[u8]) -> bool {
    let public = bls::PublicKey::from_bytes(account.public_key()).unwrap();
    let signature = bls::Signature::from_bytes(signature).unwrap();
    public.verify(&data.signing_root(domain), &signature)
}

#[tokio::test]
async fn attestation_sequence_enforces_slashing_rules() {
    let harness = harness().await;
    let client = client();
    let spec = account_spec("w1/acct1");
    let domain = [0x07; 32];

    // Fresh account: (5, 10) approved and the signature verifies.
    let data = attestation(5, 10);
    let signature = harness
        .signer
        .sign_beacon_attestation(&client, &spec, domain, &data)
        .await
        .unwrap();
    let account = harness
        .fetcher
        .by_path(&"w1/acct1".parse().unwrap())
        .unwrap();
    assert!(verify(&account, &data, &domain, &signature));

    // Source moved back but target advances: approved.
    harness
        .signer
        .sign_beacon_attestation(&client, &spec, domain, &attestation(4, 11))
        .await
        .unwrap();

    // Target does not advance: denied.
    let result = harness
        .signer
        .sign_beacon_attestation(&client, &spec, domain, &attestation(6, 11))
        .await;
    assert!(matches!(result, Err(Error::Denied(_))));

    // A different account under the same wallet is unaffected.
    harness
        .signer
        .sign_beacon_attestation(&client, &account_spec("w1/acct2"), domain, &attestation(6, 11))
        .await
        .unwrap();
}

#[tokio::test]
async fn proposal_slot_must_strictly_increase() {
    let harness = harness().await;
    let client = client();
    let spec = account_spec("w1/acct1");
    let domain = [0x00; 32];

    harness
        .signer
        .sign_beacon_proposal(&client, &spec, domain, &proposal(100))
        .await
        .unwrap();
    let result = harness
        .signer
        .sign_beacon_proposal(&client, &spec, domain, &proposal(100))
        .await;
    assert!(matches!(result, Err(Error::Denied(_))));
}

#[tokio::test]
async fn permission_mismatch_is_denied_without_touching_state() {
    let harness = harness().await;
    // client1 holds attestation+proposal on w1/*, nothing on w2.
    let result = harness
        .signer
        .sign_beacon_proposal(
            &client(),
            &account_spec("w2/acct1"),
            [0u8; 32],
            &proposal(1),
        )
        .await;
    assert!(matches!(result, Err(Error::Denied(_))));

    // Even an existing account is denied for an operation not granted.
    let result = harness
        .signer
        .sign(
            &client(),
            &account_spec("w1/acct1"),
            [0x07; 32],
            [0x11; 32],
        )
        .await;
    assert!(matches!(result, Err(Error::Denied(_))));
}

#[tokio::test]
async fn pubkey_addressing_resolves_the_same_account() {
    let harness = harness().await;
    let account = harness
        .fetcher
        .by_path(&"w1/acct1".parse().unwrap())
        .unwrap();
    let spec = AccountSpecifier::PublicKey(account.public_key().to_vec());

    harness
        .signer
        .sign_beacon_proposal(&client(), &spec, [0u8; 32], &proposal(7))
        .await
        .unwrap();

    // The slashing record is keyed by path, so the path-addressed request
    // sees the update.
    let result = harness
        .signer
        .sign_beacon_proposal(&client(), &account_spec("w1/acct1"), [0u8; 32], &proposal(7))
        .await;
    assert!(matches!(result, Err(Error::Denied(_))));
}

#[tokio::test]
async fn slashing_state_survives_restart() {
    let harness = harness().await;
    let client = client();
    let spec = account_spec("w1/acct1");

    harness
        .signer
        .sign_beacon_attestation(&client, &spec, [0x07; 32], &attestation(5, 10))
        .await
        .unwrap();

    // Rebuild the whole pipeline over the same rules directory, as after a
    // crash. The stored minima must still refuse the stale attestation.
    let reopened = RulesEngine::new(RulesStore::open(harness.rules_dir.path()).unwrap(), vec![]);
    let record = reopened.store().record("w1/acct1").unwrap();
    assert_eq!(record.latest_attestation_target_epoch, Some(10));

    let ruler = Ruler::new(Arc::new(Locker::new()), Arc::new(reopened));
    let decision = ruler
        .run_rules(
            &client,
            &"w1/acct1".parse().unwrap(),
            &warden_core::ruler::RuleAction::SignBeaconAttestation {
                source_epoch: 5,
                target_epoch: 10,
            },
        )
        .await;
    assert_eq!(decision, warden_core::Decision::Denied);
}

#[tokio::test]
async fn locked_account_never_signs() {
    // An unlocker with no matching passphrase leaves the account locked.
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store.create_wallet("w1").await.unwrap();
    let key = bls::SecretKey::random();
    let record = StoredAccount::seal(
        "w1/acct1".parse().unwrap(),
        key.public_key().to_bytes().to_vec(),
        &key.to_bytes(),
        "the real passphrase",
        None,
    )
    .unwrap();
    store.save_account(&record).await.unwrap();

    let mut access = HashMap::new();
    access.insert(
        "client1".to_string(),
        vec![Permission {
            path: "*".to_string(),
            operations: vec![Operation::SignBeaconProposal],
        }],
    );
    let rules_dir = tempfile::tempdir().unwrap();
    let signer = SignerService::new(
        Arc::new(Checker::new(access).unwrap()),
        Arc::new(Fetcher::new(vec![store]).await.unwrap()),
        Arc::new(Unlocker::new(vec!["wrong".to_string()], vec![])),
        Arc::new(Ruler::new(
            Arc::new(Locker::new()),
            Arc::new(RulesEngine::new(
                RulesStore::open(rules_dir.path()).unwrap(),
                vec![],
            )),
        )),
        Arc::new(NullObserver),
    );

    let result = signer
        .sign_beacon_proposal(&client(), &account_spec("w1/acct1"), [0u8; 32], &proposal(1))
        .await;
    assert!(matches!(result, Err(Error::Locked(_))));
}
