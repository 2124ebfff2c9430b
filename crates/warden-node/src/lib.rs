//! # Warden node
//!
//! Network surface for the warden remote signer: the mTLS API server, the
//! peer directory, the peer client, and the process service that runs
//! distributed key generation and threshold signing.
//!
//! ## Identity
//!
//! Everything rides one transport. Clients and peers authenticate with
//! certificates from the cluster CA; the certificate CN is the identity the
//! permission checker sees, and CNs that belong to configured peers may
//! additionally call the process endpoints.
//!
//! ## Peer protocol
//!
//! Five message kinds: Prepare, Commit, VerifyAndSign, Abort for key
//! generation, and Contribute for threshold signing. Each participating
//! server evaluates its own slashing rules before contributing a partial
//! signature; a coordinator aggregates a threshold of verified partials into
//! the group signature.

pub mod error;
pub mod messages;
pub mod peers;
pub mod process;
pub mod sender;
pub mod server;
pub mod tls;

pub use error::{NodeError, Result};
pub use peers::{Peer, Peers};
pub use process::{Process, ProcessOptions, ProcessTransport};
pub use sender::Sender;
pub use server::{ApiServer, AppState, ClientIdentity};
