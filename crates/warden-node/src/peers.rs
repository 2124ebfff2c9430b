//! Peer directory
//!
//! Static map from peer id to endpoint and expected certificate CN, built
//! once from configuration. Peer ids double as Shamir x-coordinates and so
//! are nonzero and unique across the cluster.

use std::collections::BTreeMap;
use warden_core::config::PeerConfig;
use warden_core::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: u64,
    /// Expected CN of the peer's certificate
    pub name: String,
    /// host:port endpoint
    pub address: String,
}

pub struct Peers {
    own_id: u64,
    peers: BTreeMap<u64, Peer>,
}

impl Peers {
    pub fn new(own_id: u64, config: &BTreeMap<u64, PeerConfig>) -> Result<Self> {
        let mut peers = BTreeMap::new();
        for (id, peer) in config {
            peers.insert(
                *id,
                Peer {
                    id: *id,
                    name: peer.name.clone(),
                    address: peer.address.clone(),
                },
            );
        }
        if !peers.contains_key(&own_id) {
            return Err(Error::Invalid(format!(
                "peer directory does not contain this server's id {own_id}"
            )));
        }
        Ok(Self { own_id, peers })
    }

    pub fn own_id(&self) -> u64 {
        self.own_id
    }

    pub fn own(&self) -> &Peer {
        &self.peers[&self.own_id]
    }

    pub fn get(&self, id: u64) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Look a peer up by certificate CN
    pub fn by_name(&self, name: &str) -> Option<&Peer> {
        self.peers.values().find(|peer| peer.name == name)
    }

    pub fn all(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Every peer except this server
    pub fn others(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|peer| peer.id != self.own_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BTreeMap<u64, PeerConfig> {
        let mut peers = BTreeMap::new();
        for id in 1..=3u64 {
            peers.insert(
                id,
                PeerConfig {
                    name: format!("signer{id}"),
                    address: format!("signer{id}.example.com:8881"),
                },
            );
        }
        peers
    }

    #[test]
    fn test_lookup() {
        let peers = Peers::new(1, &config()).unwrap();
        assert_eq!(peers.own().name, "signer1");
        assert_eq!(peers.get(2).unwrap().address, "signer2.example.com:8881");
        assert_eq!(peers.by_name("signer3").unwrap().id, 3);
        assert!(peers.by_name("stranger").is_none());
        assert_eq!(peers.others().count(), 2);
    }

    #[test]
    fn test_own_id_must_be_listed() {
        assert!(Peers::new(9, &config()).is_err());
    }
}
