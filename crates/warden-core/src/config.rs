//! Configuration snapshot
//!
//! Deserialized once at startup from a TOML file and passed immutably down
//! the object graph. No component reads configuration from anywhere else.

use crate::checker::Permission;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub server: ServerConfig,
    pub certificates: CertificatesConfig,
    /// Peer id → peer; must include this server's own id. Keys are decimal
    /// ids (TOML table keys are strings); use [`Config::peer_ids`].
    #[serde(default)]
    pub peers: BTreeMap<String, PeerConfig>,
    /// Client CN → grants
    #[serde(default)]
    pub permissions: HashMap<String, Vec<Permission>>,
    #[serde(default)]
    pub unlocker: UnlockerConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    /// Root for the keystore and the slashing-protection store
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// This server's peer id; nonzero (it doubles as a Shamir x-coordinate)
    pub id: u64,
    /// This server's certificate CN
    pub name: String,
    pub listen_address: String,
    #[serde(default)]
    pub rules: RulesConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RulesConfig {
    /// Addresses allowed to run destructive rule operations
    #[serde(default)]
    pub admin_ips: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CertificatesConfig {
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    /// CA that issued both client and peer certificates
    pub ca_cert: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerConfig {
    /// Expected CN of the peer's certificate
    pub name: String,
    /// host:port endpoint
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UnlockerConfig {
    #[serde(default)]
    pub wallet_passphrases: Vec<String>,
    #[serde(default)]
    pub account_passphrases: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProcessConfig {
    /// Passphrase that seals accounts created through distributed generation
    #[serde(default)]
    pub generation_passphrase: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen_address: Option<String>,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("storage")
}

impl Config {
    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Invalid(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Invalid(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.id == 0 {
            return Err(Error::Invalid("server.id must be nonzero".into()));
        }
        if self.server.name.is_empty() {
            return Err(Error::Invalid("server.name must be set".into()));
        }
        let peers = self.peer_ids()?;
        if !peers.is_empty() && !peers.contains_key(&self.server.id) {
            return Err(Error::Invalid(format!(
                "peers must include this server's id {}",
                self.server.id
            )));
        }
        Ok(())
    }

    /// Peers with their ids parsed; ids must be nonzero decimals
    pub fn peer_ids(&self) -> Result<BTreeMap<u64, PeerConfig>> {
        let mut peers = BTreeMap::new();
        for (key, peer) in &self.peers {
            let id: u64 = key
                .parse()
                .map_err(|_| Error::Invalid(format!("peer id {key:?} is not a number")))?;
            if id == 0 {
                return Err(Error::Invalid(format!(
                    "peer id 0 ({}) is not allowed",
                    peer.name
                )));
            }
            peers.insert(id, peer.clone());
        }
        Ok(peers)
    }

    /// Keystore directory under the storage root
    pub fn wallet_path(&self) -> PathBuf {
        self.storage_path.join("wallets")
    }

    /// Slashing-protection directory under the storage root
    pub fn rules_path(&self) -> PathBuf {
        self.storage_path.join("rules")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
storage-path = "/var/lib/warden"

[server]
id = 1
name = "signer1"
listen-address = "0.0.0.0:8881"

[server.rules]
admin-ips = ["10.0.0.1"]

[certificates]
server-cert = "certs/signer1.crt"
server-key = "certs/signer1.key"
ca-cert = "certs/ca.crt"

[peers.1]
name = "signer1"
address = "signer1.example.com:8881"

[peers.2]
name = "signer2"
address = "signer2.example.com:8881"

[unlocker]
account-passphrases = ["secret"]

[process]
generation-passphrase = "dkg secret"

[[permissions.client1]]
path = "w1/*"
operations = ["sign-beacon-attestation", "sign-beacon-proposal"]

[metrics]
listen-address = "0.0.0.0:9101"
"#;

    #[test]
    fn test_parse_example() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.id, 1);
        assert_eq!(config.server.rules.admin_ips, vec!["10.0.0.1"]);
        let peers = config.peer_ids().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[&2].name, "signer2");
        assert_eq!(
            config.process.generation_passphrase.as_deref(),
            Some("dkg secret")
        );
        assert_eq!(config.permissions["client1"].len(), 1);
        assert_eq!(config.storage_path, PathBuf::from("/var/lib/warden"));
        assert_eq!(
            config.metrics.listen_address.as_deref(),
            Some("0.0.0.0:9101")
        );
    }

    #[test]
    fn test_validation_failures() {
        let zero_id = EXAMPLE.replace("id = 1", "id = 0");
        let config: Config = toml::from_str(&zero_id).unwrap();
        assert!(config.validate().is_err());

        let wrong_self = EXAMPLE.replace("id = 1", "id = 9");
        let config: Config = toml::from_str(&wrong_self).unwrap();
        assert!(config.validate().is_err());
    }
}
