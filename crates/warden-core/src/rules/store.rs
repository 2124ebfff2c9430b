//! Persistent slashing-protection store
//!
//! One JSON record per account path, kept in a directory alongside an
//! in-memory write-through cache. The filename is the hex encoding of the
//! path so arbitrary wallet and account names round-trip. Every update goes
//! through temp-file + fsync + rename; the cache is only updated after the
//! rename succeeds, so an APPROVED decision can never rest on state that a
//! crash would roll back.

use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::PathBuf;
use tracing::info;

/// Slashing-protection state for one account
///
/// Absent fields mean no history. The sequence number increases with every
/// persisted update and is carried through export/import for replay
/// detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashingRecord {
    pub highest_proposed_slot: Option<u64>,
    pub latest_attestation_source_epoch: Option<u64>,
    pub latest_attestation_target_epoch: Option<u64>,
    pub sequence: u64,
}

/// Interchange document for export/import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionExport {
    pub version: u32,
    pub records: Vec<ProtectionRecord>,
}

/// One exported record, keyed by account path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionRecord {
    pub account: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highest_proposed_slot: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_attestation_source_epoch: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_attestation_target_epoch: Option<u64>,
    pub sequence: u64,
}

impl ProtectionExport {
    pub const CURRENT_VERSION: u32 = 1;
}

pub struct RulesStore {
    directory: PathBuf,
    cache: Mutex<HashMap<String, SlashingRecord>>,
}

impl RulesStore {
    /// Open the store, loading every record into the cache
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;

        let mut cache = HashMap::new();
        for entry in fs::read_dir(&directory)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let account = String::from_utf8(hex::decode(stem).map_err(|e| {
                Error::Storage(format!("bad record filename {}: {e}", path.display()))
            })?)
            .map_err(|e| Error::Storage(format!("bad record filename {}: {e}", path.display())))?;

            let file = File::open(&path)?;
            let record: SlashingRecord =
                serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                    Error::Storage(format!("corrupt slashing record {}: {e}", path.display()))
                })?;
            cache.insert(account, record);
        }
        info!(
            directory = %directory.display(),
            records = cache.len(),
            "opened slashing-protection store"
        );

        Ok(Self {
            directory,
            cache: Mutex::new(cache),
        })
    }

    fn record_path(&self, account: &str) -> PathBuf {
        self.directory
            .join(format!("{}.json", hex::encode(account)))
    }

    /// Current record for an account, if any history exists
    pub fn record(&self, account: &str) -> Option<SlashingRecord> {
        self.cache.lock().get(account).cloned()
    }

    /// Account paths with history, sorted
    pub fn accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self.cache.lock().keys().cloned().collect();
        accounts.sort();
        accounts
    }

    /// Apply a mutation and persist it durably
    ///
    /// The mutation sees the current record (default when the account has no
    /// history); the sequence number is bumped here. The cache is updated
    /// only after the record is on disk, so callers may treat a returned
    /// `Ok` as a committed decision.
    pub fn update(
        &self,
        account: &str,
        mutate: impl FnOnce(&mut SlashingRecord),
    ) -> Result<SlashingRecord> {
        let mut cache = self.cache.lock();
        let mut record = cache.get(account).cloned().unwrap_or_default();
        mutate(&mut record);
        record.sequence += 1;

        self.persist(account, &record)?;
        cache.insert(account.to_string(), record.clone());
        Ok(record)
    }

    fn persist(&self, account: &str, record: &SlashingRecord) -> Result<()> {
        let target = self.record_path(account);
        let temp = target.with_extension("tmp");

        let data = serde_json::to_vec_pretty(record)?;
        fs::write(&temp, &data)?;
        let file = File::open(&temp)?;
        file.sync_all()?;
        fs::rename(&temp, &target)?;
        Ok(())
    }

    /// Remove all history for one account
    pub fn reset(&self, account: &str) -> Result<()> {
        let mut cache = self.cache.lock();
        let target = self.record_path(account);
        if target.exists() {
            fs::remove_file(&target)?;
        }
        cache.remove(account);
        Ok(())
    }

    /// Export every record in normalized (sorted) order
    pub fn export(&self) -> ProtectionExport {
        let cache = self.cache.lock();
        let mut records: Vec<ProtectionRecord> = cache
            .iter()
            .map(|(account, record)| ProtectionRecord {
                account: account.clone(),
                highest_proposed_slot: record.highest_proposed_slot,
                latest_attestation_source_epoch: record.latest_attestation_source_epoch,
                latest_attestation_target_epoch: record.latest_attestation_target_epoch,
                sequence: record.sequence,
            })
            .collect();
        records.sort_by(|a, b| a.account.cmp(&b.account));
        ProtectionExport {
            version: ProtectionExport::CURRENT_VERSION,
            records,
        }
    }

    /// Import records, replacing any existing state for the same accounts
    pub fn import(&self, export: &ProtectionExport) -> Result<usize> {
        if export.version != ProtectionExport::CURRENT_VERSION {
            return Err(Error::Invalid(format!(
                "unsupported protection export version {}",
                export.version
            )));
        }
        let mut cache = self.cache.lock();
        for imported in &export.records {
            let record = SlashingRecord {
                highest_proposed_slot: imported.highest_proposed_slot,
                latest_attestation_source_epoch: imported.latest_attestation_source_epoch,
                latest_attestation_target_epoch: imported.latest_attestation_target_epoch,
                sequence: imported.sequence,
            };
            self.persist(&imported.account, &record)?;
            cache.insert(imported.account.clone(), record);
        }
        Ok(export.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = RulesStore::open(dir.path()).unwrap();
            let record = store
                .update("w1/acct1", |r| {
                    r.latest_attestation_source_epoch = Some(5);
                    r.latest_attestation_target_epoch = Some(10);
                })
                .unwrap();
            assert_eq!(record.sequence, 1);
        }

        // A fresh store over the same directory sees the committed state.
        let store = RulesStore::open(dir.path()).unwrap();
        let record = store.record("w1/acct1").unwrap();
        assert_eq!(record.latest_attestation_source_epoch, Some(5));
        assert_eq!(record.latest_attestation_target_epoch, Some(10));
        assert_eq!(record.sequence, 1);
        assert!(store.record("w1/other").is_none());
    }

    #[test]
    fn test_sequence_increases() {
        let dir = tempfile::tempdir().unwrap();
        let store = RulesStore::open(dir.path()).unwrap();
        for expected in 1..=3u64 {
            let record = store
                .update("w1/acct1", |r| r.highest_proposed_slot = Some(expected))
                .unwrap();
            assert_eq!(record.sequence, expected);
        }
    }

    #[test]
    fn test_reset_removes_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = RulesStore::open(dir.path()).unwrap();
        store
            .update("w1/acct1", |r| r.highest_proposed_slot = Some(100))
            .unwrap();
        store.reset("w1/acct1").unwrap();
        assert!(store.record("w1/acct1").is_none());

        let reopened = RulesStore::open(dir.path()).unwrap();
        assert!(reopened.record("w1/acct1").is_none());
    }

    #[test]
    fn test_export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RulesStore::open(dir.path()).unwrap();
        store
            .update("w1/b", |r| r.highest_proposed_slot = Some(7))
            .unwrap();
        store
            .update("w1/a", |r| {
                r.latest_attestation_source_epoch = Some(1);
                r.latest_attestation_target_epoch = Some(2);
            })
            .unwrap();

        let exported = store.export();
        // Normalized: sorted by account path.
        assert_eq!(exported.records[0].account, "w1/a");
        assert_eq!(exported.records[1].account, "w1/b");

        let other_dir = tempfile::tempdir().unwrap();
        let other = RulesStore::open(other_dir.path()).unwrap();
        assert_eq!(other.import(&exported).unwrap(), 2);
        assert_eq!(other.export(), exported);
    }
}
