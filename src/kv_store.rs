//! Flat key-value credential store.
//!
//! Unlike the entry stores, this backend holds free-form secrets (console
//! passwords, wallet ids) addressed by a caller-chosen key string. It is a
//! deliberately separate type rather than a [`crate::store::KeyStore`]
//! implementation: values here are not (host, user) credentials, deletion
//! is by raw key, and there is no host cache to keep coherent.
//!
//! The database is one JSON file mapping key to [`KvRecord`]. Every
//! operation reloads the file first so concurrent writers on the same box
//! see each other's changes at the file level.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::KvConfig;
use crate::entry::{current_time, Operation, UNKNOWN};
use crate::envelope::EnvelopeKey;
use crate::error::{KmsError, Result};

/// One stored value: the envelope plus provenance metadata. The `version`
/// field distinguishes these records from entry records in mixed payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvRecord {
    #[serde(rename = "encData", default)]
    pub enc_data: String,
    #[serde(rename = "keyId", default)]
    pub key_id: String,
    #[serde(rename = "creationTime", default)]
    pub creation_time: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "exacloud_host", default)]
    pub origin_host: String,
    #[serde(default = "kv_version")]
    pub version: String,
}

fn kv_version() -> String {
    "KV".to_string()
}

/// A key-value mutation as exchanged with a replication peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvHistoryRecord {
    pub operation: Operation,
    #[serde(rename = "exakms")]
    pub snapshot: KvSnapshot,
}

/// A [`KvRecord`] together with the key it is stored under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvSnapshot {
    pub key: String,
    #[serde(flatten)]
    pub record: KvRecord,
}

/// File-backed key-value store encrypting values under an envelope key.
pub struct KvBackend {
    db_path: PathBuf,
    key: EnvelopeKey,
    label: String,
    origin_host: String,
    history: Vec<KvHistoryRecord>,
}

impl KvBackend {
    pub fn new(config: &KvConfig, key: EnvelopeKey) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            db_path: config.db_path.clone(),
            key,
            label: UNKNOWN.to_string(),
            origin_host: UNKNOWN.to_string(),
            history: Vec::new(),
        })
    }

    pub fn set_identity(&mut self, label: impl Into<String>, origin_host: impl Into<String>) {
        self.label = label.into();
        self.origin_host = origin_host.into();
    }

    pub fn envelope_key(&self) -> &EnvelopeKey {
        &self.key
    }

    fn load_db(&self) -> Result<BTreeMap<String, KvRecord>> {
        if !self.db_path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.db_path)?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn dump_db(&self, db: &BTreeMap<String, KvRecord>) -> Result<()> {
        fs::write(&self.db_path, serde_json::to_string_pretty(db)?)?;
        Ok(())
    }

    /// Store `value` under `key`, sealing it with this store's envelope
    /// key. An existing record is replaced.
    pub fn insert(&mut self, key: &str, value: &str) -> Result<bool> {
        let record = KvRecord {
            enc_data: self.key.seal(value.as_bytes())?,
            key_id: self.key.id().to_string(),
            creation_time: current_time(),
            label: self.label.clone(),
            origin_host: self.origin_host.clone(),
            version: kv_version(),
        };

        let mut db = self.load_db()?;
        db.insert(key.to_string(), record.clone());
        self.dump_db(&db)?;

        info!(key, "value stored");
        self.history.push(KvHistoryRecord {
            operation: Operation::Insert,
            snapshot: KvSnapshot {
                key: key.to_string(),
                record,
            },
        });
        Ok(true)
    }

    /// Remove the record stored under a raw key string. Absent keys return
    /// `Ok(false)` and record nothing.
    pub fn delete_by_key(&mut self, key: &str) -> Result<bool> {
        let mut db = self.load_db()?;
        let Some(record) = db.remove(key) else {
            warn!(key, "nothing to delete, key absent");
            return Ok(false);
        };
        self.dump_db(&db)?;

        info!(key, "value removed");
        self.history.push(KvHistoryRecord {
            operation: Operation::Delete,
            snapshot: KvSnapshot {
                key: key.to_string(),
                record,
            },
        });
        Ok(true)
    }

    /// The record stored under `key`, if any.
    pub fn get(&self, key: &str) -> Result<Option<KvRecord>> {
        Ok(self.load_db()?.remove(key))
    }

    /// Every stored record carrying an envelope, keyed. Records without
    /// content are skipped.
    pub fn search(&self) -> Result<Vec<KvSnapshot>> {
        Ok(self
            .load_db()?
            .into_iter()
            .filter(|(_, record)| !record.enc_data.is_empty())
            .map(|(key, record)| KvSnapshot { key, record })
            .collect())
    }

    /// Decrypt a record's value with this store's envelope key.
    pub fn reveal(&self, record: &KvRecord) -> Result<Zeroizing<String>> {
        if record.key_id != self.key.id() {
            return Err(KmsError::KeyMismatch {
                expected: self.key.id().to_string(),
                found: record.key_id.clone(),
            });
        }
        self.key.open_utf8(&record.enc_data)
    }

    /// Pending mutations since the last replication send.
    pub fn history_json(&self) -> Vec<KvHistoryRecord> {
        self.history.clone()
    }

    /// The entire database as insert records, followed by pending history.
    pub fn full_json(&self) -> Result<Vec<KvHistoryRecord>> {
        let mut records: Vec<KvHistoryRecord> = self
            .search()?
            .into_iter()
            .map(|snapshot| KvHistoryRecord {
                operation: Operation::Insert,
                snapshot,
            })
            .collect();
        records.extend(self.history.iter().cloned());
        Ok(records)
    }

    /// Drop pending history. Call only after a consumer has acknowledged
    /// receiving it.
    pub fn reset_history(&mut self) {
        self.history.clear();
    }

    pub fn pending_history(&self) -> usize {
        self.history.len()
    }
}
