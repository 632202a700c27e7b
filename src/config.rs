//! Deployment configuration.
//!
//! One [`KmsConfig`] is loaded at process start and handed to whichever
//! backend the deployment uses. Backends and coordinators receive their
//! collaborators explicitly — there is no ambient "current store" state.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::entry::{Algorithm, UNKNOWN};
use crate::error::Result;
use crate::store::StoreState;

/// Top-level configuration. All sections have working defaults so partial
/// config files parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    /// Algorithm used when an entry factory is called without one.
    pub default_algorithm: Algorithm,
    /// Site label stamped on entries created by this node.
    pub label: String,
    /// Identity this node reports in audit records and entry metadata.
    /// Defaults to the `HOSTNAME` environment variable.
    pub origin_host: Option<String>,
    /// Peer node receiving replication payloads. `None` disables sync.
    pub remote_peer: Option<String>,
    /// Cluster-internal host aliases, resolved before storage.
    pub host_aliases: HashMap<String, String>,
    pub vault: VaultConfig,
    pub file: FileConfig,
    pub kv: KvConfig,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            default_algorithm: Algorithm::Ecdsa,
            label: UNKNOWN.to_string(),
            origin_host: None,
            remote_peer: None,
            host_aliases: HashMap::new(),
            vault: VaultConfig::default(),
            file: FileConfig::default(),
            kv: KvConfig::default(),
        }
    }
}

impl KmsConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The identity this node stamps on entries and audit records.
    pub fn resolved_origin_host(&self) -> String {
        self.origin_host
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| UNKNOWN.to_string())
    }

    /// Build the shared backend state this configuration describes.
    pub fn store_state(&self) -> StoreState {
        let mut state = StoreState::new(self.default_algorithm);
        state.set_identity(self.label.clone(), self.resolved_origin_host());
        state.set_aliases(self.host_aliases.clone());
        state
    }
}

/// Secrets-vault backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// OCID of the vault holding the aggregate secrets.
    pub vault_id: String,
    /// OCID of the key new secrets are created under.
    pub key_id: String,
    /// OCID of the compartment secrets are listed from.
    pub compartment_id: String,
    /// Secondary vault for backup/restore. Backup is refused when unset.
    pub backup_vault_id: Option<String>,
    /// Key for secrets created in the secondary vault.
    pub backup_key_id: Option<String>,
}

impl VaultConfig {
    /// Both backup identifiers, or `None` if backup is not configured.
    pub fn backup_target(&self) -> Option<(&str, &str)> {
        match (&self.backup_vault_id, &self.backup_key_id) {
            (Some(vault), Some(key)) => Some((vault.as_str(), key.as_str())),
            _ => None,
        }
    }
}

/// Filesystem backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Directory holding one JSON file per entry.
    pub key_path: PathBuf,
    /// Directory receiving timestamped backup copies.
    pub backup_path: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            key_path: PathBuf::from("clusters/keyfleet"),
            backup_path: PathBuf::from("clusters/keyfleet_backup"),
        }
    }
}

/// Flat key-value backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Path of the flat database file.
    pub db_path: PathBuf,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("db/keyfleet-kv.db"),
        }
    }
}
