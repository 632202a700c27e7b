//! Vault-backed key store aggregating entries into per-host secrets.
//!
//! Each secret in the vault is one aggregate object: a base64-encoded JSON
//! map from sub-key name (`id_rsa.<shortname>.<user>`) to one
//! [`AggregateRecord`]. Insert and delete are read-modify-write cycles on
//! the owning aggregate; unknown sub-keys pass through untouched so sites
//! running different releases can share a vault.
//!
//! The vault provider is abstracted behind [`VaultClient`] so the backend
//! is testable without network access; [`InMemoryVault`] is the in-process
//! implementation used by tests and benchmarks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use base64::prelude::{Engine, BASE64_STANDARD};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::config::VaultConfig;
use crate::entry::{AggregateRecord, Algorithm, Entry, HostType};
use crate::envelope::EnvelopeKey;
use crate::error::{KmsError, Result};
use crate::store::{
    effective_creation_time, sort_newest_first, KeyStore, SearchPattern, StoreState,
};

/// Sub-key names inside an aggregate secret. Group 1 is the host shortname
/// (the full fqdn lives in the secret name when it is dotted), group 2 the
/// user.
const SUB_KEY_PATTERN: &str = r"^id_rsa\.([\w\-]+)\.([\w\-]+)$";

/// Grace period before a deprecated secret version is removed.
const VERSION_DELETION_DELAY_MINUTES: i64 = 24 * 60 + 10;

// ---------------------------------------------------------------------------
// Provider abstraction
// ---------------------------------------------------------------------------

/// A stored secret as listed, without its content.
#[derive(Debug, Clone)]
pub struct SecretSummary {
    pub name: String,
}

/// A stored secret with its current content (base64 text).
#[derive(Debug, Clone)]
pub struct SecretBundle {
    pub id: String,
    pub name: String,
    pub content: String,
}

/// One historic version of a secret.
#[derive(Debug, Clone)]
pub struct SecretVersion {
    pub number: u64,
    /// Neither the current nor the pending version.
    pub deprecated: bool,
    /// Set once the version is scheduled for removal.
    pub deletion_time: Option<DateTime<Utc>>,
}

/// One page of a secret listing.
#[derive(Debug, Clone)]
pub struct SecretPage {
    pub secrets: Vec<SecretSummary>,
    pub next_page: Option<String>,
}

/// One page of a version listing.
#[derive(Debug, Clone)]
pub struct VersionPage {
    pub versions: Vec<SecretVersion>,
    pub next_page: Option<String>,
}

/// The vault provider surface [`VaultBackend`] depends on.
pub trait VaultClient: Send {
    /// Fetch a secret by name. Absent secrets are `Ok(None)`, not errors.
    fn get_secret(&self, vault_id: &str, name: &str) -> Result<Option<SecretBundle>>;

    /// Create a secret with an initial content version.
    fn create_secret(
        &self,
        vault_id: &str,
        key_id: &str,
        compartment_id: &str,
        name: &str,
        content: &str,
    ) -> Result<()>;

    /// Push a new content version onto an existing secret.
    fn update_secret(&self, secret_id: &str, content: &str) -> Result<()>;

    /// List secrets in a vault, one page at a time.
    fn list_secrets(
        &self,
        vault_id: &str,
        compartment_id: &str,
        page: Option<&str>,
    ) -> Result<SecretPage>;

    /// List the versions of a secret, one page at a time.
    fn list_versions(&self, secret_id: &str, page: Option<&str>) -> Result<VersionPage>;

    /// Schedule a version for deletion at `time`. Providers cap how many
    /// deletions may be pending at once; the cap surfaces as
    /// [`KmsError::VersionCleanupLimit`].
    fn schedule_version_deletion(
        &self,
        secret_id: &str,
        version: u64,
        time: DateTime<Utc>,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// VaultBackend
// ---------------------------------------------------------------------------

/// [`KeyStore`] over an aggregated-secret vault.
pub struct VaultBackend {
    client: Box<dyn VaultClient>,
    config: VaultConfig,
    key: EnvelopeKey,
    state: StoreState,
}

impl VaultBackend {
    /// Build a backend over `client`. The primary vault identifiers are
    /// mandatory; the backup pair stays optional until backup is invoked.
    pub fn new(
        client: Box<dyn VaultClient>,
        config: VaultConfig,
        key: EnvelopeKey,
        state: StoreState,
    ) -> Result<Self> {
        for (field, value) in [
            ("vault_id", &config.vault_id),
            ("key_id", &config.key_id),
            ("compartment_id", &config.compartment_id),
        ] {
            if value.is_empty() {
                return Err(KmsError::Configuration(format!(
                    "vault backend requires {field} to be set"
                )));
            }
        }
        Ok(Self {
            client,
            config,
            key,
            state,
        })
    }

    pub fn envelope_key(&self) -> &EnvelopeKey {
        &self.key
    }

    // -- aggregate codec ----------------------------------------------------

    fn decode_aggregate(name: &str, content: &str) -> Result<Map<String, Value>> {
        let raw = BASE64_STANDARD.decode(content).map_err(|err| {
            KmsError::MalformedRecord(format!("secret {name} is not valid base64: {err}"))
        })?;
        serde_json::from_slice(&raw).map_err(|err| {
            KmsError::MalformedRecord(format!("secret {name} is not a valid aggregate: {err}"))
        })
    }

    fn encode_aggregate(map: &Map<String, Value>) -> Result<String> {
        Ok(BASE64_STANDARD.encode(serde_json::to_string(map)?))
    }

    /// Parse the entries stored in a secret, applying the strict-host and
    /// user filters. Sub-keys that do not follow the naming scheme are
    /// skipped, not errors.
    fn entries_from_secret(
        &self,
        bundle: &SecretBundle,
        strict: bool,
        user: Option<&str>,
    ) -> Result<Vec<Entry>> {
        let map = Self::decode_aggregate(&bundle.name, &bundle.content)?;
        let pattern = Regex::new(SUB_KEY_PATTERN)
            .map_err(|err| KmsError::Configuration(format!("sub-key pattern: {err}")))?;

        let mut entries = Vec::new();
        for (sub_key, value) in &map {
            let Some(captures) = pattern.captures(sub_key) else {
                debug!(secret = %bundle.name, sub_key, "skipping unrecognised sub-key");
                continue;
            };
            // Dotted secret names carry the full fqdn; the sub-key only
            // holds the shortname.
            let fqdn = if bundle.name.contains('.') {
                bundle.name.as_str()
            } else {
                &captures[1]
            };
            let entry_user = &captures[2];

            if let Some(wanted) = user {
                if wanted != entry_user {
                    continue;
                }
            }
            if strict && shortname(&bundle.name) != shortname(fqdn) {
                continue;
            }

            let record: AggregateRecord = serde_json::from_value(value.clone())?;
            entries.push(Entry::from_aggregate_record(
                fqdn,
                entry_user,
                bundle.name.clone(),
                &record,
            ));
        }
        Ok(entries)
    }

    // -- vault plumbing -----------------------------------------------------

    fn list_all_secrets(&self, vault_id: &str) -> Result<Vec<SecretSummary>> {
        let mut secrets = Vec::new();
        let mut page: Option<String> = None;
        loop {
            let resp =
                self.client
                    .list_secrets(vault_id, &self.config.compartment_id, page.as_deref())?;
            secrets.extend(resp.secrets);
            match resp.next_page {
                Some(next) => page = Some(next),
                None => break,
            }
        }
        Ok(secrets)
    }

    /// Schedule removal of deprecated versions. Advisory: a provider cap
    /// or transient failure never fails the mutation that triggered it.
    fn delete_secret_versions(&self, secret_id: &str) {
        let mut versions = Vec::new();
        let mut page: Option<String> = None;
        loop {
            match self.client.list_versions(secret_id, page.as_deref()) {
                Ok(resp) => {
                    versions.extend(resp.versions);
                    match resp.next_page {
                        Some(next) => page = Some(next),
                        None => break,
                    }
                }
                Err(err) => {
                    warn!(secret_id, %err, "unable to list secret versions");
                    return;
                }
            }
        }

        let deadline = Utc::now() + Duration::minutes(VERSION_DELETION_DELAY_MINUTES);
        for version in versions {
            if !version.deprecated || version.deletion_time.is_some() {
                continue;
            }
            match self
                .client
                .schedule_version_deletion(secret_id, version.number, deadline)
            {
                Ok(()) => {}
                // Provider cap on pending deletions; remaining versions get
                // cleaned up by a later mutation.
                Err(KmsError::VersionCleanupLimit) => continue,
                Err(err) => {
                    warn!(secret_id, version = version.number, %err,
                          "unable to schedule secret version deletion");
                }
            }
        }
    }

    /// Write an aggregate back, creating the secret when it does not exist
    /// yet, and tidy deprecated versions afterwards.
    fn write_aggregate(
        &self,
        existing: Option<&SecretBundle>,
        vault_id: &str,
        key_id: &str,
        name: &str,
        map: &Map<String, Value>,
    ) -> Result<()> {
        let content = Self::encode_aggregate(map)?;
        match existing {
            Some(bundle) => {
                self.client.update_secret(&bundle.id, &content)?;
                self.delete_secret_versions(&bundle.id);
            }
            None => self.client.create_secret(
                vault_id,
                key_id,
                &self.config.compartment_id,
                name,
                &content,
            )?,
        }
        Ok(())
    }

    /// Copy one secret's content verbatim between the primary and backup
    /// vaults. Empty aggregates are not worth a copy.
    fn copy_secret_content(&self, name: &str, to_primary: bool) -> Result<()> {
        let (backup_vault, backup_key) = self.config.backup_target().ok_or_else(|| {
            KmsError::Configuration("backup vault is not configured".to_string())
        })?;
        let (from_vault, to_vault, to_key) = if to_primary {
            (backup_vault, self.config.vault_id.as_str(), self.config.key_id.as_str())
        } else {
            (self.config.vault_id.as_str(), backup_vault, backup_key)
        };

        let Some(source) = self.client.get_secret(from_vault, name)? else {
            warn!(secret = name, "secret disappeared during copy");
            return Ok(());
        };
        let map = Self::decode_aggregate(name, &source.content)?;
        if map.is_empty() {
            return Ok(());
        }

        let target = self.client.get_secret(to_vault, name)?;
        self.write_aggregate(target.as_ref(), to_vault, to_key, name, &map)?;
        debug!(secret = name, "copied aggregate content");
        Ok(())
    }

    fn scan_all(&mut self, strict: bool) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for summary in self.list_all_secrets(&self.config.vault_id.clone())? {
            let Some(bundle) = self.client.get_secret(&self.config.vault_id, &summary.name)?
            else {
                warn!(secret = %summary.name, "listed secret has no readable content");
                continue;
            };
            entries.extend(self.entries_from_secret(&bundle, strict, None)?);
        }
        sort_newest_first(&mut entries);
        for entry in &entries {
            self.state.cache_mut().upsert(entry.clone());
        }
        Ok(entries)
    }
}

fn shortname(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}

impl KeyStore for VaultBackend {
    fn state(&self) -> &StoreState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StoreState {
        &mut self.state
    }

    fn search(&mut self, pattern: &SearchPattern, refresh: bool) -> Result<Vec<Entry>> {
        let mut pattern = pattern.clone();
        if let Some(fqdn) = pattern.fqdn.take() {
            pattern.fqdn = Some(self.state.normalize_host(&fqdn));
        }

        if !refresh {
            let cached = self.state.cache().filter(&pattern)?;
            if !cached.is_empty() {
                return Ok(cached);
            }
        }

        // A host filter targets one aggregate directly.
        if let Some(ref fqdn) = pattern.fqdn {
            let Some(bundle) = self.client.get_secret(&self.config.vault_id, fqdn)? else {
                warn!(fqdn = %fqdn, "no entry found");
                return Ok(Vec::new());
            };
            let mut entries =
                self.entries_from_secret(&bundle, pattern.strict, pattern.user.as_deref())?;
            sort_newest_first(&mut entries);
            return Ok(entries);
        }

        let entries = self.scan_all(pattern.strict)?;
        match pattern.user {
            Some(ref user) => Ok(entries
                .into_iter()
                .filter(|entry| &entry.user == user)
                .collect()),
            None => Ok(entries),
        }
    }

    fn insert(&mut self, mut entry: Entry, preserve_creation_time: bool) -> Result<bool> {
        if entry.secret_name.is_none() {
            entry.secret_name = Some(entry.fqdn.clone());
        }
        entry.creation_time = effective_creation_time(&entry, preserve_creation_time);

        let secret_name = entry.secret_name().to_string();
        let existing = self.client.get_secret(&self.config.vault_id, &secret_name)?;
        let mut map = match existing {
            Some(ref bundle) => Self::decode_aggregate(&secret_name, &bundle.content)?,
            None => Map::new(),
        };
        map.insert(
            entry.sub_key(),
            serde_json::to_value(entry.aggregate_record(true))?,
        );
        self.write_aggregate(
            existing.as_ref(),
            &self.config.vault_id,
            &self.config.key_id,
            &secret_name,
            &map,
        )?;

        info!(sub_key = %entry.sub_key(), secret = %secret_name, "entry stored");
        self.state.record_insert(&entry);
        Ok(true)
    }

    fn delete(&mut self, entry: &Entry) -> Result<bool> {
        let secret_name = entry.secret_name();
        let sub_key = entry.sub_key();

        let Some(bundle) = self.client.get_secret(&self.config.vault_id, secret_name)? else {
            warn!(secret = %secret_name, %sub_key, "cannot delete, aggregate does not exist");
            return Ok(false);
        };
        let mut map = Self::decode_aggregate(secret_name, &bundle.content)?;
        if map.remove(&sub_key).is_none() {
            info!(%sub_key, secret = %secret_name, "nothing to delete, sub-key absent");
            return Ok(false);
        }
        self.write_aggregate(
            Some(&bundle),
            &self.config.vault_id,
            &self.config.key_id,
            secret_name,
            &map,
        )?;

        info!(%sub_key, secret = %secret_name, "entry removed");
        self.state.record_delete(entry);
        Ok(true)
    }

    fn backup(&mut self) -> Result<bool> {
        if self.config.backup_target().is_none() {
            error!("no backup vault configured, no keys have been backed up");
            return Ok(false);
        }
        for summary in self.list_all_secrets(&self.config.vault_id.clone())? {
            self.copy_secret_content(&summary.name, false)?;
        }
        info!("backup of key store complete");
        Ok(true)
    }

    fn restore_backup(&mut self) -> Result<bool> {
        let Some((backup_vault, _)) = self.config.backup_target() else {
            error!("no backup vault configured, no keys have been restored");
            return Ok(false);
        };
        info!("restoring key store from backup, this might take a while");

        for summary in self.list_all_secrets(&backup_vault.to_string())? {
            self.copy_secret_content(&summary.name, true)?;
        }

        // The primary changed out-of-band; rebuild the cache from scratch.
        self.state.cache_mut().clear();
        self.search(&SearchPattern::new(), true)?;
        Ok(true)
    }

    fn build_entry(
        &self,
        fqdn: &str,
        user: &str,
        private_key: &str,
        host_type: HostType,
        algorithm: Option<Algorithm>,
    ) -> Result<Entry> {
        self.state
            .build_entry(&self.key, fqdn, user, private_key, host_type, algorithm)
    }

    fn reveal(&self, entry: &Entry) -> Result<Zeroizing<String>> {
        entry.reveal(&self.key)
    }
}

// ---------------------------------------------------------------------------
// In-memory vault
// ---------------------------------------------------------------------------

const PAGE_SIZE: usize = 2;

#[derive(Debug, Default)]
struct StoredVersion {
    content: String,
    deletion_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StoredSecret {
    id: String,
    versions: Vec<StoredVersion>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    // Keyed by (vault_id, secret_name); ids map back for update-by-id.
    secrets: HashMap<(String, String), StoredSecret>,
    ids: HashMap<String, (String, String)>,
    next_id: u64,
    deletion_limit: Option<usize>,
    get_calls: usize,
    list_calls: usize,
    create_calls: usize,
    update_calls: usize,
    scheduled_deletions: usize,
}

/// In-process [`VaultClient`] with versioned secrets and deliberately small
/// pages, so pagination and version cleanup are exercised without a real
/// provider. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVault {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cap the number of version deletions that may be scheduled; further
    /// attempts fail with [`KmsError::VersionCleanupLimit`].
    pub fn set_deletion_limit(&self, limit: usize) {
        self.lock().deletion_limit = Some(limit);
    }

    pub fn get_calls(&self) -> usize {
        self.lock().get_calls
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub fn update_calls(&self) -> usize {
        self.lock().update_calls
    }

    pub fn scheduled_deletions(&self) -> usize {
        self.lock().scheduled_deletions
    }

    /// Current content of a secret, if present.
    pub fn secret_content(&self, vault_id: &str, name: &str) -> Option<String> {
        let state = self.lock();
        state
            .secrets
            .get(&(vault_id.to_string(), name.to_string()))
            .and_then(|secret| secret.versions.last())
            .map(|version| version.content.clone())
    }

    /// How many versions a secret has accumulated.
    pub fn version_count(&self, vault_id: &str, name: &str) -> usize {
        let state = self.lock();
        state
            .secrets
            .get(&(vault_id.to_string(), name.to_string()))
            .map(|secret| secret.versions.len())
            .unwrap_or(0)
    }
}

impl VaultClient for InMemoryVault {
    fn get_secret(&self, vault_id: &str, name: &str) -> Result<Option<SecretBundle>> {
        let mut state = self.lock();
        state.get_calls += 1;
        Ok(state
            .secrets
            .get(&(vault_id.to_string(), name.to_string()))
            .and_then(|secret| {
                secret.versions.last().map(|version| SecretBundle {
                    id: secret.id.clone(),
                    name: name.to_string(),
                    content: version.content.clone(),
                })
            }))
    }

    fn create_secret(
        &self,
        vault_id: &str,
        _key_id: &str,
        _compartment_id: &str,
        name: &str,
        content: &str,
    ) -> Result<()> {
        let mut state = self.lock();
        state.create_calls += 1;
        state.next_id += 1;
        let id = format!("ocid1.vaultsecret.{}", state.next_id);
        let key = (vault_id.to_string(), name.to_string());
        state.ids.insert(id.clone(), key.clone());
        state.secrets.insert(
            key,
            StoredSecret {
                id,
                versions: vec![StoredVersion {
                    content: content.to_string(),
                    deletion_time: None,
                }],
            },
        );
        Ok(())
    }

    fn update_secret(&self, secret_id: &str, content: &str) -> Result<()> {
        let mut state = self.lock();
        state.update_calls += 1;
        let key = state
            .ids
            .get(secret_id)
            .cloned()
            .ok_or_else(|| KmsError::NotFound(format!("secret id {secret_id}")))?;
        let secret = state
            .secrets
            .get_mut(&key)
            .ok_or_else(|| KmsError::NotFound(format!("secret id {secret_id}")))?;
        secret.versions.push(StoredVersion {
            content: content.to_string(),
            deletion_time: None,
        });
        Ok(())
    }

    fn list_secrets(
        &self,
        vault_id: &str,
        _compartment_id: &str,
        page: Option<&str>,
    ) -> Result<SecretPage> {
        let mut state = self.lock();
        state.list_calls += 1;
        let mut names: Vec<String> = state
            .secrets
            .keys()
            .filter(|(vault, _)| vault == vault_id)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();

        let offset = parse_page(page)?;
        let chunk: Vec<SecretSummary> = names
            .iter()
            .skip(offset)
            .take(PAGE_SIZE)
            .map(|name| SecretSummary { name: name.clone() })
            .collect();
        let next_page = next_page_token(offset, chunk.len(), names.len());
        Ok(SecretPage {
            secrets: chunk,
            next_page,
        })
    }

    fn list_versions(&self, secret_id: &str, page: Option<&str>) -> Result<VersionPage> {
        let state = self.lock();
        let key = state
            .ids
            .get(secret_id)
            .ok_or_else(|| KmsError::NotFound(format!("secret id {secret_id}")))?;
        let secret = state
            .secrets
            .get(key)
            .ok_or_else(|| KmsError::NotFound(format!("secret id {secret_id}")))?;

        let total = secret.versions.len();
        let offset = parse_page(page)?;
        let chunk: Vec<SecretVersion> = secret
            .versions
            .iter()
            .enumerate()
            .skip(offset)
            .take(PAGE_SIZE)
            .map(|(index, version)| SecretVersion {
                number: index as u64 + 1,
                deprecated: index + 1 < total,
                deletion_time: version.deletion_time,
            })
            .collect();
        let next_page = next_page_token(offset, chunk.len(), total);
        Ok(VersionPage {
            versions: chunk,
            next_page,
        })
    }

    fn schedule_version_deletion(
        &self,
        secret_id: &str,
        version: u64,
        time: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.lock();
        if let Some(limit) = state.deletion_limit {
            if state.scheduled_deletions >= limit {
                return Err(KmsError::VersionCleanupLimit);
            }
        }
        let key = state
            .ids
            .get(secret_id)
            .cloned()
            .ok_or_else(|| KmsError::NotFound(format!("secret id {secret_id}")))?;
        let secret = state
            .secrets
            .get_mut(&key)
            .ok_or_else(|| KmsError::NotFound(format!("secret id {secret_id}")))?;
        let slot = secret
            .versions
            .get_mut(version as usize - 1)
            .ok_or_else(|| KmsError::NotFound(format!("secret version {version}")))?;
        slot.deletion_time = Some(time);
        state.scheduled_deletions += 1;
        Ok(())
    }
}

fn parse_page(page: Option<&str>) -> Result<usize> {
    match page {
        None => Ok(0),
        Some(token) => token
            .parse()
            .map_err(|_| KmsError::Configuration(format!("bad page token {token:?}"))),
    }
}

fn next_page_token(offset: usize, returned: usize, total: usize) -> Option<String> {
    let consumed = offset + returned;
    (consumed < total).then(|| consumed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Operation;

    const VAULT: &str = "ocid1.vault.test";

    fn backend() -> (VaultBackend, InMemoryVault) {
        let vault = InMemoryVault::new();
        let config = VaultConfig {
            vault_id: VAULT.to_string(),
            key_id: "ocid1.key.test".to_string(),
            compartment_id: "ocid1.compartment.test".to_string(),
            backup_vault_id: None,
            backup_key_id: None,
        };
        let key = EnvelopeKey::generate("ocid1.key.test").unwrap();
        let backend = VaultBackend::new(
            Box::new(vault.clone()),
            config,
            key,
            StoreState::new(Algorithm::Rsa),
        )
        .unwrap();
        (backend, vault)
    }

    fn insert_host(backend: &mut VaultBackend, fqdn: &str, user: &str) -> Entry {
        let pem = Algorithm::Rsa.generate_private_key().unwrap();
        let entry = backend
            .build_entry(fqdn, user, &pem, HostType::DomU, None)
            .unwrap();
        assert!(backend.insert(entry.clone(), false).unwrap());
        entry
    }

    #[test]
    fn test_new_requires_primary_identifiers() {
        let result = VaultBackend::new(
            Box::new(InMemoryVault::new()),
            VaultConfig::default(),
            EnvelopeKey::generate("k").unwrap(),
            StoreState::new(Algorithm::Rsa),
        );
        assert!(matches!(result, Err(KmsError::Configuration(_))));
    }

    #[test]
    fn test_insert_groups_users_into_one_aggregate() {
        let (mut backend, vault) = backend();
        insert_host(&mut backend, "db1.example.com", "oracle");
        insert_host(&mut backend, "db1.example.com", "grid");

        let content = vault.secret_content(VAULT, "db1.example.com").unwrap();
        let map = VaultBackend::decode_aggregate("db1.example.com", &content).unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("id_rsa.db1.oracle"));
        assert!(map.contains_key("id_rsa.db1.grid"));
    }

    #[test]
    fn test_search_targeted_and_missing_host() {
        let (mut backend, _vault) = backend();
        insert_host(&mut backend, "db1.example.com", "oracle");

        let found = backend
            .search(&SearchPattern::new().with_fqdn("db1.example.com"), true)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user, "oracle");

        let missing = backend
            .search(&SearchPattern::new().with_fqdn("db9.example.com"), true)
            .unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_targeted_search_sorts_newest_first() {
        let (mut backend, _vault) = backend();
        let pem = Algorithm::Rsa.generate_private_key().unwrap();

        let mut old = backend
            .build_entry("db1.example.com", "oracle", &pem, HostType::DomU, None)
            .unwrap();
        old.creation_time = "2023-01-01 00:00:00+0000".to_string();
        assert!(backend.insert(old, true).unwrap());

        let mut new = backend
            .build_entry("db1.example.com", "grid", &pem, HostType::DomU, None)
            .unwrap();
        new.creation_time = "2024-06-01 00:00:00+0000".to_string();
        assert!(backend.insert(new, true).unwrap());

        let found = backend
            .search(&SearchPattern::new().with_fqdn("db1.example.com"), true)
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].user, "grid");
        assert_eq!(found[1].user, "oracle");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (mut backend, _vault) = backend();
        let entry = insert_host(&mut backend, "db1.example.com", "oracle");

        assert!(backend.delete(&entry).unwrap());
        // Sub-key already gone, then the whole aggregate stays but empty.
        assert!(!backend.delete(&entry).unwrap());

        let history = backend.history_json();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].operation, Operation::Delete);
    }

    #[test]
    fn test_malformed_aggregate_is_an_error() {
        let (mut backend, vault) = backend();
        vault
            .create_secret(VAULT, "k", "c", "bad.example.com", "!!not-base64!!")
            .unwrap();

        let result = backend.search(&SearchPattern::new().with_fqdn("bad.example.com"), true);
        assert!(matches!(result, Err(KmsError::MalformedRecord(_))));
    }

    #[test]
    fn test_full_scan_paginates_and_fills_cache() {
        let (mut backend, vault) = backend();
        for host in ["a.example.com", "b.example.com", "c.example.com"] {
            insert_host(&mut backend, host, "oracle");
        }
        backend.state_mut().cache_mut().clear();

        let lists_before = vault.list_calls();
        let all = backend.search(&SearchPattern::new(), true).unwrap();
        assert_eq!(all.len(), 3);
        // Three secrets at two per page means at least two list calls.
        assert!(vault.list_calls() - lists_before >= 2);
        assert_eq!(backend.state().cache().len(), 3);

        // A warm cache answers without touching the vault.
        let gets_before = vault.get_calls();
        let cached = backend.search(&SearchPattern::new(), false).unwrap();
        assert_eq!(cached.len(), 3);
        assert_eq!(vault.get_calls(), gets_before);
    }

    #[test]
    fn test_update_schedules_deprecated_version_cleanup() {
        let (mut backend, vault) = backend();
        insert_host(&mut backend, "db1.example.com", "oracle");
        insert_host(&mut backend, "db1.example.com", "grid");

        // First insert created the secret, second one deprecated a version.
        assert_eq!(vault.version_count(VAULT, "db1.example.com"), 2);
        assert_eq!(vault.scheduled_deletions(), 1);
    }

    #[test]
    fn test_version_cleanup_limit_is_not_fatal() {
        let (mut backend, vault) = backend();
        vault.set_deletion_limit(0);
        insert_host(&mut backend, "db1.example.com", "oracle");
        insert_host(&mut backend, "db1.example.com", "grid");

        assert_eq!(vault.scheduled_deletions(), 0);
        // The inserts themselves still succeeded.
        assert_eq!(backend.state().history().len(), 2);
    }

    #[test]
    fn test_backup_unconfigured_returns_false() {
        let (mut backend, _vault) = backend();
        insert_host(&mut backend, "db1.example.com", "oracle");
        assert!(!backend.backup().unwrap());
        assert!(!backend.restore_backup().unwrap());
    }

    #[test]
    fn test_backup_and_restore_roundtrip() {
        let vault = InMemoryVault::new();
        let config = VaultConfig {
            vault_id: VAULT.to_string(),
            key_id: "ocid1.key.test".to_string(),
            compartment_id: "ocid1.compartment.test".to_string(),
            backup_vault_id: Some("ocid1.vault.backup".to_string()),
            backup_key_id: Some("ocid1.key.backup".to_string()),
        };
        let key = EnvelopeKey::generate("ocid1.key.test").unwrap();
        let mut backend = VaultBackend::new(
            Box::new(vault.clone()),
            config,
            key,
            StoreState::new(Algorithm::Rsa),
        )
        .unwrap();

        let entry = insert_host(&mut backend, "db1.example.com", "oracle");
        assert!(backend.backup().unwrap());
        assert!(vault
            .secret_content("ocid1.vault.backup", "db1.example.com")
            .is_some());

        // Lose the entry in the primary, then restore.
        assert!(backend.delete(&entry).unwrap());
        assert!(backend.restore_backup().unwrap());

        let found = backend
            .search(&SearchPattern::new().with_fqdn("db1.example.com"), true)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].hash, entry.hash);
    }
}
