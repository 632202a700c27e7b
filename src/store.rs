//! The key-store contract and the state every backend shares.
//!
//! A backend owns three pieces of process-local state besides its remote
//! storage: a [`Cache`] of recently seen entries keyed by fqdn, a
//! [`HistoryLog`] of pending mutations awaiting replication, and an
//! [`AuditTrail`] of all mutations ever made. [`StoreState`] bundles the
//! three so backends compose it instead of re-implementing the
//! bookkeeping.
//!
//! The cache is unsynchronized by design: a `KeyStore` instance assumes a
//! single in-process caller at a time. Concurrent callers need separate
//! instances or external locking.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;
use zeroize::Zeroizing;

use crate::audit::{AuditRecord, AuditSink, AuditTrail};
use crate::entry::{current_time, Algorithm, Entry, EntrySnapshot, HostType, Operation, UNKNOWN};
use crate::envelope::EnvelopeKey;
use crate::error::{KmsError, Result};

// ---------------------------------------------------------------------------
// Search pattern
// ---------------------------------------------------------------------------

/// Filter for [`KeyStore::search`]. An empty pattern matches everything.
#[derive(Debug, Clone, Default)]
pub struct SearchPattern {
    /// Host filter. Matched as a regular expression against cached fqdns
    /// unless `strict` is set, in which case shortnames must be equal.
    pub fqdn: Option<String>,
    /// Exact user filter.
    pub user: Option<String>,
    /// Restrict fqdn matching to shortname equality.
    pub strict: bool,
}

impl SearchPattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fqdn(mut self, fqdn: impl Into<String>) -> Self {
        self.fqdn = Some(fqdn.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fqdn.is_none() && self.user.is_none()
    }
}

fn shortname(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Process-local map of the most recently seen entry per fqdn. Written on
/// every successful insert and on full backend scans; the owning fqdn is
/// evicted on delete.
#[derive(Debug, Default)]
pub struct Cache {
    entries: HashMap<String, Entry>,
}

impl Cache {
    pub fn upsert(&mut self, entry: Entry) {
        self.entries.insert(entry.fqdn.clone(), entry);
    }

    pub fn evict(&mut self, fqdn: &str) {
        self.entries.remove(fqdn);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the cached entries matching `pattern`.
    pub fn filter(&self, pattern: &SearchPattern) -> Result<Vec<Entry>> {
        let fqdn_regex = match (&pattern.fqdn, pattern.strict) {
            (Some(f), false) => Some(Regex::new(f).map_err(|err| {
                KmsError::Configuration(format!("invalid fqdn pattern {f:?}: {err}"))
            })?),
            _ => None,
        };

        let mut matches = Vec::new();
        for (fqdn, entry) in &self.entries {
            if let Some(ref wanted) = pattern.fqdn {
                if pattern.strict {
                    if shortname(wanted) != shortname(fqdn) {
                        continue;
                    }
                } else if let Some(ref re) = fqdn_regex {
                    if !re.is_match(fqdn) {
                        continue;
                    }
                }
            }
            if let Some(ref user) = pattern.user {
                if &entry.user != user {
                    continue;
                }
            }
            matches.push(entry.clone());
        }
        Ok(matches)
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One pending mutation, as exchanged with a replication peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub operation: Operation,
    /// The record key the peer protocol uses for the entry snapshot.
    #[serde(rename = "exakms")]
    pub entry: EntrySnapshot,
}

/// Append-only log of mutations since the last successful replication
/// send. Cleared wholesale on reset — there is no partial ack.
#[derive(Debug, Default)]
pub struct HistoryLog {
    records: Vec<(Operation, Entry)>,
}

impl HistoryLog {
    pub fn append(&mut self, operation: Operation, entry: Entry) {
        self.records.push((operation, entry));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Serialise the pending mutations in append order.
    pub fn to_records(&self) -> Vec<HistoryRecord> {
        self.records
            .iter()
            .map(|(operation, entry)| HistoryRecord {
                operation: *operation,
                entry: entry.snapshot(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Shared backend state
// ---------------------------------------------------------------------------

/// The bookkeeping every backend carries: cache, pending history, audit
/// trail, host alias table and store-level defaults.
#[derive(Debug)]
pub struct StoreState {
    cache: Cache,
    history: HistoryLog,
    audit: AuditTrail,
    default_algorithm: Algorithm,
    label: String,
    origin_host: String,
    aliases: HashMap<String, String>,
}

impl StoreState {
    pub fn new(default_algorithm: Algorithm) -> Self {
        Self {
            cache: Cache::default(),
            history: HistoryLog::default(),
            audit: AuditTrail::new(),
            default_algorithm,
            label: UNKNOWN.to_string(),
            origin_host: UNKNOWN.to_string(),
            aliases: HashMap::new(),
        }
    }

    pub fn set_identity(&mut self, label: impl Into<String>, origin_host: impl Into<String>) {
        self.label = label.into();
        self.origin_host = origin_host.into();
    }

    pub fn set_aliases(&mut self, aliases: HashMap<String, String>) {
        self.aliases = aliases;
    }

    pub fn add_audit_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.audit.add_forward_sink(sink);
    }

    pub fn default_algorithm(&self) -> Algorithm {
        self.default_algorithm
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut Cache {
        &mut self.cache
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn reset_history(&mut self) {
        self.history.clear();
    }

    /// Resolve a cluster-internal alias to the real host identity. Hosts
    /// without an alias pass through unchanged.
    pub fn normalize_host(&self, host: &str) -> String {
        self.aliases.get(host).cloned().unwrap_or_else(|| host.to_string())
    }

    /// Build an entry under this store's envelope key, stamping it with the
    /// store's site identity.
    pub fn build_entry(
        &self,
        key: &EnvelopeKey,
        fqdn: &str,
        user: &str,
        private_key: &str,
        host_type: HostType,
        algorithm: Option<Algorithm>,
    ) -> Result<Entry> {
        let algorithm = algorithm.unwrap_or(self.default_algorithm);
        let fqdn = self.normalize_host(fqdn);
        let mut entry = Entry::build(fqdn, user, private_key, host_type, algorithm, key)?;
        entry.label = self.label.clone();
        entry.origin_host = self.origin_host.clone();
        Ok(entry)
    }

    /// Record a successful insert: history, cache and audit trail.
    pub fn record_insert(&mut self, entry: &Entry) {
        trace!(fqdn = %entry.fqdn, user = %entry.user, "inserted entry");
        self.history.append(Operation::Insert, entry.clone());
        self.cache.upsert(entry.clone());
        self.audit.append(self.audit_record(Operation::Insert, entry));
    }

    /// Record a successful delete: history, cache eviction and audit trail.
    pub fn record_delete(&mut self, entry: &Entry) {
        trace!(fqdn = %entry.fqdn, user = %entry.user, "deleted entry");
        self.history.append(Operation::Delete, entry.clone());
        self.cache.evict(&entry.fqdn);
        self.audit.append(self.audit_record(Operation::Delete, entry));
    }

    fn audit_record(&self, operation: Operation, entry: &Entry) -> AuditRecord {
        AuditRecord {
            timestamp: chrono::Utc::now(),
            host: self.origin_host.clone(),
            key: format!("{}@{}", entry.user, entry.fqdn),
            operation,
            id: entry.hash.clone(),
            label: entry.label.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// The KeyStore contract
// ---------------------------------------------------------------------------

/// The contract every backend implements.
///
/// Benign failures (entry absent, nothing to do) surface as `Ok(false)`;
/// provider and transport failures are raised as errors.
pub trait KeyStore {
    fn state(&self) -> &StoreState;
    fn state_mut(&mut self) -> &mut StoreState;

    /// Search entries matching `pattern`. With `refresh` false the cache is
    /// consulted first; `refresh` true always queries the backend. Results
    /// from full scans are sorted by creation time, newest first, and
    /// repopulate the cache. A not-found fqdn yields an empty list.
    fn search(&mut self, pattern: &SearchPattern, refresh: bool) -> Result<Vec<Entry>>;

    /// Insert an entry, assigning its aggregate object from the fqdn when
    /// unset. New entries are timestamped at insert unless
    /// `preserve_creation_time` is set (replication replay keeps the
    /// originating site's timestamp).
    fn insert(&mut self, entry: Entry, preserve_creation_time: bool) -> Result<bool>;

    /// Delete an entry from its owning aggregate object. Deleting an
    /// absent entry returns `Ok(false)` and records nothing.
    fn delete(&mut self, entry: &Entry) -> Result<bool>;

    /// Copy every aggregate object into the configured secondary vault.
    fn backup(&mut self) -> Result<bool>;

    /// Mirror of [`KeyStore::backup`]; additionally repopulates the cache
    /// since the primary's contents changed out-of-band.
    fn restore_backup(&mut self) -> Result<bool>;

    /// Entry factory. `algorithm` `None` selects the store default.
    fn build_entry(
        &self,
        fqdn: &str,
        user: &str,
        private_key: &str,
        host_type: HostType,
        algorithm: Option<Algorithm>,
    ) -> Result<Entry>;

    /// Decrypt an entry's private key with this store's envelope key.
    fn reveal(&self, entry: &Entry) -> Result<Zeroizing<String>>;

    /// The authorized_keys line for an entry, deriving the public key from
    /// the envelope when it has not been computed yet.
    fn authorized_key(&self, entry: &mut Entry) -> Result<String> {
        if !entry.has_public_key() {
            let plaintext = self.reveal(entry)?;
            entry.set_public_key(crate::formats::public_key_line(&plaintext)?);
        }
        let public = entry
            .cached_public_key()
            .unwrap_or_default()
            .to_string();
        Ok(entry.compose_authorized(&public))
    }

    fn default_algorithm(&self) -> Algorithm {
        self.state().default_algorithm()
    }

    /// Pending mutations since the last replication send, in order.
    fn history_json(&self) -> Vec<HistoryRecord> {
        self.state().history().to_records()
    }

    /// The entire current entry set as insert records, followed by any
    /// still-pending history.
    fn full_json(&mut self) -> Result<Vec<HistoryRecord>> {
        let mut records: Vec<HistoryRecord> = self
            .search(&SearchPattern::new(), true)?
            .iter()
            .map(|entry| HistoryRecord {
                operation: Operation::Insert,
                entry: entry.snapshot(),
            })
            .collect();
        records.extend(self.history_json());
        Ok(records)
    }

    /// Drop pending history. Call only after a consumer has acknowledged
    /// receiving it.
    fn reset_history(&mut self) {
        self.state_mut().reset_history();
    }

    /// First match for `pattern`, if any.
    fn find_entry(&mut self, pattern: &SearchPattern, refresh: bool) -> Result<Option<Entry>> {
        Ok(self.search(pattern, refresh)?.into_iter().next())
    }
}

/// Sort entries newest-first by creation time. Timestamps are fixed-width,
/// so string ordering is chronological.
pub(crate) fn sort_newest_first(entries: &mut [Entry]) {
    entries.sort_by(|a, b| b.creation_time.cmp(&a.creation_time));
}

/// Insert timestamp helper shared by backends.
pub(crate) fn effective_creation_time(entry: &Entry, preserve: bool) -> String {
    if preserve {
        entry.creation_time.clone()
    } else {
        current_time()
    }
}
