//! Filesystem key store, one JSON file per entry.
//!
//! Entries live under a flat directory as `<user>#<fqdn>.json` files
//! holding the entry snapshot (envelope only, never plaintext). Search
//! filters run against filenames, so a scan only deserialises the files
//! that can match. Backups are timestamped copies of the whole directory
//! under a sibling path.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::FileConfig;
use crate::entry::{Algorithm, Entry, EntrySnapshot, HostType};
use crate::envelope::EnvelopeKey;
use crate::error::{KmsError, Result};
use crate::store::{
    effective_creation_time, sort_newest_first, KeyStore, SearchPattern, StoreState,
};

/// Entry filenames: `<user>#<fqdn>.json`.
const FILE_PATTERN: &str = r"^([\w\-]+)#([\w\-\.]+)\.json$";

/// Timestamp used to name backup directories. Fixed-width, so the latest
/// backup is the lexicographic maximum.
const BACKUP_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// [`KeyStore`] persisting entries as JSON files in a directory.
pub struct FileBackend {
    key_path: PathBuf,
    backup_path: PathBuf,
    key: EnvelopeKey,
    state: StoreState,
}

impl FileBackend {
    /// Open (creating directories as needed) the store described by
    /// `config`.
    pub fn new(config: &FileConfig, key: EnvelopeKey, state: StoreState) -> Result<Self> {
        fs::create_dir_all(&config.key_path)?;
        fs::create_dir_all(&config.backup_path)?;
        Ok(Self {
            key_path: config.key_path.clone(),
            backup_path: config.backup_path.clone(),
            key,
            state,
        })
    }

    fn entry_file(&self, user: &str, fqdn: &str) -> PathBuf {
        self.key_path.join(format!("{user}#{fqdn}.json"))
    }

    fn read_entry(path: &Path) -> Option<Entry> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(file = %path.display(), %err, "unable to read entry file");
                return None;
            }
        };
        match serde_json::from_str::<EntrySnapshot>(&raw) {
            Ok(snapshot) => Some(Entry::from_snapshot(&snapshot)),
            Err(err) => {
                warn!(file = %path.display(), %err, "entry file is not valid json");
                None
            }
        }
    }

    /// Scan the key directory, filtering on filenames before touching file
    /// contents.
    fn scan(&self, pattern: &SearchPattern) -> Result<Vec<Entry>> {
        let file_regex = Regex::new(FILE_PATTERN)
            .map_err(|err| KmsError::Configuration(format!("entry file pattern: {err}")))?;
        let fqdn_regex = match (&pattern.fqdn, pattern.strict) {
            (Some(f), false) => Some(Regex::new(f).map_err(|err| {
                KmsError::Configuration(format!("invalid fqdn pattern {f:?}: {err}"))
            })?),
            _ => None,
        };

        let mut entries = Vec::new();
        for item in fs::read_dir(&self.key_path)? {
            let item = item?;
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(captures) = file_regex.captures(name) else {
                continue;
            };
            let user = &captures[1];
            let fqdn = &captures[2];

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
            if let Some(ref wanted) = pattern.user {
                if wanted != user {
                    continue;
                }
            }

            if let Some(entry) = Self::read_entry(&item.path()) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn latest_backup_dir(&self) -> Result<Option<PathBuf>> {
        let mut latest: Option<(String, PathBuf)> = None;
        for item in fs::read_dir(&self.backup_path)? {
            let item = item?;
            if !item.file_type()?.is_dir() {
                continue;
            }
            let name = item.file_name().to_string_lossy().into_owned();
            if latest.as_ref().map(|(n, _)| name > *n).unwrap_or(true) {
                latest = Some((name, item.path()));
            }
        }
        Ok(latest.map(|(_, path)| path))
    }
}

fn shortname(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}

impl KeyStore for FileBackend {
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

        let mut entries = self.scan(&pattern)?;
        sort_newest_first(&mut entries);
        for entry in &entries {
            self.state.cache_mut().upsert(entry.clone());
        }
        Ok(entries)
    }

    fn insert(&mut self, mut entry: Entry, preserve_creation_time: bool) -> Result<bool> {
        entry.fqdn = self.state.normalize_host(&entry.fqdn);
        entry.creation_time = effective_creation_time(&entry, preserve_creation_time);

        let path = self.entry_file(&entry.user, &entry.fqdn);
        fs::write(&path, serde_json::to_string_pretty(&entry.snapshot())?)?;

        info!(file = %path.display(), "entry stored");
        self.state.record_insert(&entry);
        Ok(true)
    }

    fn delete(&mut self, entry: &Entry) -> Result<bool> {
        let fqdn = self.state.normalize_host(&entry.fqdn);
        let path = self.entry_file(&entry.user, &fqdn);
        if !path.exists() {
            warn!(file = %path.display(), "nothing to delete, entry file absent");
            return Ok(false);
        }
        fs::remove_file(&path)?;

        info!(file = %path.display(), "entry removed");
        self.state.record_delete(entry);
        Ok(true)
    }

    /// Copy the key directory into a timestamped backup directory. An empty
    /// store is not worth a backup.
    fn backup(&mut self) -> Result<bool> {
        self.state.cache_mut().clear();
        let entries = self.search(&SearchPattern::new(), true)?;
        if entries.is_empty() {
            warn!("not able to backup keys, no keys found");
            return Ok(false);
        }

        let stamp = chrono::Local::now().format(BACKUP_TIME_FORMAT).to_string();
        let target = self.backup_path.join(&stamp);
        fs::create_dir_all(&target)?;
        for item in fs::read_dir(&self.key_path)? {
            let item = item?;
            if item.file_type()?.is_file() {
                fs::copy(item.path(), target.join(item.file_name()))?;
            }
        }

        info!(backup = %target.display(), "backup created");
        Ok(true)
    }

    /// Replay the latest backup directory, keeping whichever of the stored
    /// and backed-up entry is newer.
    fn restore_backup(&mut self) -> Result<bool> {
        self.state.cache_mut().clear();

        let Some(backup_dir) = self.latest_backup_dir()? else {
            warn!("not able to restore backup, no backups found");
            return Ok(false);
        };

        for item in fs::read_dir(&backup_dir)? {
            let item = item?;
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(backed_up) = Self::read_entry(&path) else {
                continue;
            };

            let pattern = SearchPattern::new()
                .with_fqdn(backed_up.fqdn.clone())
                .with_user(backed_up.user.clone());
            let current = self.find_entry(&pattern, true)?;

            let keep_backup = match current {
                None => true,
                Some(ref existing) => existing.creation_time < backed_up.creation_time,
            };
            if keep_backup {
                self.insert(backed_up, true)?;
            }
        }

        info!("backup restored");
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend(dir: &TempDir) -> FileBackend {
        let config = FileConfig {
            key_path: dir.path().join("keys"),
            backup_path: dir.path().join("backup"),
        };
        let key = EnvelopeKey::generate("ocid1.key.test").unwrap();
        FileBackend::new(&config, key, StoreState::new(Algorithm::Rsa)).unwrap()
    }

    fn insert_host(backend: &mut FileBackend, fqdn: &str, user: &str) -> Entry {
        let pem = Algorithm::Rsa.generate_private_key().unwrap();
        let entry = backend
            .build_entry(fqdn, user, &pem, HostType::DomU, None)
            .unwrap();
        assert!(backend.insert(entry.clone(), false).unwrap());
        entry
    }

    #[test]
    fn test_insert_writes_snapshot_file() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend(&dir);
        insert_host(&mut backend, "db1.example.com", "oracle");

        let path = dir.path().join("keys/oracle#db1.example.com.json");
        let raw = fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["FQDN"], "db1.example.com");
        // Only the envelope is persisted.
        assert!(!raw.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_search_filters_on_filenames() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend(&dir);
        insert_host(&mut backend, "db1.example.com", "oracle");
        insert_host(&mut backend, "db2.example.com", "grid");
        // Noise files are ignored by the filename filter.
        fs::write(dir.path().join("keys/readme.txt"), "noise").unwrap();

        let all = backend.search(&SearchPattern::new(), true).unwrap();
        assert_eq!(all.len(), 2);

        let by_user = backend
            .search(&SearchPattern::new().with_user("grid"), true)
            .unwrap();
        assert_eq!(by_user.len(), 1);
        assert_eq!(by_user[0].fqdn, "db2.example.com");

        let strict = backend
            .search(&SearchPattern::new().with_fqdn("db1.other.net").strict(), true)
            .unwrap();
        assert_eq!(strict.len(), 1);
    }

    #[test]
    fn test_delete_absent_entry_returns_false() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend(&dir);
        let entry = insert_host(&mut backend, "db1.example.com", "oracle");

        assert!(backend.delete(&entry).unwrap());
        assert!(!backend.delete(&entry).unwrap());
        // The second delete recorded nothing.
        assert_eq!(backend.state().history().len(), 2);
    }

    #[test]
    fn test_backup_refuses_empty_store() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend(&dir);
        assert!(!backend.backup().unwrap());
        assert!(!backend.restore_backup().unwrap());
    }

    #[test]
    fn test_backup_and_restore_keep_newest() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend(&dir);
        let old = insert_host(&mut backend, "db1.example.com", "oracle");
        let other = insert_host(&mut backend, "db2.example.com", "oracle");
        assert!(backend.backup().unwrap());

        // Rotate after the backup; restore must not clobber the newer key.
        let pem = Algorithm::Rsa.generate_private_key().unwrap();
        let mut newer = backend
            .build_entry("db1.example.com", "oracle", &pem, HostType::DomU, None)
            .unwrap();
        newer.creation_time = "2999-01-01 00:00:00+0000".to_string();
        assert!(backend.insert(newer.clone(), true).unwrap());

        // And lose an entry that only the backup still has.
        assert!(backend.delete(&other).unwrap());

        assert!(backend.restore_backup().unwrap());

        let kept = backend
            .find_entry(
                &SearchPattern::new()
                    .with_fqdn("db1.example.com".to_string())
                    .with_user("oracle"),
                true,
            )
            .unwrap()
            .unwrap();
        assert_eq!(kept.hash, newer.hash);
        assert_ne!(kept.hash, old.hash);

        let restored = backend
            .find_entry(
                &SearchPattern::new()
                    .with_fqdn("db2.example.com".to_string())
                    .with_user("oracle"),
                true,
            )
            .unwrap()
            .unwrap();
        assert_eq!(restored.hash, other.hash);
    }
}
