//! History replication between sites and cross-backend migration.
//!
//! Replication is push-based and at-least-once: the sender serialises its
//! pending history, transmits it, and clears the history only after the
//! peer acknowledges the payload. A crash between a successful apply on
//! the peer and the acknowledgement therefore replays the batch; every
//! replayed operation is idempotent on the receiving side (insert is an
//! upsert, delete of an absent entry is a no-op).
//!
//! On ingest, entries sealed by the sending site are opened with that
//! site's key from the local [`KeyRing`] and re-sealed under the receiving
//! store's own envelope key, so stored envelopes never reference a foreign
//! key for longer than the replay itself.

use serde_json::json;
use tracing::{debug, info, warn};

use crate::entry::{Algorithm, Entry, Operation};
use crate::envelope::KeyRing;
use crate::error::Result;
use crate::kv_store::{KvBackend, KvHistoryRecord};
use crate::store::{HistoryRecord, KeyStore, SearchPattern};

// ---------------------------------------------------------------------------
// Sending side
// ---------------------------------------------------------------------------

/// Transport to the peer site. The payload is the JSON body of one sync
/// request; the return value is the peer's acknowledgement.
pub trait RemotePeer: Send {
    fn send(&self, payload: serde_json::Value) -> Result<bool>;
}

/// What a send attempt amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No peer configured; nothing was sent.
    NoPeer,
    /// Nothing pending; nothing was sent.
    UpToDate,
    /// Payload sent and acknowledged; history cleared.
    Completed,
    /// Peer did not acknowledge; history kept for the next attempt.
    Rejected,
}

/// Drives history pushes towards an optional peer site.
pub struct SyncCoordinator {
    peer: Option<Box<dyn RemotePeer>>,
}

impl SyncCoordinator {
    pub fn new(peer: Option<Box<dyn RemotePeer>>) -> Self {
        Self { peer }
    }

    fn push(
        &self,
        records: Vec<serde_json::Value>,
        reset: impl FnOnce(),
    ) -> Result<SyncOutcome> {
        let Some(ref peer) = self.peer else {
            info!("no remote host to sync up");
            return Ok(SyncOutcome::NoPeer);
        };
        if records.is_empty() {
            info!("keys are already updated");
            return Ok(SyncOutcome::UpToDate);
        }

        let count = records.len();
        let acknowledged = peer.send(json!({ "history": records }))?;
        if !acknowledged {
            warn!(count, "peer did not acknowledge sync payload");
            return Ok(SyncOutcome::Rejected);
        }

        // History is cleared only after the ack; an earlier crash replays
        // the batch.
        reset();
        info!(count, "keys sync done");
        Ok(SyncOutcome::Completed)
    }

    /// Send the pending history of an entry store.
    pub fn send_incremental(&self, store: &mut dyn KeyStore) -> Result<SyncOutcome> {
        let records = to_values(&store.history_json())?;
        self.push(records, || store.reset_history())
    }

    /// Send the full entry set plus pending history, for bootstrapping a
    /// peer or repairing drift.
    pub fn send_full(&self, store: &mut dyn KeyStore) -> Result<SyncOutcome> {
        let records = to_values(&store.full_json()?)?;
        self.push(records, || store.reset_history())
    }

    /// Send the full key-value database plus pending history.
    pub fn send_kv_full(&self, kv: &mut KvBackend) -> Result<SyncOutcome> {
        let records = to_values(&kv.full_json()?)?;
        self.push(records, || kv.reset_history())
    }
}

fn to_values<T: serde::Serialize>(records: &[T]) -> Result<Vec<serde_json::Value>> {
    records
        .iter()
        .map(|record| Ok(serde_json::to_value(record)?))
        .collect()
}

// ---------------------------------------------------------------------------
// Receiving side
// ---------------------------------------------------------------------------

/// Replay a batch of entry history records into a store.
///
/// Inserted entries are opened with the originating site's key from
/// `ring` and rebuilt under the store's own envelope key; their creation
/// time, label, origin and metadata are carried over from the snapshot.
pub fn apply_history(
    store: &mut dyn KeyStore,
    ring: &KeyRing,
    records: &[HistoryRecord],
) -> Result<()> {
    for record in records {
        let snapshot = &record.entry;
        debug!(operation = %record.operation, user = %snapshot.user,
               fqdn = %snapshot.fqdn, "replaying history record");

        match record.operation {
            Operation::Delete => {
                let entry = Entry::from_snapshot(snapshot);
                store.delete(&entry)?;
            }
            Operation::Insert => {
                let plaintext = ring.open_utf8(&snapshot.key_id, &snapshot.enc_data)?;
                let algorithm = Algorithm::from_version_tag(Some(&snapshot.version));
                let mut entry = store.build_entry(
                    &snapshot.fqdn,
                    &snapshot.user,
                    &plaintext,
                    snapshot.host_type,
                    Some(algorithm),
                )?;
                entry.creation_time = snapshot.creation_time.clone();
                entry.label = snapshot.label.clone();
                entry.origin_host = snapshot.origin_host.clone();
                entry.key_value_info = snapshot.key_value_info.clone();
                store.insert(entry, true)?;
            }
        }
    }
    Ok(())
}

/// Replay a batch of key-value history records. Values are decrypted with
/// the originating site's key and re-sealed locally by the insert.
pub fn apply_kv_history(
    kv: &mut KvBackend,
    ring: &KeyRing,
    records: &[KvHistoryRecord],
) -> Result<()> {
    for record in records {
        let snapshot = &record.snapshot;
        debug!(operation = %record.operation, key = %snapshot.key,
               "replaying kv history record");

        match record.operation {
            Operation::Delete => {
                kv.delete_by_key(&snapshot.key)?;
            }
            Operation::Insert => {
                let plaintext =
                    ring.open_utf8(&snapshot.record.key_id, &snapshot.record.enc_data)?;
                kv.insert(&snapshot.key, &plaintext)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Cross-backend migration
// ---------------------------------------------------------------------------

/// Copy every entry of `source` into `target`, re-sealing each private key
/// under the target's envelope key. Returns the number of entries moved.
pub fn migrate(source: &mut dyn KeyStore, target: &mut dyn KeyStore) -> Result<usize> {
    info!("cross store migration in progress, this could take a while");
    let entries = source.search(&SearchPattern::new(), true)?;

    let mut moved = 0;
    for entry in &entries {
        let plaintext = source.reveal(entry)?;
        let rebuilt = target.build_entry(
            &entry.fqdn,
            &entry.user,
            &plaintext,
            entry.host_type,
            Some(entry.algorithm),
        )?;
        if target.insert(rebuilt, false)? {
            moved += 1;
        }
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::config::VaultConfig;
    use crate::entry::HostType;
    use crate::envelope::EnvelopeKey;
    use crate::store::StoreState;
    use crate::vault::{InMemoryVault, VaultBackend};

    struct ScriptedPeer {
        ack: bool,
        payloads: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    impl RemotePeer for ScriptedPeer {
        fn send(&self, payload: serde_json::Value) -> Result<bool> {
            self.payloads.lock().unwrap().push(payload);
            Ok(self.ack)
        }
    }

    fn backend(key_id: &str) -> VaultBackend {
        backend_with_key(EnvelopeKey::generate(key_id).unwrap())
    }

    fn backend_with_key(key: EnvelopeKey) -> VaultBackend {
        let config = VaultConfig {
            vault_id: "ocid1.vault.test".to_string(),
            key_id: "ocid1.key.test".to_string(),
            compartment_id: "ocid1.compartment.test".to_string(),
            backup_vault_id: None,
            backup_key_id: None,
        };
        VaultBackend::new(
            Box::new(InMemoryVault::new()),
            config,
            key,
            StoreState::new(Algorithm::Rsa),
        )
        .unwrap()
    }

    // The envelope key type cannot be cloned, so tests that need the
    // sender's key both in a store and in a ring rebuild it from the same
    // bytes.
    fn duplicated_key(id: &str) -> (EnvelopeKey, EnvelopeKey) {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        (
            EnvelopeKey::from_bytes(id, bytes),
            EnvelopeKey::from_bytes(id, bytes),
        )
    }

    fn insert_host(store: &mut VaultBackend, fqdn: &str, user: &str) -> Entry {
        let pem = Algorithm::Rsa.generate_private_key().unwrap();
        let entry = store
            .build_entry(fqdn, user, &pem, HostType::DomU, None)
            .unwrap();
        store.insert(entry.clone(), false).unwrap();
        entry
    }

    #[test]
    fn test_send_without_peer_is_a_noop() {
        let mut store = backend("site-a");
        insert_host(&mut store, "db1.example.com", "oracle");

        let coordinator = SyncCoordinator::new(None);
        assert_eq!(
            coordinator.send_incremental(&mut store).unwrap(),
            SyncOutcome::NoPeer
        );
        // History stays pending for a later configured peer.
        assert_eq!(store.history_json().len(), 1);
    }

    #[test]
    fn test_ack_clears_history_nack_keeps_it() {
        let mut store = backend("site-a");
        insert_host(&mut store, "db1.example.com", "oracle");

        let payloads = Arc::new(Mutex::new(Vec::new()));
        let nack = SyncCoordinator::new(Some(Box::new(ScriptedPeer {
            ack: false,
            payloads: payloads.clone(),
        })));
        assert_eq!(
            nack.send_incremental(&mut store).unwrap(),
            SyncOutcome::Rejected
        );
        assert_eq!(store.history_json().len(), 1);

        let ack = SyncCoordinator::new(Some(Box::new(ScriptedPeer {
            ack: true,
            payloads: payloads.clone(),
        })));
        assert_eq!(
            ack.send_incremental(&mut store).unwrap(),
            SyncOutcome::Completed
        );
        assert!(store.history_json().is_empty());
        assert_eq!(
            ack.send_incremental(&mut store).unwrap(),
            SyncOutcome::UpToDate
        );

        let sent = payloads.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["history"][0]["operation"], "INSERT");
    }

    #[test]
    fn test_apply_history_reencrypts_under_local_key() {
        let (store_key, ring_key) = duplicated_key("site-a");
        let mut sender = backend_with_key(store_key);
        let original = insert_host(&mut sender, "db1.example.com", "oracle");
        let records = sender.history_json();

        let mut ring = KeyRing::new();
        ring.register(ring_key);

        let mut receiver = backend("site-b");
        apply_history(&mut receiver, &ring, &records).unwrap();

        let got = receiver
            .search(&SearchPattern::new().with_fqdn("db1.example.com"), true)
            .unwrap();
        assert_eq!(got.len(), 1);
        // Re-sealed locally, same key material and the sender's timestamp.
        assert_eq!(got[0].key_id, "site-b");
        assert_eq!(got[0].hash, original.hash);
        assert_eq!(got[0].creation_time, records[0].entry.creation_time);
    }

    #[test]
    fn test_apply_history_twice_is_idempotent() {
        let (store_key, ring_key) = duplicated_key("site-a");
        let mut sender = backend_with_key(store_key);
        let entry = insert_host(&mut sender, "db1.example.com", "oracle");
        sender.delete(&entry).unwrap();
        insert_host(&mut sender, "db2.example.com", "oracle");
        let records = sender.history_json();

        let mut ring = KeyRing::new();
        ring.register(ring_key);

        let mut receiver = backend("site-b");
        apply_history(&mut receiver, &ring, &records).unwrap();
        apply_history(&mut receiver, &ring, &records).unwrap();

        let got = receiver.search(&SearchPattern::new(), true).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].fqdn, "db2.example.com");
    }

    #[test]
    fn test_migrate_moves_and_reseals() {
        let mut source = backend("site-a");
        insert_host(&mut source, "db1.example.com", "oracle");
        insert_host(&mut source, "db2.example.com", "grid");

        let mut target = backend("site-b");
        assert_eq!(migrate(&mut source, &mut target).unwrap(), 2);

        let got = target.search(&SearchPattern::new(), true).unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|entry| entry.key_id == "site-b"));
    }
}
