//! # keyfleet
//!
//! Fleet-wide SSH credential management with encrypted pluggable backends.
//!
//! Every managed credential is an [`Entry`]: one SSH key pair owned by a
//! (host, user) pair, sealed under an envelope key so that no backend ever
//! stores plaintext key material. Backends implement the [`KeyStore`]
//! contract over different substrates (an aggregated-secret vault, a flat
//! directory of JSON files), and every mutation they perform is appended to
//! a history log that the sync layer replicates to a peer site. Rotation
//! builds on top: new keys are pushed to the fleet hosts before old ones
//! are withdrawn.
//!
//! ## Public API
//!
//! The entry points callers are expected to use:
//! - [`KeyStore`] with the [`VaultBackend`] and [`FileBackend`] backends,
//!   plus the separate [`KvBackend`] for free-form secrets
//! - [`EnvelopeKey`] / [`KeyRing`] for sealing and cross-site decryption
//! - [`SyncCoordinator`] and [`apply_history`] for replication
//! - [`RotationCoordinator`] for fleet key rotation
//! - [`KmsConfig`] to wire the above together

pub mod audit;
pub mod config;
pub mod entry;
pub mod envelope;
pub mod error;
pub mod file_store;
pub mod formats;
pub mod kv_store;
pub mod rotate;
pub mod store;
pub mod sync;
pub mod vault;

pub use config::{FileConfig, KmsConfig, KvConfig, VaultConfig};
pub use entry::{Algorithm, Entry, EntrySnapshot, HostType, Operation};
pub use envelope::{EnvelopeKey, KeyRing};
pub use error::{KmsError, Result};
pub use file_store::FileBackend;
pub use formats::KeyFormat;
pub use kv_store::KvBackend;
pub use rotate::{HostExecutor, RotationCoordinator, RotationReport};
pub use store::{HistoryRecord, KeyStore, SearchPattern, StoreState};
pub use sync::{apply_history, apply_kv_history, migrate, RemotePeer, SyncCoordinator, SyncOutcome};
pub use vault::{InMemoryVault, VaultBackend, VaultClient};
