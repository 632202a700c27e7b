//! Audit trail of store mutations.
//!
//! Records every insert and delete. The trail is append-only and, unlike
//! the history log, is never drained by replication — it is the permanent
//! "who changed what" record. Supports pluggable sinks for forwarding
//! records to files or other persistent stores.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::Operation;

/// A sink that receives audit records. Implement this to forward records
/// to a file, a secondary vault, or any other persistent store.
pub trait AuditSink: Send {
    /// Append a record. Called for every store mutation.
    fn append(&mut self, record: AuditRecord);
}

/// A permanent record of one store mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the mutation happened.
    pub timestamp: DateTime<Utc>,
    /// The node that performed the mutation.
    pub host: String,
    /// The credential touched, as `user@fqdn`.
    pub key: String,
    /// Insert or delete.
    pub operation: Operation,
    /// Content fingerprint of the entry involved.
    pub id: String,
    /// Site label of the entry involved.
    pub label: String,
}

/// An append-only trail of all mutations.
/// Can forward records to additional sinks via `add_forward_sink`.
#[derive(Default, Serialize, Deserialize)]
pub struct AuditTrail {
    records: Vec<AuditRecord>,
    #[serde(skip)]
    forward_sinks: Option<Vec<Box<dyn AuditSink>>>,
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("records", &self.records)
            .field(
                "forward_sinks",
                &self.forward_sinks.as_ref().map(|s| s.len()),
            )
            .finish()
    }
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to receive a copy of every record. Useful for persisting
    /// to a file without replacing the in-memory trail.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.get_or_insert_with(Vec::new).push(sink);
    }

    /// Append a new record to the trail and forward to any attached sinks.
    pub fn append(&mut self, record: AuditRecord) {
        if let Some(ref mut sinks) = self.forward_sinks {
            for sink in sinks.iter_mut() {
                sink.append(record.clone());
            }
        }
        self.records.push(record);
    }

    /// Return the number of records in the trail.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the trail is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over the records.
    pub fn iter(&self) -> std::slice::Iter<'_, AuditRecord> {
        self.records.iter()
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: tab-separated changes file
// ---------------------------------------------------------------------------

/// Column header written at the top of a fresh changes file.
const CHANGES_HEADER: &str = "Timestamp\tHost\tKey\tOperation\tID\tLabel";

/// Writes audit records as tab-separated lines to a `changes.txt`-style
/// file. Creates the file with a column header if it doesn't exist;
/// appends if it does.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    /// Open or create a file for append-only audit logging.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let fresh = !path.as_ref().exists();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if fresh {
            writeln!(file, "{CHANGES_HEADER}")?;
            writeln!(file, "{}", "-".repeat(50))?;
            writeln!(file)?;
        }
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        let line = format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S%z"),
            record.host,
            record.key,
            record.operation,
            record.id,
            record.label,
        );
        let _ = writeln!(self.file, "{line}");
        let _ = self.file.flush();
    }
}
