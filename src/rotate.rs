//! Safe key rotation for a host's users.
//!
//! Rotation is ordered so a lost connection never locks anyone out: every
//! new public key is appended to the remote authorized_keys files first,
//! and only then are old keys removed from the files and the store. A
//! failure during the append phase leaves all old keys working; a failure
//! during cleanup leaves extra keys behind, which the next rotation
//! removes.

use tracing::info;

use crate::entry::{Algorithm, Entry};
use crate::error::Result;
use crate::store::{KeyStore, SearchPattern};

/// Executes shell commands on a fleet host. Non-zero exits surface as
/// [`crate::error::KmsError::RemoteCommand`].
pub trait HostExecutor: Send {
    fn exec(&self, host: &str, command: &str) -> Result<()>;
}

/// Which users a rotation touched.
#[derive(Debug, Default)]
pub struct RotationReport {
    pub rotated_users: Vec<String>,
}

/// Escape a literal authorized_keys line for use inside a `sed s@…@@g`
/// pattern. Key lines carry a bracketed hash comment, which sed would
/// otherwise read as a character class.
fn sed_literal(line: &str) -> String {
    let mut escaped = String::with_capacity(line.len());
    for ch in line.chars() {
        if matches!(ch, '\\' | '@' | '[' | ']' | '.' | '*' | '^' | '$' | '/') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// The authorized_keys file a user's keys live in.
fn authorized_keys_path(user: &str) -> String {
    if user == "root" {
        "/root/.ssh/authorized_keys".to_string()
    } else {
        format!("/home/{user}/.ssh/authorized_keys")
    }
}

/// Drives key rotation against a store and a remote host.
pub struct RotationCoordinator {
    executor: Box<dyn HostExecutor>,
}

impl RotationCoordinator {
    pub fn new(executor: Box<dyn HostExecutor>) -> Self {
        Self { executor }
    }

    /// Rotate the keys of `fqdn` to `algorithm` (store default when
    /// `None`). Without `force` only users whose current key algorithm
    /// differs are rotated; with it, every user of the host.
    pub fn rotate(
        &self,
        store: &mut dyn KeyStore,
        fqdn: &str,
        algorithm: Option<Algorithm>,
        force: bool,
    ) -> Result<RotationReport> {
        let mut entries = store.search(&SearchPattern::new().with_fqdn(fqdn), true)?;
        if entries.is_empty() {
            info!(fqdn, "no entries to rotate");
            return Ok(RotationReport::default());
        }

        let algorithm = algorithm.unwrap_or_else(|| store.default_algorithm());

        let mut users: Vec<String> = Vec::new();
        for entry in &entries {
            if (force || entry.algorithm != algorithm) && !users.contains(&entry.user) {
                users.push(entry.user.clone());
            }
        }
        if users.is_empty() {
            info!(fqdn, %algorithm, "all keys already use the requested algorithm");
            return Ok(RotationReport::default());
        }

        let mut new_entries: Vec<Entry> = Vec::new();
        for user in &users {
            // New key keeps the host classification of the key it replaces.
            let host_type = entries
                .iter()
                .find(|entry| &entry.user == user)
                .map(|entry| entry.host_type)
                .unwrap_or(entries[0].host_type);
            let pem = algorithm.generate_private_key()?;
            new_entries.push(store.build_entry(fqdn, user, &pem, host_type, Some(algorithm))?);
        }

        // Phase one: append every new key before any old key is touched.
        for entry in &mut new_entries {
            let line = store.authorized_key(entry)?;
            let path = authorized_keys_path(&entry.user);
            self.executor
                .exec(fqdn, &format!("/bin/echo \"{line}\" >> {path}"))?;
        }

        // Phase two: strip old keys from the host and the store.
        for entry in &mut entries {
            if !users.contains(&entry.user) {
                continue;
            }
            let line = store.authorized_key(entry)?;
            let path = authorized_keys_path(&entry.user);
            self.executor
                .exec(
                    fqdn,
                    &format!("/bin/sed -i 's@{}@@g' {}", sed_literal(line.trim()), path),
                )?;
            store.delete(entry)?;
        }

        for entry in new_entries {
            store.insert(entry, false)?;
        }

        info!(fqdn, %algorithm, users = users.len(), "rotation complete");
        Ok(RotationReport {
            rotated_users: users,
        })
    }
}
