//! Per-attempt credential queues.

use std::collections::VecDeque;

use russh::keys::PublicKey;
use tracing::debug;

use crate::ssh::config::expand_home;

/// An identity file read from disk.
#[derive(Debug, Clone)]
pub struct IdentityFile {
    /// Path as configured
    pub path: String,
    pub contents: String,
}

/// Remaining public-key candidates for one attempt on one hop.
///
/// Files are read once when the state is built; each candidate is popped
/// exactly once.
#[derive(Debug, Default)]
pub struct CredentialState {
    agent_signers: VecDeque<PublicKey>,
    identity_files: VecDeque<IdentityFile>,
    configured_files: usize,
}

impl CredentialState {
    /// Read every identity file and queue the agent's keys.
    ///
    /// Unreadable files are dropped here so the failure is logged once.
    pub fn load(identity_files: &[String], agent_signers: Vec<PublicKey>) -> Self {
        let mut files = VecDeque::with_capacity(identity_files.len());
        for path in identity_files {
            let Some(expanded) = expand_home(path) else {
                debug!("Skipping identity file {}: cannot expand path", path);
                continue;
            };
            match std::fs::read_to_string(&expanded) {
                Ok(contents) => files.push_back(IdentityFile {
                    path: path.clone(),
                    contents,
                }),
                Err(e) => debug!("Skipping identity file {}: {}", path, e),
            }
        }

        Self {
            agent_signers: agent_signers.into(),
            identity_files: files,
            configured_files: identity_files.len(),
        }
    }

    /// Configured identity files plus agent keys.
    pub fn candidate_count(&self) -> usize {
        self.configured_files + self.agent_signers.len()
    }

    pub fn next_agent_signer(&mut self) -> Option<PublicKey> {
        self.agent_signers.pop_front()
    }

    pub fn next_identity_file(&mut self) -> Option<IdentityFile> {
        self.identity_files.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.agent_signers.is_empty() && self.identity_files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn agent_key(blob: &str, comment: &str) -> PublicKey {
        PublicKey::from_openssh(&format!("ssh-ed25519 {} {}", blob, comment)).unwrap()
    }

    mod load {
        use super::*;

        #[test]
        fn test_unreadable_files_skipped_but_counted() {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            write!(file, "key material").unwrap();
            let readable = file.path().to_string_lossy().to_string();
            let configured = vec!["/nonexistent/id_rsa".to_string(), readable.clone()];

            let mut state = CredentialState::load(&configured, Vec::new());
            assert_eq!(state.candidate_count(), 2);
            let first = state.next_identity_file().unwrap();
            assert_eq!(first.path, readable);
            assert_eq!(first.contents, "key material");
            assert!(state.next_identity_file().is_none());
            assert!(state.is_empty());
        }

        #[test]
        fn test_duplicates_kept() {
            let file = tempfile::NamedTempFile::new().unwrap();
            let path = file.path().to_string_lossy().to_string();
            let mut state = CredentialState::load(&[path.clone(), path.clone()], Vec::new());
            assert_eq!(state.next_identity_file().unwrap().path, path);
            assert_eq!(state.next_identity_file().unwrap().path, path);
            assert!(state.next_identity_file().is_none());
        }

        #[test]
        fn test_agent_signers_in_agent_order() {
            let first = agent_key("AAAAC3NzaC1lZDI1NTE5AAAAIGtYenWpv32Fqyku7mL6H4vu/KzrYY3d12c2n72SSR4i", "one");
            let second = agent_key("AAAAC3NzaC1lZDI1NTE5AAAAIDaB+h/o69bqvBEaeHXBKPu7Fr1bmpBheusHI745/aAQ", "two");
            let mut state = CredentialState::load(&[], vec![first, second]);
            assert_eq!(state.candidate_count(), 2);
            assert_eq!(state.next_agent_signer().unwrap().comment(), "one");
            assert_eq!(state.next_agent_signer().unwrap().comment(), "two");
            assert!(state.next_agent_signer().is_none());
        }
    }
}
