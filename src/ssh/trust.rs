//! Host-Trust Store: verifies presented host keys against known_hosts.
//!
//! A [`HostKeyVerifier`] is built per hop from the resolved parameters. It
//! keeps the known_hosts files that loaded ("readable") apart from the ones
//! that did not ("unreadable"), so an unknown host can first be recorded in a
//! file the user already has and only then in a file that has to be created.
//!
//! Changed and revoked keys always fail; there is no interactive override.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::config::expand_home;
use super::error::ErrorKind;
use super::known_hosts::{
    HostKey, HostKeyStatus, KnownHostsDb, KnownKey, append_line, format_line, open_for_append,
};
use super::prompt::{PromptError, Prompter, UserInputRequest};
use super::resolver::ConnectionParameters;

/// Title of the confirmation shown for a file that already exists.
pub const KEY_MISSING_TITLE: &str = "Known Hosts Key Missing";

/// Title of the confirmation shown for a file that will be created.
pub const FILE_MISSING_TITLE: &str = "Known Hosts File Missing";

/// Verdict for a presented key, before any prompting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    VerifiedMatch,
    UnknownHost,
    ChangedHost { known: Vec<KnownKey> },
    /// No known_hosts file could be loaded at all
    StoreUnavailable,
}

/// True when running as the local superuser.
pub fn is_privileged_user() -> bool {
    whoami::username() == "root"
}

enum WriteOutcome {
    Written,
    Rejected,
    Unwritable(std::io::Error),
}

/// Host-key verification for one hop.
#[derive(Debug)]
pub struct HostKeyVerifier {
    readable: Vec<PathBuf>,
    unreadable: Vec<PathBuf>,
    db: Option<KnownHostsDb>,
    prompter: Prompter,
}

impl HostKeyVerifier {
    /// Select and load the known_hosts files for `params`.
    ///
    /// The superuser only consults global files. Files that fail to load are
    /// dropped one at a time and remembered as unreadable.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::TrustStoreUnavailable`] when no known_hosts file is
    /// configured at all.
    pub fn build(
        params: &ConnectionParameters,
        privileged: bool,
        prompter: Prompter,
    ) -> Result<Self, ErrorKind> {
        let configured: Vec<&String> = if privileged {
            params.global_known_hosts_files.iter().collect()
        } else {
            params
                .user_known_hosts_files
                .iter()
                .chain(params.global_known_hosts_files.iter())
                .collect()
        };

        let mut readable: Vec<PathBuf> = configured
            .into_iter()
            .filter_map(|f| {
                let expanded = expand_home(f);
                if expanded.is_none() {
                    warn!("Skipping known_hosts file {}: cannot expand home directory", f);
                }
                expanded
            })
            .collect();
        if readable.is_empty() {
            return Err(ErrorKind::TrustStoreUnavailable(
                "no known_hosts files are configured".to_string(),
            ));
        }

        let mut unreadable = Vec::new();
        let db = loop {
            if readable.is_empty() {
                break None;
            }
            match KnownHostsDb::open(&readable) {
                Ok(db) => break Some(db),
                Err(err) => {
                    debug!("Dropping known_hosts file: {}", err);
                    let failed = err.path().to_path_buf();
                    readable.retain(|p| *p != failed);
                    unreadable.push(failed);
                }
            }
        };

        Ok(Self {
            readable,
            unreadable,
            db,
            prompter,
        })
    }

    pub fn readable_files(&self) -> &[PathBuf] {
        &self.readable
    }

    pub fn unreadable_files(&self) -> &[PathBuf] {
        &self.unreadable
    }

    /// Key types already trusted for `host:port`; the handshake should prefer them.
    pub fn host_key_algorithms(&self, host: &str, port: u16) -> Vec<String> {
        self.db
            .as_ref()
            .map(|db| db.algorithms_for(host, port))
            .unwrap_or_default()
    }

    /// Classify `key` without prompting. Revoked keys are an error.
    pub fn decide(&self, host: &str, port: u16, key: &HostKey) -> Result<TrustDecision, ErrorKind> {
        let Some(db) = &self.db else {
            return Ok(TrustDecision::StoreUnavailable);
        };
        match db.check(host, port, key) {
            HostKeyStatus::Match => Ok(TrustDecision::VerifiedMatch),
            HostKeyStatus::Unknown => Ok(TrustDecision::UnknownHost),
            HostKeyStatus::Mismatch { known } => Ok(TrustDecision::ChangedHost { known }),
            HostKeyStatus::Revoked => Err(ErrorKind::HostKeyRevoked {
                host: host.to_string(),
                fingerprint: key.fingerprint(),
            }),
        }
    }

    /// Verify the key presented by `host:port` (reached at `remote`).
    ///
    /// Unknown hosts are offered to the user, file by file; an accepted key is
    /// appended and the lookup repeated once against the rebuilt store.
    pub async fn verify(
        &mut self,
        host: &str,
        port: u16,
        remote: &str,
        key: &HostKey,
    ) -> Result<(), ErrorKind> {
        match self.decide(host, port, key)? {
            TrustDecision::VerifiedMatch => {
                debug!("Host key for {} matches known_hosts", host);
                Ok(())
            }
            TrustDecision::ChangedHost { known } => {
                warn!("{}", self.changed_host_warning(host, key, &known));
                Err(ErrorKind::HostKeyMismatch {
                    host: host.to_string(),
                    fingerprint: key.fingerprint(),
                })
            }
            TrustDecision::UnknownHost | TrustDecision::StoreUnavailable => {
                self.learn(host, port, remote, key).await?;
                self.confirm_learned(host, port, key)
            }
        }
    }

    async fn learn(
        &mut self,
        host: &str,
        port: u16,
        remote: &str,
        key: &HostKey,
    ) -> Result<(), ErrorKind> {
        let line = format_line(host, port, key);
        let cancelled = |err: PromptError| ErrorKind::UserCancelled(err.to_string());

        for path in self.readable.clone() {
            let request = key_missing_request(host, remote, key, &path);
            match self.offer_write(&path, &line, request).await.map_err(cancelled)? {
                WriteOutcome::Written => return Ok(()),
                WriteOutcome::Rejected => debug!("User rejected adding key to {}", path.display()),
                WriteOutcome::Unwritable(err) => {
                    warn!("Cannot write {}: {}", path.display(), err)
                }
            }
        }

        for path in self.unreadable.clone() {
            let request = file_missing_request(host, remote, key, &path);
            match self.offer_write(&path, &line, request).await.map_err(cancelled)? {
                WriteOutcome::Written => {
                    info!("Created {} as the known_hosts file", path.display());
                    self.readable = vec![path];
                    return Ok(());
                }
                WriteOutcome::Rejected => debug!("User rejected creating {}", path.display()),
                WriteOutcome::Unwritable(err) => {
                    warn!("Cannot create {}: {}", path.display(), err)
                }
            }
        }

        Err(ErrorKind::TrustStoreUnavailable(format!(
            "host key for {} was not added to any known_hosts file",
            host
        )))
    }

    /// Files that already exist are opened before asking so an unwritable
    /// file never produces a prompt.
    async fn offer_write(
        &self,
        path: &Path,
        line: &str,
        request: UserInputRequest,
    ) -> Result<WriteOutcome, PromptError> {
        let opened = if path.exists() {
            match open_for_append(path) {
                Ok(file) => Some(file),
                Err(err) => return Ok(WriteOutcome::Unwritable(err)),
            }
        } else {
            None
        };

        if !self.prompter.ask_confirm(request).await? {
            return Ok(WriteOutcome::Rejected);
        }

        let file = match opened {
            Some(file) => file,
            None => match open_for_append(path) {
                Ok(file) => file,
                Err(err) => return Ok(WriteOutcome::Unwritable(err)),
            },
        };
        Ok(match append_line(file, line) {
            Ok(()) => WriteOutcome::Written,
            Err(err) => WriteOutcome::Unwritable(err),
        })
    }

    fn confirm_learned(&mut self, host: &str, port: u16, key: &HostKey) -> Result<(), ErrorKind> {
        let db = KnownHostsDb::open(&self.readable)
            .map_err(|e| ErrorKind::Config(format!("reloading known_hosts: {}", e)))?;
        let status = db.check(host, port, key);
        self.db = Some(db);
        match status {
            HostKeyStatus::Match => {
                info!("Added host key for {} to known_hosts", host);
                Ok(())
            }
            other => Err(ErrorKind::TrustStoreUnavailable(format!(
                "host key for {} still not trusted after update ({:?})",
                host, other
            ))),
        }
    }

    fn changed_host_warning(&self, host: &str, key: &HostKey, known: &[KnownKey]) -> String {
        let files: Vec<String> = self
            .readable
            .iter()
            .map(|p| format!("- {}", p.display()))
            .collect();
        let offending: Vec<String> = known
            .iter()
            .map(|k| format!("- {}:{} {} {}", k.path.display(), k.line, k.key_type, k.fingerprint()))
            .collect();
        format!(
            "WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED for {}!\n\
             Someone may be intercepting this connection, or the host key was replaced.\n\
             The {} key sent by the remote host has fingerprint {}.\n\
             If the change is expected, remove the offending lines and connect again.\n\
             Known hosts files:\n{}\n\
             Offending keys:\n{}",
            host,
            key.key_type,
            key.fingerprint(),
            files.join("\n"),
            offending.join("\n")
        )
    }
}

fn key_missing_request(host: &str, remote: &str, key: &HostKey, path: &Path) -> UserInputRequest {
    UserInputRequest::confirm(
        KEY_MISSING_TITLE,
        format!(
            "The authenticity of host '{}' ({}) can't be established: it is **not in any \
             checked known_hosts file**. The host presents this {} key:  \n{}\n\n\
             **Continue connecting?** The key will be added to {} to protect future \
             connections from man-in-the-middle attacks.",
            host,
            remote,
            key.key_type,
            key.blob,
            path.display()
        ),
    )
}

fn file_missing_request(host: &str, remote: &str, key: &HostKey, path: &Path) -> UserInputRequest {
    UserInputRequest::confirm(
        FILE_MISSING_TITLE,
        format!(
            "The authenticity of host '{}' ({}) can't be established: **no known_hosts \
             file could be read**. The host presents this {} key:  \n{}\n\n\
             **Continue connecting?** {} will be created and the key added to it.",
            host,
            remote,
            key.key_type,
            key.blob,
            path.display()
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::known_hosts::tests::{HOST_A_KEY, HOST_B_KEY};
    use crate::ssh::prompt::tests::ScriptedInput;
    use crate::ssh::resolver::{ConnKeywords, combine};
    use std::fs;
    use tempfile::TempDir;

    fn params(user: &[PathBuf], global: &[PathBuf]) -> ConnectionParameters {
        let to_strings = |paths: &[PathBuf]| -> Vec<String> {
            paths.iter().map(|p| p.to_string_lossy().into_owned()).collect()
        };
        let config = ConnKeywords {
            user_known_hosts_files: to_strings(user),
            global_known_hosts_files: to_strings(global),
            ..Default::default()
        };
        combine(&ConnKeywords::default(), &config, None, "me")
    }

    fn key_a() -> HostKey {
        HostKey::new("ssh-ed25519", HOST_A_KEY)
    }

    fn key_b() -> HostKey {
        HostKey::new("ssh-ed25519", HOST_B_KEY)
    }

    mod build {
        use super::*;

        #[test]
        fn test_no_files_configured_fails() {
            let input = ScriptedInput::new();
            let err = HostKeyVerifier::build(&params(&[], &[]), false, input.prompter()).unwrap_err();
            assert!(matches!(err, ErrorKind::TrustStoreUnavailable(_)));
        }

        #[test]
        fn test_missing_files_become_unreadable() {
            let dir = TempDir::new().unwrap();
            let present = dir.path().join("known_hosts");
            fs::write(&present, "").unwrap();
            let missing = dir.path().join("absent");
            let verifier = HostKeyVerifier::build(
                &params(&[missing.clone()], &[present.clone()]),
                false,
                ScriptedInput::new().prompter(),
            )
            .unwrap();
            assert_eq!(verifier.readable_files(), &[present]);
            assert_eq!(verifier.unreadable_files(), &[missing]);
        }

        #[test]
        fn test_malformed_file_dropped() {
            let dir = TempDir::new().unwrap();
            let bad = dir.path().join("bad");
            fs::write(&bad, "only-a-host\n").unwrap();
            let good = dir.path().join("good");
            fs::write(&good, format!("db ssh-ed25519 {}\n", HOST_A_KEY)).unwrap();
            let verifier = HostKeyVerifier::build(
                &params(&[bad.clone(), good.clone()], &[]),
                false,
                ScriptedInput::new().prompter(),
            )
            .unwrap();
            assert_eq!(verifier.readable_files(), &[good]);
            assert_eq!(verifier.decide("db", 22, &key_a()).unwrap(), TrustDecision::VerifiedMatch);
        }

        #[test]
        fn test_privileged_user_ignores_user_files() {
            let dir = TempDir::new().unwrap();
            let user = dir.path().join("user");
            let global = dir.path().join("global");
            fs::write(&user, format!("db ssh-ed25519 {}\n", HOST_A_KEY)).unwrap();
            fs::write(&global, "").unwrap();
            let verifier = HostKeyVerifier::build(
                &params(&[user], &[global.clone()]),
                true,
                ScriptedInput::new().prompter(),
            )
            .unwrap();
            assert_eq!(verifier.readable_files(), &[global]);
            assert_eq!(verifier.decide("db", 22, &key_a()).unwrap(), TrustDecision::UnknownHost);
        }

        #[test]
        fn test_all_unreadable_is_store_unavailable() {
            let dir = TempDir::new().unwrap();
            let verifier = HostKeyVerifier::build(
                &params(&[dir.path().join("a")], &[dir.path().join("b")]),
                false,
                ScriptedInput::new().prompter(),
            )
            .unwrap();
            assert_eq!(verifier.decide("db", 22, &key_a()).unwrap(), TrustDecision::StoreUnavailable);
        }

        #[test]
        fn test_host_key_algorithms() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("known_hosts");
            fs::write(&path, format!("[db]:2222 ssh-ed25519 {}\n", HOST_A_KEY)).unwrap();
            let verifier =
                HostKeyVerifier::build(&params(&[path], &[]), false, ScriptedInput::new().prompter()).unwrap();
            assert_eq!(verifier.host_key_algorithms("db", 2222), vec!["ssh-ed25519"]);
            assert!(verifier.host_key_algorithms("db", 22).is_empty());
        }
    }

    mod verify {
        use super::*;

        #[tokio::test]
        async fn test_known_host_needs_no_prompt() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("known_hosts");
            fs::write(&path, format!("db ssh-ed25519 {}\n", HOST_A_KEY)).unwrap();
            let input = ScriptedInput::new();
            let mut verifier = HostKeyVerifier::build(&params(&[path], &[]), false, input.prompter()).unwrap();
            verifier.verify("db", 22, "10.0.0.5:22", &key_a()).await.unwrap();
            assert_eq!(input.prompt_count(), 0);
        }

        #[tokio::test]
        async fn test_changed_key_fails_without_prompt() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("known_hosts");
            fs::write(&path, format!("db ssh-ed25519 {}\n", HOST_A_KEY)).unwrap();
            let input = ScriptedInput::new().confirm(true);
            let mut verifier =
                HostKeyVerifier::build(&params(&[path.clone()], &[]), false, input.prompter()).unwrap();
            let err = verifier.verify("db", 22, "10.0.0.5:22", &key_b()).await.unwrap_err();
            assert!(matches!(err, ErrorKind::HostKeyMismatch { .. }));
            assert_eq!(input.prompt_count(), 0);
            assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
        }

        #[tokio::test]
        async fn test_changed_key_on_hashed_entry_fails_without_prompt() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("known_hosts");
            let original = format!(
                "|1|MDEyMzQ1Njc4OWFiY2RlZmdoaWo=|7ESAJZOyuNjnoNT17SSbtsUaCwU= ssh-ed25519 {}\n",
                HOST_A_KEY
            );
            fs::write(&path, &original).unwrap();
            let input = ScriptedInput::new().confirm(true);
            let mut verifier =
                HostKeyVerifier::build(&params(&[path.clone()], &[]), false, input.prompter()).unwrap();

            verifier.verify("db", 22, "10.0.0.5:22", &key_a()).await.unwrap();
            let err = verifier.verify("db", 22, "10.0.0.5:22", &key_b()).await.unwrap_err();
            assert!(matches!(err, ErrorKind::HostKeyMismatch { .. }));
            assert_eq!(input.prompt_count(), 0);
            assert_eq!(fs::read_to_string(&path).unwrap(), original);
        }

        #[tokio::test]
        async fn test_revoked_key_fails_without_prompt() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("known_hosts");
            fs::write(&path, format!("@revoked * ssh-ed25519 {}\n", HOST_A_KEY)).unwrap();
            let input = ScriptedInput::new().confirm(true);
            let mut verifier = HostKeyVerifier::build(&params(&[path], &[]), false, input.prompter()).unwrap();
            let err = verifier.verify("db", 22, "10.0.0.5:22", &key_a()).await.unwrap_err();
            assert!(matches!(err, ErrorKind::HostKeyRevoked { .. }));
            assert_eq!(input.prompt_count(), 0);
        }

        #[tokio::test]
        async fn test_accepted_key_is_appended_once() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("known_hosts");
            fs::write(&path, "").unwrap();
            let input = ScriptedInput::new().confirm(true);
            let config = params(&[path.clone()], &[]);

            let mut verifier = HostKeyVerifier::build(&config, false, input.prompter()).unwrap();
            verifier.verify("db", 2222, "10.0.0.5:2222", &key_a()).await.unwrap();
            verifier.verify("db", 2222, "10.0.0.5:2222", &key_a()).await.unwrap();

            let mut fresh = HostKeyVerifier::build(&config, false, input.prompter()).unwrap();
            fresh.verify("db", 2222, "10.0.0.5:2222", &key_a()).await.unwrap();

            assert_eq!(input.prompt_count(), 1);
            assert_eq!(input.requests()[0].title, KEY_MISSING_TITLE);
            assert_eq!(
                fs::read_to_string(&path).unwrap(),
                format!("[db]:2222 ssh-ed25519 {}\n", HOST_A_KEY)
            );
        }

        #[tokio::test]
        async fn test_rejection_moves_to_next_file() {
            let dir = TempDir::new().unwrap();
            let first = dir.path().join("first");
            let second = dir.path().join("second");
            fs::write(&first, "").unwrap();
            fs::write(&second, "").unwrap();
            let input = ScriptedInput::new().confirm(false).confirm(true);
            let mut verifier = HostKeyVerifier::build(
                &params(&[first.clone()], &[second.clone()]),
                false,
                input.prompter(),
            )
            .unwrap();
            verifier.verify("db", 22, "10.0.0.5:22", &key_a()).await.unwrap();
            assert_eq!(input.prompt_count(), 2);
            assert!(fs::read_to_string(&first).unwrap().is_empty());
            assert!(fs::read_to_string(&second).unwrap().contains(HOST_A_KEY));
        }

        #[tokio::test]
        async fn test_decline_aborts_immediately() {
            let dir = TempDir::new().unwrap();
            let first = dir.path().join("first");
            let second = dir.path().join("second");
            fs::write(&first, "").unwrap();
            fs::write(&second, "").unwrap();
            let input = ScriptedInput::new().decline().confirm(true);
            let mut verifier =
                HostKeyVerifier::build(&params(&[first], &[second.clone()]), false, input.prompter()).unwrap();
            let err = verifier.verify("db", 22, "10.0.0.5:22", &key_a()).await.unwrap_err();
            assert!(matches!(err, ErrorKind::UserCancelled(_)));
            assert_eq!(input.prompt_count(), 1);
            assert!(fs::read_to_string(&second).unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_missing_file_created_after_readable_rejected() {
            let dir = TempDir::new().unwrap();
            let readable = dir.path().join("known_hosts");
            fs::write(&readable, "").unwrap();
            let missing = dir.path().join("new/.ssh/known_hosts");
            let input = ScriptedInput::new().confirm(false).confirm(true);
            let mut verifier = HostKeyVerifier::build(
                &params(&[missing.clone()], &[readable.clone()]),
                false,
                input.prompter(),
            )
            .unwrap();
            verifier.verify("db", 22, "10.0.0.5:22", &key_a()).await.unwrap();

            let titles: Vec<String> = input.requests().into_iter().map(|r| r.title).collect();
            assert_eq!(titles, vec![KEY_MISSING_TITLE, FILE_MISSING_TITLE]);
            assert_eq!(verifier.readable_files(), &[missing.clone()]);
            assert!(fs::read_to_string(&missing).unwrap().contains(HOST_A_KEY));
        }

        #[tokio::test]
        async fn test_rejected_everywhere_fails() {
            let dir = TempDir::new().unwrap();
            let readable = dir.path().join("known_hosts");
            fs::write(&readable, "").unwrap();
            let missing = dir.path().join("absent");
            let input = ScriptedInput::new().confirm(false).confirm(false);
            let mut verifier =
                HostKeyVerifier::build(&params(&[readable], &[missing.clone()]), false, input.prompter()).unwrap();
            let err = verifier.verify("db", 22, "10.0.0.5:22", &key_a()).await.unwrap_err();
            assert!(matches!(err, ErrorKind::TrustStoreUnavailable(_)));
            assert!(!missing.exists());
        }

        #[tokio::test]
        async fn test_prompt_describes_host_and_key() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("known_hosts");
            fs::write(&path, "").unwrap();
            let input = ScriptedInput::new().confirm(true);
            let mut verifier = HostKeyVerifier::build(&params(&[path], &[]), false, input.prompter()).unwrap();
            verifier.verify("db", 22, "10.0.0.5:22", &key_a()).await.unwrap();
            let query = &input.requests()[0].query_text;
            assert!(query.contains("'db' (10.0.0.5:22)"));
            assert!(query.contains("ssh-ed25519"));
            assert!(query.contains(HOST_A_KEY));
        }
    }
}
