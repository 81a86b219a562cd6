//! Public-key authentication: agent keys first, then identity files.

use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::{self, PrivateKey};
use tracing::{debug, info, warn};

use crate::ssh::error::{ConnectError, DebugContext, ErrorKind};
use crate::ssh::prompt::{Prompter, UserInputRequest};

use super::credentials::{CredentialState, IdentityFile};
use super::traits::{AuthProbe, AuthSession, Credential, KeyAgent, ProbeOutcome};

pub const PASSPHRASE_TITLE: &str = "Publickey Auth + Passphrase";

/// What the probe does next.
#[derive(Debug)]
pub enum ProbeStep {
    /// Offer this credential to the server
    Offer(Credential),
    /// The candidate was unusable; move on
    Skip,
    /// Nothing left to try
    Exhausted,
}

/// Public-key probe over one [`CredentialState`].
pub struct PublicKeyProbe {
    state: CredentialState,
    budget: usize,
    batch_mode: bool,
    add_keys_to_agent: bool,
    agent: Option<Arc<dyn KeyAgent>>,
    prompter: Prompter,
    debug: DebugContext,
}

impl PublicKeyProbe {
    pub fn new(
        state: CredentialState,
        batch_mode: bool,
        add_keys_to_agent: bool,
        agent: Option<Arc<dyn KeyAgent>>,
        prompter: Prompter,
        debug: DebugContext,
    ) -> Self {
        Self {
            budget: state.candidate_count(),
            state,
            batch_mode,
            add_keys_to_agent,
            agent,
            prompter,
            debug,
        }
    }

    /// Pop the next candidate and turn it into a step.
    ///
    /// Only a cancelled passphrase prompt is an error; every other problem
    /// with a file is a [`ProbeStep::Skip`].
    pub async fn next_step(&mut self) -> Result<ProbeStep, ConnectError> {
        if let Some(signer) = self.state.next_agent_signer() {
            return Ok(ProbeStep::Offer(Credential::Agent(signer)));
        }
        match self.state.next_identity_file() {
            Some(file) => self.unlock(file).await,
            None => Ok(ProbeStep::Exhausted),
        }
    }

    async fn unlock(&mut self, file: IdentityFile) -> Result<ProbeStep, ConnectError> {
        let key = match keys::decode_secret_key(&file.contents, None) {
            Ok(key) => key,
            Err(keys::Error::KeyIsEncrypted) => {
                if self.batch_mode {
                    debug!("Skipping encrypted identity file {} in batch mode", file.path);
                    return Ok(ProbeStep::Skip);
                }
                let request = UserInputRequest::text(
                    PASSPHRASE_TITLE,
                    format!("Enter passphrase for the SSH key: {}", file.path),
                );
                let passphrase = self
                    .prompter
                    .ask_text(request)
                    .await
                    .map_err(|e| ErrorKind::UserCancelled(e.to_string()).in_context(&self.debug))?;
                match keys::decode_secret_key(&file.contents, Some(&passphrase)) {
                    Ok(key) => key,
                    Err(e) => {
                        debug!("Cannot decrypt identity file {}: {}", file.path, e);
                        return Ok(ProbeStep::Skip);
                    }
                }
            }
            Err(e) => {
                debug!("Skipping identity file {}: {}", file.path, e);
                return Ok(ProbeStep::Skip);
            }
        };

        self.register_with_agent(&key).await;
        Ok(ProbeStep::Offer(Credential::Key {
            path: file.path,
            key: Arc::new(key),
        }))
    }

    async fn register_with_agent(&self, key: &PrivateKey) {
        if !self.add_keys_to_agent {
            return;
        }
        if let Some(agent) = &self.agent {
            if let Err(e) = agent.add_identity(key).await {
                warn!("Failed to add key to agent: {}", e);
            }
        }
    }
}

#[async_trait]
impl AuthProbe for PublicKeyProbe {
    async fn attempt(&mut self, session: &mut dyn AuthSession, user: &str) -> Result<ProbeOutcome, ConnectError> {
        let credential = match self.next_step().await? {
            ProbeStep::Offer(credential) => credential,
            ProbeStep::Skip => return Ok(ProbeOutcome::Skipped),
            ProbeStep::Exhausted => {
                return Err(ErrorKind::CredentialExhausted("no public keys left to offer".to_string())
                    .in_context(&self.debug));
            }
        };

        debug!("Offering {}", credential.describe());
        let accepted = session
            .offer_publickey(user, &credential)
            .await
            .map_err(|kind| kind.in_context(&self.debug))?;
        if accepted {
            info!("Authenticated with {}", credential.describe());
            Ok(ProbeOutcome::Accepted)
        } else {
            Ok(ProbeOutcome::Rejected)
        }
    }

    fn name(&self) -> &'static str {
        "publickey"
    }

    fn retry_budget(&self) -> usize {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::tests::{FakeAgent, FakeSession, fixture};
    use crate::ssh::prompt::tests::ScriptedInput;

    fn probe(files: &[String], input: &Arc<ScriptedInput>) -> PublicKeyProbe {
        PublicKeyProbe::new(
            CredentialState::load(files, Vec::new()),
            false,
            false,
            None,
            input.prompter(),
            DebugContext::default(),
        )
    }

    mod steps {
        use super::*;

        #[tokio::test]
        async fn test_plain_key_offered_without_prompt() {
            let dir = tempfile::tempdir().unwrap();
            let plain = fixture(&dir, "id_plain");
            let input = ScriptedInput::new();
            let mut probe = probe(&[plain.clone()], &input);

            match probe.next_step().await.unwrap() {
                ProbeStep::Offer(Credential::Key { path, .. }) => assert_eq!(path, plain),
                other => panic!("unexpected step: {:?}", other),
            }
            assert!(matches!(probe.next_step().await.unwrap(), ProbeStep::Exhausted));
            assert_eq!(input.prompt_count(), 0);
        }

        #[tokio::test]
        async fn test_encrypted_key_unlocked_with_passphrase() {
            let dir = tempfile::tempdir().unwrap();
            let encrypted = fixture(&dir, "id_encrypted_a");
            let input = ScriptedInput::new().text("hunter2");
            let mut probe = probe(&[encrypted.clone()], &input);

            assert!(matches!(
                probe.next_step().await.unwrap(),
                ProbeStep::Offer(Credential::Key { .. })
            ));
            let requests = input.requests();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].title, PASSPHRASE_TITLE);
            assert!(requests[0].query_text.ends_with(&encrypted));
        }

        #[tokio::test]
        async fn test_wrong_passphrase_skips_file() {
            let dir = tempfile::tempdir().unwrap();
            let encrypted = fixture(&dir, "id_encrypted_a");
            let input = ScriptedInput::new().text("wrong");
            let mut probe = probe(&[encrypted], &input);
            assert!(matches!(probe.next_step().await.unwrap(), ProbeStep::Skip));
            assert!(matches!(probe.next_step().await.unwrap(), ProbeStep::Exhausted));
        }

        #[tokio::test]
        async fn test_batch_mode_skips_encrypted_without_prompt() {
            let dir = tempfile::tempdir().unwrap();
            let encrypted = fixture(&dir, "id_encrypted_a");
            let input = ScriptedInput::new();
            let mut probe = PublicKeyProbe::new(
                CredentialState::load(&[encrypted], Vec::new()),
                true,
                false,
                None,
                input.prompter(),
                DebugContext::default(),
            );
            assert!(matches!(probe.next_step().await.unwrap(), ProbeStep::Skip));
            assert_eq!(input.prompt_count(), 0);
        }

        #[tokio::test]
        async fn test_garbage_file_skipped() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("id_broken");
            std::fs::write(&path, "not a key").unwrap();
            let input = ScriptedInput::new();
            let mut probe = probe(&[path.to_string_lossy().to_string()], &input);
            assert!(matches!(probe.next_step().await.unwrap(), ProbeStep::Skip));
            assert_eq!(input.prompt_count(), 0);
        }

        #[tokio::test]
        async fn test_declined_passphrase_is_cancellation() {
            let dir = tempfile::tempdir().unwrap();
            let encrypted = fixture(&dir, "id_encrypted_a");
            let input = ScriptedInput::new().decline();
            let mut probe = probe(&[encrypted], &input);
            let err = probe.next_step().await.unwrap_err();
            assert!(err.is_user_cancelled());
        }

        #[tokio::test]
        async fn test_unlocked_key_added_to_agent() {
            let dir = tempfile::tempdir().unwrap();
            let plain = fixture(&dir, "id_plain");
            let agent = FakeAgent::new(Vec::new());
            let input = ScriptedInput::new();
            let mut probe = PublicKeyProbe::new(
                CredentialState::load(&[plain], Vec::new()),
                false,
                true,
                Some(agent.clone()),
                input.prompter(),
                DebugContext::default(),
            );
            probe.next_step().await.unwrap();
            assert_eq!(agent.added(), 1);
        }
    }

    mod attempt {
        use super::*;

        #[tokio::test]
        async fn test_agent_keys_before_files_each_once() {
            let dir = tempfile::tempdir().unwrap();
            let plain = fixture(&dir, "id_plain");
            let agent = FakeAgent::new(vec!["first", "second"]);
            let input = ScriptedInput::new();
            let mut probe = PublicKeyProbe::new(
                CredentialState::load(&[plain.clone()], agent.keys()),
                false,
                false,
                Some(agent.clone()),
                input.prompter(),
                DebugContext::default(),
            );
            assert_eq!(probe.retry_budget(), 3);

            let mut session = FakeSession::rejecting();
            for _ in 0..probe.retry_budget() {
                assert_eq!(
                    probe.attempt(&mut session, "alice").await.unwrap(),
                    ProbeOutcome::Rejected
                );
            }
            let err = probe.attempt(&mut session, "alice").await.unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::CredentialExhausted(_)));

            assert_eq!(
                session.offers(),
                vec![
                    "agent:first".to_string(),
                    "agent:second".to_string(),
                    format!("key:{}", plain),
                ]
            );
        }

        #[tokio::test]
        async fn test_accepted_key() {
            let dir = tempfile::tempdir().unwrap();
            let plain = fixture(&dir, "id_plain");
            let input = ScriptedInput::new();
            let mut probe = probe(&[plain.clone()], &input);
            let mut session = FakeSession::accepting_key(&plain);
            assert_eq!(
                probe.attempt(&mut session, "alice").await.unwrap(),
                ProbeOutcome::Accepted
            );
        }
    }
}
