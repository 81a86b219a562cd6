//! Password authentication.

use async_trait::async_trait;
use tracing::info;

use crate::ssh::error::{ConnectError, DebugContext, ErrorKind};
use crate::ssh::prompt::{Prompter, UserInputRequest};

use super::traits::{AuthProbe, AuthSession, ProbeOutcome};

pub const PASSWORD_TITLE: &str = "Password Authentication";

/// Asks the user for a password and offers it once.
pub struct PasswordProbe {
    remote: String,
    prompter: Prompter,
    debug: DebugContext,
}

impl PasswordProbe {
    pub fn new(remote: impl Into<String>, prompter: Prompter, debug: DebugContext) -> Self {
        Self {
            remote: remote.into(),
            prompter,
            debug,
        }
    }
}

#[async_trait]
impl AuthProbe for PasswordProbe {
    async fn attempt(&mut self, session: &mut dyn AuthSession, user: &str) -> Result<ProbeOutcome, ConnectError> {
        let request = UserInputRequest::text(
            PASSWORD_TITLE,
            format!(
                "Password Authentication requested from connection  \n{}\n\nPassword:",
                self.remote
            ),
        )
        .markdown(true);
        let password = self
            .prompter
            .ask_text(request)
            .await
            .map_err(|e| ErrorKind::UserCancelled(e.to_string()).in_context(&self.debug))?;

        let accepted = session
            .offer_password(user, &password)
            .await
            .map_err(|kind| kind.in_context(&self.debug))?;
        if accepted {
            info!("Authenticated with password");
            Ok(ProbeOutcome::Accepted)
        } else {
            Ok(ProbeOutcome::Rejected)
        }
    }

    fn name(&self) -> &'static str {
        "password"
    }

    fn retry_budget(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::tests::FakeSession;
    use crate::ssh::prompt::tests::ScriptedInput;

    #[tokio::test]
    async fn test_password_offered() {
        let input = ScriptedInput::new().text("s3cret");
        let mut probe = PasswordProbe::new("alice@host:2222", input.prompter(), DebugContext::default());
        let mut session = FakeSession::accepting_password("s3cret");

        assert_eq!(
            probe.attempt(&mut session, "alice").await.unwrap(),
            ProbeOutcome::Accepted
        );
        let request = &input.requests()[0];
        assert_eq!(request.title, PASSWORD_TITLE);
        assert!(request.markdown);
        assert!(!request.public_text);
        assert!(request.query_text.contains("alice@host:2222"));
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let input = ScriptedInput::new().text("guess");
        let mut probe = PasswordProbe::new("host", input.prompter(), DebugContext::default());
        let mut session = FakeSession::accepting_password("s3cret");
        assert_eq!(
            probe.attempt(&mut session, "alice").await.unwrap(),
            ProbeOutcome::Rejected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_prompt_is_cancellation() {
        let input = ScriptedInput::new();
        let mut probe = PasswordProbe::new("host", input.prompter(), DebugContext::default());
        let mut session = FakeSession::rejecting();

        let err = probe.attempt(&mut session, "alice").await.unwrap_err();
        assert!(err.is_user_cancelled());
        assert!(session.offers().is_empty());
    }
}
