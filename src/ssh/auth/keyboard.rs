//! Keyboard-interactive authentication.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::ssh::error::{ConnectError, DebugContext, ErrorKind};
use crate::ssh::prompt::{Prompter, UserInputRequest};

use super::traits::{AuthProbe, AuthSession, KbdReply, ProbeOutcome};

pub const KEYBOARD_INTERACTIVE_TITLE: &str = "Keyboard Interactive Authentication";

/// Answers server challenges through the prompter, one prompt per question.
pub struct KeyboardInteractiveProbe {
    remote: String,
    prompter: Prompter,
    debug: DebugContext,
}

impl KeyboardInteractiveProbe {
    pub fn new(remote: impl Into<String>, prompter: Prompter, debug: DebugContext) -> Self {
        Self {
            remote: remote.into(),
            prompter,
            debug,
        }
    }

    async fn answer(&self, questions: &[String], echos: &[bool]) -> Result<Vec<String>, ConnectError> {
        if questions.len() != echos.len() {
            return Err(ErrorKind::Protocol(format!(
                "bad response from server: questions has len {}, echos has len {}",
                questions.len(),
                echos.len()
            ))
            .in_context(&self.debug));
        }

        let mut answers = Vec::with_capacity(questions.len());
        for (question, echo) in questions.iter().zip(echos) {
            let request = UserInputRequest::text(
                KEYBOARD_INTERACTIVE_TITLE,
                format!(
                    "Keyboard Interactive Authentication requested from connection  \n{}\n\n{}",
                    self.remote, question
                ),
            )
            .markdown(true)
            .public_text(*echo);
            let answer = self
                .prompter
                .ask_text(request)
                .await
                .map_err(|e| ErrorKind::UserCancelled(e.to_string()).in_context(&self.debug))?;
            answers.push(answer);
        }
        Ok(answers)
    }
}

#[async_trait]
impl AuthProbe for KeyboardInteractiveProbe {
    async fn attempt(&mut self, session: &mut dyn AuthSession, user: &str) -> Result<ProbeOutcome, ConnectError> {
        let mut reply = session
            .keyboard_interactive_start(user)
            .await
            .map_err(|kind| kind.in_context(&self.debug))?;

        loop {
            match reply {
                KbdReply::Success => {
                    info!("Authenticated with keyboard-interactive");
                    return Ok(ProbeOutcome::Accepted);
                }
                KbdReply::Failure => return Ok(ProbeOutcome::Rejected),
                KbdReply::InfoRequest {
                    name,
                    instructions,
                    questions,
                    echos,
                } => {
                    debug!(
                        "Keyboard-interactive challenge '{}' ({}): {} question(s)",
                        name,
                        instructions,
                        questions.len()
                    );
                    let answers = self.answer(&questions, &echos).await?;
                    reply = session
                        .keyboard_interactive_respond(answers)
                        .await
                        .map_err(|kind| kind.in_context(&self.debug))?;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "keyboard-interactive"
    }

    fn retry_budget(&self) -> usize {
        1
    }
}
