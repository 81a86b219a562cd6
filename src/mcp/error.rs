//! Errors returned by the MCP tools.
//!
//! Connection failures are not tool errors: they are reported through
//! `ssh_attempt_status`. These cover requests that name something that does
//! not exist or cannot take the requested answer.

use crate::ssh::prompt::ResponseType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("No connection attempt with ID: {0}")]
    UnknownAttempt(String),

    #[error("No pending prompt with ID: {0}")]
    UnknownPrompt(String),

    #[error("No active SSH session with ID: {0}")]
    UnknownSession(String),

    #[error("Prompt {prompt_id} expects a {expected} answer")]
    MissingAnswer {
        prompt_id: String,
        expected: &'static str,
    },

    #[error("Attempt {0} is no longer waiting for this prompt")]
    AttemptGone(String),

    #[error("Invalid target {0:?}: {1}")]
    InvalidTarget(String, String),
}

impl ToolError {
    pub(crate) fn missing_answer(prompt_id: &str, expected: ResponseType) -> Self {
        let expected = match expected {
            ResponseType::Text => "text",
            ResponseType::Confirm => "confirm",
        };
        ToolError::MissingAnswer {
            prompt_id: prompt_id.to_string(),
            expected,
        }
    }
}
