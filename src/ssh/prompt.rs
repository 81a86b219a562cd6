//! Interactive input from the human driving a connection attempt.
//!
//! The engine never talks to a terminal. Every passphrase, password,
//! keyboard-interactive answer and host-key confirmation goes through a
//! [`UserInputService`]; [`Prompter`] bounds each request by the prompt
//! timeout and the attempt's cancellation token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What kind of answer a request expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// Free text (secrets included)
    Text,
    /// Yes or no
    Confirm,
}

/// One question for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UserInputRequest {
    pub response_type: ResponseType,
    pub query_text: String,
    pub title: String,
    /// `query_text` is markdown
    #[serde(default)]
    pub markdown: bool,
    /// The answer may be shown while typing
    #[serde(default)]
    pub public_text: bool,
}

impl UserInputRequest {
    /// A secret text question.
    pub fn text(title: impl Into<String>, query_text: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Text,
            query_text: query_text.into(),
            title: title.into(),
            markdown: false,
            public_text: false,
        }
    }

    /// A yes/no question.
    pub fn confirm(title: impl Into<String>, query_text: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Confirm,
            query_text: query_text.into(),
            title: title.into(),
            markdown: true,
            public_text: false,
        }
    }

    pub fn markdown(mut self, markdown: bool) -> Self {
        self.markdown = markdown;
        self
    }

    pub fn public_text(mut self, public_text: bool) -> Self {
        self.public_text = public_text;
        self
    }
}

/// The user's answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UserInputResponse {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub confirm: bool,
}

/// A request that ended without an answer. Every variant is a cancellation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    #[error("declined by user")]
    Declined,

    #[error("no answer within {0:?}")]
    TimedOut(Duration),

    #[error("connection attempt cancelled")]
    Cancelled,
}

/// Where prompts are delivered.
#[async_trait]
pub trait UserInputService: Send + Sync {
    /// Deliver `request` and wait for the answer.
    ///
    /// Implementations return [`PromptError::Declined`] when the user
    /// explicitly refuses to answer.
    async fn request(&self, request: UserInputRequest) -> Result<UserInputResponse, PromptError>;
}

/// Sends prompts with the attempt's timeout and cancellation applied.
#[derive(Clone)]
pub struct Prompter {
    service: Arc<dyn UserInputService>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl std::fmt::Debug for Prompter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prompter")
            .field("timeout", &self.timeout)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Prompter {
    pub fn new(service: Arc<dyn UserInputService>, cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            service,
            cancel,
            timeout,
        }
    }

    /// Ask and wait, bounded by the timeout and the cancellation token.
    pub async fn ask(&self, request: UserInputRequest) -> Result<UserInputResponse, PromptError> {
        debug!("Prompting user: {}", request.title);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PromptError::Cancelled),
            answer = tokio::time::timeout(self.timeout, self.service.request(request)) => {
                match answer {
                    Ok(result) => result,
                    Err(_) => Err(PromptError::TimedOut(self.timeout)),
                }
            }
        }
    }

    /// Ask for text. A missing text field counts as an empty answer.
    pub async fn ask_text(&self, request: UserInputRequest) -> Result<String, PromptError> {
        Ok(self.ask(request).await?.text.unwrap_or_default())
    }

    /// Ask a yes/no question.
    pub async fn ask_confirm(&self, request: UserInputRequest) -> Result<bool, PromptError> {
        Ok(self.ask(request).await?.confirm)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Answers prompts from a script and records every request.
    #[derive(Default)]
    pub(crate) struct ScriptedInput {
        answers: StdMutex<VecDeque<Result<UserInputResponse, PromptError>>>,
        seen: StdMutex<Vec<UserInputRequest>>,
    }

    impl ScriptedInput {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn text(self: &Arc<Self>, text: &str) -> Arc<Self> {
            self.push(Ok(UserInputResponse {
                text: Some(text.to_string()),
                confirm: false,
            }))
        }

        pub(crate) fn confirm(self: &Arc<Self>, yes: bool) -> Arc<Self> {
            self.push(Ok(UserInputResponse {
                text: None,
                confirm: yes,
            }))
        }

        pub(crate) fn decline(self: &Arc<Self>) -> Arc<Self> {
            self.push(Err(PromptError::Declined))
        }

        fn push(self: &Arc<Self>, answer: Result<UserInputResponse, PromptError>) -> Arc<Self> {
            self.answers.lock().unwrap().push_back(answer);
            Arc::clone(self)
        }

        pub(crate) fn requests(&self) -> Vec<UserInputRequest> {
            self.seen.lock().unwrap().clone()
        }

        pub(crate) fn prompt_count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        pub(crate) fn prompter(self: &Arc<Self>) -> Prompter {
            Prompter::new(self.clone(), CancellationToken::new(), Duration::from_secs(5))
        }
    }

    #[async_trait]
    impl UserInputService for ScriptedInput {
        async fn request(&self, request: UserInputRequest) -> Result<UserInputResponse, PromptError> {
            self.seen.lock().unwrap().push(request);
            let next = self.answers.lock().unwrap().pop_front();
            // an unscripted prompt behaves like a user who never answers
            match next {
                Some(answer) => answer,
                None => std::future::pending().await,
            }
        }
    }

    mod prompter {
        use super::*;

        #[tokio::test]
        async fn test_answer_passed_through() {
            let input = ScriptedInput::new().text("s3cret");
            let answer = input
                .prompter()
                .ask_text(UserInputRequest::text("Password Authentication", "pw?"))
                .await
                .unwrap();
            assert_eq!(answer, "s3cret");
            assert_eq!(input.requests()[0].title, "Password Authentication");
        }

        #[tokio::test]
        async fn test_decline_is_error() {
            let input = ScriptedInput::new().decline();
            let result = input
                .prompter()
                .ask_confirm(UserInputRequest::confirm("t", "q"))
                .await;
            assert_eq!(result, Err(PromptError::Declined));
        }

        #[tokio::test(start_paused = true)]
        async fn test_unanswered_prompt_times_out() {
            let input = ScriptedInput::new();
            let prompter = Prompter::new(input.clone(), CancellationToken::new(), Duration::from_secs(60));
            let result = prompter.ask(UserInputRequest::text("t", "q")).await;
            assert_eq!(result, Err(PromptError::TimedOut(Duration::from_secs(60))));
        }

        #[tokio::test]
        async fn test_cancellation_ends_pending_prompt() {
            let input = ScriptedInput::new();
            let token = CancellationToken::new();
            let prompter = Prompter::new(input.clone(), token.clone(), Duration::from_secs(60));
            let handle = tokio::spawn(async move { prompter.ask(UserInputRequest::text("t", "q")).await });
            tokio::task::yield_now().await;
            token.cancel();
            assert_eq!(handle.await.unwrap(), Err(PromptError::Cancelled));
        }

        #[test]
        fn test_request_builders() {
            let request = UserInputRequest::text("t", "q").markdown(true).public_text(true);
            assert_eq!(request.response_type, ResponseType::Text);
            assert!(request.markdown);
            assert!(request.public_text);
            assert_eq!(UserInputRequest::confirm("t", "q").response_type, ResponseType::Confirm);
        }
    }
}
