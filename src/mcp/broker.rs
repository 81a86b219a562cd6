//! Prompt broker: the MCP side of [`UserInputService`].
//!
//! A connection attempt runs in a background task. Whenever the engine needs
//! an answer, the broker parks the question under a fresh prompt ID and waits
//! on a oneshot channel until a tool call answers or declines it. Questions
//! disappear from the pending list as soon as the waiting side gives up
//! (timeout, cancellation, attempt finished).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::ToolError;
use super::types::PendingPromptInfo;
use crate::ssh::prompt::{PromptError, ResponseType, UserInputRequest, UserInputResponse, UserInputService};

/// Global prompt broker shared by all attempts.
pub static PROMPT_BROKER: Lazy<Arc<PromptBroker>> = Lazy::new(|| Arc::new(PromptBroker::new()));

type Reply = Result<UserInputResponse, PromptError>;

struct PendingPrompt {
    attempt_id: String,
    seq: u64,
    info: PendingPromptInfo,
    reply: oneshot::Sender<Reply>,
}

/// Pending questions of every running attempt, keyed by prompt ID.
pub struct PromptBroker {
    prompts: DashMap<String, PendingPrompt>,
    next_seq: AtomicU64,
}

impl Default for PromptBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptBroker {
    pub fn new() -> Self {
        Self {
            prompts: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// The input service handed to the engine for one attempt.
    pub fn input_for(self: &Arc<Self>, attempt_id: &str) -> Arc<dyn UserInputService> {
        Arc::new(AttemptInput {
            broker: Arc::clone(self),
            attempt_id: attempt_id.to_string(),
        })
    }

    fn park(&self, attempt_id: &str, request: UserInputRequest) -> (String, oneshot::Receiver<Reply>) {
        let prompt_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let info = PendingPromptInfo {
            prompt_id: prompt_id.clone(),
            title: request.title,
            query_text: request.query_text,
            response_type: request.response_type,
            markdown: request.markdown,
            public_text: request.public_text,
            asked_at: chrono::Utc::now().to_rfc3339(),
        };
        self.prompts.insert(
            prompt_id.clone(),
            PendingPrompt {
                attempt_id: attempt_id.to_string(),
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                info,
                reply: tx,
            },
        );
        (prompt_id, rx)
    }

    /// Questions waiting on `attempt_id`, oldest first.
    pub fn pending(&self, attempt_id: &str) -> Vec<PendingPromptInfo> {
        let mut pending: Vec<(u64, PendingPromptInfo)> = self
            .prompts
            .iter()
            .filter(|entry| entry.attempt_id == attempt_id)
            .map(|entry| (entry.seq, entry.info.clone()))
            .collect();
        pending.sort_by_key(|(seq, _)| *seq);
        pending.into_iter().map(|(_, info)| info).collect()
    }

    /// Answer a prompt. Returns the attempt it belonged to.
    ///
    /// A text prompt needs `text`; a confirm prompt needs `confirm`. A
    /// prompt given the wrong kind of answer stays pending.
    pub fn respond(
        &self,
        prompt_id: &str,
        text: Option<String>,
        confirm: Option<bool>,
    ) -> Result<String, ToolError> {
        let expected = self
            .prompts
            .get(prompt_id)
            .map(|entry| entry.info.response_type)
            .ok_or_else(|| ToolError::UnknownPrompt(prompt_id.to_string()))?;

        let response = match (expected, text, confirm) {
            (ResponseType::Text, Some(text), _) => UserInputResponse {
                text: Some(text),
                confirm: false,
            },
            (ResponseType::Confirm, _, Some(confirm)) => UserInputResponse { text: None, confirm },
            (expected, _, _) => return Err(ToolError::missing_answer(prompt_id, expected)),
        };

        self.deliver(prompt_id, Ok(response))
    }

    /// Refuse to answer a prompt. The engine treats this as a cancellation.
    pub fn decline(&self, prompt_id: &str) -> Result<String, ToolError> {
        self.deliver(prompt_id, Err(PromptError::Declined))
    }

    fn deliver(&self, prompt_id: &str, reply: Reply) -> Result<String, ToolError> {
        let (_, pending) = self
            .prompts
            .remove(prompt_id)
            .ok_or_else(|| ToolError::UnknownPrompt(prompt_id.to_string()))?;
        let attempt_id = pending.attempt_id;
        pending
            .reply
            .send(reply)
            .map_err(|_| ToolError::AttemptGone(attempt_id.clone()))?;
        info!("Prompt {} of attempt {} answered", prompt_id, attempt_id);
        Ok(attempt_id)
    }

    /// Drop every question of `attempt_id`; waiting requests see a cancellation.
    pub fn discard_attempt(&self, attempt_id: &str) -> usize {
        let before = self.prompts.len();
        self.prompts.retain(|_, pending| pending.attempt_id != attempt_id);
        before.saturating_sub(self.prompts.len())
    }
}

/// Removes a parked prompt when its waiter goes away.
struct ParkedPrompt<'a> {
    broker: &'a PromptBroker,
    prompt_id: String,
}

impl Drop for ParkedPrompt<'_> {
    fn drop(&mut self) {
        if self.broker.prompts.remove(&self.prompt_id).is_some() {
            debug!("Prompt {} withdrawn", self.prompt_id);
        }
    }
}

/// [`UserInputService`] bound to one attempt.
struct AttemptInput {
    broker: Arc<PromptBroker>,
    attempt_id: String,
}

#[async_trait]
impl UserInputService for AttemptInput {
    async fn request(&self, request: UserInputRequest) -> Result<UserInputResponse, PromptError> {
        let (prompt_id, rx) = self.broker.park(&self.attempt_id, request);
        info!("Attempt {} waiting on prompt {}", self.attempt_id, prompt_id);
        let _parked = ParkedPrompt {
            broker: &self.broker,
            prompt_id,
        };
        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(PromptError::Cancelled),
        }
    }
}
