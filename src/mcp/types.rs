//! Serializable response types for MCP SSH tools.
//!
//! All types implement `Serialize`, `Deserialize`, and `JsonSchema` for proper
//! MCP protocol compatibility.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ssh::prompt::ResponseType;

/// Session metadata for an established connection
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionInfo {
    pub session_id: String,
    /// `user@host:port` of the final hop
    pub label: String,
    /// Address the final hop was dialed at
    pub remote: String,
    /// Hop labels from the first jump host to the target
    pub route: Vec<String>,
    /// Jump depth of the final hop (0 when connected directly)
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub depth: u32,
    /// Number of retry attempts needed to establish the connection
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub retry_attempts: u32,
    /// Attempt that produced this session
    pub attempt_id: String,
    /// RFC3339 timestamp
    pub connected_at: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionListResponse {
    /// List of active SSH sessions
    pub sessions: Vec<SessionInfo>,
    /// Total number of active sessions
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub count: usize,
}

/// Response from ssh_connect
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SshConnectResponse {
    /// Identifier to poll with ssh_attempt_status
    pub attempt_id: String,
    pub target: String,
    /// When the attempt started (RFC3339 format)
    pub started_at: String,
    pub message: String,
}

/// Lifecycle of a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Still connecting; check pending_prompts for questions to answer
    Pending,
    /// Connected; session_id is set
    Connected,
    /// Gave up; error is set
    Failed,
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptStatus::Pending => write!(f, "pending"),
            AttemptStatus::Connected => write!(f, "connected"),
            AttemptStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A question the connection engine is waiting on
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PendingPromptInfo {
    /// Answer with ssh_respond_prompt or ssh_decline_prompt
    pub prompt_id: String,
    pub title: String,
    pub query_text: String,
    /// `text` expects the text argument, `confirm` the confirm argument
    pub response_type: ResponseType,
    /// query_text is markdown
    pub markdown: bool,
    /// The answer is not secret and may be echoed
    pub public_text: bool,
    /// When the question was asked (RFC3339 format)
    pub asked_at: String,
}

/// Response from ssh_attempt_status
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AttemptStatusResponse {
    pub attempt_id: String,
    pub target: String,
    pub status: AttemptStatus,
    /// Questions waiting for an answer (only while pending)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_prompts: Vec<PendingPromptInfo>,
    /// Session to use once connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Failure description, including the hop being connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The failure was a declined, timed out or cancelled prompt
    #[serde(default)]
    pub user_cancelled: bool,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

/// Response from ssh_respond_prompt and ssh_decline_prompt
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PromptAnswerResponse {
    pub prompt_id: String,
    /// Attempt the prompt belonged to
    pub attempt_id: String,
    pub message: String,
}

/// Response from ssh_cancel_attempt
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CancelAttemptResponse {
    pub attempt_id: String,
    /// Status at the time of the request
    pub status: AttemptStatus,
    /// Whether a pending attempt was actually cancelled
    pub cancelled: bool,
    pub message: String,
}
