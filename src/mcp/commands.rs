//! MCP SSH Commands implementation.
//!
//! This module provides the MCP tool implementations for establishing SSH
//! connections:
//!
//! - `ssh_connect`: Start a connection attempt in the background
//! - `ssh_attempt_status`: Poll an attempt, including questions it waits on
//! - `ssh_respond_prompt`: Answer a pending question
//! - `ssh_decline_prompt`: Refuse a pending question (cancels the attempt)
//! - `ssh_cancel_attempt`: Cancel a running attempt
//! - `ssh_disconnect`: Disconnect and cleanup a session
//! - `ssh_list_sessions`: List all active sessions

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use poem_mcpserver::{Tools, content::Text, tool::StructuredContent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::PROMPT_BROKER;
use super::error::ToolError;
use super::storage::{
    ATTEMPT_STORAGE, AttemptRecord, AttemptState, AttemptStorage, SESSION_STORAGE, SessionStorage,
};
use super::types::{
    AttemptStatus, AttemptStatusResponse, CancelAttemptResponse, PendingPromptInfo,
    PromptAnswerResponse, SessionInfo, SessionListResponse, SshConnectResponse,
};
use crate::ssh::config::{EngineSettings, resolve_settings_file, resolve_ssh_config_files};
use crate::ssh::ssh_config::SshConfigStore;
use crate::ssh::{
    AttemptContext, Connection, ConnKeywords, Engine, PersistedSettings, Resolver, RusshConnector,
    SshTransport,
};

/// How long a finished attempt stays visible to `ssh_attempt_status`.
const FINISHED_ATTEMPT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Engine shared by every attempt; configured from the environment.
static ENGINE: Lazy<Engine<RusshConnector>> = Lazy::new(build_engine);

fn build_engine() -> Engine<RusshConnector> {
    let store = SshConfigStore::load(resolve_ssh_config_files());
    let settings = match resolve_settings_file() {
        Some(path) => PersistedSettings::load(&path).unwrap_or_else(|e| {
            warn!("Ignoring persisted settings: {}", e);
            PersistedSettings::default()
        }),
        None => PersistedSettings::default(),
    };
    let engine_settings = EngineSettings::from_env();
    info!(
        "Connection engine ready (connect timeout {:?}, prompt timeout {:?}, {} retries)",
        engine_settings.connect_timeout, engine_settings.prompt_timeout, engine_settings.max_retries
    );
    Engine::new(
        RusshConnector,
        Resolver::new(Arc::new(store), Arc::new(settings)),
        engine_settings,
    )
}

/// Caller options as engine keywords. Unset values stay empty.
fn caller_keywords(
    user: Option<String>,
    port: Option<u16>,
    identity_files: Option<Vec<String>>,
) -> ConnKeywords {
    ConnKeywords {
        user: user.map(|u| u.trim().to_string()).unwrap_or_default(),
        port: port.unwrap_or(0),
        identity_files: identity_files
            .unwrap_or_default()
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect(),
        ..ConnKeywords::default()
    }
}

fn session_info(attempt_id: &str, connection: &Connection<SshTransport>) -> SessionInfo {
    SessionInfo {
        session_id: Uuid::new_v4().to_string(),
        label: connection.transport.label().to_string(),
        remote: connection.transport.remote().to_string(),
        route: connection.transport.route(),
        depth: connection.depth,
        retry_attempts: connection.retries,
        attempt_id: attempt_id.to_string(),
        connected_at: chrono::Utc::now().to_rfc3339(),
    }
}

fn status_response(record: AttemptRecord, pending_prompts: Vec<PendingPromptInfo>) -> AttemptStatusResponse {
    let status = record.state.status();
    let (session_id, error, user_cancelled) = match record.state {
        AttemptState::Pending => (None, None, false),
        AttemptState::Connected { session_id } => (Some(session_id), None, false),
        AttemptState::Failed {
            error,
            user_cancelled,
        } => (None, Some(error), user_cancelled),
    };
    AttemptStatusResponse {
        attempt_id: record.attempt_id,
        target: record.target,
        status,
        pending_prompts: if status == AttemptStatus::Pending {
            pending_prompts
        } else {
            Vec::new()
        },
        session_id,
        error,
        user_cancelled,
        started_at: record.started_at,
        finished_at: record.finished_at,
    }
}

/// Drive one attempt to completion and record the outcome.
async fn run_attempt(attempt_id: String, target: String, caller: ConnKeywords, ctx: AttemptContext) {
    let result = ENGINE.connect_with_retry(&target, &caller, &ctx).await;
    PROMPT_BROKER.discard_attempt(&attempt_id);

    match result {
        Ok(connection) => {
            let info = session_info(&attempt_id, &connection);
            let session_id = info.session_id.clone();
            info!(
                "Attempt {} connected to {} as session {}",
                attempt_id, info.label, session_id
            );
            SESSION_STORAGE.insert(info, connection.transport);
            ATTEMPT_STORAGE.finish(&attempt_id, AttemptState::Connected { session_id });
        }
        Err(e) => {
            error!("Attempt {} to {} failed: {}", attempt_id, target, e);
            ATTEMPT_STORAGE.finish(
                &attempt_id,
                AttemptState::Failed {
                    error: e.to_string(),
                    user_cancelled: e.is_user_cancelled(),
                },
            );
        }
    }
}

/// MCP SSH Commands tool implementation.
///
/// Connection attempts run in the background so that the engine can ask
/// questions (passphrases, passwords, one-time codes, unknown host keys)
/// while the caller keeps control: poll `ssh_attempt_status`, answer with
/// `ssh_respond_prompt`, and collect the `session_id` once connected.
pub struct McpSSHCommands;

#[Tools]
impl McpSSHCommands {
    /// Start connecting to an SSH server; returns an attempt_id to poll.
    ///
    /// Host aliases, ProxyJump chains, identity files and known_hosts come
    /// from the local ssh_config. The attempt may stop to ask questions;
    /// they show up under `pending_prompts` in `ssh_attempt_status`.
    async fn ssh_connect(
        &self,
        /// Target in the form "[user@]host[:port]"; host may be an ssh_config alias
        target: String,
        /// Login name when the target does not include one
        user: Option<String>,
        /// Port when the target does not include one
        port: Option<u16>,
        /// Extra private key files to try before the ones from ssh_config
        identity_files: Option<Vec<String>>,
    ) -> Result<StructuredContent<SshConnectResponse>, String> {
        let target = target.trim().to_string();
        let caller = caller_keywords(user, port, identity_files);
        Engine::<RusshConnector>::target_hop(&target, &caller)
            .map_err(|e| ToolError::InvalidTarget(target.clone(), e.kind().to_string()).to_string())?;

        let pruned = ATTEMPT_STORAGE.prune_finished(FINISHED_ATTEMPT_RETENTION);
        if pruned > 0 {
            debug!("Dropped {} finished connection attempts", pruned);
        }

        let attempt_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let record = ATTEMPT_STORAGE.register(attempt_id.clone(), target.clone(), cancel.clone());
        let ctx = AttemptContext::new(PROMPT_BROKER.input_for(&attempt_id), cancel);

        info!("Starting connection attempt {} to {}", attempt_id, target);
        tokio::spawn(run_attempt(attempt_id.clone(), target.clone(), caller, ctx));

        Ok(StructuredContent(SshConnectResponse {
            message: format!(
                "Connecting to {}. Poll ssh_attempt_status with attempt_id '{}' and answer any pending prompts.",
                target, attempt_id
            ),
            attempt_id,
            target,
            started_at: record.started_at,
        }))
    }

    /// Get the status of a connection attempt.
    ///
    /// `pending` attempts list the questions they are waiting on;
    /// `connected` attempts carry the session_id; `failed` attempts carry
    /// the error and whether it came from a declined or cancelled prompt.
    async fn ssh_attempt_status(
        &self,
        /// Attempt ID returned by ssh_connect
        attempt_id: String,
    ) -> Result<StructuredContent<AttemptStatusResponse>, String> {
        let record = ATTEMPT_STORAGE
            .get(&attempt_id)
            .ok_or_else(|| ToolError::UnknownAttempt(attempt_id.clone()).to_string())?;
        let pending = PROMPT_BROKER.pending(&attempt_id);
        Ok(StructuredContent(status_response(record, pending)))
    }

    /// Answer a pending prompt.
    ///
    /// Text prompts (passphrases, passwords, codes) take `text`; host key
    /// confirmations take `confirm`.
    async fn ssh_respond_prompt(
        &self,
        /// Prompt ID from ssh_attempt_status
        prompt_id: String,
        /// Answer for text prompts
        text: Option<String>,
        /// Answer for confirmation prompts
        confirm: Option<bool>,
    ) -> Result<StructuredContent<PromptAnswerResponse>, String> {
        let attempt_id = PROMPT_BROKER
            .respond(&prompt_id, text, confirm)
            .map_err(|e| e.to_string())?;
        Ok(StructuredContent(PromptAnswerResponse {
            message: format!("Answer delivered to attempt {}", attempt_id),
            prompt_id,
            attempt_id,
        }))
    }

    /// Decline a pending prompt. The attempt fails as cancelled by the user.
    async fn ssh_decline_prompt(
        &self,
        /// Prompt ID from ssh_attempt_status
        prompt_id: String,
    ) -> Result<StructuredContent<PromptAnswerResponse>, String> {
        let attempt_id = PROMPT_BROKER.decline(&prompt_id).map_err(|e| e.to_string())?;
        Ok(StructuredContent(PromptAnswerResponse {
            message: format!("Prompt declined; attempt {} will stop", attempt_id),
            prompt_id,
            attempt_id,
        }))
    }

    /// Cancel a pending connection attempt, ending its prompts and dials.
    async fn ssh_cancel_attempt(
        &self,
        /// Attempt ID returned by ssh_connect
        attempt_id: String,
    ) -> Result<StructuredContent<CancelAttemptResponse>, String> {
        let status = ATTEMPT_STORAGE
            .cancel(&attempt_id)
            .ok_or_else(|| ToolError::UnknownAttempt(attempt_id.clone()).to_string())?;

        let cancelled = status == AttemptStatus::Pending;
        let message = if cancelled {
            info!("Cancelled connection attempt {}", attempt_id);
            format!("Attempt {} cancelled", attempt_id)
        } else {
            format!("Attempt {} already {}", attempt_id, status)
        };
        Ok(StructuredContent(CancelAttemptResponse {
            attempt_id,
            status,
            cancelled,
            message,
        }))
    }

    /// Disconnect an SSH session and remove it from storage.
    async fn ssh_disconnect(
        &self,
        /// Session ID to disconnect
        session_id: String,
    ) -> Result<Text<String>, String> {
        info!("Disconnecting SSH session: {}", session_id);

        let stored = SESSION_STORAGE
            .remove(&session_id)
            .ok_or_else(|| ToolError::UnknownSession(session_id.clone()).to_string())?;
        if let Err(e) = stored.transport.disconnect().await {
            warn!("Error during disconnect: {}", e);
        }
        Ok(Text(format!(
            "Session {} ({}) disconnected successfully",
            session_id, stored.info.label
        )))
    }

    /// List all active SSH sessions with their metadata.
    ///
    /// Sessions whose transport has closed are removed from storage first.
    async fn ssh_list_sessions(&self) -> StructuredContent<SessionListResponse> {
        for info in SESSION_STORAGE.list() {
            let closed = SESSION_STORAGE
                .get(&info.session_id)
                .is_some_and(|stored| stored.transport.is_closed());
            if closed {
                warn!("Session {} is closed, removing", info.session_id);
                SESSION_STORAGE.remove(&info.session_id);
            }
        }

        let sessions = SESSION_STORAGE.list();
        StructuredContent(SessionListResponse {
            count: sessions.len(),
            sessions,
        })
    }
}
