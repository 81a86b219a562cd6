//! Storage trait definitions for session and attempt management.
//!
//! These traits define the interface for storage implementations, enabling
//! dependency injection and testability through mocking.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::mcp::types::{AttemptStatus, SessionInfo};

/// Reference to a stored session for read-only access.
pub struct SessionRef<T> {
    pub info: SessionInfo,
    pub transport: Arc<T>,
}

/// Trait for session storage operations.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks. The default implementation uses `DashMap` for lock-free
/// concurrent access.
pub trait SessionStorage<T>: Send + Sync {
    /// Insert a new session into storage, keyed by `info.session_id`.
    fn insert(&self, info: SessionInfo, transport: Arc<T>);

    /// Get a session by ID, returning a clone of its data.
    fn get(&self, session_id: &str) -> Option<SessionRef<T>>;

    /// Remove a session by ID, returning its data if it existed.
    fn remove(&self, session_id: &str) -> Option<SessionRef<T>>;

    /// List all sessions, returning cloned session info.
    fn list(&self) -> Vec<SessionInfo>;

    /// Check if a session exists.
    fn contains(&self, session_id: &str) -> bool;
}

/// Where a connection attempt stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Connected { session_id: String },
    Failed { error: String, user_cancelled: bool },
}

impl AttemptState {
    pub fn status(&self) -> AttemptStatus {
        match self {
            AttemptState::Pending => AttemptStatus::Pending,
            AttemptState::Connected { .. } => AttemptStatus::Connected,
            AttemptState::Failed { .. } => AttemptStatus::Failed,
        }
    }
}

/// Snapshot of one attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt_id: String,
    pub target: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub state: AttemptState,
    pub cancel: CancellationToken,
}

/// Trait for connection attempt storage operations.
pub trait AttemptStorage: Send + Sync {
    /// Register a new pending attempt.
    fn register(&self, attempt_id: String, target: String, cancel: CancellationToken) -> AttemptRecord;

    /// Get an attempt by ID.
    fn get(&self, attempt_id: &str) -> Option<AttemptRecord>;

    /// Record the outcome of a pending attempt. Finished attempts keep their
    /// first outcome.
    fn finish(&self, attempt_id: &str, state: AttemptState);

    /// Cancel a pending attempt's token. Returns the status at the time of
    /// the call, or `None` for an unknown attempt.
    fn cancel(&self, attempt_id: &str) -> Option<AttemptStatus>;

    /// Drop attempts that finished at least `retention` ago. Pending
    /// attempts are never dropped. Returns how many were removed.
    fn prune_finished(&self, retention: Duration) -> usize;
}
