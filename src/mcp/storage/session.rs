//! DashMap-based session storage implementation.
//!
//! Provides lock-free concurrent access to established SSH sessions using
//! `DashMap`.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::mcp::types::SessionInfo;
use crate::ssh::SshTransport;

use super::traits::{SessionRef, SessionStorage};

/// Stored session data combining metadata with the transport.
pub struct StoredSession<T> {
    pub info: SessionInfo,
    pub transport: Arc<T>,
}

/// DashMap-based implementation of `SessionStorage`.
pub struct DashMapSessionStorage<T> {
    sessions: DashMap<String, StoredSession<T>>,
}

impl<T> DashMapSessionStorage<T> {
    /// Create a new session storage instance.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }
}

impl<T> Default for DashMapSessionStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync> SessionStorage<T> for DashMapSessionStorage<T> {
    fn insert(&self, info: SessionInfo, transport: Arc<T>) {
        self.sessions
            .insert(info.session_id.clone(), StoredSession { info, transport });
    }

    fn get(&self, session_id: &str) -> Option<SessionRef<T>> {
        self.sessions.get(session_id).map(|entry| SessionRef {
            info: entry.info.clone(),
            transport: entry.transport.clone(),
        })
    }

    fn remove(&self, session_id: &str) -> Option<SessionRef<T>> {
        self.sessions
            .remove(session_id)
            .map(|(_, stored)| SessionRef {
                info: stored.info,
                transport: stored.transport,
            })
    }

    fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        sessions
    }

    fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }
}

/// Global session storage instance.
pub static SESSION_STORAGE: Lazy<DashMapSessionStorage<SshTransport>> =
    Lazy::new(DashMapSessionStorage::new);
