//! DashMap-based connection attempt storage.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mcp::types::AttemptStatus;

use super::traits::{AttemptRecord, AttemptState, AttemptStorage};

/// DashMap-based implementation of `AttemptStorage`.
pub struct DashMapAttemptStorage {
    attempts: DashMap<String, AttemptRecord>,
}

impl DashMapAttemptStorage {
    pub fn new() -> Self {
        Self {
            attempts: DashMap::new(),
        }
    }
}

impl Default for DashMapAttemptStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl AttemptStorage for DashMapAttemptStorage {
    fn register(&self, attempt_id: String, target: String, cancel: CancellationToken) -> AttemptRecord {
        let record = AttemptRecord {
            attempt_id: attempt_id.clone(),
            target,
            started_at: Utc::now().to_rfc3339(),
            finished_at: None,
            state: AttemptState::Pending,
            cancel,
        };
        self.attempts.insert(attempt_id, record.clone());
        record
    }

    fn get(&self, attempt_id: &str) -> Option<AttemptRecord> {
        self.attempts.get(attempt_id).map(|entry| entry.clone())
    }

    fn finish(&self, attempt_id: &str, state: AttemptState) {
        if let Some(mut entry) = self.attempts.get_mut(attempt_id) {
            if entry.state != AttemptState::Pending {
                debug!("Attempt {} already finished as {}", attempt_id, entry.state.status());
                return;
            }
            entry.state = state;
            entry.finished_at = Some(Utc::now().to_rfc3339());
        }
    }

    fn cancel(&self, attempt_id: &str) -> Option<AttemptStatus> {
        let entry = self.attempts.get(attempt_id)?;
        let status = entry.state.status();
        if status == AttemptStatus::Pending {
            entry.cancel.cancel();
        }
        Some(status)
    }

    fn prune_finished(&self, retention: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(retention) {
            Ok(retention) => Utc::now() - retention,
            Err(_) => return 0,
        };
        let before = self.attempts.len();
        self.attempts.retain(|_, record| {
            match record.finished_at.as_deref().map(DateTime::parse_from_rfc3339) {
                Some(Ok(finished)) => finished > cutoff,
                _ => true,
            }
        });
        before.saturating_sub(self.attempts.len())
    }
}

/// Global attempt storage instance.
pub static ATTEMPT_STORAGE: Lazy<DashMapAttemptStorage> = Lazy::new(DashMapAttemptStorage::new);
