//! Session lifecycle state machine
//!
//! A sync session moves through `Initializing → Syncing → Stopping → Stopped`.
//! A session whose initial copy fails goes straight from `Initializing` to
//! `Stopped`. Every other transition is rejected with
//! [`DomainError::InvalidState`].

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Lifecycle state of a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, initial copy not yet finished
    Initializing,
    /// Watching local changes and propagating them
    Syncing,
    /// No longer accepting events; draining pending work
    Stopping,
    /// All work drained and resources released
    Stopped,
}

impl SessionState {
    /// Returns true if moving from `self` to `target` is allowed
    #[must_use]
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, target),
            (Initializing, Syncing)
                | (Initializing, Stopped)
                | (Syncing, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Validates and performs a transition
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` if the transition is not allowed
    pub fn transition_to(self, target: SessionState) -> Result<SessionState, DomainError> {
        if self.can_transition_to(&target) {
            Ok(target)
        } else {
            Err(DomainError::InvalidState {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Returns true once the session has fully stopped
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Initializing => write!(f, "initializing"),
            SessionState::Syncing => write!(f, "syncing"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time counters for a running or finished session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Objects copied from remote during the initial sync
    pub files_downloaded: u64,
    /// Raw change events accepted by the coalescer
    pub events_received: u64,
    /// Pending syncs handed to the upload scheduler
    pub syncs_scheduled: u64,
    /// Successful uploads
    pub files_uploaded: u64,
    /// Successful remote deletions
    pub files_deleted: u64,
    /// Transient failures that were retried
    pub retries: u64,
    /// Retries abandoned because a newer state of the path arrived
    pub retries_superseded: u64,
    /// Paths that permanently failed to sync
    pub failures: u64,
}
