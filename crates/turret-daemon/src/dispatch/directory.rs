//! Action/repeater directory: static ownership plus live bindings.
//!
//! The static side (`action → repeater_id`) comes from the bunker and never
//! changes during an engagement. The dynamic side binds each action to the
//! one live repeater connection that has registered it. Registration is
//! all-or-nothing: every advertised name is validated before any binding is
//! committed, and a single error describes the first violation.

use std::collections::HashMap;

use turret_core::policy::PolicyIndex;
use turret_core::protocol::ErrorCode;

use crate::connection::ConnectionId;

/// Registration failures, in the order names are checked.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    /// Advertised action does not exist in the bunker.
    #[error("unknown action '{action}'")]
    UnknownAction {
        /// The offending name.
        action: String,
    },

    /// Advertised action belongs to a different repeater.
    #[error("action '{action}' is not owned by repeater '{repeater}'")]
    NotOwner {
        /// The offending name.
        action: String,
        /// The registering repeater.
        repeater: String,
    },

    /// Advertised action is already live under another connection, or was
    /// listed twice in the same register.
    #[error("action '{action}' is already registered")]
    AlreadyLive {
        /// The offending name.
        action: String,
    },
}

impl RegisterError {
    /// Maps the violation onto its wire error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownAction { .. } => ErrorCode::UnknownAction,
            Self::NotOwner { .. } => ErrorCode::Denied,
            Self::AlreadyLive { .. } => ErrorCode::BadRequest,
        }
    }
}

/// Tracks which actions are live under which repeater connection.
#[derive(Debug, Default)]
pub struct ActionDirectory {
    /// action → live repeater connection.
    live: HashMap<String, ConnectionId>,
    /// repeater connection → actions it has registered.
    by_connection: HashMap<ConnectionId, Vec<String>>,
}

impl ActionDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and applies a registration.
    ///
    /// Checks every advertised name in order (existence, ownership,
    /// collision) and commits bindings only when all pass. On error no
    /// state changes.
    pub fn register(
        &mut self,
        policy: &PolicyIndex,
        conn: ConnectionId,
        repeater: &str,
        actions: &[String],
    ) -> Result<(), RegisterError> {
        let mut batch: Vec<&String> = Vec::with_capacity(actions.len());
        for action in actions {
            let Some(owner) = policy.action_owner(action) else {
                return Err(RegisterError::UnknownAction {
                    action: action.clone(),
                });
            };
            if owner != repeater {
                return Err(RegisterError::NotOwner {
                    action: action.clone(),
                    repeater: repeater.to_string(),
                });
            }
            if self.live.contains_key(action) || batch.iter().any(|seen| *seen == action) {
                return Err(RegisterError::AlreadyLive {
                    action: action.clone(),
                });
            }
            batch.push(action);
        }

        for action in batch {
            self.live.insert(action.clone(), conn);
        }
        self.by_connection
            .insert(conn, actions.to_vec());
        Ok(())
    }

    /// Returns the live repeater connection for `action`, if any.
    #[must_use]
    pub fn live_repeater(&self, action: &str) -> Option<ConnectionId> {
        self.live.get(action).copied()
    }

    /// Clears every binding held by `conn`, returning the freed names.
    pub fn unbind(&mut self, conn: ConnectionId) -> Vec<String> {
        let Some(actions) = self.by_connection.remove(&conn) else {
            return Vec::new();
        };
        for action in &actions {
            // Only remove bindings that still point at this connection.
            if self.live.get(action) == Some(&conn) {
                self.live.remove(action);
            }
        }
        actions
    }

    /// Number of live action bindings.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}
