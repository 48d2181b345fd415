//! Pending-request table.
//!
//! One record per in-flight invoke, keyed by `(repeater connection,
//! request_id)`, carrying a back-pointer to the originating agent
//! connection and a wall-clock deadline. The table also enforces the
//! request-id uniqueness contract: a request id may be used at most once
//! per agent connection for the lifetime of that connection, even after
//! its request completes.
//!
//! The table is a bounded in-memory store. Per-agent in-flight counts and
//! per-connection remembered-id counts both carry hard caps; exceeding a
//! cap fails the offending request rather than growing without limit.

use std::collections::{HashMap, HashSet};

use tokio::time::Instant;
use turret_core::protocol::ErrorCode;

use crate::connection::ConnectionId;

/// Rejections from [`PendingTable::insert`].
#[derive(Debug, thiserror::Error)]
pub enum PendingError {
    /// The request id was already used on this agent connection.
    #[error("request id already used on this connection")]
    DuplicateRequestId,

    /// The agent connection is at its in-flight cap.
    #[error("agent connection has {max} requests in flight")]
    AgentSaturated {
        /// Configured cap.
        max: usize,
    },

    /// The per-connection used-id bookkeeping is full.
    #[error("request id bookkeeping full ({max} ids remembered)")]
    BookkeepingFull {
        /// Configured cap.
        max: usize,
    },
}

impl PendingError {
    /// Maps the rejection onto its wire error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::DuplicateRequestId => ErrorCode::BadRequest,
            Self::AgentSaturated { .. } | Self::BookkeepingFull { .. } => ErrorCode::Internal,
        }
    }
}

/// One in-flight invoke.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Correlation id from the agent's invoke.
    pub request_id: Vec<u8>,
    /// Originating agent connection.
    pub agent: ConnectionId,
    /// Repeater connection the invoke was forwarded to.
    pub repeater: ConnectionId,
    /// Action name, for diagnostics.
    pub action: String,
    /// Wall-clock deadline after which the request fails `INTERNAL`.
    pub deadline: Instant,
}

/// Dispatcher-owned table of in-flight invokes.
#[derive(Debug)]
pub struct PendingTable {
    max_per_agent: usize,
    max_ids_per_connection: usize,
    entries: HashMap<(ConnectionId, Vec<u8>), PendingRequest>,
    in_flight: HashMap<ConnectionId, usize>,
    used_ids: HashMap<ConnectionId, HashSet<Vec<u8>>>,
}

impl PendingTable {
    /// Creates a table with the given caps.
    #[must_use]
    pub fn new(max_per_agent: usize, max_ids_per_connection: usize) -> Self {
        Self {
            max_per_agent,
            max_ids_per_connection,
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            used_ids: HashMap::new(),
        }
    }

    /// Number of in-flight requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no requests are in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a new in-flight invoke.
    pub fn insert(
        &mut self,
        agent: ConnectionId,
        repeater: ConnectionId,
        request_id: Vec<u8>,
        action: String,
        deadline: Instant,
    ) -> Result<(), PendingError> {
        let used = self.used_ids.entry(agent).or_default();
        if used.contains(&request_id) {
            return Err(PendingError::DuplicateRequestId);
        }
        if used.len() >= self.max_ids_per_connection {
            return Err(PendingError::BookkeepingFull {
                max: self.max_ids_per_connection,
            });
        }
        let in_flight = self.in_flight.entry(agent).or_insert(0);
        if *in_flight >= self.max_per_agent {
            return Err(PendingError::AgentSaturated {
                max: self.max_per_agent,
            });
        }

        used.insert(request_id.clone());
        *in_flight += 1;
        self.entries.insert(
            (repeater, request_id.clone()),
            PendingRequest {
                request_id,
                agent,
                repeater,
                action,
                deadline,
            },
        );
        Ok(())
    }

    /// Completes a request by its `(repeater, request_id)` key.
    ///
    /// Returns `None` when no such request is pending (a late, duplicate,
    /// or fabricated reply).
    pub fn complete(&mut self, repeater: ConnectionId, request_id: &[u8]) -> Option<PendingRequest> {
        let entry = self.entries.remove(&(repeater, request_id.to_vec()))?;
        self.decrement(entry.agent);
        Some(entry)
    }

    /// Fails every request forwarded to `repeater`; returns the records.
    pub fn fail_repeater(&mut self, repeater: ConnectionId) -> Vec<PendingRequest> {
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|(conn, _)| *conn == repeater)
            .cloned()
            .collect();
        let mut failed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.entries.remove(&key) {
                self.decrement(entry.agent);
                failed.push(entry);
            }
        }
        failed
    }

    /// Forgets every request and all id bookkeeping for a lost agent
    /// connection. Late repeater replies will then miss the table.
    pub fn drop_agent(&mut self, agent: ConnectionId) -> usize {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.agent == agent)
            .map(|(key, _)| key.clone())
            .collect();
        let dropped = keys.len();
        for key in keys {
            self.entries.remove(&key);
        }
        self.in_flight.remove(&agent);
        self.used_ids.remove(&agent);
        dropped
    }

    /// Removes and returns every request whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingRequest> {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let mut expired = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.entries.remove(&key) {
                self.decrement(entry.agent);
                expired.push(entry);
            }
        }
        expired
    }

    /// Drains every pending request (disengage).
    pub fn drain_all(&mut self) -> Vec<PendingRequest> {
        self.in_flight.clear();
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    fn decrement(&mut self, agent: ConnectionId) {
        if let Some(count) = self.in_flight.get_mut(&agent) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn insert_and_complete() {
        let mut table = PendingTable::new(8, 64);
        let agent = ConnectionId::new(1);
        let repeater = ConnectionId::new(2);

        table
            .insert(agent, repeater, b"r1".to_vec(), "echo".into(), deadline())
            .unwrap();
        assert_eq!(table.len(), 1);

        let entry = table.complete(repeater, b"r1").unwrap();
        assert_eq!(entry.agent, agent);
        assert!(table.is_empty());

        // A second completion finds nothing.
        assert!(table.complete(repeater, b"r1").is_none());
    }

    #[test]
    fn request_id_is_single_use_even_after_completion() {
        let mut table = PendingTable::new(8, 64);
        let agent = ConnectionId::new(1);
        let repeater = ConnectionId::new(2);

        table
            .insert(agent, repeater, b"r1".to_vec(), "echo".into(), deadline())
            .unwrap();
        table.complete(repeater, b"r1").unwrap();

        let err = table
            .insert(agent, repeater, b"r1".to_vec(), "echo".into(), deadline())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[test]
    fn per_agent_in_flight_cap() {
        let mut table = PendingTable::new(2, 64);
        let agent = ConnectionId::new(1);
        let repeater = ConnectionId::new(2);

        table
            .insert(agent, repeater, b"r1".to_vec(), "echo".into(), deadline())
            .unwrap();
        table
            .insert(agent, repeater, b"r2".to_vec(), "echo".into(), deadline())
            .unwrap();
        let err = table
            .insert(agent, repeater, b"r3".to_vec(), "echo".into(), deadline())
            .unwrap_err();
        assert!(matches!(err, PendingError::AgentSaturated { max: 2 }));
        assert_eq!(err.code(), ErrorCode::Internal);

        // Completing one frees a slot.
        table.complete(repeater, b"r1").unwrap();
        table
            .insert(agent, repeater, b"r4".to_vec(), "echo".into(), deadline())
            .unwrap();
    }

    #[test]
    fn used_id_bookkeeping_cap() {
        let mut table = PendingTable::new(64, 2);
        let agent = ConnectionId::new(1);
        let repeater = ConnectionId::new(2);

        for id in [b"r1".to_vec(), b"r2".to_vec()] {
            table
                .insert(agent, repeater, id.clone(), "echo".into(), deadline())
                .unwrap();
            table.complete(repeater, &id).unwrap();
        }
        let err = table
            .insert(agent, repeater, b"r3".to_vec(), "echo".into(), deadline())
            .unwrap_err();
        assert!(matches!(err, PendingError::BookkeepingFull { max: 2 }));
    }

    #[test]
    fn fail_repeater_returns_only_its_requests() {
        let mut table = PendingTable::new(8, 64);
        let agent = ConnectionId::new(1);
        let rep_a = ConnectionId::new(2);
        let rep_b = ConnectionId::new(3);

        table
            .insert(agent, rep_a, b"r1".to_vec(), "echo".into(), deadline())
            .unwrap();
        table
            .insert(agent, rep_b, b"r2".to_vec(), "scan".into(), deadline())
            .unwrap();

        let failed = table.fail_repeater(rep_a);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].request_id, b"r1".to_vec());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn drop_agent_forgets_requests_and_ids() {
        let mut table = PendingTable::new(8, 64);
        let agent = ConnectionId::new(1);
        let repeater = ConnectionId::new(2);

        table
            .insert(agent, repeater, b"r1".to_vec(), "echo".into(), deadline())
            .unwrap();
        assert_eq!(table.drop_agent(agent), 1);
        assert!(table.is_empty());

        // Late reply finds nothing.
        assert!(table.complete(repeater, b"r1").is_none());
    }

    #[test]
    fn expire_removes_overdue_requests() {
        let mut table = PendingTable::new(8, 64);
        let agent = ConnectionId::new(1);
        let repeater = ConnectionId::new(2);
        let now = Instant::now();

        table
            .insert(agent, repeater, b"r1".to_vec(), "echo".into(), now)
            .unwrap();
        table
            .insert(
                agent,
                repeater,
                b"r2".to_vec(),
                "echo".into(),
                now + Duration::from_secs(60),
            )
            .unwrap();

        let expired = table.expire(now + Duration::from_millis(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request_id, b"r1".to_vec());
        assert_eq!(table.len(), 1);

        // Late reply to the expired request is unknown.
        assert!(table.complete(repeater, b"r1").is_none());
    }

    #[test]
    fn drain_all_empties_the_table() {
        let mut table = PendingTable::new(8, 64);
        table
            .insert(
                ConnectionId::new(1),
                ConnectionId::new(2),
                b"r1".to_vec(),
                "echo".into(),
                deadline(),
            )
            .unwrap();
        assert_eq!(table.drain_all().len(), 1);
        assert!(table.is_empty());
    }
}
