//! The dispatcher: the state machine at the center of the gate.
//!
//! A single task owns every piece of mutable dispatch state: the replay
//! window, the action directory, the pending-request table, and the
//! connection registry. Connection read loops feed it events over a
//! bounded channel and never touch the state directly, so all policy reads
//! and binding mutations are serialized by construction.
//!
//! For every inbound envelope the dispatcher decodes, authenticates
//! (principal resolution, signature, anti-replay, principal pinning),
//! classifies by listener, and then routes: `register` binds actions,
//! `invoke` is authorized and forwarded to the owning live repeater,
//! `result`/`error` are correlated back to the originating agent by
//! `(repeater connection, request id)`. Replies reach an agent in the
//! order the dispatcher receives them from repeaters; nothing is
//! reordered, coalesced, batched, or retried.
//!
//! Outbound writes go through each connection's writer queue with
//! `try_send`, so the dispatcher never blocks on a peer while holding its
//! state.

pub mod directory;
pub mod pending;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use turret_core::crypto;
use turret_core::policy::{PolicyIndex, PrincipalClass};
use turret_core::protocol::{
    Envelope, ErrorBody, ErrorCode, InvokeBody, MessageType, RegisterBody, ResultBody,
};
use turret_core::replay::{ReplayError, ReplayWindow};

use crate::connection::{ConnectionHandle, ConnectionId, SocketClass};
use directory::ActionDirectory;
use pending::PendingTable;

/// Tunable limits and timings for one engagement.
///
/// Every bound is finite; the defaults are the documented caps.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Anti-replay timestamp tolerance in milliseconds.
    pub replay_window_ms: u64,
    /// Hard cap on retained `(principal, nonce)` entries.
    pub max_replay_entries: usize,
    /// Maximum concurrent connections per listener.
    pub max_connections: usize,
    /// Maximum in-flight invokes per agent connection.
    pub max_pending_per_agent: usize,
    /// Maximum request ids remembered per agent connection.
    pub max_request_ids_per_connection: usize,
    /// Outbound writer queue depth per connection, in frames.
    pub writer_queue_depth: usize,
    /// Dispatcher event queue depth, in events.
    pub event_queue_depth: usize,
    /// Wall-clock budget for a forwarded invoke.
    pub pending_deadline: Duration,
    /// Cadence of the deadline sweep.
    pub sweep_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            replay_window_ms: turret_core::replay::REPLAY_WINDOW_MS,
            max_replay_entries: turret_core::replay::MAX_REPLAY_ENTRIES,
            max_connections: 256,
            max_pending_per_agent: 128,
            max_request_ids_per_connection: 8192,
            writer_queue_depth: 64,
            event_queue_depth: 1024,
            pending_deadline: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// The gate's own outbound identity.
///
/// Without a signing key, turret-originated envelopes carry a zero
/// signature; receivers treat them as best-effort diagnostics until a gate
/// principal is provisioned.
pub struct GateIdentity {
    /// Principal bytes stamped on gate-originated envelopes.
    pub principal: Vec<u8>,
    /// Optional signing key.
    pub signing_key: Option<SigningKey>,
}

impl Default for GateIdentity {
    fn default() -> Self {
        Self {
            principal: b"turret".to_vec(),
            signing_key: None,
        }
    }
}

impl GateIdentity {
    /// Builds a gate-originated envelope around `body`.
    fn envelope(&self, msg_type: MessageType, body: Vec<u8>) -> Envelope {
        let ts_ms = now_ms();
        let nonce: [u8; 16] = rand::random();
        let sig = match &self.signing_key {
            Some(key) => crypto::sign(key, &self.principal, ts_ms, &nonce, &body).to_bytes(),
            None => [0u8; 64],
        };
        Envelope {
            msg_type,
            principal: self.principal.clone(),
            ts_ms,
            nonce: nonce.to_vec(),
            body,
            sig,
        }
    }
}

/// Events fed to the dispatcher by connection tasks.
#[derive(Debug)]
pub enum DispatcherEvent {
    /// A connection was accepted and its tasks are running.
    Connected {
        /// Handle the dispatcher keeps for outbound frames and closing.
        handle: ConnectionHandle,
    },
    /// A complete frame arrived on a connection.
    Frame {
        /// Source connection.
        id: ConnectionId,
        /// Frame payload (one envelope).
        payload: Bytes,
    },
    /// A connection's read loop ended.
    Closed {
        /// The connection that went away.
        id: ConnectionId,
    },
}

/// Principal bound to a connection by its first valid envelope.
#[derive(Debug, Clone)]
struct PinnedPrincipal {
    id: String,
    class: PrincipalClass,
}

/// Dispatcher-side connection state.
struct ConnState {
    handle: ConnectionHandle,
    pinned: Option<PinnedPrincipal>,
    /// Repeater connections only: whether `register` has completed.
    registered: bool,
}

/// The dispatcher actor.
pub struct Dispatcher {
    cfg: DispatcherConfig,
    policy: Arc<PolicyIndex>,
    identity: GateIdentity,
    replay: ReplayWindow,
    directory: ActionDirectory,
    pending: PendingTable,
    conns: HashMap<ConnectionId, ConnState>,
    events: mpsc::Receiver<DispatcherEvent>,
    cancel: CancellationToken,
    conn_cancel: CancellationToken,
}

impl Dispatcher {
    /// Creates the dispatcher and the sender half of its event channel.
    ///
    /// `cancel` is the engagement token; `conn_cancel` is the token the
    /// connection tasks observe. The dispatcher fires `conn_cancel` only
    /// after draining, so disengage failure replies reach the writer
    /// queues before the writers wind down.
    #[must_use]
    pub fn new(
        cfg: DispatcherConfig,
        policy: Arc<PolicyIndex>,
        identity: GateIdentity,
        cancel: CancellationToken,
        conn_cancel: CancellationToken,
    ) -> (Self, mpsc::Sender<DispatcherEvent>) {
        let (tx, rx) = mpsc::channel(cfg.event_queue_depth);
        let dispatcher = Self {
            replay: ReplayWindow::new(cfg.replay_window_ms, cfg.max_replay_entries),
            pending: PendingTable::new(
                cfg.max_pending_per_agent,
                cfg.max_request_ids_per_connection,
            ),
            directory: ActionDirectory::new(),
            conns: HashMap::new(),
            cfg,
            policy,
            identity,
            events: rx,
            cancel,
            conn_cancel,
        };
        (dispatcher, tx)
    }

    /// Runs until cancellation or until every event sender is gone.
    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.cfg.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.drain();
                    self.conn_cancel.cancel();
                    break;
                }
                _ = sweep.tick() => self.sweep_deadlines(),
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
        debug!("dispatcher stopped");
    }

    fn handle_event(&mut self, event: DispatcherEvent) {
        match event {
            DispatcherEvent::Connected { handle } => {
                debug!(conn = %handle.id, class = %handle.class, "connection up");
                self.conns.insert(
                    handle.id,
                    ConnState {
                        handle,
                        pinned: None,
                        registered: false,
                    },
                );
            }
            DispatcherEvent::Frame { id, payload } => self.handle_frame(id, &payload),
            DispatcherEvent::Closed { id } => self.handle_closed(id),
        }
    }

    fn handle_closed(&mut self, id: ConnectionId) {
        let Some(state) = self.conns.remove(&id) else {
            return;
        };
        debug!(conn = %id, class = %state.handle.class, "connection down");

        match state.handle.class {
            SocketClass::Repeater => {
                let freed = self.directory.unbind(id);
                if !freed.is_empty() {
                    info!(conn = %id, actions = freed.len(), "cleared action bindings");
                }
                for entry in self.pending.fail_repeater(id) {
                    self.send_error(
                        entry.agent,
                        &entry.request_id,
                        ErrorCode::NoRepeater,
                        "repeater disconnected",
                    );
                }
            }
            SocketClass::Agent => {
                let dropped = self.pending.drop_agent(id);
                if dropped > 0 {
                    debug!(conn = %id, dropped, "forgot pending requests for lost agent");
                }
            }
        }
    }

    fn handle_frame(&mut self, id: ConnectionId, payload: &Bytes) {
        if !self.conns.contains_key(&id) {
            return;
        }

        let env = match Envelope::decode(payload) {
            Ok(env) => env,
            Err(error) => {
                // No request id is recoverable from an undecodable
                // envelope; close without reply.
                warn!(conn = %id, %error, "undecodable envelope, closing connection");
                self.close(id);
                return;
            }
        };

        let Some(pinned) = self.authenticate(id, &env) else {
            return;
        };

        let class = match self.conns.get(&id) {
            Some(state) => state.handle.class,
            None => return,
        };

        match (class, env.msg_type) {
            (SocketClass::Agent, MessageType::Invoke)
                if pinned.class == PrincipalClass::Agent =>
            {
                self.handle_invoke(id, &pinned.id, &env);
            }
            (SocketClass::Repeater, MessageType::Register)
                if pinned.class == PrincipalClass::Repeater =>
            {
                self.handle_register(id, &pinned.id, &env);
            }
            (SocketClass::Repeater, MessageType::Result | MessageType::Error)
                if pinned.class == PrincipalClass::Repeater =>
            {
                self.handle_reply(id, &env);
            }
            (class, msg_type) => {
                warn!(
                    conn = %id,
                    %class,
                    principal = %pinned.id,
                    ?msg_type,
                    "message type not admissible on this socket"
                );
                let request_id = recover_request_id(&env);
                self.send_error(
                    id,
                    &request_id,
                    ErrorCode::BadRequest,
                    "message type not admissible on this socket",
                );
            }
        }
    }

    /// Authenticates one envelope: principal resolution, pinning,
    /// signature, anti-replay. Returns the (possibly just-pinned)
    /// principal, or `None` after an error reply.
    fn authenticate(&mut self, id: ConnectionId, env: &Envelope) -> Option<PinnedPrincipal> {
        let request_id = recover_request_id(env);

        let Ok(principal_id) = std::str::from_utf8(&env.principal) else {
            self.send_error(
                id,
                &request_id,
                ErrorCode::Unauthenticated,
                "principal is not valid UTF-8",
            );
            return None;
        };

        let Some(principal) = self.policy.principal(principal_id) else {
            debug!(conn = %id, principal = %principal_id, "unknown principal");
            self.send_error(id, &request_id, ErrorCode::Unauthenticated, "unknown principal");
            return None;
        };
        let principal_class = principal.class;
        let principal_key = principal.key;

        let was_pinned = {
            let state = self.conns.get(&id)?;
            if let Some(pinned) = &state.pinned {
                if pinned.id != principal_id {
                    warn!(
                        conn = %id,
                        pinned = %pinned.id,
                        claimed = %principal_id,
                        "principal mismatch on pinned connection"
                    );
                    self.send_error(
                        id,
                        &request_id,
                        ErrorCode::Unauthenticated,
                        "principal does not match this connection",
                    );
                    return None;
                }
                true
            } else {
                false
            }
        };

        if crypto::verify(
            &principal_key,
            &env.principal,
            env.ts_ms,
            &env.nonce,
            &env.body,
            &env.signature(),
        )
        .is_err()
        {
            warn!(conn = %id, principal = %principal_id, "bad signature");
            self.send_error(id, &request_id, ErrorCode::Unauthenticated, "bad signature");
            // After the first authenticated envelope has bound the peer,
            // a verification failure is fatal for the connection.
            if was_pinned {
                self.close(id);
            }
            return None;
        }

        match self
            .replay
            .check_and_record(now_ms(), env.ts_ms, &env.principal, &env.nonce)
        {
            Ok(()) => {}
            Err(error @ (ReplayError::SkewExceeded { .. } | ReplayError::Duplicate)) => {
                debug!(conn = %id, principal = %principal_id, %error, "replay rejection");
                self.send_error(id, &request_id, ErrorCode::Replay, &error.to_string());
                return None;
            }
            Err(error @ ReplayError::CapacityExceeded { .. }) => {
                warn!(conn = %id, %error, "replay window saturated");
                self.send_error(id, &request_id, ErrorCode::Internal, "replay window saturated");
                return None;
            }
        }

        let pinned = PinnedPrincipal {
            id: principal_id.to_string(),
            class: principal_class,
        };
        if !was_pinned {
            if let Some(state) = self.conns.get_mut(&id) {
                debug!(conn = %id, principal = %principal_id, class = %principal_class, "pinned principal");
                state.pinned = Some(pinned.clone());
            }
        }
        Some(pinned)
    }

    fn handle_register(&mut self, id: ConnectionId, repeater: &str, env: &Envelope) {
        if self.conns.get(&id).is_some_and(|state| state.registered) {
            self.send_error(id, &[], ErrorCode::BadRequest, "already registered");
            self.close(id);
            return;
        }

        let body = match RegisterBody::decode(&env.body) {
            Ok(body) => body,
            Err(error) => {
                self.send_error(id, &[], ErrorCode::BadRequest, &error.to_string());
                self.close(id);
                return;
            }
        };

        if body.repeater_id != env.principal {
            self.send_error(
                id,
                &[],
                ErrorCode::BadRequest,
                "register body names a different repeater",
            );
            self.close(id);
            return;
        }

        let mut actions = Vec::with_capacity(body.actions.len());
        for raw in &body.actions {
            match std::str::from_utf8(raw) {
                Ok(name) => actions.push(name.to_string()),
                Err(_) => {
                    self.send_error(
                        id,
                        &[],
                        ErrorCode::UnknownAction,
                        "action name is not valid UTF-8",
                    );
                    self.close(id);
                    return;
                }
            }
        }

        match self.directory.register(&self.policy, id, repeater, &actions) {
            Ok(()) => {
                if let Some(state) = self.conns.get_mut(&id) {
                    state.registered = true;
                }
                info!(conn = %id, %repeater, actions = actions.len(), "repeater registered");
            }
            Err(error) => {
                warn!(conn = %id, %repeater, %error, "registration rejected");
                self.send_error(id, &[], error.code(), &error.to_string());
                self.close(id);
            }
        }
    }

    fn handle_invoke(&mut self, id: ConnectionId, agent: &str, env: &Envelope) {
        let body = match InvokeBody::decode(&env.body) {
            Ok(body) => body,
            Err(error) => {
                // No request id is recoverable from a malformed body;
                // drop the frame and close.
                warn!(conn = %id, %agent, %error, "malformed invoke body");
                self.close(id);
                return;
            }
        };

        let Ok(action) = std::str::from_utf8(&body.action) else {
            self.send_error(
                id,
                &body.request_id,
                ErrorCode::BadRequest,
                "action name is not valid UTF-8",
            );
            return;
        };

        if self.policy.action_owner(action).is_none() {
            self.send_error(id, &body.request_id, ErrorCode::UnknownAction, "unknown action");
            return;
        }

        if !self.policy.allows(agent, action) {
            debug!(conn = %id, %agent, %action, "permission denied");
            self.send_error(id, &body.request_id, ErrorCode::Denied, "denied");
            return;
        }

        let Some(repeater_conn) = self.directory.live_repeater(action) else {
            self.send_error(
                id,
                &body.request_id,
                ErrorCode::NoRepeater,
                "no live repeater for action",
            );
            return;
        };

        let deadline = Instant::now() + self.cfg.pending_deadline;
        if let Err(error) = self.pending.insert(
            id,
            repeater_conn,
            body.request_id.clone(),
            action.to_string(),
            deadline,
        ) {
            debug!(conn = %id, %agent, %error, "invoke rejected by pending table");
            self.send_error(id, &body.request_id, error.code(), &error.to_string());
            return;
        }

        // Forward with request_id, action, and params bytes verbatim.
        let forwarded = self
            .identity
            .envelope(MessageType::Invoke, env.body.clone());
        if !self.forward(repeater_conn, &forwarded) {
            warn!(conn = %id, repeater = %repeater_conn, "repeater writer saturated, failing invoke");
            self.pending.complete(repeater_conn, &body.request_id);
            self.send_error(
                id,
                &body.request_id,
                ErrorCode::Internal,
                "repeater write queue full",
            );
            return;
        }

        debug!(
            conn = %id,
            %agent,
            %action,
            repeater = %repeater_conn,
            "invoke forwarded"
        );
    }

    fn handle_reply(&mut self, id: ConnectionId, env: &Envelope) {
        if !self.conns.get(&id).is_some_and(|state| state.registered) {
            // First envelope from a repeater connection must be register.
            self.send_error(id, &[], ErrorCode::BadRequest, "register first");
            self.close(id);
            return;
        }

        let decoded = match env.msg_type {
            MessageType::Result => ResultBody::decode(&env.body).map(|body| body.request_id),
            MessageType::Error => ErrorBody::decode(&env.body).map(|body| body.request_id),
            _ => unreachable!("caller matched result/error"),
        };
        let request_id = match decoded {
            Ok(request_id) => request_id,
            Err(error) => {
                // No request id is recoverable from a malformed body;
                // drop the frame and close.
                warn!(conn = %id, %error, "malformed reply body");
                self.close(id);
                return;
            }
        };

        let Some(entry) = self.pending.complete(id, &request_id) else {
            debug!(conn = %id, "reply for unknown request id");
            self.send_error(id, &request_id, ErrorCode::BadRequest, "unknown request id");
            return;
        };

        // Pass the repeater's body through to the agent verbatim under the
        // same request id.
        let reply = self.identity.envelope(env.msg_type, env.body.clone());
        if !self.forward(entry.agent, &reply) {
            debug!(
                agent = %entry.agent,
                repeater = %id,
                "agent unreachable for reply, dropping"
            );
        }
    }

    fn sweep_deadlines(&mut self) {
        for entry in self.pending.expire(Instant::now()) {
            warn!(
                agent = %entry.agent,
                repeater = %entry.repeater,
                action = %entry.action,
                "pending request deadline exceeded"
            );
            self.send_error(
                entry.agent,
                &entry.request_id,
                ErrorCode::Internal,
                "deadline exceeded",
            );
        }
    }

    /// Disengage: fail whatever is still in flight, then let the
    /// cancellation token wind the connections down.
    fn drain(&mut self) {
        let in_flight = self.pending.drain_all();
        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "failing in-flight requests on disengage");
        }
        for entry in in_flight {
            self.send_error(
                entry.agent,
                &entry.request_id,
                ErrorCode::Internal,
                "gate disengaging",
            );
        }
    }

    /// Queues a gate-originated envelope on a connection's writer.
    fn forward(&self, conn: ConnectionId, env: &Envelope) -> bool {
        let Some(state) = self.conns.get(&conn) else {
            return false;
        };
        match env.encode() {
            Ok(payload) => state.handle.send_frame(payload),
            Err(error) => {
                warn!(%error, "failed to encode outbound envelope");
                false
            }
        }
    }

    fn send_error(&self, conn: ConnectionId, request_id: &[u8], code: ErrorCode, message: &str) {
        let body = ErrorBody {
            request_id: request_id.to_vec(),
            code,
            message: message.as_bytes().to_vec(),
        };
        let Ok(body) = body.encode() else {
            warn!("failed to encode error body");
            return;
        };
        let env = self.identity.envelope(MessageType::Error, body);
        if !self.forward(conn, &env) {
            debug!(conn = %conn, %code, "error reply not deliverable");
        }
    }

    fn close(&self, id: ConnectionId) {
        if let Some(state) = self.conns.get(&id) {
            state.handle.close();
        }
    }
}

/// Best-effort request-id recovery for error replies.
///
/// Only bodies whose layout starts with `request_id` can contribute; an
/// unattributable failure replies with an empty id.
fn recover_request_id(env: &Envelope) -> Vec<u8> {
    match env.msg_type {
        MessageType::Invoke => InvokeBody::decode(&env.body)
            .map(|body| body.request_id)
            .unwrap_or_default(),
        MessageType::Result => ResultBody::decode(&env.body)
            .map(|body| body.request_id)
            .unwrap_or_default(),
        MessageType::Error => ErrorBody::decode(&env.body)
            .map(|body| body.request_id)
            .unwrap_or_default(),
        MessageType::Register => Vec::new(),
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
