//! Lifecycle controller: `cold → unlocking → engaged → disengaging → cold`.
//!
//! Fire-up decrypts and validates the bunker, builds the policy index, and
//! only then opens the sockets; any failure on that path leaves the
//! controller `cold` with a human-readable reason and no socket bound.
//! Disengage is a global cancellation token observed by the accept loops,
//! every connection task, and the dispatcher: pending work is completed
//! with failure replies where possible before the sockets close, and the
//! policy (secrets included) drops through zeroizing containers.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use turret_core::bunker::{BunkerCipher, BunkerStore, OperatorUnlock, StoreError};
use turret_core::policy::{PolicyError, PolicyIndex};

use crate::dispatch::{Dispatcher, DispatcherConfig, GateIdentity};
use crate::listener::{ListenerError, SocketGate, SocketPaths};

/// Gate configuration for one engagement.
pub struct GateConfig {
    /// Path of the encrypted bunker file.
    pub bunker_path: PathBuf,
    /// Optional host identity tried before asking an operator.
    pub host_identity: Option<PathBuf>,
    /// Socket paths.
    pub sockets: SocketPaths,
    /// Dispatcher limits and timings.
    pub dispatcher: DispatcherConfig,
    /// The gate's outbound identity.
    pub identity: GateIdentity,
}

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No policy in memory, no sockets bound.
    Cold,
    /// Decrypting and validating the bunker.
    Unlocking,
    /// Sockets open, dispatcher running.
    Engaged,
    /// Shutting down: draining and closing.
    Disengaging,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cold => "cold",
            Self::Unlocking => "unlocking",
            Self::Engaged => "engaged",
            Self::Disengaging => "disengaging",
        };
        f.write_str(name)
    }
}

/// Lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The requested transition is not legal from the current state.
    #[error("illegal lifecycle transition: {from} -> {to}")]
    IllegalTransition {
        /// Current state.
        from: LifecycleState,
        /// Requested state.
        to: LifecycleState,
    },

    /// The bunker could not be loaded or validated.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored key failed policy construction.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// A socket could not be bound.
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// A running engagement.
struct Engagement {
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    listeners: JoinHandle<()>,
}

/// The lifecycle controller.
pub struct Lifecycle {
    config: GateConfig,
    store: BunkerStore,
    state: LifecycleState,
    engagement: Option<Engagement>,
}

impl Lifecycle {
    /// Creates a cold controller over the given cipher.
    #[must_use]
    pub fn new(config: GateConfig, cipher: Box<dyn BunkerCipher>) -> Self {
        let store = BunkerStore::new(cipher, config.host_identity.clone());
        Self {
            config,
            store,
            state: LifecycleState::Cold,
            engagement: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    /// Fire-up and engage: decrypt, validate, index, open sockets.
    ///
    /// A concurrent or repeated engage is rejected; failures on the unlock
    /// path return the controller to `cold` without binding anything.
    pub async fn fire_up(
        &mut self,
        operator: Option<&dyn OperatorUnlock>,
    ) -> Result<(), LifecycleError> {
        if self.state != LifecycleState::Cold {
            return Err(LifecycleError::IllegalTransition {
                from: self.state,
                to: LifecycleState::Unlocking,
            });
        }
        self.state = LifecycleState::Unlocking;
        info!(bunker = %self.config.bunker_path.display(), "fire-up: unlocking bunker");

        let policy = match self.unlock(operator) {
            Ok(policy) => policy,
            Err(error) => {
                self.state = LifecycleState::Cold;
                return Err(error);
            }
        };

        let gate = match SocketGate::bind(self.config.sockets.clone()) {
            Ok(gate) => gate,
            Err(error) => {
                self.state = LifecycleState::Cold;
                return Err(error.into());
            }
        };

        let cancel = CancellationToken::new();
        // Connection tasks observe their own token, fired by the dispatcher
        // after it drains, so disengage replies are flushed before writers
        // wind down.
        let conn_cancel = CancellationToken::new();
        let identity = GateIdentity {
            principal: self.config.identity.principal.clone(),
            signing_key: self.config.identity.signing_key.clone(),
        };
        let (dispatcher, events) = Dispatcher::new(
            self.config.dispatcher.clone(),
            policy,
            identity,
            cancel.clone(),
            conn_cancel.clone(),
        );

        let dispatcher = tokio::spawn(dispatcher.run());
        let listeners = tokio::spawn(gate.run(
            events,
            conn_cancel,
            self.config.dispatcher.max_connections,
            self.config.dispatcher.writer_queue_depth,
        ));

        self.engagement = Some(Engagement {
            cancel,
            dispatcher,
            listeners,
        });
        self.state = LifecycleState::Engaged;
        info!("engaged");
        Ok(())
    }

    /// Disengage: stop accepting, drain pending work, close sockets, drop
    /// the policy.
    pub async fn disengage(&mut self) -> Result<(), LifecycleError> {
        if self.state != LifecycleState::Engaged {
            return Err(LifecycleError::IllegalTransition {
                from: self.state,
                to: LifecycleState::Disengaging,
            });
        }
        self.state = LifecycleState::Disengaging;
        info!("disengaging");

        if let Some(engagement) = self.engagement.take() {
            engagement.cancel.cancel();
            if let Err(error) = engagement.dispatcher.await {
                warn!(%error, "dispatcher task ended abnormally");
            }
            if let Err(error) = engagement.listeners.await {
                warn!(%error, "listener task ended abnormally");
            }
        }

        self.state = LifecycleState::Cold;
        info!("cold");
        Ok(())
    }

    fn unlock(
        &self,
        operator: Option<&dyn OperatorUnlock>,
    ) -> Result<Arc<PolicyIndex>, LifecycleError> {
        let bunker = self.store.load(&self.config.bunker_path, operator)?;
        let policy = PolicyIndex::from_bunker(&bunker)?;
        Ok(Arc::new(policy))
    }
}
