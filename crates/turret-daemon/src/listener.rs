//! Dual-socket accept loops.
//!
//! Two Unix stream listeners front the gate: one classified `agent`, one
//! classified `repeater`. Each accept loop hands accepted streams to
//! [`crate::connection::spawn`] under a connection-count semaphore; when no
//! permit is available the stream is dropped on the floor (the peer sees a
//! clean close). Stale socket files are removed before bind and again on
//! shutdown.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{self, ConnectionId, SocketClass};
use crate::dispatch::DispatcherEvent;

/// Listener failures.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Could not prepare or bind a socket path.
    #[error("failed to bind {class} socket at {path}: {source}")]
    Bind {
        /// Listener classification.
        class: SocketClass,
        /// Socket path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Socket paths for one engagement.
#[derive(Debug, Clone)]
pub struct SocketPaths {
    /// Path of the agent socket.
    pub agent: PathBuf,
    /// Path of the repeater socket.
    pub repeater: PathBuf,
}

impl Default for SocketPaths {
    fn default() -> Self {
        Self {
            agent: PathBuf::from("turret-agent.sock"),
            repeater: PathBuf::from("turret-repeater.sock"),
        }
    }
}

/// The bound listener pair.
pub struct SocketGate {
    agent: UnixListener,
    repeater: UnixListener,
    paths: SocketPaths,
}

impl SocketGate {
    /// Removes stale socket files and binds both listeners.
    pub fn bind(paths: SocketPaths) -> Result<Self, ListenerError> {
        let agent = bind_one(&paths.agent, SocketClass::Agent)?;
        let repeater = bind_one(&paths.repeater, SocketClass::Repeater)?;
        info!(
            agent = %paths.agent.display(),
            repeater = %paths.repeater.display(),
            "gate sockets bound"
        );
        Ok(Self {
            agent,
            repeater,
            paths,
        })
    }

    /// Runs both accept loops until cancellation, then removes the socket
    /// files.
    pub async fn run(
        self,
        events: mpsc::Sender<DispatcherEvent>,
        cancel: CancellationToken,
        max_connections: usize,
        writer_queue: usize,
    ) {
        let next_id = Arc::new(AtomicU64::new(1));

        let agent_loop = accept_loop(
            self.agent,
            SocketClass::Agent,
            events.clone(),
            cancel.clone(),
            Arc::new(Semaphore::new(max_connections)),
            Arc::clone(&next_id),
            writer_queue,
        );
        let repeater_loop = accept_loop(
            self.repeater,
            SocketClass::Repeater,
            events,
            cancel.clone(),
            Arc::new(Semaphore::new(max_connections)),
            next_id,
            writer_queue,
        );

        tokio::join!(agent_loop, repeater_loop);

        remove_if_exists(&self.paths.agent);
        remove_if_exists(&self.paths.repeater);
        info!("gate sockets closed");
    }
}

fn bind_one(path: &Path, class: SocketClass) -> Result<UnixListener, ListenerError> {
    let map_err = |source| ListenerError::Bind {
        class,
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(map_err)?;
        }
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket file"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(map_err(error)),
    }

    UnixListener::bind(path).map_err(map_err)
}

async fn accept_loop(
    listener: UnixListener,
    class: SocketClass,
    events: mpsc::Sender<DispatcherEvent>,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    next_id: Arc<AtomicU64>,
    writer_queue: usize,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    admit(
                        stream,
                        class,
                        &events,
                        &cancel,
                        &permits,
                        &next_id,
                        writer_queue,
                    );
                }
                Err(error) => {
                    warn!(%class, %error, "accept failed");
                }
            },
        }
    }
}

fn admit(
    stream: UnixStream,
    class: SocketClass,
    events: &mpsc::Sender<DispatcherEvent>,
    cancel: &CancellationToken,
    permits: &Arc<Semaphore>,
    next_id: &Arc<AtomicU64>,
    writer_queue: usize,
) {
    let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
        warn!(%class, "connection cap reached, refusing peer");
        drop(stream);
        return;
    };

    let id = ConnectionId::new(next_id.fetch_add(1, Ordering::Relaxed));
    debug!(conn = %id, %class, "accepted connection");
    connection::spawn(id, class, stream, events.clone(), cancel, permit, writer_queue);
}

fn remove_if_exists(path: &Path) {
    if let Err(error) = std::fs::remove_file(path) {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), %error, "failed to remove socket file");
        }
    }
}
