//! Per-connection tasks: framed read loop and serialized writer.
//!
//! Each accepted socket is split into a read half and a write half. The
//! read loop decodes frames and forwards them to the dispatcher over a
//! bounded channel (backpressure suspends only this connection). The
//! writer task drains an outbound queue so at most one write is in flight
//! per connection. The dispatcher holds a [`ConnectionHandle`] per
//! connection and closes it by cancelling the connection's token; the read
//! loop reports the closure back as a single `Closed` event.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use turret_core::protocol::FrameCodec;

use crate::dispatch::DispatcherEvent;

/// Arena id for a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw arena index.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which listener accepted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketClass {
    /// The agent socket; only `invoke` is admissible.
    Agent,
    /// The repeater socket; `register` first, then `result`/`error`.
    Repeater,
}

impl std::fmt::Display for SocketClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => f.write_str("agent"),
            Self::Repeater => f.write_str("repeater"),
        }
    }
}

/// Dispatcher-side handle to a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Connection arena id.
    pub id: ConnectionId,
    /// Listener classification.
    pub class: SocketClass,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Queues a frame payload for this connection's writer.
    ///
    /// Never blocks: returns `false` when the writer queue is full or the
    /// writer is gone, in which case the caller decides whether to fail
    /// the request or drop the connection.
    pub fn send_frame(&self, payload: Vec<u8>) -> bool {
        self.outbound.try_send(Bytes::from(payload)).is_ok()
    }

    /// Forces the connection closed; the read loop reports `Closed`.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Spawns the read and write tasks for an accepted stream.
///
/// The read loop first announces the connection to the dispatcher, then
/// feeds it one event per decoded frame, and finally reports `Closed` on
/// peer close, decode failure, or cancellation. The semaphore permit rides
/// with the read task so connection capacity frees exactly when the task
/// ends.
pub fn spawn(
    id: ConnectionId,
    class: SocketClass,
    stream: UnixStream,
    events: mpsc::Sender<DispatcherEvent>,
    parent: &CancellationToken,
    permit: OwnedSemaphorePermit,
    writer_queue: usize,
) {
    let cancel = parent.child_token();
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(writer_queue);

    let handle = ConnectionHandle {
        id,
        class,
        outbound: outbound_tx,
        cancel: cancel.clone(),
    };

    tokio::spawn(write_loop(id, write_half, outbound_rx, cancel.clone()));
    tokio::spawn(read_loop(id, class, read_half, events, handle, cancel, permit));
}

async fn read_loop(
    id: ConnectionId,
    class: SocketClass,
    read_half: tokio::net::unix::OwnedReadHalf,
    events: mpsc::Sender<DispatcherEvent>,
    handle: ConnectionHandle,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
) {
    let mut framed = FramedRead::new(read_half, FrameCodec::new());

    if events
        .send(DispatcherEvent::Connected { handle })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(conn = %id, %class, "connection cancelled");
                break;
            }
            frame = framed.next() => match frame {
                Some(Ok(payload)) => {
                    if events
                        .send(DispatcherEvent::Frame { id, payload })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Err(error)) => {
                    // Frame-layer violation (oversized length prefix or a
                    // transport error); fatal for the connection.
                    warn!(conn = %id, %class, %error, "closing connection on frame error");
                    break;
                }
                None => {
                    debug!(conn = %id, %class, "peer closed connection");
                    break;
                }
            },
        }
    }

    let _ = events.send(DispatcherEvent::Closed { id }).await;
    drop(permit);
}

async fn write_loop(
    id: ConnectionId,
    write_half: tokio::net::unix::OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    let mut sink = FramedWrite::new(write_half, FrameCodec::new());

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(payload) => {
                    if let Err(error) = sink.send(payload).await {
                        debug!(conn = %id, %error, "write failed, stopping writer");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // The dispatcher queues its final replies before firing the
    // cancellation, so anything still in the channel is flushed here.
    while let Ok(payload) = outbound.try_recv() {
        if sink.send(payload).await.is_err() {
            break;
        }
    }
    let _ = futures::SinkExt::<Bytes>::close(&mut sink).await;
}
