//! Thin async peer helpers.
//!
//! Enough client surface for a repeater process (connect, register, answer
//! invokes) and for the integration suite to drive both sockets. Envelope
//! construction stamps the current wall clock and a random nonce, then
//! signs the canonical bytes with the peer's key.

use std::path::Path;

use bytes::Bytes;
use ed25519_dalek::{SigningKey, VerifyingKey};
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use turret_core::crypto;
use turret_core::protocol::{Envelope, FrameCodec, MessageType, ProtocolError};

use crate::dispatch::now_ms;

/// A peer identity that signs outbound envelopes.
pub struct PeerSigner {
    principal: String,
    key: SigningKey,
}

impl PeerSigner {
    /// Creates a signer for `principal`.
    #[must_use]
    pub fn new(principal: impl Into<String>, key: SigningKey) -> Self {
        Self {
            principal: principal.into(),
            key,
        }
    }

    /// The principal id.
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// The verifying key to provision in a bunker.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Builds a signed envelope with a fresh timestamp and nonce.
    #[must_use]
    pub fn envelope(&self, msg_type: MessageType, body: Vec<u8>) -> Envelope {
        let nonce: [u8; 16] = rand::random();
        self.envelope_at(msg_type, body, now_ms(), nonce.to_vec())
    }

    /// Builds a signed envelope with an explicit timestamp and nonce.
    #[must_use]
    pub fn envelope_at(
        &self,
        msg_type: MessageType,
        body: Vec<u8>,
        ts_ms: u64,
        nonce: Vec<u8>,
    ) -> Envelope {
        let principal = self.principal.as_bytes().to_vec();
        let sig = crypto::sign(&self.key, &principal, ts_ms, &nonce, &body).to_bytes();
        Envelope {
            msg_type,
            principal,
            ts_ms,
            nonce,
            body,
            sig,
        }
    }
}

/// A framed peer connection to one of the gate sockets.
pub struct PeerConnection {
    framed: Framed<UnixStream, FrameCodec>,
}

impl PeerConnection {
    /// Connects to a gate socket.
    pub async fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new()),
        })
    }

    /// Sends one envelope.
    pub async fn send(&mut self, env: &Envelope) -> Result<(), ProtocolError> {
        let payload = env.encode()?;
        self.framed.send(payload).await
    }

    /// Sends raw frame payload bytes (for byte-exact resends).
    pub async fn send_raw(&mut self, payload: Vec<u8>) -> Result<(), ProtocolError> {
        self.framed.send(payload).await
    }

    /// Receives the next raw frame; `None` when the gate closed the
    /// connection.
    pub async fn recv_frame(&mut self) -> Option<Result<Bytes, ProtocolError>> {
        self.framed.next().await
    }

    /// Receives and decodes the next envelope.
    pub async fn recv(&mut self) -> Option<Result<Envelope, ProtocolError>> {
        match self.recv_frame().await? {
            Ok(payload) => Some(Envelope::decode(&payload)),
            Err(error) => Some(Err(error)),
        }
    }
}
