//! Shared harness for the gate scenario tests.
//!
//! Engages a real lifecycle over a plaintext bunker in a temp dir, so the
//! full path (sockets, framing, signing, dispatch) is exercised without
//! needing the `rage` binary.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tempfile::TempDir;
use turret_core::bunker::{Bunker, PlaintextCipher, SecretValue};
use turret_core::protocol::{
    Envelope, ErrorBody, ErrorCode, InvokeBody, MessageType, RegisterBody,
};
use turret_daemon::client::{PeerConnection, PeerSigner};
use turret_daemon::dispatch::{DispatcherConfig, GateIdentity};
use turret_daemon::lifecycle::{GateConfig, Lifecycle};
use turret_daemon::listener::SocketPaths;

/// Secret planted in every test bunker; no frame toward an agent may ever
/// contain it.
pub const SECRET_VALUE: &str = "hunter2-credential";

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Keys for the standard cast: one agent, two repeaters.
pub struct TestKeys {
    pub corvus: SigningKey,
    pub rep1: SigningKey,
    pub rep2: SigningKey,
}

impl TestKeys {
    pub fn generate() -> Self {
        Self {
            corvus: SigningKey::generate(&mut OsRng),
            rep1: SigningKey::generate(&mut OsRng),
            rep2: SigningKey::generate(&mut OsRng),
        }
    }
}

/// The standard test bunker: agent `corvus` may invoke `echo`; `admin`
/// exists (owned by `rep-1`) but is not granted; `scan` belongs to
/// `rep-2`.
pub fn standard_bunker(keys: &TestKeys) -> Bunker {
    let mut bunker = Bunker {
        operators: BTreeSet::from(["age1qqqtestoperator".to_string()]),
        ..Bunker::default()
    };
    bunker.agents.insert(
        "corvus".to_string(),
        keys.corvus.verifying_key().to_bytes(),
    );
    bunker
        .repeaters
        .insert("rep-1".to_string(), keys.rep1.verifying_key().to_bytes());
    bunker
        .repeaters
        .insert("rep-2".to_string(), keys.rep2.verifying_key().to_bytes());
    bunker
        .actions
        .insert("echo".to_string(), "rep-1".to_string());
    bunker
        .actions
        .insert("admin".to_string(), "rep-1".to_string());
    bunker
        .actions
        .insert("scan".to_string(), "rep-2".to_string());
    bunker.permissions.insert(
        "corvus".to_string(),
        BTreeSet::from(["echo".to_string()]),
    );
    bunker.secrets.insert(
        "SESSION_TOKEN".to_string(),
        SecretValue::new(SECRET_VALUE.to_string()),
    );
    bunker
}

/// An engaged gate in a temp dir.
pub struct Gate {
    _tmp: TempDir,
    pub lifecycle: Lifecycle,
    pub agent_sock: PathBuf,
    pub repeater_sock: PathBuf,
}

pub async fn engage(bunker: &Bunker) -> Gate {
    engage_with(bunker, DispatcherConfig::default()).await
}

pub async fn engage_with(bunker: &Bunker, dispatcher: DispatcherConfig) -> Gate {
    let tmp = TempDir::new().expect("tempdir");
    let bunker_path = tmp.path().join("test.bnkr");
    std::fs::write(&bunker_path, bunker.to_toml().expect("encode bunker")).expect("write bunker");

    let agent_sock = tmp.path().join("agent.sock");
    let repeater_sock = tmp.path().join("repeater.sock");
    let config = GateConfig {
        bunker_path,
        host_identity: Some(PathBuf::from("/dev/null")),
        sockets: SocketPaths {
            agent: agent_sock.clone(),
            repeater: repeater_sock.clone(),
        },
        dispatcher,
        identity: GateIdentity::default(),
    };

    let mut lifecycle = Lifecycle::new(config, Box::new(PlaintextCipher));
    lifecycle.fire_up(None).await.expect("fire-up");

    Gate {
        _tmp: tmp,
        lifecycle,
        agent_sock,
        repeater_sock,
    }
}

pub async fn connect(path: &Path) -> PeerConnection {
    PeerConnection::connect(path).await.expect("connect")
}

/// Receives the next envelope with a timeout.
pub async fn recv(conn: &mut PeerConnection) -> Envelope {
    tokio::time::timeout(RECV_TIMEOUT, conn.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("connection closed")
        .expect("decode failed")
}

/// Asserts the connection closes without another frame.
pub async fn recv_closed(conn: &mut PeerConnection) {
    let frame = tokio::time::timeout(RECV_TIMEOUT, conn.recv_frame())
        .await
        .expect("timed out waiting for close");
    assert!(frame.is_none(), "expected close, got a frame");
}

/// Asserts no frame arrives within `wait`.
pub async fn recv_nothing(conn: &mut PeerConnection, wait: Duration) {
    let outcome = tokio::time::timeout(wait, conn.recv_frame()).await;
    assert!(outcome.is_err(), "expected silence, got a frame");
}

/// Decodes an error envelope and asserts its code.
pub fn expect_error(env: &Envelope, code: ErrorCode) -> ErrorBody {
    assert_eq!(env.msg_type, MessageType::Error, "expected error envelope");
    let body = ErrorBody::decode(&env.body).expect("error body");
    assert_eq!(body.code, code, "unexpected error code");
    body
}

/// Sends a register for `actions` and gives the dispatcher a beat to bind.
pub async fn register(conn: &mut PeerConnection, signer: &PeerSigner, actions: &[&str]) {
    let body = RegisterBody {
        repeater_id: signer.principal().as_bytes().to_vec(),
        actions: actions.iter().map(|name| name.as_bytes().to_vec()).collect(),
    };
    conn.send(&signer.envelope(MessageType::Register, body.encode().expect("encode")))
        .await
        .expect("send register");
    // Registration success is silent; give the dispatcher a moment to
    // apply the bindings before any cross-connection invoke.
    tokio::time::sleep(Duration::from_millis(150)).await;
}

/// Builds a signed invoke envelope.
pub fn invoke_env(
    signer: &PeerSigner,
    request_id: &[u8],
    action: &str,
    params: &[u8],
) -> Envelope {
    let body = InvokeBody {
        request_id: request_id.to_vec(),
        action: action.as_bytes().to_vec(),
        params: params.to_vec(),
    };
    signer.envelope(MessageType::Invoke, body.encode().expect("encode"))
}
