//! turret-echo - a minimal socket-peer repeater.
//!
//! Registers its actions with the gate and answers every invoke by echoing
//! the params back as the result. Useful for smoke-testing an engagement.
//!
//! Environment:
//! - `TURRET_REPEATER_ID`: principal id (default `rep-1`)
//! - `TURRET_REPEATER_SOCK`: repeater socket path (default
//!   `turret-repeater.sock`)
//! - `TURRET_REPEATER_SEED`: path to a raw 32-byte Ed25519 seed file
//! - `TURRET_REPEATER_ACTIONS`: comma-separated action names (default
//!   `echo`)

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use ed25519_dalek::SigningKey;
use turret_core::protocol::{Envelope, InvokeBody, MessageType, RegisterBody, ResultBody};
use turret_daemon::client::{PeerConnection, PeerSigner};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let repeater_id =
        std::env::var("TURRET_REPEATER_ID").unwrap_or_else(|_| "rep-1".to_string());
    let sock = std::env::var_os("TURRET_REPEATER_SOCK")
        .map_or_else(|| PathBuf::from("turret-repeater.sock"), PathBuf::from);
    let actions: Vec<String> = std::env::var("TURRET_REPEATER_ACTIONS")
        .unwrap_or_else(|_| "echo".to_string())
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();

    let signer = PeerSigner::new(repeater_id.clone(), load_signing_key()?);
    let mut conn = PeerConnection::connect(&sock)
        .await
        .with_context(|| format!("connect {}", sock.display()))?;

    let register = RegisterBody {
        repeater_id: repeater_id.as_bytes().to_vec(),
        actions: actions.iter().map(|name| name.as_bytes().to_vec()).collect(),
    };
    conn.send(&signer.envelope(MessageType::Register, register.encode()?))
        .await?;
    eprintln!(
        "turret-echo: registered {actions:?} as {repeater_id} on {}",
        sock.display()
    );

    while let Some(frame) = conn.recv().await {
        let env: Envelope = frame?;
        match env.msg_type {
            MessageType::Invoke => {
                let invoke = InvokeBody::decode(&env.body)?;
                let reply = ResultBody {
                    request_id: invoke.request_id,
                    result: invoke.params,
                };
                conn.send(&signer.envelope(MessageType::Result, reply.encode()?))
                    .await?;
            }
            MessageType::Error => {
                eprintln!("turret-echo: gate error: {:?}", env.body);
            }
            _ => {}
        }
    }

    eprintln!("turret-echo: gate closed the connection");
    Ok(())
}

fn load_signing_key() -> Result<SigningKey> {
    let seed_path = std::env::var_os("TURRET_REPEATER_SEED")
        .map(PathBuf::from)
        .context("missing TURRET_REPEATER_SEED (path to 32-byte seed file)")?;
    let seed = std::fs::read(&seed_path)
        .with_context(|| format!("read {}", seed_path.display()))?;
    let seed: [u8; 32] = match seed.as_slice().try_into() {
        Ok(seed) => seed,
        Err(_) => bail!("seed must be 32 bytes, got {}", seed.len()),
    };
    Ok(SigningKey::from_bytes(&seed))
}
