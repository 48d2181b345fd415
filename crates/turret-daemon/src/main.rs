//! turretd - the turret capability gate daemon.
//!
//! `start` fires up (decrypts and validates the bunker, asking the console
//! for an operator identity when the host identity cannot unlock it), opens
//! the agent and repeater sockets, and serves until SIGTERM/SIGINT.
//! `stop` signals a running daemon via its pid file; `status` reports
//! whether one is alive.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use turret_core::bunker::{OperatorUnlock, RageCliCipher, UnlockError, UnlockMaterial};
use turret_daemon::dispatch::{DispatcherConfig, GateIdentity};
use turret_daemon::lifecycle::{GateConfig, Lifecycle};
use turret_daemon::listener::SocketPaths;

/// turret capability gate daemon
#[derive(Parser, Debug)]
#[command(name = "turretd")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fire up: unlock the bunker, open the sockets, serve until signalled.
    Start {
        /// Path to the encrypted bunker file.
        #[arg(long)]
        bunker: PathBuf,

        /// Host identity file tried before prompting an operator.
        #[arg(long)]
        host_identity: Option<PathBuf>,

        /// Path of the agent socket.
        #[arg(long, default_value = "turret-agent.sock")]
        agent_socket: PathBuf,

        /// Path of the repeater socket.
        #[arg(long, default_value = "turret-repeater.sock")]
        repeater_socket: PathBuf,

        /// Path to the pid file.
        #[arg(long, default_value = "turretd.pid")]
        pid_file: PathBuf,

        /// Log level (trace, debug, info, warn, error).
        #[arg(long, default_value = "info")]
        log_level: String,
    },

    /// Disengage a running daemon via its pid file.
    Stop {
        /// Path to the pid file.
        #[arg(long, default_value = "turretd.pid")]
        pid_file: PathBuf,
    },

    /// Report whether a daemon is engaged.
    Status {
        /// Path to the pid file.
        #[arg(long, default_value = "turretd.pid")]
        pid_file: PathBuf,

        /// Path of the agent socket.
        #[arg(long, default_value = "turret-agent.sock")]
        agent_socket: PathBuf,
    },
}

/// Console collaborator for operator unlock: prompts on stderr, reads an
/// identity file path from stdin.
struct ConsoleUnlock;

impl OperatorUnlock for ConsoleUnlock {
    fn request_material(&self, reason: &str) -> Result<UnlockMaterial, UnlockError> {
        eprintln!("turretd: {reason}");
        eprint!("turretd: path to operator identity file: ");
        let _ = std::io::stderr().flush();

        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .map_err(|error| UnlockError::Unavailable {
                reason: format!("console read failed: {error}"),
            })?;
        let path = line.trim();
        if path.is_empty() {
            return Err(UnlockError::Unavailable {
                reason: "no identity provided".to_string(),
            });
        }
        Ok(UnlockMaterial::IdentityFile(PathBuf::from(path)))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Start {
            bunker,
            host_identity,
            agent_socket,
            repeater_socket,
            pid_file,
            log_level,
        } => {
            init_tracing(&log_level);
            let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            runtime.block_on(run_start(
                bunker,
                host_identity,
                agent_socket,
                repeater_socket,
                pid_file,
            ))
        }
        Command::Stop { pid_file } => run_stop(&pid_file),
        Command::Status {
            pid_file,
            agent_socket,
        } => run_status(&pid_file, &agent_socket),
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_start(
    bunker: PathBuf,
    host_identity: Option<PathBuf>,
    agent_socket: PathBuf,
    repeater_socket: PathBuf,
    pid_file: PathBuf,
) -> Result<()> {
    let config = GateConfig {
        bunker_path: bunker,
        host_identity,
        sockets: SocketPaths {
            agent: agent_socket,
            repeater: repeater_socket,
        },
        dispatcher: DispatcherConfig::default(),
        identity: GateIdentity::default(),
    };

    let mut lifecycle = Lifecycle::new(config, Box::new(RageCliCipher::new()));
    lifecycle
        .fire_up(Some(&ConsoleUnlock))
        .await
        .context("fire-up failed")?;

    write_pid_file(&pid_file)?;

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
    }

    lifecycle.disengage().await.context("disengage failed")?;
    remove_pid_file(&pid_file);
    Ok(())
}

fn run_stop(pid_file: &PathBuf) -> Result<()> {
    let pid = read_pid_file(pid_file)?;
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("failed to signal pid {pid}"))?;
    println!("turretd: sent SIGTERM to {pid}");
    Ok(())
}

fn run_status(pid_file: &PathBuf, agent_socket: &PathBuf) -> Result<()> {
    let Ok(pid) = read_pid_file(pid_file) else {
        println!("turretd: cold (no pid file)");
        return Ok(());
    };

    // Signal 0 probes liveness without delivering anything.
    let alive = kill(Pid::from_raw(pid), None).is_ok();
    if alive && agent_socket.exists() {
        println!("turretd: engaged (pid {pid})");
    } else if alive {
        println!("turretd: pid {pid} alive but socket missing");
    } else {
        println!("turretd: cold (stale pid file for {pid})");
    }
    Ok(())
}

fn write_pid_file(path: &PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", path.display()))?;
    info!(path = %path.display(), "pid file written");
    Ok(())
}

fn remove_pid_file(path: &PathBuf) {
    if path.exists() {
        if let Err(error) = std::fs::remove_file(path) {
            warn!(path = %path.display(), %error, "failed to remove pid file");
        }
    }
}

fn read_pid_file(path: &PathBuf) -> Result<i32> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pid file {}", path.display()))?;
    text.trim()
        .parse()
        .with_context(|| format!("invalid pid file {}", path.display()))
}
