//! containerd-shim-split-v2 - containerd task shim.
//!
//! Launched by containerd once per container. `start` forks the serving
//! instance, `delete` cleans up after a dead one, no action serves.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use nix::sys::prctl;
use prost::Message;
use split_shim::Config;
use split_shim::proto::DeleteResponse;
use split_shim::services::manager::StartOpts;
use split_shim::utils::signals;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, info_span};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SHIM_ID: &str = "io.containerd.split.v2";

/// How long `start` waits for the serving instance to bind its socket.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "containerd-shim-split-v2")]
#[command(about = "containerd task shim for OCI runtime containers")]
#[command(disable_version_flag = true)]
struct Args {
    /// Print version information and exit
    #[arg(long)]
    version: bool,

    /// containerd namespace of the task
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Id of the task to supervise
    #[arg(long)]
    id: Option<String>,

    /// Unix socket to serve on
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path to the OCI runtime binary
    #[arg(long)]
    runtime: Option<PathBuf>,

    /// Root directory for runtime state
    #[arg(long)]
    runtime_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Start a shim instance and print its address
    Start,
    /// Clean up a task whose shim is gone
    Delete,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        println!(
            "Split API containerd shim: id: {SHIM_ID:?}, version: {VERSION}, commit: {}",
            option_env!("SPLIT_SHIM_COMMIT").unwrap_or("unknown")
        );
        return Ok(());
    }

    // stdout carries the start/delete protocol, logs go to stderr.
    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(format!("split_shim={level}").parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(id) = args.id.clone() else {
        bail!("--id is required");
    };

    let mut config = Config {
        namespace: args.namespace.clone(),
        ..Config::default()
    };
    if let Some(runtime) = &args.runtime {
        config.runtime_path = runtime.clone();
    }
    config.runtime_root = args.runtime_root.clone();

    match args.action {
        Some(Action::Start) => start(&args, &config, &id).await,
        Some(Action::Delete) => delete(config, &id).await,
        None => serve(args, config, id).await,
    }
}

/// Forks a serving copy of this binary in its own process group and prints
/// its address once the socket is up.
async fn start(args: &Args, config: &Config, id: &str) -> Result<()> {
    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| config.socket_path(id));
    let exe = std::env::current_exe().context("cannot locate shim binary")?;

    let mut cmd = tokio::process::Command::new(exe);
    cmd.arg("--namespace")
        .arg(&config.namespace)
        .arg("--id")
        .arg(id)
        .arg("--socket")
        .arg(&socket)
        .arg("--runtime")
        .arg(&config.runtime_path);
    if let Some(root) = &config.runtime_root {
        cmd.arg("--runtime-root").arg(root);
    }
    if args.debug {
        cmd.arg("--debug");
    }
    let child = cmd
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .process_group(0)
        .spawn()
        .context("failed to spawn shim instance")?;
    info!(id, pid = child.id(), socket = %socket.display(), "Shim instance spawned");

    wait_for_socket(&socket).await?;
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("unix://{}", socket.display()).as_bytes())
        .await?;
    stdout.flush().await?;
    Ok(())
}

async fn wait_for_socket(socket: &Path) -> Result<()> {
    let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if tokio::fs::try_exists(socket).await.unwrap_or(false) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("shim socket {} did not appear", socket.display())
}

async fn delete(config: Config, id: &str) -> Result<()> {
    let span = info_span!("shim", namespace = %config.namespace, id);
    let manager = split_shim::initialize(config, span);

    let deleted = manager.cleanup(id).await?;
    let response = DeleteResponse::from(deleted);

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&response.encode_to_vec()).await?;
    stdout.flush().await?;
    Ok(())
}

async fn serve(args: Args, config: Config, id: String) -> Result<()> {
    // Runtime-created processes get reparented to us so we can reap them.
    prctl::set_child_subreaper(true)
        .map_err(|e| anyhow::anyhow!("Failed to set as child subreaper: {}", e))?;

    let span = info_span!("shim", namespace = %config.namespace, id = %id);
    let manager = split_shim::initialize(config, span);

    let address = manager
        .start_shim(&id, StartOpts {
            socket: args.socket,
        })
        .await?;
    info!(id = %id, address = %address, version = VERSION, "Shim serving");

    let signal_manager = manager.clone();
    tokio::spawn(async move {
        match signals::wait_for_shutdown_signal().await {
            Ok(()) => {
                info!("Termination signal received");
                signal_manager.shutdown().await;
            }
            Err(e) => error!(error = %e, "Failed to install signal handlers"),
        }
    });

    let code = manager.wait().await;
    info!(code, "Shim exiting");
    std::process::exit(code);
}
