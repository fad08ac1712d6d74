//! split-shim - containerd task shim for OCI runtime containers.
//!
//! One shim process supervises exactly one task, exposing the
//! `containerd.task.v2.Task` gRPC service on a unix socket.
//!
//! ## Architecture
//!
//! - **Manager**: instance startup, cleanup and shutdown
//! - **Task Service**: lifecycle state machine and RPC handler
//! - **Runtime Service**: runc-compatible process controller
//! - **Shutdown**: ordered, bounded drain of registered callbacks

pub mod error;
pub mod proto;
pub mod services;
pub mod utils;

use crate::services::manager::ShimManager;
use crate::services::runtime::{Runtime, RuncController};
use crate::services::task::ExitEvent;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{Span, info};

/// Configuration for a shim instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the OCI runtime binary.
    pub runtime_path: PathBuf,
    /// Root directory for runtime state (None = runtime default).
    pub runtime_root: Option<PathBuf>,
    /// Directory holding instance sockets.
    pub socket_dir: PathBuf,
    /// containerd namespace the task belongs to.
    pub namespace: String,
    /// Deadline for each shutdown callback.
    pub callback_timeout: Duration,
    /// How long a forced kill waits for the exit before one is recorded.
    pub kill_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime_path: PathBuf::from("runc"),
            runtime_root: None,
            socket_dir: PathBuf::from("/run/containerd/split"),
            namespace: "default".to_string(),
            callback_timeout: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Socket address for the instance supervising `id`.
    pub fn socket_path(&self, id: &str) -> PathBuf {
        self.socket_dir.join(format!("{}-{id}.sock", self.namespace))
    }
}

/// Build a shim manager backed by the OCI runtime controller.
pub fn initialize(config: Config, span: Span) -> Arc<ShimManager> {
    let (exit_tx, exit_rx) = mpsc::channel::<ExitEvent>(32);
    let runtime = Runtime {
        path: config.runtime_path.clone(),
        root: config.runtime_root.clone(),
    };
    let controller = Arc::new(RuncController::new(runtime, exit_tx, span.clone()));
    info!(parent: &span, runtime = %config.runtime_path.display(), "Runtime controller initialized");
    Arc::new(ShimManager::new(config, controller, exit_rx, span))
}
