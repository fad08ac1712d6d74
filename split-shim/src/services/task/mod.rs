//! Task Service - lifecycle of the task owned by this shim.
//!
//! The engine owns the registry and is the only writer of task state. RPC
//! calls enter through the API handler; exit notifications arrive from the
//! [`ProcessController`] on a dedicated channel.

mod api;
mod engine;
mod process;
mod registry;

pub use api::TaskApiHandler;
pub use engine::TaskEngine;
pub use process::{Process, ProcessState, Task};
pub use registry::TaskRegistry;

use crate::error::ControllerError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Signal used for forced termination.
pub const SIGKILL: u32 = 9;

/// Exit status recorded when a forced kill is never confirmed.
pub const FORCED_EXIT_STATUS: u32 = 128 + SIGKILL;

/// IO wiring for a process. Empty paths mean "not connected".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stdio {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

/// Everything needed to allocate a task.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub id: String,
    pub bundle: PathBuf,
    pub stdio: Stdio,
    /// Restore from this checkpoint image instead of a fresh start.
    pub checkpoint: Option<PathBuf>,
}

/// An additional process to run inside a task.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub exec_id: String,
    pub stdio: Stdio,
    /// OCI process description.
    pub process: serde_json::Value,
}

/// Terminal values of a process, written once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub pid: u32,
    pub status: u32,
    pub exited_at: SystemTime,
}

/// Exit notification emitted by a process controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    pub id: String,
    pub exec_id: Option<String>,
    pub pid: u32,
    pub status: u32,
    pub exited_at: SystemTime,
}

/// Result of deleting a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deleted {
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: Option<SystemTime>,
}

/// Point-in-time view of one process.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub id: String,
    pub exec_id: Option<String>,
    pub bundle: PathBuf,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub stdio: Stdio,
    pub exit: Option<Exit>,
}

/// A pid owned by the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessPid {
    pub pid: u32,
    pub exec_id: Option<String>,
}

/// The capability that actually creates, signals and releases processes.
///
/// Implementations report process exits asynchronously as [`ExitEvent`]s on
/// the channel they were constructed with.
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Allocate the task's process without running it.
    async fn create(&self, spec: &CreateSpec) -> Result<(), ControllerError>;

    /// Allocate an exec process inside a running task without running it.
    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<(), ControllerError>;

    /// Begin execution and return the OS pid.
    async fn start(&self, id: &str, exec_id: Option<&str>) -> Result<u32, ControllerError>;

    async fn kill(
        &self,
        id: &str,
        exec_id: Option<&str>,
        signal: u32,
        all: bool,
    ) -> Result<(), ControllerError>;

    async fn pause(&self, id: &str) -> Result<(), ControllerError>;

    async fn resume(&self, id: &str) -> Result<(), ControllerError>;

    /// Release everything held for the process.
    async fn delete(&self, id: &str, exec_id: Option<&str>) -> Result<(), ControllerError>;

    /// Resource usage snapshot, JSON encoded.
    async fn stats(&self, id: &str) -> Result<Vec<u8>, ControllerError>;

    async fn update(&self, id: &str, resources: &[u8]) -> Result<(), ControllerError>;

    async fn checkpoint(&self, id: &str, path: &Path) -> Result<(), ControllerError>;

    async fn resize_pty(
        &self,
        id: &str,
        exec_id: Option<&str>,
        width: u32,
        height: u32,
    ) -> Result<(), ControllerError>;

    async fn close_io(&self, id: &str, exec_id: Option<&str>) -> Result<(), ControllerError>;
}
