//! Runtime worker - runs OCI runtime commands and watches process exits.

use crate::error::ControllerError;
use crate::services::task::{ExitEvent, Stdio};
use crate::utils::signals::wait_for_child;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio as ProcessStdio;
use std::time::SystemTime;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{Span, debug, error, info, warn};

/// Location of the runtime binary and its state directory.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub path: PathBuf,
    /// Passed as `--root` when set; otherwise the runtime default applies.
    pub root: Option<PathBuf>,
}

impl Runtime {
    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.path);
        if let Some(root) = &self.root {
            cmd.arg("--root").arg(root);
        }
        cmd.args(args);
        cmd
    }

    /// Runs a short-lived runtime command and returns its stdout.
    pub async fn output(&self, args: &[&str], span: &Span) -> Result<Vec<u8>, ControllerError> {
        debug!(parent: span, runtime = %self.path.display(), args = %args.join(" "), "Executing runtime");

        let output = self
            .command(args)
            .stdin(ProcessStdio::null())
            .stdout(ProcessStdio::piped())
            .stderr(ProcessStdio::piped())
            .output()
            .await
            .map_err(|e| {
                ControllerError::Command(format!(
                    "failed to execute {}: {e}",
                    self.path.display()
                ))
            })?;

        if !output.status.success() {
            let err_msg = format!(
                "{} {} exited with {}: stderr='{}'",
                self.path.display(),
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            error!(parent: span, "{err_msg}");
            return Err(ControllerError::Command(err_msg));
        }

        Ok(output.stdout)
    }

    /// Runs a runtime command whose child processes inherit `stdio`.
    ///
    /// The runtime's own output goes to the same files, so only the exit
    /// status is reported on failure.
    pub async fn run_with_stdio(
        &self,
        args: &[&str],
        stdio: &Stdio,
        span: &Span,
    ) -> Result<(), ControllerError> {
        info!(parent: span, runtime = %self.path.display(), args = %args.join(" "), "Spawning runtime");

        let (stdin, stdout, stderr) = open_stdio(stdio).await?;
        let mut child = self
            .command(args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| ControllerError::Command(format!("failed to spawn {}: {e}", args[0])))?;

        let status = child.wait().await?;
        if !status.success() {
            let err_msg = format!("{} {} exited with {status}", self.path.display(), args[0]);
            error!(parent: span, "{err_msg}");
            return Err(ControllerError::Command(err_msg));
        }
        Ok(())
    }
}

/// Opens the stdio paths of a process. Empty paths become `/dev/null`.
///
/// FIFOs block on open until the other side shows up, hence the blocking
/// pool.
async fn open_stdio(
    stdio: &Stdio,
) -> Result<(ProcessStdio, ProcessStdio, ProcessStdio), ControllerError> {
    let stdio = stdio.clone();
    let opened = tokio::task::spawn_blocking(move || -> std::io::Result<_> {
        let stdin = open_path(&stdio.stdin, false)?;
        let stdout = open_path(&stdio.stdout, true)?;
        let stderr = open_path(&stdio.stderr, true)?;
        Ok((stdin, stdout, stderr))
    })
    .await
    .map_err(|e| ControllerError::Command(format!("stdio setup aborted: {e}")))??;

    let (stdin, stdout, stderr) = opened;
    Ok((to_stdio(stdin), to_stdio(stdout), to_stdio(stderr)))
}

fn open_path(path: &str, write: bool) -> std::io::Result<Option<File>> {
    if path.is_empty() {
        return Ok(None);
    }
    let path = path.strip_prefix("file://").unwrap_or(path);
    let file = if write {
        OpenOptions::new().create(true).append(true).open(path)?
    } else {
        OpenOptions::new().read(true).open(path)?
    };
    Ok(Some(file))
}

fn to_stdio(file: Option<File>) -> ProcessStdio {
    file.map_or_else(ProcessStdio::null, ProcessStdio::from)
}

/// Reads and removes a pid file written by the runtime.
pub async fn read_pid_file(path: &Path) -> Result<u32, ControllerError> {
    let pid_str = tokio::fs::read_to_string(path).await.map_err(|e| {
        ControllerError::Command(format!("could not read pid file {}: {e}", path.display()))
    })?;
    let pid = pid_str
        .trim()
        .parse::<u32>()
        .map_err(|e| ControllerError::Command(format!("failed to parse pid {pid_str:?}: {e}")))?;
    let _ = tokio::fs::remove_file(path).await;
    Ok(pid)
}

/// Waits for a runtime-created process to exit and reports it.
///
/// The shim is a child subreaper, so the process is ours to reap once the
/// runtime that forked it has gone.
pub async fn wait_for_process_exit(
    id: String,
    exec_id: Option<String>,
    pid: u32,
    exit_tx: mpsc::Sender<ExitEvent>,
    span: Span,
) {
    debug!(parent: &span, id = %id, exec_id = exec_id.as_deref(), pid, "Waiting for process exit");

    let exit = match tokio::task::spawn_blocking(move || wait_for_child(pid as i32)).await {
        Ok(exit) => exit,
        Err(e) => {
            error!(parent: &span, id = %id, pid, error = %e, "Exit waiter aborted");
            return;
        }
    };

    info!(parent: &span, id = %id, exec_id = exec_id.as_deref(), pid, status = exit.exit_code, "Process reaped");
    let event = ExitEvent {
        id,
        exec_id,
        pid,
        status: exit.exit_code as u32,
        exited_at: SystemTime::now(),
    };
    if exit_tx.send(event).await.is_err() {
        warn!(parent: &span, pid, "Exit listener gone, exit dropped");
    }
}
