//! OCI runtime controller.
//!
//! Drives a runc-compatible CLI (runc, youki, crun) on behalf of the task
//! engine. Process exits are observed by reaping and reported as
//! [`ExitEvent`]s.

mod worker;

pub use worker::Runtime;

use crate::error::ControllerError;
use crate::services::task::{CreateSpec, ExecSpec, ExitEvent, ProcessController, Stdio};
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, mpsc};
use tracing::{Span, info, warn};

const INIT_PID_FILE: &str = "init.pid";

/// What the controller remembers about a container between calls.
#[derive(Debug)]
struct Container {
    bundle: PathBuf,
    stdio: Stdio,
    checkpoint: Option<PathBuf>,
    /// Pid of the container init, known after `create`.
    pid: Option<u32>,
    execs: HashMap<String, ExecEntry>,
}

#[derive(Debug)]
struct ExecEntry {
    process_file: PathBuf,
    stdio: Stdio,
    pid: Option<u32>,
}

pub struct RuncController {
    runtime: Runtime,
    containers: Mutex<HashMap<String, Container>>,
    exit_tx: mpsc::Sender<ExitEvent>,
    span: Span,
}

impl RuncController {
    pub fn new(runtime: Runtime, exit_tx: mpsc::Sender<ExitEvent>, span: Span) -> Self {
        Self {
            runtime,
            containers: Mutex::new(HashMap::new()),
            exit_tx,
            span,
        }
    }

    fn watch_exit(&self, id: &str, exec_id: Option<&str>, pid: u32) {
        tokio::spawn(worker::wait_for_process_exit(
            id.to_string(),
            exec_id.map(str::to_string),
            pid,
            self.exit_tx.clone(),
            self.span.clone(),
        ));
    }

    async fn start_init(&self, id: &str) -> Result<u32, ControllerError> {
        let (bundle, stdio, checkpoint, created_pid) = {
            let containers = self.containers.lock().await;
            let container = containers
                .get(id)
                .ok_or_else(|| ControllerError::Command(format!("container {id} was not created")))?;
            (
                container.bundle.clone(),
                container.stdio.clone(),
                container.checkpoint.clone(),
                container.pid,
            )
        };

        let pid = match checkpoint {
            Some(image) => {
                let pid_file = bundle.join(INIT_PID_FILE);
                let image = path_arg(&image);
                let bundle_arg = path_arg(&bundle);
                let pid_arg = path_arg(&pid_file);
                let args = [
                    "restore",
                    "--detach",
                    "--image-path",
                    &image,
                    "--bundle",
                    &bundle_arg,
                    "--pid-file",
                    &pid_arg,
                    id,
                ];
                self.runtime.run_with_stdio(&args, &stdio, &self.span).await?;
                worker::read_pid_file(&pid_file).await?
            }
            None => {
                self.runtime.output(&["start", id], &self.span).await?;
                created_pid.ok_or_else(|| {
                    ControllerError::Command(format!("no pid recorded for container {id}"))
                })?
            }
        };

        if let Some(container) = self.containers.lock().await.get_mut(id) {
            container.pid = Some(pid);
        }
        Ok(pid)
    }

    async fn start_exec(&self, id: &str, exec_id: &str) -> Result<u32, ControllerError> {
        let (bundle, process_file, stdio) = {
            let containers = self.containers.lock().await;
            let container = containers
                .get(id)
                .ok_or_else(|| ControllerError::Command(format!("container {id} was not created")))?;
            let exec = container
                .execs
                .get(exec_id)
                .ok_or_else(|| ControllerError::Command(format!("exec {id}/{exec_id} was not staged")))?;
            (
                container.bundle.clone(),
                exec.process_file.clone(),
                exec.stdio.clone(),
            )
        };

        let pid_file = bundle.join(format!("{exec_id}.pid"));
        let process_arg = path_arg(&process_file);
        let pid_arg = path_arg(&pid_file);
        let args = [
            "exec",
            "--process",
            &process_arg,
            "--pid-file",
            &pid_arg,
            "--detach",
            id,
        ];
        self.runtime.run_with_stdio(&args, &stdio, &self.span).await?;
        let pid = worker::read_pid_file(&pid_file).await?;

        if let Some(exec) = self
            .containers
            .lock()
            .await
            .get_mut(id)
            .and_then(|c| c.execs.get_mut(exec_id))
        {
            exec.pid = Some(pid);
        }
        Ok(pid)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl ProcessController for RuncController {
    async fn create(&self, spec: &CreateSpec) -> Result<(), ControllerError> {
        if spec.stdio.terminal {
            return Err(ControllerError::Unsupported("terminal".into()));
        }

        // Restores are created and started in one runtime call.
        let pid = match &spec.checkpoint {
            Some(_) => None,
            None => {
                let pid_file = spec.bundle.join(INIT_PID_FILE);
                let bundle_arg = path_arg(&spec.bundle);
                let pid_arg = path_arg(&pid_file);
                let args = [
                    "create",
                    "--bundle",
                    &bundle_arg,
                    "--pid-file",
                    &pid_arg,
                    &spec.id,
                ];
                self.runtime
                    .run_with_stdio(&args, &spec.stdio, &self.span)
                    .await?;
                Some(worker::read_pid_file(&pid_file).await?)
            }
        };

        info!(parent: &self.span, id = %spec.id, pid, "Container created");
        self.containers.lock().await.insert(
            spec.id.clone(),
            Container {
                bundle: spec.bundle.clone(),
                stdio: spec.stdio.clone(),
                checkpoint: spec.checkpoint.clone(),
                pid,
                execs: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<(), ControllerError> {
        if spec.stdio.terminal {
            return Err(ControllerError::Unsupported("terminal".into()));
        }
        if !spec.process.is_object() {
            return Err(ControllerError::InvalidSpec(
                "process must be a JSON object".into(),
            ));
        }

        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| ControllerError::Command(format!("container {id} was not created")))?;

        let process_file = container.bundle.join(format!("{}.process.json", spec.exec_id));
        let contents = serde_json::to_vec(&spec.process)
            .map_err(|e| ControllerError::InvalidSpec(e.to_string()))?;
        tokio::fs::write(&process_file, contents).await?;

        container.execs.insert(
            spec.exec_id.clone(),
            ExecEntry {
                process_file,
                stdio: spec.stdio.clone(),
                pid: None,
            },
        );
        Ok(())
    }

    async fn start(&self, id: &str, exec_id: Option<&str>) -> Result<u32, ControllerError> {
        let pid = match exec_id {
            None => self.start_init(id).await?,
            Some(exec_id) => self.start_exec(id, exec_id).await?,
        };
        self.watch_exit(id, exec_id, pid);
        Ok(pid)
    }

    async fn kill(
        &self,
        id: &str,
        exec_id: Option<&str>,
        signal: u32,
        all: bool,
    ) -> Result<(), ControllerError> {
        let Some(exec_id) = exec_id else {
            let signal = signal.to_string();
            let mut args = vec!["kill"];
            if all {
                args.push("--all");
            }
            args.extend([id, signal.as_str()]);
            self.runtime.output(&args, &self.span).await?;
            return Ok(());
        };

        let pid = self
            .containers
            .lock()
            .await
            .get(id)
            .and_then(|c| c.execs.get(exec_id))
            .and_then(|exec| exec.pid)
            .ok_or_else(|| ControllerError::Command(format!("exec {id}/{exec_id} has no pid")))?;
        let signal = Signal::try_from(signal as i32)
            .map_err(|_| ControllerError::InvalidSpec(format!("unknown signal {signal}")))?;
        kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| ControllerError::Command(format!("kill {pid}: {e}")))
    }

    async fn pause(&self, id: &str) -> Result<(), ControllerError> {
        self.runtime.output(&["pause", id], &self.span).await?;
        Ok(())
    }

    async fn resume(&self, id: &str) -> Result<(), ControllerError> {
        self.runtime.output(&["resume", id], &self.span).await?;
        Ok(())
    }

    async fn delete(&self, id: &str, exec_id: Option<&str>) -> Result<(), ControllerError> {
        if let Some(exec_id) = exec_id {
            let exec = self
                .containers
                .lock()
                .await
                .get_mut(id)
                .and_then(|c| c.execs.remove(exec_id));
            if let Some(exec) = exec {
                let _ = tokio::fs::remove_file(&exec.process_file).await;
            }
            return Ok(());
        }

        self.runtime
            .output(&["delete", "--force", id], &self.span)
            .await?;
        if let Some(container) = self.containers.lock().await.remove(id) {
            for exec in container.execs.values() {
                let _ = tokio::fs::remove_file(&exec.process_file).await;
            }
            if let Err(e) = tokio::fs::remove_file(container.bundle.join(INIT_PID_FILE)).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(parent: &self.span, id, error = %e, "Failed to remove pid file");
                }
            }
        }
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<Vec<u8>, ControllerError> {
        self.runtime
            .output(&["events", "--stats", id], &self.span)
            .await
    }

    async fn update(&self, id: &str, resources: &[u8]) -> Result<(), ControllerError> {
        let bundle = self
            .containers
            .lock()
            .await
            .get(id)
            .map(|c| c.bundle.clone())
            .ok_or_else(|| ControllerError::Command(format!("container {id} was not created")))?;

        let resources_file = bundle.join("resources.json");
        tokio::fs::write(&resources_file, resources).await?;
        let resources_arg = path_arg(&resources_file);
        let result = self
            .runtime
            .output(&["update", "--resources", &resources_arg, id], &self.span)
            .await;
        let _ = tokio::fs::remove_file(&resources_file).await;
        result.map(|_| ())
    }

    async fn checkpoint(&self, id: &str, path: &Path) -> Result<(), ControllerError> {
        let image = path_arg(path);
        self.runtime
            .output(&["checkpoint", "--image-path", &image, id], &self.span)
            .await?;
        Ok(())
    }

    async fn resize_pty(
        &self,
        _id: &str,
        _exec_id: Option<&str>,
        _width: u32,
        _height: u32,
    ) -> Result<(), ControllerError> {
        Err(ControllerError::Unsupported("pty resize".into()))
    }

    async fn close_io(&self, _id: &str, _exec_id: Option<&str>) -> Result<(), ControllerError> {
        Err(ControllerError::Unsupported("closing stdin".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::task::Stdio;

    fn controller(runtime: &str) -> (RuncController, mpsc::Receiver<ExitEvent>) {
        let (tx, rx) = mpsc::channel(4);
        let runtime = Runtime {
            path: PathBuf::from(runtime),
            root: None,
        };
        (RuncController::new(runtime, tx, Span::none()), rx)
    }

    #[tokio::test]
    async fn test_terminal_is_unsupported() {
        let (controller, _rx) = controller("/nonexistent/runc");
        let spec = CreateSpec {
            id: "t1".into(),
            bundle: PathBuf::from("/tmp"),
            stdio: Stdio {
                terminal: true,
                ..Stdio::default()
            },
            checkpoint: None,
        };
        let err = controller.create(&spec).await.unwrap_err();
        assert!(matches!(err, ControllerError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_missing_runtime_binary_is_a_command_error() {
        let (controller, _rx) = controller("/nonexistent/runc");
        let err = controller.pause("t1").await.unwrap_err();
        assert!(matches!(err, ControllerError::Command(_)));
    }

    #[tokio::test]
    async fn test_exec_requires_created_container() {
        let (controller, _rx) = controller("/nonexistent/runc");
        let spec = ExecSpec {
            exec_id: "e1".into(),
            stdio: Stdio::default(),
            process: serde_json::json!({ "args": ["true"] }),
        };
        assert!(controller.exec("t1", &spec).await.is_err());
    }

    #[tokio::test]
    async fn test_exec_process_is_staged_in_bundle() {
        let bundle = tempfile::tempdir().unwrap();
        let (controller, _rx) = controller("/nonexistent/runc");
        controller.containers.lock().await.insert(
            "t1".into(),
            Container {
                bundle: bundle.path().to_path_buf(),
                stdio: Stdio::default(),
                checkpoint: None,
                pid: Some(100),
                execs: HashMap::new(),
            },
        );

        let spec = ExecSpec {
            exec_id: "e1".into(),
            stdio: Stdio::default(),
            process: serde_json::json!({ "args": ["sh", "-c", "true"] }),
        };
        controller.exec("t1", &spec).await.unwrap();

        let staged = bundle.path().join("e1.process.json");
        let contents: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&staged).unwrap()).unwrap();
        assert_eq!(contents["args"][0], "sh");

        controller.delete("t1", Some("e1")).await.unwrap();
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_pty_and_stdin_close_are_unsupported() {
        let (controller, _rx) = controller("runc");
        assert!(matches!(
            controller.resize_pty("t1", None, 80, 24).await,
            Err(ControllerError::Unsupported(_))
        ));
        assert!(matches!(
            controller.close_io("t1", None).await,
            Err(ControllerError::Unsupported(_))
        ));
    }
}
