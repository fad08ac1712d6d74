//! Test helpers for split-shim integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use split_shim::Config;
use split_shim::error::ControllerError;
use split_shim::proto::task_client::TaskClient;
use split_shim::services::manager::{ShimManager, StartOpts};
use split_shim::services::task::{
    CreateSpec, ExecSpec, ExitEvent, ProcessController, Stdio, TaskEngine,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, SystemTime};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::Span;

type Key = (String, Option<String>);

/// In-memory process controller. Hands out sequential pids and records
/// every call it receives.
pub struct FakeController {
    exit_tx: mpsc::Sender<ExitEvent>,
    next_pid: AtomicU32,
    pids: Mutex<HashMap<Key, u32>>,
    calls: Mutex<Vec<String>>,
    /// Make `start` fail.
    pub fail_start: AtomicBool,
    /// Report an exit with 128+signal whenever a signal is delivered.
    pub exit_on_kill: AtomicBool,
}

impl FakeController {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<ExitEvent>) {
        let (exit_tx, exit_rx) = mpsc::channel(64);
        let controller = Arc::new(Self {
            exit_tx,
            next_pid: AtomicU32::new(1000),
            pids: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
            exit_on_kill: AtomicBool::new(false),
        });
        (controller, exit_rx)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, call: &str) -> bool {
        self.calls().iter().any(|c| c == call)
    }

    pub fn pid_of(&self, id: &str, exec_id: Option<&str>) -> Option<u32> {
        let key = (id.to_string(), exec_id.map(str::to_string));
        self.pids.lock().unwrap().get(&key).copied()
    }

    /// Reports that a started process exited.
    pub async fn exit(&self, id: &str, exec_id: Option<&str>, status: u32) {
        let pid = self.pid_of(id, exec_id).expect("process was never started");
        self.exit_tx
            .send(ExitEvent {
                id: id.to_string(),
                exec_id: exec_id.map(str::to_string),
                pid,
                status,
                exited_at: SystemTime::now(),
            })
            .await
            .unwrap();
    }
}

fn name(id: &str, exec_id: Option<&str>) -> String {
    match exec_id {
        Some(exec_id) => format!("{id}/{exec_id}"),
        None => id.to_string(),
    }
}

#[async_trait]
impl ProcessController for FakeController {
    async fn create(&self, spec: &CreateSpec) -> Result<(), ControllerError> {
        self.record(format!("create {}", spec.id));
        Ok(())
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<(), ControllerError> {
        self.record(format!("exec {id}/{}", spec.exec_id));
        Ok(())
    }

    async fn start(&self, id: &str, exec_id: Option<&str>) -> Result<u32, ControllerError> {
        self.record(format!("start {}", name(id, exec_id)));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ControllerError::Command("start refused".into()));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.pids
            .lock()
            .unwrap()
            .insert((id.to_string(), exec_id.map(str::to_string)), pid);
        Ok(pid)
    }

    async fn kill(
        &self,
        id: &str,
        exec_id: Option<&str>,
        signal: u32,
        _all: bool,
    ) -> Result<(), ControllerError> {
        self.record(format!("kill {} {signal}", name(id, exec_id)));
        if self.exit_on_kill.load(Ordering::SeqCst) {
            if let Some(pid) = self.pid_of(id, exec_id) {
                let _ = self
                    .exit_tx
                    .send(ExitEvent {
                        id: id.to_string(),
                        exec_id: exec_id.map(str::to_string),
                        pid,
                        status: 128 + signal,
                        exited_at: SystemTime::now(),
                    })
                    .await;
            }
        }
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<(), ControllerError> {
        self.record(format!("pause {id}"));
        Ok(())
    }

    async fn resume(&self, id: &str) -> Result<(), ControllerError> {
        self.record(format!("resume {id}"));
        Ok(())
    }

    async fn delete(&self, id: &str, exec_id: Option<&str>) -> Result<(), ControllerError> {
        self.record(format!("delete {}", name(id, exec_id)));
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<Vec<u8>, ControllerError> {
        self.record(format!("stats {id}"));
        Ok(br#"{"cpu":1}"#.to_vec())
    }

    async fn update(&self, id: &str, _resources: &[u8]) -> Result<(), ControllerError> {
        self.record(format!("update {id}"));
        Ok(())
    }

    async fn checkpoint(&self, id: &str, path: &Path) -> Result<(), ControllerError> {
        self.record(format!("checkpoint {id} {}", path.display()));
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

    async fn close_io(&self, id: &str, exec_id: Option<&str>) -> Result<(), ControllerError> {
        self.record(format!("close_io {}", name(id, exec_id)));
        Ok(())
    }
}

/// Engine over a fake controller with its exit listener running.
pub fn engine() -> (Arc<TaskEngine>, Arc<FakeController>) {
    let (controller, exit_rx) = FakeController::new();
    let engine = Arc::new(TaskEngine::new(controller.clone(), Span::none()));
    tokio::spawn(engine.clone().run_exit_listener(exit_rx));
    (engine, controller)
}

pub fn create_spec(id: &str) -> CreateSpec {
    CreateSpec {
        id: id.to_string(),
        bundle: PathBuf::from(format!("/run/bundles/{id}")),
        stdio: Stdio::default(),
        checkpoint: None,
    }
}

pub fn exec_spec(exec_id: &str) -> ExecSpec {
    ExecSpec {
        exec_id: exec_id.to_string(),
        stdio: Stdio::default(),
        process: serde_json::json!({ "args": ["sh", "-c", "sleep 10"], "cwd": "/" }),
    }
}

/// Manager over a fake controller, with short timeouts so forced kills
/// resolve quickly.
pub fn manager(socket_dir: &Path) -> (Arc<ShimManager>, Arc<FakeController>) {
    let (controller, exit_rx) = FakeController::new();
    let config = Config {
        socket_dir: socket_dir.to_path_buf(),
        callback_timeout: Duration::from_secs(5),
        kill_timeout: Duration::from_millis(200),
        ..Config::default()
    };
    let manager = Arc::new(ShimManager::new(
        config,
        controller.clone(),
        exit_rx,
        Span::none(),
    ));
    (manager, controller)
}

/// Starts `manager` for `id` on a socket inside `dir`.
pub async fn start(manager: &ShimManager, dir: &Path, id: &str) -> PathBuf {
    let socket = dir.join(format!("{id}.sock"));
    let address = manager
        .start_shim(id, StartOpts {
            socket: Some(socket.clone()),
        })
        .await
        .expect("StartShim failed");
    assert_eq!(address, format!("unix://{}", socket.display()));
    socket
}

/// gRPC client over the instance's unix socket.
pub async fn connect(socket: PathBuf) -> TaskClient<Channel> {
    let channel = Endpoint::try_from("http://[::]:50051")
        .unwrap()
        .connect_with_connector(tower::service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move {
                Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket).await?))
            }
        }))
        .await
        .expect("Failed to connect to shim");
    TaskClient::new(channel)
}
