//! Shim instance tests over the `containerd.task.v2.Task` gRPC surface.
//!
//! Each test serves on its own unix socket inside a temporary directory.
//!
//! Run with: cargo test -p split-shim --test grpc_test

mod common;

use common::{connect, manager, start};
use split_shim::proto::{
    ConnectRequest, CreateTaskRequest, DeleteRequest, ExecProcessRequest, KillRequest,
    PidsRequest, ResizePtyRequest, ShutdownRequest, StartRequest, StateRequest, TaskStatus,
    WaitRequest,
};
use split_shim::services::manager::StartOpts;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tonic::Code;

fn create_request(id: &str) -> CreateTaskRequest {
    CreateTaskRequest {
        id: id.into(),
        bundle: format!("/run/bundles/{id}"),
        ..Default::default()
    }
}

/// Test: Full task lifecycle over the wire.
#[tokio::test]
async fn test_task_lifecycle_over_grpc() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, controller) = manager(dir.path());
    let socket = start(&manager, dir.path(), "t1").await;
    let mut client = connect(socket).await;

    client.create(create_request("t1")).await.expect("Create failed");

    let pid = client
        .start(StartRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .expect("Start failed")
        .into_inner()
        .pid;
    assert!(pid > 0);

    let state = client
        .state(StateRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .expect("State failed")
        .into_inner();
    assert_eq!(state.status, TaskStatus::Running as i32);
    assert_eq!(state.pid, pid);
    assert_eq!(state.bundle, "/run/bundles/t1");

    let connected = client
        .connect_shim(ConnectRequest { id: "t1".into() })
        .await
        .expect("Connect failed")
        .into_inner();
    assert_eq!(connected.shim_pid, std::process::id());
    assert_eq!(connected.task_pid, pid);

    let pids = client
        .pids(PidsRequest { id: "t1".into() })
        .await
        .expect("Pids failed")
        .into_inner();
    assert_eq!(pids.processes.len(), 1);

    controller.exit_on_kill.store(true, Ordering::SeqCst);
    client
        .kill(KillRequest {
            id: "t1".into(),
            signal: 9,
            ..Default::default()
        })
        .await
        .expect("Kill failed");

    let waited = client
        .wait(WaitRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .expect("Wait failed")
        .into_inner();
    assert_eq!(waited.exit_status, 137);
    assert!(waited.exited_at.is_some());

    let deleted = client
        .delete(DeleteRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .expect("Delete failed")
        .into_inner();
    assert_eq!(deleted.pid, pid);
    assert_eq!(deleted.exit_status, 137);
    assert_eq!(deleted.exited_at, waited.exited_at);

    let err = client
        .state(StateRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_error_codes() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _controller) = manager(dir.path());
    let socket = start(&manager, dir.path(), "t1").await;
    let mut client = connect(socket).await;

    let err = client
        .start(StartRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    client.create(create_request("t1")).await.unwrap();
    let err = client.create(create_request("t1")).await.unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);

    let err = client
        .exec(ExecProcessRequest {
            id: "t1".into(),
            exec_id: "e1".into(),
            spec: br#"{"args":["true"]}"#.to_vec(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    let err = client
        .exec(ExecProcessRequest {
            id: "t1".into(),
            exec_id: "e1".into(),
            spec: b"not json".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = client
        .resize_pty(ResizePtyRequest {
            id: "t1".into(),
            width: 80,
            height: 24,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

/// Test: Shutdown RPC stops the running task and drains the server.
#[tokio::test]
async fn test_shutdown_rpc_stops_task() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, controller) = manager(dir.path());
    let socket = start(&manager, dir.path(), "t1").await;
    let mut client = connect(socket.clone()).await;

    client.create(create_request("t1")).await.unwrap();
    client
        .start(StartRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    controller.exit_on_kill.store(true, Ordering::SeqCst);
    client
        .shutdown(ShutdownRequest {
            id: "t1".into(),
            now: false,
        })
        .await
        .expect("Shutdown failed");
    drop(client);

    let code = tokio::time::timeout(Duration::from_secs(5), manager.wait())
        .await
        .expect("shim did not shut down");
    assert_eq!(code, 0);

    let engine = manager.engine().await.unwrap();
    assert!(engine.registry().is_empty().await);
    assert!(controller.called("kill t1 9"));
    assert!(controller.called("delete t1"));
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_shutdown_without_exit_records_forced_status() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _controller) = manager(dir.path());
    start(&manager, dir.path(), "t1").await;

    let engine = manager.engine().await.unwrap();
    engine.create(common::create_spec("t1")).await.unwrap();
    engine.start("t1", None).await.unwrap();

    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.wait("t1", None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(manager.shutdown().await, 0);
    assert_eq!(waiter.await.unwrap().unwrap().status, 137);
    assert!(engine.registry().is_empty().await);

    // A second trigger is a no-op.
    assert_eq!(manager.shutdown().await, 0);
}

/// Test: Once shutdown has begun, Create is refused and nothing is left
/// behind for the drain to miss.
#[tokio::test]
async fn test_create_refused_during_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, controller) = manager(dir.path());
    let socket = start(&manager, dir.path(), "t1").await;
    let mut client = connect(socket).await;

    // Runs after the task cleanup and keeps the server up until released.
    let (reached_tx, reached_rx) = oneshot::channel();
    let release = Arc::new(Notify::new());
    let hold = release.clone();
    manager
        .coordinator()
        .register_callback("hold", move || async move {
            let _ = reached_tx.send(());
            hold.notified().await;
            Ok(())
        })
        .await
        .unwrap();

    let shutdown = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.shutdown().await })
    };
    reached_rx.await.unwrap();

    let err = client.create(create_request("t1")).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);

    let engine = manager.engine().await.unwrap();
    assert!(engine.is_closed());
    let err = engine.create(common::create_spec("t1")).await.unwrap_err();
    assert!(matches!(
        err,
        split_shim::error::TaskError::AlreadyShuttingDown
    ));

    release.notify_one();
    assert_eq!(shutdown.await.unwrap(), 0);
    assert!(engine.registry().is_empty().await);
    assert!(!controller.called("create t1"));
}

#[tokio::test]
async fn test_start_shim_is_bound_to_one_id() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _controller) = manager(dir.path());
    let socket = start(&manager, dir.path(), "t1").await;

    let again = manager
        .start_shim("t1", StartOpts::default())
        .await
        .unwrap();
    assert_eq!(again, format!("unix://{}", socket.display()));

    let err = manager
        .start_shim("t2", StartOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        split_shim::error::TaskError::FailedPrecondition(_)
    ));
}

#[tokio::test]
async fn test_cleanup() {
    let dir = tempfile::tempdir().unwrap();

    // No instance: the runtime is still asked to release the id.
    let (idle, controller) = manager(dir.path());
    let deleted = idle.cleanup("t1").await.unwrap();
    assert_eq!(deleted.pid, 0);
    assert_eq!(deleted.exit_status, 0);
    assert!(controller.called("kill t1 9"));
    assert!(controller.called("delete t1"));

    // Running task: force-stopped and reaped.
    let (manager, controller) = manager(dir.path());
    start(&manager, dir.path(), "t2").await;
    let engine = manager.engine().await.unwrap();
    engine.create(common::create_spec("t2")).await.unwrap();
    let pid = engine.start("t2", None).await.unwrap();
    controller.exit_on_kill.store(true, Ordering::SeqCst);

    let deleted = manager.cleanup("t2").await.unwrap();
    assert_eq!(deleted.pid, pid);
    assert_eq!(deleted.exit_status, 137);
    assert!(engine.registry().is_empty().await);
}

#[test]
fn test_version_flag() {
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_containerd-shim-split-v2"))
        .arg("--version")
        .output()
        .expect("Failed to run shim binary");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with(r#"Split API containerd shim: id: "io.containerd.split.v2""#));
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}
