//! Task API Handler - gRPC implementation of `containerd.task.v2.Task`.

use super::{CreateSpec, ExecSpec, ProcessSnapshot, Stdio, TaskEngine};
use crate::error::TaskError;
use crate::proto::{
    CheckpointTaskRequest, CloseIoRequest, ConnectRequest, ConnectResponse, CreateTaskRequest,
    CreateTaskResponse, DeleteRequest, DeleteResponse, Empty, ExecProcessRequest, KillRequest,
    PauseRequest, PidsRequest, PidsResponse, ProcessInfo, ResizePtyRequest, ResumeRequest,
    ShutdownRequest, StartRequest, StartResponse, StateRequest, StateResponse, StatsRequest,
    StatsResponse, TaskStatus, Timestamp, UpdateTaskRequest, WaitRequest, WaitResponse,
    task_server::Task as TaskService,
};
use crate::services::shutdown::ShutdownCoordinator;
use std::path::PathBuf;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{Span, info, warn};

/// Task API Handler for gRPC requests.
pub struct TaskApiHandler {
    engine: Arc<TaskEngine>,
    coordinator: Arc<ShutdownCoordinator>,
    span: Span,
}

impl TaskApiHandler {
    pub fn new(engine: Arc<TaskEngine>, coordinator: Arc<ShutdownCoordinator>, span: Span) -> Self {
        Self {
            engine,
            coordinator,
            span,
        }
    }
}

/// Empty exec ids on the wire address the task's own process.
fn exec_ref(exec_id: &str) -> Option<&str> {
    (!exec_id.is_empty()).then_some(exec_id)
}

fn state_response(snapshot: ProcessSnapshot) -> StateResponse {
    StateResponse {
        id: snapshot.id,
        bundle: snapshot.bundle.to_string_lossy().into_owned(),
        pid: snapshot.pid.unwrap_or(0),
        status: TaskStatus::from(snapshot.state).into(),
        stdin: snapshot.stdio.stdin,
        stdout: snapshot.stdio.stdout,
        stderr: snapshot.stdio.stderr,
        terminal: snapshot.stdio.terminal,
        exit_status: snapshot.exit.map_or(0, |e| e.status),
        exited_at: snapshot.exit.map(|e| Timestamp::from(e.exited_at)),
        exec_id: snapshot.exec_id.unwrap_or_default(),
    }
}

#[tonic::async_trait]
impl TaskService for TaskApiHandler {
    async fn create(
        &self,
        request: Request<CreateTaskRequest>,
    ) -> Result<Response<CreateTaskResponse>, Status> {
        let req = request.into_inner();
        info!(parent: &self.span, id = %req.id, bundle = %req.bundle, "API: Create");

        let spec = CreateSpec {
            id: req.id,
            bundle: PathBuf::from(req.bundle),
            stdio: Stdio {
                stdin: req.stdin,
                stdout: req.stdout,
                stderr: req.stderr,
                terminal: req.terminal,
            },
            checkpoint: (!req.checkpoint.is_empty()).then(|| PathBuf::from(req.checkpoint)),
        };
        let snapshot = self.engine.create(spec).await?;

        Ok(Response::new(CreateTaskResponse {
            pid: snapshot.pid.unwrap_or(0),
        }))
    }

    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        let req = request.into_inner();
        info!(parent: &self.span, id = %req.id, exec_id = %req.exec_id, "API: Start");

        let pid = self.engine.start(&req.id, exec_ref(&req.exec_id)).await?;
        Ok(Response::new(StartResponse { pid }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        info!(parent: &self.span, id = %req.id, exec_id = %req.exec_id, "API: Delete");

        let deleted = self.engine.delete(&req.id, exec_ref(&req.exec_id)).await?;
        Ok(Response::new(deleted.into()))
    }

    async fn exec(&self, request: Request<ExecProcessRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!(parent: &self.span, id = %req.id, exec_id = %req.exec_id, "API: Exec");

        let process: serde_json::Value = serde_json::from_slice(&req.spec).map_err(|e| {
            Status::from(TaskError::InvalidArgument(format!(
                "exec spec is not valid JSON: {e}"
            )))
        })?;
        let spec = ExecSpec {
            exec_id: req.exec_id,
            stdio: Stdio {
                stdin: req.stdin,
                stdout: req.stdout,
                stderr: req.stderr,
                terminal: req.terminal,
            },
            process,
        };
        self.engine.exec(&req.id, spec).await?;
        Ok(Response::new(Empty {}))
    }

    async fn resize_pty(
        &self,
        request: Request<ResizePtyRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.engine
            .resize_pty(&req.id, exec_ref(&req.exec_id), req.width, req.height)
            .await?;
        Ok(Response::new(Empty {}))
    }

    async fn state(
        &self,
        request: Request<StateRequest>,
    ) -> Result<Response<StateResponse>, Status> {
        let req = request.into_inner();
        let snapshot = self.engine.state(&req.id, exec_ref(&req.exec_id)).await?;
        Ok(Response::new(state_response(snapshot)))
    }

    async fn pause(&self, request: Request<PauseRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!(parent: &self.span, id = %req.id, "API: Pause");
        self.engine.pause(&req.id).await?;
        Ok(Response::new(Empty {}))
    }

    async fn resume(&self, request: Request<ResumeRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!(parent: &self.span, id = %req.id, "API: Resume");
        self.engine.resume(&req.id).await?;
        Ok(Response::new(Empty {}))
    }

    async fn kill(&self, request: Request<KillRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!(
            parent: &self.span,
            id = %req.id,
            exec_id = %req.exec_id,
            signal = req.signal,
            "API: Kill"
        );
        self.engine
            .kill(&req.id, exec_ref(&req.exec_id), req.signal, req.all)
            .await?;
        Ok(Response::new(Empty {}))
    }

    async fn pids(&self, request: Request<PidsRequest>) -> Result<Response<PidsResponse>, Status> {
        let req = request.into_inner();
        let processes = self
            .engine
            .pids(&req.id)
            .await?
            .into_iter()
            .map(|p| ProcessInfo {
                pid: p.pid,
                exec_id: p.exec_id.unwrap_or_default(),
            })
            .collect();
        Ok(Response::new(PidsResponse { processes }))
    }

    async fn close_io(&self, request: Request<CloseIoRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        if !req.stdin {
            return Ok(Response::new(Empty {}));
        }
        self.engine.close_io(&req.id, exec_ref(&req.exec_id)).await?;
        Ok(Response::new(Empty {}))
    }

    async fn checkpoint(
        &self,
        request: Request<CheckpointTaskRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!(parent: &self.span, id = %req.id, path = %req.path, "API: Checkpoint");
        self.engine
            .checkpoint(&req.id, &PathBuf::from(req.path))
            .await?;
        Ok(Response::new(Empty {}))
    }

    async fn connect_shim(
        &self,
        request: Request<ConnectRequest>,
    ) -> Result<Response<ConnectResponse>, Status> {
        let req = request.into_inner();
        let snapshot = self.engine.state(&req.id, None).await?;
        Ok(Response::new(ConnectResponse {
            shim_pid: std::process::id(),
            task_pid: snapshot.pid.unwrap_or(0),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    async fn shutdown(&self, request: Request<ShutdownRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!(parent: &self.span, id = %req.id, now = req.now, "API: Shutdown");

        if self.coordinator.is_shutting_down() {
            warn!(parent: &self.span, "Shutdown already in progress");
            return Ok(Response::new(Empty {}));
        }

        // The response has to leave before the server drains.
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            coordinator.trigger().await;
        });

        Ok(Response::new(Empty {}))
    }

    async fn stats(
        &self,
        request: Request<StatsRequest>,
    ) -> Result<Response<StatsResponse>, Status> {
        let req = request.into_inner();
        let stats = self.engine.stats(&req.id).await?;
        Ok(Response::new(StatsResponse { stats }))
    }

    async fn update(
        &self,
        request: Request<UpdateTaskRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!(parent: &self.span, id = %req.id, "API: Update");
        self.engine.update(&req.id, &req.resources).await?;
        Ok(Response::new(Empty {}))
    }

    async fn wait(&self, request: Request<WaitRequest>) -> Result<Response<WaitResponse>, Status> {
        let req = request.into_inner();
        info!(parent: &self.span, id = %req.id, exec_id = %req.exec_id, "API: Wait");

        let exit = self.engine.wait(&req.id, exec_ref(&req.exec_id)).await?;
        Ok(Response::new(WaitResponse {
            exit_status: exit.status,
            exited_at: Some(exit.exited_at.into()),
        }))
    }
}

impl From<super::Deleted> for DeleteResponse {
    fn from(deleted: super::Deleted) -> Self {
        DeleteResponse {
            pid: deleted.pid,
            exit_status: deleted.exit_status,
            exited_at: deleted.exited_at.map(Timestamp::from),
        }
    }
}
