//! Shim manager - the per-instance entry point.
//!
//! Owns the shutdown coordinator and, once [`ShimManager::start_shim`] has
//! run, the task engine and the gRPC server bound to the instance socket.

use crate::Config;
use crate::error::{Result, TaskError};
use crate::proto::task_server::TaskServer;
use crate::services::shutdown::ShutdownCoordinator;
use crate::services::task::{
    Deleted, ExitEvent, ProcessController, SIGKILL, TaskApiHandler, TaskEngine,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Span, error, info, warn};

/// Options for [`ShimManager::start_shim`].
#[derive(Debug, Clone, Default)]
pub struct StartOpts {
    /// Socket to listen on instead of the one derived from the config.
    pub socket: Option<PathBuf>,
}

struct Instance {
    id: String,
    address: String,
    engine: Arc<TaskEngine>,
    server: Option<JoinHandle<std::result::Result<(), tonic::transport::Error>>>,
}

pub struct ShimManager {
    config: Config,
    controller: Arc<dyn ProcessController>,
    exit_rx: Mutex<Option<mpsc::Receiver<ExitEvent>>>,
    coordinator: Arc<ShutdownCoordinator>,
    instance: Mutex<Option<Instance>>,
    span: Span,
}

impl ShimManager {
    /// `exit_rx` must be the receiving end of the channel `controller`
    /// reports exits on.
    pub fn new(
        config: Config,
        controller: Arc<dyn ProcessController>,
        exit_rx: mpsc::Receiver<ExitEvent>,
        span: Span,
    ) -> Self {
        let coordinator = Arc::new(ShutdownCoordinator::new(
            config.callback_timeout,
            span.clone(),
        ));
        Self {
            config,
            controller,
            exit_rx: Mutex::new(Some(exit_rx)),
            coordinator,
            instance: Mutex::new(None),
            span,
        }
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    /// The engine of the started instance, if any.
    pub async fn engine(&self) -> Option<Arc<TaskEngine>> {
        self.instance.lock().await.as_ref().map(|i| i.engine.clone())
    }

    /// Brings the instance up and returns the address of its RPC surface.
    ///
    /// Starting again with the same id returns the existing address.
    pub async fn start_shim(&self, id: &str, opts: StartOpts) -> Result<String> {
        let mut instance = self.instance.lock().await;
        if let Some(existing) = instance.as_ref() {
            if existing.id == id {
                return Ok(existing.address.clone());
            }
            return Err(TaskError::FailedPrecondition(format!(
                "shim already started for {}",
                existing.id
            )));
        }
        if self.coordinator.is_shutting_down() {
            return Err(TaskError::AlreadyShuttingDown);
        }

        let socket = opts.socket.unwrap_or_else(|| self.config.socket_path(id));
        let listener = bind(&socket).await?;

        let exit_rx = self
            .exit_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| TaskError::Internal("exit channel already in use".into()))?;
        let engine = Arc::new(TaskEngine::new(self.controller.clone(), self.span.clone()));
        tokio::spawn(engine.clone().run_exit_listener(exit_rx));

        let cleanup = engine.clone();
        let kill_timeout = self.config.kill_timeout;
        self.coordinator
            .register_callback("tasks", move || async move {
                cleanup.shutdown_all(kill_timeout).await;
                Ok(())
            })
            .await?;

        let handler = TaskApiHandler::new(engine.clone(), self.coordinator.clone(), self.span.clone());
        let coordinator = self.coordinator.clone();
        let span = self.span.clone();
        let socket_path = socket.clone();
        let server = tokio::spawn(async move {
            let result = Server::builder()
                .add_service(TaskServer::new(handler))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    coordinator.wait().await;
                })
                .await;
            if let Err(e) = tokio::fs::remove_file(&socket_path).await {
                warn!(parent: &span, socket = %socket_path.display(), error = %e, "Failed to remove socket");
            }
            result
        });

        let address = format!("unix://{}", socket.display());
        info!(parent: &self.span, id, address = %address, "Shim started");
        *instance = Some(Instance {
            id: id.to_string(),
            address: address.clone(),
            engine,
            server: Some(server),
        });
        Ok(address)
    }

    /// Force-terminates and reaps the task outside the normal RPC flow.
    ///
    /// Without a started instance or a registered task the runtime is still
    /// asked to kill and release `id`, and a zeroed result is returned.
    pub async fn cleanup(&self, id: &str) -> Result<Deleted> {
        info!(parent: &self.span, id, "Cleanup requested");
        if let Some(engine) = self.engine().await {
            match engine.force_delete(id, self.config.kill_timeout).await {
                Err(TaskError::NotFound(_)) => {}
                other => return other,
            }
        }

        if let Err(e) = self.controller.kill(id, None, SIGKILL, true).await {
            warn!(parent: &self.span, id, error = %e, "Cleanup kill failed");
        }
        if let Err(e) = self.controller.delete(id, None).await {
            warn!(parent: &self.span, id, error = %e, "Cleanup delete failed");
        }
        Ok(Deleted::default())
    }

    /// Runs the shutdown sequence and returns the exit code.
    pub async fn shutdown(&self) -> i32 {
        self.coordinator.trigger().await
    }

    /// Resolves once shutdown completed and the server has drained.
    pub async fn wait(&self) -> i32 {
        let code = self.coordinator.wait().await;
        let server = self
            .instance
            .lock()
            .await
            .as_mut()
            .and_then(|i| i.server.take());
        if let Some(server) = server {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(parent: &self.span, error = %e, "gRPC server failed"),
                Err(e) => error!(parent: &self.span, error = %e, "gRPC server task aborted"),
            }
        }
        code
    }
}

async fn bind(socket: &Path) -> Result<UnixListener> {
    let io_err = |e: std::io::Error| {
        TaskError::Internal(format!("socket {}: {e}", socket.display()))
    };
    if let Some(dir) = socket.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    }
    match tokio::fs::remove_file(socket).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_err(e)),
    }
    UnixListener::bind(socket).map_err(io_err)
}
