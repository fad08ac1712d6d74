//! Task lifecycle engine.
//!
//! All transitions for a task happen while its registry entry is locked, so
//! RPC calls, exit notifications and shutdown-driven cleanup of the same id
//! are applied one at a time. Checks run before the controller is asked to
//! do anything; a failed controller call leaves state untouched.

use super::registry::TaskRegistry;
use super::{
    CreateSpec, Deleted, ExecSpec, Exit, ExitEvent, FORCED_EXIT_STATUS, ProcessController,
    ProcessPid, ProcessSnapshot, ProcessState, SIGKILL, Task,
};
use crate::error::{Result, TaskError};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::{OwnedMutexGuard, mpsc};
use tracing::{Span, debug, error, info, warn};

use super::Process;
use super::ProcessState::{Created, Paused, Running, Stopped};

pub struct TaskEngine {
    registry: TaskRegistry,
    controller: Arc<dyn ProcessController>,
    /// Set once a task has been created; the shim owns at most one.
    claimed: AtomicBool,
    /// Set when shutdown begins; no task may be created or started after.
    closed: AtomicBool,
    span: Span,
}

impl TaskEngine {
    pub fn new(controller: Arc<dyn ProcessController>, span: Span) -> Self {
        Self {
            registry: TaskRegistry::new(),
            controller,
            claimed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            span,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    async fn lock(&self, id: &str) -> Result<OwnedMutexGuard<Task>> {
        let entry = self.registry.get(id).await?;
        let task = entry.lock_owned().await;
        if task.is_deleted() {
            return Err(TaskError::NotFound(id.to_string()));
        }
        Ok(task)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fails once shutdown has begun or the task is being force-stopped.
    fn ensure_accepting(&self, task: &Task) -> Result<()> {
        if self.is_closed() || task.is_stopping() {
            return Err(TaskError::AlreadyShuttingDown);
        }
        Ok(())
    }

    /// Allocates the task without starting it.
    pub async fn create(&self, spec: CreateSpec) -> Result<ProcessSnapshot> {
        if spec.id.is_empty() || spec.id.contains('/') {
            return Err(TaskError::InvalidArgument(format!(
                "invalid task id {:?}",
                spec.id
            )));
        }
        if spec.bundle.as_os_str().is_empty() {
            return Err(TaskError::InvalidArgument("bundle path is empty".into()));
        }
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TaskError::AlreadyExists(format!(
                "{} (shim already owns a task)",
                spec.id
            )));
        }

        let task = Task::new(spec.id.clone(), spec.bundle.clone(), spec.stdio.clone());
        let mut task = match self.registry.insert(&spec.id, task).await {
            Ok(task) => task,
            Err(e) => {
                self.claimed.store(false, Ordering::Release);
                return Err(e);
            }
        };

        // Checked after the insert: a shutdown that closed earlier refuses
        // here, one that closes later sees the id in its snapshot.
        if self.is_closed() {
            debug!(parent: &self.span, id = %spec.id, "Create refused during shutdown");
            self.abandon(&mut task, &spec.id).await?;
            return Err(TaskError::AlreadyShuttingDown);
        }

        if let Err(e) = self.controller.create(&spec).await {
            error!(parent: &self.span, id = %spec.id, error = %e, "Failed to create task");
            self.abandon(&mut task, &spec.id).await?;
            return Err(e.into());
        }

        info!(parent: &self.span, id = %spec.id, bundle = %spec.bundle.display(), "Task created");
        task.snapshot(None)
    }

    /// Rolls back a registration whose create did not go through.
    async fn abandon(&self, task: &mut Task, id: &str) -> Result<()> {
        task.init_mut().transition(ProcessState::Deleted)?;
        if let Err(e) = self.registry.remove(id).await {
            warn!(parent: &self.span, id, error = %e, "Failed to drop task entry");
        }
        self.claimed.store(false, Ordering::Release);
        Ok(())
    }

    /// Starts the task, or one of its exec processes.
    pub async fn start(&self, id: &str, exec_id: Option<&str>) -> Result<u32> {
        let mut task = self.lock(id).await?;
        self.ensure_accepting(&task)?;
        if exec_id.is_some() {
            task.init().ensure("start an exec in", &[Running])?;
        }
        task.process(exec_id)?.ensure("start", &[Created])?;

        let pid = self.controller.start(id, exec_id).await?;
        task.process_mut(exec_id)?.started(pid)?;

        info!(parent: &self.span, id, exec_id, pid, "Process started");
        Ok(pid)
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let mut task = self.lock(id).await?;
        self.ensure_accepting(&task)?;
        task.init().ensure("pause", &[Running])?;
        self.controller.pause(id).await?;
        task.init_mut().transition(Paused)?;
        info!(parent: &self.span, id, "Task paused");
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        let mut task = self.lock(id).await?;
        self.ensure_accepting(&task)?;
        task.init().ensure("resume", &[Paused])?;
        self.controller.resume(id).await?;
        task.init_mut().transition(Running)?;
        info!(parent: &self.span, id, "Task resumed");
        Ok(())
    }

    /// Forwards a signal. The state only changes once the exit arrives.
    /// Signalling a process that already stopped is a no-op.
    pub async fn kill(&self, id: &str, exec_id: Option<&str>, signal: u32, all: bool) -> Result<()> {
        let task = self.lock(id).await?;
        let process = task.process(exec_id)?;
        if process.state() == Stopped {
            debug!(parent: &self.span, id, exec_id, signal, "Kill on stopped process ignored");
            return Ok(());
        }
        process.ensure("kill", &[Running, Paused])?;

        self.controller.kill(id, exec_id, signal, all).await?;
        info!(parent: &self.span, id, exec_id, signal, "Signal delivered");
        Ok(())
    }

    /// Applies an exit notification. Returns false when it was discarded.
    pub async fn handle_exit(&self, event: ExitEvent) -> bool {
        let exec_id = event.exec_id.as_deref();
        let mut task = match self.lock(&event.id).await {
            Ok(task) => task,
            Err(_) => {
                debug!(parent: &self.span, id = %event.id, pid = event.pid, "Exit for unknown task discarded");
                return false;
            }
        };
        let process = match task.process_mut(exec_id) {
            Ok(process) => process,
            Err(_) => {
                debug!(parent: &self.span, id = %event.id, exec_id, "Exit for unknown exec discarded");
                return false;
            }
        };

        let applied = process.record_exit(Exit {
            pid: event.pid,
            status: event.status,
            exited_at: event.exited_at,
        });
        if applied {
            info!(parent: &self.span, id = %event.id, exec_id, pid = event.pid, status = event.status, "Process exited");
        } else {
            debug!(parent: &self.span, id = %event.id, exec_id, pid = event.pid, "Duplicate or stale exit discarded");
        }
        applied
    }

    /// Drains exit notifications until the controller side goes away.
    pub async fn run_exit_listener(self: Arc<Self>, mut exit_rx: mpsc::Receiver<ExitEvent>) {
        debug!(parent: &self.span, "Exit listener running");
        while let Some(event) = exit_rx.recv().await {
            self.handle_exit(event).await;
        }
        debug!(parent: &self.span, "Exit channel closed, listener stopping");
    }

    /// Suspends until the process stops. Dropping the future releases the
    /// registration.
    pub async fn wait(&self, id: &str, exec_id: Option<&str>) -> Result<Exit> {
        let mut exit_rx = {
            let task = self.lock(id).await?;
            task.process(exec_id)?.subscribe()
        };

        let exit = *exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TaskError::NotFound(format!("{id} was deleted while waiting")))?;
        exit.ok_or_else(|| TaskError::Internal("exit notification without status".into()))
    }

    /// Releases a stopped (or never started) process.
    pub async fn delete(&self, id: &str, exec_id: Option<&str>) -> Result<Deleted> {
        let mut task = self.lock(id).await?;
        match exec_id {
            Some(exec_id) => self.delete_exec(&mut task, exec_id).await,
            None => self.delete_task(&mut task, false).await,
        }
    }

    async fn delete_exec(&self, task: &mut Task, exec_id: &str) -> Result<Deleted> {
        let id = task.id().to_string();
        task.process(Some(exec_id))?
            .ensure("delete", &[Created, Stopped])?;

        self.controller.delete(&id, Some(exec_id)).await?;

        let mut process = task
            .remove_exec(exec_id)
            .ok_or_else(|| TaskError::NotFound(format!("{id}/{exec_id}")))?;
        process.transition(ProcessState::Deleted)?;

        info!(parent: &self.span, id = %id, exec_id, "Exec deleted");
        Ok(deleted(process.pid(), process.exit()))
    }

    /// With `force`, controller failures are logged instead of returned.
    async fn delete_task(&self, task: &mut Task, force: bool) -> Result<Deleted> {
        let id = task.id().to_string();
        task.init().ensure("delete", &[Created, Stopped])?;

        for exec in task.execs().filter(|p| p.state().is_live()) {
            if let Err(e) = self.controller.kill(&id, exec.exec_id(), SIGKILL, false).await {
                warn!(parent: &self.span, id = %id, exec_id = exec.exec_id(), error = %e, "Failed to kill exec");
            }
        }

        if let Err(e) = self.controller.delete(&id, None).await {
            if !force {
                error!(parent: &self.span, id = %id, error = %e, "Failed to delete task");
                return Err(e.into());
            }
            warn!(parent: &self.span, id = %id, error = %e, "Failed to release task resources");
        }

        for exec in task.drain_execs() {
            if let Err(e) = self.controller.delete(&id, exec.exec_id()).await {
                warn!(parent: &self.span, id = %id, exec_id = exec.exec_id(), error = %e, "Failed to release exec");
            }
        }

        let init = task.init_mut();
        init.transition(ProcessState::Deleted)?;
        let result = deleted(init.pid(), init.exit());
        self.registry.remove(&id).await?;

        info!(parent: &self.span, id = %id, pid = result.pid, status = result.exit_status, "Task deleted");
        Ok(result)
    }

    /// Stops and deletes a task no matter its state.
    ///
    /// Live processes get SIGKILL (paused tasks are resumed first). If no
    /// exit arrives within `timeout`, status 137 is recorded on their behalf.
    /// The task is marked stopping first, so nothing can be started, resumed
    /// or paused while the lock is released for the wait.
    pub async fn force_delete(&self, id: &str, timeout: Duration) -> Result<Deleted> {
        let exit_rx = {
            let mut task = self.lock(id).await?;
            task.mark_stopping();
            let init = task.init();
            if init.state() == Paused {
                if let Err(e) = self.controller.resume(id).await {
                    warn!(parent: &self.span, id, error = %e, "Failed to resume before kill");
                }
            }
            for process in std::iter::once(init).chain(task.execs()) {
                if !process.state().is_live() {
                    continue;
                }
                let all = process.exec_id().is_none();
                if let Err(e) = self.controller.kill(id, process.exec_id(), SIGKILL, all).await {
                    warn!(parent: &self.span, id, exec_id = process.exec_id(), error = %e, "Failed to kill process");
                }
            }
            init.state().is_live().then(|| init.subscribe())
        };

        if let Some(mut exit_rx) = exit_rx {
            let exited = tokio::time::timeout(timeout, exit_rx.wait_for(Option::is_some)).await;
            if exited.is_err() {
                warn!(parent: &self.span, id, "No exit observed after SIGKILL");
            }
        }

        let mut task = self.lock(id).await?;
        let now = SystemTime::now();
        synthesize_exit(task.init_mut(), now);
        for process in task.execs_mut() {
            synthesize_exit(process, now);
        }
        self.delete_task(&mut task, true).await
    }

    /// Refuses new work, then force-deletes every registered task.
    pub async fn shutdown_all(&self, timeout: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        for id in self.registry.ids().await {
            match self.force_delete(&id, timeout).await {
                Ok(result) => {
                    info!(parent: &self.span, id = %id, status = result.exit_status, "Task cleaned up for shutdown");
                }
                Err(TaskError::NotFound(_)) => {}
                Err(e) => {
                    error!(parent: &self.span, id = %id, error = %e, "Failed to clean up task");
                }
            }
        }
    }

    /// Adds an exec process to a running task.
    pub async fn exec(&self, id: &str, spec: ExecSpec) -> Result<()> {
        if spec.exec_id.is_empty() {
            return Err(TaskError::InvalidArgument("exec id is empty".into()));
        }
        let has_args = spec
            .process
            .get("args")
            .and_then(|args| args.as_array())
            .is_some_and(|args| !args.is_empty());
        if !has_args {
            return Err(TaskError::InvalidArgument(
                "exec process needs a non-empty args list".into(),
            ));
        }

        let mut task = self.lock(id).await?;
        self.ensure_accepting(&task)?;
        task.init().ensure("exec in", &[Running])?;
        if task.process(Some(&spec.exec_id)).is_ok() {
            return Err(TaskError::AlreadyExists(format!("{id}/{}", spec.exec_id)));
        }

        self.controller.exec(id, &spec).await?;
        task.insert_exec(spec.exec_id.clone(), spec.stdio)?;

        info!(parent: &self.span, id, exec_id = %spec.exec_id, "Exec created");
        Ok(())
    }

    /// The task pid plus every live exec pid.
    pub async fn pids(&self, id: &str) -> Result<Vec<ProcessPid>> {
        let task = self.lock(id).await?;
        let mut pids: Vec<ProcessPid> = task
            .init()
            .pid()
            .map(|pid| ProcessPid { pid, exec_id: None })
            .into_iter()
            .collect();
        for exec in task.execs().filter(|p| p.state().is_live()) {
            if let Some(pid) = exec.pid() {
                pids.push(ProcessPid {
                    pid,
                    exec_id: exec.exec_id().map(str::to_string),
                });
            }
        }
        Ok(pids)
    }

    pub async fn state(&self, id: &str, exec_id: Option<&str>) -> Result<ProcessSnapshot> {
        self.lock(id).await?.snapshot(exec_id)
    }

    pub async fn stats(&self, id: &str) -> Result<Vec<u8>> {
        let _task = self.lock(id).await?;
        Ok(self.controller.stats(id).await?)
    }

    pub async fn update(&self, id: &str, resources: &[u8]) -> Result<()> {
        if resources.is_empty() {
            return Err(TaskError::InvalidArgument("resources are empty".into()));
        }
        let task = self.lock(id).await?;
        task.init().ensure("update", &[Created, Running, Paused])?;
        self.controller.update(id, resources).await?;
        info!(parent: &self.span, id, "Task resources updated");
        Ok(())
    }

    pub async fn checkpoint(&self, id: &str, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(TaskError::InvalidArgument("checkpoint path is empty".into()));
        }
        let task = self.lock(id).await?;
        task.init().ensure("checkpoint", &[Running, Paused])?;
        self.controller.checkpoint(id, path).await?;
        info!(parent: &self.span, id, path = %path.display(), "Task checkpointed");
        Ok(())
    }

    pub async fn resize_pty(
        &self,
        id: &str,
        exec_id: Option<&str>,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let task = self.lock(id).await?;
        task.process(exec_id)?
            .ensure("resize", &[Created, Running, Paused])?;
        Ok(self.controller.resize_pty(id, exec_id, width, height).await?)
    }

    pub async fn close_io(&self, id: &str, exec_id: Option<&str>) -> Result<()> {
        let task = self.lock(id).await?;
        task.process(exec_id)?
            .ensure("close io of", &[Created, Running, Paused])?;
        Ok(self.controller.close_io(id, exec_id).await?)
    }
}

fn deleted(pid: Option<u32>, exit: Option<Exit>) -> Deleted {
    Deleted {
        pid: pid.unwrap_or(0),
        exit_status: exit.map_or(0, |e| e.status),
        exited_at: exit.map(|e| e.exited_at),
    }
}

fn synthesize_exit(process: &mut Process, now: SystemTime) {
    if let (true, Some(pid)) = (process.state().is_live(), process.pid()) {
        process.record_exit(Exit {
            pid,
            status: FORCED_EXIT_STATUS,
            exited_at: now,
        });
    }
}
