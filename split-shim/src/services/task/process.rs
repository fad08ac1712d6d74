//! Per-process state machine shared by a task and its exec processes.

use super::{Exit, ProcessSnapshot, Stdio};
use crate::error::{Result, TaskError};
use crate::proto::TaskStatus;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::watch;

/// Lifecycle state of a task or exec process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Running,
    Paused,
    Stopped,
    Deleted,
}

impl ProcessState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Stopped, Deleted)
                | (Created, Deleted)
        )
    }

    /// Whether an OS process exists for this state.
    pub fn is_live(self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Paused)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Created => "created",
            ProcessState::Running => "running",
            ProcessState::Paused => "paused",
            ProcessState::Stopped => "stopped",
            ProcessState::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

impl From<ProcessState> for TaskStatus {
    fn from(state: ProcessState) -> Self {
        match state {
            ProcessState::Created => TaskStatus::Created,
            ProcessState::Running => TaskStatus::Running,
            ProcessState::Paused => TaskStatus::Paused,
            ProcessState::Stopped => TaskStatus::Stopped,
            ProcessState::Deleted => TaskStatus::Unknown,
        }
    }
}

/// One supervised process: the task's own process or an exec.
#[derive(Debug)]
pub struct Process {
    name: String,
    exec_id: Option<String>,
    state: ProcessState,
    pid: Option<u32>,
    exit: Option<Exit>,
    stdio: Stdio,
    exit_tx: watch::Sender<Option<Exit>>,
}

impl Process {
    pub(crate) fn new(id: &str, exec_id: Option<String>, stdio: Stdio) -> Self {
        let name = match &exec_id {
            Some(exec_id) => format!("{id}/{exec_id}"),
            None => id.to_string(),
        };
        let (exit_tx, _) = watch::channel(None);
        Self {
            name,
            exec_id,
            state: ProcessState::Created,
            pid: None,
            exit: None,
            stdio,
            exit_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exec_id(&self) -> Option<&str> {
        self.exec_id.as_deref()
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit(&self) -> Option<Exit> {
        self.exit
    }

    pub fn stdio(&self) -> &Stdio {
        &self.stdio
    }

    /// Fails unless the process is in one of `allowed`.
    pub(crate) fn ensure(&self, op: &str, allowed: &[ProcessState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(TaskError::FailedPrecondition(format!(
                "cannot {op} {}: process is {}",
                self.name, self.state
            )))
        }
    }

    pub(crate) fn transition(&mut self, next: ProcessState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(TaskError::FailedPrecondition(format!(
                "{} cannot move from {} to {}",
                self.name, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn started(&mut self, pid: u32) -> Result<()> {
        self.transition(ProcessState::Running)?;
        self.pid = Some(pid);
        Ok(())
    }

    /// Records the exit and moves to `Stopped`. Returns false when the
    /// notification is stale or a duplicate.
    pub(crate) fn record_exit(&mut self, exit: Exit) -> bool {
        if self.exit.is_some() || !self.state.is_live() {
            return false;
        }
        if self.pid.is_some_and(|pid| pid != exit.pid) {
            return false;
        }
        self.exit = Some(exit);
        self.state = ProcessState::Stopped;
        self.exit_tx.send_replace(Some(exit));
        true
    }

    /// Registers interest in the exit. Dropping the receiver releases it.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Exit>> {
        self.exit_tx.subscribe()
    }

    /// Number of waiters currently registered.
    pub fn waiters(&self) -> usize {
        self.exit_tx.receiver_count()
    }
}

/// The task owned by a shim instance together with its exec processes.
#[derive(Debug)]
pub struct Task {
    id: String,
    bundle: PathBuf,
    init: Process,
    execs: HashMap<String, Process>,
    /// A forced stop is under way; no process may be started or resumed.
    stopping: bool,
}

impl Task {
    pub(crate) fn new(id: String, bundle: PathBuf, stdio: Stdio) -> Self {
        let init = Process::new(&id, None, stdio);
        Self {
            id,
            bundle,
            init,
            execs: HashMap::new(),
            stopping: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bundle(&self) -> &PathBuf {
        &self.bundle
    }

    pub fn init(&self) -> &Process {
        &self.init
    }

    pub(crate) fn init_mut(&mut self) -> &mut Process {
        &mut self.init
    }

    pub fn is_deleted(&self) -> bool {
        self.init.state == ProcessState::Deleted
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub(crate) fn mark_stopping(&mut self) {
        self.stopping = true;
    }

    pub fn execs(&self) -> impl Iterator<Item = &Process> {
        self.execs.values()
    }

    pub(crate) fn execs_mut(&mut self) -> impl Iterator<Item = &mut Process> {
        self.execs.values_mut()
    }

    pub fn process(&self, exec_id: Option<&str>) -> Result<&Process> {
        match exec_id {
            None => Ok(&self.init),
            Some(exec_id) => self
                .execs
                .get(exec_id)
                .ok_or_else(|| TaskError::NotFound(format!("{}/{exec_id}", self.id))),
        }
    }

    pub(crate) fn process_mut(&mut self, exec_id: Option<&str>) -> Result<&mut Process> {
        match exec_id {
            None => Ok(&mut self.init),
            Some(exec_id) => self
                .execs
                .get_mut(exec_id)
                .ok_or_else(|| TaskError::NotFound(format!("{}/{exec_id}", self.id))),
        }
    }

    pub(crate) fn insert_exec(&mut self, exec_id: String, stdio: Stdio) -> Result<()> {
        if self.execs.contains_key(&exec_id) {
            return Err(TaskError::AlreadyExists(format!("{}/{exec_id}", self.id)));
        }
        let process = Process::new(&self.id, Some(exec_id.clone()), stdio);
        self.execs.insert(exec_id, process);
        Ok(())
    }

    pub(crate) fn remove_exec(&mut self, exec_id: &str) -> Option<Process> {
        self.execs.remove(exec_id)
    }

    pub(crate) fn drain_execs(&mut self) -> Vec<Process> {
        self.execs.drain().map(|(_, process)| process).collect()
    }

    pub fn snapshot(&self, exec_id: Option<&str>) -> Result<ProcessSnapshot> {
        let process = self.process(exec_id)?;
        Ok(ProcessSnapshot {
            id: self.id.clone(),
            exec_id: process.exec_id.clone(),
            bundle: self.bundle.clone(),
            pid: process.pid,
            state: process.state,
            stdio: process.stdio.clone(),
            exit: process.exit,
        })
    }
}
