//! Shutdown coordination.
//!
//! Components register cleanup callbacks while the shim is running. The
//! first [`ShutdownCoordinator::trigger`] runs them in registration order,
//! each under a deadline; later triggers just wait for that drain to finish.
//!
//! ```text
//! register_callback ──► [cb1, cb2, ...]
//!
//! trigger() ──► Draining ──► cb1 (timeout) ──► cb2 (timeout) ──► done(code)
//! trigger() ──────────────────────────── wait ───────────────────┘
//! ```

use crate::error::TaskError;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{Span, debug, error, info, warn};

/// Non-zero exit requested by a callback.
#[derive(Debug, Error)]
#[error("exit {code}: {message}")]
pub struct ExitReason {
    pub code: i32,
    pub message: String,
}

pub type CallbackFuture = Pin<Box<dyn Future<Output = Result<(), ExitReason>> + Send>>;
type Callback = Box<dyn FnOnce() -> CallbackFuture + Send>;

enum Phase {
    Accepting(Vec<(String, Callback)>),
    Draining,
}

pub struct ShutdownCoordinator {
    phase: Mutex<Phase>,
    triggered: AtomicBool,
    done: watch::Sender<Option<i32>>,
    callback_timeout: Duration,
    span: Span,
}

impl ShutdownCoordinator {
    pub fn new(callback_timeout: Duration, span: Span) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            phase: Mutex::new(Phase::Accepting(Vec::new())),
            triggered: AtomicBool::new(false),
            done,
            callback_timeout,
            span,
        }
    }

    /// Appends a callback to run on shutdown.
    pub async fn register_callback<F, Fut>(&self, name: &str, callback: F) -> Result<(), TaskError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ExitReason>> + Send + 'static,
    {
        let mut phase = self.phase.lock().await;
        match &mut *phase {
            Phase::Accepting(callbacks) => {
                let callback: Callback = Box::new(move || Box::pin(callback()));
                callbacks.push((name.to_string(), callback));
                debug!(parent: &self.span, callback = name, "Shutdown callback registered");
                Ok(())
            }
            Phase::Draining => Err(TaskError::AlreadyShuttingDown),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Runs the shutdown sequence once and returns the exit code.
    ///
    /// The caller must not drop this future midway; spawn it when in doubt.
    pub async fn trigger(&self) -> i32 {
        let callbacks = {
            let mut phase = self.phase.lock().await;
            match std::mem::replace(&mut *phase, Phase::Draining) {
                Phase::Accepting(callbacks) => callbacks,
                Phase::Draining => {
                    drop(phase);
                    return self.wait().await;
                }
            }
        };
        self.triggered.store(true, Ordering::Release);
        info!(parent: &self.span, callbacks = callbacks.len(), "Shutdown triggered");

        let mut code = 0;
        for (name, callback) in callbacks {
            match tokio::time::timeout(self.callback_timeout, callback()).await {
                Ok(Ok(())) => {
                    debug!(parent: &self.span, callback = %name, "Shutdown callback finished");
                }
                Ok(Err(reason)) => {
                    error!(parent: &self.span, callback = %name, code = reason.code, reason = %reason.message, "Shutdown callback failed");
                    if code == 0 {
                        code = reason.code;
                    }
                }
                Err(_) => {
                    warn!(parent: &self.span, callback = %name, timeout = ?self.callback_timeout, "Shutdown callback abandoned");
                }
            }
        }

        info!(parent: &self.span, code, "Shutdown complete");
        self.done.send_replace(Some(code));
        code
    }

    /// Resolves with the exit code once a triggered shutdown has finished.
    pub async fn wait(&self) -> i32 {
        let mut done = self.done.subscribe();
        match done.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(0),
            Err(_) => 0,
        }
    }
}
