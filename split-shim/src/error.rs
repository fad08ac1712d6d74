//! Error types for the shim.

use std::io;
use thiserror::Error;
use tonic::Status;

/// Errors surfaced by lifecycle operations.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}: not found")]
    NotFound(String),

    #[error("{0}: already exists")]
    AlreadyExists(String),

    /// Operation is not valid in the target's current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The process controller failed to carry out a request.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}: not implemented")]
    Unimplemented(String),

    #[error("shim is already shutting down")]
    AlreadyShuttingDown,
}

/// Errors reported by a process controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("runtime command failed: {0}")]
    Command(String),

    #[error("{0} is not supported by this controller")]
    Unsupported(String),

    #[error("invalid process spec: {0}")]
    InvalidSpec(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ControllerError> for TaskError {
    fn from(e: ControllerError) -> Self {
        match e {
            ControllerError::Unsupported(what) => TaskError::Unimplemented(what),
            ControllerError::InvalidSpec(msg) => TaskError::InvalidArgument(msg),
            other => TaskError::Internal(other.to_string()),
        }
    }
}

impl From<TaskError> for Status {
    fn from(e: TaskError) -> Self {
        let message = e.to_string();
        match e {
            TaskError::NotFound(_) => Status::not_found(message),
            TaskError::AlreadyExists(_) => Status::already_exists(message),
            TaskError::FailedPrecondition(_) => Status::failed_precondition(message),
            TaskError::InvalidArgument(_) => Status::invalid_argument(message),
            TaskError::Internal(_) => Status::internal(message),
            TaskError::Unimplemented(_) => Status::unimplemented(message),
            TaskError::AlreadyShuttingDown => Status::unavailable(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_unsupported_controller_operation_is_unimplemented() {
        let err: TaskError = ControllerError::Unsupported("resize_pty".to_string()).into();
        assert!(matches!(err, TaskError::Unimplemented(_)));
        assert_eq!(Status::from(err).code(), Code::Unimplemented);
    }

    #[test]
    fn test_command_failure_is_internal() {
        let err: TaskError = ControllerError::Command("exit status 1".to_string()).into();
        assert_eq!(Status::from(err).code(), Code::Internal);
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (TaskError::NotFound("t1".into()), Code::NotFound),
            (TaskError::AlreadyExists("t1".into()), Code::AlreadyExists),
            (
                TaskError::FailedPrecondition("running".into()),
                Code::FailedPrecondition,
            ),
            (TaskError::InvalidArgument("id".into()), Code::InvalidArgument),
            (TaskError::AlreadyShuttingDown, Code::Unavailable),
        ];
        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }
}
