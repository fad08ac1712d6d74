//! Signal handling utilities for the shim process.

use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

/// Completes when the process receives SIGINT, SIGTERM or SIGQUIT.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Information about a child process exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: i32,
    pub exit_code: i32,
}

/// Wait for a specific child process to exit.
/// This is a blocking call and should be spawned in a separate task.
pub fn wait_for_child(pid: i32) -> ChildExit {
    let status = waitpid(Pid::from_raw(pid), None);
    ChildExit {
        pid,
        exit_code: exit_code(status),
    }
}

/// Shell convention: the exit code, or 128 plus the terminating signal.
fn exit_code(status: nix::Result<WaitStatus>) -> i32 {
    match status {
        Ok(WaitStatus::Exited(_, code)) => code,
        Ok(WaitStatus::Signaled(_, sig, _)) => 128 + (sig as i32),
        _ => 255,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn test_exit_code_mapping() {
        let pid = Pid::from_raw(10);
        assert_eq!(exit_code(Ok(WaitStatus::Exited(pid, 3))), 3);
        assert_eq!(
            exit_code(Ok(WaitStatus::Signaled(pid, Signal::SIGKILL, false))),
            137
        );
        assert_eq!(exit_code(Err(nix::errno::Errno::ECHILD)), 255);
    }

    #[test]
    fn test_wait_for_child_reports_exit_code() {
        let child = std::process::Command::new("sh")
            .args(["-c", "exit 7"])
            .spawn()
            .unwrap();
        let exit = wait_for_child(child.id() as i32);
        assert_eq!(exit.exit_code, 7);
    }
}
