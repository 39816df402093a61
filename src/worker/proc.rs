//! Process handle for worker subprocesses.

use std::process::Child;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::exit::{TerminationReason, analyze_exit_status};
use crate::error::{RelayvisorError, Result};

/// Poll interval while waiting for a process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(100);

/// Handle to a worker subprocess.
///
/// Owns the `Child`; the process is always reaped, at the latest on drop.
pub struct Proc {
    pid: Pid,
    child: Child,
    /// Set once the exit status has been collected.
    exit: Option<TerminationReason>,
}

impl Proc {
    /// Wrap a spawned child. Its stdio handles must already have been taken.
    pub fn new(child: Child) -> Self {
        Self {
            pid: Pid::from_raw(child.id() as i32),
            child,
            exit: None,
        }
    }

    /// Get the process ID.
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Exit reason, if the process has been reaped.
    pub fn exit_reason(&self) -> Option<TerminationReason> {
        self.exit
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Try to reap the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(reason) = self.exit {
            return Ok(Some(reason));
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let reason = analyze_exit_status(status);
                self.exit = Some(reason);
                Ok(Some(reason))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(RelayvisorError::worker(
                self.pid(),
                format!("waitpid failed: {}", e),
            )),
        }
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<TerminationReason>> {
        let start = Instant::now();
        loop {
            if let Some(reason) = self.try_wait()? {
                return Ok(Some(reason));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM).map_err(|e| {
            RelayvisorError::worker(self.pid(), format!("Failed to send SIGTERM: {}", e))
        })
    }

    /// Send SIGKILL to the process and reap it.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = self.exit {
            return Ok(reason);
        }
        // ESRCH only means it already exited; wait() below still reaps it.
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        let status = self.child.wait().map_err(|e| {
            RelayvisorError::worker(self.pid(), format!("waitpid failed: {}", e))
        })?;
        let reason = analyze_exit_status(status);
        self.exit = Some(reason);
        Ok(reason)
    }

    /// Wait for a voluntary exit, then escalate to SIGTERM and SIGKILL.
    ///
    /// The caller is expected to have asked the worker to stop already.
    pub fn stop(&mut self, timeout: Duration) -> Result<TerminationReason> {
        if let Some(reason) = self.wait_timeout(timeout)? {
            return Ok(reason);
        }

        let _ = self.terminate();
        if let Some(reason) = self.wait_timeout(TERM_GRACE)? {
            return Ok(reason);
        }

        self.kill()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn test_proc_exit_code() {
        let child = Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .expect("Failed to spawn sh");
        let mut proc = Proc::new(child);

        let reason = proc.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reason, Some(TerminationReason::Exited(3)));
        assert!(!proc.is_running());
    }

    #[test]
    fn test_proc_stop_escalates_to_terminate() {
        let child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::null())
            .spawn()
            .expect("Failed to spawn sleep");
        let mut proc = Proc::new(child);
        assert!(proc.is_running());

        let start = Instant::now();
        let reason = proc.stop(Duration::from_millis(50)).unwrap();
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGTERM));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!proc.is_running());
    }

    #[test]
    fn test_proc_kill() {
        let child = Command::new("sleep").arg("60").spawn().unwrap();
        let mut proc = Proc::new(child);
        assert_eq!(proc.kill().unwrap(), TerminationReason::Killed);
        // Killing twice returns the recorded reason.
        assert_eq!(proc.kill().unwrap(), TerminationReason::Killed);
    }

    #[test]
    fn test_proc_drop_reaps() {
        let child = Command::new("sleep").arg("60").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        drop(Proc::new(child));
        // Reaped processes can no longer be signaled.
        assert!(signal::kill(pid, None).is_err());
    }
}
