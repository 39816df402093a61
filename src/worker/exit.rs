//! Crash analysis for worker processes.
//!
//! Classifies process termination so diagnostics can say why a worker died.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal not covered below.
    Signaled(Signal),
    /// SIGKILL: our own forced stop, or the OOM killer.
    Killed,
    /// SIGSEGV.
    Segfault,
    /// SIGBUS (also how stack overflows surface on macOS).
    BusError,
    /// Process is still running.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Check if the process crashed rather than exiting on its own.
    pub fn is_crash(&self) -> bool {
        matches!(
            self,
            Self::Segfault | Self::BusError | Self::Killed | Self::Signaled(_)
        )
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Killed => "killed (SIGKILL, possibly by the OOM killer)".to_string(),
            Self::Segfault => "segmentation fault (SIGSEGV)".to_string(),
            Self::BusError => "bus error (SIGBUS)".to_string(),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze an `ExitStatus` to determine the termination reason.
pub fn analyze_exit_status(status: ExitStatus) -> TerminationReason {
    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }

    match status.signal().map(Signal::try_from) {
        Some(Ok(Signal::SIGKILL)) => TerminationReason::Killed,
        Some(Ok(Signal::SIGSEGV)) => TerminationReason::Segfault,
        Some(Ok(Signal::SIGBUS)) => TerminationReason::BusError,
        Some(Ok(signal)) => TerminationReason::Signaled(signal),
        _ => TerminationReason::Unknown,
    }
}
