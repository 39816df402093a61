//! Worker lifecycle states and their legal transitions.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker.
///
/// ```text
///   Inactive ──► Ready ◄──► Working
///                  │           │
///                  └─► Invalid ◄┘
///                        │
///   (any) ───────────────┴──► Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum WorkerState {
    /// Spawned, handshake not complete.
    Inactive = 0,
    /// Available for allocation.
    Ready = 1,
    /// Executing exactly one job.
    Working = 2,
    /// Not reusable; waiting to be reaped.
    Invalid = 3,
    /// Process reaped. Terminal.
    Stopped = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Inactive,
            1 => Self::Ready,
            2 => Self::Working,
            3 => Self::Invalid,
            _ => Self::Stopped,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Inactive, Ready)
                | (Ready, Working)
                | (Working, Ready)
                | (Ready, Invalid)
                | (Working, Invalid)
                | (Inactive, Invalid)
                | (Inactive | Ready | Working | Invalid, Stopped)
        )
    }

    /// True while the worker counts against the pool's capacity.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Ready | Self::Working)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Ready => "ready",
            Self::Working => "working",
            Self::Invalid => "invalid",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomically updated worker state.
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(state: WorkerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to` if the current state is `from`.
    ///
    /// Returns false when the state was something else or the transition is
    /// not part of the state machine.
    pub fn transition(&self, from: WorkerState, to: WorkerState) -> bool {
        if !from.can_transition(to) {
            return false;
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `to` from whatever the current state is, if legal.
    ///
    /// Returns the previous state on success.
    pub fn advance(&self, to: WorkerState) -> Option<WorkerState> {
        let mut current = self.load();
        loop {
            if !current.can_transition(to) {
                return None;
            }
            match self.0.compare_exchange(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = WorkerState::from_u8(actual),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkerState::*;

    #[test]
    fn test_legal_transitions() {
        assert!(Inactive.can_transition(Ready));
        assert!(Ready.can_transition(Working));
        assert!(Working.can_transition(Ready));
        assert!(Working.can_transition(Invalid));
        assert!(Ready.can_transition(Invalid));
        assert!(Invalid.can_transition(Stopped));
        assert!(Ready.can_transition(Stopped));
        assert!(Working.can_transition(Stopped));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Invalid.can_transition(Ready));
        assert!(!Invalid.can_transition(Working));
        assert!(!Inactive.can_transition(Working));
        assert!(!Stopped.can_transition(Ready));
        assert!(!Stopped.can_transition(Stopped));
        assert!(!Ready.can_transition(Ready));
    }

    #[test]
    fn test_atomic_transition_requires_expected_state() {
        let state = AtomicState::new(Ready);
        assert!(state.transition(Ready, Working));
        // Second allocation of the same worker must fail.
        assert!(!state.transition(Ready, Working));
        assert_eq!(state.load(), Working);
    }

    #[test]
    fn test_atomic_advance() {
        let state = AtomicState::new(Working);
        assert_eq!(state.advance(Invalid), Some(Working));
        assert_eq!(state.advance(Ready), None);
        assert_eq!(state.advance(Stopped), Some(Invalid));
        assert_eq!(state.advance(Stopped), None);
        assert_eq!(state.load(), Stopped);
    }

    #[test]
    fn test_is_active() {
        assert!(Ready.is_active());
        assert!(Working.is_active());
        assert!(!Invalid.is_active());
        assert!(!Inactive.is_active());
        assert!(!Stopped.is_active());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Working).unwrap(), r#""working""#);
        assert_eq!(Ready.to_string(), "ready");
    }
}
