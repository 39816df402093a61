//! A single supervised worker process.
//!
//! A [`Worker`] owns the OS process, its [`Relay`], a bounded stderr buffer
//! and the lifecycle state. Workers are created by a [`WorkerFactory`] and
//! driven by the pool; nothing else should call [`Worker::exec`].

mod exit;
mod factory;
mod proc;
mod state;
mod stderr;
pub mod worker_main;

pub use exit::{TerminationReason, analyze_exit_status};
pub use factory::{PipeFactory, SocketFactory, WorkerCommand, WorkerFactory, factory_for};
pub use proc::Proc;
pub use state::{AtomicState, WorkerState};
pub use stderr::{DEFAULT_STDERR_CAPACITY, ErrBuffer, spawn_drain};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{RelayvisorError, Result};
use crate::payload::Payload;
use crate::relay::{Control, Flags, Frame, FrameError, Relay};

/// How long a failed exec waits for the process to exit before diagnosing.
const EXIT_SETTLE: Duration = Duration::from_millis(100);

/// Snapshot of a worker for listings and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub pid: u32,
    pub state: WorkerState,
    pub jobs: u64,
    pub bytes: u64,
    pub created: DateTime<Utc>,
    pub command: String,
}

pub struct Worker {
    pid: u32,
    created: DateTime<Utc>,
    started: Instant,
    command: String,
    state: AtomicState,
    relay: Mutex<Relay>,
    process: Mutex<Proc>,
    stderr: Arc<ErrBuffer>,
    drain: Mutex<Option<JoinHandle<()>>>,
    jobs: AtomicU64,
    bytes: AtomicU64,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("jobs", &self.jobs())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Wrap a spawned process whose relay is connected but not yet verified.
    pub(crate) fn new(
        command: String,
        relay: Relay,
        process: Proc,
        stderr: Arc<ErrBuffer>,
        drain: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            pid: process.pid(),
            created: Utc::now(),
            started: Instant::now(),
            command,
            state: AtomicState::new(WorkerState::Inactive),
            relay: Mutex::new(relay),
            process: Mutex::new(process),
            stderr,
            drain: Mutex::new(drain),
            jobs: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state.load()
    }

    pub fn jobs(&self) -> u64 {
        self.jobs.load(Ordering::Relaxed)
    }

    /// Bytes sent to and received from the worker.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Current contents of the stderr buffer.
    pub fn stderr(&self) -> String {
        self.stderr.snapshot()
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            pid: self.pid,
            state: self.state(),
            jobs: self.jobs(),
            bytes: self.bytes(),
            created: self.created,
            command: self.command.clone(),
        }
    }

    /// Verify the worker's identity and mark it Ready.
    pub(crate) fn handshake(&self) -> Result<()> {
        let mut relay = self.relay.lock().unwrap_or_else(PoisonError::into_inner);
        let reported = relay.handshake().map_err(|e| self.diagnose(e.into()))?;
        drop(relay);
        self.verify_pid(reported)?;
        self.activate()
    }

    /// Fail unless the worker reported the pid of the spawned process.
    pub(crate) fn verify_pid(&self, reported: u32) -> Result<()> {
        if reported != self.pid {
            return Err(RelayvisorError::worker(
                self.pid,
                format!("handshake pid mismatch: worker reported {}", reported),
            ));
        }
        Ok(())
    }

    pub(crate) fn activate(&self) -> Result<()> {
        if self
            .state
            .transition(WorkerState::Inactive, WorkerState::Ready)
        {
            Ok(())
        } else {
            Err(RelayvisorError::worker(
                self.pid,
                format!("cannot activate a worker in state {}", self.state()),
            ))
        }
    }

    /// Run one job. The worker must be Ready.
    ///
    /// On success the worker returns to Ready. On any failure it is left
    /// Invalid and must not be reused.
    pub fn exec(&self, payload: &Payload) -> Result<Payload> {
        if !self
            .state
            .transition(WorkerState::Ready, WorkerState::Working)
        {
            return Err(RelayvisorError::worker(
                self.pid,
                format!("cannot exec on a worker in state {}", self.state()),
            ));
        }

        let mut relay = match self.relay.try_lock() {
            Ok(relay) => relay,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.invalidate();
                return Err(RelayvisorError::worker(
                    self.pid,
                    "relay already in use by another job",
                ));
            }
        };

        let start = Instant::now();
        let result = round_trip(&mut relay, payload);
        drop(relay);

        match result {
            Ok(frame) => {
                let response = Payload::new(frame.context, frame.body);
                self.jobs.fetch_add(1, Ordering::Relaxed);
                self.bytes
                    .fetch_add((payload.len() + response.len()) as u64, Ordering::Relaxed);
                if !self
                    .state
                    .transition(WorkerState::Working, WorkerState::Ready)
                {
                    // Stopped underneath us by a forced shutdown.
                    trace!(pid = self.pid, state = %self.state(), "worker not returned to ready");
                }
                trace!(
                    pid = self.pid,
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "job complete"
                );
                Ok(response)
            }
            Err(JobFailure::ErrorFrame(message)) => {
                self.invalidate();
                debug!(pid = self.pid, error = %message, "worker returned an error frame");
                Err(RelayvisorError::Job(message))
            }
            Err(JobFailure::Transport(err)) => {
                self.invalidate();
                Err(self.diagnose(err.into()))
            }
        }
    }

    /// Mark the worker unusable. Returns false if it was already Invalid or Stopped.
    pub fn invalidate(&self) -> bool {
        self.state.advance(WorkerState::Invalid).is_some()
    }

    /// Whether the OS process is still running.
    pub fn is_alive(&self) -> bool {
        match self.process.try_lock() {
            Ok(mut process) => process.is_running(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_running(),
            // Someone is stopping it right now; check without reaping.
            Err(TryLockError::WouldBlock) => {
                signal::kill(Pid::from_raw(self.pid as i32), None).is_ok()
            }
        }
    }

    /// Ask the worker to exit, escalating to SIGTERM and SIGKILL after `timeout`.
    ///
    /// Must not be called while a job is in flight.
    pub fn stop(&self, timeout: Duration) -> TerminationReason {
        {
            let mut relay = self.relay.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = relay.send_control(&Control::Stop { stop: true }) {
                trace!(pid = self.pid, error = %e, "stop frame not delivered");
            }
            relay.shutdown();
        }

        let reason = {
            let mut process = self.process.lock().unwrap_or_else(PoisonError::into_inner);
            match process.stop(timeout) {
                Ok(reason) => reason,
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "failed to stop worker");
                    TerminationReason::Unknown
                }
            }
        };

        self.state.advance(WorkerState::Stopped);
        self.join_drain();
        debug!(pid = self.pid, reason = %reason, "worker stopped");
        reason
    }

    /// Kill the process immediately, even while a job is in flight.
    ///
    /// The in-flight job, if any, fails with a transport error.
    pub fn kill(&self) {
        let reaped = match self.process.try_lock() {
            Ok(mut process) => process.kill().is_ok(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().kill().is_ok(),
            Err(TryLockError::WouldBlock) => {
                let _ = signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
                false
            }
        };
        self.state.advance(WorkerState::Stopped);
        if reaped {
            self.join_drain();
        }
    }

    /// Exit reason if the process has already terminated.
    pub fn exit_reason(&self) -> Option<TerminationReason> {
        let mut process = self.process.try_lock().ok()?;
        process.try_wait().ok().flatten()
    }

    fn join_drain(&self) {
        let handle = self
            .drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Attach exit status and captured stderr to a transport failure.
    fn diagnose(&self, err: RelayvisorError) -> RelayvisorError {
        let reason = {
            let mut process = self.process.lock().unwrap_or_else(PoisonError::into_inner);
            process.wait_timeout(EXIT_SETTLE).ok().flatten()
        };

        let mut message = err.to_string();
        if let Some(reason) = reason {
            message.push_str(&format!(" (process {})", reason));
            // Give the drain thread a moment to collect the last output.
            let deadline = Instant::now() + EXIT_SETTLE;
            loop {
                let finished = self
                    .drain
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                    .is_none_or(|handle| handle.is_finished());
                if finished || Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        RelayvisorError::Worker {
            pid: self.pid,
            message,
            stderr: self.stderr.snapshot(),
        }
    }
}

enum JobFailure {
    ErrorFrame(String),
    Transport(FrameError),
}

fn round_trip(relay: &mut Relay, payload: &Payload) -> std::result::Result<Frame, JobFailure> {
    relay
        .send(Flags::NONE, payload.context(), payload.body())
        .map_err(JobFailure::Transport)?;
    let frame = relay.receive().map_err(JobFailure::Transport)?;

    if frame.is_error() {
        let text = if frame.body.is_empty() {
            &frame.context
        } else {
            &frame.body
        };
        return Err(JobFailure::ErrorFrame(
            String::from_utf8_lossy(text).into_owned(),
        ));
    }
    if frame.is_control() {
        return Err(JobFailure::Transport(FrameError::Unexpected(
            "control frame in reply to a job".into(),
        )));
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{DEFAULT_MAX_FRAME_SIZE, PidReply, Stream};
    use std::os::unix::net::UnixStream;
    use std::process::Command;

    /// A worker backed by `sleep` whose relay peer is driven by the test.
    fn fake_worker() -> (Worker, Relay) {
        let (a, b) = UnixStream::pair().unwrap();
        let relay = Relay::from_stream(Stream::Unix(a), DEFAULT_MAX_FRAME_SIZE).unwrap();
        let peer = Relay::from_stream(Stream::Unix(b), DEFAULT_MAX_FRAME_SIZE).unwrap();
        let child = Command::new("sleep").arg("60").spawn().unwrap();
        let worker = Worker::new(
            "sleep 60".into(),
            relay,
            Proc::new(child),
            Arc::new(ErrBuffer::default()),
            None,
        );
        (worker, peer)
    }

    #[test]
    fn test_handshake_activates() {
        let (worker, mut peer) = fake_worker();
        let pid = worker.pid();
        let t = std::thread::spawn(move || {
            peer.receive().unwrap();
            peer.send_control(&PidReply { pid }).unwrap();
            peer
        });
        worker.handshake().unwrap();
        assert_eq!(worker.state(), WorkerState::Ready);
        t.join().unwrap();
    }

    #[test]
    fn test_handshake_pid_mismatch() {
        let (worker, mut peer) = fake_worker();
        let t = std::thread::spawn(move || {
            peer.receive().unwrap();
            peer.send_control(&PidReply { pid: 1 }).unwrap();
            peer
        });
        let err = worker.handshake().unwrap_err();
        assert!(err.to_string().contains("mismatch"));
        assert_eq!(worker.state(), WorkerState::Inactive);
        t.join().unwrap();
    }

    #[test]
    fn test_exec_requires_ready() {
        let (worker, _peer) = fake_worker();
        let err = worker.exec(&Payload::body_only("x")).unwrap_err();
        assert!(err.to_string().contains("inactive"));
        assert_eq!(worker.jobs(), 0);
    }

    #[test]
    fn test_exec_round_trip_updates_counters() {
        let (worker, mut peer) = fake_worker();
        worker.activate().unwrap();
        let t = std::thread::spawn(move || {
            let frame = peer.receive().unwrap();
            peer.send(Flags::NONE, &frame.context, &frame.body).unwrap();
            peer
        });

        let out = worker.exec(&Payload::new("ctx", "hello")).unwrap();
        assert_eq!(out.context(), b"ctx");
        assert_eq!(out.body(), b"hello");
        assert_eq!(worker.state(), WorkerState::Ready);
        assert_eq!(worker.jobs(), 1);
        assert_eq!(worker.bytes(), 16);
        t.join().unwrap();
    }

    #[test]
    fn test_error_frame_invalidates() {
        let (worker, mut peer) = fake_worker();
        worker.activate().unwrap();
        let t = std::thread::spawn(move || {
            peer.receive().unwrap();
            peer.send(Flags::ERROR, b"", b"division by zero").unwrap();
            peer
        });

        let err = worker.exec(&Payload::body_only("1/0")).unwrap_err();
        assert!(matches!(err, RelayvisorError::Job(ref m) if m == "division by zero"));
        assert_eq!(worker.state(), WorkerState::Invalid);
        t.join().unwrap();
    }

    #[test]
    fn test_closed_relay_is_worker_error() {
        let (worker, peer) = fake_worker();
        worker.activate().unwrap();
        drop(peer);

        let err = worker.exec(&Payload::body_only("ping")).unwrap_err();
        match err {
            RelayvisorError::Worker { pid, .. } => assert_eq!(pid, worker.pid()),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(worker.state(), WorkerState::Invalid);
        // Invalid workers can never run another job.
        assert!(worker.exec(&Payload::body_only("again")).is_err());
    }

    #[test]
    fn test_kill_stops_worker() {
        let (worker, _peer) = fake_worker();
        worker.activate().unwrap();
        assert!(worker.is_alive());
        worker.kill();
        assert!(!worker.is_alive());
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(worker.exit_reason(), Some(TerminationReason::Killed));
    }
}
