//! Worker spawning over pipes or sockets.

use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, instrument, trace, warn};

use super::Worker;
use super::proc::Proc;
use super::stderr::{ErrBuffer, spawn_drain};
use crate::config::WorkersConfig;
use crate::error::{RelayvisorError, Result};
use crate::events::EventBus;
use crate::relay::{Endpoint, Listener, RELAY_ENV, Relay, RelayDsn, Stream};

/// Poll interval for the socket accept loop and pid routing.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Slice used to notice an early child exit while waiting for its connection.
const EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// How long a timed-out pipe handshake gets to unwind after its worker is killed.
const HANDSHAKE_KILL_GRACE: Duration = Duration::from_secs(1);

/// Creates workers for a pool.
pub trait WorkerFactory: Send + Sync {
    /// Spawn a process and return it as a Ready worker.
    fn spawn_worker(&self) -> Result<Worker>;

    /// Release transport resources. Called when the last pool using it is destroyed.
    fn close(&self) {}
}

/// Program and arguments of the worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
}

impl WorkerCommand {
    /// Split a command line on whitespace. No shell quoting is interpreted.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| RelayvisorError::Config("worker command is empty".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn command(&self, relay: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.env(RELAY_ENV, relay);
        cmd
    }

    fn spawn(&self, mut cmd: Command) -> Result<Child> {
        cmd.spawn().map_err(|e| RelayvisorError::Spawn {
            command: self.to_string(),
            message: e.to_string(),
        })
    }
}

impl std::fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Start draining stderr and wrap the process. Logs instead of failing
/// when the drain thread cannot be started.
fn supervise(child: &mut Child, events: &EventBus) -> (Arc<ErrBuffer>, Option<JoinHandle<()>>) {
    let buffer = Arc::new(ErrBuffer::default());
    let drain = child.stderr.take().and_then(|stderr| {
        spawn_drain(child.id(), stderr, Arc::clone(&buffer), events.clone())
            .map_err(|e| warn!(pid = child.id(), error = %e, "Failed to start stderr drain"))
            .ok()
    });
    (buffer, drain)
}

/// Workers that talk over their stdin/stdout.
pub struct PipeFactory {
    command: WorkerCommand,
    relay_timeout: Duration,
    max_frame: usize,
    events: EventBus,
}

impl PipeFactory {
    pub fn new(
        command: WorkerCommand,
        relay_timeout: Duration,
        max_frame: usize,
        events: EventBus,
    ) -> Self {
        Self {
            command,
            relay_timeout,
            max_frame,
            events,
        }
    }
}

impl WorkerFactory for PipeFactory {
    #[instrument(level = "debug", skip(self), fields(command = %self.command))]
    fn spawn_worker(&self) -> Result<Worker> {
        let mut cmd = self.command.command("pipes");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = self.command.spawn(cmd)?;
        let pid = child.id();
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = Proc::new(child).kill();
                return Err(RelayvisorError::worker(pid, "stdio pipes were not captured"));
            }
        };
        let (buffer, drain) = supervise(&mut child, &self.events);
        let relay = Relay::from_pipes(stdin, stdout, self.max_frame);
        let worker = Worker::new(
            self.command.to_string(),
            relay,
            Proc::new(child),
            buffer,
            drain,
        );

        // Blocking reads on a pipe can't time out; run the handshake aside.
        let (tx, rx) = bounded(1);
        let handle = std::thread::Builder::new()
            .name(format!("handshake-{}", pid))
            .spawn(move || {
                let result = worker.handshake();
                let _ = tx.send(());
                (worker, result)
            })?;

        if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(self.relay_timeout) {
            warn!(pid, timeout = ?self.relay_timeout, "Worker handshake timed out");
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            // A grandchild holding the stdout pipe keeps the read blocked past the kill.
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(HANDSHAKE_KILL_GRACE) {
                warn!(pid, "Handshake read still blocked after kill, abandoning it");
                return Err(RelayvisorError::worker(
                    pid,
                    format!("handshake timed out after {:?}", self.relay_timeout),
                ));
            }
        }

        let (worker, result) = handle
            .join()
            .map_err(|_| RelayvisorError::worker(pid, "handshake thread panicked"))?;
        match result {
            Ok(()) => {
                debug!(pid, "Worker ready");
                Ok(worker)
            }
            Err(e) => {
                worker.kill();
                Err(e)
            }
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u32, Sender<Relay>>>>;

/// Workers that connect back to a listening socket.
///
/// Accepted connections are matched to spawned processes by the pid each
/// worker reports in its handshake.
pub struct SocketFactory {
    command: WorkerCommand,
    dsn: String,
    relay_timeout: Duration,
    events: EventBus,
    pending: PendingMap,
    stopping: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl SocketFactory {
    /// Bind `endpoint` and start accepting worker connections.
    pub fn new(
        endpoint: &Endpoint,
        command: WorkerCommand,
        relay_timeout: Duration,
        max_frame: usize,
        events: EventBus,
    ) -> Result<Self> {
        let listener = endpoint.listen()?;
        listener.set_nonblocking(true)?;
        let dsn = child_dsn(endpoint, &listener);
        debug!(network = listener.network(), dsn = %dsn, "Relay listener bound");

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let stopping = Arc::new(AtomicBool::new(false));
        let acceptor = {
            let pending = Arc::clone(&pending);
            let stopping = Arc::clone(&stopping);
            std::thread::Builder::new()
                .name("relay-accept".to_string())
                .spawn(move || accept_loop(listener, pending, stopping, relay_timeout, max_frame))?
        };

        Ok(Self {
            command,
            dsn,
            relay_timeout,
            events,
            pending,
            stopping,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    /// DSN handed to spawned workers.
    pub fn dsn(&self) -> &str {
        &self.dsn
    }
}

impl WorkerFactory for SocketFactory {
    #[instrument(level = "debug", skip(self), fields(command = %self.command, dsn = %self.dsn))]
    fn spawn_worker(&self) -> Result<Worker> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(RelayvisorError::PoolStopped);
        }

        let mut cmd = self.command.command(&self.dsn);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let (tx, rx) = bounded(1);
        let mut child = self.command.spawn(cmd)?;
        let pid = child.id();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, tx);
        let (buffer, drain) = supervise(&mut child, &self.events);
        let mut process = Proc::new(child);

        let deadline = Instant::now() + self.relay_timeout;
        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(RelayvisorError::worker(
                    pid,
                    format!("worker did not connect within {:?}", self.relay_timeout),
                ));
            }
            match rx.recv_timeout(remaining.min(EXIT_CHECK_INTERVAL)) {
                Ok(relay) => break Ok(relay),
                Err(RecvTimeoutError::Timeout) => {
                    if let Ok(Some(reason)) = process.try_wait() {
                        break Err(RelayvisorError::Worker {
                            pid,
                            message: format!("worker exited before connecting ({})", reason),
                            stderr: buffer.snapshot(),
                        });
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(RelayvisorError::worker(pid, "relay listener closed"));
                }
            }
        };
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);

        match outcome {
            Ok(relay) => {
                let worker = Worker::new(self.command.to_string(), relay, process, buffer, drain);
                worker.activate()?;
                debug!(pid, "Worker ready");
                Ok(worker)
            }
            Err(e) => {
                let _ = process.kill();
                if let Some(drain) = drain {
                    let _ = drain.join();
                }
                Err(e)
            }
        }
    }

    fn close(&self) {
        self.stopping.store(true, Ordering::Release);
        let handle = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for SocketFactory {
    fn drop(&mut self) {
        self.close();
    }
}

/// DSN a child can dial, with wildcard hosts and port 0 resolved.
fn child_dsn(endpoint: &Endpoint, listener: &Listener) -> String {
    match (endpoint, listener.port()) {
        (Endpoint::Tcp(address), Some(port)) => {
            let host = address.rsplit_once(':').map(|(h, _)| h).unwrap_or("");
            let host = if host.is_empty() || host == "0.0.0.0" {
                "127.0.0.1"
            } else {
                host
            };
            format!("tcp://{}:{}", host, port)
        }
        _ => endpoint.to_string(),
    }
}

fn accept_loop(
    listener: Listener,
    pending: PendingMap,
    stopping: Arc<AtomicBool>,
    relay_timeout: Duration,
    max_frame: usize,
) {
    while !stopping.load(Ordering::Acquire) {
        match listener.accept() {
            Ok(stream) => {
                let pending = Arc::clone(&pending);
                let spawned = std::thread::Builder::new()
                    .name("relay-handshake".to_string())
                    .spawn(move || route_connection(stream, pending, relay_timeout, max_frame));
                if let Err(e) = spawned {
                    warn!(error = %e, "Failed to start relay handshake thread");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(SOCKET_POLL_INTERVAL);
            }
            Err(e) => {
                warn!(error = %e, "Relay accept failed");
                std::thread::sleep(SOCKET_POLL_INTERVAL);
            }
        }
    }
    trace!("Relay accept loop stopped");
}

/// Handshake one accepted connection and hand it to the spawner waiting on its pid.
fn route_connection(stream: Stream, pending: PendingMap, relay_timeout: Duration, max_frame: usize) {
    let deadline = Instant::now() + relay_timeout;
    let result = (|| -> Result<(u32, Relay)> {
        let control = stream.try_clone()?;
        control.set_read_timeout(Some(relay_timeout))?;
        let mut relay = Relay::from_stream(stream, max_frame)?;
        let pid = relay.handshake()?;
        control.set_read_timeout(None)?;
        Ok((pid, relay))
    })();

    let (pid, relay) = match result {
        Ok(found) => found,
        Err(e) => {
            debug!(error = %e, "Rejected relay connection");
            return;
        }
    };

    // The spawner registers the pid right after spawn; the child may be faster.
    while Instant::now() < deadline {
        let waiter = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
        if let Some(waiter) = waiter {
            if waiter.send(relay).is_err() {
                debug!(pid, "Spawner gave up before the relay arrived");
            }
            return;
        }
        std::thread::sleep(SOCKET_POLL_INTERVAL);
    }
    warn!(pid, "Relay connection from an unknown pid");
}

/// Build the factory configured for a pool.
pub fn factory_for(config: &WorkersConfig, events: &EventBus) -> Result<Arc<dyn WorkerFactory>> {
    let command = WorkerCommand::parse(&config.command)?;
    let relay_timeout = config.relay_timeout();
    let max_frame = config.pool.max_frame_size();
    match config.relay_dsn()? {
        RelayDsn::Pipes => Ok(Arc::new(PipeFactory::new(
            command,
            relay_timeout,
            max_frame,
            events.clone(),
        ))),
        RelayDsn::Socket(endpoint) => Ok(Arc::new(SocketFactory::new(
            &endpoint,
            command,
            relay_timeout,
            max_frame,
            events.clone(),
        )?)),
    }
}
