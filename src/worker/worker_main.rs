//! Reference worker, run by `relayvisor internal-worker`.
//!
//! Speaks the relay protocol on stdin/stdout, or dials the socket named in
//! `RELAYVISOR_RELAY`. Each mode exercises one supervisor behavior; real
//! deployments bring their own worker.

use std::io::{self, Write};
use std::os::fd::AsFd;
use std::time::Duration;

use clap::ValueEnum;
use serde_json::{Value, json};

use crate::error::Result;
use crate::relay::{
    Control, DEFAULT_MAX_FRAME_SIZE, Endpoint, Flags, Frame, FrameError, PidReply, RELAY_ENV,
    Relay,
};

/// Behavior of the reference worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkerMode {
    /// Return context and body unchanged.
    Echo,
    /// Uppercase the body, or the `hello` query parameter when the body is empty.
    Upper,
    /// Answer every job with an error frame.
    Error,
    /// Exit without answering the first job.
    Broken,
    /// Exit before the handshake.
    BrokenStart,
    /// Sleep for the configured delay, then echo.
    Slow,
    /// Return the worker's pid as the body.
    Pid,
    /// Copy the body to stderr, then echo.
    Stderr,
}

/// Open the relay this process was spawned with.
fn connect(max_frame: usize) -> Result<Relay> {
    match std::env::var(RELAY_ENV) {
        Ok(dsn) if dsn != "pipes" && !dsn.is_empty() => {
            let stream = Endpoint::parse(&dsn)?.dial()?;
            Relay::from_stream(stream, max_frame)
        }
        _ => {
            let input = io::stdin().as_fd().try_clone_to_owned()?;
            let output = io::stdout().as_fd().try_clone_to_owned()?;
            Ok(Relay::from_fds(input, output, max_frame))
        }
    }
}

/// Worker main loop. Returns when the supervisor sends stop or closes the relay.
pub fn run(mode: WorkerMode, delay: Duration) -> Result<()> {
    if mode == WorkerMode::BrokenStart {
        eprintln!("worker failed to boot: missing bootstrap file");
        std::process::exit(3);
    }

    let mut relay = connect(DEFAULT_MAX_FRAME_SIZE)?;

    loop {
        let frame = match relay.receive() {
            Ok(frame) => frame,
            Err(FrameError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if frame.is_control() {
            match serde_json::from_slice::<Control>(&frame.context)? {
                Control::PidRequest { .. } => {
                    relay.send_control(&PidReply {
                        pid: std::process::id(),
                    })?;
                }
                Control::Stop { .. } => return Ok(()),
            }
            continue;
        }

        let (flags, context, body) = handle(mode, delay, frame);
        relay.send(flags, &context, &body)?;
    }
}

fn handle(mode: WorkerMode, delay: Duration, frame: Frame) -> (Flags, Vec<u8>, Vec<u8>) {
    match mode {
        WorkerMode::Echo | WorkerMode::BrokenStart => (Flags::NONE, frame.context, frame.body),
        WorkerMode::Slow => {
            std::thread::sleep(delay);
            (Flags::NONE, frame.context, frame.body)
        }
        WorkerMode::Stderr => {
            let mut stderr = io::stderr().lock();
            let _ = stderr.write_all(&frame.body);
            let _ = stderr.write_all(b"\n");
            (Flags::NONE, frame.context, frame.body)
        }
        WorkerMode::Pid => (
            Flags::NONE,
            Vec::new(),
            std::process::id().to_string().into_bytes(),
        ),
        WorkerMode::Error => (Flags::ERROR, Vec::new(), b"worker error mode".to_vec()),
        WorkerMode::Broken => {
            eprintln!("fatal: worker crashed while handling a job");
            std::process::exit(2);
        }
        WorkerMode::Upper => {
            let text = if frame.body.is_empty() {
                query_param(&frame.context, "hello").unwrap_or_default()
            } else {
                String::from_utf8_lossy(&frame.body).into_owned()
            };
            let context = json!({
                "status": 201,
                "headers": { "content-type": ["text/plain"] },
            });
            (
                Flags::NONE,
                context.to_string().into_bytes(),
                text.to_uppercase().into_bytes(),
            )
        }
    }
}

/// Look up a query parameter in a gateway request context.
fn query_param(context: &[u8], name: &str) -> Option<String> {
    let context: Value = serde_json::from_slice(context).ok()?;
    let query = context.get("query")?.as_str()?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}
