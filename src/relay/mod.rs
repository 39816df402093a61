//! Framed bidirectional channel to a single worker process.
//!
//! A [`Relay`] hides the transport (stdio pipes, unix socket or TCP) behind a
//! single read-frame/write-frame contract. Transport choice only affects how
//! the connection is set up.

mod frame;
mod pipe;
mod socket;

pub use frame::{
    DEFAULT_MAX_FRAME_SIZE, Flags, Frame, FrameError, HEADER_SIZE, Header, PROTOCOL_VERSION,
    read_frame, write_frame,
};
pub use pipe::PipeFd;
pub use socket::{Endpoint, Listener, Stream};

use std::io::{BufReader, BufWriter, Read, Write};
use std::os::fd::OwnedFd;
use std::process::{ChildStdin, ChildStdout};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RelayvisorError, Result};

/// Buffer size for relay I/O (64KB).
const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Environment variable through which a worker learns its relay DSN.
pub const RELAY_ENV: &str = "RELAYVISOR_RELAY";

/// Relay transport selected in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDsn {
    /// stdin/stdout of the spawned process.
    Pipes,
    /// Supervisor listens on this endpoint; workers connect back.
    Socket(Endpoint),
}

impl FromStr for RelayDsn {
    type Err = RelayvisorError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "pipes" {
            return Ok(Self::Pipes);
        }
        Endpoint::parse(s).map(Self::Socket).map_err(|e| match e {
            RelayvisorError::InvalidSocketDsn => {
                RelayvisorError::Config(format!("invalid relay DSN '{}'", s))
            }
            other => RelayvisorError::Config(format!("invalid relay DSN '{}': {}", s, other)),
        })
    }
}

impl std::fmt::Display for RelayDsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipes => write!(f, "pipes"),
            Self::Socket(endpoint) => write!(f, "{}", endpoint),
        }
    }
}

/// Control command sent from the supervisor to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Control {
    /// Ask the worker for its pid.
    PidRequest { pid: bool },
    /// Ask the worker to exit.
    Stop { stop: bool },
}

/// Worker's answer to [`Control::PidRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidReply {
    pub pid: u32,
}

/// Framed channel to a worker.
pub struct Relay {
    reader: BufReader<Box<dyn Read + Send>>,
    writer: BufWriter<Box<dyn Write + Send>>,
    socket: Option<Stream>,
    max_frame: usize,
}

impl Relay {
    /// Relay over the stdio pipes of a child process.
    pub fn from_pipes(stdin: ChildStdin, stdout: ChildStdout, max_frame: usize) -> Self {
        Self::from_parts(
            Box::new(PipeFd::from(stdout)),
            Box::new(PipeFd::from(stdin)),
            None,
            max_frame,
        )
    }

    /// Relay over raw descriptors, such as a worker's own stdin and stdout.
    pub fn from_fds(input: OwnedFd, output: OwnedFd, max_frame: usize) -> Self {
        Self::from_parts(
            Box::new(PipeFd::new(input)),
            Box::new(PipeFd::new(output)),
            None,
            max_frame,
        )
    }

    /// Relay over a connected socket.
    pub fn from_stream(stream: Stream, max_frame: usize) -> Result<Self> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Ok(Self::from_parts(
            Box::new(reader),
            Box::new(writer),
            Some(stream),
            max_frame,
        ))
    }

    fn from_parts(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        socket: Option<Stream>,
        max_frame: usize,
    ) -> Self {
        Self {
            reader: BufReader::with_capacity(RELAY_BUFFER_SIZE, reader),
            writer: BufWriter::with_capacity(RELAY_BUFFER_SIZE, writer),
            socket,
            max_frame,
        }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Write one frame.
    pub fn send(&mut self, flags: Flags, context: &[u8], body: &[u8]) -> Result<(), FrameError> {
        write_frame(&mut self.writer, flags, context, body, self.max_frame)
    }

    /// Block until one frame is read.
    pub fn receive(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.reader, self.max_frame)
    }

    /// Send a JSON control frame.
    pub fn send_control<T: Serialize>(&mut self, command: &T) -> Result<(), FrameError> {
        let context = serde_json::to_vec(command)
            .map_err(|e| FrameError::Malformed(format!("control encoding failed: {}", e)))?;
        self.send(Flags::CONTROL, &context, &[])
    }

    /// Ask the peer for its pid and wait for the answer.
    pub fn handshake(&mut self) -> Result<u32, FrameError> {
        self.send_control(&Control::PidRequest { pid: true })?;
        let frame = self.receive()?;
        if !frame.is_control() {
            return Err(FrameError::Unexpected(
                "expected a control frame in reply to the pid request".into(),
            ));
        }
        let reply: PidReply = serde_json::from_slice(&frame.context)
            .map_err(|e| FrameError::Unexpected(format!("invalid pid reply: {}", e)))?;
        Ok(reply.pid)
    }

    /// Shut down the underlying socket so a blocked peer read returns.
    ///
    /// No-op for pipes; those close when the relay is dropped.
    pub fn shutdown(&self) {
        if let Some(socket) = &self.socket {
            let _ = socket.shutdown();
        }
    }
}
