//! EINTR-safe file descriptor wrapper for the stdio pipe transport.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::process::{ChildStdin, ChildStdout};

/// A pipe end that implements Read/Write and retries on EINTR.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Create from an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl From<ChildStdin> for PipeFd {
    fn from(stdin: ChildStdin) -> Self {
        Self::new(OwnedFd::from(stdin))
    }
}

impl From<ChildStdout> for PipeFd {
    fn from(stdout: ChildStdout) -> Self {
        Self::new(OwnedFd::from(stdout))
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_pipe() -> (PipeFd, PipeFd) {
        let (read_fd, write_fd) = nix::unistd::pipe().expect("Failed to create pipe");
        (PipeFd::new(read_fd), PipeFd::new(write_fd))
    }

    #[test]
    fn test_pipe_read_write() {
        let (mut reader, mut writer) = create_pipe();
        writer.write_all(b"hello relay").unwrap();
        drop(writer);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello relay");
    }

    #[test]
    fn test_write_to_closed_pipe_fails() {
        let (reader, mut writer) = create_pipe();
        drop(reader);
        // SIGPIPE is ignored by the Rust runtime, so this surfaces as EPIPE.
        let err = writer.write_all(b"lost").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
