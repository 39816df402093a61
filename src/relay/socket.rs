//! Socket endpoints shared by the relay transports and the control plane.
//!
//! Both accept the same DSN forms: `tcp://[host]:<port>` and `unix://<path>`.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RelayvisorError, Result};

/// A parsed socket DSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`; the host may be empty.
    Tcp(String),
    /// Filesystem path of a unix-domain socket.
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse a `scheme://address` DSN.
    pub fn parse(dsn: &str) -> Result<Self> {
        let (scheme, address) = dsn
            .split_once("://")
            .ok_or(RelayvisorError::InvalidSocketDsn)?;

        match scheme {
            "tcp" => {
                let (_, port) = address
                    .rsplit_once(':')
                    .ok_or(RelayvisorError::InvalidSocketDsn)?;
                port.parse::<u16>()
                    .map_err(|_| RelayvisorError::InvalidSocketDsn)?;
                Ok(Self::Tcp(address.to_string()))
            }
            "unix" if !address.is_empty() => Ok(Self::Unix(PathBuf::from(address))),
            "unix" => Err(RelayvisorError::InvalidSocketDsn),
            other => Err(RelayvisorError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Address to bind; an empty host binds all interfaces.
    fn bind_address(address: &str) -> String {
        match address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port),
            None => address.to_string(),
        }
    }

    /// Address to dial; an empty host dials loopback.
    fn dial_address(address: &str) -> String {
        match address.strip_prefix(':') {
            Some(port) => format!("127.0.0.1:{}", port),
            None => address.to_string(),
        }
    }

    /// Start listening on this endpoint.
    ///
    /// A stale unix socket file left behind by a previous run is removed first.
    pub fn listen(&self) -> Result<Listener> {
        match self {
            Self::Tcp(address) => {
                let listener = TcpListener::bind(Self::bind_address(address))?;
                Ok(Listener::Tcp(listener))
            }
            Self::Unix(path) => {
                if let Ok(meta) = fs::symlink_metadata(path)
                    && meta.file_type().is_socket()
                {
                    fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                let meta = fs::metadata(path)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                    inode: (meta.dev(), meta.ino()),
                })
            }
        }
    }

    /// Connect to this endpoint.
    pub fn dial(&self) -> Result<Stream> {
        match self {
            Self::Tcp(address) => {
                let stream = TcpStream::connect(Self::dial_address(address))?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            Self::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path)?)),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(address) => write!(f, "tcp://{}", address),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A bound listener. Unix listeners unlink their socket file on drop, unless
/// another listener has since been bound at the same path.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix {
        listener: UnixListener,
        path: PathBuf,
        /// Device and inode of the socket file created at bind.
        inode: (u64, u64),
    },
}

impl Listener {
    /// Accept one connection.
    ///
    /// Accepted streams are always blocking, whatever the listener mode.
    pub fn accept(&self) -> io::Result<Stream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                Ok(Stream::Unix(stream))
            }
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(listener) => listener.set_nonblocking(nonblocking),
            Self::Unix { listener, .. } => listener.set_nonblocking(nonblocking),
        }
    }

    /// Network name, `"tcp"` or `"unix"`.
    pub fn network(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Unix { .. } => "unix",
        }
    }

    /// Human-readable local address.
    pub fn local_address(&self) -> io::Result<String> {
        match self {
            Self::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
            Self::Unix { path, .. } => Ok(path.display().to_string()),
        }
    }

    /// Local TCP port, if this is a TCP listener.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok().map(|a| a.port()),
            Self::Unix { .. } => None,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Unix { path, inode, .. } = self
            && let Ok(meta) = fs::metadata(&*path)
            && (meta.dev(), meta.ino()) == *inode
        {
            let _ = fs::remove_file(path);
        }
    }
}

/// A connected byte stream.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(s) => Ok(Self::Tcp(s.try_clone()?)),
            Self::Unix(s) => Ok(Self::Unix(s.try_clone()?)),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_read_timeout(timeout),
            Self::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(Shutdown::Both),
            Self::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }

    /// Network name, `"tcp"` or `"unix"`.
    pub fn network(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Unix(_) => "unix",
        }
    }

    /// Human-readable peer address.
    pub fn peer_address(&self) -> io::Result<String> {
        match self {
            Self::Tcp(s) => Ok(s.peer_addr()?.to_string()),
            Self::Unix(s) => Ok(s
                .peer_addr()?
                .as_pathname()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            Endpoint::parse("tcp://:6001").unwrap(),
            Endpoint::Tcp(":6001".into())
        );
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:7000").unwrap(),
            Endpoint::Tcp("127.0.0.1:7000".into())
        );
    }

    #[test]
    fn test_parse_unix() {
        assert_eq!(
            Endpoint::parse("unix://rpc.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("rpc.sock"))
        );
    }

    #[test]
    fn test_parse_missing_separator() {
        let err = Endpoint::parse("uni:unix.sock").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid socket DSN (tcp://:6001, unix://rpc.sock)"
        );
    }

    #[test]
    fn test_parse_unknown_scheme() {
        let err = Endpoint::parse("xinu://unix.sock").unwrap_err();
        assert!(matches!(err, RelayvisorError::UnsupportedScheme(s) if s == "xinu"));
    }

    #[test]
    fn test_parse_bad_port() {
        assert!(Endpoint::parse("tcp://localhost").is_err());
        assert!(Endpoint::parse("tcp://:http").is_err());
        assert!(Endpoint::parse("unix://").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for dsn in ["tcp://:6001", "unix://rpc.sock", "tcp://10.0.0.1:80"] {
            assert_eq!(Endpoint::parse(dsn).unwrap().to_string(), dsn);
        }
    }

    #[test]
    fn test_tcp_listen_and_dial() {
        let listener = Endpoint::Tcp("127.0.0.1:0".into()).listen().unwrap();
        let port = listener.port().unwrap();
        let endpoint = Endpoint::Tcp(format!(":{}", port));

        let mut client = endpoint.dial().unwrap();
        let mut server = listener.accept().unwrap();
        client.write_all(b"ping").unwrap();

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(client.peer_address().unwrap(), format!("127.0.0.1:{}", port));
    }

    #[test]
    fn test_unix_listener_removes_socket_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let endpoint = Endpoint::Unix(path.clone());

        let listener = endpoint.listen().unwrap();
        assert_eq!(listener.network(), "unix");
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_unix_listen_replaces_stale_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        let stale = UnixListener::bind(&path).unwrap();
        std::mem::forget(stale);

        let listener = Endpoint::Unix(path.clone()).listen().unwrap();
        let _client = Endpoint::Unix(path).dial().unwrap();
        assert!(listener.accept().is_ok());
    }

    #[test]
    fn test_dropping_old_listener_keeps_rebound_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let endpoint = Endpoint::Unix(path.clone());

        let old = endpoint.listen().unwrap();
        let new = endpoint.listen().unwrap();
        drop(old);
        assert!(path.exists());

        let _client = endpoint.dial().unwrap();
        assert!(new.accept().is_ok());
        drop(new);
        assert!(!path.exists());
    }
}
