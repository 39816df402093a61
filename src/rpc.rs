//! Control-plane RPC.
//!
//! Line-delimited JSON over `tcp://` or `unix://`: each request is one JSON
//! object on its own line, answered by one JSON object on its own line.
//!
//! ```text
//! → {"method":"workers"}
//! ← {"type":"workers","workers":[{"pid":4242,"state":"ready",...}]}
//! → {"method":"reset"}
//! ← {"type":"ok"}
//! ```

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::{RelayvisorError, Result};
use crate::pool::PoolStats;
use crate::relay::{Endpoint, Listener, Stream};
use crate::worker::WorkerInfo;

/// Poll interval for the accept loop and idle connections.
const RPC_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Read timeout after which an idle connection re-checks for shutdown.
const CONNECTION_IDLE_CHECK: Duration = Duration::from_millis(500);

/// `rpc` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcConfig {
    pub enable: bool,
    /// `tcp://[host]:<port>` or `unix://<path>`.
    pub listen: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enable: false,
            listen: "tcp://127.0.0.1:6001".to_string(),
        }
    }
}

impl RpcConfig {
    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.listen)
    }

    /// Bind the configured endpoint.
    pub fn listener(&self) -> Result<Listener> {
        self.endpoint()?.listen()
    }

    /// Connect to the configured endpoint.
    pub fn dialer(&self) -> Result<Stream> {
        self.endpoint()?.dial()
    }

    pub fn validate(&self) -> Result<()> {
        self.endpoint().map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum RpcRequest {
    Workers,
    Stats,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RpcResponse {
    Workers { workers: Vec<WorkerInfo> },
    Stats { stats: PoolStats },
    Ok,
    Error { message: String },
}

/// Operations exposed over RPC.
pub trait ControlHandler: Send + Sync {
    fn workers(&self) -> Result<Vec<WorkerInfo>>;
    fn stats(&self) -> Result<PoolStats>;
    /// Replace every worker with a fresh one.
    fn reset(&self) -> Result<()>;
}

fn dispatch(handler: &dyn ControlHandler, request: RpcRequest) -> RpcResponse {
    let result = match request {
        RpcRequest::Workers => handler
            .workers()
            .map(|workers| RpcResponse::Workers { workers }),
        RpcRequest::Stats => handler.stats().map(|stats| RpcResponse::Stats { stats }),
        RpcRequest::Reset => handler.reset().map(|()| RpcResponse::Ok),
    };
    result.unwrap_or_else(|e| RpcResponse::Error {
        message: e.to_string(),
    })
}

/// Running RPC listener. Stops on drop.
pub struct RpcServer {
    address: String,
    stopping: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl RpcServer {
    /// Bind the configured endpoint and serve requests on background threads.
    pub fn start(config: &RpcConfig, handler: Arc<dyn ControlHandler>) -> Result<Self> {
        let listener = config.listener()?;
        listener.set_nonblocking(true)?;
        let address = format!("{}://{}", listener.network(), listener.local_address()?);
        info!(address = %address, "RPC listening");

        let stopping = Arc::new(AtomicBool::new(false));
        let acceptor = {
            let stopping = Arc::clone(&stopping);
            std::thread::Builder::new()
                .name("rpc-accept".to_string())
                .spawn(move || accept_loop(listener, handler, stopping))?
        };

        Ok(Self {
            address,
            stopping,
            acceptor: Some(acceptor),
        })
    }

    /// Bound address, e.g. `tcp://0.0.0.0:6001`.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn stop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
            debug!("RPC listener stopped");
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: Listener, handler: Arc<dyn ControlHandler>, stopping: Arc<AtomicBool>) {
    while !stopping.load(Ordering::Acquire) {
        match listener.accept() {
            Ok(stream) => {
                let handler = Arc::clone(&handler);
                let stopping = Arc::clone(&stopping);
                let spawned = std::thread::Builder::new()
                    .name("rpc-conn".to_string())
                    .spawn(move || {
                        if let Err(e) = serve_connection(stream, handler.as_ref(), &stopping) {
                            trace!(error = %e, "RPC connection closed");
                        }
                    });
                if let Err(e) = spawned {
                    warn!(error = %e, "Failed to start RPC connection thread");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(RPC_POLL_INTERVAL);
            }
            Err(e) => {
                warn!(error = %e, "RPC accept failed");
                std::thread::sleep(RPC_POLL_INTERVAL);
            }
        }
    }
}

fn serve_connection(
    stream: Stream,
    handler: &dyn ControlHandler,
    stopping: &AtomicBool,
) -> Result<()> {
    stream.set_read_timeout(Some(CONNECTION_IDLE_CHECK))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        if stopping.load(Ordering::Acquire) {
            return Ok(());
        }
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                // Partial line stays buffered in `line` until the rest arrives.
                continue;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }

        let request = line.trim();
        if !request.is_empty() {
            let response = match serde_json::from_str::<RpcRequest>(request) {
                Ok(request) => {
                    debug!(?request, "RPC request");
                    dispatch(handler, request)
                }
                Err(e) => RpcResponse::Error {
                    message: format!("invalid request: {}", e),
                },
            };
            let mut encoded = serde_json::to_vec(&response)?;
            encoded.push(b'\n');
            writer.write_all(&encoded)?;
            writer.flush()?;
        }
        line.clear();
    }
}

/// Send one request to the server at `dsn` and wait for the answer.
pub fn call(dsn: &str, request: &RpcRequest) -> Result<RpcResponse> {
    let stream = Endpoint::parse(dsn)?.dial()?;
    let mut writer = stream.try_clone()?;
    let mut encoded = serde_json::to_vec(request)?;
    encoded.push(b'\n');
    writer.write_all(&encoded)?;
    writer.flush()?;

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    if line.is_empty() {
        return Err(RelayvisorError::Io(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "RPC server closed the connection",
        )));
    }
    Ok(serde_json::from_str(&line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn config(listen: &str) -> RpcConfig {
        RpcConfig {
            enable: true,
            listen: listen.to_string(),
        }
    }

    #[test]
    fn test_config_listener_tcp() {
        let listener = config("tcp://:18001").listener().unwrap();
        assert_eq!(listener.network(), "tcp");
        assert_eq!(listener.local_address().unwrap(), "0.0.0.0:18001");
    }

    #[test]
    fn test_config_listener_unix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc.sock");
        let listener = config(&format!("unix://{}", path.display()))
            .listener()
            .unwrap();
        assert_eq!(listener.network(), "unix");
        assert_eq!(listener.local_address().unwrap(), path.display().to_string());
    }

    #[test]
    fn test_config_error() {
        let err = config("uni:unix.sock").listener().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid socket DSN (tcp://:6001, unix://rpc.sock)"
        );
    }

    #[test]
    fn test_config_error_method() {
        let err = config("xinu://unix.sock").listener().unwrap_err();
        assert!(matches!(err, RelayvisorError::UnsupportedScheme(ref s) if s == "xinu"));
    }

    #[test]
    fn test_config_dialer() {
        let cfg = config("tcp://:18002");
        let _listener = cfg.listener().unwrap();
        let conn = cfg.dialer().unwrap();
        assert_eq!(conn.network(), "tcp");
        assert_eq!(conn.peer_address().unwrap(), "127.0.0.1:18002");
    }

    #[test]
    fn test_config_dialer_unix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc.sock");
        let cfg = config(&format!("unix://{}", path.display()));
        let _listener = cfg.listener().unwrap();
        let conn = cfg.dialer().unwrap();
        assert_eq!(conn.network(), "unix");
        assert_eq!(conn.peer_address().unwrap(), path.display().to_string());
    }

    #[test]
    fn test_config_dialer_error() {
        let err = config("uni:unix.sock").dialer().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid socket DSN (tcp://:6001, unix://rpc.sock)"
        );
        assert!(config("xinu://unix.sock").dialer().is_err());
    }

    #[test]
    fn test_request_encoding() {
        assert_eq!(
            serde_json::to_string(&RpcRequest::Workers).unwrap(),
            r#"{"method":"workers"}"#
        );
        assert_eq!(
            serde_json::to_string(&RpcResponse::Ok).unwrap(),
            r#"{"type":"ok"}"#
        );
    }

    struct FakeHandler {
        resets: Mutex<u32>,
    }

    impl ControlHandler for FakeHandler {
        fn workers(&self) -> Result<Vec<WorkerInfo>> {
            Ok(Vec::new())
        }

        fn stats(&self) -> Result<PoolStats> {
            Err(RelayvisorError::PoolStopped)
        }

        fn reset(&self) -> Result<()> {
            *self.resets.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn test_server_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("unix://{}", dir.path().join("ctl.sock").display());
        let handler = Arc::new(FakeHandler {
            resets: Mutex::new(0),
        });
        let mut server = RpcServer::start(&config(&dsn), handler.clone()).unwrap();

        assert_eq!(
            call(&dsn, &RpcRequest::Workers).unwrap(),
            RpcResponse::Workers {
                workers: Vec::new()
            }
        );
        assert_eq!(call(&dsn, &RpcRequest::Reset).unwrap(), RpcResponse::Ok);
        assert_eq!(*handler.resets.lock().unwrap(), 1);
        assert!(matches!(
            call(&dsn, &RpcRequest::Stats).unwrap(),
            RpcResponse::Error { .. }
        ));

        server.stop();
    }

    #[test]
    fn test_server_rejects_unknown_method() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("unix://{}", dir.path().join("ctl.sock").display());
        let handler = Arc::new(FakeHandler {
            resets: Mutex::new(0),
        });
        let _server = RpcServer::start(&config(&dsn), handler).unwrap();

        let stream = Endpoint::parse(&dsn).unwrap().dial().unwrap();
        let mut writer = stream.try_clone().unwrap();
        writer.write_all(b"{\"method\":\"explode\"}\n").unwrap();
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).unwrap();
        let response: RpcResponse = serde_json::from_str(&line).unwrap();
        assert!(matches!(response, RpcResponse::Error { message } if message.contains("invalid request")));
    }
}
