//! JSON configuration.
//!
//! Durations are integer nanoseconds, as in the config files this format
//! originates from. Zero or absent values fall back to defaults. Everything
//! is validated once at construction; invalid settings fail fast.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayvisorError, Result};
use crate::relay::{DEFAULT_MAX_FRAME_SIZE, RelayDsn};
use crate::rpc::RpcConfig;

/// Default allocation, destroy and relay timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default HTTP request body limit (32 MiB).
pub const DEFAULT_MAX_REQUEST: u64 = 32 * 1024 * 1024;

fn nanos_or_default(nanos: u64) -> Duration {
    if nanos == 0 {
        DEFAULT_TIMEOUT
    } else {
        Duration::from_nanos(nanos)
    }
}

/// Pool sizing, timeouts and recycling limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    /// Worker count; 0 means one per CPU.
    pub num_workers: u64,
    /// Nanoseconds to wait for a free worker.
    pub allocate_timeout: u64,
    /// Nanoseconds granted to shutdown before workers are killed.
    pub destroy_timeout: u64,
    /// Jobs per worker before recycling; 0 disables.
    pub max_jobs: u64,
    /// Worker lifetime in nanoseconds; 0 disables.
    #[serde(rename = "maxTTL")]
    pub max_ttl: u64,
    /// Resident memory ceiling in MiB; 0 disables.
    pub max_memory: u64,
    /// Largest accepted frame in bytes; 0 means 64 MiB.
    pub max_frame_size: u64,
}

impl PoolConfig {
    pub fn num_workers(&self) -> usize {
        if self.num_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.num_workers as usize
        }
    }

    pub fn allocate_timeout(&self) -> Duration {
        nanos_or_default(self.allocate_timeout)
    }

    pub fn destroy_timeout(&self) -> Duration {
        nanos_or_default(self.destroy_timeout)
    }

    pub fn max_ttl(&self) -> Option<Duration> {
        (self.max_ttl > 0).then(|| Duration::from_nanos(self.max_ttl))
    }

    pub fn max_frame_size(&self) -> usize {
        if self.max_frame_size == 0 {
            DEFAULT_MAX_FRAME_SIZE
        } else {
            self.max_frame_size as usize
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size > u32::MAX as u64 {
            return Err(RelayvisorError::Config(format!(
                "pool.maxFrameSize {} exceeds the frame format limit of {} bytes",
                self.max_frame_size,
                u32::MAX
            )));
        }
        Ok(())
    }
}

/// How to start workers and talk to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkersConfig {
    /// Command line of the worker program.
    pub command: String,
    /// `pipes`, `unix://<path>` or `tcp://<host:port>`.
    pub relay: String,
    /// Nanoseconds to wait for a worker handshake.
    pub relay_timeout: u64,
    pub pool: PoolConfig,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            relay: "pipes".to_string(),
            relay_timeout: 0,
            pool: PoolConfig::default(),
        }
    }
}

impl WorkersConfig {
    pub fn relay_dsn(&self) -> Result<RelayDsn> {
        self.relay.parse()
    }

    pub fn relay_timeout(&self) -> Duration {
        nanos_or_default(self.relay_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(RelayvisorError::Config("workers.command is empty".into()));
        }
        self.relay_dsn()?;
        self.pool.validate()
    }
}

/// HTTP gateway section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
    pub enable: bool,
    /// `host:port`; an empty host binds all interfaces.
    pub address: String,
    /// Request body limit in bytes; 0 means 32 MiB.
    pub max_request: u64,
    pub workers: WorkersConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enable: false,
            address: ":8080".to_string(),
            max_request: 0,
            workers: WorkersConfig::default(),
        }
    }
}

impl HttpConfig {
    /// Socket address to bind.
    pub fn bind_address(&self) -> Result<SocketAddr> {
        let address = match self.address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port),
            None => self.address.clone(),
        };
        address.parse().map_err(|_| {
            RelayvisorError::Config(format!("invalid http address '{}'", self.address))
        })
    }

    pub fn max_request(&self) -> usize {
        if self.max_request == 0 {
            DEFAULT_MAX_REQUEST as usize
        } else {
            self.max_request as usize
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_address()?;
        self.workers.validate()
    }
}

/// Whole configuration file.
#[derive(Debug, Clone, Default)]
pub struct RootConfig {
    pub http: HttpConfig,
    pub rpc: RpcConfig,
    raw: serde_json::Map<String, Value>,
}

impl RootConfig {
    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RelayvisorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: serde_json::Map<String, Value> = serde_json::from_str(text)
            .map_err(|e| RelayvisorError::Config(format!("invalid JSON: {}", e)))?;

        let config = Self {
            http: Self::typed(&raw, "http")?,
            rpc: Self::typed(&raw, "rpc")?,
            raw,
        };
        config.validate()?;
        Ok(config)
    }

    fn typed<T: serde::de::DeserializeOwned + Default>(
        raw: &serde_json::Map<String, Value>,
        name: &str,
    ) -> Result<T> {
        match raw.get(name) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| RelayvisorError::Config(format!("invalid '{}' section: {}", name, e))),
        }
    }

    /// Raw JSON of a named top-level section.
    pub fn section(&self, name: &str) -> Option<&Value> {
        self.raw.get(name)
    }

    /// Check enabled sections.
    pub fn validate(&self) -> Result<()> {
        if self.http.enable {
            self.http.validate()?;
        }
        if self.rpc.enable {
            self.rpc.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTTP_CONFIG: &str = r#"{
        "http": {
            "enable": true,
            "address": ":8070",
            "maxRequest": 1024,
            "uploads": { "dir": "/tmp", "forbid": [] },
            "workers": {
                "command": "php client.php echo pipes",
                "relay": "pipes",
                "pool": {
                    "numWorkers": 1,
                    "allocateTimeout": 10000000,
                    "destroyTimeout": 10000000
                }
            }
        }
    }"#;

    #[test]
    fn test_parse_http_section() {
        let config = RootConfig::from_json(HTTP_CONFIG).unwrap();
        assert!(config.http.enable);
        assert_eq!(config.http.max_request(), 1024);
        assert_eq!(
            config.http.bind_address().unwrap(),
            "0.0.0.0:8070".parse().unwrap()
        );
        let pool = &config.http.workers.pool;
        assert_eq!(pool.num_workers(), 1);
        assert_eq!(pool.allocate_timeout(), Duration::from_millis(10));
        assert_eq!(pool.destroy_timeout(), Duration::from_millis(10));
        assert_eq!(config.http.workers.relay_dsn().unwrap(), RelayDsn::Pipes);
        assert!(!config.rpc.enable);
    }

    #[test]
    fn test_defaults() {
        let pool = PoolConfig::default();
        assert_eq!(pool.allocate_timeout(), DEFAULT_TIMEOUT);
        assert_eq!(pool.destroy_timeout(), DEFAULT_TIMEOUT);
        assert!(pool.num_workers() >= 1);
        assert_eq!(pool.max_ttl(), None);
        assert_eq!(pool.max_frame_size(), DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(WorkersConfig::default().relay_timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_empty_document_is_valid() {
        let config = RootConfig::from_json("{}").unwrap();
        assert!(!config.http.enable);
        assert!(config.section("http").is_none());
    }

    #[test]
    fn test_disabled_section_is_not_validated() {
        let config = RootConfig::from_json(r#"{"http":{"enable":false,"address":"----"}}"#);
        assert!(config.is_ok());
    }

    #[test]
    fn test_invalid_address() {
        let err = RootConfig::from_json(
            r#"{"http":{"enable":true,"address":"----","workers":{"command":"w"}}}"#,
        )
        .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("----"));
    }

    #[test]
    fn test_bad_relay_rejected() {
        let err = RootConfig::from_json(
            r#"{"http":{"enable":true,"address":":8070","workers":{"command":"w","relay":"udp://:9"}}}"#,
        )
        .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_empty_command_rejected() {
        let err = RootConfig::from_json(
            r#"{"http":{"enable":true,"address":":8070","workers":{"command":"  "}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let err = RootConfig::from_json(r#"{"http":{"enable":"yes"}}"#).unwrap_err();
        assert!(err.to_string().contains("http"));
    }

    #[test]
    fn test_section_returns_raw_json() {
        let config = RootConfig::from_json(r#"{"metrics":{"address":":2112"}}"#).unwrap();
        assert_eq!(config.section("metrics").unwrap()["address"], ":2112");
    }

    #[test]
    fn test_max_ttl_and_frame_limit() {
        let pool: PoolConfig =
            serde_json::from_str(r#"{"maxTTL":1000000000,"maxFrameSize":5000000000}"#).unwrap();
        assert_eq!(pool.max_ttl(), Some(Duration::from_secs(1)));
        assert!(pool.validate().is_err());
    }
}
