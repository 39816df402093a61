//! relayvisor - supervisor for pools of external worker processes.
//!
//! Workers are ordinary processes that speak a small framed protocol over
//! pipes, a unix socket or TCP. A [`Pool`] keeps a fixed number of them warm,
//! hands each job to exactly one idle worker and replaces workers that crash,
//! hang or outlive their limits. The HTTP [`gateway`] and the control-plane
//! [`rpc`] listener are thin adapters over the pool.

pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod payload;
pub mod pool;
pub mod relay;
pub mod rpc;
pub mod service;
pub mod worker;

pub use config::{HttpConfig, PoolConfig, RootConfig, WorkersConfig};
pub use error::{RelayvisorError, Result};
pub use events::{Event, EventBus, EventContext, EventKind};
pub use payload::Payload;
pub use pool::{Pool, PoolStats};
pub use service::Server;
pub use worker::{Worker, WorkerFactory, WorkerInfo, WorkerState};
