//! Top-level assembly of the event bus, worker pool, gateway and RPC.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::{RootConfig, WorkersConfig};
use crate::error::{RelayvisorError, Result};
use crate::events::{EventBus, EventContext, EventKind, Listener, log_listener};
use crate::gateway::{Gateway, Middleware, http};
use crate::pool::{Pool, PoolStats};
use crate::rpc::{ControlHandler, RpcServer};
use crate::worker::WorkerInfo;

/// A configured server. Construction spawns the workers; [`Server::run`]
/// starts serving.
pub struct Server {
    config: RootConfig,
    events: EventBus,
    gateway: Option<Arc<Gateway>>,
    shutdown: Arc<Notify>,
}

impl Server {
    pub fn new(config: RootConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::default();
        events.add_listener(log_listener());

        let gateway = if config.http.enable {
            let pool = Pool::from_config(&config.http.workers, events.clone())?;
            Some(Arc::new(Gateway::new(Arc::new(pool), events.clone())))
        } else {
            None
        };

        Ok(Self {
            config,
            events,
            gateway,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn add_listener(&self, listener: impl Listener + 'static) {
        self.events.add_listener(listener);
    }

    pub fn gateway(&self) -> Option<&Arc<Gateway>> {
        self.gateway.as_ref()
    }

    /// Register gateway middleware. Ignored when HTTP is disabled.
    pub fn add_middleware(&self, middleware: impl Middleware + 'static) {
        match &self.gateway {
            Some(gateway) => gateway.add_middleware(middleware),
            None => warn!("HTTP is disabled; middleware not registered"),
        }
    }

    /// Control operations over this server's pool.
    pub fn control(&self) -> Arc<dyn ControlHandler> {
        Arc::new(PoolControl {
            gateway: self.gateway.clone(),
            workers: self.config.http.workers.clone(),
        })
    }

    /// Replace every worker by swapping in a fresh pool on the same relay.
    pub fn reset(&self) -> Result<()> {
        self.control().reset()
    }

    /// Serve until Ctrl+C, SIGTERM or [`Server::stop`].
    pub fn run(&self) -> Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;

        let _rpc = if self.config.rpc.enable {
            Some(RpcServer::start(&self.config.rpc, self.control())?)
        } else {
            None
        };

        self.events.emit(EventKind::ServerStart, EventContext::None);
        let shutdown = shutdown_signal(Arc::clone(&self.shutdown));
        let result = match &self.gateway {
            Some(gateway) => {
                let address = self.config.http.bind_address()?;
                runtime.block_on(http::serve(
                    address,
                    Arc::clone(gateway),
                    self.config.http.max_request(),
                    shutdown,
                ))
            }
            None => {
                info!("HTTP disabled; waiting for shutdown");
                runtime.block_on(shutdown);
                Ok(())
            }
        };
        self.events.emit(EventKind::ServerStop, EventContext::None);

        if let Some(gateway) = &self.gateway {
            gateway.pool().destroy();
        }
        result
    }

    /// Ask a running [`Server::run`] to return.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(gateway) = &self.gateway {
            gateway.pool().destroy();
        }
    }
}

async fn shutdown_signal(stop: Arc<Notify>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = stop.notified() => info!("Shutdown requested"),
    }
}

/// [`ControlHandler`] backed by the gateway's pool.
struct PoolControl {
    gateway: Option<Arc<Gateway>>,
    workers: WorkersConfig,
}

impl PoolControl {
    fn gateway(&self) -> Result<&Arc<Gateway>> {
        self.gateway
            .as_ref()
            .ok_or_else(|| RelayvisorError::Config("http service is not enabled".into()))
    }
}

impl ControlHandler for PoolControl {
    fn workers(&self) -> Result<Vec<WorkerInfo>> {
        Ok(self.gateway()?.pool().workers())
    }

    fn stats(&self) -> Result<PoolStats> {
        Ok(self.gateway()?.pool().stats())
    }

    fn reset(&self) -> Result<()> {
        let gateway = self.gateway()?;
        let fresh = gateway.pool().rebuild(&self.workers.pool)?;
        let old = gateway.swap_pool(Arc::new(fresh));
        info!("Worker pool reset");
        old.destroy();
        Ok(())
    }
}
