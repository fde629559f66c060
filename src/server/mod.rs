//! Connection handling: readiness loop, per-connection state and workers.
//!
//! [`Server`] is the entry point; it wraps a [`reactor::Reactor`] and turns
//! its I/O errors into `anyhow` errors with context.

pub mod connection;
pub mod pool;
pub mod reactor;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::ServerConfig;
use crate::handler::Handler;
use reactor::{Reactor, ReactorHandle};

/// Value of the `Server` header on every response.
pub const SERVER_NAME: &str = concat!("sluice/", env!("CARGO_PKG_VERSION"));

pub struct Server {
    reactor: Reactor,
}

impl Server {
    /// Binds the configured address and starts the worker pool. Nothing is
    /// accepted until [`Server::run`].
    pub fn bind(cfg: &ServerConfig, handler: Arc<dyn Handler>) -> Result<Self> {
        let addr = cfg.socket_addr()?;
        let reactor = Reactor::bind(addr, handler, cfg.thread_pool_size, cfg.max_events)
            .with_context(|| format!("Failed to start server on {addr}"))?;
        Ok(Self { reactor })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.reactor.local_addr()
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            reactor: self.reactor.handle(),
        }
    }

    /// Blocks the calling thread until shutdown.
    pub fn run(self) -> Result<()> {
        self.reactor.run().context("Server loop failed")
    }
}

/// Stops a running [`Server`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    reactor: ReactorHandle,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        tracing::info!("Shutdown requested");
        self.reactor.shutdown();
    }

    /// Number of open connections.
    pub fn connections(&self) -> usize {
        self.reactor.connection_count()
    }
}
