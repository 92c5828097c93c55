//! RPC server for client communication.
//!
//! Provides a JSON-RPC 2.0 interface over TCP. A call may stream partial
//! output as `query.progress` notifications before its one response.
//!
//! ## Architecture
//!
//! - `protocol`: JSON-RPC 2.0 request/response/notification types
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `connection`: per-connection reader and writer tasks
//! - `listener`: matches requests with idle calls
//! - `client`: Client for connecting to the server

pub mod client;
pub mod connection;
pub mod listener;
pub mod protocol;
mod transport;

use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::core::dispatcher::{Dispatcher, InvariantViolation, Services};
use transport::Transport;

pub use client::{CallOutcome, ClientError, QueryOutput, RpcClient};
pub use protocol::{Notification, QueryParams, QueryResult, Request, Response, RpcError};

/// How long to wait for calls to tear down after connections are closed.
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind: {0}")]
    Io(#[from] std::io::Error),
    #[error("dispatcher failed: {0}")]
    Invariant(#[from] InvariantViolation),
    #[error("server already started")]
    AlreadyStarted,
}

/// RPC server that serves queries to clients.
pub struct RpcServer {
    dispatcher: Dispatcher,
    transport: Transport,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: Mutex<Option<broadcast::Receiver<()>>>,
}

impl RpcServer {
    /// Create a new RPC server bound to the given address.
    pub async fn bind(ctx: AppContext, bind_addr: SocketAddr) -> Result<Self, ServerError> {
        let dispatcher = Dispatcher::new(ctx);
        let transport = Transport::bind(bind_addr, dispatcher.services().clone()).await?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Ok(Self {
            dispatcher,
            transport,
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn services(&self) -> &std::sync::Arc<Services> {
        self.dispatcher.services()
    }

    /// Start the RPC server. Runs until shutdown() is called or the
    /// dispatcher hits an invariant violation, then drains.
    pub async fn start(&self) -> Result<(), ServerError> {
        let shutdown_rx = self
            .shutdown_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ServerError::AlreadyStarted)?;
        if !self.dispatcher.start() {
            return Err(ServerError::AlreadyStarted);
        }

        let services = self.dispatcher.services().clone();
        self.dispatcher
            .register_acceptors(services.ctx.config.acceptors);

        tokio::select! {
            _ = self.transport.listen(shutdown_rx) => {}
            _ = services.faulted().cancelled() => {
                error!("Dispatcher faulted, stopping server");
            }
        }

        self.drain().await;

        match services.violation() {
            Some(violation) => Err(ServerError::Invariant(violation)),
            None => Ok(()),
        }
    }

    /// Stop accepting, let running calls finish within the grace period,
    /// then close connections and stop dispatching.
    async fn drain(&self) {
        let services = self.dispatcher.services();
        let tracker = &services.ctx.tracker;
        services.listener.close();

        if !services.faulted().is_cancelled() {
            let grace = Duration::from_secs(services.ctx.config.shutdown_grace_secs);
            if tracker.wait_drained(grace).await {
                info!("All calls finished");
            } else {
                warn!(
                    live_calls = tracker.live(),
                    "Grace period elapsed, closing connections"
                );
            }
        }

        self.transport.close_connections();

        if !services.faulted().is_cancelled() && !tracker.wait_drained(FORCE_CLOSE_WAIT).await {
            warn!(live_calls = tracker.live(), "Calls still alive at shutdown");
        }

        self.dispatcher.stop().await;
        info!("RPC server stopped");
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
