//! TCP transport layer for the RPC server.
//!
//! Handles TCP connections with newline-delimited JSON framing. Each
//! connection gets a reader task and a writer task; requests on one
//! connection are served concurrently and their messages interleave.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::connection::{self, Connection};
use crate::core::dispatcher::Services;

/// Manages the TCP transport layer.
pub struct Transport {
    listener: TcpListener,
    services: Arc<Services>,
    /// Parent of every connection's close token.
    connections: CancellationToken,
    next_id: AtomicU64,
}

impl Transport {
    pub async fn bind(bind_addr: SocketAddr, services: Arc<Services>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            services,
            connections: CancellationToken::new(),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Close every open connection. Calls on them abort.
    pub fn close_connections(&self) {
        self.connections.cancel();
    }

    /// Accept connections. Runs until shutdown signal is received.
    pub async fn listen(&self, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = self.local_addr() {
            info!(addr = %addr, "RPC server listening");
        }

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Client connected");
                            self.serve(stream, peer_addr);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }
    }

    fn serve(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (reader, writer) = stream.into_split();
        let (connection, outbound) =
            Connection::new(id, peer_addr, self.connections.child_token());

        tokio::spawn(connection::write_loop(connection.clone(), outbound, writer));

        let services = self.services.clone();
        tokio::spawn(async move {
            connection::read_loop(connection, BufReader::new(reader), services).await;
            debug!(peer = %peer_addr, "Client disconnected");
        });
    }
}
