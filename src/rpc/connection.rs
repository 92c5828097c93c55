//! One client connection.
//!
//! The reader half turns request lines into deliveries to the listener. The
//! writer half owns the socket's write side; every line written on behalf of
//! a call completes that call's [`Registration`], which is how I/O
//! completions reach the dispatcher. When the connection goes away, every
//! registration still watching it fails, so no call waits forever on a dead
//! peer and nothing more is written to it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::listener::IncomingCall;
use super::protocol::{Request, Response};
use crate::core::dispatcher::{Op, Registration, Services, Tag};

/// A line queued for the writer.
pub struct Outbound {
    pub line: String,
    pub on_written: Option<Arc<Registration>>,
}

impl Outbound {
    fn fail(self) {
        if let Some(registration) = self.on_written {
            registration.fail(Op::Disconnected);
        }
    }
}

pub struct Connection {
    id: u64,
    peer: SocketAddr,
    closed: CancellationToken,
    outbound: mpsc::UnboundedSender<Outbound>,
    watchers: Mutex<HashMap<Tag, Arc<Registration>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Create the shared half of a connection. The receiver feeds
    /// [`write_loop`]. Cancelling `closed` (or a parent of it) closes the
    /// connection.
    pub fn new(
        id: u64,
        peer: SocketAddr,
        closed: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id,
            peer,
            closed,
            outbound,
            watchers: Mutex::new(HashMap::new()),
        });
        (connection, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<Tag, Arc<Registration>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a message that nobody waits on (replies that never became a call).
    pub fn send(&self, message: &impl Serialize) {
        match serde_json::to_string(message) {
            Ok(line) => self.send_line(line, None),
            Err(e) => warn!(connection = self.id, error = %e, "Failed to encode message"),
        }
    }

    /// Queue a line. `on_written` completes once it reached the socket, or
    /// fails if it never will.
    pub fn send_line(&self, line: String, on_written: Option<Arc<Registration>>) {
        let outbound = Outbound { line, on_written };
        if self.is_closed() {
            outbound.fail();
            return;
        }
        if let Err(mpsc::error::SendError(outbound)) = self.outbound.send(outbound) {
            outbound.fail();
        }
    }

    /// Fail `registration` if this connection closes before it fires.
    pub fn watch(&self, registration: Arc<Registration>) {
        let mut watchers = self.watchers();
        if self.is_closed() {
            drop(watchers);
            registration.fail(Op::Disconnected);
            return;
        }
        watchers.insert(registration.tag(), registration);
    }

    pub fn forget(&self, tag: Tag) {
        self.watchers().remove(&tag);
    }

    /// Close the connection and fail everything watching it. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
        let watchers: Vec<_> = self.watchers().drain().map(|(_, r)| r).collect();
        for registration in watchers {
            registration.fail(Op::Disconnected);
        }
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Write queued lines until the connection closes. Lines still queued
/// afterwards are failed, never written.
pub async fn write_loop<W: AsyncWrite + Unpin>(
    connection: Arc<Connection>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut writer: W,
) {
    loop {
        let outbound = tokio::select! {
            biased;
            _ = connection.closed() => break,
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        // A stalled peer must not hold the writer past close
        let written = tokio::select! {
            biased;
            _ = connection.closed() => None,
            written = write_line(&mut writer, &outbound.line) => Some(written),
        };
        let Some(written) = written else {
            outbound.fail();
            break;
        };

        match written {
            Ok(()) => {
                if let Some(registration) = outbound.on_written {
                    registration.complete(Op::Written);
                }
            }
            Err(e) => {
                debug!(connection = connection.id, error = %e, "Write failed");
                outbound.fail();
                connection.close();
                break;
            }
        }
    }

    rx.close();
    while let Ok(outbound) = rx.try_recv() {
        outbound.fail();
    }
    let _ = writer.shutdown().await;
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Read newline-delimited requests until EOF, error or close, handing each
/// one to the listener. A malformed line only gets a parse error back; the
/// connection and its other calls carry on.
pub async fn read_loop<R: AsyncBufRead + Unpin>(
    connection: Arc<Connection>,
    mut reader: R,
    services: Arc<Services>,
) {
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::select! {
            biased;
            _ = connection.closed() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };

        match read {
            // EOF - client disconnected
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection = connection.id, error = %e, "Read failed");
                break;
            }
        }

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        let request = match parse_request(trimmed) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %connection.peer, error = %e, "Parse error");
                connection.send(&Response::parse_error());
                continue;
            }
        };

        if let Err(msg) = request.validate() {
            warn!(peer = %connection.peer, error = msg, "Invalid request");
            let id = request.id.clone().unwrap_or(serde_json::Value::Null);
            connection.send(&Response::invalid_request(id));
            continue;
        }

        let Some(id) = request.id else {
            warn!(peer = %connection.peer, method = %request.method, "Notifications are not served, ignoring");
            continue;
        };

        match services.listener.lookup(&request.method) {
            Some(procedure) => services.listener.deliver(
                procedure,
                IncomingCall {
                    id,
                    params: request.params,
                    connection: connection.clone(),
                },
            ),
            None => connection.send(&Response::method_not_found(id, &request.method)),
        }
    }

    connection.close();
}

fn parse_request(line: &[u8]) -> anyhow::Result<Request> {
    let text = std::str::from_utf8(line)?;
    Ok(serde_json::from_str(text)?)
}
