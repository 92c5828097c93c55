//! Completion dispatch.
//!
//! Two unbounded FIFO queues carry [`Completion`]s: the accept queue
//! ("a new call arrived") and the I/O queue ("something this call waited
//! for happened"). Each queue has its own drain loop. A loop checks the call
//! out of the [`CallTable`], which makes that loop the call's only owner,
//! and hands it to the [`WorkerPool`].
//!
//! A call is either parked in the table waiting on exactly one
//! [`Registration`], or owned by exactly one worker. It is parked before its
//! next registration is armed, so a completion can never find it missing
//! unless something fired twice. That case is an [`InvariantViolation`] and
//! brings the server down.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::call::{Arm, Call, CallState, Step};
use super::procedure::Procedure;
use super::worker::WorkerPool;
use crate::context::AppContext;
use crate::logging::LogThrottle;
use crate::rpc::listener::{IncomingCall, Listener};

/// Identity of one call, used to correlate completions with it.
/// Allocated from a counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl Tag {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// What completed.
#[derive(Debug)]
pub enum Op {
    /// The listener matched an inbound request to an idle call.
    Accepted(IncomingCall),
    /// The result channel has output or has finished.
    Ready,
    /// A message written for the call reached the socket.
    Written,
    /// The connection went away.
    Disconnected,
    /// The listener closed before the call was accepted.
    Shutdown,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Accepted(_) => "accepted",
            Op::Ready => "ready",
            Op::Written => "written",
            Op::Disconnected => "disconnected",
            Op::Shutdown => "shutdown",
        }
    }
}

/// One event for one call.
#[derive(Debug)]
pub struct Completion {
    pub tag: Tag,
    pub ok: bool,
    pub op: Op,
}

impl Completion {
    pub fn success(tag: Tag, op: Op) -> Self {
        Self { tag, ok: true, op }
    }

    pub fn failure(tag: Tag, op: Op) -> Self {
        Self { tag, ok: false, op }
    }
}

pub type CompletionQueue = mpsc::UnboundedSender<Completion>;

/// Interest in exactly one future completion for a call.
///
/// The same registration may be handed to several sources (the result
/// channel and the connection, for example). Whichever fires first enqueues
/// the completion; the rest are no-ops.
pub struct Registration {
    tag: Tag,
    queue: CompletionQueue,
    fired: AtomicBool,
}

impl Registration {
    pub fn new(tag: Tag, queue: CompletionQueue) -> Arc<Self> {
        Arc::new(Self {
            tag,
            queue,
            fired: AtomicBool::new(false),
        })
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn complete(&self, op: Op) -> bool {
        self.fire(Completion::success(self.tag, op))
    }

    pub fn fail(&self, op: Op) -> bool {
        self.fire(Completion::failure(self.tag, op))
    }

    fn fire(&self, completion: Completion) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        // The queue only closes once the dispatcher is stopped
        if self.queue.send(completion).is_err() {
            trace!(tag = %self.tag, "Completion dropped, dispatcher stopped");
        }
        true
    }
}

/// Broken dispatcher bookkeeping. Never recovered from.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("completion for {0} which is not parked (in flight, done or unknown)")]
    NotParked(Tag),
    #[error("{0} parked twice")]
    AlreadyParked(Tag),
    #[error("{tag} received '{op}' completion in state {state:?}")]
    UnexpectedCompletion {
        tag: Tag,
        state: CallState,
        op: &'static str,
    },
}

/// Calls waiting for their next completion, keyed by tag.
#[derive(Default)]
pub struct CallTable {
    parked: Mutex<HashMap<Tag, Box<Call>>>,
    next_tag: AtomicU64,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Tag, Box<Call>>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_tag(&self) -> Tag {
        Tag(self.next_tag.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn park(&self, call: Box<Call>) -> Result<(), InvariantViolation> {
        let tag = call.tag();
        let mut parked = self.lock();
        if parked.contains_key(&tag) {
            return Err(InvariantViolation::AlreadyParked(tag));
        }
        parked.insert(tag, call);
        Ok(())
    }

    pub fn checkout(&self, tag: Tag) -> Result<Box<Call>, InvariantViolation> {
        self.lock()
            .remove(&tag)
            .ok_or(InvariantViolation::NotParked(tag))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared by the drain loops and every running transition.
pub struct Services {
    pub ctx: AppContext,
    pub table: CallTable,
    pub listener: Listener,
    pub workers: WorkerPool,
    io_queue: CompletionQueue,
    fault_token: CancellationToken,
    violation: Mutex<Option<InvariantViolation>>,
    stream_log: LogThrottle,
    #[cfg(test)]
    in_flight: InFlight,
}

impl Services {
    /// Create an idle call for `procedure` and offer it to the listener.
    pub fn spawn_acceptor(&self, procedure: Procedure) {
        let tag = self.table.next_tag();
        let call = Call::new(tag, procedure, self.ctx.tracker.lease());
        if let Err(violation) = self.table.park(call) {
            self.fault(violation);
            return;
        }
        self.listener.register(procedure, tag);
    }

    pub fn io_queue(&self) -> &CompletionQueue {
        &self.io_queue
    }

    pub fn stream_log(&self) -> &LogThrottle {
        &self.stream_log
    }

    /// Record a fatal invariant violation and signal the server to stop.
    pub fn fault(&self, violation: InvariantViolation) {
        error!(error = %violation, "Dispatcher invariant violated");
        let mut slot = self.violation.lock().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(violation);
        self.fault_token.cancel();
    }

    pub fn faulted(&self) -> &CancellationToken {
        &self.fault_token
    }

    pub fn violation(&self) -> Option<InvariantViolation> {
        self.violation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn transition(&self, call: Box<Call>, op: Op) {
        let step = {
            #[cfg(test)]
            let _in_flight = self.in_flight.enter(call.tag());
            call.advance(self, op).await
        };
        match step {
            Ok(Step::Await(call, arm)) => self.rearm(call, arm),
            Ok(Step::Done) => {}
            Err(violation) => self.fault(violation),
        }
    }

    async fn abort(&self, call: Box<Call>, op: Op) {
        #[cfg(test)]
        let _in_flight = self.in_flight.enter(call.tag());
        call.abort(self, op).await;
    }

    /// Park the call, then register for its next completion.
    fn rearm(&self, call: Box<Call>, arm: Arm) {
        let tag = call.tag();
        let connection = call.connection().cloned();
        if let Err(violation) = self.table.park(call) {
            self.fault(violation);
            return;
        }

        let registration = Registration::new(tag, self.io_queue.clone());
        match (arm, connection) {
            (Arm::Channel(channel), Some(connection)) => {
                connection.watch(registration.clone());
                channel.arm(registration);
            }
            (Arm::Write(line), Some(connection)) => {
                connection.send_line(line, Some(registration));
            }
            (_, None) => {
                // Accepted calls always carry a connection
                registration.fail(Op::Disconnected);
            }
        }
    }
}

/// Owns the completion queues, their drain loops and the worker pool.
pub struct Dispatcher {
    services: Arc<Services>,
    receivers: Mutex<Option<Receivers>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    stop: CancellationToken,
}

struct Receivers {
    accept: mpsc::UnboundedReceiver<Completion>,
    io: mpsc::UnboundedReceiver<Completion>,
}

impl Dispatcher {
    pub fn new(ctx: AppContext) -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();

        let services = Arc::new(Services {
            ctx,
            table: CallTable::new(),
            listener: Listener::new(accept_tx, Procedure::ALL),
            workers: WorkerPool::new(),
            io_queue: io_tx,
            fault_token: CancellationToken::new(),
            violation: Mutex::new(None),
            stream_log: LogThrottle::new(Duration::from_secs(1)),
            #[cfg(test)]
            in_flight: InFlight::default(),
        });

        Self {
            services,
            receivers: Mutex::new(Some(Receivers {
                accept: accept_rx,
                io: io_rx,
            })),
            loops: Mutex::new(Vec::new()),
            stop: CancellationToken::new(),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Spawn both drain loops. Returns false if they were already started.
    pub fn start(&self) -> bool {
        let Some(receivers) = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return false;
        };

        let accept = tokio::spawn(drain(
            "accept",
            receivers.accept,
            self.services.clone(),
            self.stop.clone(),
        ));
        let io = tokio::spawn(drain(
            "io",
            receivers.io,
            self.services.clone(),
            self.stop.clone(),
        ));

        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        loops.push(accept);
        loops.push(io);
        true
    }

    /// Register `per_procedure` idle calls for every known procedure.
    pub fn register_acceptors(&self, per_procedure: usize) {
        for procedure in Procedure::ALL {
            for _ in 0..per_procedure {
                self.services.spawn_acceptor(*procedure);
            }
        }
    }

    /// Stop the drain loops, then wait for running transitions.
    ///
    /// Callers drain live calls first; completions still queued at this
    /// point are dropped together with the calls they refer to.
    pub async fn stop(&self) {
        self.stop.cancel();
        let loops: Vec<_> = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "Drain loop panicked");
            }
        }
        self.services.workers.drain().await;
    }
}

async fn drain(
    queue: &'static str,
    mut rx: mpsc::UnboundedReceiver<Completion>,
    services: Arc<Services>,
    stop: CancellationToken,
) {
    debug!(queue, "Drain loop started");

    loop {
        let completion = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = services.fault_token.cancelled() => break,
            next = rx.recv() => match next {
                Some(completion) => completion,
                None => break,
            },
        };

        let call = match services.table.checkout(completion.tag) {
            Ok(call) => call,
            Err(violation) => {
                services.fault(violation);
                break;
            }
        };

        trace!(
            queue,
            tag = %completion.tag,
            ok = completion.ok,
            op = completion.op.name(),
            "Completion"
        );

        let shared = services.clone();
        let op = completion.op;
        if completion.ok {
            services
                .workers
                .spawn(async move { shared.transition(call, op).await });
        } else {
            services
                .workers
                .spawn(async move { shared.abort(call, op).await });
        }
    }

    debug!(queue, "Drain loop stopped");
}

/// Counts transitions that overlap on the same tag.
#[cfg(test)]
#[derive(Default)]
struct InFlight {
    tags: Mutex<std::collections::HashSet<Tag>>,
    entered: AtomicU64,
    overlaps: AtomicU64,
}

#[cfg(test)]
impl InFlight {
    fn enter(&self, tag: Tag) -> InFlightGuard<'_> {
        self.entered.fetch_add(1, Ordering::Relaxed);
        let mut tags = self.tags.lock().unwrap_or_else(PoisonError::into_inner);
        if !tags.insert(tag) {
            self.overlaps.fetch_add(1, Ordering::Relaxed);
        }
        InFlightGuard { in_flight: self, tag }
    }
}

#[cfg(test)]
struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    tag: Tag,
}

#[cfg(test)]
impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.tag);
    }
}
