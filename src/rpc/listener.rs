//! Matches inbound requests with idle calls.
//!
//! Every procedure has a queue of idle call tags and a backlog of requests
//! that arrived while no call was idle. Whichever side shows up second
//! produces an `Accepted` completion on the accept queue.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, warn};

use super::connection::Connection;
use super::protocol::Response;
use crate::core::dispatcher::{Completion, CompletionQueue, Op, Tag};
use crate::core::procedure::Procedure;

/// A request waiting to become a call.
pub struct IncomingCall {
    pub id: Value,
    pub params: Option<Value>,
    pub connection: Arc<Connection>,
}

impl fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingCall")
            .field("id", &self.id)
            .field("connection", &self.connection.id())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ProcedureQueue {
    waiting: VecDeque<Tag>,
    pending: VecDeque<IncomingCall>,
}

#[derive(Default)]
struct State {
    closed: bool,
    queues: HashMap<Procedure, ProcedureQueue>,
}

pub struct Listener {
    accept_queue: CompletionQueue,
    procedures: Vec<Procedure>,
    state: Mutex<State>,
}

impl Listener {
    pub fn new(accept_queue: CompletionQueue, procedures: &[Procedure]) -> Self {
        let queues = procedures
            .iter()
            .map(|procedure| (*procedure, ProcedureQueue::default()))
            .collect();
        Self {
            accept_queue,
            procedures: procedures.to_vec(),
            state: Mutex::new(State {
                closed: false,
                queues,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve a method name to a served procedure.
    pub fn lookup(&self, method: &str) -> Option<Procedure> {
        Procedure::from_name(method).filter(|procedure| self.procedures.contains(procedure))
    }

    /// Offer an idle call. It is accepted at once if a request is backlogged.
    pub fn register(&self, procedure: Procedure, tag: Tag) {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            self.enqueue(Completion::failure(tag, Op::Shutdown));
            return;
        }

        let queue = state.queues.entry(procedure).or_default();
        match queue.pending.pop_front() {
            Some(incoming) => {
                drop(state);
                self.enqueue(Completion::success(tag, Op::Accepted(incoming)));
            }
            None => queue.waiting.push_back(tag),
        }
    }

    /// Hand over a request. It is matched with the oldest idle call, or
    /// backlogged until one registers.
    pub fn deliver(&self, procedure: Procedure, incoming: IncomingCall) {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            debug!(procedure = procedure.name(), "Request refused, listener closed");
            incoming
                .connection
                .send(&Response::shutting_down(incoming.id));
            return;
        }

        let queue = state.queues.entry(procedure).or_default();
        match queue.waiting.pop_front() {
            Some(tag) => {
                drop(state);
                self.enqueue(Completion::success(tag, Op::Accepted(incoming)));
            }
            None => queue.pending.push_back(incoming),
        }
    }

    fn enqueue(&self, completion: Completion) {
        if let Err(mpsc_err) = self.accept_queue.send(completion) {
            let completion = mpsc_err.0;
            warn!(tag = %completion.tag, "Accept queue closed");
            if let Op::Accepted(incoming) = completion.op {
                incoming
                    .connection
                    .send(&Response::shutting_down(incoming.id));
            }
        }
    }

    /// Stop accepting. Idle calls are released with `Shutdown` and
    /// backlogged requests are refused.
    pub fn close(&self) {
        let queues = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.queues)
        };

        for (_, queue) in queues {
            for tag in queue.waiting {
                self.enqueue(Completion::failure(tag, Op::Shutdown));
            }
            for incoming in queue.pending {
                incoming
                    .connection
                    .send(&Response::shutting_down(incoming.id));
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn idle(&self, procedure: Procedure) -> usize {
        self.lock()
            .queues
            .get(&procedure)
            .map_or(0, |queue| queue.waiting.len())
    }

    pub fn backlog(&self, procedure: Procedure) -> usize {
        self.lock()
            .queues
            .get(&procedure)
            .map_or(0, |queue| queue.pending.len())
    }
}
