//! Handoff between a running query and the call streaming its output.
//!
//! The engine pushes output chunks and finishes the channel exactly once.
//! The call polls it from whichever worker runs its current transition and
//! never blocks on it. Instead of polling again later, the call arms a
//! one-shot [`Registration`]; the channel fires it as soon as there is
//! something to read, which enqueues the next completion for that call.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::dispatcher::{Op, Registration};

/// Terminal state of a query's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Finished normally; the payload is the last piece of output.
    Success(String),
    /// The engine failed. Output already pushed stays valid.
    Failed(String),
}

/// What a reader finds when it looks at the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    Chunk(String),
    /// No chunks left and the engine is done.
    Finished,
    Pending,
}

#[derive(Default)]
struct Inner {
    chunks: VecDeque<String>,
    finished: bool,
    outcome: Option<Outcome>,
    armed: Option<Arc<Registration>>,
}

impl Inner {
    fn is_ready(&self) -> bool {
        !self.chunks.is_empty() || self.finished
    }
}

#[derive(Default)]
pub struct ResultChannel {
    inner: Mutex<Inner>,
}

impl ResultChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_progress(&self) -> bool {
        !self.lock().chunks.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Take the oldest buffered chunk. Progress clears once the buffer is empty.
    pub fn consume(&self) -> Option<String> {
        self.lock().chunks.pop_front()
    }

    /// Take the next chunk, or report that the output is complete. Decided
    /// under one lock, so a chunk pushed right before `finish` is never
    /// mistaken for leftovers.
    pub fn poll(&self) -> Poll {
        let mut inner = self.lock();
        match inner.chunks.pop_front() {
            Some(chunk) => Poll::Chunk(chunk),
            None if inner.finished => Poll::Finished,
            None => Poll::Pending,
        }
    }

    /// Drain everything still buffered.
    pub fn consume_all(&self) -> Vec<String> {
        self.lock().chunks.drain(..).collect()
    }

    /// Take the terminal outcome. Returns `None` before `finish` or if
    /// already taken.
    pub fn take_outcome(&self) -> Option<Outcome> {
        self.lock().outcome.take()
    }

    /// Append a chunk of output. Ignored once the channel is finished.
    pub fn push(&self, chunk: impl Into<String>) {
        let armed = {
            let mut inner = self.lock();
            if inner.finished {
                return;
            }
            inner.chunks.push_back(chunk.into());
            inner.armed.take()
        };
        if let Some(registration) = armed {
            registration.complete(Op::Ready);
        }
    }

    /// Mark the output as complete. Only the first call has any effect;
    /// returns whether this call was it.
    pub fn finish(&self, outcome: Outcome) -> bool {
        let armed = {
            let mut inner = self.lock();
            if inner.finished {
                return false;
            }
            inner.finished = true;
            inner.outcome = Some(outcome);
            inner.armed.take()
        };
        if let Some(registration) = armed {
            registration.complete(Op::Ready);
        }
        true
    }

    /// Ask to be woken when output or completion is available. Fires
    /// immediately when it already is. Replaces any previous registration.
    pub fn arm(&self, registration: Arc<Registration>) {
        let ready = {
            let mut inner = self.lock();
            if inner.is_ready() {
                true
            } else {
                inner.armed = Some(registration.clone());
                false
            }
        };
        if ready {
            registration.complete(Op::Ready);
        }
    }
}
