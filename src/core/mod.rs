pub mod call;
pub mod channel;
pub mod dispatcher;
pub mod engine;
pub mod procedure;
pub mod tracker;
pub mod worker;

pub use call::{Call, CallState};
pub use channel::{Outcome, Poll, ResultChannel};
pub use dispatcher::{Dispatcher, InvariantViolation, Tag};
pub use engine::{ExecutionHandle, MemoryEngine, QueryEngine, QueryRequest};
pub use procedure::{CallError, Procedure};
pub use tracker::{CallTracker, TrackerSnapshot};
