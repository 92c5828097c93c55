//! The per-call state machine.
//!
//! A call starts idle (`New`) waiting for the listener to match it with a
//! request, then walks `Parsed -> Executing -> Streaming -> Finishing` and
//! ends `Done`. Each completion drives exactly one [`Call::advance`], which
//! runs the call forward until it needs to wait again and says what to wait
//! for. The call itself never touches the table or the queues.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::channel::{Outcome, Poll, ResultChannel};
use super::dispatcher::{InvariantViolation, Op, Services, Tag};
use super::engine::ExecutionHandle;
use super::procedure::{CallError, CallRequest, Procedure};
use super::tracker::{CallEnd, CallLease, CallSummary};
use crate::rpc::connection::Connection;
use crate::rpc::listener::IncomingCall;
use crate::rpc::protocol::{CallErrorData, Notification, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Registered with the listener, no request yet.
    New,
    Parsed,
    Executing,
    Streaming,
    /// The terminal message is being written.
    Finishing,
    Done,
}

/// Result of one transition.
pub enum Step {
    /// Park the call and wake it on the given event.
    Await(Box<Call>, Arm),
    /// The call is finished and has been consumed.
    Done,
}

/// What a parked call waits for.
pub enum Arm {
    /// Output or completion on the result channel.
    Channel(Arc<ResultChannel>),
    /// This line reaching the socket.
    Write(String),
}

pub struct Call {
    tag: Tag,
    procedure: Procedure,
    state: CallState,
    incoming: Option<IncomingCall>,
    request: Option<CallRequest>,
    execution: Option<ExecutionHandle>,
    /// First error wins; later ones are dropped.
    error: Option<CallError>,
    progress_sent: u64,
    _lease: CallLease,
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("tag", &self.tag)
            .field("procedure", &self.procedure.name())
            .field("state", &self.state)
            .field("progress_sent", &self.progress_sent)
            .finish()
    }
}

impl Call {
    pub fn new(tag: Tag, procedure: Procedure, lease: CallLease) -> Box<Self> {
        Box::new(Self {
            tag,
            procedure,
            state: CallState::New,
            incoming: None,
            request: None,
            execution: None,
            error: None,
            progress_sent: 0,
            _lease: lease,
        })
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn procedure(&self) -> Procedure {
        self.procedure
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.incoming.as_ref().map(|incoming| &incoming.connection)
    }

    fn request_id(&self) -> Value {
        self.incoming
            .as_ref()
            .map(|incoming| incoming.id.clone())
            .unwrap_or(Value::Null)
    }

    fn query_id(&self) -> Option<String> {
        self.request
            .as_ref()
            .and_then(CallRequest::query_id)
            .map(str::to_string)
    }

    /// Handle a successful completion and run until the call has to wait.
    pub async fn advance(
        mut self: Box<Self>,
        services: &Services,
        op: Op,
    ) -> Result<Step, InvariantViolation> {
        match (self.state, op) {
            (CallState::New, Op::Accepted(incoming)) => {
                // Keep the procedure serviceable while this call is busy
                services.spawn_acceptor(self.procedure);

                debug!(
                    tag = %self.tag,
                    procedure = self.procedure.name(),
                    peer = %incoming.connection.peer(),
                    "Call accepted"
                );
                services
                    .ctx
                    .tracker
                    .begin(
                        self.tag,
                        CallSummary {
                            tag: self.tag.as_u64(),
                            procedure: self.procedure.name(),
                            query_id: None,
                            state: CallState::Parsed,
                            progress_messages: 0,
                            accepted_at: Utc::now(),
                        },
                    )
                    .await;
                self.incoming = Some(incoming);
                self.state = CallState::Parsed;
            }
            (CallState::Streaming, Op::Ready) => {
                if let Some(connection) = self.connection() {
                    connection.forget(self.tag);
                }
            }
            (CallState::Streaming, Op::Written) => {}
            (CallState::Finishing, Op::Written) => {
                self.complete(services).await;
                return Ok(Step::Done);
            }
            (state, op) => {
                return Err(InvariantViolation::UnexpectedCompletion {
                    tag: self.tag,
                    state,
                    op: op.name(),
                });
            }
        }

        self.run(services).await
    }

    async fn run(mut self: Box<Self>, services: &Services) -> Result<Step, InvariantViolation> {
        loop {
            match self.state {
                CallState::Parsed => self.parse(services).await,
                CallState::Executing => self.execute(services),
                CallState::Streaming => {
                    if let Some(arm) = self.stream(services) {
                        return Ok(self.wait(services, arm).await);
                    }
                }
                CallState::Finishing => {
                    let line = self.terminal_message();
                    return Ok(self.wait(services, Arm::Write(line)).await);
                }
                state @ (CallState::New | CallState::Done) => {
                    return Err(InvariantViolation::UnexpectedCompletion {
                        tag: self.tag,
                        state,
                        op: "resume",
                    });
                }
            }
        }
    }

    async fn wait(self: Box<Self>, services: &Services, arm: Arm) -> Step {
        services
            .ctx
            .tracker
            .update(self.tag, self.state, self.progress_sent)
            .await;
        Step::Await(self, arm)
    }

    fn fail(&mut self, error: CallError) {
        if self.error.is_none() {
            debug!(tag = %self.tag, error = %error, "Call failed");
            self.error = Some(error);
        }
        self.state = CallState::Finishing;
    }

    async fn parse(&mut self, services: &Services) {
        let params = self
            .incoming
            .as_mut()
            .and_then(|incoming| incoming.params.take());

        match self.procedure.parse(params) {
            Ok(request) => {
                if let Some(query_id) = request.query_id() {
                    services
                        .ctx
                        .tracker
                        .set_query_id(self.tag, query_id.to_string())
                        .await;
                }
                self.request = Some(request);
                self.state = CallState::Executing;
            }
            Err(e) => self.fail(e),
        }
    }

    fn execute(&mut self, services: &Services) {
        let Some(request) = self.request.as_ref() else {
            self.fail(CallError::Internal("Call executed without a request".into()));
            return;
        };

        match self.procedure.execute(request, &services.ctx) {
            Ok(execution) => {
                self.execution = Some(execution);
                self.state = CallState::Streaming;
            }
            Err(e) => self.fail(e),
        }
    }

    /// Forward buffered output. Returns what to wait for, or `None` once the
    /// execution has finished and the call moved on to `Finishing`.
    fn stream(&mut self, services: &Services) -> Option<Arm> {
        let Some(channel) = self
            .execution
            .as_ref()
            .map(|execution| execution.result_channel().clone())
        else {
            self.fail(CallError::Internal("Call streamed without an execution".into()));
            return None;
        };

        match channel.poll() {
            Poll::Chunk(chunk) => {
                self.progress_sent += 1;
                if let Some(suppressed) = services.stream_log().admit() {
                    debug!(
                        tag = %self.tag,
                        seq = self.progress_sent,
                        bytes = chunk.len(),
                        suppressed,
                        "Streaming progress"
                    );
                }
                let progress =
                    Notification::progress(self.request_id(), self.progress_sent, chunk);
                match serde_json::to_string(&progress) {
                    Ok(line) => Some(Arm::Write(line)),
                    Err(e) => {
                        self.fail(CallError::Internal(format!("Failed to encode progress: {e}")));
                        None
                    }
                }
            }
            Poll::Finished => {
                self.state = CallState::Finishing;
                None
            }
            Poll::Pending => Some(Arm::Channel(channel)),
        }
    }

    /// Build the one terminal response of this call.
    fn terminal_message(&mut self) -> String {
        if self.error.is_none() {
            let result = self.final_result();
            match result {
                Ok(value) => {
                    let response = Response::success(self.request_id(), value);
                    match serde_json::to_string(&response) {
                        Ok(line) => return line,
                        Err(e) => self.fail(CallError::Internal(format!(
                            "Failed to encode response: {e}"
                        ))),
                    }
                }
                Err(e) => self.fail(e),
            }
        }

        let error = self
            .error
            .clone()
            .unwrap_or_else(|| CallError::Internal("Unknown failure".into()));
        let response = Response::error_with_data(
            self.request_id(),
            error.code(),
            error.to_string(),
            CallErrorData {
                query_id: self.query_id(),
                progress_messages: self.progress_sent,
            },
        );
        serde_json::to_string(&response).unwrap_or_else(|e| {
            warn!(tag = %self.tag, error = %e, "Failed to encode error response");
            format!(
                r#"{{"jsonrpc":"2.0","error":{{"code":{},"message":"Internal error"}},"id":null}}"#,
                error.code()
            )
        })
    }

    fn final_result(&self) -> Result<Value, CallError> {
        let (Some(request), Some(execution)) = (self.request.as_ref(), self.execution.as_ref())
        else {
            return Err(CallError::Internal("Call finished without executing".into()));
        };

        let channel = execution.result_channel();
        let leftovers = channel.consume_all();
        match channel.take_outcome() {
            Some(Outcome::Success(payload)) => {
                let output = leftovers
                    .into_iter()
                    .chain(std::iter::once(payload))
                    .filter(|part| !part.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");
                self.procedure.render(request, output, self.progress_sent)
            }
            Some(Outcome::Failed(message)) => Err(CallError::Execution(message)),
            None => Err(CallError::Internal("Execution finished without an outcome".into())),
        }
    }

    /// The terminal message reached the client.
    async fn complete(mut self: Box<Self>, services: &Services) {
        self.state = CallState::Done;
        if let Some(connection) = self.connection() {
            connection.forget(self.tag);
        }

        let end = if self.error.is_some() {
            CallEnd::Failed
        } else {
            CallEnd::Succeeded
        };
        info!(
            tag = %self.tag,
            procedure = self.procedure.name(),
            query_id = self.query_id().as_deref().unwrap_or("-"),
            progress_messages = self.progress_sent,
            outcome = ?end,
            "Call finished"
        );
        services.ctx.tracker.end(self.tag, end).await;
    }

    /// Tear down after a failed completion: the connection is gone or the
    /// server is shutting down. Nothing more is written for this call.
    pub async fn abort(mut self: Box<Self>, services: &Services, op: Op) {
        if let Some(execution) = self.execution.take() {
            execution.cancel();
        }
        if let Some(connection) = self.connection() {
            connection.forget(self.tag);
        }

        match self.state {
            CallState::New => {
                debug!(tag = %self.tag, procedure = self.procedure.name(), "Idle call released");
            }
            state => {
                debug!(
                    tag = %self.tag,
                    state = ?state,
                    op = op.name(),
                    progress_messages = self.progress_sent,
                    "Call aborted"
                );
                services.ctx.tracker.end(self.tag, CallEnd::Aborted).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::AppConfig;
    use crate::context::AppContext;
    use crate::core::dispatcher::Dispatcher;
    use crate::core::engine::{MemoryEngine, QueryEngine, QueryRequest};
    use crate::rpc::connection::Outbound;
    use crate::rpc::protocol::{INVALID_PARAMS, ServerMessage};

    struct CountingEngine {
        inner: MemoryEngine,
        submitted: AtomicUsize,
    }

    impl QueryEngine for CountingEngine {
        fn submit(&self, request: &QueryRequest) -> anyhow::Result<ExecutionHandle> {
            self.submitted.fetch_add(1, Ordering::SeqCst);
            self.inner.submit(request)
        }
    }

    fn setup() -> (Dispatcher, Arc<CountingEngine>) {
        let engine = Arc::new(CountingEngine {
            inner: MemoryEngine::new(65536),
            submitted: AtomicUsize::new(0),
        });
        let ctx = AppContext::with_engine(AppConfig::default(), engine.clone());
        (Dispatcher::new(ctx), engine)
    }

    /// Pushes three chunks and finishes from a plain thread, racing the call.
    struct RacingEngine;

    impl QueryEngine for RacingEngine {
        fn submit(&self, _request: &QueryRequest) -> anyhow::Result<ExecutionHandle> {
            let channel = ResultChannel::new();
            let output = channel.clone();
            std::thread::spawn(move || {
                for chunk in ["c1", "c2", "c3"] {
                    output.push(chunk);
                }
                output.finish(Outcome::Success(String::new()));
            });
            Ok(ExecutionHandle::new(channel, CancellationToken::new()))
        }
    }

    fn incoming(params: Value) -> (IncomingCall, mpsc::UnboundedReceiver<Outbound>) {
        let peer: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (connection, rx) = Connection::new(1, peer, CancellationToken::new());
        let call = IncomingCall {
            id: json!(1),
            params: Some(params),
            connection,
        };
        (call, rx)
    }

    /// Drive a call by hand, returning every line it asked to write.
    async fn drive(services: &Services, call: Box<Call>, first: Op) -> Vec<String> {
        let mut lines = Vec::new();
        let mut step = call.advance(services, first).await.unwrap();
        loop {
            step = match step {
                Step::Done => return lines,
                Step::Await(call, Arm::Write(line)) => {
                    lines.push(line);
                    call.advance(services, Op::Written).await.unwrap()
                }
                Step::Await(call, Arm::Channel(channel)) => {
                    tokio::time::timeout(Duration::from_secs(2), async {
                        while !channel.has_progress() && !channel.is_finished() {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        }
                    })
                    .await
                    .unwrap();
                    call.advance(services, Op::Ready).await.unwrap()
                }
            };
        }
    }

    #[tokio::test]
    async fn test_empty_query_fails_without_touching_engine() {
        let (dispatcher, engine) = setup();
        let services = dispatcher.services();
        let call = Call::new(
            services.table.next_tag(),
            Procedure::Query,
            services.ctx.tracker.lease(),
        );
        let (accepted, _rx) = incoming(json!({"query": ""}));

        let lines = drive(services, call, Op::Accepted(accepted)).await;

        assert_eq!(lines.len(), 1);
        let ServerMessage::Response(response) = serde_json::from_str(&lines[0]).unwrap() else {
            panic!("expected a response");
        };
        let error = response.error.unwrap();
        assert_eq!(error.code, INVALID_PARAMS);
        assert_eq!(error.message, "Empty query");
        assert_eq!(engine.submitted.load(Ordering::SeqCst), 0);
        assert_eq!(services.ctx.tracker.ended(CallEnd::Failed), 1);
    }

    #[tokio::test]
    async fn test_select_one_answers_in_a_single_message() {
        let (dispatcher, engine) = setup();
        let services = dispatcher.services();
        let call = Call::new(
            services.table.next_tag(),
            Procedure::Query,
            services.ctx.tracker.lease(),
        );
        let (accepted, _rx) = incoming(json!({"query": "SELECT 1", "query_id": "q-1"}));

        let lines = drive(services, call, Op::Accepted(accepted)).await;

        assert_eq!(lines.len(), 1);
        let ServerMessage::Response(response) = serde_json::from_str(&lines[0]).unwrap() else {
            panic!("expected a response");
        };
        let result = response.result.unwrap();
        assert_eq!(result["output"], "1");
        assert_eq!(result["query_id"], "q-1");
        assert_eq!(result["progress_messages"], 0);
        assert_eq!(engine.submitted.load(Ordering::SeqCst), 1);
        assert_eq!(services.ctx.tracker.ended(CallEnd::Succeeded), 1);
    }

    #[tokio::test]
    async fn test_multi_block_output_streams_progress_first() {
        let (dispatcher, _engine) = setup();
        let services = dispatcher.services();
        let call = Call::new(
            services.table.next_tag(),
            Procedure::Query,
            services.ctx.tracker.lease(),
        );
        let (accepted, _rx) = incoming(json!({
            "query": "SELECT number FROM numbers(5)",
            "settings": {"max_block_size": "2"}
        }));

        let lines = drive(services, call, Op::Accepted(accepted)).await;

        assert_eq!(lines.len(), 3);
        let mut outputs = Vec::new();
        for line in &lines[..2] {
            let ServerMessage::Notification(n) = serde_json::from_str(line).unwrap() else {
                panic!("expected progress");
            };
            outputs.push(n.params.unwrap()["output"].as_str().unwrap().to_string());
        }
        let ServerMessage::Response(response) = serde_json::from_str(&lines[2]).unwrap() else {
            panic!("expected a response");
        };
        let result = response.result.unwrap();
        outputs.push(result["output"].as_str().unwrap().to_string());

        assert_eq!(outputs, vec!["0\n1", "2\n3", "4"]);
        assert_eq!(result["progress_messages"], 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_chunks_are_never_folded_into_the_response() {
        let ctx = AppContext::with_engine(AppConfig::default(), Arc::new(RacingEngine));
        let dispatcher = Dispatcher::new(ctx);
        let services = dispatcher.services();

        for _ in 0..500 {
            let call = Call::new(
                services.table.next_tag(),
                Procedure::Query,
                services.ctx.tracker.lease(),
            );
            let (accepted, _rx) = incoming(json!({"query": "race"}));

            let lines = drive(services, call, Op::Accepted(accepted)).await;

            assert_eq!(lines.len(), 4);
            for (seq, line) in lines[..3].iter().enumerate() {
                let ServerMessage::Notification(n) = serde_json::from_str(line).unwrap() else {
                    panic!("expected progress");
                };
                let params = n.params.unwrap();
                assert_eq!(params["seq"], seq as u64 + 1);
                assert_eq!(params["output"], format!("c{}", seq + 1));
            }
            let ServerMessage::Response(response) = serde_json::from_str(&lines[3]).unwrap()
            else {
                panic!("expected a response");
            };
            let result = response.result.unwrap();
            assert_eq!(result["output"], "");
            assert_eq!(result["progress_messages"], 3);
        }
    }

    #[tokio::test]
    async fn test_accepting_spawns_a_sibling() {
        let (dispatcher, _engine) = setup();
        let services = dispatcher.services();
        let call = Call::new(
            services.table.next_tag(),
            Procedure::Query,
            services.ctx.tracker.lease(),
        );
        let (accepted, _rx) = incoming(json!({"query": "SELECT 1"}));

        let step = call.advance(services, Op::Accepted(accepted)).await.unwrap();
        // The sibling is parked, the accepted call is still ours
        assert_eq!(services.table.len(), 1);
        assert_eq!(services.ctx.tracker.live(), 2);
        drop(step);
        assert_eq!(services.ctx.tracker.live(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_completion_is_a_violation() {
        let (dispatcher, _engine) = setup();
        let services = dispatcher.services();
        let tag = services.table.next_tag();
        let call = Call::new(tag, Procedure::Query, services.ctx.tracker.lease());

        let err = call.advance(services, Op::Ready).await.err().unwrap();
        assert_eq!(
            err,
            InvariantViolation::UnexpectedCompletion {
                tag,
                state: CallState::New,
                op: "ready",
            }
        );
    }

    #[tokio::test]
    async fn test_abort_cancels_execution_once() {
        let (dispatcher, _engine) = setup();
        let services = dispatcher.services();
        let call = Call::new(
            services.table.next_tag(),
            Procedure::Query,
            services.ctx.tracker.lease(),
        );
        let (accepted, _rx) = incoming(json!({
            "query": "SELECT number FROM numbers(10)",
            "settings": {"max_block_size": "1"},
            "interactive_delay": 50
        }));

        let Step::Await(call, _) = call.advance(services, Op::Accepted(accepted)).await.unwrap()
        else {
            panic!("expected the call to wait");
        };
        assert_eq!(call.state(), CallState::Streaming);
        let channel = call
            .execution
            .as_ref()
            .map(|execution| execution.result_channel().clone())
            .unwrap();

        call.abort(services, Op::Disconnected).await;
        assert_eq!(services.ctx.tracker.ended(CallEnd::Aborted), 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !channel.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(channel.take_outcome(), Some(Outcome::Failed(_))));
    }
}
