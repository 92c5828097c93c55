//! Procedures the server answers and how each one parses, executes and
//! renders its result. Every procedure runs through the same call state
//! machine; only these three steps differ.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::engine::{DEFAULT_FORMAT, ExecutionHandle, QueryRequest};
use super::tracker::TrackerSnapshot;
use crate::context::AppContext;
use crate::rpc::protocol::{INTERNAL_ERROR, INVALID_PARAMS, QUERY_FAILED, QueryParams, QueryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Procedure {
    /// Streaming query execution.
    Query,
    /// Server health and active calls. Answers with a single terminal message.
    Status,
}

/// Why a call ended with an error response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The request could not be decoded or is not acceptable.
    #[error("{0}")]
    Protocol(String),
    /// The engine failed, before or during streaming.
    #[error("{0}")]
    Execution(String),
    #[error("{0}")]
    Internal(String),
}

impl CallError {
    pub fn code(&self) -> i32 {
        match self {
            CallError::Protocol(_) => INVALID_PARAMS,
            CallError::Execution(_) => QUERY_FAILED,
            CallError::Internal(_) => INTERNAL_ERROR,
        }
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq)]
pub enum CallRequest {
    Query(QueryRequest),
    Status,
}

impl CallRequest {
    pub fn query_id(&self) -> Option<&str> {
        match self {
            CallRequest::Query(request) => Some(&request.query_id),
            CallRequest::Status => None,
        }
    }
}

#[derive(Serialize)]
struct StatusReport {
    version: &'static str,
    #[serde(flatten)]
    tracker: TrackerSnapshot,
}

impl Procedure {
    pub const ALL: &'static [Procedure] = &[Procedure::Query, Procedure::Status];

    pub fn name(&self) -> &'static str {
        match self {
            Procedure::Query => "query",
            Procedure::Status => "server.status",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }

    pub fn parse(&self, params: Option<Value>) -> Result<CallRequest, CallError> {
        match self {
            Procedure::Query => {
                let params = params.ok_or_else(|| CallError::Protocol("Missing params".into()))?;
                let params: QueryParams = serde_json::from_value(params)
                    .map_err(|e| CallError::Protocol(format!("Invalid params: {e}")))?;
                parse_query(params).map(CallRequest::Query)
            }
            Procedure::Status => Ok(CallRequest::Status),
        }
    }

    pub fn execute(
        &self,
        request: &CallRequest,
        ctx: &AppContext,
    ) -> Result<ExecutionHandle, CallError> {
        match request {
            CallRequest::Query(query) => ctx
                .engine
                .submit(query)
                .map_err(|e| CallError::Execution(format!("{e:#}"))),
            CallRequest::Status => {
                let tracker = ctx.tracker.clone();
                Ok(ExecutionHandle::spawn(|_channel, _cancel| async move {
                    let report = StatusReport {
                        version: env!("CARGO_PKG_VERSION"),
                        tracker: tracker.snapshot().await,
                    };
                    anyhow::Ok(serde_json::to_string(&report)?)
                }))
            }
        }
    }

    /// Build the terminal success payload from the last piece of output.
    pub fn render(
        &self,
        request: &CallRequest,
        output: String,
        progress_messages: u64,
    ) -> Result<Value, CallError> {
        let rendered = match request {
            CallRequest::Query(query) => serde_json::to_value(QueryResult {
                query_id: query.query_id.clone(),
                output,
                progress_messages,
            }),
            CallRequest::Status => serde_json::from_str(&output),
        };
        rendered.map_err(|e| CallError::Internal(format!("Failed to render result: {e}")))
    }
}

fn parse_query(params: QueryParams) -> Result<QueryRequest, CallError> {
    if params.query.trim().is_empty() {
        return Err(CallError::Protocol("Empty query".into()));
    }

    let mut request = QueryRequest::new(params.query);
    if let Some(query_id) = params.query_id.filter(|id| !id.is_empty()) {
        request.query_id = query_id;
    }
    request.format = params
        .format
        .filter(|format| !format.is_empty())
        .unwrap_or_else(|| DEFAULT_FORMAT.to_string());
    request.settings = params.settings;
    request.user = params.user_info;
    request.interactive_delay = params
        .interactive_delay
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);
    Ok(request)
}
