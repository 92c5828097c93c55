//! Query engine boundary.
//!
//! An engine turns a [`QueryRequest`] into an [`ExecutionHandle`] without
//! blocking: the work runs on the engine's own task and reports through the
//! handle's [`ResultChannel`]. The server never looks inside an engine.

pub mod memory;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::channel::{Outcome, ResultChannel};

pub use memory::MemoryEngine;

pub const DEFAULT_FORMAT: &str = "TabSeparated";

/// Caller identity as sent by the client. Carried through, not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub quota: String,
}

/// A parsed query call, ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub query: String,
    pub query_id: String,
    pub format: String,
    pub settings: HashMap<String, String>,
    pub user: Option<UserInfo>,
    /// Pause between output blocks.
    pub interactive_delay: Option<Duration>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            query_id: uuid::Uuid::now_v7().to_string(),
            format: DEFAULT_FORMAT.to_string(),
            settings: HashMap::new(),
            user: None,
            interactive_delay: None,
        }
    }

    pub fn setting(&self, name: &str) -> Option<&str> {
        self.settings.get(name).map(String::as_str)
    }
}

pub trait QueryEngine: Send + Sync {
    /// Start executing `request`. Must return promptly.
    fn submit(&self, request: &QueryRequest) -> Result<ExecutionHandle>;
}

/// A running query: where its output goes and how to stop it.
pub struct ExecutionHandle {
    channel: Arc<ResultChannel>,
    cancel: CancellationToken,
}

impl ExecutionHandle {
    pub fn new(channel: Arc<ResultChannel>, cancel: CancellationToken) -> Self {
        Self { channel, cancel }
    }

    /// Run `work` on its own task. The channel is finished with whatever the
    /// work returns: `Ok` becomes the success payload, `Err` the failure.
    pub fn spawn<F, Fut>(work: F) -> Self
    where
        F: FnOnce(Arc<ResultChannel>, CancellationToken) -> Fut,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let channel = ResultChannel::new();
        let cancel = CancellationToken::new();
        let work = work(channel.clone(), cancel.clone());

        let output = channel.clone();
        tokio::spawn(async move {
            let outcome = match work.await {
                Ok(payload) => Outcome::Success(payload),
                Err(e) => Outcome::Failed(format!("{e:#}")),
            };
            if !output.finish(outcome) {
                debug!("Execution result discarded, channel already finished");
            }
        });

        Self::new(channel, cancel)
    }

    pub fn result_channel(&self) -> &Arc<ResultChannel> {
        &self.channel
    }

    /// Ask the engine to stop. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub fn create_engine(max_block_size: usize) -> Arc<dyn QueryEngine> {
    Arc::new(MemoryEngine::new(max_block_size))
}
