//! RPC client for connecting to the server.
//!
//! Sends one request per connection and collects any progress
//! notifications that precede its response.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::protocol::{
    PROGRESS_METHOD, Progress, QueryParams, QueryResult, Request, RpcError, ServerMessage,
};

/// RPC client for communicating with the server.
pub struct RpcClient {
    addr: SocketAddr,
}

/// Error returned by RPC client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to server: {0}")]
    Connect(std::io::Error),
    #[error("Communication error: {0}")]
    Io(std::io::Error),
    #[error("Failed to serialize request: {0}")]
    Serialize(serde_json::Error),
    #[error("Failed to parse response: {0}")]
    Parse(serde_json::Error),
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
    #[error("Connection closed before the response arrived")]
    Closed,
}

/// Everything the server sent for one call.
#[derive(Debug)]
pub struct CallOutcome {
    /// Progress outputs, in the order received.
    pub progress: Vec<String>,
    pub result: Result<Value, RpcError>,
}

#[derive(Debug)]
pub struct QueryOutput {
    pub progress: Vec<String>,
    pub result: QueryResult,
}

impl QueryOutput {
    /// The whole output, progress blocks and final block joined.
    pub fn text(&self) -> String {
        self.progress
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.result.output.as_str()))
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl RpcClient {
    /// Create a new client that will connect to the given address.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Call an RPC method, collecting progress until the response.
    pub async fn call_streaming(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<CallOutcome, ClientError> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(ClientError::Connect)?;

        let request_id = Value::Number(1.into());
        let request = Request::new(method, params, request_id.clone());

        let mut request_json = serde_json::to_string(&request).map_err(ClientError::Serialize)?;
        request_json.push('\n');

        stream
            .write_all(request_json.as_bytes())
            .await
            .map_err(ClientError::Io)?;

        let mut reader = BufReader::new(stream);
        let mut progress = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await.map_err(ClientError::Io)?;
            if bytes_read == 0 {
                return Err(ClientError::Closed);
            }

            match serde_json::from_str(&line).map_err(ClientError::Parse)? {
                ServerMessage::Notification(notification) => {
                    if notification.method != PROGRESS_METHOD {
                        continue;
                    }
                    let params = notification.params.unwrap_or(Value::Null);
                    let update: Progress =
                        serde_json::from_value(params).map_err(ClientError::Parse)?;
                    if update.id == request_id {
                        progress.push(update.output);
                    }
                }
                ServerMessage::Response(response) if response.id == request_id => {
                    let result = match response.error {
                        Some(error) => Err(error),
                        None => Ok(response.result.unwrap_or(Value::Null)),
                    };
                    return Ok(CallOutcome { progress, result });
                }
                // Parse errors carry a null id
                ServerMessage::Response(response) => {
                    if let Some(error) = response.error {
                        return Err(ClientError::Rpc(error));
                    }
                }
            }
        }
    }

    /// Call an RPC method and return the result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let outcome = self.call_streaming(method, params).await?;
        let result = outcome.result.map_err(ClientError::Rpc)?;
        serde_json::from_value(result).map_err(ClientError::Parse)
    }

    /// Run a query and collect its streamed output.
    pub async fn query(&self, params: QueryParams) -> Result<QueryOutput, ClientError> {
        let params = serde_json::to_value(params).map_err(ClientError::Serialize)?;
        let outcome = self.call_streaming("query", Some(params)).await?;
        let result = outcome.result.map_err(ClientError::Rpc)?;
        Ok(QueryOutput {
            progress: outcome.progress,
            result: serde_json::from_value(result).map_err(ClientError::Parse)?,
        })
    }

    pub async fn status(&self) -> Result<Value, ClientError> {
        self.call("server.status", None).await
    }
}
