//! JSON-RPC server
//!
//! Routes requests to the memory endpoints. Domain failures are reported
//! inside a successful response as a `status = "error"` envelope; JSON-RPC
//! errors are reserved for protocol problems.

use agentic_memory::MemoryService;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};
use super::transport::{Incoming, LineTransport};
use crate::handlers::{AgenticHandler, ApiResponse};

pub const MEMORIZE_METHODS: [&str; 2] = ["memorize", "/api/v3/agentic/memorize"];
pub const RETRIEVE_METHODS: [&str; 2] = [
    "retrieve_lightweight",
    "/api/v3/agentic/retrieve_lightweight",
];
pub const STATS_METHOD: &str = "stats";
pub const PROFILE_METHOD: &str = "profile";

/// Requests handled at once. Reading pauses while this many are in flight.
const MAX_IN_FLIGHT: usize = 64;

pub struct RpcServer {
    service: Arc<MemoryService>,
    handler: AgenticHandler,
}

impl RpcServer {
    pub fn new(service: Arc<MemoryService>) -> Self {
        Self {
            handler: AgenticHandler::new(Arc::clone(&service)),
            service,
        }
    }

    /// Serve until the client closes its end of the transport
    ///
    /// Each request runs on its own task, so a slow memorize does not hold
    /// up the requests behind it. Responses are written as they complete
    /// and may arrive out of request order; clients match them by id.
    pub async fn run<R, W>(
        self: &Arc<Self>,
        transport: &mut LineTransport<R, W>,
    ) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tracing::info!("JSON-RPC server ready");

        let permits = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
        let mut tasks = JoinSet::new();
        let mut outcome = Ok(());

        while let Some(incoming) = transport.read_request().await? {
            let request = match incoming {
                Incoming::Request(request) => request,
                Incoming::Malformed(reason) => {
                    let response = JsonRpcResponse::error(
                        None,
                        JsonRpcError::parse_error(format!("Parse error: {}", reason)),
                    );
                    transport.write_response(&response).await?;
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let server = Arc::clone(self);
            let writer = transport.writer();
            tasks.spawn(async move {
                let _permit = permit;
                match server.handle_request(request).await {
                    Some(response) => writer.write_response(&response).await,
                    None => Ok(()),
                }
            });

            // Reap finished tasks so the set does not grow with the session
            while let Some(joined) = tasks.try_join_next() {
                record(&mut outcome, joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            record(&mut outcome, joined);
        }

        tracing::info!("Client disconnected");
        outcome
    }

    /// Handle one request. Notifications get no response, not even an error.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        tracing::debug!("Handling request: {}", request.method);
        let notification = request.is_notification();

        if request.jsonrpc != JSONRPC_VERSION {
            if notification {
                tracing::warn!(
                    "Dropping notification with jsonrpc version {}",
                    request.jsonrpc
                );
                return None;
            }
            return Some(JsonRpcResponse::error(
                request.id,
                JsonRpcError::invalid_request(format!(
                    "Unsupported jsonrpc version: {}",
                    request.jsonrpc
                )),
            ));
        }

        let params = request.params.unwrap_or(Value::Null);
        let method = request.method.as_str();

        let result = if MEMORIZE_METHODS.contains(&method) {
            to_value(self.handler.memorize(params).await)
        } else if RETRIEVE_METHODS.contains(&method) {
            to_value(self.handler.retrieve_lightweight(params).await)
        } else if method == PROFILE_METHOD {
            to_value(self.handler.profile(params).await)
        } else if method == STATS_METHOD {
            to_value(ApiResponse::ok("ok", self.service.stats()))
        } else {
            Err(JsonRpcError::method_not_found(method))
        };

        if notification {
            if let Err(error) = result {
                tracing::warn!("Notification {} failed: {}", request.method, error.message);
            }
            return None;
        }
        Some(match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(error) => JsonRpcResponse::error(request.id, error),
        })
    }
}

/// Keep the first write failure; a panicked handler is logged and skipped
fn record(
    outcome: &mut std::io::Result<()>,
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!("Failed to write response: {}", e);
            if outcome.is_ok() {
                *outcome = Err(e);
            }
        }
        Err(e) => tracing::error!("Request task ended abnormally: {}", e),
    }
}

fn to_value<T: Serialize>(response: T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(response)
        .map_err(|e| JsonRpcError::internal_error(format!("Failed to encode response: {}", e)))
}
