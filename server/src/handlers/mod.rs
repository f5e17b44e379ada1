//! Request handlers

pub mod agentic;

use serde::{Deserialize, Serialize};

use crate::error::ServerResult;

pub use agentic::AgenticHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Envelope shared by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: ResponseStatus,
    pub message: String,
    pub result: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, result: T) -> Self {
        Self {
            status: ResponseStatus::Ok,
            message: message.into(),
            result: Some(result),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: message.into(),
            result: None,
        }
    }

    /// Wrap a handler outcome, logging failures by severity
    pub fn from_result(endpoint: &str, outcome: ServerResult<(String, T)>) -> Self {
        match outcome {
            Ok((message, result)) => Self::ok(message, result),
            Err(err) => {
                if err.is_client_error() {
                    tracing::warn!("{} rejected: {}", endpoint, err);
                } else {
                    tracing::error!("{} failed: {}", endpoint, err);
                }
                Self::error(err.to_string())
            }
        }
    }
}
