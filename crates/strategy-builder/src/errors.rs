//! Error taxonomy for the build loop and its collaborators.
//!
//! Generation and validation failures are expected: the orchestrator turns
//! them into classifier input with [`OrchestrationError::failure_text`] and
//! keeps going. Only [`OrchestrationError::is_unrecoverable`] errors end a
//! session on their own.

use std::time::Duration;

use coordination::CoordinationError;
use thiserror::Error;

/// Errors from the JSON-RPC tool client.
#[derive(Debug, Error)]
pub enum McpError {
    /// Lease could not be obtained
    #[error(transparent)]
    Session(#[from] CoordinationError),

    /// Endpoint name not present in the configuration.
    #[error("Unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    /// HTTP-level failure (connect, timeout, non-2xx).
    #[error("Transport failure [{endpoint}]: {message}")]
    Transport { endpoint: String, message: String },

    /// JSON-RPC error object in the response.
    #[error("RPC error [{endpoint}] {code}: {message}")]
    Rpc {
        endpoint: String,
        code: i64,
        message: String,
    },

    /// Response body was not the expected shape.
    #[error("Decode failure [{endpoint}]: {message}")]
    Decode { endpoint: String, message: String },
}

impl McpError {
    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn decode(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Whether the failure points at a stale or missing session.
    pub fn is_session_error(&self) -> bool {
        match self {
            Self::Session(_) => true,
            Self::UnknownEndpoint(_) => false,
            other => other.to_string().to_lowercase().contains("session"),
        }
    }
}

/// Unified error type for orchestration and collaborator calls.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The generation agent failed. `cost` is what it reported spending.
    #[error("Generation failed: {message}")]
    Generation { message: String, cost: Option<f64> },

    /// The backtest rejected the artifact or could not score it.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A collaborator call exceeded its time limit.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The wall-clock budget ran out before or during a call.
    #[error("Wall-clock deadline reached during {operation}")]
    DeadlineReached { operation: &'static str },

    /// A collaborator says retrying cannot help.
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("Tool call failed: {0}")]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// Configuration is invalid or missing required fields.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Any other error that doesn't fit the above categories.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OrchestrationError {
    pub fn generation(message: impl Into<String>, cost: Option<f64>) -> Self {
        Self::Generation {
            message: message.into(),
            cost,
        }
    }

    /// Cost the failing call reported, if any.
    pub fn reported_cost(&self) -> Option<f64> {
        match self {
            Self::Generation { cost, .. } => *cost,
            _ => None,
        }
    }

    /// Whether this error ends the session without going through escalation.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_) | Self::Configuration(_))
    }

    /// Whether the session clock, not the call, ran out.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineReached { .. })
    }

    /// Raw text handed to the error classifier.
    pub fn failure_text(&self) -> String {
        match self {
            Self::Generation { message, .. } => message.clone(),
            Self::Validation(message) => message.clone(),
            other => other.to_string(),
        }
    }
}
