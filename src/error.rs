//! The error taxonomy of the relay core.
//!
//! Per-session errors never tear down a [`crate::stream::Stream`]; adapter
//! errors tear down a Stream but never the [`crate::hub::StreamHub`]; hub
//! errors are fatal to the process only during shutdown.

use thiserror::Error;

/// Errors surfaced across the HTTP front door, the Hub, and the Stream.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing or malformed viewer request parameters. Surfaced as 400.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The Encoder Adapter could not establish or analyze the upstream
    /// within its configured timeouts.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A mid-stream decode/mux error from the Encoder Adapter.
    #[error("encoder failure: {0}")]
    EncoderFailure(String),

    /// A single viewer session exceeded the drop threshold or persistent
    /// unwritability window. Only that session is affected.
    #[error("slow consumer")]
    SlowConsumer,

    /// The Hub is shutting down; new attaches are rejected.
    #[error("hub unavailable")]
    HubUnavailable,

    /// The process-wide viewer cap (`relay.maxConnections`) is reached.
    #[error("relay at capacity")]
    AtCapacity,
}

impl RelayError {
    /// HTTP status this error maps to when it occurs before any response
    /// body byte has been written.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::SourceUnavailable(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::HubUnavailable | RelayError::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::EncoderFailure(_) | RelayError::SlowConsumer => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
