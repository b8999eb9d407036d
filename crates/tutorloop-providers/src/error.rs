//! Provider error types.

use thiserror::Error;

/// Errors that can occur when talking to an LLM backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The request timed out.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// A network error occurred.
    #[error("network error: {0}")]
    NetworkError(String),

    /// The requested model is not installed on the backend.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The API returned an error response.
    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    /// The API answered 2xx with a body we could not read.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}
