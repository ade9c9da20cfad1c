//! Error types for the hypervisor client

use thiserror::Error;

/// Errors that can occur when talking to a Proxmox node
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// API returned an error status
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error body returned by the node
        message: String,
    },

    /// Invalid response format
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl HypervisorError {
    /// Authentication or permission problem (token invalid, missing `VM.Audit`/`VM.PowerMgmt`)
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, HypervisorError::Api { status: 401 | 403, .. })
    }

    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HypervisorError::Timeout
        } else {
            HypervisorError::Http(e)
        }
    }
}

/// Result type for hypervisor operations
pub type Result<T> = std::result::Result<T, HypervisorError>;
