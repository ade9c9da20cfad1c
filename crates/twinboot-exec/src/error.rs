//! Error types for twinboot-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during remote execution
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command execution failed
    #[error("command execution failed: {status} - {stderr}")]
    CommandFailed {
        /// Exit status code
        status: i32,
        /// Stderr output
        stderr: String,
    },

    /// Command timed out
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Connection not established
    #[error("not connected")]
    NotConnected,
}

impl ExecError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_) | ExecError::Timeout { .. } | ExecError::IoError(_)
        )
    }
}

/// Errors raised while sending a Wake-on-LAN packet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WakeError {
    /// MAC address is missing or malformed
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// Subnet is not a valid IPv4 CIDR
    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    /// Socket setup or send failed
    #[error("failed to send magic packet: {0}")]
    Send(String),
}
