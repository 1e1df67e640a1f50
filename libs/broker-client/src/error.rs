//! Error types for broker client operations.
//!
//! Every public operation returns [`ClientResult`]. Variants line up with the
//! failure modes callers need to tell apart: connect failures, rejected or
//! backpressured publishes, unacknowledged flushes, request timeouts and
//! drains that ran out of time.

use std::time::Duration;

use thiserror::Error;

use crate::subject::SubjectError;

/// Top-level error type for the broker client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Endpoint unreachable or handshake failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The connection is closed/draining or the transport rejected the message.
    #[error("publish error: {0}")]
    Publish(String),

    /// The outbound buffer is saturated.
    #[error("outbound buffer full ({capacity} messages)")]
    Backpressure { capacity: usize },

    /// Broker did not acknowledge buffered publishes in time.
    #[error("flush error: {0}")]
    Flush(String),

    /// No reply arrived before the request deadline.
    #[error("request to '{subject}' timed out after {timeout:?}")]
    Timeout { subject: String, timeout: Duration },

    /// Graceful shutdown did not finish inside the grace period.
    #[error("drain error: {0}")]
    Drain(String),

    /// The request was cancelled before a reply arrived.
    #[error("request to '{subject}' was cancelled")]
    Cancelled { subject: String },

    /// The connection has been closed.
    #[error("connection is closed")]
    Closed,

    #[error("invalid subject: {0}")]
    InvalidSubject(#[from] SubjectError),

    /// `respond` was called for a message without reply subject.
    #[error("message has no reply subject")]
    NoReplySubject,
}

impl ClientError {
    /// Returns true for transient failures that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Backpressure { .. } | ClientError::Flush(_) | ClientError::Timeout { .. }
        )
    }

    /// Returns true if this error is a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    /// Returns true if this error is backpressure from a full outbound buffer.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, ClientError::Backpressure { .. })
    }
}

/// Shorthand result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
