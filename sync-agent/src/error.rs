use crate::checkpoint::Watermark;
use std::time::Duration;
use thiserror::Error;

/// Per-line failures. The offending line is skipped and the watermark moves past it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("malformed record: expected 7 comma-separated values, found {tokens}")]
    MalformedRecord { tokens: usize },

    #[error("non-numeric token {token:?} at position {index}")]
    NonNumericToken { index: usize, token: String },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

impl ParseError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::MalformedRecord { .. } => "malformed_record",
            ParseError::NonNumericToken { .. } => "non_numeric_token",
            ParseError::InvalidUtf8 => "invalid_utf8",
        }
    }
}

/// Remote failures raised by a `DeliveryClient`. All of them are retried.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode remote payload: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("delivery of lines after {from} up to {to} failed after {attempts} attempts: {source}")]
    DeliveryFailed {
        from: Watermark,
        to: Watermark,
        attempts: usize,
        #[source]
        source: SinkError,
    },

    #[error("watermark persistence failed: {0:#}")]
    Persistence(anyhow::Error),

    #[error("shutdown requested during delivery")]
    Cancelled,
}
