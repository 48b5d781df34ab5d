//! Error taxonomy.
//!
//! Only three failure modes reach callers in practice: a feature is disabled
//! ([`ContextError::Configuration`]), a snapshot does not exist
//! ([`ContextError::NotFound`]), or a specific snapshot document is damaged
//! ([`ContextError::Corruption`]). Provider failures are downgraded to a
//! placeholder summary inside the compression engine and never surface from
//! `compress()`. Inflation is a result status, not an error.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors raised by the context engine.
#[derive(Debug, Error)]
pub enum ContextError {
    /// An operation was invoked on a feature that is switched off.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No snapshot with this id exists.
    #[error("snapshot not found: {0}")]
    NotFound(String),

    /// A snapshot document failed structural validation.
    #[error("snapshot {id} is corrupted: {reason}")]
    Corruption { id: String, reason: String },

    /// An id contained characters that cannot be used in a storage path.
    #[error("invalid identifier: {0:?}")]
    InvalidId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),
}

impl ContextError {
    pub(crate) fn corruption(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corruption {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error means "the document exists but is damaged".
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Failures of the summarization provider call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("no summarization provider configured")]
    NotConfigured,

    #[error("provider HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("provider call timed out after {0}s")]
    Timeout(u64),

    #[error("provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether retrying the call could succeed (429, 5xx, network failures).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            Self::Request(msg) | Self::Stream(msg) => {
                let lower = msg.to_lowercase();
                [
                    "connection reset",
                    "connection refused",
                    "timed out",
                    "timeout",
                    "broken pipe",
                    "network",
                ]
                .iter()
                .any(|p| lower.contains(p))
            }
            Self::NotConfigured | Self::Timeout(_) | Self::Cancelled => false,
        }
    }
}
