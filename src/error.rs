use thiserror::Error;

/// Errors raised by the advisor components.
///
/// Components return these as-is; only the HTTP layer turns them into
/// status codes and user-visible text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdvisorError {
    /// Blank or missing required input
    #[error("invalid input: {0}")]
    Validation(String),

    /// Embedding or completion provider failure (auth, rate limit, network, timeout)
    #[error("provider request failed: {0}")]
    Provider(String),

    /// A single source document could not be fetched
    #[error("failed to fetch source {url}: {reason}")]
    SourceFetch { url: String, reason: String },

    /// The ingestion attempt as a whole failed
    #[error("ingestion failed: {0}")]
    Ingestion(String),

    /// Realtime publish failure
    #[error("broadcast failed: {0}")]
    Broadcast(String),
}

pub type AdvisorResult<T> = std::result::Result<T, AdvisorError>;

impl AdvisorError {
    pub fn validation(message: impl Into<String>) -> Self {
        AdvisorError::Validation(message.into())
    }

    pub fn provider(message: impl std::fmt::Display) -> Self {
        AdvisorError::Provider(message.to_string())
    }

    pub fn source_fetch(url: &str, reason: impl std::fmt::Display) -> Self {
        AdvisorError::SourceFetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}
