/// Error type for client construction and configuration.
///
/// Fetch failures are never wrapped in this type: they are the application's
/// own error value and land verbatim in the key's `err` field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwrError {
    /// No fetcher was configured at the call site, in any enclosing scope or on the client.
    #[error("no fetcher configured for key '{key}'")]
    MissingFetcher { key: String },
    /// Settings were rejected.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The handle could not find a Tokio runtime to drive its background tasks.
    #[error("no Tokio runtime available: {0}")]
    NoRuntime(String),
}

impl SwrError {
    /// Create a new missing-fetcher error.
    pub fn missing_fetcher(key: impl Into<String>) -> Self {
        SwrError::MissingFetcher { key: key.into() }
    }

    /// Create a new configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        SwrError::Config(message.into())
    }
}
