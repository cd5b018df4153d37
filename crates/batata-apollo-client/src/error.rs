//! Client error types for the Apollo config client

/// Error type for config synchronization
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("unauthorized request to {url}")]
    Unauthorized { url: String },

    #[error("request to {url} failed after {attempts} attempts")]
    ExhaustedRetries {
        url: String,
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },

    #[error("all config service nodes failed")]
    AllNodesFailed {
        #[source]
        last: Option<Box<ClientError>>,
    },

    #[error("no remote or backup configuration available for namespace {namespace}")]
    BackupUnavailable { namespace: String },

    #[error("failed to parse response for namespace {namespace}: {source}")]
    ParseFailure {
        namespace: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    /// Whether the failure should push the caller to the next config service node.
    pub fn is_node_failure(&self) -> bool {
        !matches!(self, ClientError::Unauthorized { .. })
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
