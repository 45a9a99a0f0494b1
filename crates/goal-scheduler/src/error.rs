//! Error types shared across the scheduler, the fulfillment callback and the
//! in-job execution monitor.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Kubernetes watch error: {0}")]
    WatchError(#[from] kube::runtime::watcher::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Secret resolution failed: {0}")]
    SecretError(String),

    /// More than one credential matches a secret bound to one variable.
    #[error("Ambiguous secret: {0}")]
    AmbiguousSecret(String),

    #[error("Project preparation failed: {0}")]
    ProjectError(String),

    #[error("Goal cache operation failed: {0}")]
    CacheError(String),

    #[error("Graph query failed: {0}")]
    GraphError(String),

    #[error("Execution failed: {0}")]
    ExecutionError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Missing object key")]
    MissingObjectKey,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Configuration errors are fatal and never retried.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::ConfigError(_) | Error::AmbiguousSecret(_) | Error::MissingObjectKey
        )
    }

    /// True for a Kubernetes 404 response.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(ae)) if ae.code == 404)
    }
}
