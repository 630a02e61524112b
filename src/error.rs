//! Error types for the node-group drain reconciler

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The cluster view could not be read in full; the pass is abandoned.
    #[error("Snapshot error: {0}")]
    SnapshotError(String),

    #[error("Invalid disruption policy for NodeGroup {group}: {message}")]
    PolicyError { group: String, message: String },

    /// Optimistic-concurrency write lost against a newer object version.
    #[error("Write conflict on Node {0}: object was modified concurrently")]
    ConflictError(String),

    #[error("Drain of Node {node} failed: {message}")]
    DrainError { node: String, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Manifest error: {0}")]
    ManifestError(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure is expected to clear up on a later pass without
    /// operator intervention.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 409 || resp.code >= 500,
            Error::KubeError(_) => true,
            Error::SnapshotError(_) | Error::ConflictError(_) | Error::DrainError { .. } => true,
            Error::PolicyError { .. }
            | Error::ConfigError(_)
            | Error::ManifestError(_)
            | Error::SerializationError(_)
            | Error::IoError(_) => false,
        }
    }

    /// Short label used for metrics and the pass report.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::SnapshotError(_) => "snapshot",
            Error::PolicyError { .. } => "policy",
            Error::ConflictError(_) => "conflict",
            Error::DrainError { .. } => "drain",
            Error::ConfigError(_) => "config",
            Error::ManifestError(_) => "manifest",
            Error::SerializationError(_) => "serialization",
            Error::IoError(_) => "io",
        }
    }
}
