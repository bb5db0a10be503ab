//! Error types for the Book operator

use thiserror::Error;

/// Errors that can occur while converging a Book
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Create raced with another writer
    #[error("Resource already exists: {kind}/{name} in namespace {namespace}")]
    AlreadyExists {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Write rejected because the resource version is stale
    #[error("Write conflict on {kind}/{name} in namespace {namespace}")]
    Conflict {
        kind: String,
        name: String,
        namespace: String,
    },

    /// A managed name is taken by an object this Book does not control
    #[error("Resource {kind}/{name} already exists and is not managed by Book")]
    ResourceConflict { kind: String, name: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Sidecar configuration document could not be read
    #[error("Sidecar configuration unavailable: {0}")]
    SidecarConfig(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable.
    ///
    /// Ownership conflicts and spec problems cannot be fixed by retrying;
    /// they are surfaced once and re-detected on the next change to the Book
    /// or one of its managed resources.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            OperatorError::ResourceConflict { .. }
                | OperatorError::InvalidConfig(_)
                | OperatorError::ValidationError(_)
        )
    }

    /// True for ownership conflicts on a managed resource name
    pub fn is_ownership_conflict(&self) -> bool {
        matches!(self, OperatorError::ResourceConflict { .. })
    }

    /// Map an API error response onto the typed variants the reconciler cares about.
    pub(crate) fn from_api(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => OperatorError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                OperatorError::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 => OperatorError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            _ => OperatorError::KubeError(err),
        }
    }
}
