//! Container runtime error types.

use thiserror::Error;

/// Result type for container runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur during container runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime command failed.
    #[error("runtime {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Failed to parse runtime output.
    #[error("failed to parse runtime output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Whether this error is the runtime refusing a storage size quota.
    ///
    /// Hosts on filesystems without project quotas fail `create` with a
    /// stderr mentioning pquota or the overlay storage-opt restriction;
    /// creation is then retried once without the quota.
    pub fn is_storage_quota_unsupported(&self) -> bool {
        match self {
            RuntimeError::CommandFailed { message, .. } => {
                message.contains("pquota") || message.contains("--storage-opt is supported only")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_signature_detected() {
        let err = RuntimeError::CommandFailed {
            command: "create".to_string(),
            message: "Error response from daemon: --storage-opt is supported only for overlay over xfs with 'pquota' mount option".to_string(),
        };
        assert!(err.is_storage_quota_unsupported());
    }

    #[test]
    fn other_create_failures_are_not_quota() {
        let err = RuntimeError::CommandFailed {
            command: "create".to_string(),
            message: "No such image: example:latest".to_string(),
        };
        assert!(!err.is_storage_quota_unsupported());

        let err = RuntimeError::ContainerNotFound("hw-0123456789abcdef".to_string());
        assert!(!err.is_storage_quota_unsupported());
    }
}
