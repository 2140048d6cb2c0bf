//! Error types shared by the storage backends, the remote script engine, the
//! certificate issuer, the cloud providers and the orchestrator.

use thiserror::Error;

/// A convenience alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The broad category of an [`Error`], independent of the context it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A create was requested but a completed state document already exists
    DuplicateRecord,
    /// The requested cluster identity has no state document
    NotFound,
    /// Malformed name, region, size, version or count
    InvalidUserInput,
    /// SSH connection retries were exhausted
    ConnectionExhausted,
    /// The remote host presented a key that does not match the scanned one
    FingerprintMismatch,
    /// The cloud backend returned an error on create or delete
    BackendOperationFailed,
    /// A peer address given to the certificate issuer is not an IP literal
    InvalidCertificateInput,
    /// Reading, rewriting or parsing a kubeconfig failed
    KubeconfigOperationFailed,
    /// A bootstrap script exited unsuccessfully after its retries
    RemoteScriptFailed,
    /// The storage backend could not persist or restore a document
    Storage,
    /// Generating or encoding keys or certificates failed
    KeyMaterial,
}

/// Errors produced while provisioning, bootstrapping or tearing down a cluster.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cluster {cluster} already exists and is completed")]
    DuplicateRecord { cluster: String },

    #[error("no state found for cluster {cluster}")]
    NotFound { cluster: String },

    #[error("invalid input for {field}: {reason}")]
    InvalidUserInput { field: String, reason: String },

    #[error("unable to reach {host} over ssh after {attempts} attempts: {last_error}")]
    ConnectionExhausted {
        host: String,
        attempts: u32,
        last_error: String,
    },

    #[error("host key of {host} does not match the scanned fingerprint")]
    FingerprintMismatch { host: String },

    #[error("{step} failed for {resource}: {message}")]
    BackendOperationFailed {
        step: String,
        resource: String,
        message: String,
    },

    #[error("invalid peer address {address:?} for certificate: {reason}")]
    InvalidCertificateInput { address: String, reason: String },

    #[error("kubeconfig {step} failed: {reason}")]
    KubeconfigOperationFailed { step: String, reason: String },

    #[error("script {script:?} failed on {host}: {stderr}")]
    RemoteScriptFailed {
        host: String,
        script: String,
        stderr: String,
    },

    #[error("storage {step} failed: {reason}")]
    Storage { step: String, reason: String },

    #[error("generating {step} failed: {reason}")]
    KeyMaterial { step: String, reason: String },

    #[error("{original}; cleanup of partially created resources also failed: {cleanup}")]
    CleanupFailed {
        original: Box<Error>,
        cleanup: Box<Error>,
    },
}

impl Error {
    /// The category of this error. A failed cleanup reports the kind of the
    /// error that triggered it.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateRecord { .. } => ErrorKind::DuplicateRecord,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::InvalidUserInput { .. } => ErrorKind::InvalidUserInput,
            Error::ConnectionExhausted { .. } => ErrorKind::ConnectionExhausted,
            Error::FingerprintMismatch { .. } => ErrorKind::FingerprintMismatch,
            Error::BackendOperationFailed { .. } => ErrorKind::BackendOperationFailed,
            Error::InvalidCertificateInput { .. } => ErrorKind::InvalidCertificateInput,
            Error::KubeconfigOperationFailed { .. } => ErrorKind::KubeconfigOperationFailed,
            Error::RemoteScriptFailed { .. } => ErrorKind::RemoteScriptFailed,
            Error::Storage { .. } => ErrorKind::Storage,
            Error::KeyMaterial { .. } => ErrorKind::KeyMaterial,
            Error::CleanupFailed { original, .. } => original.kind(),
        }
    }

    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidUserInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Wraps a backend failure with the step and resource it happened on.
    pub fn backend(
        step: impl Into<String>,
        resource: impl Into<String>,
        err: impl std::fmt::Display,
    ) -> Self {
        Error::BackendOperationFailed {
            step: step.into(),
            resource: resource.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn storage(step: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::Storage {
            step: step.into(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn key_material(step: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::KeyMaterial {
            step: step.into(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn kubeconfig(step: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::KubeconfigOperationFailed {
            step: step.into(),
            reason: err.to_string(),
        }
    }

    /// Joins a cleanup failure onto the error that caused the cleanup.
    pub fn with_cleanup_failure(self, cleanup: Error) -> Self {
        Error::CleanupFailed {
            original: Box::new(self),
            cleanup: Box::new(cleanup),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cleanup_failure_keeps_both_messages_and_original_kind() {
        let original = Error::backend("create vm", "controlplane vm demo-vm-cp-0", "quota");
        let cleanup = Error::backend("delete network", "network demo-net", "still in use");
        let joined = original.with_cleanup_failure(cleanup);

        assert_eq!(joined.kind(), ErrorKind::BackendOperationFailed);
        let message = joined.to_string();
        assert!(message.contains("demo-vm-cp-0"));
        assert!(message.contains("still in use"));
    }
}
