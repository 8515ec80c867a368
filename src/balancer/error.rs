//! Balancer error types.
//!
//! Every fallible balancer operation returns [`Error`]. The variant maps to an
//! [`ErrorKind`] that callers (the service layer, the CLI) use to classify
//! failures the same way a gRPC front end would map them to status codes.

use crate::dataplane::DataplaneError;

/// Result type for balancer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of a balancer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request was malformed or violated a validation rule.
    InvalidArgument,
    /// Referenced virtual service, real or instance does not exist.
    NotFound,
    /// Operation on a balancer that has already been freed.
    FailedPrecondition,
    /// Dataplane or runtime failure.
    Internal,
}

/// Balancer errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Request failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Referenced entity does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Dataplane agent or session table call failed.
    #[error("{context}: {source}")]
    Dataplane {
        context: String,
        #[source]
        source: DataplaneError,
    },

    /// Balancer was freed and can not be used anymore.
    #[error("balancer '{name}' has been freed")]
    Freed { name: String },

    /// A background task was requested outside of a tokio runtime.
    #[error("can not start {task}: no tokio runtime is running")]
    NoRuntime { task: String },

    /// Error wrapped with the operation that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an invalid argument error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    /// Create a not found error.
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound(reason.into())
    }

    /// Create a dataplane error with context.
    pub fn dataplane(context: impl Into<String>, source: DataplaneError) -> Self {
        Self::Dataplane {
            context: context.into(),
            source,
        }
    }

    /// Create a freed error.
    pub fn freed(name: impl Into<String>) -> Self {
        Self::Freed { name: name.into() }
    }

    /// Wrap this error with the operation that produced it.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Freed { .. } => ErrorKind::FailedPrecondition,
            Self::Dataplane { .. } | Self::NoRuntime { .. } => ErrorKind::Internal,
            Self::Context { source, .. } => source.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_kind() {
        let err = Error::invalid("weight 2000 exceeds 1024").context("real at index 1");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            err.to_string(),
            "real at index 1: invalid argument: weight 2000 exceeds 1024"
        );
    }

    #[test]
    fn test_dataplane_error_is_internal() {
        let err = Error::dataplane("failed to resize", DataplaneError::new("out of memory"));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), "failed to resize: out of memory");
    }

    #[test]
    fn test_freed_is_failed_precondition() {
        assert_eq!(Error::freed("lb0").kind(), ErrorKind::FailedPrecondition);
    }
}
