//! Error types for the replicant operator
//!
//! Errors carry enough context (group, unit, operation) to be useful in the
//! reconcile-failure log line, and classify themselves as retryable or
//! permanent so the error policy can pick a requeue strategy.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for replicant operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a ReplicaGroup spec
    #[error("validation error for {group}: {message}")]
    Validation {
        /// Name of the ReplicaGroup with invalid configuration
        group: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.replicas")
        field: Option<String>,
    },

    /// The store rejected a create because the name is taken
    #[error("unit {namespace}/{name} already exists")]
    AlreadyExists {
        /// Namespace of the colliding unit
        namespace: String,
        /// Name of the colliding unit
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A store call did not complete before its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The store operation that timed out (get, list, create, ...)
        operation: String,
        /// Deadline that was exceeded
        after: Duration,
    },

    /// A store call was abandoned because the controller is shutting down
    #[error("{operation} cancelled")]
    Cancelled {
        /// The store operation that was cancelled
        operation: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "startup")
        context: String,
    },
}

impl Error {
    /// Create a validation error with group context
    pub fn validation_for(group: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            group: group.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with group context and field path
    pub fn validation_for_field(
        group: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            group: group.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an already-exists error for a unit name collision
    pub fn already_exists(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a timeout error for a store operation
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create a cancellation error for a store operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec or code change.
    /// Kubernetes 4xx errors are permanent except Conflict (409) and
    /// TooManyRequests (429); everything else is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::AlreadyExists { .. } => true,
            Error::Serialization { .. } => false,
            Error::Timeout { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
