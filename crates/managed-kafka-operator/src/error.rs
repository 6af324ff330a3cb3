//! Error types for the managed Kafka operator

use thiserror::Error;

/// Errors that can occur during provisioning and finalization
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Network-level failure talking to the admin API or token endpoint.
    /// Never wrapped with context; the caller owns retry policy.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    /// Invalid environment or application configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Managed Kafka secret is missing a field or holds invalid data
    #[error("Invalid managed kafka secret: {0}")]
    InvalidSecret(String),

    /// A topic config key has no registered merge function
    #[error("no conversion type for {key}")]
    MissingConverter { key: String },

    /// A topic config value could not be merged
    #[error("invalid value for topic config {key}: {message}")]
    InvalidTopicValue { key: String, message: String },

    /// Admin API answered with an unexpected status
    #[error("bad error status code {operation} {status} - {body}")]
    AdminApi {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// Token endpoint refused the client-credentials grant
    #[error("token request failed with status {status} - {body}")]
    TokenRequest { status: u16, body: String },

    /// Connect cluster already belongs to another environment
    #[error("kafka connect cluster named '{cluster}' found in ns '{namespace}' but tied to env '{env_label}'")]
    EnvConflict {
        cluster: String,
        namespace: String,
        env_label: String,
    },

    /// Error annotated with the step that produced it
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<OperatorError>,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Wrap this error with a description of the failing step.
    ///
    /// Transport errors pass through untouched.
    pub fn context(self, context: impl Into<String>) -> Self {
        match self {
            OperatorError::Transport(_) => self,
            other => OperatorError::Context {
                context: context.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error beneath any context wrappers
    pub fn root(&self) -> &OperatorError {
        match self {
            OperatorError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            OperatorError::KubeError(_)
            | OperatorError::Transport(_)
            | OperatorError::ReconcileFailed(_) => true,
            OperatorError::AdminApi { status, .. } | OperatorError::TokenRequest { status, .. } => {
                *status >= 500 || *status == 429
            }
            _ => false,
        }
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        if self.is_retryable() {
            Some(std::time::Duration::from_secs(30))
        } else {
            None
        }
    }
}

/// Attach step context to a fallible result
pub trait ErrorContext<T> {
    fn context(self, context: &str) -> Result<T>;

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> ErrorContext<T> for Result<T> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::EnvConflict {
            cluster: "env-a".to_string(),
            namespace: "kafka".to_string(),
            env_label: "env-b".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("env-a"));
        assert!(msg.contains("kafka"));
        assert!(msg.contains("env-b"));
    }

    #[test]
    fn test_context_wraps_and_keeps_source() {
        let err = OperatorError::AdminApi {
            operation: "creating",
            status: 400,
            body: "bad partitions".to_string(),
        }
        .context("failed to provision topic env-a-orders");

        let msg = err.to_string();
        assert!(msg.starts_with("failed to provision topic env-a-orders"));
        assert!(msg.contains("bad partitions"));
        assert!(matches!(err.root(), OperatorError::AdminApi { status: 400, .. }));
    }

    #[test]
    fn test_context_via_result_ext() {
        let res: Result<()> = Err(OperatorError::InvalidConfig("x".to_string()));
        let err = res.context("outer").unwrap_err();
        assert!(matches!(err, OperatorError::Context { .. }));
    }

    #[test]
    fn test_retryable_errors() {
        let server_err = OperatorError::AdminApi {
            operation: "updating",
            status: 503,
            body: String::new(),
        };
        assert!(server_err.is_retryable());

        let client_err = OperatorError::AdminApi {
            operation: "updating",
            status: 400,
            body: String::new(),
        };
        assert!(!client_err.is_retryable());

        let conflict = OperatorError::EnvConflict {
            cluster: "c".to_string(),
            namespace: "n".to_string(),
            env_label: "e".to_string(),
        }
        .context("failed to provision kafka connect cluster");
        assert!(!conflict.is_retryable());
    }

    #[test]
    fn test_requeue_delay() {
        let retryable = OperatorError::ReconcileFailed("test".to_string());
        assert!(retryable.requeue_delay().is_some());

        let not_retryable = OperatorError::MissingConverter {
            key: "foo".to_string(),
        };
        assert!(not_retryable.requeue_delay().is_none());
    }
}
