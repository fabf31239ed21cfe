//! Error types shared by every backend

use thiserror::Error;

/// Result type alias for hook operations
pub type Result<T> = std::result::Result<T, HookError>;

/// Errors that can occur while driving a job's containers
#[derive(Debug, Error)]
pub enum HookError {
    /// A required environment variable is missing or invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The container engine or cluster API rejected a call
    #[error("Backend command `{command}` failed: {message}")]
    BackendCommand {
        /// The command or API call that failed
        command: String,
        /// Raw error payload reported by the backend
        message: String,
    },

    /// A phase or health wait exceeded its budget
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A port or port-mapping string could not be parsed
    #[error("Invalid format '{input}', expected {expected}")]
    Format {
        /// The offending input
        input: String,
        /// Description of the accepted format
        expected: String,
    },

    /// The cluster identity lacks a required permission
    #[error(
        "The service account needs the {verbs:?} permissions on '{resource}' in the '{namespace}' namespace. Please contact your self hosted runner administrator."
    )]
    Permission {
        /// Verbs that were denied
        verbs: Vec<String>,
        /// Resource (and subresource) the verbs apply to
        resource: String,
        /// Namespace the check ran against
        namespace: String,
    },

    /// A container's health check reported a terminal non-healthy status
    #[error("Container '{container}' is unhealthy with status '{status}'")]
    Unhealthy {
        /// Image or name of the container
        container: String,
        /// Last reported status
        status: String,
    },

    /// Arguments supplied by the caller are unusable
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The job state was produced by a different backend or version
    #[error("State mismatch: {0}")]
    StateMismatch(String),

    /// One or more resources could not be deleted during cleanup
    #[error("Cleanup failed for {} resource(s): {}", .0.len(), .0.join("; "))]
    Cleanup(Vec<String>),

    /// Local I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl HookError {
    /// Create a backend command error
    pub fn backend(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendCommand {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a format error
    pub fn format(input: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::Format {
            input: input.into(),
            expected: expected.into(),
        }
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
