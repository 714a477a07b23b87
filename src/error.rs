//! Error types for the operator bootstrap
//!
//! Variants follow the startup failure taxonomy: configuration, type registry,
//! startup-task registration and execution, admission wiring and runtime
//! failures. Everything except `Task` is fatal to the bootstrap.

use thiserror::Error;

/// Main error type for bootstrap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid resolved configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be read or parsed
    #[error("unable to load the config file {path}: {message}")]
    ConfigFile {
        /// Path given on the command line
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Duplicate or inconsistent resource kind registration
    #[error("type registry error for {kind}: {message}")]
    Registry {
        /// Kind identity (`group/version/Kind`)
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// A startup task could not be attached to the runtime
    #[error("failed to register startup task {task}: {message}")]
    TaskRegistration {
        /// Name of the task
        task: String,
        /// Description of what failed
        message: String,
    },

    /// A registered startup task failed while running
    #[error("startup task {task} failed: {message}")]
    Task {
        /// Name of the task
        task: String,
        /// Description of what failed
        message: String,
    },

    /// Admission entry point construction or serving failed
    #[error("webhook error: {0}")]
    Webhook(String),

    /// Runtime construction or serve loop failed
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a config-file error for the given path
    pub fn config_file(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConfigFile {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a registry error for the given kind
    pub fn registry(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registry {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a task registration error naming the task
    pub fn task_registration(task: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TaskRegistration {
            task: task.into(),
            message: msg.into(),
        }
    }

    /// Create a task execution error naming the task
    pub fn task(task: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Task {
            task: task.into(),
            message: msg.into(),
        }
    }

    /// Create a webhook error with the given message
    pub fn webhook(msg: impl Into<String>) -> Self {
        Self::Webhook(msg.into())
    }

    /// Create a runtime error with the given message
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether the process may keep serving after this error
    ///
    /// Only background task failures are recoverable; everything else aborts
    /// the bootstrap.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Task { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
