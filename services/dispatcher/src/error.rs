//! Error types for the dispatcher.

use fleet_reconcile::{PoolError, VmidRange};
use thiserror::Error;

/// Result type for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Dispatcher errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid pool definitions.
    #[error("invalid pool configuration: {0}")]
    Pool(#[from] PoolError),

    /// A read of the job queue or hypervisor inventory failed.
    #[error("query failed: {operation}: {detail}")]
    Query { operation: String, detail: String },

    /// A hypervisor task finished with a non-success exit status.
    #[error("task {task} failed: exit status {exit_status}")]
    TaskFailed { task: String, exit_status: String },

    /// A required hypervisor object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The hypervisor does not implement an operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Every VMID in a pool's range is taken.
    #[error("pool {pool}: no free vmid in range {range}")]
    ExhaustedRange { pool: String, range: VmidRange },

    /// Boot configuration could not be rendered.
    #[error("render failed: {0}")]
    Render(String),

    /// A remote API answered with a non-success status.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// HTTP transport failure.
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DispatchError {
    /// Wrap any error from a read-only query as a [`DispatchError::Query`].
    pub fn query(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Query {
            operation: operation.into(),
            detail: err.to_string(),
        }
    }

    /// Whether this is the hypervisor's "not implemented" signal.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }

    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) | Self::Pool(_) => "configuration_error",
            Self::Query { .. } => "transient_query_error",
            Self::TaskFailed { .. } => "task_failed",
            Self::NotFound(_) => "not_found",
            Self::Unsupported(_) => "unsupported",
            Self::ExhaustedRange { .. } => "exhausted_range",
            Self::Render(_) => "render_failed",
            Self::Api { .. } => "api_error",
            Self::Transport(_) => "http_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}
