use crate::task::TaskId;
use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by task handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Structured error context for configuration and setup failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Configuration key that caused the error (e.g., "rate_limit.capacity")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config", "env")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the dispatch core.
///
/// Submission-path failures (`RateLimited`, `QueueClosed`, `Timeout`, `Canceled`) are returned
/// synchronously to the submitter. Handler failures, panics included, arrive as `Handler` and
/// never escape the worker that ran them.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller's token bucket is empty. Retry later, not immediately.
    #[error("Rate limited: no tokens left for key '{key}'")]
    RateLimited { key: String },

    /// Submission after shutdown began.
    #[error("Queue closed: no new submissions are accepted")]
    QueueClosed,

    #[error("Task {task_id} timed out before completion")]
    Timeout { task_id: TaskId },

    #[error("Task {task_id} was canceled by the caller")]
    Canceled { task_id: TaskId },

    #[error("Task {task_id} handler failed: {source}")]
    Handler {
        task_id: TaskId,
        #[source]
        source: BoxError,
    },

    /// The task was still queued or running when the shutdown drain window elapsed.
    #[error("Task {task_id} was abandoned during shutdown")]
    Abandoned { task_id: TaskId },

    #[error("Shutdown drain window of {drain_timeout:?} elapsed with {outstanding} task(s) outstanding")]
    ShutdownTimeout {
        drain_timeout: Duration,
        outstanding: usize,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Shorthand for a configuration error about a single field.
    pub(crate) fn invalid_field(field: &str, details: impl Into<String>) -> Self {
        Self::configuration_with_context(
            format!("invalid value for '{}'", field),
            ErrorContext::new()
                .with_field_path(field)
                .with_details(details)
                .with_source("config"),
        )
    }

    /// Whether retrying the same submission later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }

    /// Task identifier carried by per-task errors.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Error::Timeout { task_id }
            | Error::Canceled { task_id }
            | Error::Handler { task_id, .. }
            | Error::Abandoned { task_id } => Some(*task_id),
            _ => None,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Source attached to `Error::Handler` when a handler panicked.
#[derive(Debug, Error)]
#[error("handler panicked: {message}")]
pub struct HandlerPanic {
    pub message: String,
}

impl HandlerPanic {
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }
}
