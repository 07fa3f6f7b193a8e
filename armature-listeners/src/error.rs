// Error types for listener registration and event dispatch

use thiserror::Error;

/// Boxed error type accepted from listeners and exception callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced synchronously to callers of the store and providers.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// A listener or listener-type failed registration checks.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The provider was closed before the call.
    #[error("Event provider has been closed")]
    Closed,

    /// An exception callback raised while handling a failed invocation.
    #[error("Exception callback escalated a listener failure: {0}")]
    Escalated(#[from] CallbackError),

    /// The worker pool of an asynchronous provider could not be started.
    #[error("Failed to start listener worker pool: {0}")]
    WorkerPool(#[from] std::io::Error),

    /// The provider configuration is not usable.
    #[error("Invalid provider configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ListenerError>;

/// What a listener raised while being notified.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("Listener panicked: {0}")]
    Panicked(String),

    #[error("Listener failed: {0}")]
    Failed(#[source] BoxError),
}

impl InvocationError {
    /// Build from a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&'static str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "unknown panic".to_string()
        };
        InvocationError::Panicked(message)
    }
}

/// Raised by an [`ExceptionCallback`](crate::ExceptionCallback) to escalate a failure
/// to the caller of `dispatch`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
