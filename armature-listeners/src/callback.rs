//! Exception callbacks
//!
//! Receive every [`FailedEventInvocation`]. Returning `Ok` lets the dispatch
//! continue with the remaining listeners; returning `Err` escalates the
//! failure to the caller of `dispatch` and stops that dispatch.

use crate::error::CallbackError;
use crate::invocation::FailedEventInvocation;
use tracing::error;

/// Sink for failed listener invocations.
pub trait ExceptionCallback: Send + Sync {
    fn exception(&self, invocation: &FailedEventInvocation) -> Result<(), CallbackError>;
}

impl<F> ExceptionCallback for F
where
    F: Fn(&FailedEventInvocation) -> Result<(), CallbackError> + Send + Sync,
{
    fn exception(&self, invocation: &FailedEventInvocation) -> Result<(), CallbackError> {
        self(invocation)
    }
}

/// Default callback: logs the failure and lets dispatch continue.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExceptionCallback;

impl ExceptionCallback for LoggingExceptionCallback {
    fn exception(&self, invocation: &FailedEventInvocation) -> Result<(), CallbackError> {
        error!(
            listener_type = invocation.listener_type(),
            listener_id = ?invocation.listener_id(),
            event = ?invocation.event_debug(),
            thread = invocation.executed_on(),
            error = %invocation.error(),
            "Listener failed during notification"
        );
        Ok(())
    }
}

/// Escalates every failure to the caller of `dispatch`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PropagatingExceptionCallback;

impl ExceptionCallback for PropagatingExceptionCallback {
    fn exception(&self, invocation: &FailedEventInvocation) -> Result<(), CallbackError> {
        Err(CallbackError::new(format!(
            "listener of `{}` failed: {}",
            invocation.listener_type(),
            invocation.error()
        )))
    }
}
