//! Single notification attempts
//!
//! An [`EventInvocation`] notifies one listener about one event. If the
//! listener panics or returns an `Err`, the invocation turns into a
//! [`FailedEventInvocation`] and is handed to its
//! [`ExceptionCallback`]. Only an error raised by the callback itself leaves
//! the invocation.

use crate::callback::ExceptionCallback;
use crate::error::{CallbackError, InvocationError};
use crate::event::{AnyEvent, Event};
use crate::listener::{ListenerType, NotificationResult};
use crate::store::{ListenerHandle, ListenerId};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Bound notification method, e.g. `|listener, event| listener.user_added(event)`.
pub type BoundMethod<E, R> = fn(&<E as Event>::Listener, &E) -> R;

/// Result of a successful (or recovered) notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Go on with the next listener.
    Continue,
    /// The listener asked to stop notifying further listeners.
    Abort,
}

/// Erased invocation as executed by dispatch strategies.
pub trait Invocation: Send {
    fn listener_id(&self) -> ListenerId;

    /// Notify the listener. `Err` only when the exception callback escalated.
    fn invoke(self: Box<Self>) -> Result<Outcome, CallbackError>;
}

/// One (listener, event) notification attempt.
pub struct EventInvocation<E: Event, R> {
    listener: Arc<E::Listener>,
    event: Arc<E>,
    method: BoundMethod<E, R>,
    callback: Arc<dyn ExceptionCallback>,
}

impl<E: Event, R: NotificationResult> EventInvocation<E, R> {
    pub fn new(
        listener: Arc<E::Listener>,
        event: Arc<E>,
        method: BoundMethod<E, R>,
        callback: Arc<dyn ExceptionCallback>,
    ) -> Self {
        Self {
            listener,
            event,
            method,
            callback,
        }
    }

    pub fn listener(&self) -> &Arc<E::Listener> {
        &self.listener
    }

    pub fn event(&self) -> &Arc<E> {
        &self.event
    }

    /// Call the bound method and route a failure to the exception callback.
    pub fn notify(self) -> Result<Outcome, CallbackError> {
        let method = self.method;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            method(&*self.listener, &*self.event)
        }));

        let aborted = match result {
            Ok(value) => value.into_abort(),
            Err(payload) => Err(InvocationError::from_panic(payload)),
        };

        match aborted {
            Ok(true) if <E::Listener as ListenerType>::DESCRIPTOR.kind.honours_abort() => {
                self.event.metadata().stop_notifying();
                Ok(Outcome::Abort)
            }
            Ok(_) => Ok(Outcome::Continue),
            Err(error) => {
                let failed = self.fail(error);
                failed.report()?;
                Ok(Outcome::Continue)
            }
        }
    }

    /// Turn this invocation into a failed one carrying `error`.
    pub fn fail(self, error: InvocationError) -> FailedEventInvocation {
        let listener_id = ListenerId::of(&self.listener);
        let handle: ListenerHandle = Arc::new(self.listener);
        let event: Arc<dyn AnyEvent> = self.event;
        FailedEventInvocation {
            listener: handle,
            listener_id,
            listener_type: <E::Listener as ListenerType>::DESCRIPTOR.name,
            event,
            error,
            callback: self.callback,
            executed_on: current_thread_name(),
        }
    }
}

impl<E: Event, R: NotificationResult> Invocation for EventInvocation<E, R> {
    fn listener_id(&self) -> ListenerId {
        ListenerId::of(&self.listener)
    }

    fn invoke(self: Box<Self>) -> Result<Outcome, CallbackError> {
        (*self).notify()
    }
}

impl<E: Event, R> fmt::Debug for EventInvocation<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventInvocation")
            .field("listener_type", &<E::Listener as ListenerType>::DESCRIPTOR.name)
            .field("listener_id", &ListenerId::of(&self.listener))
            .field("event", &self.event)
            .finish()
    }
}

fn current_thread_name() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}

/// An invocation whose listener raised an error.
pub struct FailedEventInvocation {
    listener: ListenerHandle,
    listener_id: ListenerId,
    listener_type: &'static str,
    event: Arc<dyn AnyEvent>,
    error: InvocationError,
    callback: Arc<dyn ExceptionCallback>,
    executed_on: String,
}

impl FailedEventInvocation {
    /// The failed listener, if it belongs to listener-type `L`.
    pub fn listener<L: ListenerType + ?Sized>(&self) -> Option<Arc<L>> {
        self.listener.downcast_ref::<Arc<L>>().cloned()
    }

    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    pub fn listener_type(&self) -> &'static str {
        self.listener_type
    }

    /// The event being delivered, if it is an `E`.
    pub fn event<E: Event>(&self) -> Option<&E> {
        self.event.as_any().downcast_ref::<E>()
    }

    pub fn event_debug(&self) -> &dyn fmt::Debug {
        &self.event
    }

    pub fn error(&self) -> &InvocationError {
        &self.error
    }

    /// Name (or id) of the thread the listener ran on.
    pub fn executed_on(&self) -> &str {
        &self.executed_on
    }

    /// Already failed: the first error is kept.
    pub fn fail(self, _error: InvocationError) -> Self {
        self
    }

    /// Hand this failure to its exception callback.
    pub fn report(&self) -> Result<(), CallbackError> {
        self.callback.exception(self)
    }
}

impl fmt::Debug for FailedEventInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailedEventInvocation")
            .field("listener_type", &self.listener_type)
            .field("listener_id", &self.listener_id)
            .field("event", &self.event)
            .field("error", &self.error)
            .field("executed_on", &self.executed_on)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use crate::listener::Listener;
    use parking_lot::Mutex;

    trait Check: Listener {
        fn check(&self, event: &CheckEvent) -> bool;
        fn note(&self, event: &CheckEvent);
    }

    trait Plain: Listener {
        fn seen(&self, event: &PlainEvent) -> bool;
    }

    crate::listener_type!(dyn Check => Mixed { check -> bool, note -> () });
    crate::listener_type!(dyn Plain => Normal {});

    #[derive(Debug)]
    struct CheckEvent {
        metadata: EventMetadata,
    }

    impl Event for CheckEvent {
        type Listener = dyn Check;

        fn metadata(&self) -> &EventMetadata {
            &self.metadata
        }
    }

    #[derive(Debug)]
    struct PlainEvent {
        metadata: EventMetadata,
    }

    impl Event for PlainEvent {
        type Listener = dyn Plain;

        fn metadata(&self) -> &EventMetadata {
            &self.metadata
        }
    }

    struct Answer(bool);

    impl Listener for Answer {}

    impl Check for Answer {
        fn check(&self, _event: &CheckEvent) -> bool {
            self.0
        }

        fn note(&self, _event: &CheckEvent) {
            panic!("note failed");
        }
    }

    impl Plain for Answer {
        fn seen(&self, _event: &PlainEvent) -> bool {
            self.0
        }
    }

    #[derive(Default)]
    struct Recorder {
        failures: Mutex<Vec<String>>,
    }

    impl ExceptionCallback for Recorder {
        fn exception(&self, invocation: &FailedEventInvocation) -> Result<(), CallbackError> {
            self.failures.lock().push(invocation.error().to_string());
            Ok(())
        }
    }

    fn check_event() -> Arc<CheckEvent> {
        Arc::new(CheckEvent {
            metadata: EventMetadata::new("test"),
        })
    }

    #[test]
    fn test_abort_marks_event() {
        let event = check_event();
        let listener: Arc<dyn Check> = Arc::new(Answer(true));
        let invocation = EventInvocation::new(
            listener,
            event.clone(),
            |l, e| l.check(e),
            Arc::new(Recorder::default()),
        );

        assert_eq!(invocation.notify().unwrap(), Outcome::Abort);
        assert!(event.metadata.is_aborted());
    }

    #[test]
    fn test_normal_kind_ignores_bool_result() {
        let event = Arc::new(PlainEvent {
            metadata: EventMetadata::new("test"),
        });
        let listener: Arc<dyn Plain> = Arc::new(Answer(true));
        let invocation = EventInvocation::new(
            listener,
            event.clone(),
            |l, e| l.seen(e),
            Arc::new(Recorder::default()),
        );

        assert_eq!(invocation.notify().unwrap(), Outcome::Continue);
        assert!(!event.metadata.is_aborted());
    }

    #[test]
    fn test_panic_is_reported_to_callback() {
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn Check> = Arc::new(Answer(false));
        let invocation =
            EventInvocation::new(listener, check_event(), |l, e| l.note(e), recorder.clone());

        assert_eq!(invocation.notify().unwrap(), Outcome::Continue);
        assert_eq!(
            *recorder.failures.lock(),
            vec!["Listener panicked: note failed".to_string()]
        );
    }

    #[test]
    fn test_callback_escalation_leaves_invocation() {
        let listener: Arc<dyn Check> = Arc::new(Answer(false));
        let escalate = |_: &FailedEventInvocation| -> Result<(), CallbackError> {
            Err(CallbackError::new("escalated"))
        };
        let invocation =
            EventInvocation::new(listener, check_event(), |l, e| l.note(e), Arc::new(escalate));

        let err = invocation.notify().unwrap_err();
        assert_eq!(err.message(), "escalated");
    }

    #[test]
    fn test_fail_is_idempotent() {
        let event = check_event();
        let listener: Arc<dyn Check> = Arc::new(Answer(false));
        let invocation = EventInvocation::new(
            listener.clone(),
            event.clone(),
            |l, e| l.check(e),
            Arc::new(Recorder::default()),
        );

        let failed = invocation
            .fail(InvocationError::Panicked("first".into()))
            .fail(InvocationError::Panicked("second".into()));

        assert_eq!(failed.error().to_string(), "Listener panicked: first");
        assert_eq!(failed.listener_type(), "dyn Check");
        assert_eq!(failed.listener_id(), ListenerId::of(&listener));
        assert!(Arc::ptr_eq(&failed.listener::<dyn Check>().unwrap(), &listener));
        assert!(failed.listener::<dyn Plain>().is_none());
        assert!(std::ptr::eq(failed.event::<CheckEvent>().unwrap(), &*event));
        assert!(failed.event::<PlainEvent>().is_none());
        assert!(!failed.executed_on().is_empty());
    }

    #[test]
    fn test_erased_invoke() {
        let listener: Arc<dyn Check> = Arc::new(Answer(true));
        let id = ListenerId::of(&listener);
        let invocation: Box<dyn Invocation> = Box::new(EventInvocation::new(
            listener,
            check_event(),
            |l, e| l.check(e),
            Arc::new(Recorder::default()),
        ));

        assert_eq!(invocation.listener_id(), id);
        assert_eq!(invocation.invoke().unwrap(), Outcome::Abort);
    }
}
