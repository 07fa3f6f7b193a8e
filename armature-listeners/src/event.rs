//! Event definitions and traits

use crate::listener::{ListenerKind, ListenerType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Event trait
///
/// An event is an immutable notification payload for exactly one
/// listener-type, named by [`Event::Listener`].
pub trait Event: Send + Sync + Debug + 'static {
    /// Listener-type notified about this event
    type Listener: ListenerType + ?Sized;

    /// Get event metadata
    fn metadata(&self) -> &EventMetadata;

    /// Get the name of the producer that fired the event
    fn source(&self) -> &str {
        &self.metadata().source
    }
}

/// Type-erased view of an [`Event`], used where the listener-type is unknown.
pub trait AnyEvent: Send + Sync + Debug + 'static {
    /// Cast to Any for downcasting
    fn as_any(&self) -> &dyn Any;

    fn event_metadata(&self) -> &EventMetadata;
}

impl<E: Event> AnyEvent for E {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn event_metadata(&self) -> &EventMetadata {
        self.metadata()
    }
}

/// Base event metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event ID
    pub id: Uuid,

    /// Producer of the event
    pub source: String,

    /// Timestamp when event was created
    pub timestamp: DateTime<Utc>,

    /// Optional correlation ID for tracing
    pub correlation_id: Option<Uuid>,

    /// Custom attributes
    pub attributes: serde_json::Value,

    #[serde(skip)]
    aborted: AbortFlag,
}

impl EventMetadata {
    /// Create new event metadata
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            attributes: serde_json::Value::Object(serde_json::Map::new()),
            aborted: AbortFlag::default(),
        }
    }

    /// Set correlation ID
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Add a custom attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = &mut self.attributes {
            map.insert(key.into(), value);
        }
        self
    }

    /// Set by an invocation whose abortable listener asked to stop.
    pub(crate) fn stop_notifying(&self) {
        self.aborted.set();
    }

    /// Whether an abortable listener stopped notification of this event.
    pub fn is_aborted(&self) -> bool {
        self.aborted.get()
    }
}

/// Abort flag shared by all invocations of one dispatch.
///
/// Belongs to one dispatched event: clones start un-aborted.
#[derive(Debug, Default)]
struct AbortFlag(AtomicBool);

impl AbortFlag {
    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Clone for AbortFlag {
    fn clone(&self) -> Self {
        Self::default()
    }
}

/// Passed to [`Listener::on_register`](crate::Listener::on_register) and
/// [`Listener::on_unregister`](crate::Listener::on_unregister).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationEvent {
    pub listener_type: &'static str,
    pub kind: ListenerKind,
}
