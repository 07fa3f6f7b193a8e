//! Typed listener notification for Armature
//!
//! This crate lets independent producers notify registered listener objects
//! about typed events, with per-listener failure isolation and pluggable
//! dispatch strategies.
//!
//! ## Features
//!
//! - **Listener Store** - Ordered, snapshot-based listener registry
//! - **Listener Kinds** - Normal, abortable, mixed and tagging listener-types
//! - **Strategies** - Sequential, unrolling and asynchronous dispatch
//! - **Fault Isolation** - Panicking listeners never starve the others
//! - **Exception Callbacks** - Log, collect or escalate listener failures
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use armature_listeners::*;
//! use std::sync::Arc;
//!
//! // Define an event
//! #[derive(Debug)]
//! struct UserEvent {
//!     metadata: EventMetadata,
//!     user_id: String,
//! }
//!
//! // Define its listener-type
//! trait UserListener: Listener {
//!     fn user_added(&self, event: &UserEvent) -> bool;
//!     fn user_removed(&self, event: &UserEvent);
//! }
//!
//! listener_type!(dyn UserListener => Mixed {
//!     user_added -> bool,
//!     user_removed -> (),
//! });
//!
//! impl Event for UserEvent {
//!     type Listener = dyn UserListener;
//!
//!     fn metadata(&self) -> &EventMetadata {
//!         &self.metadata
//!     }
//! }
//!
//! // Implement a listener
//! struct Audit;
//!
//! impl Listener for Audit {}
//!
//! impl UserListener for Audit {
//!     fn user_added(&self, event: &UserEvent) -> bool {
//!         println!("added {}", event.user_id);
//!         false
//!     }
//!
//!     fn user_removed(&self, event: &UserEvent) {
//!         println!("removed {}", event.user_id);
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let provider = SequentialProvider::new();
//!     provider.listeners().add::<dyn UserListener>(Arc::new(Audit))?;
//!
//!     let event = UserEvent {
//!         metadata: EventMetadata::new("accounts"),
//!         user_id: "123".to_string(),
//!     };
//!     provider.dispatch(event, |l, e| l.user_added(e))?;
//!
//!     provider.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Strategies
//!
//! ```rust,ignore
//! let provider = EventProviderBuilder::new()
//!     .strategy(Strategy::Asynchronous)   // Notify on worker lanes
//!     .workers(4)
//!     .lane_policy(LanePolicy::Listener)  // Keep per-listener order
//!     .close_policy(ClosePolicy::Drain)   // Finish queued work on close
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```rust,ignore
//! let provider = EventProviderBuilder::new()
//!     .exception_callback(Arc::new(PropagatingExceptionCallback))
//!     .build()?;
//!
//! match provider.dispatch(event, |l, e| l.user_removed(e)) {
//!     Ok(()) => println!("All listeners notified"),
//!     Err(ListenerError::Escalated(e)) => eprintln!("Listener failed: {}", e),
//!     Err(e) => eprintln!("Dispatch error: {}", e),
//! }
//! ```

pub mod callback;
pub mod config;
pub mod error;
pub mod event;
pub mod invocation;
pub mod listener;
pub mod provider;
pub mod store;

pub use callback::{ExceptionCallback, LoggingExceptionCallback, PropagatingExceptionCallback};
pub use config::{ClosePolicy, EventProviderBuilder, LanePolicy, ProviderConfig, Strategy};
pub use error::{BoxError, CallbackError, InvocationError, ListenerError, Result};
pub use event::{AnyEvent, Event, EventMetadata, RegistrationEvent};
pub use invocation::{BoundMethod, EventInvocation, FailedEventInvocation, Invocation, Outcome};
pub use listener::{
    Listener, ListenerDescriptor, ListenerKind, ListenerType, MethodShape, NotificationResult,
    ReturnShape,
};
pub use provider::{
    AsynchronousProvider, Dispatch, EventProvider, EventProviderExt, Invocations,
    SequentialProvider, UnrollingProvider,
};
pub use store::{
    DefaultListenerStore, ListenerHandle, ListenerId, ListenerKey, ListenerSnapshot,
    ListenerSource, ListenerStore, ListenerStoreExt, Listeners, RegisteredListener,
    SynchronizedListenerStore,
};
