//! Dispatch strategies
//!
//! An [`EventProvider`] takes a snapshot of the listeners registered for an
//! event's listener-type, creates one [`EventInvocation`] per listener and
//! executes them according to its concurrency policy.
//!
//! | Strategy                | Thread          | Order           | Abort        |
//! |-------------------------|-----------------|-----------------|--------------|
//! | [`SequentialProvider`]  | caller          | registration    | honoured     |
//! | [`UnrollingProvider`]   | caller          | registration    | honoured     |
//! | [`AsynchronousProvider`]| worker lanes    | per listener    | best effort  |

mod asynchronous;
mod sequential;
mod unrolling;

pub use asynchronous::AsynchronousProvider;
pub use sequential::SequentialProvider;
pub use unrolling::UnrollingProvider;

use crate::callback::ExceptionCallback;
use crate::config::ProviderConfig;
use crate::error::{ListenerError, Result};
use crate::event::{AnyEvent, Event};
use crate::invocation::{BoundMethod, EventInvocation, Invocation, Outcome};
use crate::listener::{ListenerKind, ListenerType, NotificationResult};
use crate::store::{ListenerSource, ListenerStore};
use parking_lot::RwLock;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Lazily materialised invocations of one `dispatch` call.
pub type Invocations = Box<dyn Iterator<Item = Box<dyn Invocation>> + Send>;

/// One `dispatch` call, ready to be executed by a strategy.
pub struct Dispatch {
    pub listener_type: &'static str,
    pub type_id: TypeId,
    pub event: Arc<dyn AnyEvent>,
    pub invocations: Invocations,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("listener_type", &self.listener_type)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// Dispatch strategy contract.
///
/// Object safe; the typed `dispatch` operations live in [`EventProviderExt`].
pub trait EventProvider: Send + Sync {
    /// Store the provider draws listeners from.
    fn listeners(&self) -> &Arc<dyn ListenerStore>;

    /// Extra sources consulted after the store, in order.
    fn sources(&self) -> &[Arc<dyn ListenerSource>];

    fn exception_callback(&self) -> Arc<dyn ExceptionCallback>;

    /// Replace the callback used by [`EventProviderExt::dispatch`].
    fn set_exception_callback(&self, callback: Arc<dyn ExceptionCallback>);

    fn config(&self) -> &ProviderConfig;

    /// Run the invocations of `dispatch` according to this strategy.
    fn execute(&self, dispatch: Dispatch) -> Result<()>;

    /// Whether listeners are notified one after another in registration order.
    fn is_sequential(&self) -> bool;

    /// Release execution resources, the store and every source. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Typed dispatch for every [`EventProvider`].
pub trait EventProviderExt: EventProvider {
    /// Notify every listener of `E::Listener` through `method`, reporting
    /// failures to the provider's exception callback.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// provider.dispatch(UserEvent::added("alice"), |l, e| l.user_added(e))?;
    /// ```
    fn dispatch<E, R>(&self, event: E, method: BoundMethod<E, R>) -> Result<()>
    where
        E: Event,
        R: NotificationResult,
    {
        self.dispatch_with(event, method, self.exception_callback())
    }

    /// Like [`dispatch`](EventProviderExt::dispatch) with an explicit callback.
    fn dispatch_with<E, R>(
        &self,
        event: E,
        method: BoundMethod<E, R>,
        callback: Arc<dyn ExceptionCallback>,
    ) -> Result<()>
    where
        E: Event,
        R: NotificationResult,
    {
        if self.is_closed() {
            return Err(ListenerError::Closed);
        }

        let descriptor = <E::Listener as ListenerType>::DESCRIPTOR;
        if descriptor.kind == ListenerKind::Tagging {
            return Err(ListenerError::InvalidArgument(format!(
                "listener type `{}` is tagging and cannot be notified",
                descriptor.name
            )));
        }

        let type_id = TypeId::of::<E::Listener>();
        let event = Arc::new(event);

        let mut snapshots = vec![self.listeners().snapshot(type_id)];
        snapshots.extend(self.sources().iter().map(|source| source.snapshot(type_id)));

        let shared = Arc::clone(&event);
        let invocations = snapshots
            .into_iter()
            .flat_map(|snapshot| snapshot.into_listeners::<E::Listener>())
            .map(move |listener| -> Box<dyn Invocation> {
                Box::new(EventInvocation::new(
                    listener,
                    Arc::clone(&shared),
                    method,
                    Arc::clone(&callback),
                ))
            });

        self.execute(Dispatch {
            listener_type: descriptor.name,
            type_id,
            event,
            invocations: Box::new(invocations),
        })
    }
}

impl<P: EventProvider + ?Sized> EventProviderExt for P {}

/// State shared by every built-in strategy.
pub(crate) struct ProviderCore {
    store: Arc<dyn ListenerStore>,
    sources: Vec<Arc<dyn ListenerSource>>,
    callback: RwLock<Arc<dyn ExceptionCallback>>,
    closed: AtomicBool,
    config: ProviderConfig,
}

impl ProviderCore {
    pub(crate) fn new(
        store: Arc<dyn ListenerStore>,
        sources: Vec<Arc<dyn ListenerSource>>,
        callback: Arc<dyn ExceptionCallback>,
        config: ProviderConfig,
    ) -> Self {
        Self {
            store,
            sources,
            callback: RwLock::new(callback),
            closed: AtomicBool::new(false),
            config,
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn ListenerStore> {
        &self.store
    }

    pub(crate) fn sources(&self) -> &[Arc<dyn ListenerSource>] {
        &self.sources
    }

    pub(crate) fn callback(&self) -> Arc<dyn ExceptionCallback> {
        Arc::clone(&self.callback.read())
    }

    pub(crate) fn set_callback(&self, callback: Arc<dyn ExceptionCallback>) {
        *self.callback.write() = callback;
    }

    pub(crate) fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ListenerError::Closed);
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark closed. Returns `false` if it already was.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Close the store and every extra source.
    pub(crate) fn release(&self, strategy: &'static str) {
        self.store.close();
        for source in &self.sources {
            source.close();
        }
        info!(strategy, "Event provider closed");
    }

    /// Store and every source deliver in registration order.
    pub(crate) fn sources_sequential(&self) -> bool {
        self.store.is_sequential() && self.sources.iter().all(|source| source.is_sequential())
    }
}

/// Run `dispatch` on the current thread, in order.
///
/// Stops after an abort and propagates callback escalation.
pub(crate) fn run_sequentially(dispatch: Dispatch, logging: bool) -> Result<()> {
    let Dispatch {
        listener_type,
        event,
        invocations,
        ..
    } = dispatch;

    if logging {
        debug!(
            listener_type,
            event_id = %event.event_metadata().id,
            "Dispatching event"
        );
    }

    for invocation in invocations {
        let listener_id = invocation.listener_id();
        if invocation.invoke()? == Outcome::Abort {
            if logging {
                debug!(listener_type, ?listener_id, "Listener aborted notification");
            }
            break;
        }
    }
    Ok(())
}
