//! Sequential dispatch that keeps the stack flat under cascades
//!
//! A listener that dispatches again from inside its notification would
//! normally recurse: every nested `dispatch` runs to completion before the
//! outer one continues. This provider queues such nested dispatches per
//! thread and lets the outermost call drain the queue in a loop.
//!
//! ```text
//! dispatch(A) ─► L1(A) ─► dispatch(B)  (queued, returns Ok)
//!             ─► L2(A)
//!             ─► L1(B) ─► L2(B)        (drained by dispatch(A))
//! ```

use super::{Dispatch, EventProvider, ProviderCore, run_sequentially};
use crate::callback::{ExceptionCallback, LoggingExceptionCallback};
use crate::config::{ProviderConfig, Strategy};
use crate::error::Result;
use crate::store::{DefaultListenerStore, ListenerSource, ListenerStore};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::warn;

type Pending = Mutex<HashMap<ThreadId, VecDeque<Dispatch>>>;

/// Same external contract as
/// [`SequentialProvider`](super::SequentialProvider), except that a nested
/// dispatch returns before its listeners ran. They run, in order, once the
/// dispatch being processed on that thread has finished.
///
/// When an exception callback escalates, the error is returned by the
/// outermost `dispatch` and the dispatches still queued on that thread are
/// dropped.
pub struct UnrollingProvider {
    core: ProviderCore,
    pending: Pending,
}

impl UnrollingProvider {
    pub fn new() -> Self {
        Self::with_store(Arc::new(DefaultListenerStore::new()))
    }

    pub fn with_store(store: Arc<dyn ListenerStore>) -> Self {
        let config = ProviderConfig {
            strategy: Strategy::Unrolling,
            ..ProviderConfig::default()
        };
        Self::with_parts(store, Vec::new(), Arc::new(LoggingExceptionCallback), config)
    }

    pub(crate) fn with_parts(
        store: Arc<dyn ListenerStore>,
        sources: Vec<Arc<dyn ListenerSource>>,
        callback: Arc<dyn ExceptionCallback>,
        config: ProviderConfig,
    ) -> Self {
        Self {
            core: ProviderCore::new(store, sources, callback, config),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn next_pending(&self, thread: ThreadId) -> Option<Dispatch> {
        self.pending
            .lock()
            .get_mut(&thread)
            .and_then(VecDeque::pop_front)
    }
}

impl Default for UnrollingProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the thread's queue once the outermost dispatch returns or unwinds.
struct DrainGuard<'a> {
    pending: &'a Pending,
    thread: ThreadId,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if let Some(dropped) = self.pending.lock().remove(&self.thread) {
            if !dropped.is_empty() {
                warn!(
                    dropped = dropped.len(),
                    "Discarded queued dispatches after escalation"
                );
            }
        }
    }
}

impl EventProvider for UnrollingProvider {
    fn listeners(&self) -> &Arc<dyn ListenerStore> {
        self.core.store()
    }

    fn sources(&self) -> &[Arc<dyn ListenerSource>] {
        self.core.sources()
    }

    fn exception_callback(&self) -> Arc<dyn ExceptionCallback> {
        self.core.callback()
    }

    fn set_exception_callback(&self, callback: Arc<dyn ExceptionCallback>) {
        self.core.set_callback(callback);
    }

    fn config(&self) -> &ProviderConfig {
        self.core.config()
    }

    fn execute(&self, dispatch: Dispatch) -> Result<()> {
        self.core.ensure_open()?;
        let thread = thread::current().id();

        {
            let mut pending = self.pending.lock();
            if let Some(queue) = pending.get_mut(&thread) {
                queue.push_back(dispatch);
                return Ok(());
            }
            pending.insert(thread, VecDeque::new());
        }

        let _guard = DrainGuard {
            pending: &self.pending,
            thread,
        };
        let logging = self.core.config().enable_logging;

        let mut next = Some(dispatch);
        while let Some(dispatch) = next {
            run_sequentially(dispatch, logging)?;
            next = self.next_pending(thread);
        }
        Ok(())
    }

    fn is_sequential(&self) -> bool {
        self.core.sources_sequential()
    }

    fn close(&self) {
        if self.core.begin_close() {
            self.core.release("unrolling");
        }
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CallbackError, ListenerError};
    use crate::event::{Event, EventMetadata};
    use crate::invocation::FailedEventInvocation;
    use crate::listener::Listener;
    use crate::provider::EventProviderExt;
    use crate::store::ListenerStoreExt;
    use std::sync::Weak;

    trait Depth: Listener {
        fn reached(&self, event: &DepthEvent);
    }

    crate::listener_type!(dyn Depth => Normal { reached -> () });

    #[derive(Debug)]
    struct DepthEvent {
        metadata: EventMetadata,
        depth: usize,
    }

    impl DepthEvent {
        fn new(depth: usize) -> Self {
            Self {
                metadata: EventMetadata::new("unrolling-test"),
                depth,
            }
        }
    }

    impl Event for DepthEvent {
        type Listener = dyn Depth;

        fn metadata(&self) -> &EventMetadata {
            &self.metadata
        }
    }

    /// Re-dispatches with `depth + 1` until `limit`.
    struct Cascade {
        provider: Weak<UnrollingProvider>,
        limit: usize,
        seen: Mutex<Vec<usize>>,
    }

    impl Listener for Cascade {}

    impl Depth for Cascade {
        fn reached(&self, event: &DepthEvent) {
            self.seen.lock().push(event.depth);

            if event.depth < self.limit {
                if let Some(provider) = self.provider.upgrade() {
                    provider
                        .dispatch(DepthEvent::new(event.depth + 1), |l, e| l.reached(e))
                        .unwrap();
                }
            }
        }
    }

    #[test]
    fn test_deep_cascade_is_unrolled() {
        let provider = Arc::new(UnrollingProvider::new());
        let cascade = Arc::new(Cascade {
            provider: Arc::downgrade(&provider),
            limit: 10_000,
            seen: Mutex::new(Vec::new()),
        });
        let listener: Arc<dyn Depth> = cascade.clone();
        provider.listeners().add(listener).unwrap();

        provider
            .dispatch(DepthEvent::new(0), |l, e| l.reached(e))
            .unwrap();

        let seen = cascade.seen.lock();
        assert_eq!(seen.len(), 10_001);
        assert!(seen.windows(2).all(|pair| pair[1] == pair[0] + 1));
        assert!(provider.pending.lock().is_empty());
    }

    #[test]
    fn test_escalation_discards_queue() {
        let provider = Arc::new(UnrollingProvider::new());
        let cascade = Arc::new(Cascade {
            provider: Arc::downgrade(&provider),
            limit: 5,
            seen: Mutex::new(Vec::new()),
        });
        let listener: Arc<dyn Depth> = cascade.clone();
        provider.listeners().add(listener).unwrap();

        struct Failing;
        impl Listener for Failing {}
        impl Depth for Failing {
            fn reached(&self, _event: &DepthEvent) {
                panic!("depth failure");
            }
        }
        let failing: Arc<dyn Depth> = Arc::new(Failing);
        provider.listeners().add(failing).unwrap();

        provider.set_exception_callback(Arc::new(
            |_: &FailedEventInvocation| -> std::result::Result<(), CallbackError> {
                Err(CallbackError::new("halt"))
            },
        ));

        let err = provider
            .dispatch(DepthEvent::new(0), |l, e| l.reached(e))
            .unwrap_err();
        assert!(matches!(err, ListenerError::Escalated(_)));
        // Depth 1 was queued by the cascade listener, then dropped.
        assert_eq!(*cascade.seen.lock(), vec![0]);
        assert!(provider.pending.lock().is_empty());
    }
}
