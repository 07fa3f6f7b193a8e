//! Blocking, fully ordered dispatch on the caller's thread

use super::{Dispatch, EventProvider, ProviderCore, run_sequentially};
use crate::callback::{ExceptionCallback, LoggingExceptionCallback};
use crate::config::{ProviderConfig, Strategy};
use crate::error::Result;
use crate::store::{DefaultListenerStore, ListenerSource, ListenerStore};
use std::sync::Arc;

/// Notifies listeners one after another on the thread calling `dispatch`.
///
/// A listener returning `true` from an abortable method stops the dispatch;
/// an escalating exception callback is returned to the caller.
pub struct SequentialProvider {
    core: ProviderCore,
}

impl SequentialProvider {
    /// Provider over a fresh [`DefaultListenerStore`]
    pub fn new() -> Self {
        Self::with_store(Arc::new(DefaultListenerStore::new()))
    }

    pub fn with_store(store: Arc<dyn ListenerStore>) -> Self {
        let config = ProviderConfig {
            strategy: Strategy::Sequential,
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
        }
    }
}

impl Default for SequentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl EventProvider for SequentialProvider {
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
        run_sequentially(dispatch, self.core.config().enable_logging)
    }

    fn is_sequential(&self) -> bool {
        self.core.sources_sequential()
    }

    fn close(&self) {
        if self.core.begin_close() {
            self.core.release("sequential");
        }
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
