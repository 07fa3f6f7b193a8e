//! Listener registry
//!
//! Maps a listener-type to the ordered sequence of listeners registered for
//! it. Reads hand out point-in-time snapshots; a snapshot is never mutated by
//! later `add`/`remove`/`clear` calls.
//!
//! ```text
//! add(L1) add(L2)       get()            add(L3) remove(L1)     get()
//!   [L1, L2]  ───────►  snapshot A  ───►  [L2, L3]  ─────────►  snapshot B
//!                       still [L1, L2]                          [L2, L3]
//! ```
//!
//! The object-safe [`ListenerSource`] and [`ListenerStore`] traits work on
//! erased handles; [`ListenerStoreExt`] adds the typed API on top.

use crate::error::{ListenerError, Result};
use crate::event::RegistrationEvent;
use crate::listener::{ListenerDescriptor, ListenerType};
use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use std::any::{Any, TypeId};
use std::fmt;
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Erased listener handle. Always holds an `Arc<L>` for its listener-type `L`.
pub type ListenerHandle = Arc<dyn Any + Send + Sync>;

/// Identity of a registered listener instance (its allocation address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(usize);

impl ListenerId {
    pub fn of<L: ?Sized>(listener: &Arc<L>) -> Self {
        Self(Arc::as_ptr(listener) as *const () as usize)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

enum Lifecycle {
    Registered,
    Unregistered,
}

/// Erased identity of a listener-type together with the operations a store
/// needs to handle its listeners without knowing the concrete type.
#[derive(Clone, Copy)]
pub struct ListenerKey {
    type_id: TypeId,
    descriptor: ListenerDescriptor,
    identify: fn(&(dyn Any + Send + Sync)) -> Option<ListenerId>,
    lifecycle: fn(&(dyn Any + Send + Sync), &RegistrationEvent, Lifecycle),
}

impl ListenerKey {
    pub fn of<L: ListenerType + ?Sized>() -> Self {
        Self {
            type_id: TypeId::of::<L>(),
            descriptor: L::DESCRIPTOR,
            identify: identify::<L>,
            lifecycle: lifecycle::<L>,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn descriptor(&self) -> &ListenerDescriptor {
        &self.descriptor
    }

    fn registration_event(&self) -> RegistrationEvent {
        RegistrationEvent {
            listener_type: self.descriptor.name,
            kind: self.descriptor.kind,
        }
    }
}

impl fmt::Debug for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerKey")
            .field("type_id", &self.type_id)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

fn identify<L: ListenerType + ?Sized>(handle: &(dyn Any + Send + Sync)) -> Option<ListenerId> {
    handle.downcast_ref::<Arc<L>>().map(ListenerId::of)
}

fn lifecycle<L: ListenerType + ?Sized>(
    handle: &(dyn Any + Send + Sync),
    event: &RegistrationEvent,
    stage: Lifecycle,
) {
    if let Some(listener) = handle.downcast_ref::<Arc<L>>() {
        match stage {
            Lifecycle::Registered => listener.on_register(event),
            Lifecycle::Unregistered => listener.on_unregister(event),
        }
    }
}

/// A listener accepted by a store.
#[derive(Clone)]
pub struct RegisteredListener {
    id: ListenerId,
    key: ListenerKey,
    handle: ListenerHandle,
}

impl RegisteredListener {
    /// Validate `handle` against `key`.
    ///
    /// Fails with [`ListenerError::InvalidArgument`] when the descriptor is
    /// malformed or the handle does not hold an `Arc` of the listener-type.
    pub fn new(key: ListenerKey, handle: ListenerHandle) -> Result<Self> {
        key.descriptor.validate()?;
        let id = (key.identify)(handle.as_ref()).ok_or_else(|| {
            ListenerError::InvalidArgument(format!(
                "listener is not assignable to `{}`",
                key.descriptor.name
            ))
        })?;
        Ok(Self { id, key, handle })
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn key(&self) -> &ListenerKey {
        &self.key
    }

    pub fn handle(&self) -> &ListenerHandle {
        &self.handle
    }

    pub fn downcast<L: ListenerType + ?Sized>(&self) -> Option<Arc<L>> {
        self.handle.downcast_ref::<Arc<L>>().cloned()
    }

    pub(crate) fn notify_registered(&self) {
        (self.key.lifecycle)(
            self.handle.as_ref(),
            &self.key.registration_event(),
            Lifecycle::Registered,
        );
    }

    pub(crate) fn notify_unregistered(&self) {
        (self.key.lifecycle)(
            self.handle.as_ref(),
            &self.key.registration_event(),
            Lifecycle::Unregistered,
        );
    }
}

impl fmt::Debug for RegisteredListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredListener")
            .field("id", &self.id)
            .field("listener_type", &self.key.descriptor.name)
            .finish()
    }
}

/// Immutable point-in-time view of the listeners of one listener-type.
#[derive(Debug, Clone, Default)]
pub struct ListenerSnapshot(Arc<Vec<RegisteredListener>>);

impl ListenerSnapshot {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RegisteredListener> {
        self.0.iter()
    }

    /// Typed, lazily-downcasting iterator over the snapshot.
    pub fn into_listeners<L: ListenerType + ?Sized>(self) -> Listeners<L> {
        Listeners {
            snapshot: self,
            position: 0,
            _marker: PhantomData,
        }
    }
}

impl From<Vec<RegisteredListener>> for ListenerSnapshot {
    fn from(listeners: Vec<RegisteredListener>) -> Self {
        Self(Arc::new(listeners))
    }
}

/// Finite, non-restartable sequence of listeners in registration order.
pub struct Listeners<L: ?Sized> {
    snapshot: ListenerSnapshot,
    position: usize,
    _marker: PhantomData<fn() -> Arc<L>>,
}

impl<L: ListenerType + ?Sized> Iterator for Listeners<L> {
    type Item = Arc<L>;

    fn next(&mut self) -> Option<Arc<L>> {
        while let Some(entry) = self.snapshot.0.get(self.position) {
            self.position += 1;
            if let Some(listener) = entry.downcast::<L>() {
                return Some(listener);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.snapshot.len() - self.position))
    }
}

impl<L: ListenerType + ?Sized> FusedIterator for Listeners<L> {}

/// Anything that can supply listeners for a listener-type.
///
/// Container adapters implement this to expose externally managed
/// instances to a provider next to its store.
pub trait ListenerSource: Send + Sync {
    /// Listeners currently known for the listener-type `type_id`.
    fn snapshot(&self, type_id: TypeId) -> ListenerSnapshot;

    /// Whether snapshots are in registration order.
    fn is_sequential(&self) -> bool;

    /// Release the source. Further snapshots may be empty.
    fn close(&self);
}

/// Mutable listener registry.
pub trait ListenerStore: ListenerSource {
    /// Append a listener handle for the listener-type described by `key`.
    fn add_any(&self, key: ListenerKey, handle: ListenerHandle) -> Result<()>;

    /// Remove the first listener with identity `id`. Returns whether one was removed.
    fn remove_any(&self, key: ListenerKey, id: ListenerId) -> bool;

    /// Remove every registration.
    fn clear(&self);

    /// View of this store that serialises all operations.
    fn synchronized_view(self: Arc<Self>) -> Arc<dyn ListenerStore>;
}

/// Typed operations for every [`ListenerStore`].
pub trait ListenerStoreExt: ListenerStore {
    /// Register `listener` under listener-type `L`.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let store = DefaultListenerStore::new();
    /// store.add::<dyn UserListener>(Arc::new(AuditLog::default()))?;
    /// ```
    fn add<L: ListenerType + ?Sized>(&self, listener: Arc<L>) -> Result<()> {
        self.add_any(ListenerKey::of::<L>(), Arc::new(listener))
    }

    /// Remove the first registration of `listener` under `L`; no-op if absent.
    fn remove<L: ListenerType + ?Sized>(&self, listener: &Arc<L>) -> bool {
        self.remove_any(ListenerKey::of::<L>(), ListenerId::of(listener))
    }

    /// Snapshot of the listeners registered under `L`.
    fn get<L: ListenerType + ?Sized>(&self) -> Listeners<L> {
        self.snapshot(TypeId::of::<L>()).into_listeners()
    }

    fn contains<L: ListenerType + ?Sized>(&self, listener: &Arc<L>) -> bool {
        let id = ListenerId::of(listener);
        self.snapshot(TypeId::of::<L>()).iter().any(|entry| entry.id() == id)
    }

    fn count<L: ListenerType + ?Sized>(&self) -> usize {
        self.snapshot(TypeId::of::<L>()).len()
    }
}

impl<S: ListenerStore + ?Sized> ListenerStoreExt for S {}

/// Default store: sharded map of copy-on-write listener vectors.
#[derive(Default)]
pub struct DefaultListenerStore {
    slots: DashMap<TypeId, Arc<Vec<RegisteredListener>>>,
}

impl DefaultListenerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ListenerSource for DefaultListenerStore {
    fn snapshot(&self, type_id: TypeId) -> ListenerSnapshot {
        self.slots
            .get(&type_id)
            .map(|slot| ListenerSnapshot(Arc::clone(slot.value())))
            .unwrap_or_default()
    }

    fn is_sequential(&self) -> bool {
        true
    }

    fn close(&self) {
        self.clear();
    }
}

impl ListenerStore for DefaultListenerStore {
    fn add_any(&self, key: ListenerKey, handle: ListenerHandle) -> Result<()> {
        let entry = RegisteredListener::new(key, handle)?;
        {
            let mut slot = self.slots.entry(key.type_id).or_default();
            Arc::make_mut(slot.value_mut()).push(entry.clone());
        }

        debug!(
            listener_type = key.descriptor.name,
            listener_id = ?entry.id,
            "Registered listener"
        );
        entry.notify_registered();
        Ok(())
    }

    fn remove_any(&self, key: ListenerKey, id: ListenerId) -> bool {
        let removed = {
            let Some(mut slot) = self.slots.get_mut(&key.type_id) else {
                return false;
            };
            match slot.iter().position(|entry| entry.id == id) {
                Some(position) => Some(Arc::make_mut(slot.value_mut()).remove(position)),
                None => None,
            }
        };

        let Some(entry) = removed else {
            return false;
        };
        self.slots
            .remove_if(&key.type_id, |_, listeners| listeners.is_empty());

        debug!(
            listener_type = key.descriptor.name,
            listener_id = ?id,
            "Removed listener"
        );
        entry.notify_unregistered();
        true
    }

    fn clear(&self) {
        let type_ids: Vec<TypeId> = self.slots.iter().map(|slot| *slot.key()).collect();
        let mut removed = Vec::new();
        for type_id in type_ids {
            if let Some((_, listeners)) = self.slots.remove(&type_id) {
                removed.push(listeners);
            }
        }

        let count: usize = removed.iter().map(|listeners| listeners.len()).sum();
        for entry in removed.iter().flat_map(|listeners| listeners.iter()) {
            entry.notify_unregistered();
        }
        debug!(listener_count = count, "Cleared all listeners");
    }

    fn synchronized_view(self: Arc<Self>) -> Arc<dyn ListenerStore> {
        Arc::new(SynchronizedListenerStore::new(self))
    }
}

/// Store wrapper imposing a single total order on every operation.
///
/// The lock is reentrant so lifecycle hooks running inside `add`/`remove`
/// may call back into the store from the same thread.
pub struct SynchronizedListenerStore {
    inner: Arc<dyn ListenerStore>,
    lock: ReentrantMutex<()>,
}

impl SynchronizedListenerStore {
    pub fn new(inner: Arc<dyn ListenerStore>) -> Self {
        Self {
            inner,
            lock: ReentrantMutex::new(()),
        }
    }
}

impl ListenerSource for SynchronizedListenerStore {
    fn snapshot(&self, type_id: TypeId) -> ListenerSnapshot {
        let _guard = self.lock.lock();
        self.inner.snapshot(type_id)
    }

    fn is_sequential(&self) -> bool {
        self.inner.is_sequential()
    }

    fn close(&self) {
        let _guard = self.lock.lock();
        self.inner.close();
    }
}

impl ListenerStore for SynchronizedListenerStore {
    fn add_any(&self, key: ListenerKey, handle: ListenerHandle) -> Result<()> {
        let _guard = self.lock.lock();
        self.inner.add_any(key, handle)
    }

    fn remove_any(&self, key: ListenerKey, id: ListenerId) -> bool {
        let _guard = self.lock.lock();
        self.inner.remove_any(key, id)
    }

    fn clear(&self) {
        let _guard = self.lock.lock();
        self.inner.clear();
    }

    fn synchronized_view(self: Arc<Self>) -> Arc<dyn ListenerStore> {
        self
    }
}
