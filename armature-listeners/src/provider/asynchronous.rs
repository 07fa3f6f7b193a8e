//! Non-blocking dispatch on serial worker lanes
//!
//! The provider owns a tokio runtime whose blocking pool hosts one thread per
//! lane. Each lane drains its own unbounded queue in FIFO order, so work
//! submitted to the same lane runs one job at a time in submission order.
//!
//! With [`LanePolicy::Listener`] every listener is pinned to a lane by its
//! identity: deliveries to one listener keep the order of the `dispatch`
//! calls, while different listeners of one event run concurrently. With
//! [`LanePolicy::ListenerType`] a whole dispatch runs sequentially on the lane
//! of its listener-type, which keeps abort semantics intact.

use super::{Dispatch, EventProvider, ProviderCore, run_sequentially};
use crate::callback::{ExceptionCallback, LoggingExceptionCallback};
use crate::config::{ClosePolicy, LanePolicy, ProviderConfig, Strategy};
use crate::error::{InvocationError, ListenerError, Result};
use crate::invocation::Outcome;
use crate::store::{DefaultListenerStore, ListenerSource, ListenerStore};
use parking_lot::{Mutex, RwLock};
use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Job = Box<dyn FnOnce() + Send>;

thread_local! {
    static IN_LANE: Cell<bool> = const { Cell::new(false) };
}

/// Notifies listeners on worker lanes; `dispatch` returns once the work is
/// queued.
///
/// `close()` follows the configured [`ClosePolicy`]: `Drain` runs every queued
/// job before returning, `Discard` drops queued jobs and only waits for the
/// ones already running. Either way it waits at most `shutdown_timeout`, and
/// not at all when called from a worker lane. Dropping the provider closes it.
pub struct AsynchronousProvider {
    core: ProviderCore,
    runtime: Mutex<Option<Runtime>>,
    lanes: RwLock<Vec<UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    discard: Arc<AtomicBool>,
}

impl AsynchronousProvider {
    /// Provider over a fresh store with `workers` lanes
    pub fn new(workers: usize) -> Result<Self> {
        let config = ProviderConfig {
            strategy: Strategy::Asynchronous,
            workers,
            ..ProviderConfig::default()
        };
        config.validate()?;
        Self::with_parts(
            Arc::new(DefaultListenerStore::new()),
            Vec::new(),
            Arc::new(LoggingExceptionCallback),
            config,
        )
    }

    pub(crate) fn with_parts(
        store: Arc<dyn ListenerStore>,
        sources: Vec<Arc<dyn ListenerSource>>,
        callback: Arc<dyn ExceptionCallback>,
        config: ProviderConfig,
    ) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.workers)
            .thread_name(config.thread_name.clone())
            .enable_time()
            .on_thread_start(|| IN_LANE.with(|flag| flag.set(true)))
            .build()?;

        let discard = Arc::new(AtomicBool::new(false));
        let mut lanes = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);

        for _ in 0..config.workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let discard = Arc::clone(&discard);
            workers.push(runtime.spawn_blocking(move || run_lane(rx, discard)));
            lanes.push(tx);
        }

        debug!(
            workers = config.workers,
            lane_policy = ?config.lane_policy,
            close_policy = ?config.close_policy,
            "Started listener worker lanes"
        );

        Ok(Self {
            core: ProviderCore::new(store, sources, callback, config),
            runtime: Mutex::new(Some(runtime)),
            lanes: RwLock::new(lanes),
            workers: Mutex::new(workers),
            discard,
        })
    }

    fn submit<K: Hash>(&self, key: K, job: Job) -> Result<()> {
        let lanes = self.lanes.read();
        if lanes.is_empty() {
            return Err(ListenerError::Closed);
        }
        send(&lanes, &key, job)
    }

    /// Queues every invocation of `dispatch` under one read guard, so a
    /// concurrent `close()` sees either all of them or none.
    fn submit_per_listener(&self, dispatch: Dispatch) -> Result<()> {
        let Dispatch {
            listener_type,
            invocations,
            ..
        } = dispatch;
        let halted = Arc::new(AtomicBool::new(false));

        let lanes = self.lanes.read();
        if lanes.is_empty() {
            return Err(ListenerError::Closed);
        }

        for invocation in invocations {
            let listener_id = invocation.listener_id();
            let halted = Arc::clone(&halted);

            send(
                &lanes,
                &listener_id,
                Box::new(move || {
                    if halted.load(Ordering::SeqCst) {
                        return;
                    }
                    match invocation.invoke() {
                        Ok(Outcome::Continue) => {}
                        Ok(Outcome::Abort) => halted.store(true, Ordering::SeqCst),
                        Err(err) => {
                            halted.store(true, Ordering::SeqCst);
                            error!(
                                listener_type,
                                ?listener_id,
                                error = %err,
                                "Exception callback escalated on worker lane"
                            );
                        }
                    }
                }),
            )?;
        }
        Ok(())
    }

    fn submit_per_type(&self, dispatch: Dispatch) -> Result<()> {
        let logging = self.core.config().enable_logging;
        let listener_type = dispatch.listener_type;
        self.submit(
            dispatch.type_id,
            Box::new(move || {
                if let Err(err) = run_sequentially(dispatch, logging) {
                    error!(
                        listener_type,
                        error = %err,
                        "Exception callback escalated on worker lane"
                    );
                }
            }),
        )
    }
}

fn lane_index<K: Hash + ?Sized>(key: &K, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

fn send<K: Hash + ?Sized>(lanes: &[UnboundedSender<Job>], key: &K, job: Job) -> Result<()> {
    let lane = lane_index(key, lanes.len());
    lanes[lane].send(job).map_err(|_| ListenerError::Closed)
}

/// Wait until every lane worker has returned. `false` on timeout.
fn join_lanes(runtime: &Runtime, workers: Vec<JoinHandle<()>>, timeout: Duration) -> bool {
    let joined = async move {
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "Listener lane ended abnormally");
            }
        }
    };
    let wait = || runtime.block_on(tokio::time::timeout(timeout, joined)).is_ok();

    // `block_on` panics inside another runtime's context, e.g. when the
    // provider is dropped from async code.
    if Handle::try_current().is_ok() {
        thread::scope(|scope| scope.spawn(wait).join().unwrap_or(false))
    } else {
        wait()
    }
}

/// Worker loop of one lane. Ends once every sender is gone.
fn run_lane(mut jobs: UnboundedReceiver<Job>, discard: Arc<AtomicBool>) {
    while let Some(job) = jobs.blocking_recv() {
        if discard.load(Ordering::SeqCst) {
            continue;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let error = InvocationError::from_panic(payload);
            error!(error = %error, "Job panicked on listener lane");
        }
    }
}

impl EventProvider for AsynchronousProvider {
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
        if self.core.config().enable_logging {
            debug!(
                listener_type = dispatch.listener_type,
                event_id = %dispatch.event.event_metadata().id,
                "Queueing event"
            );
        }

        match self.core.config().lane_policy {
            LanePolicy::Listener => self.submit_per_listener(dispatch),
            LanePolicy::ListenerType => self.submit_per_type(dispatch),
        }
    }

    fn is_sequential(&self) -> bool {
        false
    }

    fn close(&self) {
        let config = self.core.config();
        if config.close_policy == ClosePolicy::Discard && !self.core.is_closed() {
            self.discard.store(true, Ordering::SeqCst);
        }
        if !self.core.begin_close() {
            return;
        }

        // Dropping the senders ends every lane once its queue is empty.
        self.lanes.write().clear();

        let workers = std::mem::take(&mut *self.workers.lock());
        if let Some(runtime) = self.runtime.lock().take() {
            let on_lane = IN_LANE.with(Cell::get);
            if !on_lane && !join_lanes(&runtime, workers, config.shutdown_timeout()) {
                warn!(
                    timeout_ms = config.shutdown_timeout_ms,
                    "Timed out waiting for listener lanes to finish"
                );
            }
            runtime.shutdown_background();
        }

        self.core.release("asynchronous");
        info!(
            close_policy = ?config.close_policy,
            "Listener worker lanes stopped"
        );
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

impl Drop for AsynchronousProvider {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventMetadata};
    use crate::listener::Listener;
    use crate::provider::EventProviderExt;
    use crate::store::{ListenerId, ListenerStoreExt};
    use std::time::Duration;

    trait Count: Listener {
        fn count(&self, event: &CountEvent);
    }

    crate::listener_type!(dyn Count => Normal { count -> () });

    #[derive(Debug)]
    struct CountEvent {
        metadata: EventMetadata,
        n: usize,
    }

    impl CountEvent {
        fn new(n: usize) -> Self {
            Self {
                metadata: EventMetadata::new("asynchronous-test"),
                n,
            }
        }
    }

    impl Event for CountEvent {
        type Listener = dyn Count;

        fn metadata(&self) -> &EventMetadata {
            &self.metadata
        }
    }

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<usize>>,
        threads: Mutex<Vec<String>>,
    }

    impl Listener for Collect {}

    impl Count for Collect {
        fn count(&self, event: &CountEvent) {
            self.seen.lock().push(event.n);
            let name = std::thread::current().name().unwrap_or_default().to_string();
            self.threads.lock().push(name);
        }
    }

    #[test]
    fn test_lane_index_is_stable() {
        let id = 0xdead_beef_usize;
        let first = lane_index(&id, 4);
        assert!(first < 4);
        assert_eq!(lane_index(&id, 4), first);
        assert_eq!(lane_index(&id, 1), 0);
    }

    #[test]
    fn test_runs_on_named_lane_threads() {
        let config = ProviderConfig {
            strategy: Strategy::Asynchronous,
            workers: 2,
            thread_name: "lane-test".to_string(),
            ..ProviderConfig::default()
        };
        let provider = AsynchronousProvider::with_parts(
            Arc::new(DefaultListenerStore::new()),
            Vec::new(),
            Arc::new(LoggingExceptionCallback),
            config,
        )
        .unwrap();

        let collect = Arc::new(Collect::default());
        let listener: Arc<dyn Count> = collect.clone();
        provider.listeners().add(listener).unwrap();

        for n in 0..20 {
            provider.dispatch(CountEvent::new(n), |l, e| l.count(e)).unwrap();
        }
        provider.close();

        assert_eq!(*collect.seen.lock(), (0..20).collect::<Vec<_>>());
        assert!(collect.threads.lock().iter().all(|name| name == "lane-test"));
        assert!(!IN_LANE.with(Cell::get));
    }

    #[test]
    fn test_submit_after_close() {
        let provider = AsynchronousProvider::new(1).unwrap();
        provider.close();

        let id = ListenerId::of(&Arc::new(0u8));
        let err = provider.submit(id, Box::new(|| {})).unwrap_err();
        assert!(matches!(err, ListenerError::Closed));
        assert!(provider.runtime.lock().is_none());
    }

    #[test]
    fn test_close_from_lane_does_not_wait() {
        let provider = Arc::new(AsynchronousProvider::new(1).unwrap());
        let (tx, rx) = std::sync::mpsc::channel();
        let on_lane = Arc::clone(&provider);

        provider
            .submit(
                0usize,
                Box::new(move || {
                    on_lane.close();
                    let _ = tx.send(on_lane.is_closed());
                }),
            )
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(provider.is_closed());
    }

    #[test]
    fn test_close_joins_lanes() {
        let provider = AsynchronousProvider::new(3).unwrap();
        let collect = Arc::new(Collect::default());
        let listener: Arc<dyn Count> = collect.clone();
        provider.listeners().add(listener).unwrap();

        for n in 0..10 {
            provider.dispatch(CountEvent::new(n), |l, e| l.count(e)).unwrap();
        }
        provider.close();

        assert_eq!(collect.seen.lock().len(), 10);
        assert!(provider.workers.lock().is_empty());
    }

    #[test]
    fn test_close_inside_other_runtime() {
        let outer = Builder::new_current_thread().build().unwrap();
        let collect = Arc::new(Collect::default());
        let listener: Arc<dyn Count> = collect.clone();

        outer.block_on(async {
            let provider = AsynchronousProvider::new(2).unwrap();
            provider.listeners().add(listener).unwrap();
            for n in 0..10 {
                provider.dispatch(CountEvent::new(n), |l, e| l.count(e)).unwrap();
            }
            drop(provider);
        });

        assert_eq!(*collect.seen.lock(), (0..10).collect::<Vec<_>>());
    }
}
