//! Provider configuration and builder

use crate::callback::{ExceptionCallback, LoggingExceptionCallback};
use crate::error::{ListenerError, Result};
use crate::provider::{AsynchronousProvider, EventProvider, SequentialProvider, UnrollingProvider};
use crate::store::{DefaultListenerStore, ListenerSource, ListenerStore};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Dispatch strategy built by [`EventProviderBuilder::build`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Caller's thread, fully ordered, blocking.
    #[default]
    Sequential,
    /// Like `Sequential`, but nested dispatches are queued instead of recursing.
    Unrolling,
    /// Returns immediately; listeners run on worker lanes.
    Asynchronous,
}

/// How asynchronous work is assigned to worker lanes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanePolicy {
    /// Each listener is pinned to one lane by its identity.
    #[default]
    Listener,
    /// A whole dispatch runs sequentially on the lane of its listener-type.
    ListenerType,
}

/// What happens to queued asynchronous work on `close()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosePolicy {
    /// Run every queued invocation before `close()` returns.
    #[default]
    Drain,
    /// Drop queued invocations; only the ones already running complete.
    Discard,
}

macro_rules! impl_from_str {
    ($ty:ident { $($name:literal => $variant:ident),* $(,)? }) => {
        impl FromStr for $ty {
            type Err = ListenerError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)*
                    other => Err(ListenerError::Config(format!(
                        "unknown {} `{}`",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

impl_from_str!(Strategy {
    "sequential" => Sequential,
    "unrolling" => Unrolling,
    "spin" => Unrolling,
    "asynchronous" => Asynchronous,
    "async" => Asynchronous,
});

impl_from_str!(LanePolicy {
    "listener" => Listener,
    "listener_type" => ListenerType,
});

impl_from_str!(ClosePolicy {
    "drain" => Drain,
    "discard" => Discard,
});

/// Event provider configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Dispatch strategy
    pub strategy: Strategy,

    /// Number of worker lanes of the asynchronous strategy
    pub workers: usize,

    /// Lane assignment of the asynchronous strategy
    pub lane_policy: LanePolicy,

    /// Fate of queued asynchronous work on close
    pub close_policy: ClosePolicy,

    /// Upper bound for waiting on worker lanes during close
    pub shutdown_timeout_ms: u64,

    /// Name prefix of worker threads
    pub thread_name: String,

    /// Enable dispatch logging
    pub enable_logging: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Sequential,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            lane_policy: LanePolicy::Listener,
            close_policy: ClosePolicy::Drain,
            shutdown_timeout_ms: 30_000,
            thread_name: "armature-listener".to_string(),
            enable_logging: true,
        }
    }
}

impl ProviderConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `ARMATURE_LISTENERS_*` environment variables.
    ///
    /// Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(strategy) = parse(&lookup, "ARMATURE_LISTENERS_STRATEGY") {
            config.strategy = strategy;
        }
        if let Some(workers) = parse::<usize, _>(&lookup, "ARMATURE_LISTENERS_WORKERS") {
            if workers > 0 {
                config.workers = workers;
            }
        }
        if let Some(policy) = parse(&lookup, "ARMATURE_LISTENERS_LANE_POLICY") {
            config.lane_policy = policy;
        }
        if let Some(policy) = parse(&lookup, "ARMATURE_LISTENERS_CLOSE_POLICY") {
            config.close_policy = policy;
        }
        if let Some(timeout) = parse(&lookup, "ARMATURE_LISTENERS_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout_ms = timeout;
        }
        if let Some(name) = lookup("ARMATURE_LISTENERS_THREAD_NAME") {
            config.thread_name = name;
        }
        if let Some(enabled) = parse(&lookup, "ARMATURE_LISTENERS_LOGGING") {
            config.enable_logging = enabled;
        }

        config
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ListenerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no provider can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ListenerError::Config(
                "workers must be greater than zero".to_string(),
            ));
        }
        if self.thread_name.is_empty() {
            return Err(ListenerError::Config(
                "thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|value| value.trim().parse().ok())
}

/// Event provider builder
///
/// ```rust,ignore
/// let provider = EventProviderBuilder::new()
///     .strategy(Strategy::Asynchronous)
///     .workers(4)
///     .close_policy(ClosePolicy::Drain)
///     .build()?;
/// ```
pub struct EventProviderBuilder {
    config: ProviderConfig,
    store: Option<Arc<dyn ListenerStore>>,
    sources: Vec<Arc<dyn ListenerSource>>,
    callback: Arc<dyn ExceptionCallback>,
}

impl EventProviderBuilder {
    /// Create new builder with default configuration
    pub fn new() -> Self {
        Self::with_config(ProviderConfig::default())
    }

    /// Create builder from an existing configuration
    pub fn with_config(config: ProviderConfig) -> Self {
        Self {
            config,
            store: None,
            sources: Vec::new(),
            callback: Arc::new(LoggingExceptionCallback),
        }
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn lane_policy(mut self, policy: LanePolicy) -> Self {
        self.config.lane_policy = policy;
        self
    }

    pub fn close_policy(mut self, policy: ClosePolicy) -> Self {
        self.config.close_policy = policy;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Enable/disable dispatch logging
    pub fn enable_logging(mut self, enabled: bool) -> Self {
        self.config.enable_logging = enabled;
        self
    }

    /// Use `store` instead of a fresh [`DefaultListenerStore`]
    pub fn store(mut self, store: Arc<dyn ListenerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Additional source consulted after the store on every dispatch
    pub fn source(mut self, source: Arc<dyn ListenerSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn exception_callback(mut self, callback: Arc<dyn ExceptionCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Build the provider for the configured strategy
    pub fn build(self) -> Result<Arc<dyn EventProvider>> {
        let provider: Arc<dyn EventProvider> = match self.config.strategy {
            Strategy::Sequential => Arc::new(self.build_sequential()?),
            Strategy::Unrolling => Arc::new(self.build_unrolling()?),
            Strategy::Asynchronous => Arc::new(self.build_asynchronous()?),
        };
        Ok(provider)
    }

    pub fn build_sequential(self) -> Result<SequentialProvider> {
        self.config.validate()?;
        let (store, sources, callback, config) = self.into_parts();
        Ok(SequentialProvider::with_parts(store, sources, callback, config))
    }

    pub fn build_unrolling(self) -> Result<UnrollingProvider> {
        self.config.validate()?;
        let (store, sources, callback, config) = self.into_parts();
        Ok(UnrollingProvider::with_parts(store, sources, callback, config))
    }

    pub fn build_asynchronous(self) -> Result<AsynchronousProvider> {
        self.config.validate()?;
        let (store, sources, callback, config) = self.into_parts();
        AsynchronousProvider::with_parts(store, sources, callback, config)
    }

    #[allow(clippy::type_complexity)]
    fn into_parts(
        self,
    ) -> (
        Arc<dyn ListenerStore>,
        Vec<Arc<dyn ListenerSource>>,
        Arc<dyn ExceptionCallback>,
        ProviderConfig,
    ) {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(DefaultListenerStore::new()));
        (store, self.sources, self.callback, self.config)
    }
}

impl Default for EventProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}
