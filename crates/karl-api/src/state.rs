//! Shared application state for the HTTP handlers and the reconciler.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use karl_core::{Clock, MicroTimestamp, PersistedKeepalive, RuntimeStatus};
use karl_store::ServiceStorage;
use karl_stream::Stream;

use crate::config::Config;
use crate::nginx::NginxManager;
use crate::render::SvgRenderer;

/// Everything a request handler or the reconciler needs.
///
/// The two in-memory caches are deliberately behind separate mutexes, and no
/// code path holds both at once.
pub struct AppState<R: RuntimeStatus> {
    /// Construction parameters.
    pub config: Config,
    /// Wall clock (mockable).
    pub clock: Arc<dyn Clock>,
    /// The keepalive log.
    pub stream: Stream<PersistedKeepalive<R>>,
    /// The service directory.
    pub storage: ServiceStorage,
    /// codename -> Karl-clock time of its latest keepalive; the reconciler's
    /// working set.
    keepalive_cache: Mutex<HashMap<String, MicroTimestamp>>,
    /// codename -> latest keepalive log index plus one (0 is "never seen").
    latest_keepalive_index_plus_one: Mutex<HashMap<String, u64>>,
    /// Wakes the reconciler out of its deadline sleep.
    pub reconciler_wake: Notify,
    /// Set once teardown begins; the reconciler exits on its next wakeup.
    pub shutting_down: AtomicBool,
    /// Client for the reverse keepalive callback.
    pub http_client: reqwest::Client,
    /// Front-door materializer, when configured.
    pub nginx: Option<NginxManager>,
    /// DOT-to-SVG renderer collaborator.
    pub renderer: Arc<dyn SvgRenderer>,
}

impl<R: RuntimeStatus> std::fmt::Debug for AppState<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("stream_size", &self.stream.size())
            .field("nginx", &self.nginx.is_some())
            .finish()
    }
}

impl<R: RuntimeStatus> AppState<R> {
    /// Assembles the state from its parts.
    pub(crate) fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        stream: Stream<PersistedKeepalive<R>>,
        storage: ServiceStorage,
        nginx: Option<NginxManager>,
        renderer: Arc<dyn SvgRenderer>,
    ) -> Self {
        Self {
            config,
            clock,
            stream,
            storage,
            keepalive_cache: Mutex::new(HashMap::new()),
            latest_keepalive_index_plus_one: Mutex::new(HashMap::new()),
            reconciler_wake: Notify::new(),
            shutting_down: AtomicBool::new(false),
            http_client: reqwest::Client::new(),
            nginx,
            renderer,
        }
    }

    /// Locks the keepalive-time cache.
    pub fn keepalive_cache(&self) -> MutexGuard<'_, HashMap<String, MicroTimestamp>> {
        match self.keepalive_cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Locks the latest-keepalive-index cache.
    pub fn latest_index_cache(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        match self.latest_keepalive_index_plus_one.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Records a fresh keepalive time for `codename`, waking the reconciler if
    /// the codename is new to the cache.
    pub fn touch_keepalive(&self, codename: &str, now: MicroTimestamp) {
        let newly_tracked = {
            let mut cache = self.keepalive_cache();
            cache.insert(codename.to_string(), now).is_none()
        };
        if newly_tracked {
            self.reconciler_wake.notify_one();
        }
    }

    /// Drops `codename` from the keepalive cache and wakes the reconciler.
    pub fn forget_keepalive(&self, codename: &str) {
        {
            let mut cache = self.keepalive_cache();
            cache.remove(codename);
        }
        self.reconciler_wake.notify_one();
    }

    /// Number of services currently tracked as alive.
    pub fn active_services_count(&self) -> usize {
        self.keepalive_cache().len()
    }
}
