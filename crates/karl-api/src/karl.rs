//! The assembled service: construction, the HTTP router, serving, shutdown.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use karl_core::{
    Clock, DefaultRuntime, Error, KarlInfo, PersistedKeepalive, RegisteredState, Result,
    RuntimeStatus, SystemClock,
};
use karl_store::ServiceStorage;
use karl_stream::Stream;

use crate::config::Config;
use crate::nginx::{NginxManager, NginxReloader, ProxyReloader};
use crate::reconciler;
use crate::render::{GraphvizRenderer, SvgRenderer};
use crate::routes;
use crate::state::AppState;

/// A running Karl instance, generic over the deployment's runtime variant set.
pub struct Karl<R: RuntimeStatus = DefaultRuntime> {
    state: Arc<AppState<R>>,
    reconciler: Option<JoinHandle<()>>,
}

impl<R: RuntimeStatus> std::fmt::Debug for Karl<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Karl").field("state", &self.state).finish()
    }
}

impl Karl {
    /// Starts a builder over the default runtime variant set.
    #[must_use]
    pub fn builder(config: Config) -> KarlBuilder {
        KarlBuilder::new(config)
    }
}

impl<R: RuntimeStatus> Karl<R> {
    /// The route table, mounted under the configured base URL, with tracing.
    pub fn router(&self) -> Router {
        let routed = routes::routes::<R>()
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());
        if self.state.config.url == "/" {
            routed
        } else {
            Router::new().nest(&self.state.config.url, routed)
        }
    }

    /// Binds the configured port and serves until interrupted, then shuts down.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be bound or the server fails.
    pub async fn serve(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::internal(format!("failed to bind to {addr}: {e}")))?;

        tracing::info!(
            port = self.state.config.port,
            url = %self.state.config.url,
            nginx = self.state.nginx.is_some(),
            "starting Karl"
        );

        let router = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|e| Error::internal(format!("server error: {e}")))?;

        self.shutdown().await;
        Ok(())
    }

    /// Number of services currently tracked as alive.
    #[must_use]
    pub fn active_services_count(&self) -> usize {
        self.state.active_services_count()
    }

    /// The service directory (primarily for tests and tooling).
    #[must_use]
    pub fn storage(&self) -> &ServiceStorage {
        &self.state.storage
    }

    /// The shared application state.
    #[doc(hidden)]
    #[must_use]
    pub fn state(&self) -> &Arc<AppState<R>> {
        &self.state
    }

    /// Stops the reconciler, writes the best-effort `up = false` launch record,
    /// and tears down both logs.
    pub async fn shutdown(mut self) {
        self.state.shutting_down.store(true, Ordering::SeqCst);
        self.state.reconciler_wake.notify_one();
        if let Some(handle) = self.reconciler.take() {
            if handle.await.is_err() {
                tracing::warn!("reconciler worker panicked");
            }
        }

        let now = self.state.clock.now();
        let result = self
            .state
            .storage
            .read_write(move |fields| {
                fields.karl().add(KarlInfo {
                    timestamp: now,
                    up: false,
                    persisted_keepalives_info: None,
                });
                Ok(())
            })
            .await;
        if let Err(error) = result {
            tracing::warn!(%error, "could not record shutdown");
        }

        self.state.storage.shutdown();
        self.state.stream.shutdown();
        tracing::info!("Karl stopped");
    }
}

/// Builder wiring Karl's collaborators before construction.
pub struct KarlBuilder<R: RuntimeStatus = DefaultRuntime> {
    config: Config,
    clock: Arc<dyn Clock>,
    reloader: Box<dyn ProxyReloader>,
    renderer: Arc<dyn SvgRenderer>,
    _runtime: PhantomData<R>,
}

impl<R: RuntimeStatus> KarlBuilder<R> {
    /// Starts a builder with the real clock, nginx, and graphviz collaborators.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            reloader: Box::new(NginxReloader),
            renderer: Arc::new(GraphvizRenderer),
            _runtime: PhantomData,
        }
    }

    /// Substitutes the wall clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Substitutes the proxy-reload collaborator.
    #[must_use]
    pub fn reloader(mut self, reloader: Box<dyn ProxyReloader>) -> Self {
        self.reloader = reloader;
        self
    }

    /// Substitutes the DOT-to-SVG renderer.
    #[must_use]
    pub fn renderer(mut self, renderer: Arc<dyn SvgRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Opens (or creates) the two logs, records the launch, seeds the timeout
    /// cache from surviving `Active` rows, and starts the reconciler.
    ///
    /// # Errors
    ///
    /// Fails when a backing file cannot be opened, a log fails replay
    /// validation, or the nginx front door was requested but is unusable.
    pub async fn build(self) -> Result<Karl<R>> {
        let Self {
            config,
            clock,
            reloader,
            renderer,
            _runtime,
        } = self;

        let stream: Stream<PersistedKeepalive<R>> = match &config.stream_file {
            Some(path) => Stream::open_file(path, Arc::clone(&clock))
                .map_err(|e| Error::persistence_with_source("open keepalive log", e))?,
            None => Stream::in_memory(Arc::clone(&clock)),
        };
        let storage = match &config.storage_file {
            Some(path) => ServiceStorage::open(path, Arc::clone(&clock))
                .map_err(|e| Error::persistence_with_source("open service directory", e))?,
            None => ServiceStorage::in_memory(Arc::clone(&clock)),
        };

        let nginx = match config.nginx.clone() {
            Some(parameters) => {
                Some(NginxManager::new(parameters, config.port, reloader).await?)
            }
            None => None,
        };

        let state = Arc::new(AppState::new(
            config, clock, stream, storage, nginx, renderer,
        ));

        // Record this launch, and seed the cache with every row still marked
        // Active from before the restart: services that stay silent past the
        // timeout window will be reconciled to DisconnectedByTimeout.
        let now = state.clock.now();
        let launch = KarlInfo {
            timestamp: now,
            up: true,
            persisted_keepalives_info: state.stream.last_index_and_timestamp(),
        };
        let survivors: Vec<String> = state
            .storage
            .read_write(move |fields| {
                fields.karl().add(launch);
                Ok(fields
                    .claires()
                    .iter()
                    .filter(|claire| claire.registered_state == RegisteredState::Active)
                    .map(|claire| claire.codename.clone())
                    .collect())
            })
            .await
            .map_err(|e| Error::persistence_with_source("record launch", e))?;
        {
            let mut cache = state.keepalive_cache();
            for codename in survivors {
                cache.insert(codename, now);
            }
        }

        let reconciler = reconciler::spawn(Arc::clone(&state));
        Ok(Karl {
            state,
            reconciler: Some(reconciler),
        })
    }
}

#[cfg(test)]
mod tests {
    use karl_core::MicroDuration;
    use karl_test_utils::MockClock;

    use super::*;

    #[tokio::test]
    async fn launch_is_recorded_once() {
        let karl = KarlBuilder::<DefaultRuntime>::new(Config::default())
            .clock(Arc::new(MockClock::starting_at(1_000_000)))
            .build()
            .await
            .unwrap();

        let launches: Vec<bool> = karl
            .storage()
            .read_only(|tables| tables.karl.iter().map(|record| record.up).collect())
            .await;
        assert_eq!(launches, [true]);
        karl.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_appends_a_down_record() {
        let clock = MockClock::starting_at(1_000_000);
        let karl = KarlBuilder::<DefaultRuntime>::new(Config::default())
            .clock(Arc::new(clock.clone()))
            .build()
            .await
            .unwrap();
        let storage = karl.storage().clone();

        clock.advance_seconds(1);
        karl.shutdown().await;

        let ups: Vec<bool> = storage
            .read_only(|tables| tables.karl.iter().map(|record| record.up).collect())
            .await;
        assert_eq!(ups, [true, false]);
    }

    #[tokio::test]
    async fn restart_seeds_the_timeout_cache_from_active_rows() {
        let dir = tempfile::tempdir().unwrap();
        let stream_file = dir.path().join("keepalives.log");
        let storage_file = dir.path().join("storage.log");
        let config = || Config {
            stream_file: Some(stream_file.clone()),
            storage_file: Some(storage_file.clone()),
            reconciler_poll_interval: Some(MicroDuration::from_micros(5_000)),
            ..Config::default()
        };

        let clock = MockClock::starting_at(1_000_000);
        let karl = KarlBuilder::<DefaultRuntime>::new(config())
            .clock(Arc::new(clock.clone()))
            .build()
            .await
            .unwrap();
        karl.storage()
            .read_write(|fields| {
                let location = karl_core::ServiceKey::new("10.0.0.1", 80);
                fields.claires().add(karl_core::ClaireInfo {
                    codename: "SURVIVOR".to_string(),
                    service: "svc".to_string(),
                    url_status_page_direct: location.status_page_url(),
                    location,
                    reported_timestamp: clock.now(),
                    registered_state: RegisteredState::Active,
                });
                Ok(())
            })
            .await
            .unwrap();
        karl.shutdown().await;

        // Second launch: the Active row must be tracked again, and time out if
        // it never re-registers.
        let restarted = KarlBuilder::<DefaultRuntime>::new(config())
            .clock(Arc::new(clock.clone()))
            .build()
            .await
            .unwrap();
        assert_eq!(restarted.active_services_count(), 1);

        clock.advance_seconds(46);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let state = restarted
            .storage()
            .read_only(|tables| {
                tables
                    .claires
                    .get(&"SURVIVOR".to_string())
                    .map(|claire| claire.registered_state)
            })
            .await;
        assert_eq!(state, Some(RegisteredState::DisconnectedByTimeout));
        restarted.shutdown().await;
    }
}
