//! The front-door materializer: renders the active-service set into an nginx
//! config and asks the external daemon to reload it.
//!
//! Inert unless construction received [`NginxParameters`]. Staleness is keyed
//! off the store-log size: a reconciler tick that finds the directory unchanged
//! rewrites nothing.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use karl_core::{Error, RegisteredState, Result};
use karl_store::ServiceStorage;

use crate::config::NginxParameters;

/// External reverse-proxy daemon, seen as: an availability probe plus a
/// config-file reload trigger.
#[async_trait]
pub trait ProxyReloader: Send + Sync {
    /// Returns true when the daemon binary is present and runnable.
    async fn is_available(&self) -> bool;

    /// Asks the daemon to pick up the rewritten config file.
    async fn reload(&self, config_file: &Path) -> Result<()>;
}

/// The real nginx daemon, driven through its CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct NginxReloader;

#[async_trait]
impl ProxyReloader for NginxReloader {
    async fn is_available(&self) -> bool {
        tokio::process::Command::new("nginx")
            .arg("-v")
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn reload(&self, config_file: &Path) -> Result<()> {
        let output = tokio::process::Command::new("nginx")
            .arg("-s")
            .arg("reload")
            .arg("-c")
            .arg(config_file)
            .output()
            .await
            .map_err(|e| Error::external(format!("spawn nginx reload: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::external(format!(
                "nginx reload failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Tracks what the front door currently reflects and rewrites it when the
/// directory has moved on.
pub struct NginxManager {
    parameters: NginxParameters,
    karl_port: u16,
    reloader: Box<dyn ProxyReloader>,
    last_reflected_store_log_size: Mutex<Option<u64>>,
}

impl std::fmt::Debug for NginxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NginxManager")
            .field("parameters", &self.parameters)
            .field("karl_port", &self.karl_port)
            .finish()
    }
}

impl NginxManager {
    /// Verifies the daemon is usable and sets up the manager.
    ///
    /// # Errors
    ///
    /// Fails when the daemon is unavailable or the listen port is zero.
    pub async fn new(
        parameters: NginxParameters,
        karl_port: u16,
        reloader: Box<dyn ProxyReloader>,
    ) -> Result<Self> {
        if parameters.port == 0 {
            return Err(Error::InvalidInput(
                "nginx listen port must be non-zero".to_string(),
            ));
        }
        if !reloader.is_available().await {
            return Err(Error::external(
                "nginx front door requested but the daemon is not available",
            ));
        }
        Ok(Self {
            parameters,
            karl_port,
            reloader,
            last_reflected_store_log_size: Mutex::new(None),
        })
    }

    /// Route prefix live services are exposed under.
    #[must_use]
    pub fn route_prefix(&self) -> &str {
        &self.parameters.route_prefix
    }

    /// Rewrites the config and reloads the daemon when the directory changed
    /// since the last reflected state (always, on the first run).
    ///
    /// # Errors
    ///
    /// Fails when the config cannot be written or the daemon refuses to reload.
    pub async fn update_if_needed(&self, storage: &ServiceStorage) -> Result<()> {
        let current_size = storage.log_size();
        {
            let last = self.lock_last_reflected();
            if *last == Some(current_size) {
                return Ok(());
            }
        }

        let routes: Vec<(String, String)> = storage
            .read_only(|tables| {
                tables
                    .claires
                    .iter()
                    .filter(|claire| claire.registered_state == RegisteredState::Active)
                    .map(|claire| {
                        (
                            claire.codename.clone(),
                            claire.location.status_page_url(),
                        )
                    })
                    .collect()
            })
            .await;

        let config = self.render_config(&routes);
        self.write_config_atomically(&config)?;
        self.reloader.reload(&self.parameters.config_file).await?;

        *self.lock_last_reflected() = Some(current_size);
        tracing::info!(
            routes = routes.len(),
            store_log_size = current_size,
            "front-door config reflected"
        );
        Ok(())
    }

    fn render_config(&self, routes: &[(String, String)]) -> String {
        let mut config = String::new();
        config.push_str("server {\n");
        config.push_str(&format!("  listen {};\n", self.parameters.port));
        config.push_str("  location / {\n");
        config.push_str(&format!(
            "    proxy_pass http://localhost:{}/;\n",
            self.karl_port
        ));
        config.push_str("  }\n");
        for (codename, url) in routes {
            config.push_str(&format!(
                "  location {}/{codename} {{\n    proxy_pass {url};\n  }}\n",
                self.parameters.route_prefix
            ));
        }
        config.push_str("}\n");
        config
    }

    fn write_config_atomically(&self, config: &str) -> Result<()> {
        let path = &self.parameters.config_file;
        let tmp = path.with_extension("conf.tmp");
        std::fs::write(&tmp, config).map_err(|e| {
            Error::persistence_with_source(format!("write {}", tmp.display()), e)
        })?;
        std::fs::rename(&tmp, path).map_err(|e| {
            Error::persistence_with_source(format!("rename into {}", path.display()), e)
        })?;
        Ok(())
    }

    fn lock_last_reflected(&self) -> std::sync::MutexGuard<'_, Option<u64>> {
        match self.last_reflected_store_log_size.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
