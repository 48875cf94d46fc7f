//! Server configuration.

use std::path::PathBuf;

use karl_core::MicroDuration;

/// Default timeout after which a silent service is considered disconnected.
pub const DEFAULT_SERVICE_TIMEOUT: MicroDuration = MicroDuration::from_seconds(45);

/// Parameters for the nginx front door; absent means the materializer is inert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NginxParameters {
    /// Port the generated `server` block listens on.
    pub port: u16,
    /// Path of the config file Karl rewrites.
    pub config_file: PathBuf,
    /// Route prefix under which live services are exposed.
    pub route_prefix: String,
}

impl NginxParameters {
    /// Creates parameters with the default `/live` route prefix.
    #[must_use]
    pub fn new(port: u16, config_file: impl Into<PathBuf>) -> Self {
        Self {
            port,
            config_file: config_file.into(),
            route_prefix: "/live".to_string(),
        }
    }
}

/// Karl's construction parameters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP surface binds to.
    pub port: u16,
    /// Keepalive-log file; `None` keeps the log in memory (debug only).
    pub stream_file: Option<PathBuf>,
    /// Store-log file; `None` keeps the directory in memory (debug only).
    pub storage_file: Option<PathBuf>,
    /// Base URL the endpoints are mounted under.
    pub url: String,
    /// Externally visible base URL, used for proxied status-page links.
    pub external_url: String,
    /// Display name used in rendered topology views.
    pub svg_name: String,
    /// Repository URL linked from rendered topology views, if any.
    pub github_repo_url: String,
    /// Front-door parameters; `None` disables the materializer.
    pub nginx: Option<NginxParameters>,
    /// How long a service may stay silent before it is timed out.
    pub service_timeout_interval: MicroDuration,
    /// Upper bound on the reconciler's sleep; `None` lets it sleep until the
    /// next computed deadline. Tests running on a mock clock set a small bound
    /// so passes happen without real-time waits.
    pub reconciler_poll_interval: Option<MicroDuration>,
    /// Debug mode (pretty logs, in-memory persistence allowed).
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7576,
            stream_file: None,
            storage_file: None,
            url: "/".to_string(),
            external_url: String::new(),
            svg_name: "Karl".to_string(),
            github_repo_url: String::new(),
            nginx: None,
            service_timeout_interval: DEFAULT_SERVICE_TIMEOUT,
            reconciler_poll_interval: None,
            debug: false,
        }
    }
}

impl Config {
    /// Loads configuration from `KARL_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error when a variable is present but unparseable, or when the
    /// nginx settings are half-specified.
    pub fn from_env() -> karl_core::Result<Self> {
        let mut config = Self::default();

        if let Some(port) = read_env("KARL_PORT")? {
            config.port = port;
        }
        config.stream_file = std::env::var_os("KARL_STREAM_FILE").map(PathBuf::from);
        config.storage_file = std::env::var_os("KARL_STORAGE_FILE").map(PathBuf::from);
        if let Ok(url) = std::env::var("KARL_URL") {
            config.url = url;
        }
        if let Ok(external_url) = std::env::var("KARL_EXTERNAL_URL") {
            config.external_url = external_url;
        }
        if let Ok(name) = std::env::var("KARL_SVG_NAME") {
            config.svg_name = name;
        }
        if let Ok(repo) = std::env::var("KARL_GITHUB_REPO_URL") {
            config.github_repo_url = repo;
        }
        if let Some(seconds) = read_env::<i64>("KARL_TIMEOUT_SECONDS")? {
            config.service_timeout_interval = MicroDuration::from_seconds(seconds);
        }
        config.debug =
            std::env::var("KARL_DEBUG").is_ok_and(|value| value == "1" || value == "true");

        let nginx_port = read_env::<u16>("KARL_NGINX_PORT")?;
        let nginx_config_file = std::env::var_os("KARL_NGINX_CONFIG_FILE").map(PathBuf::from);
        config.nginx = match (nginx_port, nginx_config_file) {
            (Some(port), Some(config_file)) => {
                let mut nginx = NginxParameters::new(port, config_file);
                if let Ok(prefix) = std::env::var("KARL_NGINX_ROUTE_PREFIX") {
                    nginx.route_prefix = prefix;
                }
                Some(nginx)
            }
            (None, None) => None,
            _ => {
                return Err(karl_core::Error::InvalidInput(
                    "KARL_NGINX_PORT and KARL_NGINX_CONFIG_FILE must be set together".to_string(),
                ))
            }
        };

        Ok(config)
    }

    /// Returns the externally visible base URL, defaulting to
    /// `http://localhost:<port>`.
    #[must_use]
    pub fn resolved_external_url(&self) -> String {
        if self.external_url.is_empty() {
            format!("http://localhost:{}", self.port)
        } else {
            self.external_url.clone()
        }
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> karl_core::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value.parse::<T>().map(Some).map_err(|e| {
            karl_core::Error::InvalidInput(format!("{name}={value} is invalid: {e}"))
        }),
        Err(_) => Ok(None),
    }
}
