//! Claire-side schema: what a reporting service instance sends in a keepalive.
//!
//! A "claire" is the reporting agent embedded in each service process. Every
//! keepalive carries the shallow [`ClaireStatus`] plus an optional deployment-chosen
//! `runtime` payload; [`ClaireServiceStatus`] is the full form, generic over the
//! runtime variant set declared at Karl construction.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::time::{MicroDuration, MicroTimestamp};

/// Address of a service instance: peer IP, reported local port, and URL prefix.
///
/// Equality is structural; the key doubles as the dependency-graph vertex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Host the service runs on, as seen by Karl.
    pub ip: String,
    /// Port the service listens on.
    pub port: u16,
    /// URL prefix under which the service exposes its status page.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "/".to_string()
}

impl ServiceKey {
    /// Creates a key with the default `/` prefix.
    #[must_use]
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            prefix: default_prefix(),
        }
    }

    /// Returns the direct status-page URL: `http://<ip>:<port><prefix>.current`.
    #[must_use]
    pub fn status_page_url(&self) -> String {
        format!("http://{}:{}{}.current", self.ip, self.port, self.prefix)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.ip, self.port, self.prefix)
    }
}

/// Build information a claire reports about its own binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Human-readable build time.
    #[serde(default)]
    pub build_time: String,
    /// Build time as epoch microseconds.
    #[serde(default)]
    pub build_time_epoch_microseconds: MicroTimestamp,
    /// Git commit the binary was built from.
    #[serde(default)]
    pub git_commit_hash: String,
    /// Git branch the binary was built from.
    #[serde(default)]
    pub git_branch: String,
    /// Files dirty in the working tree at build time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub git_dirty_files: Vec<String>,
}

impl BuildInfo {
    /// Returns true when the binary was built from a dirty working tree.
    #[must_use]
    pub fn git_dirty(&self) -> bool {
        !self.git_dirty_files.is_empty()
    }
}

/// The shallow keepalive payload: everything except the runtime variant.
///
/// This is the form Karl always requires; the runtime-bearing
/// [`ClaireServiceStatus`] is parsed best-effort on top of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaireStatus {
    /// Stable per-instance identifier chosen by the reporter; the cluster-wide
    /// primary key.
    pub codename: String,
    /// Logical service name; many codenames may share one service.
    pub service: String,
    /// Port the reporter listens on, as seen from its own host.
    pub local_port: u16,
    /// Services this instance depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ServiceKey>,
    /// Build of the reporting binary, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildInfo>,
    /// When the reporting process started.
    #[serde(default)]
    pub start_time_epoch_microseconds: MicroTimestamp,
    /// Human-readable uptime as rendered by the reporter.
    #[serde(default)]
    pub uptime: String,
    /// Uptime of the reporting process.
    #[serde(default)]
    pub uptime_epoch_microseconds: MicroDuration,
    /// Round-trip estimate of the last successful ping to Karl, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_ping_epoch_microseconds: Option<MicroDuration>,
    /// The reporter's own clock at send time; used for time-skew estimation.
    #[serde(default)]
    pub now: MicroTimestamp,
}

/// Marker trait for the runtime variant set a Karl deployment declares.
///
/// Blanket-implemented; any serde-round-trippable, cloneable, thread-safe type
/// qualifies.
pub trait RuntimeStatus:
    Serialize + DeserializeOwned + Clone + PartialEq + fmt::Debug + Send + Sync + 'static
{
}

impl<T> RuntimeStatus for T where
    T: Serialize + DeserializeOwned + Clone + PartialEq + fmt::Debug + Send + Sync + 'static
{
}

/// The full keepalive payload: the shallow status plus the runtime variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaireServiceStatus<R> {
    /// The shallow, always-required part of the report.
    #[serde(flatten)]
    pub status: ClaireStatus,
    /// Deployment-specific runtime payload; absent when the reporter sent none or
    /// its variant tag was unknown to this Karl.
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub runtime: Option<R>,
}

impl<R> ClaireServiceStatus<R> {
    /// Wraps a shallow status with an empty runtime.
    #[must_use]
    pub fn shallow(status: ClaireStatus) -> Self {
        Self {
            status,
            runtime: None,
        }
    }

    /// Drops the build section, for `?nobuild` snapshot responses.
    #[must_use]
    pub fn without_build(mut self) -> Self {
        self.status.build = None;
        self
    }
}

/// Free-form user status carried by the default runtime variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStatus {
    /// One-line status message.
    #[serde(default)]
    pub message: String,
    /// Arbitrary string-valued details.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

/// Default runtime variant set, for deployments that do not declare their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DefaultRuntime {
    /// A free-form user status blob.
    UserStatus(UserStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_status_json() -> serde_json::Value {
        serde_json::json!({
            "codename": "ABCDEF",
            "service": "annotator",
            "local_port": 8081,
            "dependencies": [{"ip": "127.0.0.1", "port": 8082, "prefix": "/"}],
            "start_time_epoch_microseconds": 1_000_000,
            "uptime": "5m 3s",
            "uptime_epoch_microseconds": 303_000_000i64,
            "now": 304_000_000i64,
        })
    }

    #[test]
    fn status_page_url_includes_prefix() {
        let key = ServiceKey::new("10.0.0.1", 7000);
        assert_eq!(key.status_page_url(), "http://10.0.0.1:7000/.current");

        let nested = ServiceKey {
            ip: "10.0.0.1".to_string(),
            port: 7000,
            prefix: "/api/".to_string(),
        };
        assert_eq!(nested.status_page_url(), "http://10.0.0.1:7000/api/.current");
    }

    #[test]
    fn shallow_status_parses_without_runtime() {
        let status: ClaireStatus = serde_json::from_value(sample_status_json()).unwrap();
        assert_eq!(status.codename, "ABCDEF");
        assert_eq!(status.local_port, 8081);
        assert_eq!(status.dependencies.len(), 1);
        assert!(status.build.is_none());
    }

    #[test]
    fn full_status_parses_known_runtime_variant() {
        let mut value = sample_status_json();
        value["runtime"] = serde_json::json!({
            "UserStatus": {"message": "all good", "details": {"queue": "empty"}}
        });
        let full: ClaireServiceStatus<DefaultRuntime> = serde_json::from_value(value).unwrap();
        let Some(DefaultRuntime::UserStatus(user)) = full.runtime else {
            panic!("expected a parsed runtime variant");
        };
        assert_eq!(user.message, "all good");
    }

    #[test]
    fn full_status_rejects_unknown_runtime_variant() {
        let mut value = sample_status_json();
        value["runtime"] = serde_json::json!({"SomethingElse": {"x": 1}});
        let result: Result<ClaireServiceStatus<DefaultRuntime>, _> =
            serde_json::from_value(value);
        assert!(result.is_err());
    }

    #[test]
    fn build_equality_drives_upsert_hysteresis() {
        let a = BuildInfo {
            git_commit_hash: "deadbeef".to_string(),
            ..BuildInfo::default()
        };
        let b = a.clone();
        assert_eq!(a, b);
        let c = BuildInfo {
            git_commit_hash: "cafebabe".to_string(),
            ..BuildInfo::default()
        };
        assert_ne!(a, c);
    }
}
