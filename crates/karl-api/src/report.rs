//! Fleet-status report types: what the range query projects out of the
//! keepalive log joined against the service directory.

use std::collections::BTreeMap;

use serde::Serialize;

use karl_core::{MicroDuration, MicroTimestamp, RuntimeStatus, ServiceKey};

/// Liveness of one service as of the report's `now`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ServiceCurrently {
    /// The latest keepalive is inside the timeout window.
    #[serde(rename = "up")]
    Up {
        /// When the reporting process started.
        start_time_epoch_microseconds: MicroTimestamp,
        /// Human-readable age of the latest keepalive.
        last_keepalive_received: String,
        /// Timestamp of the latest keepalive.
        last_keepalive_received_epoch_microseconds: MicroTimestamp,
        /// Uptime projected to `now`, human-readable.
        uptime: String,
    },
    /// The latest keepalive in the window is older than the timeout.
    #[serde(rename = "down")]
    Down {
        /// When the reporting process started.
        start_time_epoch_microseconds: MicroTimestamp,
        /// Human-readable age of the latest keepalive.
        last_keepalive_received: String,
        /// Timestamp of the latest keepalive.
        last_keepalive_received_epoch_microseconds: MicroTimestamp,
        /// Uptime as the service last reported it.
        last_reported_uptime: String,
    },
}

impl ServiceCurrently {
    /// Returns true for the `up` variant.
    #[must_use]
    pub fn is_up(&self) -> bool {
        matches!(self, Self::Up { .. })
    }
}

/// One service instance in the report.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport<R> {
    /// Liveness as of `now`.
    pub currently: ServiceCurrently,
    /// Logical service name.
    pub service: String,
    /// Instance codename.
    pub codename: String,
    /// Location resolved from the service directory (or a zombie placeholder).
    pub location: ServiceKey,
    /// Dependencies resolved to codenames seen in the window.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Dependencies nothing in the window answered for, as status-page URLs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved_dependencies: Vec<String>,
    /// Build time, when build info is stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_time: Option<String>,
    /// Build time in epoch microseconds, when build info is stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_time_epoch_microseconds: Option<MicroTimestamp>,
    /// Git commit of the stored build.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    /// Git branch of the stored build.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    /// Whether the stored build came from a dirty tree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_dirty: Option<bool>,
    /// Status page routed through the front door, when nginx is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_status_page_proxied: Option<String>,
    /// Direct status-page URL.
    pub url_status_page_direct: String,
    /// Runtime payload from the latest keepalive in the window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<R>,
}

/// One reporting machine: its services, plus a time-skew verdict when known.
#[derive(Debug, Clone, Serialize)]
pub struct MachineReport<R> {
    /// Services on this machine, keyed by codename.
    pub services: BTreeMap<String, ServiceReport<R>>,
    /// "NTP OK", "behind by X.Xs", or "ahead by X.Xs".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_skew: Option<String>,
}

/// The full range-query response.
#[derive(Debug, Clone, Serialize)]
pub struct KarlStatus<R> {
    /// Karl's clock when the query ran.
    pub now: MicroTimestamp,
    /// Window start (inclusive).
    pub from: MicroTimestamp,
    /// Window end (exclusive).
    pub to: MicroTimestamp,
    /// How long the projection took.
    pub generation_time: MicroDuration,
    /// Reporting machines, keyed by IP.
    pub machines: BTreeMap<String, MachineReport<R>>,
}

/// Boundary below which a server's clock skew is reported as healthy.
pub const NTP_OK_SKEW: MicroDuration = MicroDuration::from_micros(100_000);

/// Renders a time-skew estimate the way the status page shows it.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn render_time_skew(behind_this_by: MicroDuration) -> String {
    let us = behind_this_by.as_micros();
    if us.abs() < NTP_OK_SKEW.as_micros() {
        "NTP OK".to_string()
    } else if us > 0 {
        format!("behind by {:.1}s", us as f64 * 1e-6)
    } else {
        format!("ahead by {:.1}s", -us as f64 * 1e-6)
    }
}

impl<R: RuntimeStatus> KarlStatus<R> {
    /// Serializes to the minimalistic JSON wire form (absent fields omitted).
    #[must_use]
    pub fn to_minimalistic_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Serializes to the full (pretty-printed) JSON form.
    #[must_use]
    pub fn to_full_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
