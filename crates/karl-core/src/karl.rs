//! Karl-side schema: the rows Karl persists about the fleet and about itself.
//!
//! These are the table types of the keyed store, plus the envelope in which
//! keepalives are persisted on the append-only log.

use serde::{Deserialize, Serialize};

use crate::claire::{BuildInfo, ClaireServiceStatus, ServiceKey};
use crate::time::{MicroDuration, MicroTimestamp};

/// Minimum change in a server's time-skew estimate before the stored
/// [`ServerInfo`] row is rewritten. Keeps repeated keepalives from amplifying
/// into store writes.
pub const SERVER_INFO_TIME_SKEW_THRESHOLD: MicroDuration = MicroDuration::from_seconds(1);

/// Cursor into an append-only log: 1-based entry index plus assigned timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexAndTimestamp {
    /// 1-based index of the entry.
    pub index: u64,
    /// Timestamp assigned by the log at publish time.
    pub us: MicroTimestamp,
}

/// Envelope in which one keepalive is persisted on the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedKeepalive<R> {
    /// Where the report came from, as seen by Karl.
    pub location: ServiceKey,
    /// The reported status.
    pub keepalive: ClaireServiceStatus<R>,
    /// The exact JSON the reporter sent, retained only when the runtime variant
    /// failed to parse, so reserialization stays lossless for unknown tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_status: Option<serde_json::Value>,
}

/// Registration state of a codename in the service directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisteredState {
    /// Keepalives are arriving.
    Active,
    /// The reconciler timed the service out.
    DisconnectedByTimeout,
    /// The service asked to be removed.
    Deregistered,
}

/// Directory row for one claire, keyed by codename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaireInfo {
    /// The cluster-wide primary key.
    pub codename: String,
    /// Logical service this instance belongs to.
    pub service: String,
    /// Last reported location.
    pub location: ServiceKey,
    /// Karl-clock timestamp of the last keepalive that touched this row.
    pub reported_timestamp: MicroTimestamp,
    /// Direct status-page URL derived from the location.
    pub url_status_page_direct: String,
    /// Current registration state.
    pub registered_state: RegisteredState,
}

impl ClaireInfo {
    /// A skeletal row for a codename the store has never seen; used when the
    /// reconciler times out a service that was never registered.
    #[must_use]
    pub fn skeleton(codename: impl Into<String>) -> Self {
        Self {
            codename: codename.into(),
            service: String::new(),
            location: ServiceKey::new("", 0),
            reported_timestamp: MicroTimestamp::ZERO,
            url_status_page_direct: String::new(),
            registered_state: RegisteredState::Active,
        }
    }
}

/// Last-seen build for a codename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaireBuildInfo {
    /// The codename the build belongs to.
    pub codename: String,
    /// The reported build.
    pub build: BuildInfo,
}

/// Per-server time-skew estimate, keyed by IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// The server's IP as seen by Karl.
    pub ip: String,
    /// How far that server's clock trails Karl's (negative: runs ahead).
    pub behind_this_by: MicroDuration,
}

/// Append-only per-launch record of Karl itself, keyed by launch timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KarlInfo {
    /// When this record was written.
    pub timestamp: MicroTimestamp,
    /// True on startup, false in the best-effort shutdown record.
    pub up: bool,
    /// Cursor of the keepalive log at startup, when it was non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted_keepalives_info: Option<IndexAndTimestamp>,
}
