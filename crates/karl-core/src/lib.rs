//! # karl-core
//!
//! Core abstractions for Karl, the fleet-keepalive aggregation service.
//!
//! This crate provides the types and traits shared by every Karl component:
//!
//! - **Time**: epoch-microsecond timestamps and the mockable [`Clock`] collaborator
//! - **Claire Schema**: what a reporting service instance sends in a keepalive
//! - **Karl Schema**: the service-directory rows Karl persists about the fleet
//! - **Error Types**: shared error definitions and result types
//! - **Observability**: structured-logging initialization
//!
//! ## Crate Boundary
//!
//! `karl-core` is the only crate allowed to define shared primitives. The stream,
//! store, and HTTP layers all speak in terms of the types declared here.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod claire;
pub mod error;
pub mod karl;
pub mod observability;
pub mod time;

pub use claire::{
    BuildInfo, ClaireServiceStatus, ClaireStatus, DefaultRuntime, RuntimeStatus, ServiceKey,
    UserStatus,
};
pub use error::{Error, Result};
pub use karl::{
    ClaireBuildInfo, ClaireInfo, IndexAndTimestamp, KarlInfo, PersistedKeepalive, RegisteredState,
    ServerInfo, SERVER_INFO_TIME_SKEW_THRESHOLD,
};
pub use observability::{init_logging, LogFormat};
pub use time::{humanize_interval, Clock, MicroDuration, MicroTimestamp, SystemClock};
