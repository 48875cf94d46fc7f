//! # karl-api
//!
//! Karl's HTTP surface and background machinery: the keepalive ingestor, the
//! fleet-status query projector, the timeout reconciler, and the nginx
//! front-door materializer, assembled around the `karl-stream` keepalive log and
//! the `karl-store` service directory.
//!
//! The entry point is [`Karl`]: construct it (generic over the deployment's
//! runtime variant set) from a [`config::Config`] plus the external
//! collaborators, then either mount [`Karl::router`] yourself or let
//! [`Karl::serve`] bind and run.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod karl;
pub mod nginx;
pub mod reconciler;
pub mod render;
pub mod report;
pub mod routes;
pub mod state;

pub use config::{Config, NginxParameters};
pub use error::{ApiError, ApiResult};
pub use karl::{Karl, KarlBuilder};
pub use nginx::{NginxReloader, ProxyReloader};
pub use render::{GraphvizRenderer, SvgRenderer};
