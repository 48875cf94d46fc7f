//! # karl-stream
//!
//! The append-only log underlying Karl: a typed, persisted sequence of
//! `<index, timestamp, payload>` tuples with a single writer and many readers.
//!
//! - Entries get a 1-based, monotonically increasing index and a strictly
//!   increasing microsecond timestamp.
//! - Range reads are snapshots: appends racing a read never extend it.
//! - Subscribers run on dedicated workers woken by a condition variable on every
//!   publish, and are cancelled through an explicit handle.
//!
//! The on-disk format is the persister collaborator's concern; this crate ships a
//! JSON-lines [`FilePersister`] and an in-memory one for tests and dev.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

mod error;
mod persister;
mod stream;

pub use error::{Result, StreamError};
pub use persister::{FilePersister, MemoryPersister, PersistedEntry, Persister};
pub use stream::{Stream, Subscriber, SubscriptionFlow, SubscriptionHandle};
