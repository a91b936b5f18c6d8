//! Logical decoding reader for PostgreSQL.
//!
//! Connects in replication mode, consumes a logical replication slot and
//! hands every change the output plugin emits to an [`EventHandler`]. The
//! server is told what the handler acknowledged, so the slot only advances
//! past changes the application has made durable.
//!
//! Start with [`StreamEngine`] and [`ReaderConfig`]; slot administration
//! lives on [`transport::ReplicationSession`].

#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod lsn;
pub mod protocol;
pub mod tls;
pub mod transport;

pub use client::{
    EngineState, Event, EventHandler, HandlerError, Keepalive, StopHandle, StreamContext,
    StreamEnd, StreamEngine,
};
pub use config::{ReaderConfig, RetryPolicy, SlotConfig, SslMode, TlsConfig};
pub use error::{ReaderError, Result};
pub use lsn::Lsn;
pub use transport::{Connector, PgConnector, ReplicationSession, Transport};
