//! The connection seam between the stream engine and the server.
//!
//! The engine only talks to a [`Transport`]: receive a frame with a bounded
//! wait, send a CopyData body, close. A [`Connector`] produces a transport
//! that is already streaming from a given LSN. [`PgConnector`] is the real
//! implementation over TCP/TLS; tests substitute scripted ones.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::lsn::Lsn;
use crate::protocol::BackendMessage;

mod postgres;
mod session;

pub use postgres::{PgConnector, PgTransport};
pub use session::{CreatedSlot, ReplicationSession, SlotInfo, SystemIdentity};

/// Lifecycle of one replication connection.
///
/// The engine reconnects only once its transport reports `Failed` or
/// `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Handshake in progress. [`Connector`]s return transports past it.
    Connecting,
    Streaming,
    Closing,
    /// A read or write failed or the server sent an ErrorResponse.
    Failed,
}

/// Outcome of a bounded receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Frame(BackendMessage),
    /// Nothing arrived within the timeout. Not an error.
    Timeout,
}

/// A streaming replication connection.
#[async_trait]
pub trait Transport: Send {
    /// Wait at most `timeout` for the next frame.
    ///
    /// Server ErrorResponses come back as typed errors; notices and
    /// parameter updates are consumed here and never surface.
    async fn receive(&mut self, timeout: Duration) -> Result<Received>;

    /// Send one CopyData body (e.g. an encoded standby status update).
    async fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Release the connection. Idempotent.
    async fn close(&mut self) -> Result<()>;

    fn state(&self) -> ConnectionState;
}

/// Opens transports. Called once by `start` and again on every reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, authenticate, check the slot, and start streaming from
    /// `start_lsn` (`0/0` = the slot's confirmed position).
    async fn connect(&self, start_lsn: Lsn) -> Result<Box<dyn Transport>>;
}
