use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ReaderError;
use crate::lsn::Lsn;

/// Error type handlers return; converted to [`ReaderError::Callback`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// One decoded change as the output plugin produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Start of the WAL record this change came from. Acknowledge this.
    pub lsn: Lsn,
    /// Server's current WAL end (can be `0/0` inside a transaction).
    pub wal_end: Lsn,
    /// Server send time, microseconds since 2000-01-01.
    pub server_time_micros: i64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub server_wal_end: Lsn,
    pub server_time_micros: i64,
    pub reply_requested: bool,
}

/// What the engine hands to the handler alongside each event.
///
/// Acknowledgments recorded here are sent to the server as soon as the
/// handler returns.
#[derive(Debug, Default)]
pub struct StreamContext {
    current: Lsn,
    ack: Option<Lsn>,
    stop: bool,
}

impl StreamContext {
    pub(crate) fn for_event(lsn: Lsn) -> Self {
        Self {
            current: lsn,
            ..Self::default()
        }
    }

    /// LSN of the event being handled.
    pub fn current_lsn(&self) -> Lsn {
        self.current
    }

    /// Everything up to `lsn` is durably processed.
    pub fn acknowledge(&mut self, lsn: Lsn) {
        self.ack = Some(self.ack.map_or(lsn, |prev| prev.max(lsn)));
    }

    /// Acknowledge the event being handled.
    pub fn acknowledge_current(&mut self) {
        self.acknowledge(self.current);
    }

    /// Ask the engine to stop after this event.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    pub(crate) fn take_ack(&mut self) -> Option<Lsn> {
        self.ack.take()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop
    }
}

/// Application side of the stream.
///
/// `on_event` runs inline in the receive loop; while it runs no frames are
/// read and no heartbeats go out.
#[async_trait]
pub trait EventHandler: Send {
    async fn on_event(
        &mut self,
        event: Event,
        ctx: &mut StreamContext,
    ) -> Result<(), HandlerError>;

    async fn on_keepalive(&mut self, _keepalive: &Keepalive) {}

    /// Every error the engine hits, before it retries or gives up.
    async fn on_error(&mut self, _error: &ReaderError) {}
}
