use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ReaderError, Result};
use crate::lsn::Lsn;
use crate::protocol::framing::BackendMessage;

/// `'w'` + start(8) + end(8) + send time(8).
pub const XLOG_DATA_HEADER_LEN: usize = 24;
/// `'k'` + end(8) + send time(8) + reply flag(1), exact.
pub const KEEPALIVE_BODY_LEN: usize = 17;
/// `'r'` + write(8) + flush(8) + apply(8) + client time(8) + reply flag(1).
pub const STATUS_UPDATE_LEN: usize = 34;

/// What a frame received in CopyBoth mode decodes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    /// WAL data for one decoded change.
    XLogData {
        /// WAL position where this data starts
        wal_start: Lsn,
        /// Current WAL end position on server (may be 0 for in-transaction messages)
        wal_end: Lsn,
        /// Server timestamp in microseconds since 2000-01-01
        server_time_micros: i64,
        /// Output plugin payload, uninterpreted
        data: Bytes,
    },
    /// Server heartbeat.
    PrimaryKeepalive {
        /// Current WAL end position on server
        wal_end: Lsn,
        /// Server timestamp in microseconds since 2000-01-01
        server_time_micros: i64,
        /// If true, the server drops us unless a status update follows promptly
        reply_requested: bool,
    },
    /// Server finished the COPY stream.
    CopyDone,
}

impl ReplicationMessage {
    #[inline]
    pub fn is_xlog_data(&self) -> bool {
        matches!(self, ReplicationMessage::XLogData { .. })
    }

    #[inline]
    pub fn is_keepalive(&self) -> bool {
        matches!(self, ReplicationMessage::PrimaryKeepalive { .. })
    }

    #[inline]
    pub fn requires_reply(&self) -> bool {
        matches!(
            self,
            ReplicationMessage::PrimaryKeepalive {
                reply_requested: true,
                ..
            }
        )
    }
}

/// Decode a frame received while streaming.
///
/// Accepts CopyData (`d`) carrying `w` or `k`, and CopyDone (`c`). Anything
/// else, or a body whose length disagrees with its kind, is a
/// [`ReaderError::MalformedFrame`].
pub fn decode(frame: &BackendMessage) -> Result<ReplicationMessage> {
    match frame.tag {
        b'd' => parse_copy_data(frame.payload.clone()),
        b'c' if frame.payload.is_empty() => Ok(ReplicationMessage::CopyDone),
        b'c' => Err(ReaderError::MalformedFrame(format!(
            "CopyDone with {} byte payload",
            frame.payload.len()
        ))),
        tag => Err(ReaderError::MalformedFrame(format!(
            "unexpected message in CopyBoth mode: 0x{tag:02x} ('{}')",
            tag as char
        ))),
    }
}

/// Parse a CopyData payload (tag and length already stripped).
pub fn parse_copy_data(payload: Bytes) -> Result<ReplicationMessage> {
    if payload.is_empty() {
        return Err(ReaderError::MalformedFrame("empty CopyData payload".into()));
    }

    let mut b = payload;
    let kind = b.get_u8();

    match kind {
        b'w' => {
            if b.remaining() < XLOG_DATA_HEADER_LEN {
                return Err(ReaderError::MalformedFrame(format!(
                    "XLogData payload too short: {} bytes (need at least {XLOG_DATA_HEADER_LEN})",
                    b.remaining()
                )));
            }
            let wal_start = Lsn(b.get_u64());
            let wal_end = Lsn(b.get_u64());
            let server_time_micros = b.get_i64();
            let data = b.copy_to_bytes(b.remaining());

            Ok(ReplicationMessage::XLogData {
                wal_start,
                wal_end,
                server_time_micros,
                data,
            })
        }
        b'k' => {
            if b.remaining() != KEEPALIVE_BODY_LEN {
                return Err(ReaderError::MalformedFrame(format!(
                    "PrimaryKeepalive payload is {} bytes (need {KEEPALIVE_BODY_LEN})",
                    b.remaining()
                )));
            }
            let wal_end = Lsn(b.get_u64());
            let server_time_micros = b.get_i64();
            let reply_requested = b.get_u8() != 0;

            Ok(ReplicationMessage::PrimaryKeepalive {
                wal_end,
                server_time_micros,
                reply_requested,
            })
        }
        _ => Err(ReaderError::MalformedFrame(format!(
            "unknown CopyData kind: 0x{kind:02x} ('{}')",
            kind as char
        ))),
    }
}

/// Client progress report, sent inside CopyData.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    /// Last WAL position received
    pub written: Lsn,
    /// Last WAL position durably processed; the slot may discard WAL before it
    pub flushed: Lsn,
    pub applied: Lsn,
    /// Client clock, microseconds since 2000-01-01
    pub client_time_micros: i64,
    /// Ask the server to answer with a keepalive straight away
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    pub fn encode(&self) -> Bytes {
        encode_status_update(
            self.written,
            self.flushed,
            self.applied,
            self.client_time_micros,
            self.reply_requested,
        )
    }
}

/// Encode a StandbyStatusUpdate body.
///
/// The server reads this at fixed offsets; see [`STATUS_UPDATE_LEN`].
pub fn encode_status_update(
    written: Lsn,
    flushed: Lsn,
    applied: Lsn,
    client_time_micros: i64,
    reply_requested: bool,
) -> Bytes {
    let mut out = BytesMut::with_capacity(STATUS_UPDATE_LEN);
    out.put_u8(b'r');
    out.put_u64(written.0);
    out.put_u64(flushed.0);
    out.put_u64(applied.0);
    out.put_i64(client_time_micros);
    out.put_u8(u8::from(reply_requested));
    out.freeze()
}

/// PostgreSQL epoch (2000-01-01) in microseconds since Unix epoch.
pub const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// Convert Unix timestamp (micros) to PostgreSQL timestamp (micros since 2000-01-01).
#[inline]
pub fn unix_to_pg_timestamp(unix_micros: i64) -> i64 {
    unix_micros - PG_EPOCH_MICROS
}

/// Convert PostgreSQL timestamp to Unix timestamp (micros).
#[inline]
pub fn pg_to_unix_timestamp(pg_micros: i64) -> i64 {
    pg_micros + PG_EPOCH_MICROS
}

/// Wall clock in PostgreSQL micros.
pub fn pg_now_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    unix_to_pg_timestamp(now.as_micros() as i64)
}
