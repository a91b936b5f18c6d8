//! PostgreSQL wire protocol, the parts a logical decoding client needs.
//!
//! - [`framing`]: message boundaries, buffered cancel-safe reads, frontend
//!   message writers.
//! - [`messages`]: ErrorResponse fields, auth requests, simple query results.
//! - [`replication`]: the streaming codec: XLogData, PrimaryKeepalive,
//!   CopyDone in; StandbyStatusUpdate out.
//!
//! Every backend message is a 1-byte tag, a 4-byte big-endian length that
//! counts itself, and the payload. Startup and SSLRequest omit the tag.

pub mod framing;
pub mod messages;
pub mod replication;

pub use framing::BackendMessage;
pub use messages::{ErrorFields, QueryResult, parse_auth_request, parse_error_response};
pub use replication::{
    PG_EPOCH_MICROS, ReplicationMessage, StandbyStatusUpdate, decode, encode_status_update,
    parse_copy_data, pg_now_micros, pg_to_unix_timestamp, unix_to_pg_timestamp,
};
