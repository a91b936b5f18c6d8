//! The streaming side: engine, flow control and the handler interface.
//!
//! # Overview
//!
//! A [`StreamEngine`] owns one replication connection (through a
//! [`Connector`](crate::transport::Connector)) and pushes every decoded
//! change into your [`EventHandler`]. The handler decides when a change is
//! durable and says so with [`StreamContext::acknowledge`]; only then does
//! the server learn it may discard the WAL behind it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  on_event(Event) ┌─────────────────┐
//! │                 │◄─────────────────│                 │
//! │  EventHandler   │                  │  StreamEngine   │
//! │                 │─────────────────►│  + FlowControl  │
//! │                 │  ctx.acknowledge │                 │
//! └─────────────────┘                  └────────┬────────┘
//!                                               │ Transport
//!                                               │ (TCP/TLS)
//!                                               ▼
//!                                      ┌─────────────────┐
//!                                      │   PostgreSQL    │
//!                                      │ (output plugin) │
//!                                      └─────────────────┘
//! ```
//!
//! The handler runs inline: the engine does not read the next frame until
//! `on_event` returns, so nothing is buffered and nothing is replayed
//! within a connection. After a reconnect the server resends from the last
//! acknowledged position, so handlers should tolerate seeing a change twice.
//!
//! # Example
//!
//! ```ignore
//! use pglogical_reader::{Event, EventHandler, HandlerError, ReaderConfig, StreamContext, StreamEngine};
//!
//! struct Print;
//!
//! #[async_trait::async_trait]
//! impl EventHandler for Print {
//!     async fn on_event(&mut self, ev: Event, ctx: &mut StreamContext) -> Result<(), HandlerError> {
//!         println!("{}: {}", ev.lsn, String::from_utf8_lossy(&ev.payload));
//!         ctx.acknowledge_current();
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = ReaderConfig::new("localhost", "postgres", "secret", "app", "my_slot", "test_decoding");
//!     StreamEngine::new(cfg, Print).run().await?;
//!     Ok(())
//! }
//! ```

mod engine;
mod flow;
mod handler;

pub use engine::{EngineState, StopHandle, StreamEnd, StreamEngine};
pub use flow::{FeedbackState, FlowController};
pub use handler::{Event, EventHandler, HandlerError, Keepalive, StreamContext};
