#![cfg(feature = "examples")]

//! Stream a slot and acknowledge every fifth change.
//!
//! cargo run --example ack_every_fifth --features examples
//!
//! Connection settings come from the usual libpq variables (PGHOST, PGPORT,
//! PGUSER, PGPASSWORD, PGDATABASE) plus PGSLOT and PGPLUGIN. Ctrl-C stops.

use std::time::Duration;

use async_trait::async_trait;
use pglogical_reader::{
    Event, EventHandler, HandlerError, Keepalive, ReaderConfig, ReaderError, StreamContext,
    StreamEngine,
};

fn env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[derive(Default)]
struct EveryFifth {
    seen: u64,
}

#[async_trait]
impl EventHandler for EveryFifth {
    async fn on_event(&mut self, ev: Event, ctx: &mut StreamContext) -> Result<(), HandlerError> {
        self.seen += 1;
        println!("{} {}", ev.lsn, String::from_utf8_lossy(&ev.payload));
        if self.seen % 5 == 0 {
            ctx.acknowledge_current();
            println!("-- acknowledged up to {}", ev.lsn);
        }
        Ok(())
    }

    async fn on_keepalive(&mut self, ka: &Keepalive) {
        if ka.reply_requested {
            println!("-- server asked for status at {}", ka.server_wal_end);
        }
    }

    async fn on_error(&mut self, err: &ReaderError) {
        eprintln!("-- {err}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = ReaderConfig::new(
        env("PGHOST", "127.0.0.1"),
        env("PGUSER", "postgres"),
        env("PGPASSWORD", "postgres"),
        env("PGDATABASE", "postgres"),
        env("PGSLOT", "test_slot"),
        env("PGPLUGIN", "test_decoding"),
    )
    .with_port(env("PGPORT", "5432").parse()?)
    .with_create_slot(true)
    .with_status_interval(Duration::from_secs(10));

    let mut engine = StreamEngine::new(cfg, EveryFifth::default());
    let stop = engine.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let end = engine.run().await?;
    println!(
        "stream ended ({end:?}) after {} changes, flushed {}",
        engine.handler().seen,
        engine.feedback().flushed_lsn
    );
    Ok(())
}
