#![cfg(feature = "examples")]

//! Inspect, create and drop logical replication slots over a replication
//! connection.
//!
//! cargo run --example slot_admin --features examples -- status my_slot
//! cargo run --example slot_admin --features examples -- create my_slot test_decoding
//! cargo run --example slot_admin --features examples -- drop my_slot

use anyhow::{Context, bail};
use pglogical_reader::ReaderConfig;
use pglogical_reader::transport::ReplicationSession;

fn env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (cmd, slot) = match args.as_slice() {
        [cmd, slot, ..] => (cmd.as_str(), slot.as_str()),
        _ => bail!("usage: slot_admin <status|create|drop> <slot> [plugin]"),
    };
    let plugin = args.get(2).map_or("test_decoding", String::as_str);

    let cfg = ReaderConfig::new(
        env("PGHOST", "127.0.0.1"),
        env("PGUSER", "postgres"),
        env("PGPASSWORD", "postgres"),
        env("PGDATABASE", "postgres"),
        slot,
        plugin,
    )
    .with_port(env("PGPORT", "5432").parse()?);

    let mut session = ReplicationSession::connect(&cfg)
        .await
        .context("replication connect")?;
    let ident = session.identify_system().await?;
    println!(
        "system {} timeline {} at {}",
        ident.system_id, ident.timeline, ident.xlog_pos
    );

    match cmd {
        "status" => match session.slot_info(slot).await? {
            Some(info) => println!(
                "{}: plugin={} active={} confirmed_flush={}",
                info.slot_name,
                info.plugin.as_deref().unwrap_or("-"),
                info.active,
                info.confirmed_flush_lsn
                    .map_or_else(|| "-".to_string(), |l| l.to_string())
            ),
            None => println!("{slot}: does not exist"),
        },
        "create" => {
            let created = session.create_slot(slot, plugin, false).await?;
            println!(
                "created {} ({}) consistent at {}",
                created.slot_name,
                created.output_plugin.as_deref().unwrap_or(plugin),
                created.consistent_point
            );
        }
        "drop" => {
            session.drop_slot(slot, true).await?;
            println!("dropped {slot}");
        }
        other => bail!("unknown command {other:?}"),
    }

    session.close().await?;
    Ok(())
}
