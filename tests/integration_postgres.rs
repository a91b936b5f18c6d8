#![cfg(feature = "integration-tests")]

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use pglogical_reader::transport::ReplicationSession;
use pglogical_reader::{
    Event, EventHandler, HandlerError, Lsn, ReaderConfig, StreamContext, StreamEnd, StreamEngine,
};
use testcontainers::ContainerRequest;
use testcontainers::runners::AsyncRunner;
use testcontainers::{GenericImage, ImageExt, core::IntoContainerPort, core::WaitFor};
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

const SLOT: &str = "itest_slot";

fn init_tracing() {
    // RUST_LOG=info,pglogical_reader=debug cargo test --features integration-tests ...
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

fn postgres_image(host_port: u16) -> ContainerRequest<GenericImage> {
    GenericImage::new("postgres", "16-alpine")
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_DB", "postgres")
        .with_cmd([
            "postgres",
            "-c",
            "wal_level=logical",
            "-c",
            "max_replication_slots=10",
            "-c",
            "max_wal_senders=10",
        ])
        .with_mapped_port(host_port, 5432.tcp())
}

async fn connect_pg(port: u16) -> Result<tokio_postgres::Client> {
    let dsn = format!("host=127.0.0.1 port={port} user=postgres password=postgres dbname=postgres");
    let (client, conn) = tokio_postgres::connect(&dsn, NoTls)
        .await
        .context("connect control-plane postgres")?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("control-plane connection error: {e}");
        }
    });

    Ok(client)
}

async fn wait_for_pg_ready(port: u16, timeout: Duration) -> Result<tokio_postgres::Client> {
    let start = Instant::now();
    loop {
        match connect_pg(port).await {
            Ok(c) => return Ok(c),
            Err(e) => {
                if start.elapsed() > timeout {
                    return Err(e).context("postgres did not become ready in time");
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

async fn confirmed_flush(client: &tokio_postgres::Client) -> Result<Option<Lsn>> {
    let row = client
        .query_opt(
            "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
            &[&SLOT],
        )
        .await
        .context("read confirmed_flush_lsn")?;
    let Some(row) = row else { return Ok(None) };
    let s: Option<String> = row.get(0);
    s.map(|s| Lsn::parse(&s).context(format!("parse lsn: {s}")))
        .transpose()
}

fn reader_config(port: u16) -> ReaderConfig {
    ReaderConfig::new("127.0.0.1", "postgres", "postgres", "postgres", SLOT, "test_decoding")
        .with_port(port)
        .with_plugin_option("include-xids", "0")
        .with_status_interval(Duration::from_secs(1))
        .with_poll_interval(Duration::from_millis(200))
}

/// Collects test_decoding lines and acknowledges each COMMIT.
#[derive(Default)]
struct CommitCollector {
    lines: Vec<String>,
    commits: Vec<Lsn>,
    stop_after: usize,
}

#[async_trait]
impl EventHandler for CommitCollector {
    async fn on_event(&mut self, ev: Event, ctx: &mut StreamContext) -> Result<(), HandlerError> {
        let line = String::from_utf8(ev.payload.to_vec())?;
        debug!(lsn = %ev.lsn, %line, "decoded");
        if line.starts_with("COMMIT") {
            self.commits.push(ev.lsn);
            ctx.acknowledge_current();
            if self.commits.len() >= self.stop_after {
                ctx.stop();
            }
        }
        self.lines.push(line);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn postgres_test_decoding_stream_acks_and_slot_admin() -> Result<()> {
    init_tracing();

    let host_port: u16 = std::env::var("PG_ITEST_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(55432);

    info!("starting postgres container on host port {host_port}");
    let container = postgres_image(host_port).start().await?;
    info!("container id={}", container.id());

    let client = wait_for_pg_ready(host_port, Duration::from_secs(30)).await?;
    client
        .batch_execute("CREATE TABLE IF NOT EXISTS t(id INT PRIMARY KEY, v TEXT);")
        .await
        .context("create table")?;

    // 1) slot administration over the replication protocol
    let cfg = reader_config(host_port);
    let mut session = ReplicationSession::connect(&cfg).await?;
    assert_eq!(session.parameter("integer_datetimes"), Some("on"));

    let ident = session.identify_system().await?;
    info!(system_id = %ident.system_id, timeline = ident.timeline, "identified");
    anyhow::ensure!(ident.timeline >= 1, "timeline {}", ident.timeline);
    anyhow::ensure!(!ident.xlog_pos.is_zero());

    anyhow::ensure!(session.slot_info(SLOT).await?.is_none(), "slot exists too early");
    let created = session.create_slot(SLOT, "test_decoding", false).await?;
    info!(consistent_point = %created.consistent_point, "slot created");

    let info = session.slot_info(SLOT).await?.context("slot missing after create")?;
    assert_eq!(info.plugin.as_deref(), Some("test_decoding"));
    assert!(!info.active);

    let dup = session.create_slot(SLOT, "test_decoding", false).await;
    anyhow::ensure!(dup.as_ref().is_err_and(|e| e.is_slot()), "duplicate create: {dup:?}");
    session.close().await?;

    // 2) five committed transactions, streamed and acknowledged
    for id in 1..=5 {
        client
            .execute("INSERT INTO t(id, v) VALUES ($1, 'row')", &[&id])
            .await
            .context("insert")?;
    }

    let handler = CommitCollector {
        stop_after: 5,
        ..CommitCollector::default()
    };
    let mut engine = StreamEngine::new(cfg.clone(), handler);
    let end = tokio::time::timeout(Duration::from_secs(30), engine.run())
        .await
        .context("stream did not deliver five commits in time")??;
    assert_eq!(end, StreamEnd::Stopped);

    let collected = engine.into_handler();
    let inserts: Vec<_> = collected
        .lines
        .iter()
        .filter(|l| l.starts_with("table public.t: INSERT"))
        .collect();
    assert_eq!(inserts.len(), 5, "{:?}", collected.lines);
    for (i, line) in inserts.iter().enumerate() {
        assert!(line.contains(&format!("id[integer]:{}", i + 1)), "{line}");
    }
    assert!(collected.commits.windows(2).all(|w| w[0] < w[1]));

    let last_commit = *collected.commits.last().context("no commits")?;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let flushed = confirmed_flush(&client).await?.context("slot vanished")?;
        if flushed >= last_commit {
            info!(%flushed, %last_commit, "slot advanced");
            break;
        }
        anyhow::ensure!(
            Instant::now() < deadline,
            "confirmed_flush_lsn {flushed} never reached {last_commit}"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // 3) slot checks done before streaming
    let wrong_plugin = ReaderConfig::new(
        "127.0.0.1", "postgres", "postgres", "postgres", SLOT, "wal2json",
    )
    .with_port(host_port);
    let err = StreamEngine::new(wrong_plugin, CommitCollector::default())
        .run()
        .await
        .unwrap_err();
    anyhow::ensure!(err.is_slot(), "plugin mismatch: {err}");

    let mut missing = reader_config(host_port);
    missing.slot.name = "no_such_slot".into();
    let err = StreamEngine::new(missing, CommitCollector::default())
        .run()
        .await
        .unwrap_err();
    anyhow::ensure!(err.is_slot(), "missing slot: {err}");

    let mut created_on_demand = reader_config(host_port).with_create_slot(true);
    created_on_demand.slot.name = "itest_on_demand".into();
    let mut engine = StreamEngine::new(created_on_demand, CommitCollector::default());
    engine.start().await?;
    engine.stop();
    assert_eq!(engine.run().await?, StreamEnd::Stopped);

    // 4) cleanup
    let mut session = ReplicationSession::connect(&cfg).await?;
    session.drop_slot(SLOT, true).await?;
    session.drop_slot("itest_on_demand", true).await?;
    anyhow::ensure!(session.slot_info(SLOT).await?.is_none());
    session.close().await?;

    info!("integration test completed");
    Ok(())
}
