use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use super::session::ReplicationSession;
use super::{ConnectionState, Connector, Received, Transport};
use crate::config::ReaderConfig;
use crate::error::{ReaderError, Result};
use crate::lsn::Lsn;
use crate::protocol::ErrorFields;
use crate::protocol::framing::{
    read_backend_message, write_copy_data, write_copy_done, write_terminate,
};
use crate::tls::MaybeTlsStream;

/// Upper bound on the CopyDone/Terminate/shutdown sequence of `close`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection in CopyBoth mode.
pub struct PgTransport {
    stream: MaybeTlsStream,
    buf: BytesMut,
    state: ConnectionState,
}

impl PgTransport {
    pub(super) fn new(stream: MaybeTlsStream, buf: BytesMut) -> Self {
        Self {
            stream,
            buf,
            state: ConnectionState::Streaming,
        }
    }

    fn fail(&mut self, err: ReaderError) -> ReaderError {
        self.state = ConnectionState::Failed;
        err
    }
}

#[async_trait]
impl Transport for PgTransport {
    async fn receive(&mut self, wait: Duration) -> Result<Received> {
        if self.state != ConnectionState::Streaming {
            return Err(ReaderError::Connection(format!(
                "receive on {:?} connection",
                self.state
            )));
        }
        let deadline = Instant::now() + wait;
        loop {
            let msg = match timeout_at(
                deadline,
                read_backend_message(&mut self.stream, &mut self.buf),
            )
            .await
            {
                Err(_elapsed) => return Ok(Received::Timeout),
                Ok(Err(e)) => return Err(self.fail(e)),
                Ok(Ok(msg)) => msg,
            };
            match msg.tag {
                b'E' => {
                    let err = ErrorFields::parse(&msg.payload).into_error();
                    return Err(self.fail(err));
                }
                b'N' => warn!(notice = %ErrorFields::parse(&msg.payload), "server notice"),
                b'S' => debug!("parameter status during streaming"),
                _ => return Ok(Received::Frame(msg)),
            }
        }
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.state != ConnectionState::Streaming {
            return Err(ReaderError::Connection(format!(
                "send on {:?} connection",
                self.state
            )));
        }
        match write_copy_data(&mut self.stream, payload).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Disconnected
        ) {
            return Ok(());
        }
        let was_streaming = self.state == ConnectionState::Streaming;
        self.state = ConnectionState::Closing;
        let stream = &mut self.stream;
        let teardown = async move {
            if was_streaming {
                // best effort: the socket may already be gone
                let _ = write_copy_done(&mut *stream).await;
                let _ = write_terminate(&mut *stream).await;
            }
            let _ = stream.shutdown().await;
        };
        if timeout(CLOSE_TIMEOUT, teardown).await.is_err() {
            warn!(after = ?CLOSE_TIMEOUT, "peer not draining, dropping the connection");
        }
        self.state = ConnectionState::Disconnected;
        debug!("replication connection closed");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

/// Opens real replication connections from a [`ReaderConfig`].
///
/// A temporary slot is created at most once: it dies with the connection
/// that streamed from it, and a new one would start past the changes that
/// were never acknowledged. Reconnects then fail with a slot error.
#[derive(Debug, Clone)]
pub struct PgConnector {
    cfg: ReaderConfig,
    streamed: Arc<AtomicBool>,
}

impl PgConnector {
    pub fn new(cfg: ReaderConfig) -> Self {
        Self {
            cfg,
            streamed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.cfg
    }

    async fn open(&self, start_lsn: Lsn) -> Result<PgTransport> {
        let mut session = ReplicationSession::connect(&self.cfg).await?;
        let ident = session.identify_system().await?;
        info!(
            system_id = %ident.system_id,
            timeline = ident.timeline,
            server_pos = %ident.xlog_pos,
            "identified system"
        );
        let mut slot = self.cfg.slot.clone();
        if slot.temporary && self.streamed.load(Ordering::Acquire) {
            slot.create_if_missing = false;
        }
        session.ensure_slot(&slot).await?;
        let transport = session
            .start_replication(&slot.name, start_lsn, &self.cfg.plugin_options)
            .await?;
        self.streamed.store(true, Ordering::Release);
        Ok(transport)
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, start_lsn: Lsn) -> Result<Box<dyn Transport>> {
        let transport = timeout(self.cfg.connect_timeout, self.open(start_lsn))
            .await
            .map_err(|_| {
                ReaderError::Connection(format!(
                    "connect timed out after {:?}",
                    self.cfg.connect_timeout
                ))
            })??;
        Ok(Box::new(transport))
    }
}
