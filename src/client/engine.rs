use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::flow::{FeedbackState, FlowController};
use super::handler::{Event, EventHandler, Keepalive, StreamContext};
use crate::config::{ReaderConfig, RetryPolicy};
use crate::error::{ReaderError, Result};
use crate::lsn::Lsn;
use crate::protocol::{ReplicationMessage, decode, pg_now_micros};
use crate::transport::{ConnectionState, Connector, PgConnector, Received, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Closing,
    Terminated,
}

/// Why [`StreamEngine::run`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// `stop()` was called, locally or from the handler.
    Stopped,
    /// The server ended the COPY stream.
    ServerDone,
}

/// Stops a running engine from any task or thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Idempotent. The engine notices within one poll interval.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Drives one logical replication stream into an [`EventHandler`].
///
/// ```ignore
/// let cfg = ReaderConfig::new("localhost", "postgres", "secret", "app", "my_slot", "test_decoding");
/// let mut engine = StreamEngine::new(cfg, MyHandler::default());
/// let stop = engine.stop_handle();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     stop.stop();
/// });
/// engine.run().await?;
/// ```
pub struct StreamEngine<C: Connector, H: EventHandler> {
    connector: C,
    handler: H,

    start_lsn: Option<Lsn>,
    poll_interval: Duration,
    status_interval: Duration,
    retry: RetryPolicy,

    state: EngineState,
    transport: Option<Box<dyn Transport>>,
    flow: FlowController,

    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl<H: EventHandler> StreamEngine<PgConnector, H> {
    /// Engine over a real PostgreSQL connection.
    pub fn new(cfg: ReaderConfig, handler: H) -> Self {
        let connector = PgConnector::new(cfg.clone());
        Self::with_connector(connector, handler, &cfg)
    }
}

impl<C: Connector, H: EventHandler> StreamEngine<C, H> {
    /// Engine over any [`Connector`]. Only the streaming knobs of `cfg`
    /// (start LSN, intervals, retry policy) are read here.
    pub fn with_connector(connector: C, handler: H, cfg: &ReaderConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            connector,
            handler,
            start_lsn: cfg.start_lsn,
            poll_interval: cfg.poll_interval,
            status_interval: cfg.status_interval,
            retry: cfg.retry,
            state: EngineState::Idle,
            transport: None,
            flow: FlowController::new(cfg.status_interval, Instant::now()),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn feedback(&self) -> &FeedbackState {
        self.flow.state()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Connect and start streaming. One attempt; on failure the engine
    /// stays [`EngineState::Idle`] and the error is returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != EngineState::Idle {
            return Err(ReaderError::Internal(format!(
                "start called in state {:?}",
                self.state
            )));
        }
        self.state = EngineState::Connecting;
        let lsn = self.flow.resume_lsn(self.start_lsn);
        info!(start_lsn = %lsn, "starting replication stream");

        match self.connector.connect(lsn).await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.flow = FlowController::new(self.status_interval, Instant::now());
                self.state = EngineState::Streaming;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "start failed");
                self.handler.on_error(&e).await;
                self.state = EngineState::Idle;
                Err(e)
            }
        }
    }

    /// Record an acknowledgment and report it to the server right away.
    ///
    /// While [`run`](Self::run) is active, acknowledge through
    /// [`StreamContext`] instead.
    pub async fn acknowledge(&mut self, lsn: Lsn) -> Result<()> {
        if self.flow.acknowledge(lsn) && self.state == EngineState::Streaming {
            self.send_status().await?;
        }
        Ok(())
    }

    /// Stream until stopped, the server finishes, or a fatal error.
    ///
    /// Starts the stream first if [`start`](Self::start) was not called.
    /// The transport is closed exactly once on the way out.
    pub async fn run(&mut self) -> Result<StreamEnd> {
        match self.state {
            EngineState::Idle => self.start().await?,
            EngineState::Streaming => {}
            other => {
                return Err(ReaderError::StreamTerminated(format!(
                    "engine cannot run from state {other:?}"
                )));
            }
        }

        let result = self.stream_loop().await;
        self.shutdown().await;

        match &result {
            Ok(end) => info!(?end, flushed = %self.flow.state().flushed_lsn, "stream ended"),
            Err(e) => error!(error = %e, "stream failed"),
        }
        result
    }

    async fn stream_loop(&mut self) -> Result<StreamEnd> {
        loop {
            if self.stop_requested() {
                return Ok(StreamEnd::Stopped);
            }
            let err = match self.step().await {
                Ok(Some(end)) => return Ok(end),
                Ok(None) => continue,
                Err(e) => e,
            };

            self.handler.on_error(&err).await;
            if !err.is_transient() || !self.link_lost() {
                return Err(err);
            }
            if let Some(end) = self.reconnect(err).await? {
                return Ok(end);
            }
        }
    }

    /// The transport has given up on its connection, so a new one is needed.
    fn link_lost(&self) -> bool {
        self.transport.as_ref().is_none_or(|t| {
            matches!(
                t.state(),
                ConnectionState::Failed | ConnectionState::Disconnected
            )
        })
    }

    /// One receive and its handling. `Some` ends the stream.
    async fn step(&mut self) -> Result<Option<StreamEnd>> {
        if self.flow.should_reply(None, Instant::now()) {
            self.send_status().await?;
        }
        let wait = self
            .flow
            .time_until_heartbeat(Instant::now())
            .map_or(self.poll_interval, |d| d.min(self.poll_interval));

        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ReaderError::Internal("streaming without a transport".into()))?;
        let received = tokio::select! {
            biased;
            _ = self.stop_rx.changed() => return Ok(Some(StreamEnd::Stopped)),
            r = transport.receive(wait) => r?,
        };

        let frame = match received {
            Received::Timeout => {
                if self.flow.should_reply(None, Instant::now()) {
                    self.send_status().await?;
                }
                return Ok(None);
            }
            Received::Frame(frame) => frame,
        };

        match decode(&frame)? {
            ReplicationMessage::XLogData {
                wal_start,
                wal_end,
                server_time_micros,
                data,
            } => {
                debug!(lsn = %wal_start, %wal_end, len = data.len(), "xlog data");
                self.flow.mark_received(wal_start);

                let mut ctx = StreamContext::for_event(wal_start);
                let event = Event {
                    lsn: wal_start,
                    wal_end,
                    server_time_micros,
                    payload: data,
                };
                self.handler
                    .on_event(event, &mut ctx)
                    .await
                    .map_err(|e| ReaderError::Callback(e.to_string()))?;

                if let Some(lsn) = ctx.take_ack()
                    && self.flow.acknowledge(lsn)
                {
                    self.send_status().await?;
                }
                if ctx.stop_requested() {
                    self.stop();
                }
                Ok(None)
            }
            ReplicationMessage::PrimaryKeepalive {
                wal_end,
                server_time_micros,
                reply_requested,
            } => {
                debug!(%wal_end, reply_requested, "keepalive");
                let keepalive = Keepalive {
                    server_wal_end: wal_end,
                    server_time_micros,
                    reply_requested,
                };
                self.flow.mark_received(wal_end);
                self.handler.on_keepalive(&keepalive).await;
                if self.flow.should_reply(Some(&keepalive), Instant::now()) {
                    self.send_status().await?;
                }
                Ok(None)
            }
            ReplicationMessage::CopyDone => {
                info!("server ended the stream");
                Ok(Some(StreamEnd::ServerDone))
            }
        }
    }

    async fn send_status(&mut self) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ReaderError::Internal("status update without a transport".into()))?;
        let update = self.flow.build_status_update(Instant::now(), pg_now_micros());
        debug!(
            write = %update.written,
            flush = %update.flushed,
            apply = %update.applied,
            "status update"
        );
        transport.send(&update.encode()).await
    }

    /// Back off and reconnect from the last acknowledged position.
    ///
    /// `Ok(None)` means streaming again, `Ok(Some(Stopped))` that a stop
    /// arrived while waiting.
    async fn reconnect(&mut self, cause: ReaderError) -> Result<Option<StreamEnd>> {
        self.state = EngineState::Reconnecting;
        if let Some(mut old) = self.transport.take() {
            let _ = old.close().await;
        }
        if self.retry.max_attempts == 0 {
            return Err(ReaderError::StreamTerminated(format!(
                "reconnect disabled: {cause}"
            )));
        }

        let mut last = cause;
        for attempt in 1..=self.retry.max_attempts {
            if self.stop_requested() {
                return Ok(Some(StreamEnd::Stopped));
            }
            let delay = self.retry.delay_for(attempt);
            let lsn = self.flow.resume_lsn(self.start_lsn);
            warn!(
                attempt,
                max_attempts = self.retry.max_attempts,
                ?delay,
                resume_lsn = %lsn,
                error = %last,
                "connection lost, reconnecting"
            );

            let connector = &self.connector;
            let connected = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => return Ok(Some(StreamEnd::Stopped)),
                r = async {
                    tokio::time::sleep(delay).await;
                    connector.connect(lsn).await
                } => r,
            };
            match connected {
                Ok(transport) => {
                    info!(attempt, resume_lsn = %lsn, "reconnected");
                    self.transport = Some(transport);
                    self.state = EngineState::Streaming;
                    return Ok(None);
                }
                Err(e) => {
                    self.handler.on_error(&e).await;
                    if !e.is_transient() {
                        return Err(e);
                    }
                    last = e;
                }
            }
        }

        Err(ReaderError::StreamTerminated(format!(
            "gave up after {} reconnect attempts: {last}",
            self.retry.max_attempts
        )))
    }

    async fn shutdown(&mut self) {
        self.state = EngineState::Closing;
        if let Some(mut transport) = self.transport.take()
            && let Err(e) = transport.close().await
        {
            warn!(error = %e, "close failed");
        }
        self.state = EngineState::Terminated;
    }
}
