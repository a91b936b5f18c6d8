use std::collections::HashMap;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::auth;
use crate::config::{ReaderConfig, SlotConfig};
use crate::error::{ReaderError, Result};
use crate::lsn::Lsn;
use crate::protocol::framing::{
    read_backend_message, write_password_message, write_query, write_startup_message,
    write_terminate,
};
use crate::protocol::messages::{
    ErrorFields, QueryResult, parse_auth_request, parse_data_row, parse_parameter_status,
    parse_row_description,
};
use crate::protocol::BackendMessage;
use crate::tls::{MaybeTlsStream, connect_stream};

use super::postgres::PgTransport;

/// Row of `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: u32,
    pub xlog_pos: Lsn,
    pub dbname: Option<String>,
}

/// The parts of `pg_replication_slots` the reader cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot_name: String,
    pub plugin: Option<String>,
    pub active: bool,
    pub confirmed_flush_lsn: Option<Lsn>,
}

/// Row of `CREATE_REPLICATION_SLOT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSlot {
    pub slot_name: String,
    pub consistent_point: Lsn,
    pub snapshot_name: Option<String>,
    pub output_plugin: Option<String>,
}

/// An authenticated replication-mode connection that is not streaming yet.
///
/// Slot administration happens here; [`ReplicationSession::start_replication`]
/// consumes the session and turns it into a [`PgTransport`].
pub struct ReplicationSession {
    stream: MaybeTlsStream,
    buf: BytesMut,
    params: HashMap<String, String>,
}

impl ReplicationSession {
    /// TCP connect, optional TLS, startup with `replication=database`, auth.
    pub async fn connect(cfg: &ReaderConfig) -> Result<Self> {
        let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port)).await?;
        tcp.set_nodelay(true)?;
        let stream = connect_stream(tcp, &cfg.tls, &cfg.host).await?;

        let mut session = Self {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
            params: HashMap::new(),
        };
        session.startup(cfg).await?;
        session.check_integer_datetimes()?;
        info!(
            host = %cfg.host,
            port = cfg.port,
            database = %cfg.database,
            tls = session.stream.is_tls(),
            "replication session established"
        );
        Ok(session)
    }

    async fn startup(&mut self, cfg: &ReaderConfig) -> Result<()> {
        let params = [
            ("user", cfg.user.as_str()),
            ("database", cfg.database.as_str()),
            ("replication", "database"),
            ("client_encoding", "UTF8"),
            ("application_name", cfg.application_name.as_str()),
        ];
        write_startup_message(&mut self.stream, &params).await?;

        loop {
            let msg = self.next_message().await?;
            match msg.tag {
                b'R' => {
                    let (code, body) = parse_auth_request(&msg.payload)?;
                    match code {
                        auth::AUTH_OK => debug!("authenticated"),
                        auth::AUTH_CLEARTEXT => {
                            let p = auth::cleartext_password(&cfg.password);
                            write_password_message(&mut self.stream, &p).await?;
                        }
                        #[cfg(feature = "md5")]
                        auth::AUTH_MD5 => {
                            let salt: [u8; 4] = body.try_into().map_err(|_| {
                                ReaderError::MalformedFrame("md5 auth salt missing".into())
                            })?;
                            let p = auth::md5_password(&cfg.user, &cfg.password, &salt);
                            write_password_message(&mut self.stream, &p).await?;
                        }
                        auth::AUTH_SASL => self.sasl_exchange(&cfg.password, body).await?,
                        other => {
                            return Err(ReaderError::Auth(format!(
                                "unsupported auth method: {other}"
                            )));
                        }
                    }
                }
                b'E' => return Err(auth_failure(&msg)),
                b'K' => {} // BackendKeyData
                b'Z' => return Ok(()),
                _ => {}
            }
        }
    }

    /// Next AuthenticationRequest of a multi-step exchange, checked for `code`.
    #[cfg(feature = "scram")]
    async fn expect_auth(&mut self, code: i32) -> Result<bytes::Bytes> {
        let msg = self.next_message().await?;
        match msg.tag {
            b'R' => {
                let (got, _) = parse_auth_request(&msg.payload)?;
                if got != code {
                    return Err(ReaderError::Auth(format!(
                        "expected auth step {code}, server sent {got}"
                    )));
                }
                Ok(msg.payload.slice(4..))
            }
            b'E' => Err(auth_failure(&msg)),
            other => Err(ReaderError::MalformedFrame(format!(
                "unexpected message 0x{other:02x} during SASL exchange"
            ))),
        }
    }

    fn check_integer_datetimes(&self) -> Result<()> {
        match self.parameter("integer_datetimes") {
            Some("on") => Ok(()),
            other => Err(ReaderError::Server(format!(
                "server must use integer timestamps (integer_datetimes = {})",
                other.unwrap_or("unreported")
            ))),
        }
    }

    /// Server parameter reported during startup (e.g. `server_version`).
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Read the next message, absorbing ParameterStatus and NoticeResponse.
    async fn next_message(&mut self) -> Result<BackendMessage> {
        loop {
            let msg = read_backend_message(&mut self.stream, &mut self.buf).await?;
            match msg.tag {
                b'S' => {
                    let (k, v) = parse_parameter_status(&msg.payload)?;
                    self.params.insert(k, v);
                }
                b'N' => warn!(notice = %ErrorFields::parse(&msg.payload), "server notice"),
                _ => return Ok(msg),
            }
        }
    }

    /// Run one simple-protocol command and collect its text result.
    pub async fn simple_query(&mut self, sql: &str) -> Result<QueryResult> {
        debug!(%sql, "simple query");
        write_query(&mut self.stream, sql).await?;

        let mut result = QueryResult::default();
        let mut failure = None;
        loop {
            let msg = self.next_message().await?;
            match msg.tag {
                b'T' => result.columns = parse_row_description(&msg.payload)?,
                b'D' => result.rows.push(parse_data_row(&msg.payload)?),
                b'C' => {
                    let tag = msg.payload.strip_suffix(&[0]).unwrap_or(&msg.payload[..]);
                    result.command_tag = Some(String::from_utf8_lossy(tag).into_owned());
                }
                b'E' => failure = Some(ErrorFields::parse(&msg.payload)),
                b'I' => {} // EmptyQueryResponse
                b'Z' => break,
                other => {
                    return Err(ReaderError::MalformedFrame(format!(
                        "unexpected message 0x{other:02x} in query response"
                    )));
                }
            }
        }
        match failure {
            Some(fields) => Err(fields.into_error()),
            None => Ok(result),
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemIdentity> {
        let res = self.simple_query("IDENTIFY_SYSTEM").await?;
        let field = |name: &str| {
            res.first(name).ok_or_else(|| {
                ReaderError::MalformedFrame(format!("IDENTIFY_SYSTEM without {name}"))
            })
        };
        let timeline = field("timeline")?;
        let xlog_pos = field("xlogpos")?;
        Ok(SystemIdentity {
            system_id: field("systemid")?.to_string(),
            timeline: timeline.parse().map_err(|_| {
                ReaderError::MalformedFrame(format!("bad timeline {timeline:?}"))
            })?,
            xlog_pos: Lsn::parse(xlog_pos)
                .map_err(|e| ReaderError::MalformedFrame(e.to_string()))?,
            dbname: res.first("dbname").map(str::to_string),
        })
    }

    /// Look the slot up in `pg_replication_slots`. `None` if it does not exist.
    pub async fn slot_info(&mut self, name: &str) -> Result<Option<SlotInfo>> {
        let sql = format!(
            "SELECT slot_name, plugin, active, confirmed_flush_lsn \
             FROM pg_replication_slots WHERE slot_name = {}",
            quote_literal(name)
        );
        let res = self.simple_query(&sql).await?;
        if res.rows.len() > 1 {
            return Err(ReaderError::Slot(format!(
                "{} rows for slot {name:?}",
                res.rows.len()
            )));
        }
        if res.rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(SlotInfo {
            slot_name: res.first("slot_name").unwrap_or(name).to_string(),
            plugin: res.first("plugin").map(str::to_string),
            active: res.first("active") == Some("t"),
            confirmed_flush_lsn: res.first("confirmed_flush_lsn").and_then(|s| Lsn::parse(s).ok()),
        }))
    }

    pub async fn create_slot(
        &mut self,
        name: &str,
        plugin: &str,
        temporary: bool,
    ) -> Result<CreatedSlot> {
        info!(slot = name, plugin, temporary, "creating replication slot");
        let sql = format!(
            "CREATE_REPLICATION_SLOT {}{} LOGICAL {}",
            quote_ident(name),
            if temporary { " TEMPORARY" } else { "" },
            quote_ident(plugin)
        );
        let res = self.simple_query(&sql).await.map_err(slot_error)?;
        let point = res
            .first("consistent_point")
            .ok_or_else(|| ReaderError::Slot("CREATE_REPLICATION_SLOT returned no row".into()))?;
        Ok(CreatedSlot {
            slot_name: res.first("slot_name").unwrap_or(name).to_string(),
            consistent_point: Lsn::parse(point)
                .map_err(|e| ReaderError::MalformedFrame(e.to_string()))?,
            snapshot_name: res.first("snapshot_name").map(str::to_string),
            output_plugin: res.first("output_plugin").map(str::to_string),
        })
    }

    /// `wait` blocks until an active consumer of the slot goes away.
    pub async fn drop_slot(&mut self, name: &str, wait: bool) -> Result<()> {
        info!(slot = name, "dropping replication slot");
        let sql = format!(
            "DROP_REPLICATION_SLOT {}{}",
            quote_ident(name),
            if wait { " WAIT" } else { "" }
        );
        self.simple_query(&sql).await.map_err(slot_error)?;
        Ok(())
    }

    /// Make sure the slot exists and decodes with the expected plugin,
    /// creating it when the config allows.
    pub async fn ensure_slot(&mut self, slot: &SlotConfig) -> Result<()> {
        match self.slot_info(&slot.name).await? {
            None if slot.create_if_missing => {
                let created = self
                    .create_slot(&slot.name, &slot.plugin, slot.temporary)
                    .await?;
                info!(slot = %created.slot_name, at = %created.consistent_point, "slot created");
                Ok(())
            }
            None if slot.temporary => Err(ReaderError::Slot(format!(
                "temporary slot {:?} was dropped with its connection; \
                 unacknowledged changes cannot be replayed",
                slot.name
            ))),
            None => Err(ReaderError::Slot(format!(
                "replication slot {:?} does not exist",
                slot.name
            ))),
            Some(info) => match info.plugin.as_deref() {
                Some(p) if p != slot.plugin => Err(ReaderError::Slot(format!(
                    "slot {:?} uses plugin {p:?}, expected {:?}",
                    slot.name, slot.plugin
                ))),
                None => Err(ReaderError::Slot(format!(
                    "slot {:?} is a physical slot",
                    slot.name
                ))),
                Some(_) => {
                    if info.active {
                        warn!(slot = %slot.name, "slot is marked active; start may be refused");
                    }
                    Ok(())
                }
            },
        }
    }

    /// Issue `START_REPLICATION` and wait for CopyBothResponse.
    pub async fn start_replication(
        mut self,
        slot: &str,
        start: Lsn,
        options: &[(String, Option<String>)],
    ) -> Result<PgTransport> {
        let sql = start_replication_command(slot, start, options);
        info!(%slot, %start, "starting logical streaming");
        debug!(%sql, "start command");
        write_query(&mut self.stream, &sql).await?;

        loop {
            let msg = self.next_message().await?;
            match msg.tag {
                b'W' => break,
                b'E' => return Err(ErrorFields::parse(&msg.payload).into_error()),
                _ => continue,
            }
        }
        Ok(PgTransport::new(self.stream, self.buf))
    }

    /// Send Terminate and shut the socket.
    pub async fn close(mut self) -> Result<()> {
        let _ = write_terminate(&mut self.stream).await;
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(feature = "scram")]
impl ReplicationSession {
    async fn sasl_exchange(&mut self, password: &str, mechanisms: &[u8]) -> Result<()> {
        let offered = auth::sasl_mechanisms(mechanisms);
        if !offered.iter().any(|m| m == auth::scram::MECHANISM) {
            return Err(ReaderError::Auth(format!(
                "server does not offer SCRAM-SHA-256: {offered:?}"
            )));
        }
        let session = auth::ScramSession::new();
        write_password_message(&mut self.stream, &session.initial_response()).await?;

        let server_first = self.expect_auth(auth::AUTH_SASL_CONTINUE).await?;
        let fin = session.respond(password, &String::from_utf8_lossy(&server_first))?;
        write_password_message(&mut self.stream, fin.client_final.as_bytes()).await?;

        let server_final = self.expect_auth(auth::AUTH_SASL_FINAL).await?;
        fin.verify(&String::from_utf8_lossy(&server_final))?;
        debug!("SCRAM server signature verified");
        Ok(())
    }
}

#[cfg(not(feature = "scram"))]
impl ReplicationSession {
    async fn sasl_exchange(&mut self, _password: &str, _mechanisms: &[u8]) -> Result<()> {
        Err(ReaderError::Auth(
            "server requires SCRAM-SHA-256 but the scram feature is disabled".into(),
        ))
    }
}

fn auth_failure(msg: &BackendMessage) -> ReaderError {
    let fields = ErrorFields::parse(&msg.payload);
    // 28xxx: invalid authorization specification / invalid password
    if fields.code.as_deref().is_some_and(|c| c.starts_with("28")) {
        ReaderError::Auth(fields.to_string())
    } else {
        fields.into_error()
    }
}

/// Errors from slot commands are slot errors unless the link itself failed.
fn slot_error(err: ReaderError) -> ReaderError {
    match err {
        ReaderError::Server(msg) => ReaderError::Slot(msg),
        other => other,
    }
}

pub(crate) fn start_replication_command(
    slot: &str,
    start: Lsn,
    options: &[(String, Option<String>)],
) -> String {
    let mut sql = format!("START_REPLICATION SLOT {} LOGICAL {start}", quote_ident(slot));
    if !options.is_empty() {
        let rendered: Vec<String> = options
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{} {}", quote_ident(k), quote_literal(v)),
                None => quote_ident(k),
            })
            .collect();
        sql.push_str(" (");
        sql.push_str(&rendered.join(", "));
        sql.push(')');
    }
    sql
}

fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
