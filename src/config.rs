use std::path::PathBuf;
use std::time::Duration;

use crate::lsn::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub mode: SslMode,
    pub ca_pem_path: Option<PathBuf>,
    pub sni_hostname: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mode: SslMode::Disable,
            ca_pem_path: None,
            sni_hostname: None,
        }
    }
}

/// Slot the reader consumes.
#[derive(Debug, Clone)]
pub struct SlotConfig {
    pub name: String,
    /// Output plugin, e.g. `test_decoding`, `wal2json`, `pgoutput`.
    pub plugin: String,
    /// Create the slot when it does not exist yet instead of failing.
    pub create_if_missing: bool,
    /// Only with `create_if_missing`: the created slot vanishes with the session,
    /// so a lost connection cannot be resumed and ends the stream.
    pub temporary: bool,
}

/// Reconnect policy: exponential backoff from `initial_delay`, doubling,
/// capped at `max_delay`. `max_attempts == 0` disables reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << shift)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub host: String,
    pub port: u16,

    pub user: String,
    pub password: String,
    pub database: String,
    pub application_name: String,

    pub tls: TlsConfig,

    pub slot: SlotConfig,

    /// Options passed to the output plugin in `START_REPLICATION`, in order.
    /// A `None` value sends the bare option name.
    pub plugin_options: Vec<(String, Option<String>)>,

    /// Where to start streaming. `None` (or `0/0`) lets the server resume
    /// from the slot's confirmed flush position.
    pub start_lsn: Option<Lsn>,

    /// How long a single receive may block. Bounds how quickly `stop()` is
    /// observed.
    pub poll_interval: Duration,

    /// Heartbeat: send a standby status update at least this often even when
    /// nothing was acknowledged. Zero disables unsolicited updates.
    pub status_interval: Duration,

    /// Upper bound on TCP connect plus handshake.
    pub connect_timeout: Duration,

    pub retry: RetryPolicy,
}

impl ReaderConfig {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
        slot: impl Into<String>,
        plugin: impl Into<String>,
    ) -> Self {
        let mut cfg = Self {
            host: host.into(),
            user: user.into(),
            password: password.into(),
            database: database.into(),
            ..Self::default()
        };
        cfg.slot.name = slot.into();
        cfg.slot.plugin = plugin.into();
        cfg
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_plugin_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.plugin_options.push((key.into(), Some(value.into())));
        self
    }

    pub fn with_start_lsn(mut self, lsn: Lsn) -> Self {
        self.start_lsn = Some(lsn);
        self
    }

    pub fn with_create_slot(mut self, create: bool) -> Self {
        self.slot.create_if_missing = create;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "postgres".into(),
            password: String::new(),
            database: "postgres".into(),
            application_name: "pglogical-reader".into(),
            tls: TlsConfig::default(),

            slot: SlotConfig {
                name: "test_slot".into(),
                plugin: "test_decoding".into(),
                create_if_missing: false,
                temporary: false,
            },
            plugin_options: Vec::new(),
            start_lsn: None,

            poll_interval: Duration::from_secs(1),
            status_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_secs(1));
        assert_eq!(p.delay_for(3), Duration::from_secs(2));
        assert_eq!(p.delay_for(5), Duration::from_secs(8));
        assert_eq!(p.delay_for(6), Duration::from_secs(10));
        assert_eq!(p.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn builder_sets_slot_and_options() {
        let cfg = ReaderConfig::new("db", "u", "p", "app", "s1", "wal2json")
            .with_port(6432)
            .with_plugin_option("include-xids", "1")
            .with_create_slot(true);
        assert_eq!(cfg.host, "db");
        assert_eq!(cfg.port, 6432);
        assert_eq!(cfg.slot.name, "s1");
        assert_eq!(cfg.slot.plugin, "wal2json");
        assert!(cfg.slot.create_if_missing);
        assert_eq!(
            cfg.plugin_options,
            vec![("include-xids".to_string(), Some("1".to_string()))]
        );
        assert_eq!(cfg.start_lsn, None);
    }
}
