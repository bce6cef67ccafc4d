use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

/// Process settings, read once at startup from `ROOMDESK_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Broker addresses. Empty means the in-process hub.
    pub brokers: Vec<String>,
    pub notify_topic: String,
    pub connect_retries: u32,
    pub connect_retry_delay: Duration,
    pub send_timeout: Duration,
    /// Offset used for notification timestamps.
    pub utc_offset: FixedOffset,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            brokers: Vec::new(),
            notify_topic: "booking-events".into(),
            connect_retries: 5,
            connect_retry_delay: Duration::from_millis(2000),
            send_timeout: Duration::from_millis(3000),
            utc_offset: Utc.fix(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(&format!("ROOMDESK_{name}")).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let utc_offset = parse(get("TZ_OFFSET_MINUTES"))
            .and_then(|minutes: i32| FixedOffset::east_opt(minutes.saturating_mul(60)))
            .unwrap_or(defaults.utc_offset);

        Self {
            port: parse(get("PORT")).unwrap_or(defaults.port),
            bind: get("BIND").unwrap_or(defaults.bind),
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            max_connections: parse(get("MAX_CONNECTIONS")).unwrap_or(defaults.max_connections),
            compact_threshold: parse(get("COMPACT_THRESHOLD")).unwrap_or(defaults.compact_threshold),
            metrics_port: parse(get("METRICS_PORT")),
            brokers: get("BROKERS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.brokers),
            notify_topic: get("NOTIFY_TOPIC").unwrap_or(defaults.notify_topic),
            connect_retries: parse(get("CONNECT_RETRIES")).unwrap_or(defaults.connect_retries),
            connect_retry_delay: parse(get("CONNECT_RETRY_DELAY_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_retry_delay),
            send_timeout: parse(get("SEND_TIMEOUT_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.send_timeout),
            utc_offset,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("rooms.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value?.trim().parse().ok()
}
