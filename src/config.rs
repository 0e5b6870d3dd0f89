use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::Ms;

/// Policy knobs for the scheduling core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Free-slot queries fetch bookings starting up to this far outside the
    /// query range on either side. Never negative.
    pub booking_pad_ms: Ms,
    /// Reject a second rule for the same subject and day of week.
    pub unique_rule_per_day: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            booking_pad_ms: 3_600_000,
            unique_rule_per_day: false,
        }
    }
}

/// Process configuration. Only the binary reads the environment; everything
/// else receives this struct (or a part of it) explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// Compact the WAL once this many events were appended since the last compaction.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7420,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
            metrics_port: None,
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.key, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Read `SLOTBOOK_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let booking_pad_ms: Ms = parse_or(&lookup, "SLOTBOOK_BOOKING_PAD_MS", d.scheduler.booking_pad_ms)?;
        if booking_pad_ms < 0 {
            return Err(ConfigError {
                key: "SLOTBOOK_BOOKING_PAD_MS",
                value: booking_pad_ms.to_string(),
            });
        }
        let metrics_port = match lookup("SLOTBOOK_METRICS_PORT") {
            Some(v) => Some(parse_value("SLOTBOOK_METRICS_PORT", v)?),
            None => None,
        };
        Ok(Self {
            bind: lookup("SLOTBOOK_BIND").unwrap_or(d.bind),
            port: parse_or(&lookup, "SLOTBOOK_PORT", d.port)?,
            data_dir: lookup("SLOTBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            max_connections: parse_or(&lookup, "SLOTBOOK_MAX_CONNECTIONS", d.max_connections)?,
            compact_threshold: parse_or(&lookup, "SLOTBOOK_COMPACT_THRESHOLD", d.compact_threshold)?,
            compact_interval: Duration::from_secs(parse_or(
                &lookup,
                "SLOTBOOK_COMPACT_INTERVAL_SECS",
                d.compact_interval.as_secs(),
            )?),
            metrics_port,
            scheduler: SchedulerConfig {
                booking_pad_ms,
                unique_rule_per_day: match lookup("SLOTBOOK_UNIQUE_RULE_PER_DAY") {
                    Some(v) => parse_bool("SLOTBOOK_UNIQUE_RULE_PER_DAY", v)?,
                    None => d.scheduler.unique_rule_per_day,
                },
            },
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError { key, value })
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(v) => parse_value(key, v),
        None => Ok(default),
    }
}

fn parse_bool(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError { key, value }),
    }
}
