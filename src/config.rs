//! Configuration management
//!
//! All settings come from environment variables with validation up front, so
//! a misconfigured agent dies before any replication progress is confirmed.
//! Stream routes are structured and arrive as JSON, either inline in
//! `STREAMS` or from the file named by `STREAMS_FILE`.

use crate::errors::{ReplicationError, ReplicationResult};
use crate::event::ChangeEvent;
use crate::lsn::Lsn;
use serde::Deserialize;
use std::env;
use std::fs;

pub const DEFAULT_SLOT_NAME: &str = "cdc_slot";
pub const DEFAULT_PUBLICATION_NAME: &str = "cdc_pub";

const OPERATIONS: [&str; 3] = ["INSERT", "UPDATE", "DELETE"];

/// Complete agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub streams: Vec<StreamRoute>,
    pub tuning: BatchTuning,
}

/// PostgreSQL side
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub connection_string: String,
    pub slot_name: String,
    pub publication_name: String,
    pub tables: Vec<String>,
    pub start_lsn: Lsn,
}

/// Kafka side
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub brokers: Vec<String>,
}

/// One event route from a source table to a destination topic
#[derive(Debug, Clone, Deserialize)]
pub struct StreamRoute {
    pub source_table: String,
    /// Operation names, matched case-insensitively
    pub operations: Vec<String>,
    pub destination_topic: String,
    /// Field whose value becomes the partition key; the table name is used
    /// when absent or when the row does not carry the field
    #[serde(default)]
    pub routing_key_field: Option<String>,
}

impl StreamRoute {
    pub fn matches(&self, change: &ChangeEvent) -> bool {
        self.source_table == change.meta.resource
            && self
                .operations
                .iter()
                .any(|op| op.eq_ignore_ascii_case(change.op.as_str()))
    }
}

/// Runtime tunables with recommended defaults
#[derive(Debug, Clone, Copy)]
pub struct BatchTuning {
    pub batch_size: usize,
    pub batch_wait_ms: u64,
    pub flush_timeout_ms: u64,
    pub flush_interval_secs: u64,
}

impl Default for BatchTuning {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            batch_wait_ms: 100,
            flush_timeout_ms: 5000,
            flush_interval_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// # Environment Variables
    ///
    /// Required:
    /// - `DATABASE_URL`: libpq-style connection string
    /// - `TABLES`: comma-separated tables for the publication
    /// - `KAFKA_BROKERS`: comma-separated broker addresses
    /// - `STREAMS` (inline JSON) or `STREAMS_FILE` (path to JSON file)
    ///
    /// Optional (with defaults):
    /// - `SLOT_NAME` (default `cdc_slot`), `PUBLICATION_NAME` (default `cdc_pub`)
    /// - `START_LSN` (default `0/0`, resuming from the slot position)
    /// - `BATCH_SIZE`, `BATCH_WAIT_MS`, `FLUSH_TIMEOUT_MS`, `FLUSH_INTERVAL_SECS`
    pub fn from_env(streams_file_override: Option<&str>) -> ReplicationResult<Self> {
        let connection_string = required("DATABASE_URL")?;
        let slot_name = env::var("SLOT_NAME").unwrap_or_else(|_| DEFAULT_SLOT_NAME.to_string());
        let publication_name =
            env::var("PUBLICATION_NAME").unwrap_or_else(|_| DEFAULT_PUBLICATION_NAME.to_string());
        let tables = split_list(&required("TABLES")?);
        let brokers = split_list(&required("KAFKA_BROKERS")?);

        let start_lsn = match env::var("START_LSN") {
            Ok(raw) => raw.parse().map_err(|_| {
                ReplicationError::config(format!("START_LSN '{raw}' is not a valid LSN"))
            })?,
            Err(_) => Lsn::INVALID,
        };

        let streams = load_streams(streams_file_override)?;

        let tuning = BatchTuning {
            batch_size: numeric("BATCH_SIZE", 5000)?,
            batch_wait_ms: numeric("BATCH_WAIT_MS", 100)?,
            flush_timeout_ms: numeric("FLUSH_TIMEOUT_MS", 5000)?,
            flush_interval_secs: numeric("FLUSH_INTERVAL_SECS", 10)?,
        };

        let config = Self {
            source: SourceConfig {
                connection_string,
                slot_name,
                publication_name,
                tables,
                start_lsn,
            },
            sink: SinkConfig { brokers },
            streams,
            tuning,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate every field; called by `from_env`, public for tests and for
    /// configs built by hand.
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.source.connection_string.trim().is_empty() {
            return Err(ReplicationError::config("DATABASE_URL cannot be empty"));
        }
        validate_identifier(&self.source.slot_name, "slot name")?;
        validate_identifier(&self.source.publication_name, "publication name")?;

        if self.source.tables.is_empty() {
            return Err(ReplicationError::config(
                "TABLES must name at least one table",
            ));
        }
        for table in &self.source.tables {
            validate_table_name(table)?;
        }
        if self.sink.brokers.is_empty() {
            return Err(ReplicationError::config(
                "KAFKA_BROKERS must name at least one broker",
            ));
        }
        if self.streams.is_empty() {
            return Err(ReplicationError::config(
                "at least one stream route is required",
            ));
        }
        for route in &self.streams {
            route.validate()?;
        }
        Ok(())
    }
}

impl StreamRoute {
    fn validate(&self) -> ReplicationResult<()> {
        if self.source_table.trim().is_empty() {
            return Err(ReplicationError::config(
                "stream route source_table cannot be empty",
            ));
        }
        if self.destination_topic.trim().is_empty() {
            return Err(ReplicationError::config(format!(
                "stream route for '{}' has an empty destination_topic",
                self.source_table
            )));
        }
        if self.operations.is_empty() {
            return Err(ReplicationError::config(format!(
                "stream route for '{}' lists no operations",
                self.source_table
            )));
        }
        for op in &self.operations {
            if !OPERATIONS.iter().any(|known| known.eq_ignore_ascii_case(op)) {
                return Err(ReplicationError::config(format!(
                    "stream route for '{}' has unknown operation '{}'",
                    self.source_table, op
                )));
            }
        }
        Ok(())
    }
}

/// PostgreSQL identifier rules: non-empty, alphanumeric + underscore, at
/// most 63 characters.
fn validate_identifier(name: &str, what: &str) -> ReplicationResult<()> {
    if name.trim().is_empty() {
        return Err(ReplicationError::config(format!("{what} cannot be empty")));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ReplicationError::config(format!(
            "{what} can only contain alphanumeric characters and underscores"
        )));
    }
    if name.len() > 63 {
        return Err(ReplicationError::config(format!(
            "{what} cannot be longer than 63 characters"
        )));
    }
    Ok(())
}

/// Table names may be schema-qualified (`public.users`); each dotted part
/// follows the identifier rules. Anything stranger fails here rather than as
/// a server-side SQL error from `CREATE PUBLICATION`.
fn validate_table_name(name: &str) -> ReplicationResult<()> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(ReplicationError::config(format!(
            "table name '{name}' has too many qualifiers"
        )));
    }
    for part in parts {
        validate_identifier(part, "table name")?;
    }
    Ok(())
}

fn required(key: &str) -> ReplicationResult<String> {
    env::var(key)
        .map_err(|_| ReplicationError::config(format!("missing required {key} environment variable")))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

fn numeric<T: std::str::FromStr>(key: &str, default: T) -> ReplicationResult<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ReplicationError::config(format!("{key} '{raw}' is not a valid number"))),
        Err(_) => Ok(default),
    }
}

fn load_streams(file_override: Option<&str>) -> ReplicationResult<Vec<StreamRoute>> {
    let file = file_override
        .map(String::from)
        .or_else(|| env::var("STREAMS_FILE").ok());

    let raw = match file {
        Some(path) => fs::read_to_string(&path).map_err(|err| {
            ReplicationError::config(format!("cannot read streams file '{path}': {err}"))
        })?,
        None => required("STREAMS").map_err(|_| {
            ReplicationError::config("either STREAMS or STREAMS_FILE must be provided")
        })?,
    };

    parse_streams(&raw)
}

fn parse_streams(raw: &str) -> ReplicationResult<Vec<StreamRoute>> {
    serde_json::from_str(raw)
        .map_err(|err| ReplicationError::config(format!("invalid stream routes: {err}")))
}
