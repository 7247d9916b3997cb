//! Engine configuration with defaults and environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::correlator::ResponseType;
use crate::error::EngineError;

/// Configuration for one queue's consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Name of the queue the consumer drains.
    pub queue_name: String,
    /// Topic clients submit marshalled beans on.
    pub submit_topic: String,
    /// Topic carrying bean status updates.
    pub status_topic: String,
    /// Topic the command channel listens on.
    pub command_topic: String,
    /// Topic acknowledgements are published on.
    pub command_ack_topic: String,
    /// Topic carrying consumer state changes.
    pub queue_status_topic: String,
    /// Topic carrying consumer heartbeats.
    pub heartbeat_topic: String,
    /// Start paused if beans are already waiting.
    pub pause_on_start: bool,
    /// Run processes on the loop thread.
    pub blocking: bool,
    /// Running beans older than this are failed by the start-up sweep (seconds).
    pub running_age_secs: u64,
    /// Final beans older than this are dropped by the start-up sweep (seconds).
    pub completed_age_secs: u64,
    /// Interval between heartbeats (seconds).
    pub heartbeat_interval_secs: u64,
}

impl ConsumerConfig {
    /// Create a config for a queue, deriving every topic from its name.
    pub fn new(queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();
        Self {
            submit_topic: format!("{queue_name}.submit"),
            status_topic: format!("{queue_name}.status"),
            command_topic: format!("{queue_name}.command"),
            command_ack_topic: format!("{queue_name}.ack"),
            queue_status_topic: format!("{queue_name}.queue-status"),
            heartbeat_topic: format!("{queue_name}.heartbeat"),
            queue_name,
            pause_on_start: false,
            blocking: true,
            running_age_secs: 2 * 24 * 60 * 60,
            completed_age_secs: 7 * 24 * 60 * 60,
            heartbeat_interval_secs: 2,
        }
    }

    pub fn with_pause_on_start(mut self, pause_on_start: bool) -> Self {
        self.pause_on_start = pause_on_start;
        self
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn running_age(&self) -> Duration {
        Duration::from_secs(self.running_age_secs)
    }

    pub fn completed_age(&self) -> Duration {
        Duration::from_secs(self.completed_age_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Configuration for request/response correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// How many responses to collect.
    pub response_type: ResponseType,
    /// Initial wait before consulting the waiter (milliseconds).
    pub timeout_ms: u64,
}

impl CorrelatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            response_type: ResponseType::One,
            timeout_ms: 100,
        }
    }
}

/// Where queue contents are persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Nothing is persisted.
    #[default]
    Memory,
    /// One JSON file per queue under a directory.
    Json { dir: PathBuf },
    /// SurrealDB through the `db` crate.
    Surreal { endpoint: String },
}

/// Top-level configuration of a running engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Template for queues created without an explicit config.
    pub consumer: ConsumerConfig,
    pub correlator: CorrelatorConfig,
    pub store: StoreConfig,
    /// Archive a JSON snapshot of every bean when its process starts.
    pub snapshots: bool,
}

impl EngineConfig {
    /// Build a config from environment variables.
    ///
    /// Queue:
    /// - `BEAN_QUEUE` (default: `default`)
    /// - `BEAN_SUBMIT_TOPIC`, `BEAN_STATUS_TOPIC`, `BEAN_COMMAND_TOPIC`, `BEAN_ACK_TOPIC`,
    ///   `BEAN_QUEUE_STATUS_TOPIC`, `BEAN_HEARTBEAT_TOPIC` (default: derived from the queue name)
    /// - `BEAN_PAUSE_ON_START` (`true`/`false`, default: false)
    /// - `BEAN_BLOCKING` (`true`/`false`, default: true)
    /// - `BEAN_RUNNING_AGE_SECS`, `BEAN_COMPLETED_AGE_SECS`, `BEAN_HEARTBEAT_SECS`
    ///
    /// Correlator:
    /// - `BEAN_RESPONSE_TYPE` (`one` or `one-or-more`, default: `one`)
    /// - `BEAN_RESPONSE_TIMEOUT_MS` (default: 100)
    ///
    /// Store:
    /// - `BEAN_STORE` (`memory`, `json`, `surreal`, default: `memory`)
    /// - `BEAN_DATA_DIR` (default: `./data/queues`)
    /// - `BEAN_DB_ENDPOINT` (default: `mem://`)
    /// - `BEAN_SNAPSHOTS` (`true`/`false`, default: false)
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).and_then(non_empty);

        let queue_name = get("BEAN_QUEUE").unwrap_or_else(|| "default".to_string());
        let mut consumer = ConsumerConfig::new(queue_name);

        if let Some(topic) = get("BEAN_SUBMIT_TOPIC") {
            consumer.submit_topic = topic;
        }
        if let Some(topic) = get("BEAN_STATUS_TOPIC") {
            consumer.status_topic = topic;
        }
        if let Some(topic) = get("BEAN_COMMAND_TOPIC") {
            consumer.command_topic = topic;
        }
        if let Some(topic) = get("BEAN_ACK_TOPIC") {
            consumer.command_ack_topic = topic;
        }
        if let Some(topic) = get("BEAN_QUEUE_STATUS_TOPIC") {
            consumer.queue_status_topic = topic;
        }
        if let Some(topic) = get("BEAN_HEARTBEAT_TOPIC") {
            consumer.heartbeat_topic = topic;
        }
        if let Some(v) = parse_bool("BEAN_PAUSE_ON_START", get("BEAN_PAUSE_ON_START"))? {
            consumer.pause_on_start = v;
        }
        if let Some(v) = parse_bool("BEAN_BLOCKING", get("BEAN_BLOCKING"))? {
            consumer.blocking = v;
        }
        if let Some(v) = parse_u64("BEAN_RUNNING_AGE_SECS", get("BEAN_RUNNING_AGE_SECS"))? {
            consumer.running_age_secs = v;
        }
        if let Some(v) = parse_u64("BEAN_COMPLETED_AGE_SECS", get("BEAN_COMPLETED_AGE_SECS"))? {
            consumer.completed_age_secs = v;
        }
        if let Some(v) = parse_u64("BEAN_HEARTBEAT_SECS", get("BEAN_HEARTBEAT_SECS"))? {
            consumer.heartbeat_interval_secs = v;
        }

        let mut correlator = CorrelatorConfig::default();
        match get("BEAN_RESPONSE_TYPE").map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("one") => {}
            Some("one-or-more") | Some("one_or_more") => {
                correlator.response_type = ResponseType::OneOrMore
            }
            Some(other) => {
                return Err(EngineError::Internal(format!(
                    "unsupported BEAN_RESPONSE_TYPE={other} (expected one|one-or-more)"
                )));
            }
        }
        if let Some(v) = parse_u64("BEAN_RESPONSE_TIMEOUT_MS", get("BEAN_RESPONSE_TIMEOUT_MS"))? {
            correlator.timeout_ms = v;
        }

        let store = match get("BEAN_STORE").as_deref() {
            None | Some("memory") | Some("mem") => StoreConfig::Memory,
            Some("json") | Some("file") => StoreConfig::Json {
                dir: get("BEAN_DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/queues")),
            },
            Some("surreal") | Some("surrealdb") => StoreConfig::Surreal {
                endpoint: get("BEAN_DB_ENDPOINT").unwrap_or_else(|| "mem://".to_string()),
            },
            Some(other) => {
                return Err(EngineError::Internal(format!(
                    "unsupported BEAN_STORE={other} (expected memory|json|surreal)"
                )));
            }
        };

        let snapshots = parse_bool("BEAN_SNAPSHOTS", get("BEAN_SNAPSHOTS"))?.unwrap_or(false);

        Ok(Self {
            consumer,
            correlator,
            store,
            snapshots,
        })
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_bool(var_name: &str, value: Option<String>) -> Result<Option<bool>, EngineError> {
    let Some(v) = value else {
        return Ok(None);
    };
    let parsed = match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => true,
        "0" | "false" | "no" | "n" => false,
        _ => {
            return Err(EngineError::Internal(format!(
                "invalid boolean for {var_name}={v} (expected true/false)"
            )));
        }
    };
    Ok(Some(parsed))
}

fn parse_u64(var_name: &str, value: Option<String>) -> Result<Option<u64>, EngineError> {
    value
        .map(|v| {
            v.parse::<u64>().map_err(|e| {
                EngineError::Internal(format!("invalid number for {var_name}={v}: {e}"))
            })
        })
        .transpose()
}
