//! Queue-level types: consumer state, queue snapshots and heartbeat info.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{Bean, BeanId};

/// Unique identifier for a consumer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(pub Ulid);

impl ConsumerId {
    /// Create a new unique consumer ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current operational state of a queue's consumer loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerStatus {
    /// Loop thread not running.
    #[default]
    Stopped,
    /// Loop is dequeuing and running beans.
    Running,
    /// Loop is alive but will not dequeue the next bean.
    Paused,
}

impl std::fmt::Display for ConsumerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerStatus::Stopped => write!(f, "stopped"),
            ConsumerStatus::Running => write!(f, "running"),
            ConsumerStatus::Paused => write!(f, "paused"),
        }
    }
}

/// A consistent copy of both bean collections of a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSnapshot {
    /// Pending beans in priority order.
    pub submitted: Vec<Bean>,
    /// Running and finished beans.
    pub status_set: Vec<Bean>,
}

impl QueueSnapshot {
    /// Check if the bean is pending.
    pub fn is_submitted(&self, id: BeanId) -> bool {
        self.submitted.iter().any(|b| b.id == id)
    }

    /// Check if the bean has left the submission queue.
    pub fn in_status_set(&self, id: BeanId) -> bool {
        self.status_set.iter().any(|b| b.id == id)
    }

    /// Total number of beans known to the queue.
    pub fn len(&self) -> usize {
        self.submitted.len() + self.status_set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Heartbeat and status record describing one live consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    /// Unique identifier for this consumer instance.
    pub consumer_id: ConsumerId,
    /// Name of the queue the consumer drains.
    pub queue_name: String,
    /// Current state of the loop.
    pub status: ConsumerStatus,
    /// When the consumer was last started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Last time the consumer reported itself alive.
    pub last_alive: DateTime<Utc>,
    /// Host running the consumer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    /// Pending bean count at the time of the report.
    #[serde(default)]
    pub pending: u64,
    /// Beans currently executing.
    #[serde(default)]
    pub running: u64,
}

impl ConsumerInfo {
    /// Create a new stopped consumer record for a queue.
    pub fn new(consumer_id: ConsumerId, queue_name: impl Into<String>) -> Self {
        Self {
            consumer_id,
            queue_name: queue_name.into(),
            status: ConsumerStatus::Stopped,
            start_time: None,
            last_alive: Utc::now(),
            host_name: None,
            pending: 0,
            running: 0,
        }
    }

    /// Check if the consumer loop is alive.
    pub fn is_alive(&self) -> bool {
        !matches!(self.status, ConsumerStatus::Stopped)
    }
}
