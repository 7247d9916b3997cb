//! Event types for consumer and queue status listeners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BeanId, ConsumerStatus, Status};

/// Events emitted by a consumer for listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConsumerEvent {
    /// The consumer loop changed state (running, paused, stopped).
    ConsumerStatusChanged {
        queue_name: String,
        old_status: ConsumerStatus,
        new_status: ConsumerStatus,
        timestamp: DateTime<Utc>,
    },
    /// A bean was appended to the submission queue.
    BeanSubmitted {
        queue_name: String,
        bean_id: BeanId,
        timestamp: DateTime<Utc>,
    },
    /// A bean moved into the status set.
    BeanStarted {
        queue_name: String,
        bean_id: BeanId,
        timestamp: DateTime<Utc>,
    },
    /// A bean's status changed.
    BeanStatusChanged {
        queue_name: String,
        bean_id: BeanId,
        old_status: Status,
        new_status: Status,
        timestamp: DateTime<Utc>,
    },
    /// The submission queue was reordered or trimmed by an operator.
    QueueChanged {
        queue_name: String,
        pending: u64,
        timestamp: DateTime<Utc>,
    },
    /// The start-up sweep tidied the status set.
    CleanedUp {
        queue_name: String,
        removed: u64,
        failed: u64,
        timestamp: DateTime<Utc>,
    },
}

impl ConsumerEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ConsumerEvent::ConsumerStatusChanged { timestamp, .. } => *timestamp,
            ConsumerEvent::BeanSubmitted { timestamp, .. } => *timestamp,
            ConsumerEvent::BeanStarted { timestamp, .. } => *timestamp,
            ConsumerEvent::BeanStatusChanged { timestamp, .. } => *timestamp,
            ConsumerEvent::QueueChanged { timestamp, .. } => *timestamp,
            ConsumerEvent::CleanedUp { timestamp, .. } => *timestamp,
        }
    }

    /// Get the queue name associated with this event.
    pub fn queue_name(&self) -> &str {
        match self {
            ConsumerEvent::ConsumerStatusChanged { queue_name, .. }
            | ConsumerEvent::BeanSubmitted { queue_name, .. }
            | ConsumerEvent::BeanStarted { queue_name, .. }
            | ConsumerEvent::BeanStatusChanged { queue_name, .. }
            | ConsumerEvent::QueueChanged { queue_name, .. }
            | ConsumerEvent::CleanedUp { queue_name, .. } => queue_name,
        }
    }

    /// Get the bean ID associated with this event, if any.
    pub fn bean_id(&self) -> Option<BeanId> {
        match self {
            ConsumerEvent::BeanSubmitted { bean_id, .. } => Some(*bean_id),
            ConsumerEvent::BeanStarted { bean_id, .. } => Some(*bean_id),
            ConsumerEvent::BeanStatusChanged { bean_id, .. } => Some(*bean_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            ConsumerEvent::ConsumerStatusChanged {
                queue_name,
                new_status,
                ..
            } => format!("Consumer {} -> {}", queue_name, new_status),
            ConsumerEvent::BeanSubmitted { bean_id, .. } => format!("Bean {} submitted", bean_id),
            ConsumerEvent::BeanStarted { bean_id, .. } => format!("Bean {} started", bean_id),
            ConsumerEvent::BeanStatusChanged {
                bean_id,
                new_status,
                ..
            } => format!("Bean {} -> {}", bean_id, new_status),
            ConsumerEvent::QueueChanged {
                queue_name,
                pending,
                ..
            } => format!("Queue {} changed: {} pending", queue_name, pending),
            ConsumerEvent::CleanedUp {
                queue_name,
                removed,
                failed,
                ..
            } => format!(
                "Queue {} cleaned up: {} removed, {} failed",
                queue_name, removed, failed
            ),
        }
    }
}
