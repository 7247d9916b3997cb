//! Command channel messages and their acknowledgements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::BeanId;

/// Unique identifier correlating a command with its acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub Ulid);

impl CommandId {
    /// Create a new unique command ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Actions an operator can request on a queue or one of its beans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum QueueCommand {
    PauseQueue,
    ResumeQueue,
    StopConsumer,
    RestartConsumer,
    PauseJob { bean_id: BeanId },
    ResumeJob { bean_id: BeanId },
    TerminateJob { bean_id: BeanId },
    MoveForward { bean_id: BeanId },
    MoveBackward { bean_id: BeanId },
    Remove { bean_id: BeanId },
    ClearQueue,
    ClearCompleted,
    GetQueue,
    GetRunningAndCompleted,
}

impl QueueCommand {
    /// The bean this command targets, if it is a per-job command.
    pub fn bean_id(&self) -> Option<BeanId> {
        match self {
            QueueCommand::PauseJob { bean_id }
            | QueueCommand::ResumeJob { bean_id }
            | QueueCommand::TerminateJob { bean_id }
            | QueueCommand::MoveForward { bean_id }
            | QueueCommand::MoveBackward { bean_id }
            | QueueCommand::Remove { bean_id } => Some(*bean_id),
            _ => None,
        }
    }

    /// Short name of the action for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueCommand::PauseQueue => "pause-queue",
            QueueCommand::ResumeQueue => "resume-queue",
            QueueCommand::StopConsumer => "stop-consumer",
            QueueCommand::RestartConsumer => "restart-consumer",
            QueueCommand::PauseJob { .. } => "pause-job",
            QueueCommand::ResumeJob { .. } => "resume-job",
            QueueCommand::TerminateJob { .. } => "terminate-job",
            QueueCommand::MoveForward { .. } => "move-forward",
            QueueCommand::MoveBackward { .. } => "move-backward",
            QueueCommand::Remove { .. } => "remove",
            QueueCommand::ClearQueue => "clear-queue",
            QueueCommand::ClearCompleted => "clear-completed",
            QueueCommand::GetQueue => "get-queue",
            QueueCommand::GetRunningAndCompleted => "get-running-and-completed",
        }
    }
}

impl std::fmt::Display for QueueCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.bean_id() {
            Some(id) => write!(f, "{}({})", self.as_str(), id),
            None => f.write_str(self.as_str()),
        }
    }
}

/// A command addressed to one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandBean {
    pub message_id: CommandId,
    pub queue_name: String,
    pub command: QueueCommand,
    pub sent_at: DateTime<Utc>,
}

impl CommandBean {
    pub fn new(queue_name: impl Into<String>, command: QueueCommand) -> Self {
        Self {
            message_id: CommandId::new(),
            queue_name: queue_name.into(),
            command,
            sent_at: Utc::now(),
        }
    }
}

/// Result of executing a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The command took effect.
    Succeeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    /// Target was already in the requested state.
    NoOp,
    /// The command could not be carried out.
    Failed { error: String },
}

impl CommandOutcome {
    pub fn ok() -> Self {
        CommandOutcome::Succeeded { result: None }
    }

    pub fn with_result(result: serde_json::Value) -> Self {
        CommandOutcome::Succeeded {
            result: Some(result),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        CommandOutcome::Failed {
            error: error.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CommandOutcome::Failed { .. })
    }
}

/// Reply to a [`CommandBean`], correlated by message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub message_id: CommandId,
    pub queue_name: String,
    pub outcome: CommandOutcome,
    pub acknowledged_at: DateTime<Utc>,
}

impl Acknowledgement {
    pub fn new(command: &CommandBean, outcome: CommandOutcome) -> Self {
        Self {
            message_id: command.message_id,
            queue_name: command.queue_name.clone(),
            outcome,
            acknowledged_at: Utc::now(),
        }
    }
}
