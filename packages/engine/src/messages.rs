//! Message types for actor communication.

use queue_core::{
    Acknowledgement, Bean, BeanId, CommandBean, ConsumerEvent, ConsumerInfo, QueueSnapshot,
};
use ractor::RpcReplyPort;

use crate::config::ConsumerConfig;

/// Messages for the CommandActor.
#[derive(Debug)]
pub enum CommandMessage {
    /// Execute a command and acknowledge it on the ack topic.
    Execute {
        command: Box<CommandBean>,
        reply: Option<RpcReplyPort<Acknowledgement>>,
    },

    /// Stop the actor and its listener.
    Shutdown,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Create a queue and start its consumer.
    CreateQueue {
        config: Box<ConsumerConfig>,
        reply: RpcReplyPort<Result<ConsumerInfo, String>>,
    },

    /// Start a stopped consumer.
    StartQueue {
        name: String,
        reply: RpcReplyPort<Result<(), String>>,
    },

    /// Stop a consumer, waiting for its in-flight blocking process.
    StopQueue {
        name: String,
        reply: RpcReplyPort<Result<(), String>>,
    },

    /// Pause a queue.
    PauseQueue {
        name: String,
        reply: RpcReplyPort<Result<bool, String>>,
    },

    /// Resume a queue.
    ResumeQueue {
        name: String,
        reply: RpcReplyPort<Result<bool, String>>,
    },

    /// Submit a bean to a queue.
    Submit {
        queue: String,
        bean: Box<Bean>,
        reply: RpcReplyPort<Result<BeanId, String>>,
    },

    /// Run a command through the queue's command actor.
    Command {
        command: Box<CommandBean>,
        reply: RpcReplyPort<Acknowledgement>,
    },

    /// Get the contents of a queue.
    GetQueue {
        name: String,
        reply: RpcReplyPort<Option<QueueSnapshot>>,
    },

    /// Get a consumer's heartbeat record.
    GetConsumer {
        name: String,
        reply: RpcReplyPort<Option<ConsumerInfo>>,
    },

    /// List every consumer.
    ListQueues { reply: RpcReplyPort<Vec<ConsumerInfo>> },

    /// Stop a queue and forget it, deleting its persisted contents.
    DeleteQueue {
        name: String,
        reply: RpcReplyPort<Result<(), String>>,
    },

    /// Subscribe to events from every queue.
    Subscribe {
        sender: tokio::sync::broadcast::Sender<ConsumerEvent>,
    },

    /// Stop every queue.
    Shutdown,

    /// Periodic heartbeat.
    Tick,
}
