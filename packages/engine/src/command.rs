//! Command channel: dispatch, the per-queue command actor, its transport
//! listener, and a client that waits for acknowledgements.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use queue_core::{Acknowledgement, CommandBean, CommandOutcome, ConsumerStatus, QueueCommand};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::config::ConsumerConfig;
use crate::consumer::Consumer;
use crate::correlator::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::marshaller::{JsonMarshaller, Marshaller};
use crate::messages::CommandMessage;
use crate::transport::Transport;

/// How long the listener blocks before checking for shutdown.
const LISTEN_POLL: Duration = Duration::from_millis(50);

/// Default wait for an acknowledgement.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

fn changed(result: EngineResult<bool>) -> CommandOutcome {
    match result {
        Ok(true) => CommandOutcome::ok(),
        Ok(false) => CommandOutcome::NoOp,
        Err(e) => CommandOutcome::failed(e.to_string()),
    }
}

fn listed<T: serde::Serialize>(items: &T) -> CommandOutcome {
    match serde_json::to_value(items) {
        Ok(value) => CommandOutcome::with_result(value),
        Err(e) => CommandOutcome::failed(e.to_string()),
    }
}

/// Carry out a command against a consumer. Blocks for stop and restart.
pub fn execute(consumer: &Consumer, command: QueueCommand) -> CommandOutcome {
    let queue = consumer.queue();
    match command {
        QueueCommand::PauseQueue => match consumer.status() {
            ConsumerStatus::Running => changed(Ok(consumer.pause())),
            ConsumerStatus::Paused => CommandOutcome::NoOp,
            ConsumerStatus::Stopped => CommandOutcome::failed("Consumer is stopped"),
        },
        QueueCommand::ResumeQueue => match consumer.status() {
            ConsumerStatus::Paused => changed(Ok(consumer.resume())),
            ConsumerStatus::Running => CommandOutcome::NoOp,
            ConsumerStatus::Stopped => CommandOutcome::failed("Consumer is stopped"),
        },
        QueueCommand::StopConsumer => {
            if consumer.status() == ConsumerStatus::Stopped {
                return CommandOutcome::NoOp;
            }
            changed(consumer.stop().map(|()| true))
        }
        QueueCommand::RestartConsumer => changed(consumer.restart().map(|()| true)),
        QueueCommand::PauseJob { bean_id } => changed(consumer.pause_job(bean_id)),
        QueueCommand::ResumeJob { bean_id } => changed(consumer.resume_job(bean_id)),
        QueueCommand::TerminateJob { bean_id } => changed(consumer.terminate_job(bean_id)),
        QueueCommand::MoveForward { bean_id } => changed(Ok(queue.move_forward(bean_id))),
        QueueCommand::MoveBackward { bean_id } => changed(Ok(queue.move_backward(bean_id))),
        QueueCommand::Remove { bean_id } => changed(Ok(queue.remove(bean_id))),
        QueueCommand::ClearQueue => listed(&serde_json::json!({ "removed": queue.clear_queue() })),
        QueueCommand::ClearCompleted => listed(&serde_json::json!({
            "removed": queue.clear_running_and_completed()
        })),
        QueueCommand::GetQueue => listed(&queue.submitted()),
        QueueCommand::GetRunningAndCompleted => listed(&queue.running_and_completed()),
    }
}

/// Reads commands from the command topic and hands them to the command actor.
pub struct CommandListener {
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl CommandListener {
    pub fn spawn(
        config: &ConsumerConfig,
        transport: Arc<dyn Transport>,
        marshaller: Arc<dyn Marshaller>,
        actor: ActorRef<CommandMessage>,
    ) -> EngineResult<Self> {
        let subscription = transport.subscribe(&config.command_topic)?;
        let queue_name = config.queue_name.clone();
        let stop = CancelToken::new();
        let token = stop.clone();

        let handle = thread::Builder::new()
            .name(format!("commands-{}", queue_name))
            .spawn(move || {
                while !token.is_cancelled() {
                    let text = match subscription.recv_timeout(LISTEN_POLL) {
                        Ok(Some(text)) => text,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!("Command listener for {} stopped: {}", queue_name, e);
                            break;
                        }
                    };
                    let command: CommandBean = match marshaller.unmarshal(&text) {
                        Ok(command) => command,
                        Err(e) => {
                            tracing::warn!("Ignoring malformed command for {}: {}", queue_name, e);
                            continue;
                        }
                    };
                    if command.queue_name != queue_name {
                        continue;
                    }
                    let message = CommandMessage::Execute {
                        command: Box::new(command),
                        reply: None,
                    };
                    if actor.send_message(message).is_err() {
                        tracing::debug!("Command actor for {} is gone", queue_name);
                        break;
                    }
                }
            })
            .map_err(|e| EngineError::Internal(format!("Could not start command listener: {}", e)))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CommandListener {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Arguments for a [`CommandActor`].
pub struct CommandActorArgs {
    pub consumer: Arc<Consumer>,
    pub transport: Arc<dyn Transport>,
    pub marshaller: Arc<dyn Marshaller>,
}

/// Publishes acknowledgements on the queue's ack topic.
#[derive(Clone)]
struct Acknowledger {
    transport: Arc<dyn Transport>,
    marshaller: Arc<dyn Marshaller>,
    topic: String,
}

impl Acknowledger {
    fn send(&self, ack: &Acknowledgement) {
        let sent = self
            .marshaller
            .marshal(ack)
            .and_then(|text| self.transport.send(&self.topic, text));
        if let Err(e) = sent {
            tracing::warn!("Failed to acknowledge {} on {}: {}", ack.message_id, self.topic, e);
        }
    }
}

/// State for the command actor.
pub struct CommandActorState {
    consumer: Arc<Consumer>,
    acks: Acknowledger,
    listener: Option<CommandListener>,
}

/// Executes commands for one queue and acknowledges each.
///
/// Commands run one at a time, except stop and restart: they wait for the
/// running bean, so they complete in the background while later commands
/// (resume or terminate that bean) are still served.
pub struct CommandActor;

impl Actor for CommandActor {
    type Msg = CommandMessage;
    type State = CommandActorState;
    type Arguments = CommandActorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting command actor for {}", args.consumer.name());
        let listener = CommandListener::spawn(
            args.consumer.config(),
            args.transport.clone(),
            args.marshaller.clone(),
            myself,
        )
        .map_err(|e| ActorProcessingErr::from(e.to_string()))?;

        let acks = Acknowledger {
            topic: args.consumer.config().command_ack_topic.clone(),
            transport: args.transport,
            marshaller: args.marshaller,
        };
        Ok(CommandActorState {
            consumer: args.consumer,
            acks,
            listener: Some(listener),
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(listener) = state.listener.take() {
            tokio::task::spawn_blocking(move || listener.stop()).await?;
        }
        tracing::info!("Command actor for {} stopped", state.consumer.name());
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CommandMessage::Execute { command, reply } => {
                tracing::info!("Executing {} on {}", command.command, command.queue_name);
                let action = command.command;
                let consumer = state.consumer.clone();
                let acks = state.acks.clone();
                let run = async move {
                    let outcome = tokio::task::spawn_blocking(move || execute(&consumer, action))
                        .await
                        .unwrap_or_else(|e| {
                            CommandOutcome::failed(format!("Command panicked: {}", e))
                        });
                    if let CommandOutcome::Failed { error } = &outcome {
                        tracing::warn!(
                            "{} on {} failed: {}",
                            command.command,
                            command.queue_name,
                            error
                        );
                    }

                    let ack = Acknowledgement::new(&command, outcome);
                    acks.send(&ack);
                    if let Some(reply) = reply {
                        let _ = reply.send(ack);
                    }
                };

                match action {
                    QueueCommand::StopConsumer | QueueCommand::RestartConsumer => {
                        tokio::spawn(run);
                    }
                    _ => run.await,
                }
            }

            CommandMessage::Shutdown => {
                myself.stop(None);
            }
        }
        Ok(())
    }
}

/// Sends commands on a queue's command topic and waits for the matching
/// acknowledgement. Blocks the calling thread.
pub struct CommandClient {
    queue_name: String,
    command_topic: String,
    ack_topic: String,
    transport: Arc<dyn Transport>,
    marshaller: Arc<dyn Marshaller>,
    timeout: Duration,
}

impl CommandClient {
    pub fn new(config: &ConsumerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            queue_name: config.queue_name.clone(),
            command_topic: config.command_topic.clone(),
            ack_topic: config.command_ack_topic.clone(),
            transport,
            marshaller: Arc::new(JsonMarshaller::new()),
            timeout: ACK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a command and wait for its acknowledgement.
    pub fn send(&self, command: QueueCommand) -> EngineResult<Acknowledgement> {
        let command = CommandBean::new(self.queue_name.clone(), command);
        let acks = self.transport.subscribe(&self.ack_topic)?;
        self.transport
            .send(&self.command_topic, self.marshaller.marshal(&command)?)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::Timeout(self.timeout));
            }
            let Some(text) = acks.recv_timeout(remaining)? else {
                continue;
            };
            match self.marshaller.unmarshal::<Acknowledgement>(&text) {
                Ok(ack) if ack.message_id == command.message_id => return Ok(ack),
                Ok(_) => {}
                Err(e) => tracing::warn!("Ignoring malformed acknowledgement: {}", e),
            }
        }
    }
}
