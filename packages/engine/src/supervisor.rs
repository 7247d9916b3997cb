//! Supervisor actor for managing all queues and their command actors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use queue_core::{Acknowledgement, CommandOutcome, ConsumerEvent};
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::broadcast;

use crate::command::{CommandActor, CommandActorArgs};
use crate::config::{ConsumerConfig, EngineConfig};
use crate::consumer::Consumer;
use crate::marshaller::{JsonMarshaller, Marshaller};
use crate::messages::{CommandMessage, SupervisorMessage};
use crate::persistence::QueueStore;
use crate::process::ProcessFactory;
use crate::snapshot::SnapshotSink;
use crate::submission::SubmissionListener;
use crate::transport::Transport;

/// Shortest heartbeat period the supervisor will tick at.
const MIN_TICK: Duration = Duration::from_millis(100);

/// How long delete and shutdown wait for a running bean to finish.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Collaborators shared by every queue the supervisor creates.
pub struct SupervisorArgs {
    pub config: EngineConfig,
    pub factory: Arc<dyn ProcessFactory>,
    pub transport: Arc<dyn Transport>,
    pub marshaller: Arc<dyn Marshaller>,
    pub store: Option<Arc<dyn QueueStore>>,
    pub snapshots: Option<Arc<dyn SnapshotSink>>,
}

impl SupervisorArgs {
    pub fn new(factory: Arc<dyn ProcessFactory>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config: EngineConfig::default(),
            factory,
            transport,
            marshaller: Arc::new(JsonMarshaller::new()),
            store: None,
            snapshots: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotSink>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }
}

struct QueueEntry {
    consumer: Arc<Consumer>,
    commands: ActorRef<CommandMessage>,
    submissions: SubmissionListener,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    queues: HashMap<String, QueueEntry>,
    /// Events from every queue.
    pub event_tx: broadcast::Sender<ConsumerEvent>,
    args: SupervisorArgs,
}

impl SupervisorState {
    fn new(args: SupervisorArgs) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            queues: HashMap::new(),
            event_tx,
            args,
        }
    }

    fn consumer(&self, name: &str) -> Option<Arc<Consumer>> {
        self.queues.get(name).map(|entry| entry.consumer.clone())
    }
}

async fn spawn_command_actor(
    myself: &ActorRef<SupervisorMessage>,
    state: &SupervisorState,
    consumer: Arc<Consumer>,
) -> Result<ActorRef<CommandMessage>, ActorProcessingErr> {
    let args = CommandActorArgs {
        consumer: consumer.clone(),
        transport: state.args.transport.clone(),
        marshaller: state.args.marshaller.clone(),
    };
    let name = format!("commands-{}-{}", consumer.name(), consumer.id());
    let (actor, _handle) = Actor::spawn_linked(Some(name), CommandActor, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn command actor: {}", e)))?;
    Ok(actor)
}

async fn spawn_queue(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
    config: ConsumerConfig,
) -> Result<Arc<Consumer>, ActorProcessingErr> {
    let mut builder = Consumer::builder(
        config,
        state.args.factory.clone(),
        state.args.transport.clone(),
    )
    .marshaller(state.args.marshaller.clone());
    if let Some(store) = &state.args.store {
        builder = builder.store(store.clone());
    }
    if let Some(snapshots) = &state.args.snapshots {
        builder = builder.snapshot_sink(snapshots.clone());
    }
    // Restoring the queue reads the store.
    let consumer = Arc::new(tokio::task::spawn_blocking(move || builder.build()).await??);

    // Forward this queue's events to everyone subscribed to the supervisor.
    let mut rx = consumer.subscribe();
    let tx = state.event_tx.clone();
    let queue_name = consumer.name().to_string();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Dropped {} events from {}", missed, queue_name);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let submissions = SubmissionListener::spawn(
        consumer.clone(),
        state.args.transport.clone(),
        state.args.marshaller.clone(),
    )?;
    let commands = spawn_command_actor(myself, state, consumer.clone()).await?;
    state.queues.insert(
        consumer.name().to_string(),
        QueueEntry {
            consumer: consumer.clone(),
            commands,
            submissions,
        },
    );
    Ok(consumer)
}

fn not_found(name: &str) -> String {
    format!("Queue '{}' not found", name)
}

/// Supervisor actor that manages all queues.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting bean queue supervisor");

        // Heartbeat tick
        let period = args.config.consumer.heartbeat_interval().max(MIN_TICK);
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if myself_clone.send_message(SupervisorMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(SupervisorState::new(args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::CreateQueue { config, reply } => {
                let config = *config;
                if state.queues.contains_key(&config.queue_name) {
                    let _ = reply.send(Err(format!("Queue '{}' already exists", config.queue_name)));
                    return Ok(());
                }

                let consumer = match spawn_queue(&myself, state, config).await {
                    Ok(consumer) => consumer,
                    Err(e) => {
                        let _ = reply.send(Err(format!("Failed to create queue: {}", e)));
                        return Ok(());
                    }
                };

                tracing::info!("Created queue {}", consumer.name());
                let started = tokio::task::spawn_blocking(move || {
                    consumer.start().map(|()| consumer.info())
                })
                .await?;
                let _ = reply.send(started.map_err(|e| e.to_string()));
            }

            SupervisorMessage::StartQueue { name, reply } => {
                let Some(consumer) = state.consumer(&name) else {
                    let _ = reply.send(Err(not_found(&name)));
                    return Ok(());
                };
                let started = tokio::task::spawn_blocking(move || consumer.start()).await?;
                let _ = reply.send(started.map_err(|e| e.to_string()));
            }

            SupervisorMessage::StopQueue { name, reply } => {
                let Some(consumer) = state.consumer(&name) else {
                    let _ = reply.send(Err(not_found(&name)));
                    return Ok(());
                };
                // Stopping waits for the running process, so the supervisor does not.
                tokio::spawn(async move {
                    let stopped = tokio::task::spawn_blocking(move || consumer.stop())
                        .await
                        .map_err(|e| e.to_string())
                        .and_then(|r| r.map_err(|e| e.to_string()));
                    let _ = reply.send(stopped);
                });
            }

            SupervisorMessage::PauseQueue { name, reply } => {
                let result = state
                    .consumer(&name)
                    .map(|consumer| consumer.pause())
                    .ok_or_else(|| not_found(&name));
                let _ = reply.send(result);
            }

            SupervisorMessage::ResumeQueue { name, reply } => {
                let result = state
                    .consumer(&name)
                    .map(|consumer| consumer.resume())
                    .ok_or_else(|| not_found(&name));
                let _ = reply.send(result);
            }

            SupervisorMessage::Submit { queue, bean, reply } => {
                let Some(consumer) = state.consumer(&queue) else {
                    let _ = reply.send(Err(not_found(&queue)));
                    return Ok(());
                };
                let submitted = tokio::task::spawn_blocking(move || consumer.submit(*bean)).await?;
                let _ = reply.send(submitted.map_err(|e| e.to_string()));
            }

            SupervisorMessage::Command { command, reply } => {
                let Some(entry) = state.queues.get(&command.queue_name) else {
                    let error = not_found(&command.queue_name);
                    let _ = reply.send(Acknowledgement::new(&command, CommandOutcome::failed(error)));
                    return Ok(());
                };

                let (tx, rx) = ractor::concurrency::oneshot();
                entry.commands.send_message(CommandMessage::Execute {
                    command: command.clone(),
                    reply: Some(tx.into()),
                })?;
                tokio::spawn(async move {
                    let ack = rx.await.unwrap_or_else(|_| {
                        Acknowledgement::new(&command, CommandOutcome::failed("Command actor stopped"))
                    });
                    let _ = reply.send(ack);
                });
            }

            SupervisorMessage::GetQueue { name, reply } => {
                let _ = reply.send(state.consumer(&name).map(|c| c.queue().snapshot()));
            }

            SupervisorMessage::GetConsumer { name, reply } => {
                let _ = reply.send(state.consumer(&name).map(|c| c.info()));
            }

            SupervisorMessage::ListQueues { reply } => {
                let mut infos: Vec<_> = state.queues.values().map(|e| e.consumer.info()).collect();
                infos.sort_by(|a, b| a.queue_name.cmp(&b.queue_name));
                let _ = reply.send(infos);
            }

            SupervisorMessage::DeleteQueue { name, reply } => {
                let Some(consumer) = state.consumer(&name) else {
                    let _ = reply.send(Err(not_found(&name)));
                    return Ok(());
                };

                // The queue stays commandable until its loop is gone, so a
                // paused bean can still be resumed or terminated.
                let stopped =
                    tokio::task::spawn_blocking(move || consumer.stop_timeout(STOP_GRACE))
                        .await?;
                match stopped {
                    Ok(true) => {}
                    Ok(false) => {
                        let _ = reply.send(Err(format!(
                            "Queue '{}' is still running a bean, not deleted",
                            name
                        )));
                        return Ok(());
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.to_string()));
                        return Ok(());
                    }
                }

                let Some(entry) = state.queues.remove(&name) else {
                    let _ = reply.send(Err(not_found(&name)));
                    return Ok(());
                };
                entry.commands.stop(None);

                let store = state.args.store.clone();
                let deleted = tokio::task::spawn_blocking(move || {
                    entry.submissions.stop();
                    match store {
                        Some(store) => store.delete(entry.consumer.name()),
                        None => Ok(()),
                    }
                })
                .await?;
                if let Err(e) = &deleted {
                    tracing::warn!("Failed to delete queue {}: {}", name, e);
                }
                tracing::info!("Deleted queue {}", name);
                let _ = reply.send(deleted.map_err(|e| e.to_string()));
            }

            SupervisorMessage::Subscribe { sender } => {
                let mut rx = state.event_tx.subscribe();
                tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        if sender.send(event).is_err() {
                            break;
                        }
                    }
                });
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down supervisor");
                let entries: Vec<_> = state.queues.drain().map(|(_, entry)| entry).collect();
                for entry in &entries {
                    entry.commands.stop(None);
                }
                tokio::task::spawn_blocking(move || {
                    for entry in entries {
                        match entry.consumer.stop_timeout(STOP_GRACE) {
                            Ok(true) => {}
                            Ok(false) => tracing::warn!(
                                "Consumer for {} still has a bean running, leaving it",
                                entry.consumer.name()
                            ),
                            Err(e) => {
                                tracing::warn!("Failed to stop {}: {}", entry.consumer.name(), e)
                            }
                        }
                        entry.submissions.stop();
                    }
                })
                .await?;
                myself.stop(None);
                return Ok(());
            }

            SupervisorMessage::Tick => {
                let consumers: Vec<_> = state.queues.values().map(|e| e.consumer.clone()).collect();
                tokio::task::spawn_blocking(move || {
                    for consumer in consumers {
                        consumer.heartbeat();
                    }
                })
                .await?;
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorFailed(cell, err) => {
                let failed = state
                    .queues
                    .values()
                    .find(|entry| entry.commands.get_id() == cell.get_id())
                    .map(|entry| entry.consumer.clone());
                let Some(consumer) = failed else {
                    tracing::warn!("Unknown child actor failed: {}", err);
                    return Ok(());
                };

                tracing::warn!("Command actor for {} failed: {}, restarting", consumer.name(), err);
                let commands = spawn_command_actor(&myself, state, consumer.clone()).await?;
                if let Some(entry) = state.queues.get_mut(consumer.name()) {
                    entry.commands = commands;
                }
            }
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                tracing::debug!(
                    "Child actor {} terminated: {:?}",
                    cell.get_name().unwrap_or_default(),
                    reason
                );
            }
            _ => {}
        }
        Ok(())
    }
}

/// Start the supervisor with the given collaborators.
pub async fn start_supervisor(
    args: SupervisorArgs,
) -> Result<(ActorRef<SupervisorMessage>, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    let (actor, handle) = Actor::spawn(None, Supervisor, args).await?;

    Ok((actor, handle))
}
