//! Bean queue daemon.
//!
//! Starts the supervisor with the demo processes, creates the configured queue
//! and runs until interrupted. Clients publish beans on `<queue>.submit` and
//! commands on `<queue>.command`. Configuration comes from `BEAN_*` variables
//! (see `EngineConfig::from_env`) and, for snapshots, `STORAGE_*` variables.

use std::sync::Arc;

use db::DbConfig;
use engine::{
    EngineConfig, InMemoryTransport, JsonFileStore, JsonMarshaller, ObjectStoreSnapshots,
    RequestResponder, StoreConfig, SupervisorArgs, SupervisorMessage, SurrealQueueStore,
    concurrency, start_supervisor,
};
use storage::Storage;
use tokio::sync::broadcast;

mod processes;

use processes::{CapabilityQuery, demo_registry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    tracing::info!("Initializing bean queue daemon...");
    let config = EngineConfig::from_env()?;
    let transport = Arc::new(InMemoryTransport::new());
    let registry = demo_registry();
    let mut bean_types: Vec<String> = registry.bean_types().into_iter().map(String::from).collect();
    bean_types.sort();

    let mut args =
        SupervisorArgs::new(Arc::new(registry), transport.clone()).with_config(config.clone());

    let mut surreal = None;
    match &config.store {
        StoreConfig::Memory => tracing::info!("Queues are kept in memory only"),
        StoreConfig::Json { dir } => {
            let store = JsonFileStore::new(dir);
            store.init()?;
            tracing::info!("Persisting queues to {}", dir.display());
            args = args.with_store(Arc::new(store));
        }
        StoreConfig::Surreal { endpoint } => {
            let db_config = DbConfig::new(endpoint.clone());
            let store = Arc::new(SurrealQueueStore::open(db_config).await?);
            tracing::info!("Persisting queues to SurrealDB at {}", endpoint);
            surreal = Some(store.clone());
            args = args.with_store(store);
        }
    }

    if config.snapshots {
        let storage = Storage::from_env()?;
        tracing::info!("Archiving bean snapshots to {} storage", storage.backend_name());
        args = args.with_snapshots(Arc::new(ObjectStoreSnapshots::new(
            storage,
            Arc::new(JsonMarshaller::new()),
            tokio::runtime::Handle::current(),
        )));
    }

    let (supervisor, handle) = start_supervisor(args).await?;

    // Log every queue event
    let (events_tx, mut events) = broadcast::channel(1024);
    supervisor.send_message(SupervisorMessage::Subscribe { sender: events_tx })?;
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!("{}", event.description()),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Event log skipped {} events", missed)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let queue_name = config.consumer.queue_name.clone();
    let (tx, rx) = concurrency::oneshot();
    supervisor.send_message(SupervisorMessage::CreateQueue {
        config: Box::new(config.consumer.clone()),
        reply: tx.into(),
    })?;
    match rx.await {
        Ok(Ok(info)) => tracing::info!("Queue {} is {}", info.queue_name, info.status),
        Ok(Err(e)) => tracing::warn!("Failed to create queue {}: {}", queue_name, e),
        Err(_) => tracing::warn!("Supervisor dropped the create request for {}", queue_name),
    }

    // Answer capability queries for this daemon
    let responder = RequestResponder::spawn(
        format!("{}.capabilities", queue_name),
        format!("{}.capabilities.reply", queue_name),
        transport.clone(),
        move |mut query: CapabilityQuery| {
            query.bean_types = bean_types.clone();
            Ok(Some(query))
        },
    )?;
    tracing::info!("Answering capability queries on {}", responder.request_topic());
    tracing::info!(
        "Accepting beans on {} and commands on {}",
        config.consumer.submit_topic,
        config.consumer.command_topic
    );

    tracing::info!("Bean queue daemon running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    tokio::task::spawn_blocking(move || responder.stop()).await?;
    supervisor.send_message(SupervisorMessage::Shutdown)?;
    handle.await?;
    if let Some(store) = surreal {
        store.flush().await;
    }
    Ok(())
}
