//! Queue-backed bean execution engine.
//!
//! Clients submit beans to a named queue. One consumer thread per queue takes
//! them in order, asks a [`ProcessFactory`] for a process and runs it while
//! status updates are published on the queue's status topic. Operators steer
//! queues and individual beans over a separate command topic, and any component
//! can make scatter-gather requests through the correlator.
//!
//! # Architecture
//!
//! - `Consumer` - The loop thread, its queue and its running processes
//! - `BeanProcess` - Pausable, resumable, terminable wrapper around one bean
//! - `CommandActor` - Executes and acknowledges commands for one queue
//! - `SubmissionListener` - Queues beans published on a queue's submit topic
//! - `Supervisor` - Top-level actor that owns queues and sends heartbeats
//! - `RequestRequester` / `RequestResponder` - Request/response correlation
//!
//! # Usage
//!
//! ```ignore
//! use engine::{SupervisorArgs, SupervisorMessage, start_supervisor};
//!
//! let args = SupervisorArgs::new(Arc::new(registry), Arc::new(InMemoryTransport::new()));
//! let (supervisor, handle) = start_supervisor(args).await?;
//!
//! supervisor.send_message(SupervisorMessage::CreateQueue { ... })?;
//! ```

pub mod bean_queue;
pub mod command;
pub mod config;
pub mod consumer;
pub mod correlator;
pub mod error;
pub mod marshaller;
mod messages;
pub mod persistence;
pub mod process;
pub mod publisher;
pub mod registry;
pub mod snapshot;
pub mod submission;
mod supervisor;
pub mod transport;

pub use bean_queue::{BeanQueue, CleanUpReport};
pub use command::{CommandActor, CommandClient, CommandListener};
pub use config::{ConsumerConfig, CorrelatorConfig, EngineConfig, StoreConfig};
pub use consumer::{Consumer, ConsumerBuilder};
pub use correlator::{
    CancelToken, Correlated, RequestRequester, RequestResponder, ResponseType, Waiter,
};
pub use error::{EngineError, EngineResult};
pub use marshaller::{JsonMarshaller, Marshaller};
pub use messages::{CommandMessage, SupervisorMessage};
pub use persistence::{JsonFileStore, QueueStore, SurrealQueueStore};
pub use process::{BeanProcess, LOCK_TIMEOUT, Process, ProcessFactory};
pub use publisher::{Publisher, StatusPublisher};
pub use registry::{FnFactory, FnProcess, ProcessFactoryRegistry};
pub use snapshot::{ObjectStoreSnapshots, SnapshotSink};
pub use submission::SubmissionListener;
pub use supervisor::{Supervisor, SupervisorArgs, SupervisorState, start_supervisor};
pub use transport::{InMemoryTransport, Subscription, Transport};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
