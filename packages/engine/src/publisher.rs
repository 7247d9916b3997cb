//! Bean status publication.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use queue_core::{Bean, BeanId, ConsumerEvent, Status};
use tokio::sync::broadcast;

use crate::bean_queue::BeanQueue;
use crate::error::EngineResult;
use crate::marshaller::Marshaller;
use crate::transport::Transport;

/// Sends the current state of a bean to everyone watching its queue.
pub trait Publisher: Send + Sync + 'static {
    /// Publish the bean's current state.
    fn broadcast(&self, bean: &Bean) -> EngineResult<()>;

    /// Mirror every published bean to a diagnostic sink.
    fn set_logging_stream(&self, stream: Box<dyn Write + Send>);
}

/// Publisher that keeps a queue's status set current and sends the bean on
/// the status topic.
pub struct StatusPublisher {
    topic: String,
    transport: Arc<dyn Transport>,
    marshaller: Arc<dyn Marshaller>,
    queue: Option<Arc<BeanQueue>>,
    events: Option<broadcast::Sender<ConsumerEvent>>,
    log: Mutex<Option<Box<dyn Write + Send>>>,
    last_status: Mutex<HashMap<BeanId, Status>>,
}

impl StatusPublisher {
    pub fn new(
        topic: impl Into<String>,
        transport: Arc<dyn Transport>,
        marshaller: Arc<dyn Marshaller>,
    ) -> Self {
        Self {
            topic: topic.into(),
            transport,
            marshaller,
            queue: None,
            events: None,
            log: Mutex::new(None),
            last_status: Mutex::new(HashMap::new()),
        }
    }

    /// Keep this queue's status set in step with every broadcast.
    pub fn with_queue(mut self, queue: Arc<BeanQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Emit a [`ConsumerEvent::BeanStatusChanged`] for every status transition.
    pub fn with_events(mut self, events: broadcast::Sender<ConsumerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn notify_transition(&self, bean: &Bean) {
        let old_status = {
            let mut last = self.last_status.lock();
            let old = last.get(&bean.id).copied().unwrap_or(bean.previous_status);
            if bean.status.is_final() {
                last.remove(&bean.id);
            } else {
                last.insert(bean.id, bean.status);
            }
            old
        };
        if old_status == bean.status {
            return;
        }
        if let (Some(events), Some(queue)) = (&self.events, &self.queue) {
            // No receivers is not an error.
            let _ = events.send(ConsumerEvent::BeanStatusChanged {
                queue_name: queue.name().to_string(),
                bean_id: bean.id,
                old_status,
                new_status: bean.status,
                timestamp: Utc::now(),
            });
        }
    }

    fn log_line(&self, bean: &Bean) {
        let mut log = self.log.lock();
        if let Some(stream) = log.as_mut() {
            let line = format!(
                "{} {} {} {:.1}% {}",
                Utc::now().to_rfc3339(),
                bean.id,
                bean.status,
                bean.percent_complete,
                bean.message.as_deref().unwrap_or("")
            );
            if let Err(e) = writeln!(stream, "{}", line.trim_end()) {
                tracing::warn!("Failed to write to logging stream: {}", e);
                *log = None;
            }
        }
    }
}

impl Publisher for StatusPublisher {
    fn broadcast(&self, bean: &Bean) -> EngineResult<()> {
        if let Some(queue) = &self.queue {
            queue.update_status(bean);
        }
        self.notify_transition(bean);
        self.log_line(bean);

        let text = self.marshaller.marshal(bean)?;
        self.transport.send(&self.topic, text)?;
        tracing::debug!(
            "Published bean {} status {} ({:.1}%)",
            bean.id,
            bean.status,
            bean.percent_complete
        );
        Ok(())
    }

    fn set_logging_stream(&self, stream: Box<dyn Write + Send>) {
        *self.log.lock() = Some(stream);
    }
}
