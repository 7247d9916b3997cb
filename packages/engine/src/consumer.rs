//! The consumer loop of one queue.
//!
//! One named OS thread per queue takes beans from the submission queue, builds
//! a process for each and runs it, either on the loop thread or on a thread of
//! its own. Pause and resume only gate the next dequeue.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use queue_core::{Bean, BeanId, ConsumerEvent, ConsumerId, ConsumerInfo, ConsumerStatus, Status};
use tokio::sync::broadcast;

use crate::bean_queue::{BeanQueue, CleanUpReport};
use crate::config::ConsumerConfig;
use crate::error::{EngineError, EngineResult};
use crate::marshaller::{JsonMarshaller, Marshaller};
use crate::persistence::QueueStore;
use crate::process::{BeanProcess, ProcessFactory};
use crate::publisher::{Publisher, StatusPublisher};
use crate::snapshot::SnapshotSink;
use crate::transport::Transport;

/// How long the loop waits for a bean before rechecking its controls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the listener event channel. Slower listeners lag and miss events.
const EVENT_CAPACITY: usize = 1024;

struct LoopControl {
    status: ConsumerStatus,
    stop_requested: bool,
    /// A loop thread exists, possibly still finishing its last bean.
    loop_alive: bool,
}

/// A request that reached a bean between dequeue and process creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobRequest {
    Pause,
    Terminate,
}

/// A bean that has left the submission queue and not yet finished.
enum Job {
    Building(Option<JobRequest>),
    Live(Arc<BeanProcess>),
}

struct ConsumerInner {
    id: ConsumerId,
    config: ConsumerConfig,
    queue: Arc<BeanQueue>,
    factory: Arc<dyn ProcessFactory>,
    publisher: Arc<dyn Publisher>,
    transport: Arc<dyn Transport>,
    marshaller: Arc<dyn Marshaller>,
    snapshots: Option<Arc<dyn SnapshotSink>>,
    store: Option<Arc<dyn QueueStore>>,
    events: broadcast::Sender<ConsumerEvent>,
    control: Mutex<LoopControl>,
    changed: Condvar,
    jobs: Mutex<HashMap<BeanId, Job>>,
    start_time: Mutex<Option<DateTime<Utc>>>,
}

impl ConsumerInner {
    fn emit(&self, event: ConsumerEvent) {
        // No listeners is not an error.
        let _ = self.events.send(event);
    }

    fn status(&self) -> ConsumerStatus {
        self.control.lock().status
    }

    fn set_status(&self, new_status: ConsumerStatus) {
        let old_status = std::mem::replace(&mut self.control.lock().status, new_status);
        self.announce(old_status, new_status);
    }

    /// Move from `from` to `to` in one step. Fails once a stop is requested.
    fn transition(&self, from: ConsumerStatus, to: ConsumerStatus) -> bool {
        {
            let mut control = self.control.lock();
            if control.status != from || control.stop_requested {
                return false;
            }
            control.status = to;
        }
        self.announce(from, to);
        true
    }

    fn announce(&self, old_status: ConsumerStatus, new_status: ConsumerStatus) {
        self.changed.notify_all();
        self.queue.wake();
        if old_status == new_status {
            return;
        }

        tracing::info!(
            "Consumer for {} is now {} (was {})",
            self.config.queue_name,
            new_status,
            old_status
        );
        self.emit(ConsumerEvent::ConsumerStatusChanged {
            queue_name: self.config.queue_name.clone(),
            old_status,
            new_status,
            timestamp: Utc::now(),
        });
        self.send_info(&self.config.queue_status_topic);
    }

    fn info(&self) -> ConsumerInfo {
        let mut info = ConsumerInfo::new(self.id, self.config.queue_name.clone());
        info.status = self.status();
        info.start_time = *self.start_time.lock();
        info.host_name = std::env::var("HOSTNAME").ok();
        info.pending = self.queue.pending_len() as u64;
        info.running = self.jobs.lock().len() as u64;
        info
    }

    fn send_info(&self, topic: &str) -> ConsumerInfo {
        let info = self.info();
        match self.marshaller.marshal(&info) {
            Ok(text) => {
                if let Err(e) = self.transport.send(topic, text) {
                    tracing::warn!("Failed to publish consumer info on {}: {}", topic, e);
                }
            }
            Err(e) => tracing::warn!("Failed to marshal consumer info: {}", e),
        }
        info
    }

    fn publish(&self, bean: &Bean) {
        if let Err(e) = self.publisher.broadcast(bean) {
            tracing::warn!("Failed to publish bean {}: {}", bean.id, e);
        }
    }

    /// Wait until the loop may dequeue. Returns `false` once a stop is requested.
    fn wait_until_running(&self) -> bool {
        let mut control = self.control.lock();
        loop {
            if control.stop_requested {
                return false;
            }
            if control.status == ConsumerStatus::Running {
                return true;
            }
            self.changed.wait_for(&mut control, POLL_INTERVAL);
        }
    }

    fn fail(&self, mut bean: Bean, message: String) {
        tracing::error!("Bean {} failed before running: {}", bean.id, message);
        if bean.fail(message) {
            self.publish(&bean);
        }
    }

    fn handle_bean(self: &Arc<Self>, bean: Bean) {
        let id = bean.id;
        self.emit(ConsumerEvent::BeanStarted {
            queue_name: self.config.queue_name.clone(),
            bean_id: id,
            timestamp: Utc::now(),
        });

        if bean.status.is_final() {
            // Terminated while queued: no process is built.
            self.jobs.lock().remove(&id);
            tracing::info!("Bean {} was {} while queued, skipping", id, bean.status);
            self.publish(&bean);
            return;
        }

        let built = catch_unwind(AssertUnwindSafe(|| {
            self.factory.create_process(&bean, &self.publisher)
        }));
        let process = match built {
            Ok(Ok(process)) => process,
            Ok(Err(e)) => {
                self.jobs.lock().remove(&id);
                return self.fail(bean, e.to_string());
            }
            Err(_) => {
                self.jobs.lock().remove(&id);
                return self.fail(bean, "Process factory panicked".to_string());
            }
        };

        let mut process = BeanProcess::new(bean, process, self.publisher.clone());
        if let Some(sink) = &self.snapshots {
            process = process.with_snapshot_sink(self.config.queue_name.clone(), sink.clone());
        }
        let process = Arc::new(process);
        let request = match self.jobs.lock().insert(id, Job::Live(process.clone())) {
            Some(Job::Building(request)) => request,
            _ => None,
        };
        let applied = match request {
            Some(JobRequest::Pause) => process.pause(),
            Some(JobRequest::Terminate) => process.terminate(),
            None => Ok(false),
        };
        if let Err(e) = applied {
            tracing::warn!("Could not apply {:?} to bean {}: {}", request, id, e);
        }

        if process.is_blocking(self.config.blocking) {
            process.run();
            self.jobs.lock().remove(&id);
            return;
        }

        // std threads have no priority control; the body gets a dedicated thread instead.
        let inner = self.clone();
        let runner = process.clone();
        let spawned = thread::Builder::new()
            .name(format!("bean-{}", id))
            .spawn(move || {
                runner.run();
                inner.jobs.lock().remove(&id);
            });
        if let Err(e) = spawned {
            self.jobs.lock().remove(&id);
            self.fail(process.bean(), format!("Could not start process thread: {}", e));
        }
    }

    fn run_loop(self: Arc<Self>) {
        let _exit = LoopExit(&self);
        tracing::info!("Consumer loop for {} started", self.config.queue_name);
        while self.wait_until_running() {
            let ready = || {
                let control = self.control.lock();
                control.status == ConsumerStatus::Running && !control.stop_requested
            };
            let claim = |bean: &Bean| {
                self.jobs.lock().insert(bean.id, Job::Building(None));
            };
            let Some(bean) = self.queue.next_for_consumer_when(POLL_INTERVAL, ready, claim) else {
                continue;
            };
            tracing::debug!("Dequeued bean {} from {}", bean.id, self.config.queue_name);
            self.handle_bean(bean);
        }
        tracing::info!("Consumer loop for {} stopped", self.config.queue_name);
    }
}

/// Marks the loop gone when its thread leaves `run_loop`, unwinding included.
struct LoopExit<'a>(&'a ConsumerInner);

impl Drop for LoopExit<'_> {
    fn drop(&mut self) {
        let old_status = {
            let mut control = self.0.control.lock();
            control.loop_alive = false;
            std::mem::replace(&mut control.status, ConsumerStatus::Stopped)
        };
        self.0.announce(old_status, ConsumerStatus::Stopped);
    }
}

/// Builder for a [`Consumer`].
pub struct ConsumerBuilder {
    config: ConsumerConfig,
    factory: Arc<dyn ProcessFactory>,
    transport: Arc<dyn Transport>,
    marshaller: Arc<dyn Marshaller>,
    queue: Option<Arc<BeanQueue>>,
    store: Option<Arc<dyn QueueStore>>,
    snapshots: Option<Arc<dyn SnapshotSink>>,
}

impl ConsumerBuilder {
    /// Use an existing queue instead of creating one.
    pub fn queue(mut self, queue: Arc<BeanQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Persist the queue through this store.
    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn marshaller(mut self, marshaller: Arc<dyn Marshaller>) -> Self {
        self.marshaller = marshaller;
        self
    }

    /// Archive every bean when its process starts.
    pub fn snapshot_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshots = Some(sink);
        self
    }

    pub fn build(self) -> EngineResult<Consumer> {
        let queue = match (self.queue, &self.store) {
            (Some(queue), _) => queue,
            (None, Some(store)) => Arc::new(BeanQueue::with_store(
                self.config.queue_name.clone(),
                store.clone(),
            )?),
            (None, None) => Arc::new(BeanQueue::new(self.config.queue_name.clone())),
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let publisher: Arc<dyn Publisher> = Arc::new(
            StatusPublisher::new(
                self.config.status_topic.clone(),
                self.transport.clone(),
                self.marshaller.clone(),
            )
            .with_queue(queue.clone())
            .with_events(events.clone()),
        );

        Ok(Consumer {
            inner: Arc::new(ConsumerInner {
                id: ConsumerId::new(),
                config: self.config,
                queue,
                factory: self.factory,
                publisher,
                transport: self.transport,
                marshaller: self.marshaller,
                snapshots: self.snapshots,
                store: self.store,
                events,
                control: Mutex::new(LoopControl {
                    status: ConsumerStatus::Stopped,
                    stop_requested: false,
                    loop_alive: false,
                }),
                changed: Condvar::new(),
                jobs: Mutex::new(HashMap::new()),
                start_time: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        })
    }
}

/// Drains one queue on a dedicated thread.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    pub fn builder(
        config: ConsumerConfig,
        factory: Arc<dyn ProcessFactory>,
        transport: Arc<dyn Transport>,
    ) -> ConsumerBuilder {
        ConsumerBuilder {
            config,
            factory,
            transport,
            marshaller: Arc::new(JsonMarshaller::new()),
            queue: None,
            store: None,
            snapshots: None,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.queue_name
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &Arc<BeanQueue> {
        &self.inner.queue
    }

    pub fn publisher(&self) -> &Arc<dyn Publisher> {
        &self.inner.publisher
    }

    pub fn status(&self) -> ConsumerStatus {
        self.inner.status()
    }

    /// Receive consumer and bean events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.inner.events.subscribe()
    }

    /// Submit a bean to the tail of the queue.
    pub fn submit(&self, bean: Bean) -> EngineResult<BeanId> {
        let id = bean.id;
        self.inner.queue.submit(bean)?;
        self.inner.emit(ConsumerEvent::BeanSubmitted {
            queue_name: self.inner.config.queue_name.clone(),
            bean_id: id,
            timestamp: Utc::now(),
        });
        Ok(id)
    }

    /// Start the loop thread. Does nothing if it is already running.
    ///
    /// Runs the start-up sweep first, then enters PAUSED if configured to and
    /// beans are waiting, RUNNING otherwise. A loop that is still winding down
    /// after a stop is a protocol error: only one loop runs per queue.
    pub fn start(&self) -> EngineResult<()> {
        let mut thread_slot = self.thread.lock();
        {
            let control = self.inner.control.lock();
            if control.loop_alive {
                if control.stop_requested {
                    return Err(EngineError::Protocol(format!(
                        "Consumer for {} is still stopping",
                        self.inner.config.queue_name
                    )));
                }
                return Ok(());
            }
        }
        if let Some(handle) = thread_slot.take() {
            let _ = handle.join();
        }

        let CleanUpReport { removed, failed } = self
            .inner
            .queue
            .clean_up_completed(self.inner.config.running_age(), self.inner.config.completed_age());
        if removed > 0 || failed > 0 {
            self.inner.emit(ConsumerEvent::CleanedUp {
                queue_name: self.inner.config.queue_name.clone(),
                removed: removed as u64,
                failed: failed as u64,
                timestamp: Utc::now(),
            });
        }

        let initial = if self.inner.config.pause_on_start && !self.inner.queue.is_empty() {
            ConsumerStatus::Paused
        } else {
            ConsumerStatus::Running
        };
        {
            let mut control = self.inner.control.lock();
            control.stop_requested = false;
            control.loop_alive = true;
        }
        *self.inner.start_time.lock() = Some(Utc::now());
        self.inner.set_status(initial);

        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name(format!("consumer-{}", self.inner.config.queue_name))
            .spawn(move || inner.run_loop())
            .map_err(|e| {
                self.inner.control.lock().loop_alive = false;
                self.inner.set_status(ConsumerStatus::Stopped);
                EngineError::Internal(format!("Could not start consumer thread: {}", e))
            })?;
        *thread_slot = Some(handle);
        Ok(())
    }

    /// Hold the loop before its next dequeue. Returns `false` unless it was running.
    pub fn pause(&self) -> bool {
        self.inner.transition(ConsumerStatus::Running, ConsumerStatus::Paused)
    }

    /// Let a paused loop dequeue again. Returns `false` unless it was paused.
    pub fn resume(&self) -> bool {
        self.inner.transition(ConsumerStatus::Paused, ConsumerStatus::Running)
    }

    /// Ask the loop to finish and wait for it.
    ///
    /// A blocking process in flight runs to completion first; non-blocking
    /// processes keep running on their own threads.
    pub fn stop(&self) -> EngineResult<()> {
        self.stop_until(None).map(|_| ())
    }

    /// Like [`stop`](Self::stop), but gives up waiting after `timeout`.
    ///
    /// Returns whether the loop has exited. A loop still busy keeps its stop
    /// request and exits once its current bean ends.
    pub fn stop_timeout(&self, timeout: Duration) -> EngineResult<bool> {
        self.stop_until(Some(Instant::now() + timeout))
    }

    fn stop_until(&self, deadline: Option<Instant>) -> EngineResult<bool> {
        self.request_stop();
        if self.on_loop_thread() {
            // Called from a process on the loop thread: the loop exits once it returns.
            return Ok(false);
        }

        {
            let mut control = self.inner.control.lock();
            while control.loop_alive {
                match deadline {
                    Some(deadline) => {
                        if self.inner.changed.wait_until(&mut control, deadline).timed_out() {
                            return Ok(!control.loop_alive);
                        }
                    }
                    None => self.inner.changed.wait(&mut control),
                }
            }
        }

        // A start that raced in may already own the slot with a live loop.
        let mut thread_slot = self.thread.lock();
        if thread_slot.as_ref().is_some_and(|h| h.is_finished())
            && let Some(handle) = thread_slot.take()
        {
            handle
                .join()
                .map_err(|_| EngineError::Internal("Consumer thread panicked".into()))?;
        }
        Ok(true)
    }

    fn on_loop_thread(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id())
    }

    fn request_stop(&self) {
        self.inner.control.lock().stop_requested = true;
        self.inner.changed.notify_all();
        self.inner.queue.wake();
    }

    /// Stop, sweep and start again.
    pub fn restart(&self) -> EngineResult<()> {
        tracing::info!("Restarting consumer for {}", self.inner.config.queue_name);
        self.stop()?;
        self.start()
    }

    /// The live process of a bean, if it is running.
    pub fn process(&self, id: BeanId) -> Option<Arc<BeanProcess>> {
        match self.inner.jobs.lock().get(&id) {
            Some(Job::Live(process)) => Some(process.clone()),
            _ => None,
        }
    }

    /// Forward a per-bean action to its process, or record it for a process
    /// still being built. `None` means the bean has no job.
    fn apply_to_job(
        &self,
        id: BeanId,
        live: impl FnOnce(&BeanProcess) -> EngineResult<bool>,
        building: impl FnOnce(&mut Option<JobRequest>) -> bool,
    ) -> Option<EngineResult<bool>> {
        let process = {
            let mut jobs = self.inner.jobs.lock();
            match jobs.get_mut(&id)? {
                Job::Building(request) => return Some(Ok(building(request))),
                Job::Live(process) => process.clone(),
            }
        };
        Some(live(&process))
    }

    fn change_job(
        &self,
        id: BeanId,
        live: impl Fn(&BeanProcess) -> EngineResult<bool>,
        building: impl Fn(&mut Option<JobRequest>) -> bool,
        from: &[Status],
        to: Status,
    ) -> EngineResult<bool> {
        if let Some(result) = self.apply_to_job(id, &live, &building) {
            return result;
        }
        let Some(current) = self.inner.queue.get(id) else {
            return Err(EngineError::NotFound(format!("Bean not found: {}", id)));
        };
        if from.contains(&current.status)
            && let Some(bean) = self.inner.queue.set_queued_status(id, to)
        {
            self.inner.publish(&bean);
            return Ok(true);
        }
        // Dequeued meanwhile: the claim made under the queue lock is visible now.
        self.apply_to_job(id, &live, &building).unwrap_or(Ok(false))
    }

    /// Pause a running bean, or hold a queued one in place.
    pub fn pause_job(&self, id: BeanId) -> EngineResult<bool> {
        self.change_job(
            id,
            |process| process.pause(),
            |request| request.is_none() && request.replace(JobRequest::Pause).is_none(),
            &[Status::Submitted],
            Status::Paused,
        )
    }

    /// Resume a paused bean, or release a held queued one.
    pub fn resume_job(&self, id: BeanId) -> EngineResult<bool> {
        self.change_job(
            id,
            |process| process.resume(),
            |request| {
                if *request == Some(JobRequest::Pause) {
                    *request = None;
                    true
                } else {
                    false
                }
            },
            &[Status::Paused],
            Status::Submitted,
        )
    }

    /// Terminate a running bean, or mark a queued one so it is never run.
    pub fn terminate_job(&self, id: BeanId) -> EngineResult<bool> {
        self.change_job(
            id,
            |process| process.terminate(),
            |request| request.replace(JobRequest::Terminate) != Some(JobRequest::Terminate),
            &[Status::Submitted, Status::Paused],
            Status::Terminated,
        )
    }

    /// Current heartbeat record.
    pub fn info(&self) -> ConsumerInfo {
        self.inner.info()
    }

    /// Publish a heartbeat and record it in the store.
    pub fn heartbeat(&self) -> ConsumerInfo {
        let info = self.inner.send_info(&self.inner.config.heartbeat_topic);
        if let Some(store) = &self.inner.store
            && let Err(e) = store.record_heartbeat(&info)
        {
            tracing::warn!("Failed to record heartbeat for {}: {}", info.queue_name, e);
        }
        info
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.request_stop();
    }
}
