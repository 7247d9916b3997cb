//! Bean processes and the pause protocol.
//!
//! A [`BeanProcess`] owns one bean and the [`Process`] that works on it. One
//! lock guards the bean and an `await_paused` flag; one condition wakes
//! bodies blocked in [`BeanProcess::check_paused`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Condvar, Mutex, MutexGuard};
use queue_core::{Bean, BeanId, Status};

use crate::error::{EngineError, EngineResult};
use crate::publisher::Publisher;
use crate::snapshot::SnapshotSink;

/// Longest wait for the process lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// The work carried out for one bean.
///
/// Hooks run while the process lock is held: they must not call back into the
/// [`BeanProcess`].
pub trait Process: Send + Sync + 'static {
    /// Run the task body. Long bodies call [`BeanProcess::check_paused`]
    /// regularly and stop once [`BeanProcess::is_final`] reports true.
    fn execute(&self, ctx: &BeanProcess) -> EngineResult<()>;

    fn on_pause(&self, _bean: &Bean) -> EngineResult<()> {
        Ok(())
    }

    fn on_resume(&self, _bean: &Bean) -> EngineResult<()> {
        Ok(())
    }

    fn on_terminate(&self, _bean: &Bean) -> EngineResult<()> {
        Ok(())
    }

    /// Whether the body must run on the consumer thread. `None` defers to the
    /// consumer's configuration.
    fn blocking(&self) -> Option<bool> {
        None
    }
}

/// Builds the process for a dequeued bean.
pub trait ProcessFactory: Send + Sync + 'static {
    fn create_process(
        &self,
        bean: &Bean,
        publisher: &Arc<dyn Publisher>,
    ) -> EngineResult<Box<dyn Process>>;
}

struct ControlState {
    bean: Bean,
    await_paused: bool,
    interrupted: bool,
}

/// Lock-protected wrapper running one [`Process`] for one bean.
pub struct BeanProcess {
    id: BeanId,
    process: Box<dyn Process>,
    publisher: Arc<dyn Publisher>,
    state: Mutex<ControlState>,
    resumed: Condvar,
    snapshot: Option<(String, Arc<dyn SnapshotSink>)>,
}

impl BeanProcess {
    pub fn new(bean: Bean, process: Box<dyn Process>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            id: bean.id,
            process,
            publisher,
            state: Mutex::new(ControlState {
                bean,
                await_paused: false,
                interrupted: false,
            }),
            resumed: Condvar::new(),
            snapshot: None,
        }
    }

    /// Archive the bean through `sink` when the process starts.
    pub fn with_snapshot_sink(mut self, queue: impl Into<String>, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshot = Some((queue.into(), sink));
        self
    }

    pub fn id(&self) -> BeanId {
        self.id
    }

    /// Copy of the bean as it stands.
    pub fn bean(&self) -> Bean {
        self.state.lock().bean.clone()
    }

    pub fn status(&self) -> Status {
        self.state.lock().bean.status
    }

    /// The bean has reached COMPLETE, TERMINATED or FAILED.
    pub fn is_final(&self) -> bool {
        self.status().is_final()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().await_paused
    }

    /// Whether this process runs on the consumer thread.
    pub fn is_blocking(&self, default: bool) -> bool {
        self.process.blocking().unwrap_or(default)
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, ControlState>> {
        self.state.try_lock_for(LOCK_TIMEOUT).ok_or_else(|| {
            EngineError::Protocol(format!(
                "Could not lock process for bean {} within {:?}",
                self.id, LOCK_TIMEOUT
            ))
        })
    }

    fn publish(&self, bean: &Bean) {
        if let Err(e) = self.publisher.broadcast(bean) {
            tracing::warn!("Failed to publish bean {}: {}", bean.id, e);
        }
    }

    /// Pause the body at its next [`check_paused`](Self::check_paused).
    ///
    /// Returns `false` if the bean is final or already paused.
    pub fn pause(&self) -> EngineResult<bool> {
        let mut state = self.lock()?;
        if state.bean.status.is_final() || state.await_paused {
            return Ok(false);
        }

        state.await_paused = true;
        if let Err(e) = self.process.on_pause(&state.bean) {
            state.await_paused = false;
            return Err(EngineError::Process(format!("Pause hook failed: {}", e)));
        }
        state.bean.set_status(Status::Paused);
        self.publish(&state.bean);
        tracing::info!("Paused bean {}", self.id);
        Ok(true)
    }

    /// Release a paused body.
    ///
    /// Returns `false` if the bean is final or not paused.
    pub fn resume(&self) -> EngineResult<bool> {
        let mut state = self.lock()?;
        if state.bean.status.is_final() || !state.await_paused {
            return Ok(false);
        }

        state.await_paused = false;
        let hook = self.process.on_resume(&state.bean);
        if let Err(e) = hook {
            state.await_paused = true;
            return Err(EngineError::Process(format!("Resume hook failed: {}", e)));
        }
        state.bean.set_status(Status::Resumed);
        self.publish(&state.bean);
        self.resumed.notify_all();
        tracing::info!("Resumed bean {}", self.id);
        Ok(true)
    }

    /// Terminate the bean. A failing hook leaves the bean FAILED instead.
    ///
    /// Returns `false` if the bean was already final.
    pub fn terminate(&self) -> EngineResult<bool> {
        let mut state = self.lock()?;
        if state.bean.status.is_final() {
            return Ok(false);
        }

        state.await_paused = false;
        match self.process.on_terminate(&state.bean) {
            Ok(()) => {
                state.bean.set_status(Status::Terminated);
            }
            Err(e) => {
                tracing::error!("Terminate hook failed for bean {}: {}", self.id, e);
                state.bean.fail(e.to_string());
            }
        }
        self.publish(&state.bean);
        self.resumed.notify_all();
        tracing::info!("Terminated bean {} ({})", self.id, state.bean.status);
        Ok(true)
    }

    /// Wake a body blocked in [`check_paused`](Self::check_paused) without
    /// resuming it.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.resumed.notify_all();
    }

    /// Block while the process is paused.
    ///
    /// Failing to take the lock within [`LOCK_TIMEOUT`] is an internal error.
    /// An [`interrupt`](Self::interrupt) while waiting returns `Ok` if the bean
    /// is already final and [`EngineError::Interrupted`] otherwise.
    pub fn check_paused(&self) -> EngineResult<()> {
        let mut state = self.state.try_lock_for(LOCK_TIMEOUT).ok_or_else(|| {
            EngineError::Internal(format!(
                "Could not lock process for bean {} while checking for pause",
                self.id
            ))
        })?;

        while state.await_paused {
            if state.interrupted {
                state.interrupted = false;
                return if state.bean.status.is_final() {
                    Ok(())
                } else {
                    Err(EngineError::Interrupted)
                };
            }
            self.resumed.wait(&mut state);
        }
        state.interrupted = false;
        Ok(())
    }

    /// Report progress. Values below the current one are ignored.
    ///
    /// NaN and infinities are rejected and leave the bean untouched.
    pub fn set_progress(&self, percent: f64) -> EngineResult<()> {
        if !percent.is_finite() {
            return Err(EngineError::Protocol(format!(
                "Progress for bean {} must be a finite number, got {}",
                self.id, percent
            )));
        }
        let mut state = self.lock()?;
        let percent = percent.clamp(0.0, 100.0);
        if state.bean.status.is_final() || percent <= state.bean.percent_complete {
            return Ok(());
        }
        state.bean.percent_complete = percent;
        self.publish(&state.bean);
        Ok(())
    }

    /// Attach a human-readable message and publish it.
    pub fn set_message(&self, message: impl Into<String>) -> EngineResult<()> {
        let mut state = self.lock()?;
        if state.bean.status.is_final() {
            return Ok(());
        }
        state.bean.message = Some(message.into());
        self.publish(&state.bean);
        Ok(())
    }

    /// Take the bean through PREPARING and RUNNING, execute the body and
    /// publish the final status. Errors and panics in the body end as FAILED.
    ///
    /// Returns the bean in its final state.
    pub fn run(&self) -> Bean {
        {
            let mut state = self.state.lock();
            // A bean paused before it started stays PAUSED.
            if !state.bean.status.is_final() && !state.await_paused {
                state.bean.set_status(Status::Preparing);
                self.publish(&state.bean);
            }
        }

        if let Some((queue, sink)) = &self.snapshot {
            let bean = self.bean();
            if let Err(e) = sink.write(queue, &bean) {
                tracing::warn!("Failed to archive bean {}: {}", bean.id, e);
            }
        }

        {
            let mut state = self.state.lock();
            if state.bean.status.is_final() {
                return state.bean.clone();
            }
            state.bean.start_time = Some(Utc::now());
            if state.bean.status == Status::Preparing {
                state.bean.set_status(Status::Running);
            }
            self.publish(&state.bean);
        }

        tracing::info!("Running bean {}", self.id);
        let result = catch_unwind(AssertUnwindSafe(|| self.process.execute(self)));

        let mut state = self.state.lock();
        match result {
            Ok(Ok(())) => {
                if !state.bean.status.is_final() {
                    state.bean.percent_complete = 100.0;
                    state.bean.set_status(Status::Complete);
                    self.publish(&state.bean);
                }
                tracing::info!("Bean {} finished: {}", self.id, state.bean.status);
            }
            Ok(Err(e)) => {
                if state.bean.fail(e.to_string()) {
                    tracing::error!("Bean {} failed: {}", self.id, e);
                    self.publish(&state.bean);
                }
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                if state.bean.fail(format!("Process panicked: {}", message)) {
                    tracing::error!("Bean {} panicked: {}", self.id, message);
                    self.publish(&state.bean);
                }
            }
        }
        state.await_paused = false;
        self.resumed.notify_all();
        state.bean.clone()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    /// Records every broadcast.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Bean>>,
    }

    impl Recorder {
        fn statuses(&self) -> Vec<Status> {
            self.seen.lock().iter().map(|b| b.status).collect()
        }
    }

    impl Publisher for Recorder {
        fn broadcast(&self, bean: &Bean) -> EngineResult<()> {
            self.seen.lock().push(bean.clone());
            Ok(())
        }

        fn set_logging_stream(&self, _stream: Box<dyn Write + Send>) {}
    }

    /// Loops on check_paused until released or terminated.
    struct Looping {
        release: Arc<AtomicBool>,
        fail_terminate: bool,
    }

    impl Process for Looping {
        fn execute(&self, ctx: &BeanProcess) -> EngineResult<()> {
            while !self.release.load(Ordering::SeqCst) && !ctx.is_final() {
                ctx.check_paused()?;
                thread::sleep(Duration::from_millis(2));
            }
            Ok(())
        }

        fn on_terminate(&self, _bean: &Bean) -> EngineResult<()> {
            if self.fail_terminate {
                Err(EngineError::Process("hardware refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn looping(fail_terminate: bool) -> (Arc<BeanProcess>, Arc<Recorder>, Arc<AtomicBool>) {
        let release = Arc::new(AtomicBool::new(false));
        let recorder = Arc::new(Recorder::default());
        let process = BeanProcess::new(
            Bean::new("loop", "loop"),
            Box::new(Looping {
                release: release.clone(),
                fail_terminate,
            }),
            recorder.clone(),
        );
        (Arc::new(process), recorder, release)
    }

    fn wait_for(process: &BeanProcess, status: Status) {
        for _ in 0..500 {
            if process.status() == status {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("bean never reached {status}");
    }

    #[test]
    fn successful_run_walks_the_lifecycle() {
        let (process, recorder, release) = looping(false);
        release.store(true, Ordering::SeqCst);

        let bean = process.run();

        assert_eq!(bean.status, Status::Complete);
        assert_eq!(bean.percent_complete, 100.0);
        assert!(bean.start_time.is_some() && bean.end_time.is_some());
        assert_eq!(
            recorder.statuses(),
            vec![Status::Preparing, Status::Running, Status::Complete]
        );
    }

    #[test]
    fn pause_and_resume_are_idempotent() {
        let (process, recorder, release) = looping(false);
        let runner = {
            let process = process.clone();
            thread::spawn(move || process.run())
        };
        wait_for(&process, Status::Running);

        assert!(process.pause().unwrap());
        assert!(!process.pause().unwrap());
        assert!(process.resume().unwrap());
        assert!(!process.resume().unwrap());

        release.store(true, Ordering::SeqCst);
        assert_eq!(runner.join().unwrap().status, Status::Complete);

        let statuses = recorder.statuses();
        assert_eq!(statuses.iter().filter(|s| **s == Status::Paused).count(), 1);
        assert_eq!(statuses.iter().filter(|s| **s == Status::Resumed).count(), 1);
    }

    #[test]
    fn terminate_while_paused_ends_terminated() {
        let (process, _recorder, _release) = looping(false);
        let runner = {
            let process = process.clone();
            thread::spawn(move || process.run())
        };
        wait_for(&process, Status::Running);

        process.pause().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(process.terminate().unwrap());

        let bean = runner.join().unwrap();
        assert_eq!(bean.status, Status::Terminated);
        assert!(bean.message.is_none());

        // Terminal: everything is now a no-op.
        assert!(!process.pause().unwrap());
        assert!(!process.resume().unwrap());
        assert!(!process.terminate().unwrap());
        assert_eq!(process.status(), Status::Terminated);
    }

    #[test]
    fn terminate_releases_a_separate_paused_waiter() {
        let (process, _recorder, _release) = looping(false);
        let runner = {
            let process = process.clone();
            thread::spawn(move || process.run())
        };
        wait_for(&process, Status::Running);
        process.pause().unwrap();

        let waiter = {
            let process = process.clone();
            thread::spawn(move || process.check_paused())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        assert!(process.terminate().unwrap());
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(runner.join().unwrap().status, Status::Terminated);
    }

    #[test]
    fn failing_terminate_hook_ends_failed() {
        let (process, _recorder, _release) = looping(true);
        let runner = {
            let process = process.clone();
            thread::spawn(move || process.run())
        };
        wait_for(&process, Status::Running);

        process.terminate().unwrap();
        let bean = runner.join().unwrap();
        assert_eq!(bean.status, Status::Failed);
        assert!(bean.message.unwrap().contains("hardware refused"));
    }

    #[test]
    fn interrupt_while_paused_surfaces_unless_final() {
        let (process, _recorder, _release) = looping(false);
        process.pause().unwrap();

        let waiter = {
            let process = process.clone();
            thread::spawn(move || process.check_paused())
        };
        thread::sleep(Duration::from_millis(20));
        process.interrupt();
        assert!(matches!(waiter.join().unwrap(), Err(EngineError::Interrupted)));
    }

    #[test]
    fn progress_never_goes_backwards() {
        let recorder = Arc::new(Recorder::default());
        struct Steps;
        impl Process for Steps {
            fn execute(&self, ctx: &BeanProcess) -> EngineResult<()> {
                for pct in [10.0, 40.0, 20.0, 40.0, 90.0] {
                    ctx.set_progress(pct)?;
                }
                Ok(())
            }
        }
        let process = BeanProcess::new(Bean::new("steps", "steps"), Box::new(Steps), recorder.clone());
        process.run();

        let progress: Vec<f64> = recorder
            .seen
            .lock()
            .iter()
            .filter(|b| b.status == Status::Running)
            .map(|b| b.percent_complete)
            .collect();
        assert_eq!(progress, vec![0.0, 10.0, 40.0, 90.0]);
    }

    #[test]
    fn non_finite_progress_is_rejected() {
        let (process, _recorder, _release) = looping(false);
        process.set_progress(50.0).unwrap();

        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(process.set_progress(bad), Err(EngineError::Protocol(_))));
        }
        process.set_progress(10.0).unwrap();

        let bean = process.bean();
        assert_eq!(bean.percent_complete, 50.0);
        let text = serde_json::to_string(&bean).unwrap();
        let restored: Bean = serde_json::from_str(&text).unwrap();
        assert_eq!(restored.percent_complete, 50.0);
    }

    #[test]
    fn errors_and_panics_end_failed() {
        struct Broken;
        impl Process for Broken {
            fn execute(&self, _ctx: &BeanProcess) -> EngineResult<()> {
                Err(EngineError::Process("detector offline".into()))
            }
        }
        struct Panicking;
        impl Process for Panicking {
            fn execute(&self, _ctx: &BeanProcess) -> EngineResult<()> {
                panic!("motor overrun");
            }
        }

        let recorder = Arc::new(Recorder::default());
        let bean = BeanProcess::new(Bean::new("b", "b"), Box::new(Broken), recorder.clone()).run();
        assert_eq!(bean.status, Status::Failed);
        assert!(bean.message.unwrap().contains("detector offline"));

        let bean = BeanProcess::new(Bean::new("p", "p"), Box::new(Panicking), recorder).run();
        assert_eq!(bean.status, Status::Failed);
        assert!(bean.message.unwrap().contains("motor overrun"));
    }

    #[test]
    fn lock_timeout_is_reported() {
        struct SlowPause;
        impl Process for SlowPause {
            fn execute(&self, _ctx: &BeanProcess) -> EngineResult<()> {
                Ok(())
            }
            fn on_pause(&self, _bean: &Bean) -> EngineResult<()> {
                thread::sleep(LOCK_TIMEOUT * 2 + Duration::from_millis(500));
                Ok(())
            }
        }
        let process = Arc::new(BeanProcess::new(
            Bean::new("slow", "slow"),
            Box::new(SlowPause),
            Arc::new(Recorder::default()),
        ));
        let pauser = {
            let process = process.clone();
            thread::spawn(move || process.pause())
        };
        thread::sleep(Duration::from_millis(50));

        assert!(matches!(process.terminate(), Err(EngineError::Protocol(_))));
        assert!(matches!(process.check_paused(), Err(EngineError::Internal(_))));
        assert!(pauser.join().unwrap().unwrap());
    }
}
