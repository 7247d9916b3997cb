//! Submission queue and status set of one queue.
//!
//! Both collections sit behind a single lock so a snapshot is never torn and a
//! bean moving from one to the other is never seen in both or in neither.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex, MutexGuard};
use queue_core::{Bean, BeanId, QueueSnapshot, Status};

use crate::error::{EngineError, EngineResult};
use crate::persistence::QueueStore;

#[derive(Default)]
struct QueueState {
    submitted: VecDeque<Bean>,
    status_set: Vec<Bean>,
}

impl QueueState {
    fn contains(&self, id: BeanId) -> bool {
        self.submitted.iter().any(|b| b.id == id) || self.status_set.iter().any(|b| b.id == id)
    }

    fn position(&self, id: BeanId) -> Option<usize> {
        self.submitted.iter().position(|b| b.id == id)
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            submitted: self.submitted.iter().cloned().collect(),
            status_set: self.status_set.clone(),
        }
    }
}

/// Outcome of the start-up sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanUpReport {
    /// Beans dropped from the status set.
    pub removed: usize,
    /// Beans marked FAILED and kept.
    pub failed: usize,
}

/// The pending FIFO and the collection of beans that have left it.
pub struct BeanQueue {
    name: String,
    state: Mutex<QueueState>,
    available: Condvar,
    store: Option<Arc<dyn QueueStore>>,
}

impl BeanQueue {
    /// Create an empty, non-persistent queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            store: None,
        }
    }

    /// Create a queue backed by a store, restoring whatever it saved last.
    pub fn with_store(name: impl Into<String>, store: Arc<dyn QueueStore>) -> EngineResult<Self> {
        let name = name.into();
        let mut state = QueueState::default();
        if let Some(snapshot) = store.load(&name)? {
            tracing::info!(
                "Restored queue {}: {} pending, {} in status set",
                name,
                snapshot.submitted.len(),
                snapshot.status_set.len()
            );
            state.submitted = snapshot.submitted.into();
            state.status_set = snapshot.status_set;
        }
        Ok(Self {
            name,
            state: Mutex::new(state),
            available: Condvar::new(),
            store: Some(store),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn persist(&self, state: &QueueState) -> EngineResult<()> {
        match &self.store {
            Some(store) => store.save(&self.name, &state.snapshot()),
            None => Ok(()),
        }
    }

    /// Persist after a mutation that has already been applied.
    fn persist_best_effort(&self, state: &QueueState) {
        if let Err(e) = self.persist(state) {
            tracing::warn!("Failed to persist queue {}: {}", self.name, e);
        }
    }

    /// Append a bean to the tail of the submission queue.
    ///
    /// The bean is rolled back if the store rejects it.
    pub fn submit(&self, mut bean: Bean) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.contains(bean.id) {
            return Err(EngineError::Protocol(format!(
                "Bean {} is already in queue {}",
                bean.id, self.name
            )));
        }
        if !matches!(bean.status, Status::Submitted | Status::Paused) {
            bean.previous_status = bean.status;
            bean.status = Status::Submitted;
            bean.end_time = None;
        }

        let id = bean.id;
        state.submitted.push_back(bean);
        if let Err(e) = self.persist(&state) {
            state.submitted.retain(|b| b.id != id);
            return Err(e);
        }
        drop(state);

        self.available.notify_all();
        tracing::debug!("Submitted bean {} to {}", id, self.name);
        Ok(())
    }

    /// Move a pending bean one place towards the head.
    pub fn move_forward(&self, id: BeanId) -> bool {
        let mut state = self.state.lock();
        match state.position(id) {
            Some(pos) if pos > 0 => {
                state.submitted.swap(pos, pos - 1);
                self.persist_best_effort(&state);
                true
            }
            _ => false,
        }
    }

    /// Move a pending bean one place towards the tail.
    pub fn move_backward(&self, id: BeanId) -> bool {
        let mut state = self.state.lock();
        match state.position(id) {
            Some(pos) if pos + 1 < state.submitted.len() => {
                state.submitted.swap(pos, pos + 1);
                self.persist_best_effort(&state);
                true
            }
            _ => false,
        }
    }

    /// Remove a pending bean. Beans already in the status set are left alone.
    pub fn remove(&self, id: BeanId) -> bool {
        let mut state = self.state.lock();
        match state.position(id) {
            Some(pos) => {
                state.submitted.remove(pos);
                self.persist_best_effort(&state);
                true
            }
            None => false,
        }
    }

    /// Substitute a bean with the same id, keeping its place.
    pub fn replace(&self, bean: Bean) -> bool {
        let mut state = self.state.lock();
        let slot = match state.position(bean.id) {
            Some(pos) => state.submitted.get_mut(pos),
            None => state.status_set.iter_mut().find(|b| b.id == bean.id),
        };
        match slot {
            Some(slot) => {
                *slot = bean;
                self.persist_best_effort(&state);
                drop(state);
                self.available.notify_all();
                true
            }
            None => false,
        }
    }

    /// Drop every pending bean. Returns how many were removed.
    pub fn clear_queue(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.submitted.len();
        state.submitted.clear();
        if removed > 0 {
            self.persist_best_effort(&state);
        }
        removed
    }

    /// Drop every bean in the status set whose process is no longer live.
    ///
    /// Beans that are running, paused or waiting on a request stay.
    pub fn clear_running_and_completed(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.status_set.len();
        state
            .status_set
            .retain(|b| !b.status.is_final() && b.status.is_started());
        let removed = before - state.status_set.len();
        if removed > 0 {
            self.persist_best_effort(&state);
        }
        removed
    }

    /// Start-up sweep of the status set.
    ///
    /// - FAILED or NONE beans are removed.
    /// - Running or request beans older than `running_age` are failed and removed.
    /// - Final beans older than `completed_age` are removed.
    /// - Anything else that is neither running nor paused is marked FAILED.
    pub fn clean_up_completed(&self, running_age: Duration, completed_age: Duration) -> CleanUpReport {
        let now = Utc::now();
        let running_age = chrono::Duration::from_std(running_age).unwrap_or(chrono::Duration::MAX);
        let completed_age =
            chrono::Duration::from_std(completed_age).unwrap_or(chrono::Duration::MAX);

        let mut report = CleanUpReport::default();
        let mut state = self.state.lock();
        let beans = std::mem::take(&mut state.status_set);

        for mut bean in beans {
            let status = bean.status;
            let age = bean.age(now);

            if matches!(status, Status::Failed | Status::None) {
                report.removed += 1;
                continue;
            }
            if status.is_running() || status.is_request() {
                if age > running_age {
                    bean.fail("Failed: running for longer than the allowed running age");
                    tracing::warn!("Removing stale running bean {} from {}", bean.id, self.name);
                    report.removed += 1;
                    continue;
                }
                state.status_set.push(bean);
                continue;
            }
            if status.is_final() {
                if age > completed_age {
                    report.removed += 1;
                    continue;
                }
                state.status_set.push(bean);
                continue;
            }
            if !status.is_paused() {
                bean.fail(format!("Failed: left in state {} when the consumer restarted", status));
                report.failed += 1;
            }
            state.status_set.push(bean);
        }

        if report != CleanUpReport::default() {
            self.persist_best_effort(&state);
            tracing::info!(
                "Cleaned up queue {}: {} removed, {} failed",
                self.name,
                report.removed,
                report.failed
            );
        }
        report
    }

    /// Take the first pending bean that is not held, moving it into the status set.
    ///
    /// Beans marked PAUSED while queued are skipped and keep their place. Waits
    /// up to `wait` for one to become available.
    pub fn next_for_consumer(&self, wait: Duration) -> Option<Bean> {
        self.next_for_consumer_when(wait, || true, |_| {})
    }

    /// Like [`next_for_consumer`](Self::next_for_consumer), but nothing is
    /// taken unless `ready` holds, and `claim` sees the bean before the lock
    /// is released. Both run under the queue lock, so a consumer paused before
    /// the check never dequeues and a claimed bean is never seen unowned.
    pub fn next_for_consumer_when(
        &self,
        wait: Duration,
        ready: impl Fn() -> bool,
        claim: impl Fn(&Bean),
    ) -> Option<Bean> {
        let deadline = Instant::now() + wait;
        let mut state = self.state.lock();
        loop {
            if !ready() {
                return None;
            }
            if let Some(bean) = self.take_next(&mut state) {
                claim(&bean);
                return Some(bean);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                if !ready() {
                    return None;
                }
                let bean = self.take_next(&mut state)?;
                claim(&bean);
                return Some(bean);
            }
        }
    }

    fn take_next(&self, state: &mut MutexGuard<'_, QueueState>) -> Option<Bean> {
        let pos = state.submitted.iter().position(|b| !b.status.is_paused())?;
        let bean = state.submitted.remove(pos)?;
        state.status_set.push(bean.clone());
        self.persist_best_effort(state);
        Some(bean)
    }

    /// Wake any consumer blocked in [`next_for_consumer`](Self::next_for_consumer).
    pub fn wake(&self) {
        self.available.notify_all();
    }

    /// Change the status of a bean that is still pending.
    ///
    /// Returns the updated bean, or `None` if it is not in the submission queue.
    pub fn set_queued_status(&self, id: BeanId, status: Status) -> Option<Bean> {
        let mut state = self.state.lock();
        let pos = state.position(id)?;
        let bean = state.submitted.get_mut(pos)?;
        bean.set_status(status);
        let updated = bean.clone();
        self.persist_best_effort(&state);
        drop(state);
        self.available.notify_all();
        Some(updated)
    }

    /// Record a status update for a bean in the status set.
    ///
    /// Final beans are never overwritten.
    pub fn update_status(&self, bean: &Bean) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state.status_set.iter_mut().find(|b| b.id == bean.id) else {
            return false;
        };
        if slot.status.is_final() && slot.status != bean.status {
            return false;
        }
        *slot = bean.clone();
        self.persist_best_effort(&state);
        true
    }

    /// Find a bean in either collection.
    pub fn get(&self, id: BeanId) -> Option<Bean> {
        let state = self.state.lock();
        state
            .submitted
            .iter()
            .chain(state.status_set.iter())
            .find(|b| b.id == id)
            .cloned()
    }

    pub fn is_submitted(&self, id: BeanId) -> bool {
        self.state.lock().position(id).is_some()
    }

    /// Consistent copy of both collections.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.state.lock().snapshot()
    }

    /// Pending beans in priority order.
    pub fn submitted(&self) -> Vec<Bean> {
        self.state.lock().submitted.iter().cloned().collect()
    }

    /// Status set sorted by submission time, newest first.
    pub fn running_and_completed(&self) -> Vec<Bean> {
        let mut beans = self.state.lock().status_set.clone();
        beans.sort_by(|a, b| b.submission_time.cmp(&a.submission_time));
        beans
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().submitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().submitted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    fn ids(beans: &[Bean]) -> Vec<BeanId> {
        beans.iter().map(|b| b.id).collect()
    }

    #[test]
    fn move_forward_twice_brings_third_to_front() {
        let queue = BeanQueue::new("q");
        let first = Bean::new("1", "echo");
        let second = Bean::new("2", "echo");
        let third = Bean::new("3", "echo");
        for bean in [&first, &second, &third] {
            queue.submit(bean.clone()).unwrap();
        }

        assert!(queue.move_forward(third.id));
        assert!(queue.move_forward(third.id));
        assert!(!queue.move_forward(third.id));

        assert_eq!(ids(&queue.submitted()), vec![third.id, first.id, second.id]);
    }

    #[test]
    fn boundaries_and_missing_beans_fail_silently() {
        let queue = BeanQueue::new("q");
        let a = Bean::new("a", "echo");
        let b = Bean::new("b", "echo");
        queue.submit(a.clone()).unwrap();
        queue.submit(b.clone()).unwrap();

        assert!(!queue.move_forward(a.id));
        assert!(!queue.move_backward(b.id));
        assert!(!queue.move_forward(BeanId::new()));
        assert!(!queue.remove(BeanId::new()));
        assert!(queue.move_backward(a.id));
        assert_eq!(ids(&queue.submitted()), vec![b.id, a.id]);
    }

    #[test]
    fn duplicate_submission_is_rejected() {
        let queue = BeanQueue::new("q");
        let bean = Bean::new("a", "echo");
        queue.submit(bean.clone()).unwrap();
        assert!(matches!(queue.submit(bean), Err(EngineError::Protocol(_))));
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn dequeued_bean_is_in_exactly_one_collection() {
        let queue = BeanQueue::new("q");
        let bean = Bean::new("a", "echo");
        queue.submit(bean.clone()).unwrap();

        let snapshot = queue.snapshot();
        assert!(snapshot.is_submitted(bean.id) && !snapshot.in_status_set(bean.id));

        let taken = queue.next_for_consumer(Duration::ZERO).unwrap();
        assert_eq!(taken.id, bean.id);

        let snapshot = queue.snapshot();
        assert!(!snapshot.is_submitted(bean.id) && snapshot.in_status_set(bean.id));

        // Already promoted: remove is a no-op.
        assert!(!queue.remove(bean.id));
        assert!(queue.get(bean.id).is_some());
    }

    #[test]
    fn held_beans_are_skipped_but_keep_their_place() {
        let queue = BeanQueue::new("q");
        let held = Bean::new("held", "echo");
        let free = Bean::new("free", "echo");
        queue.submit(held.clone()).unwrap();
        queue.submit(free.clone()).unwrap();

        queue.set_queued_status(held.id, Status::Paused).unwrap();
        let taken = queue.next_for_consumer(Duration::ZERO).unwrap();
        assert_eq!(taken.id, free.id);
        assert!(queue.next_for_consumer(Duration::from_millis(20)).is_none());

        queue.set_queued_status(held.id, Status::Submitted).unwrap();
        assert_eq!(queue.next_for_consumer(Duration::ZERO).unwrap().id, held.id);
    }

    #[test]
    fn next_for_consumer_wakes_on_submit() {
        let queue = Arc::new(BeanQueue::new("q"));
        let waiter = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.next_for_consumer(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        let bean = Bean::new("late", "echo");
        queue.submit(bean.clone()).unwrap();

        assert_eq!(waiter.join().unwrap().map(|b| b.id), Some(bean.id));
    }

    #[test]
    fn closed_gate_takes_nothing() {
        let queue = BeanQueue::new("q");
        let bean = Bean::new("a", "echo");
        queue.submit(bean.clone()).unwrap();

        let claimed = Mutex::new(Vec::new());
        let claim = |b: &Bean| claimed.lock().push(b.id);

        assert!(queue.next_for_consumer_when(Duration::from_millis(20), || false, claim).is_none());
        assert!(queue.is_submitted(bean.id));
        assert!(claimed.lock().is_empty());

        let taken = queue.next_for_consumer_when(Duration::ZERO, || true, claim).unwrap();
        assert_eq!(taken.id, bean.id);
        assert_eq!(*claimed.lock(), vec![bean.id]);
    }

    #[test]
    fn clean_up_follows_the_age_rules() {
        let queue = BeanQueue::new("q");
        let now = Utc::now();

        let mut failed = Bean::new("failed", "echo");
        failed.fail("boom");
        let mut stale = Bean::new("stale", "echo").with_submission_time(now - chrono::Duration::days(3));
        stale.set_status(Status::Running);
        let mut recent_done =
            Bean::new("done", "echo").with_submission_time(now - chrono::Duration::days(2));
        recent_done.set_status(Status::Complete);

        for bean in [&failed, &stale, &recent_done] {
            queue.submit(bean.clone()).unwrap();
            queue.next_for_consumer(Duration::ZERO).unwrap();
            queue.update_status(bean);
        }

        let report = queue.clean_up_completed(
            Duration::from_secs(2 * 24 * 3600),
            Duration::from_secs(7 * 24 * 3600),
        );

        assert_eq!(report.removed, 2);
        assert_eq!(ids(&queue.running_and_completed()), vec![recent_done.id]);
    }

    #[test]
    fn clean_up_fails_ambiguous_beans_and_keeps_paused_ones() {
        let queue = BeanQueue::new("q");
        let preparing = Bean::new("preparing", "echo");
        let paused = Bean::new("paused", "echo");
        let young_running = Bean::new("running", "echo");
        let old_done = Bean::new("old", "echo")
            .with_submission_time(Utc::now() - chrono::Duration::days(8));

        for (bean, status) in [
            (&preparing, Status::Preparing),
            (&paused, Status::Paused),
            (&young_running, Status::Running),
            (&old_done, Status::Complete),
        ] {
            queue.submit(bean.clone()).unwrap();
            let mut taken = queue.next_for_consumer(Duration::ZERO).unwrap();
            taken.set_status(status);
            queue.update_status(&taken);
        }

        let report = queue.clean_up_completed(
            Duration::from_secs(2 * 24 * 3600),
            Duration::from_secs(7 * 24 * 3600),
        );
        assert_eq!(report, CleanUpReport { removed: 1, failed: 1 });

        assert_eq!(queue.get(preparing.id).unwrap().status, Status::Failed);
        assert_eq!(queue.get(paused.id).unwrap().status, Status::Paused);
        assert_eq!(queue.get(young_running.id).unwrap().status, Status::Running);
        assert!(queue.get(old_done.id).is_none());
    }

    #[test]
    fn final_beans_are_not_overwritten() {
        let queue = BeanQueue::new("q");
        let bean = Bean::new("a", "echo");
        queue.submit(bean.clone()).unwrap();
        let mut taken = queue.next_for_consumer(Duration::ZERO).unwrap();
        taken.set_status(Status::Complete);
        assert!(queue.update_status(&taken));

        let mut late = taken.clone();
        late.status = Status::Running;
        assert!(!queue.update_status(&late));
        assert_eq!(queue.get(bean.id).unwrap().status, Status::Complete);
    }

    #[test]
    fn clearing_keeps_live_beans() {
        let queue = BeanQueue::new("q");
        for name in ["a", "b", "c"] {
            queue.submit(Bean::new(name, "echo")).unwrap();
        }
        let mut running = queue.next_for_consumer(Duration::ZERO).unwrap();
        running.set_status(Status::Running);
        queue.update_status(&running);
        let mut done = queue.next_for_consumer(Duration::ZERO).unwrap();
        done.set_status(Status::Complete);
        queue.update_status(&done);

        assert_eq!(queue.clear_running_and_completed(), 1);
        assert_eq!(ids(&queue.running_and_completed()), vec![running.id]);
        assert_eq!(queue.clear_queue(), 1);
        assert!(queue.is_empty());
    }

    struct RejectingStore;

    impl QueueStore for RejectingStore {
        fn load(&self, _queue: &str) -> EngineResult<Option<QueueSnapshot>> {
            Ok(None)
        }

        fn save(&self, _queue: &str, _snapshot: &QueueSnapshot) -> EngineResult<()> {
            Err(EngineError::Persistence("disk full".into()))
        }

        fn delete(&self, _queue: &str) -> EngineResult<()> {
            Ok(())
        }
    }

    #[test]
    fn rejected_submission_is_rolled_back() {
        let queue = BeanQueue::with_store("q", Arc::new(RejectingStore)).unwrap();
        let result = queue.submit(Bean::new("a", "echo"));
        assert!(matches!(result, Err(EngineError::Persistence(_))));
        assert!(queue.is_empty());
    }

    #[test]
    fn store_contents_are_restored() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn QueueStore> = Arc::new(crate::persistence::JsonFileStore::new(dir.path()));
        let bean = Bean::new("a", "echo");
        {
            let queue = BeanQueue::with_store("q", store.clone()).unwrap();
            queue.submit(bean.clone()).unwrap();
            queue.submit(Bean::new("b", "echo")).unwrap();
            queue.next_for_consumer(Duration::ZERO).unwrap();
        }
        let queue = BeanQueue::with_store("q", store).unwrap();
        assert_eq!(queue.pending_len(), 1);
        assert!(queue.snapshot().in_status_set(bean.id));
    }
}
