#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use common::{consumer, wait_for, wait_for_process};
use engine::{
    Consumer, ConsumerConfig, InMemoryTransport, JsonFileStore, ProcessFactoryRegistry, QueueStore,
    Transport,
};
use queue_core::{Bean, BeanId, ConsumerInfo, ConsumerStatus, Status};

#[test]
fn pause_on_start_keeps_the_bean_queued_until_resume() {
    let transport = Arc::new(InMemoryTransport::new());
    let consumer = consumer(ConsumerConfig::new("scan").with_pause_on_start(true), transport);
    let id = consumer.submit(Bean::new("tomography", "echo")).unwrap();

    consumer.start().unwrap();
    assert_eq!(consumer.status(), ConsumerStatus::Paused);

    thread::sleep(Duration::from_millis(300));
    let snapshot = consumer.queue().snapshot();
    assert!(snapshot.is_submitted(id));
    assert!(!snapshot.in_status_set(id));

    assert!(consumer.resume());
    wait_for(&consumer, id, Status::Complete);
    consumer.stop().unwrap();
}

#[test]
fn pause_on_start_with_empty_queue_runs() {
    let transport = Arc::new(InMemoryTransport::new());
    let consumer = consumer(ConsumerConfig::new("scan").with_pause_on_start(true), transport);
    consumer.start().unwrap();
    assert_eq!(consumer.status(), ConsumerStatus::Running);
    consumer.stop().unwrap();
}

#[test]
fn running_job_is_paused_then_terminated() {
    let transport = Arc::new(InMemoryTransport::new());
    let consumer = consumer(ConsumerConfig::new("scan"), transport);
    consumer.start().unwrap();

    let id = consumer.submit(Bean::new("long", "step")).unwrap();
    let process = wait_for_process(&consumer, id);

    assert!(consumer.pause_job(id).unwrap());
    assert!(!consumer.pause_job(id).unwrap());
    wait_for(&consumer, id, Status::Paused);

    assert!(consumer.terminate_job(id).unwrap());
    let bean = wait_for(&consumer, id, Status::Terminated);
    assert!(bean.end_time.is_some());
    assert_eq!(process.status(), Status::Terminated);

    // The loop carries on with the next bean.
    let next = consumer.submit(Bean::new("next", "echo")).unwrap();
    wait_for(&consumer, next, Status::Complete);
    consumer.stop().unwrap();
}

#[test]
fn failed_process_is_reported_and_loop_continues() {
    let transport = Arc::new(InMemoryTransport::new());
    let consumer = consumer(ConsumerConfig::new("scan"), transport);
    consumer.start().unwrap();

    let failed = consumer.submit(Bean::new("broken", "fail")).unwrap();
    let ok = consumer.submit(Bean::new("fine", "echo")).unwrap();

    let bean = wait_for(&consumer, failed, Status::Failed);
    assert_eq!(bean.message.as_deref(), Some("Process error: detector offline"));
    wait_for(&consumer, ok, Status::Complete);
    consumer.stop().unwrap();
}

#[test]
fn non_blocking_beans_run_side_by_side() {
    let transport = Arc::new(InMemoryTransport::new());
    let consumer = consumer(ConsumerConfig::new("scan").with_blocking(false), transport);
    consumer.start().unwrap();

    let a = consumer.submit(Bean::new("a", "step")).unwrap();
    let b = consumer.submit(Bean::new("b", "step")).unwrap();
    let first = wait_for_process(&consumer, a);
    assert!(first.pause().unwrap());

    // The paused bean does not hold up the queue.
    wait_for(&consumer, b, Status::Complete);
    assert_eq!(first.status(), Status::Paused);

    first.resume().unwrap();
    wait_for(&consumer, a, Status::Complete);
    consumer.stop().unwrap();
}

#[test]
fn every_bean_is_in_exactly_one_collection() {
    let transport = Arc::new(InMemoryTransport::new());
    let consumer = Arc::new(consumer(ConsumerConfig::new("load"), transport));
    consumer.start().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let submitted = Arc::new(parking_lot::Mutex::new(Vec::<BeanId>::new()));

    let watcher = {
        let consumer = consumer.clone();
        let done = done.clone();
        let submitted = submitted.clone();
        thread::spawn(move || {
            let mut checks = 0;
            while !done.load(Ordering::SeqCst) {
                let known: Vec<BeanId> = submitted.lock().clone();
                let snapshot = consumer.queue().snapshot();
                for id in known {
                    let queued = snapshot.is_submitted(id);
                    let moved = snapshot.in_status_set(id);
                    assert!(queued ^ moved, "bean {id} queued={queued} moved={moved}");
                }
                checks += 1;
            }
            checks
        })
    };

    for i in 0..200 {
        let bean = Bean::new(format!("bean-{i}"), "echo");
        let id = bean.id;
        // Recorded under the lock so the watcher never sees an id before it is submitted.
        let mut ids = submitted.lock();
        consumer.submit(bean).unwrap();
        ids.push(id);
    }

    let ids: Vec<BeanId> = submitted.lock().clone();
    for id in &ids {
        wait_for(&consumer, *id, Status::Complete);
    }
    done.store(true, Ordering::SeqCst);
    assert!(watcher.join().unwrap() > 0);

    let snapshot = consumer.queue().snapshot();
    let unique: HashSet<BeanId> = snapshot.status_set.iter().map(|b| b.id).collect();
    assert_eq!(unique.len(), 200);
    assert!(snapshot.submitted.is_empty());
    consumer.stop().unwrap();
}

#[test]
fn status_topic_sees_the_lifecycle() {
    let transport = Arc::new(InMemoryTransport::new());
    let consumer = consumer(ConsumerConfig::new("scan"), transport.clone());
    let status = transport.subscribe("scan.status").unwrap();

    let id = consumer.submit(Bean::new("a", "echo")).unwrap();
    consumer.start().unwrap();
    wait_for(&consumer, id, Status::Complete);
    consumer.stop().unwrap();

    let mut seen = Vec::new();
    while let Some(text) = status.try_recv().unwrap() {
        let bean: Bean = serde_json::from_str(&text).unwrap();
        seen.push(bean.status);
    }
    assert_eq!(seen, vec![Status::Preparing, Status::Running, Status::Complete]);
}

#[test]
fn heartbeat_is_published_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileStore::new(dir.path()));
    store.init().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let consumer = Consumer::builder(
        ConsumerConfig::new("scan"),
        Arc::new(common::registry()),
        transport.clone(),
    )
    .store(store.clone())
    .build()
    .unwrap();
    let heartbeats = transport.subscribe("scan.heartbeat").unwrap();

    consumer.start().unwrap();
    let info = consumer.heartbeat();
    assert_eq!(info.status, ConsumerStatus::Running);

    let wire: ConsumerInfo = serde_json::from_str(&heartbeats.try_recv().unwrap().unwrap()).unwrap();
    assert_eq!(wire.consumer_id, consumer.id());
    let recorded = store.load_heartbeat("scan").unwrap().unwrap();
    assert_eq!(recorded.consumer_id, consumer.id());
    consumer.stop().unwrap();
}

#[test]
fn queue_survives_a_new_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn QueueStore> = Arc::new(JsonFileStore::new(dir.path()));
    let transport = Arc::new(InMemoryTransport::new());

    let first = Consumer::builder(
        ConsumerConfig::new("scan"),
        Arc::new(ProcessFactoryRegistry::new()),
        transport.clone(),
    )
    .store(store.clone())
    .build()
    .unwrap();
    let a = first.submit(Bean::new("a", "echo")).unwrap();
    let b = first.submit(Bean::new("b", "echo")).unwrap();
    first.queue().move_forward(b);
    drop(first);

    let second = Consumer::builder(
        ConsumerConfig::new("scan"),
        Arc::new(common::registry()),
        transport,
    )
    .store(store)
    .build()
    .unwrap();
    let order: Vec<BeanId> = second.queue().submitted().iter().map(|bean| bean.id).collect();
    assert_eq!(order, vec![b, a]);

    second.start().unwrap();
    wait_for(&second, a, Status::Complete);
    second.stop().unwrap();
}

#[test]
fn restart_sweeps_finished_failures() {
    let transport = Arc::new(InMemoryTransport::new());
    let consumer = consumer(ConsumerConfig::new("scan"), transport);
    let mut events = consumer.subscribe();
    consumer.start().unwrap();

    let failed = consumer.submit(Bean::new("broken", "fail")).unwrap();
    wait_for(&consumer, failed, Status::Failed);

    consumer.restart().unwrap();
    assert!(consumer.queue().get(failed).is_none());
    assert_eq!(consumer.status(), ConsumerStatus::Running);

    let mut cleaned = false;
    while let Ok(event) = events.try_recv() {
        if let queue_core::ConsumerEvent::CleanedUp { removed, .. } = event {
            cleaned = removed == 1;
        }
    }
    assert!(cleaned);
    consumer.stop().unwrap();
}
