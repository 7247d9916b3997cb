#![allow(clippy::disallowed_methods)]

mod common;

use chrono::Utc;
use queue_core::{Bean, ConsumerId, ConsumerInfo, ConsumerStatus, QueueSnapshot, Status};
use serde_json::json;
use std::error::Error;

use db::{DbError, repositories::BeanRepository, repositories::ConsumerRepository};

fn bean(name: &str, status: Status) -> Bean {
    let mut bean = Bean::new(name, "echo").with_payload(json!({ "msg": name }));
    bean.status = status;
    bean
}

#[test]
fn snapshot_round_trip_keeps_order() -> Result<(), Box<dyn Error>> {
    common::block_on(async {
        let _guard = common::setup_db().await?;

        let snapshot = QueueSnapshot {
            submitted: vec![
                bean("third", Status::Submitted),
                bean("first", Status::Submitted),
                bean("second", Status::Submitted),
            ],
            status_set: vec![bean("done", Status::Complete), bean("busy", Status::Running)],
        };

        BeanRepository::save_snapshot("scan", &snapshot).await?;
        let loaded = BeanRepository::load_snapshot("scan").await?;

        let names: Vec<&str> = loaded.submitted.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["third", "first", "second"]);
        assert_eq!(loaded.status_set.len(), 2);
        assert_eq!(loaded.submitted[0].payload, json!({ "msg": "third" }));

        // Saving again replaces rather than appends.
        let trimmed = QueueSnapshot {
            submitted: vec![snapshot.submitted[1].clone()],
            status_set: Vec::new(),
        };
        BeanRepository::save_snapshot("scan", &trimmed).await?;
        let loaded = BeanRepository::load_snapshot("scan").await?;
        assert_eq!(loaded.submitted.len(), 1);
        assert!(loaded.status_set.is_empty());

        let fetched = BeanRepository::get(snapshot.submitted[1].id).await?;
        assert_eq!(fetched.name, "first");

        let missing = BeanRepository::get(snapshot.submitted[0].id).await;
        assert!(matches!(missing, Err(DbError::NotFound(_))));

        Ok(())
    })
}

#[test]
fn queues_are_stored_independently() -> Result<(), Box<dyn Error>> {
    common::block_on(async {
        let _guard = common::setup_db().await?;

        let alpha = QueueSnapshot {
            submitted: vec![bean("a1", Status::Submitted)],
            status_set: vec![bean("a2", Status::Failed), bean("a3", Status::Complete)],
        };
        let beta = QueueSnapshot {
            submitted: vec![bean("b1", Status::Submitted)],
            status_set: Vec::new(),
        };
        BeanRepository::save_snapshot("alpha", &alpha).await?;
        BeanRepository::save_snapshot("beta", &beta).await?;

        let mut names = BeanRepository::queue_names().await?;
        names.sort();
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);

        let counts = BeanRepository::count_by_status("alpha").await?;
        assert_eq!(counts.get("FAILED").copied().unwrap_or(0), 1);
        assert_eq!(counts.get("COMPLETE").copied().unwrap_or(0), 1);
        assert_eq!(counts.get("SUBMITTED").copied().unwrap_or(0), 1);

        BeanRepository::delete_queue("alpha").await?;
        let empty = BeanRepository::load_snapshot("alpha").await?;
        assert!(empty.is_empty());
        let still_there = BeanRepository::load_snapshot("beta").await?;
        assert_eq!(still_there.submitted.len(), 1);

        Ok(())
    })
}

#[test]
fn consumer_heartbeats_upsert_by_queue() -> Result<(), Box<dyn Error>> {
    common::block_on(async {
        let _guard = common::setup_db().await?;

        let mut info = ConsumerInfo::new(ConsumerId::new(), "scan");
        info.status = ConsumerStatus::Running;
        info.start_time = Some(Utc::now());
        ConsumerRepository::upsert(&info).await?;

        info.status = ConsumerStatus::Paused;
        info.pending = 4;
        let updated = ConsumerRepository::upsert(&info).await?;
        assert_eq!(updated.status, ConsumerStatus::Paused);

        let all = ConsumerRepository::list().await?;
        assert_eq!(all.len(), 1);

        let loaded = ConsumerRepository::get("scan").await?;
        assert_eq!(loaded.pending, 4);
        assert_eq!(loaded.consumer_id, info.consumer_id);

        let paused = ConsumerRepository::list_by_status(ConsumerStatus::Paused).await?;
        assert!(paused.iter().all(|c| c.status == ConsumerStatus::Paused));

        ConsumerRepository::delete("scan").await?;
        let missing = ConsumerRepository::get("scan").await;
        assert!(matches!(missing, Err(DbError::NotFound(_))));

        Ok(())
    })
}

#[test]
fn second_endpoint_is_refused() -> Result<(), Box<dyn Error>> {
    common::block_on(async {
        let _guard = common::setup_db().await?;

        assert!(db::init_db(db::DbConfig::memory()).await.is_ok());
        let other = db::init_db(db::DbConfig::new("mem://elsewhere")).await;
        assert!(matches!(other, Err(DbError::AlreadyConnected(_))));
        Ok(())
    })
}
