mod common;

use common::{init_tracing, lsn_of, table_of, wait_until, Cluster, INGEST_QUEUE};
use dstream::cdc::{CheckpointStore, FileCheckpointStore, Lsn};
use dstream::locking::Locker;
use dstream::publisher::Message;
use dstream::router::RouterStats;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn ascending(lsns: &[String]) -> bool {
    lsns.windows(2).all(|pair| pair[0] < pair[1])
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_two_tables() {
    init_tracing();
    let cluster = Cluster::new();
    cluster.add_table("Persons", 3);
    cluster.add_table("Cars", 3);

    let worker = cluster.worker(&["Persons", "Cars"]);
    let cancel = CancellationToken::new();
    let ingesting = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    wait_until("both checkpoints", || {
        cluster.checkpoints.get("Persons") == Some(Lsn::from_u64(3))
            && cluster.checkpoints.get("Cars") == Some(Lsn::from_u64(3))
    })
    .await;
    assert_eq!(cluster.bus.messages(INGEST_QUEUE).len(), 6);

    let router = cluster.router();
    let receiver = cluster.bus.receiver(INGEST_QUEUE);
    let stop_router = CancellationToken::new();
    let routing = {
        let cancel = stop_router.clone();
        tokio::spawn(async move { router.run(receiver, cancel).await })
    };
    wait_until("router commit", || cluster.bus.committed(INGEST_QUEUE) == Some(6)).await;

    for table in ["Persons", "Cars"] {
        let topic = cluster.topic(table);
        assert_eq!(topic, format!("h.testdb.{}.events", table.to_lowercase()));

        let events = cluster.events(&topic);
        assert_eq!(events.len(), 3, "events on {}", topic);
        assert!(events.iter().all(|e| table_of(e) == table));
        assert!(events.iter().all(|e| e["metadata"]["OperationType"] == "Insert"));
        let lsns: Vec<String> = events.iter().map(lsn_of).collect();
        assert!(ascending(&lsns), "LSNs on {} not ascending: {:?}", topic, lsns);

        // Forwarded bodies are byte-identical to what the ingester queued.
        let queued: Vec<Message> = cluster
            .bus
            .messages(INGEST_QUEUE)
            .into_iter()
            .filter(|m| m.key.as_deref() == Some(table))
            .collect();
        let forwarded: Vec<_> = cluster.bus.messages(&topic).into_iter().map(|m| m.payload).collect();
        let expected: Vec<_> = queued.into_iter().map(|m| m.payload).collect();
        assert_eq!(forwarded, expected);
    }

    stop_router.cancel();
    assert_eq!(
        routing.await.unwrap().unwrap(),
        RouterStats { forwarded: 6, dropped: 0 }
    );

    cancel.cancel();
    let report = ingesting.await.unwrap().unwrap();
    assert_eq!(report.started, vec!["Persons".to_string(), "Cars".to_string()]);
    assert!(report.failed.is_empty());
    assert!(!cluster.locks.is_held("Persons.lock"));
    assert!(!cluster.locks.is_held("Cars.lock"));
}

#[tokio::test(start_paused = true)]
async fn test_contended_lease_goes_to_one_worker() {
    init_tracing();
    let cluster = Cluster::new();
    cluster.add_table("Persons", 3);
    cluster.add_table("Cars", 3);

    let cancel = CancellationToken::new();
    let worker_a = cluster.worker(&["Persons"]);
    let a = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker_a.run(cancel).await })
    };
    wait_until("worker A lease", || cluster.locks.is_held("Persons.lock")).await;

    let worker_b = cluster.worker(&["Persons", "Cars"]);
    let b = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker_b.run(cancel).await })
    };

    wait_until("six events", || cluster.bus.messages(INGEST_QUEUE).len() == 6).await;
    // Give both workers time for a few more polls.
    tokio::time::sleep(Duration::from_secs(20)).await;
    cancel.cancel();

    let report_a = a.await.unwrap().unwrap();
    let report_b = b.await.unwrap().unwrap();
    assert_eq!(report_a.started, vec!["Persons".to_string()]);
    assert_eq!(report_b.skipped, vec!["Persons".to_string()]);
    assert_eq!(report_b.started, vec!["Cars".to_string()]);

    let persons = cluster
        .events(INGEST_QUEUE)
        .into_iter()
        .filter(|e| table_of(e) == "Persons")
        .count();
    assert_eq!(persons, 3);
    assert_eq!(cluster.bus.messages(INGEST_QUEUE).len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_stale_lease_is_recovered_without_loss() {
    init_tracing();
    let cluster = Cluster::new();
    cluster.add_table("Cars", 3);

    // Worker A took the lease, checkpointed LSN 2, then died without releasing.
    let crashed = cluster.locks.peer();
    crashed.acquire("Cars.lock").await.unwrap().unwrap();
    cluster
        .checkpoints
        .save("Cars", Lsn::from_u64(2))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(180)).await;

    let worker_b = cluster.worker(&["Cars"]);
    let cancel = CancellationToken::new();
    let b = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker_b.run(cancel).await })
    };

    wait_until("checkpoint at LSN 3", || {
        cluster.checkpoints.get("Cars") == Some(Lsn::from_u64(3))
    })
    .await;
    cancel.cancel();
    let report = b.await.unwrap().unwrap();
    assert_eq!(report.started, vec!["Cars".to_string()]);
    assert!(report.skipped.is_empty());

    // Only what followed the last checkpoint is re-read.
    let lsns: Vec<String> = cluster.events(INGEST_QUEUE).iter().map(lsn_of).collect();
    assert_eq!(lsns, vec![Lsn::from_u64(3).to_hex()]);
    assert!(!cluster.locks.is_held("Cars.lock"));
}

#[tokio::test(start_paused = true)]
async fn test_publish_failures_then_single_checkpoint() {
    init_tracing();
    let cluster = Cluster::new();
    cluster.add_table("Persons", 3);
    cluster.bus.fail_next_publishes(INGEST_QUEUE, 2);

    let worker = cluster.worker(&["Persons"]);
    let cancel = CancellationToken::new();
    let running = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    wait_until("checkpoint", || {
        cluster.checkpoints.get("Persons") == Some(Lsn::from_u64(3))
    })
    .await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    cancel.cancel();
    let report = running.await.unwrap().unwrap();
    assert!(report.failed.is_empty());

    assert_eq!(cluster.checkpoints.saves("Persons"), vec![Lsn::from_u64(3)]);
    assert_eq!(cluster.bus.publish_attempts(INGEST_QUEUE), 3);
    let lsns: Vec<String> = cluster.events(INGEST_QUEUE).iter().map(lsn_of).collect();
    assert_eq!(lsns.len(), 3);
    assert!(ascending(&lsns));
}

#[tokio::test(start_paused = true)]
async fn test_failed_checkpoint_republishes_batch() {
    init_tracing();
    let cluster = Cluster::new();
    cluster.add_table("Persons", 3);
    cluster.checkpoints.fail_next_saves(1);

    let worker = cluster.worker(&["Persons"]);
    let cancel = CancellationToken::new();
    let running = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    wait_until("checkpoint", || {
        cluster.checkpoints.get("Persons") == Some(Lsn::from_u64(3))
    })
    .await;
    cancel.cancel();
    running.await.unwrap().unwrap();

    // At-least-once: the batch is sent again, nothing is skipped.
    let lsns: Vec<String> = cluster.events(INGEST_QUEUE).iter().map(lsn_of).collect();
    assert_eq!(lsns.len(), 6);
    for lsn in 1..=3 {
        let hex = Lsn::from_u64(lsn).to_hex();
        assert_eq!(lsns.iter().filter(|l| **l == hex).count(), 2);
    }
}

#[tokio::test]
async fn test_router_resumes_after_committed_offset() {
    init_tracing();
    let cluster = Cluster::new();
    let topic = "h.db.persons.events";
    let event = |n: u32| {
        Message::new(
            Some("Persons".to_string()),
            format!(
                r#"{{"metadata":{{"TableName":"Persons","Destination":"{}"}},"data":{{"ID":"{}"}}}}"#,
                topic, n
            )
            .into_bytes(),
        )
    };
    cluster.bus.inject(INGEST_QUEUE, event(1));
    cluster.bus.inject(INGEST_QUEUE, event(2));

    for (expected_commit, forwarded) in [(2, 2u64), (3, 1)] {
        let router = cluster.router();
        let receiver = cluster.bus.receiver(INGEST_QUEUE);
        let cancel = CancellationToken::new();
        let routing = {
            let cancel = cancel.clone();
            tokio::spawn(async move { router.run(receiver, cancel).await })
        };
        wait_until("router commit", || {
            cluster.bus.committed(INGEST_QUEUE) == Some(expected_commit)
        })
        .await;
        cancel.cancel();
        let stats = routing.await.unwrap().unwrap();
        assert_eq!(stats.forwarded, forwarded);

        // Arrives while no router is running.
        if expected_commit == 2 {
            cluster.bus.inject(INGEST_QUEUE, event(3));
        }
    }

    let bodies: Vec<_> = cluster.bus.messages(topic).into_iter().map(|m| m.payload).collect();
    let queued: Vec<_> = cluster.bus.messages(INGEST_QUEUE).into_iter().map(|m| m.payload).collect();
    assert_eq!(bodies, queued);
}

#[tokio::test]
async fn test_file_checkpoint_save_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.json");
    let store = FileCheckpointStore::new(&path);
    store.initialize().await.unwrap();

    let lsn = Lsn::from_u64(42);
    store.save("Persons", lsn).await.unwrap();
    store.save("Persons", lsn).await.unwrap();

    let document: serde_json::Value =
        serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
    let tables = document["tables"].as_object().unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables["Persons"]["lsn"], lsn.to_hex());

    let reopened = FileCheckpointStore::new(&path);
    assert_eq!(reopened.load("Persons", Lsn::ZERO).await.unwrap(), lsn);
    assert_eq!(reopened.load("Cars", Lsn::ZERO).await.unwrap(), Lsn::ZERO);
}
