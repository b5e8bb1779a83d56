//! Moving stored items from one key to another.

mod common;

use common::{harness, wait_terminal, wait_until, Harness};
use pxv_crypto::MediaKey;
use pxv_import::{ImportError, Provenance, TaskKind, TaskState, UnitStatus};
use tokio_test::assert_ok;

/// Store `ids` under the harness key and add a second key, "k2".
async fn stored_under_k1(h: &Harness, ids: &[&str]) {
    for item in h.items(ids) {
        h.storage.save(item.media, &h.key).await.unwrap();
    }
    h.keys.insert(MediaKey::generate("k2"));
}

#[tokio::test]
async fn test_move_reseals_under_target_and_removes_sources() {
    let h = harness();
    stored_under_k1(&h, &["m1", "m2", "m3"]).await;
    let sink = h.sink();
    let engine = h.engine(sink.clone());

    let id = engine.submit_move(h.stored().await, "k2").await.unwrap();
    let task = wait_terminal(&engine, id).await;
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.kind, TaskKind::Move);
    assert_eq!(task.provenance, Provenance::Store);
    assert_eq!(task.key_id, "k2");
    assert_eq!(task.saved_count(), 3);
    assert_eq!(sink.calls(), 3);

    assert!(h.stored().await.is_empty());
    let moved = h.stored_under("k2").await;
    assert_eq!(moved.len(), 3);
    for record in &moved {
        assert_eq!(record.key_id, "k2");
        let name = format!("{}.jpg", record.id);
        assert_eq!(h.read_back(record).await, Harness::payload(&name));
    }
}

#[tokio::test]
async fn test_move_can_pause_and_resume() {
    let h = harness();
    stored_under_k1(&h, &["m1", "m2", "m3", "m4"]).await;
    let sink = h.sink().gate_at(1);
    let engine = h.engine(sink.clone());

    let id = engine.submit_move(h.stored().await, "k2").await.unwrap();
    let mut rx = engine.subscribe(id).unwrap();
    sink.entered.notified().await;
    assert_ok!(engine.pause(id).await);
    sink.release();

    let paused = wait_until(&mut rx, |t| t.state == TaskState::Paused).await;
    assert_eq!(paused.saved_count(), 2);
    assert_eq!(h.stored().await.len(), 2);
    assert_eq!(h.stored_under("k2").await.len(), 2);

    engine.resume(id).await.unwrap();
    let done = wait_until(&mut rx, |t| t.is_terminal()).await;
    assert_eq!(done.state, TaskState::Completed);
    assert!(h.stored().await.is_empty());
    assert_eq!(h.stored_under("k2").await.len(), 4);
}

#[tokio::test]
async fn test_failed_copy_keeps_the_source() {
    let h = harness();
    stored_under_k1(&h, &["m1", "m2"]).await;
    let sink = h.sink();
    sink.fail("m2.jpg");
    let engine = h.engine(sink);

    let id = engine.submit_move(h.stored().await, "k2").await.unwrap();
    let task = wait_terminal(&engine, id).await;
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.failed_count(), 1);

    let left: Vec<_> = h.stored().await.into_iter().map(|r| r.id.to_string()).collect();
    assert_eq!(left, vec!["m2"]);
    let moved: Vec<_> = h
        .stored_under("k2")
        .await
        .into_iter()
        .map(|r| r.id.to_string())
        .collect();
    assert_eq!(moved, vec!["m1"]);
}

#[tokio::test]
async fn test_source_that_cannot_be_removed_is_reported() {
    let h = harness();
    stored_under_k1(&h, &["m1"]).await;
    let sink = h.sink();
    sink.keep_sources();
    let engine = h.engine(sink);

    let id = engine.submit_move(h.stored().await, "k2").await.unwrap();
    let task = wait_terminal(&engine, id).await;
    match &task.units[0].status {
        UnitStatus::Failed { reason } => assert!(reason.contains("could not be removed")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(h.stored().await.len(), 1);
    assert_eq!(h.stored_under("k2").await.len(), 1);
}

#[tokio::test]
async fn test_move_rejects_unknown_or_same_key() {
    let h = harness();
    stored_under_k1(&h, &["m1"]).await;
    let engine = h.engine(h.sink());
    let records = h.stored().await;

    assert!(matches!(
        engine.submit_move(records.clone(), "nope").await,
        Err(ImportError::KeyUnavailable(_))
    ));
    assert!(matches!(
        engine.submit_move(records, "k1").await,
        Err(ImportError::AlreadyUnderKey(_))
    ));
    assert!(engine.list_tasks().is_empty());
}
