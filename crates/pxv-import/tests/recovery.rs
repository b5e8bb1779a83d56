//! Restarting the engine over a persisted task list.

mod common;

use std::sync::Arc;

use common::{harness, wait_terminal, TestLibrary};
use pxv_core::{MediaId, MediaType};
use pxv_import::{
    ImportProgress, ImportTask, ImportUnit, JsonTaskStore, Provenance, ResourceOrigin,
    ResourceRecord, TaskId, TaskKind, TaskState, TaskStore, UnitStatus,
};

fn persisted_task(key_id: &str, units: Vec<ImportUnit>) -> ImportTask {
    ImportTask {
        id: TaskId::generate(),
        created_at: 1_700_000_000,
        kind: TaskKind::Import,
        provenance: Provenance::Files,
        key_id: key_id.to_string(),
        state: TaskState::Running,
        progress: ImportProgress::default(),
        units,
        side_resources_removed: false,
    }
}

fn pending_unit(id: &str, scratch_path: std::path::PathBuf) -> ImportUnit {
    unit_from(id, ResourceOrigin::Staged { scratch_path })
}

fn unit_from(id: &str, origin: ResourceOrigin) -> ImportUnit {
    ImportUnit {
        media_id: MediaId::new(id),
        resources: vec![ResourceRecord {
            media_type: MediaType::Photo,
            origin,
            captured_at: None,
            file_name: Some(format!("{id}.jpg")),
            side_resource: None,
            location: None,
        }],
        status: UnitStatus::Pending,
    }
}

#[tokio::test]
async fn test_interrupted_task_comes_back_paused_and_resumes() {
    let h = harness();
    let path = h.dir.path().join("state/tasks.json");

    // First process: stops for good while saving the third item.
    let sink = h.sink().gate_at(2);
    let engine = h.engine_with(sink.clone(), Arc::new(JsonTaskStore::new(&path)), 1);
    let id = engine
        .submit(h.items(&["m1", "m2", "m3", "m4", "m5"]), Provenance::Files)
        .await
        .unwrap();
    sink.entered.notified().await;

    // Second process over the same task list.
    let sink = h.sink();
    let engine = h.engine_with(sink.clone(), Arc::new(JsonTaskStore::new(&path)), 1);
    let task = engine.task(id).unwrap();
    assert_eq!(task.state, TaskState::Paused);
    assert_eq!(task.saved_count(), 2);
    assert_eq!(task.pending_count(), 3);
    assert_eq!(task.progress.current_file_index, 2);

    let on_disk = JsonTaskStore::new(&path).load().unwrap();
    assert_eq!(on_disk[0].state, TaskState::Paused);

    engine.resume(id).await.unwrap();
    let done = wait_terminal(&engine, id).await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.saved_count(), 5);
    assert_eq!(sink.calls(), 3);
    assert_eq!(h.stored().await.len(), 5);
}

#[tokio::test]
async fn test_item_stored_before_crash_is_not_saved_again() {
    let h = harness();
    let path = h.dir.path().join("tasks.json");

    // The save went through but the process died before recording it.
    let already = h.item("m1");
    let scratch = match &already.media.source {
        pxv_core::MediaSource::Scratch(p) => p.clone(),
        other => panic!("unexpected source {other:?}"),
    };
    let record = h.storage.save(already.media, &h.key).await.unwrap();
    assert!(!scratch.exists());

    let lost = h.scratch_dir().join("never-staged.jpg");
    let store = JsonTaskStore::new(&path);
    let task = persisted_task(
        h.key.id(),
        vec![pending_unit("m1", scratch), pending_unit("gone", lost)],
    );
    let id = task.id;
    store.save(&[task]).unwrap();

    let sink = h.sink();
    let engine = h.engine_with(sink.clone(), Arc::new(store), 1);
    assert_eq!(engine.task(id).unwrap().state, TaskState::Paused);
    engine.resume(id).await.unwrap();

    let done = wait_terminal(&engine, id).await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(sink.calls(), 0);
    assert_eq!(done.units[0].status, UnitStatus::Saved);
    assert_eq!(
        done.units[0].resources[0].location.as_deref(),
        Some(record.location.as_str())
    );
    assert!(matches!(done.units[1].status, UnitStatus::Failed { .. }));
}

#[tokio::test]
async fn test_finished_tasks_survive_restart_unchanged() {
    let h = harness();
    let path = h.dir.path().join("tasks.json");

    let engine = h.engine_with(h.sink(), Arc::new(JsonTaskStore::new(&path)), 1);
    let id = engine
        .submit(h.items(&["m1", "m2"]), Provenance::Camera)
        .await
        .unwrap();
    let done = wait_terminal(&engine, id).await;
    drop(engine);

    let engine = h.engine_with(h.sink(), Arc::new(JsonTaskStore::new(&path)), 1);
    let reloaded = engine.task(id).unwrap();
    assert_eq!(reloaded.state, TaskState::Completed);
    assert_eq!(reloaded.progress.overall_progress, 1.0);
    assert_eq!(reloaded.units, done.units);
    assert!(matches!(
        engine.resume(id).await,
        Err(pxv_import::ImportError::NotPaused { .. })
    ));
}

#[tokio::test]
async fn test_library_unit_stored_before_crash_is_not_fetched_again() {
    let h = harness();
    let path = h.dir.path().join("tasks.json");

    let stored = h.item("m1");
    h.storage.save(stored.media, &h.key).await.unwrap();

    let store = JsonTaskStore::new(&path);
    let task = persisted_task(
        h.key.id(),
        vec![
            unit_from(
                "m1",
                ResourceOrigin::Library {
                    external_ref: "m1.jpg".into(),
                },
            ),
            unit_from(
                "m2",
                ResourceOrigin::Library {
                    external_ref: "m2.jpg".into(),
                },
            ),
        ],
    );
    let id = task.id;
    store.save(&[task]).unwrap();

    let library = Arc::new(TestLibrary::new(h.scratch_dir()));
    let sink = h.sink();
    let engine = h.engine_with_library(sink.clone(), Arc::new(store), library.clone());
    engine.resume(id).await.unwrap();

    let done = wait_terminal(&engine, id).await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.saved_count(), 2);
    assert_eq!(library.fetched(), vec!["m2.jpg".to_string()]);
    assert_eq!(sink.calls(), 1);
    assert_eq!(h.stored().await.len(), 2);
}
