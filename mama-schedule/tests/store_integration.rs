//! Integration tests for ScheduleStore (CRUD, logs, cascade delete, recovery).
//! Uses multi_thread runtime so the store's block_in_place is allowed.

use mama_schedule::{LogStatus, NewSchedule, ScheduleStore, ScheduleUpdate};
use tempfile::NamedTempFile;

fn new_schedule(id: &str) -> NewSchedule {
    NewSchedule {
        id: Some(id.to_string()),
        name: format!("job {id}"),
        cron: "* * * * *".to_string(),
        prompt: "ping".to_string(),
        enabled: true,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn create_get_list_roundtrip_and_reopen() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();

    let store = ScheduleStore::new(&path).unwrap();
    let created = store.create_job(new_schedule("hb")).await.unwrap();
    assert_eq!(created.id, "hb");
    assert!(created.enabled);
    assert!(created.last_run.is_none());

    // Generated id when none given.
    let generated = store
        .create_job(NewSchedule {
            id: None,
            name: "auto".into(),
            cron: "@daily".into(),
            prompt: "p".into(),
            enabled: false,
        })
        .await
        .unwrap();
    assert!(uuid::Uuid::parse_str(&generated.id).is_ok());

    assert_eq!(store.list_jobs().await.unwrap().len(), 2);
    assert_eq!(store.list_enabled_jobs().await.unwrap().len(), 1);
    drop(store);

    let reopened = ScheduleStore::new(&path).unwrap();
    assert_eq!(reopened.list_jobs().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_update_touches_only_given_fields() {
    let file = NamedTempFile::new().unwrap();
    let store = ScheduleStore::new(file.path()).unwrap();
    store.create_job(new_schedule("hb")).await.unwrap();

    let updated = store
        .update_job(
            "hb",
            ScheduleUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!updated.enabled);
    assert_eq!(updated.cron, "* * * * *");
    assert_eq!(updated.prompt, "ping");
}

#[tokio::test(flavor = "multi_thread")]
async fn log_start_stamps_last_run_and_finish_finalizes() {
    let file = NamedTempFile::new().unwrap();
    let store = ScheduleStore::new(file.path()).unwrap();
    store.create_job(new_schedule("hb")).await.unwrap();

    let log_id = store.log_start("hb").await.unwrap();
    let running = store.get_log(log_id).await.unwrap();
    assert_eq!(running.status, LogStatus::Running);
    assert!(running.finished_at.is_none());
    assert!(store.get_job("hb").await.unwrap().last_run.is_some());

    store
        .log_finish(log_id, LogStatus::Success, Some("done".into()), None)
        .await
        .unwrap();
    let finished = store.get_log(log_id).await.unwrap();
    assert_eq!(finished.status, LogStatus::Success);
    assert_eq!(finished.output.as_deref(), Some("done"));
    assert!(finished.finished_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn logs_paginate_newest_first_and_last_execution() {
    let file = NamedTempFile::new().unwrap();
    let store = ScheduleStore::new(file.path()).unwrap();
    store.create_job(new_schedule("a")).await.unwrap();
    store.create_job(new_schedule("b")).await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = store.log_start("a").await.unwrap();
        store.log_finish(id, LogStatus::Success, None, None).await.unwrap();
        ids.push(id);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let other = store.log_start("b").await.unwrap();
    store
        .log_finish(other, LogStatus::Failed, None, Some("boom".into()))
        .await
        .unwrap();

    let logs = store.get_logs("a", 2, 0).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs[0].started_at >= logs[1].started_at);
    assert_eq!(store.get_logs("a", 2, 2).await.unwrap().len(), 1);

    let last = store.get_last_execution("a").await.unwrap().unwrap();
    assert_eq!(last.id, *ids.last().unwrap());

    let global = store.get_last_execution_global().await.unwrap().unwrap();
    assert_eq!(global.schedule_id, "b");
    assert_eq!(global.error.as_deref(), Some("boom"));
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_cascades_to_logs() {
    let file = NamedTempFile::new().unwrap();
    let store = ScheduleStore::new(file.path()).unwrap();
    store.create_job(new_schedule("hb")).await.unwrap();
    let log_id = store.log_start("hb").await.unwrap();

    store.delete_job("hb").await.unwrap();
    assert!(store.get_job("hb").await.is_err());
    assert!(store.get_log(log_id).await.is_err());
    assert!(store.delete_job("hb").await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn finalize_orphans_fails_running_rows() {
    let file = NamedTempFile::new().unwrap();
    let store = ScheduleStore::new(file.path()).unwrap();
    store.create_job(new_schedule("hb")).await.unwrap();
    let orphan = store.log_start("hb").await.unwrap();
    let closed = store.log_start("hb").await.unwrap();
    store
        .log_finish(closed, LogStatus::Success, None, None)
        .await
        .unwrap();

    assert_eq!(store.finalize_orphans().await.unwrap(), 1);
    let row = store.get_log(orphan).await.unwrap();
    assert_eq!(row.status, LogStatus::Failed);
    assert_eq!(row.error.as_deref(), Some("orphaned by restart"));
    // Idempotent: nothing left to finalize.
    assert_eq!(store.finalize_orphans().await.unwrap(), 0);
}
