use super::*;
use std::sync::Arc;
use std::time::Duration;

async fn sqlite_store() -> SqliteTaskStore {
    SqliteTaskStore::open_memory().await.unwrap()
}

fn sample_task(user_id: i64) -> Task {
    let mut task = Task::new(user_id, "img-1", "a lighthouse at dusk");
    task.count = 2;
    task
}

// ---------------------------------------------------------------------------
// Backend-agnostic property checks. The sqlite tests below and the opt-in
// postgres suite at the bottom run the same checks.
// ---------------------------------------------------------------------------

async fn check_insert_get_round_trip(store: &dyn TaskStore) {
    let mut task = sample_task(1);
    task.reference_image = "data:image/png;base64,QUJD".to_string();
    store.insert(&task).await.unwrap();

    let loaded = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, task.id);
    assert_eq!(loaded.user_id, 1);
    assert_eq!(loaded.model_id, "img-1");
    assert_eq!(loaded.prompt, "a lighthouse at dusk");
    assert_eq!(loaded.resolution, "1K");
    assert_eq!(loaded.aspect_ratio, "1:1");
    assert_eq!(loaded.reference_image, task.reference_image);
    assert_eq!(loaded.count, 2);
    assert_eq!(loaded.status, TaskStatus::Pending);
    assert_eq!(loaded.attempts, 0);
    assert!(loaded.image_urls.is_empty());
    assert!(loaded.next_attempt_at.is_none());
    assert!(loaded.completed_at.is_none());

    assert!(store.get("no-such-id").await.unwrap().is_none());
}

async fn check_claim_is_fifo(store: &dyn TaskStore) {
    let mut first = sample_task(1);
    first.created_at = 1_000;
    let mut second = sample_task(1);
    second.created_at = 2_000;
    // Insert newest first to prove ordering comes from created_at.
    store.insert(&second).await.unwrap();
    store.insert(&first).await.unwrap();

    let claimed = store.claim_next_pending().await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.status, TaskStatus::Running);
    assert!(claimed.completed_at.is_none());

    let claimed = store.claim_next_pending().await.unwrap().unwrap();
    assert_eq!(claimed.id, second.id);

    assert!(store.claim_next_pending().await.unwrap().is_none());
}

async fn check_claim_respects_next_attempt_at(store: &dyn TaskStore) {
    let mut deferred = sample_task(1);
    deferred.next_attempt_at = Some(now_unix() + 3_600);
    store.insert(&deferred).await.unwrap();
    assert!(store.claim_next_pending().await.unwrap().is_none());

    let mut due = sample_task(1);
    due.next_attempt_at = Some(now_unix() - 1);
    store.insert(&due).await.unwrap();
    let claimed = store.claim_next_pending().await.unwrap().unwrap();
    assert_eq!(claimed.id, due.id);
}

async fn check_single_winner_under_concurrent_claims(store: Arc<dyn TaskStore>) {
    store.insert(&sample_task(1)).await.unwrap();

    let mut join_set = tokio::task::JoinSet::new();
    for _ in 0..4 {
        let store = store.clone();
        join_set.spawn(async move { store.claim_next_pending().await.unwrap() });
    }
    let mut winners = 0;
    while let Some(result) = join_set.join_next().await {
        if result.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

async fn check_mark_success(store: &dyn TaskStore) {
    let task = sample_task(1);
    store.insert(&task).await.unwrap();
    store.claim_next_pending().await.unwrap().unwrap();

    let urls = vec!["https://x/1.png".to_string(), "https://x/2.png".to_string()];
    store.mark_success(&task.id, &urls).await.unwrap();

    let done = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Succeeded);
    assert_eq!(done.image_urls, urls);
    assert!(done.completed_at.is_some());
}

async fn check_mark_failed_is_idempotent(store: &dyn TaskStore) {
    let task = sample_task(1);
    store.insert(&task).await.unwrap();
    store.claim_next_pending().await.unwrap().unwrap();

    store.mark_failed(&task.id, "status 401 unauthorized").await.unwrap();
    let failed = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error_message, "status 401 unauthorized");
    assert_eq!(failed.last_error, "status 401 unauthorized");
    assert!(failed.next_attempt_at.is_none());
    assert!(failed.completed_at.is_some());

    // Re-issuing the same terminal write leaves the row as-is.
    store.mark_failed(&task.id, "status 401 unauthorized").await.unwrap();
    let again = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(again.status, TaskStatus::Failed);
    assert_eq!(again.error_message, failed.error_message);
    assert_eq!(again.completed_at, failed.completed_at);
}

async fn check_schedule_retry(store: &dyn TaskStore) {
    let task = sample_task(1);
    store.insert(&task).await.unwrap();
    store.claim_next_pending().await.unwrap().unwrap();

    let next = now_unix() + 3_600;
    store.schedule_retry(&task.id, next, "status 503: busy").await.unwrap();

    let retried = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.attempts, 1);
    assert_eq!(retried.last_error, "status 503: busy");
    assert_eq!(retried.next_attempt_at, Some(next));
    assert!(retried.error_message.is_empty());
    assert!(retried.completed_at.is_none());

    // Not claimable until the backoff elapses.
    assert!(store.claim_next_pending().await.unwrap().is_none());

    // attempts only ever grows.
    store.mark_running(&task.id).await.unwrap();
    store.schedule_retry(&task.id, now_unix() - 1, "again").await.unwrap();
    let retried = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(retried.attempts, 2);
}

async fn check_mark_running_requires_pending(store: &dyn TaskStore) {
    let task = sample_task(1);
    store.insert(&task).await.unwrap();
    store.claim_next_pending().await.unwrap().unwrap();
    store.mark_success(&task.id, &["https://x/1.png".to_string()]).await.unwrap();

    // A stale mark_running after completion must not reopen the row.
    store.mark_running(&task.id).await.unwrap();
    let done = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Succeeded);
}

async fn check_delete_enforces_ownership(store: &dyn TaskStore) {
    let task = sample_task(7);
    store.insert(&task).await.unwrap();

    assert!(!store.delete(&task.id, 8).await.unwrap());
    assert!(store.get(&task.id).await.unwrap().is_some());

    assert!(store.delete(&task.id, 7).await.unwrap());
    assert!(store.get(&task.id).await.unwrap().is_none());
    assert!(!store.delete(&task.id, 7).await.unwrap());
}

async fn check_list_filters_and_pagination(store: &dyn TaskStore) {
    for i in 0..5 {
        let mut task = sample_task(7);
        task.prompt = format!("sunset number {}", i);
        task.created_at = 1_000 + i;
        store.insert(&task).await.unwrap();
    }
    let mut other_model = sample_task(7);
    other_model.model_id = "img-2".to_string();
    other_model.prompt = "a dog".to_string();
    other_model.created_at = 2_000;
    store.insert(&other_model).await.unwrap();
    store.insert(&sample_task(8)).await.unwrap();

    // Newest first, paged.
    let (page, total) = store
        .list_by_user(7, 1, 4, &TaskFilter::default())
        .await
        .unwrap();
    assert_eq!(total, 6);
    assert_eq!(page.len(), 4);
    assert_eq!(page[0].id, other_model.id);

    let (page2, _) = store
        .list_by_user(7, 2, 4, &TaskFilter::default())
        .await
        .unwrap();
    assert_eq!(page2.len(), 2);

    let (by_model, total) = store
        .list_by_user(
            7,
            1,
            10,
            &TaskFilter {
                model: Some("img-2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(by_model[0].id, other_model.id);

    let (_, in_range) = store
        .list_by_user(
            7,
            1,
            10,
            &TaskFilter {
                start_time: Some(1_001),
                end_time: Some(1_003),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(in_range, 3);

    let (found, total) = store
        .list_by_user(
            7,
            1,
            10,
            &TaskFilter {
                search: Some("dog".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(found[0].prompt, "a dog");

    let (by_status, _) = store
        .list_by_user(
            7,
            1,
            10,
            &TaskFilter {
                status: Some(TaskStatus::Failed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(by_status.is_empty());
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sqlite_insert_get_round_trip() {
    check_insert_get_round_trip(&sqlite_store().await).await;
}

#[tokio::test]
async fn sqlite_claim_is_fifo() {
    check_claim_is_fifo(&sqlite_store().await).await;
}

#[tokio::test]
async fn sqlite_claim_respects_next_attempt_at() {
    check_claim_respects_next_attempt_at(&sqlite_store().await).await;
}

#[tokio::test]
async fn sqlite_single_winner_under_concurrent_claims() {
    check_single_winner_under_concurrent_claims(Arc::new(sqlite_store().await)).await;
}

#[tokio::test]
async fn sqlite_mark_success() {
    check_mark_success(&sqlite_store().await).await;
}

#[tokio::test]
async fn sqlite_mark_failed_is_idempotent() {
    check_mark_failed_is_idempotent(&sqlite_store().await).await;
}

#[tokio::test]
async fn sqlite_schedule_retry() {
    check_schedule_retry(&sqlite_store().await).await;
}

#[tokio::test]
async fn sqlite_mark_running_requires_pending() {
    check_mark_running_requires_pending(&sqlite_store().await).await;
}

#[tokio::test]
async fn sqlite_delete_enforces_ownership() {
    check_delete_enforces_ownership(&sqlite_store().await).await;
}

#[tokio::test]
async fn sqlite_list_filters_and_pagination() {
    check_list_filters_and_pagination(&sqlite_store().await).await;
}

#[tokio::test]
async fn sqlite_zombie_reset_reclaims_stale_running_rows() {
    let store = sqlite_store().await;
    let task = sample_task(1);
    store.insert(&task).await.unwrap();
    store.claim_next_pending().await.unwrap().unwrap();

    // Freeze the row in the past, as a crashed worker would.
    store.force_updated_at(&task.id, now_unix() - 1_000).await.unwrap();

    let reset = store.reset_zombie_running(Duration::from_secs(360)).await.unwrap();
    assert_eq!(reset, 1);

    let recovered = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, TaskStatus::Pending);
    assert!(recovered.next_attempt_at.is_some());
    assert!(recovered.completed_at.is_none());

    // Immediately eligible again.
    let reclaimed = store.claim_next_pending().await.unwrap().unwrap();
    assert_eq!(reclaimed.id, task.id);

    // No new zombies: the second sweep is a no-op.
    let reset = store.reset_zombie_running(Duration::from_secs(360)).await.unwrap();
    assert_eq!(reset, 0);
}

#[tokio::test]
async fn sqlite_late_terminal_write_after_zombie_reset_is_harmless() {
    let store = sqlite_store().await;
    let task = sample_task(1);
    store.insert(&task).await.unwrap();

    // Worker A claims, stalls, and the row gets swept back to pending.
    store.claim_next_pending().await.unwrap().unwrap();
    store.force_updated_at(&task.id, now_unix() - 1_000).await.unwrap();
    store.reset_zombie_running(Duration::from_secs(360)).await.unwrap();

    // Worker B claims and completes it.
    store.claim_next_pending().await.unwrap().unwrap();
    store.mark_success(&task.id, &["https://x/1.png".to_string()]).await.unwrap();

    // Worker A wakes up and reports its failure; the row must not move.
    store.mark_failed(&task.id, "deadline exceeded").await.unwrap();
    let done = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Succeeded);
    assert_eq!(done.image_urls, vec!["https://x/1.png".to_string()]);
    assert!(done.error_message.is_empty());
}

// ---------------------------------------------------------------------------
// PostgreSQL — opt-in: `IMGGEN_TEST_POSTGRES_URL=postgres://… cargo test -- --ignored`
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore]
async fn postgres_store_suite() {
    let url = std::env::var("IMGGEN_TEST_POSTGRES_URL")
        .expect("set IMGGEN_TEST_POSTGRES_URL to run the postgres suite");
    let store = PgTaskStore::connect(&url).await.unwrap();

    store.clear().await.unwrap();
    check_insert_get_round_trip(&store).await;
    store.clear().await.unwrap();
    check_claim_is_fifo(&store).await;
    store.clear().await.unwrap();
    check_claim_respects_next_attempt_at(&store).await;
    store.clear().await.unwrap();
    check_mark_success(&store).await;
    store.clear().await.unwrap();
    check_mark_failed_is_idempotent(&store).await;
    store.clear().await.unwrap();
    check_schedule_retry(&store).await;
    store.clear().await.unwrap();
    check_mark_running_requires_pending(&store).await;
    store.clear().await.unwrap();
    check_delete_enforces_ownership(&store).await;
    store.clear().await.unwrap();
    check_list_filters_and_pagination(&store).await;

    store.clear().await.unwrap();
    let task = sample_task(1);
    store.insert(&task).await.unwrap();
    store.claim_next_pending().await.unwrap().unwrap();
    store.force_updated_at(&task.id, now_unix() - 1_000).await.unwrap();
    assert_eq!(
        store.reset_zombie_running(Duration::from_secs(360)).await.unwrap(),
        1
    );
    assert_eq!(
        store.reset_zombie_running(Duration::from_secs(360)).await.unwrap(),
        0
    );

    store.clear().await.unwrap();
    check_single_winner_under_concurrent_claims(Arc::new(
        PgTaskStore::connect(&url).await.unwrap(),
    ))
    .await;
}
