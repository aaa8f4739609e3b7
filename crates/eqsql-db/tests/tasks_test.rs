//! Integration tests for the task-table queries: claim updates,
//! completion, cancellation, and priority updates.

use sqlx::PgPool;

use eqsql_db::models::TaskStatus;
use eqsql_db::queries::{queue, tasks};

use eqsql_test_utils::{create_test_db, drop_test_db};

/// Helper: create a task row and make it claimable, returning its id.
async fn enqueue_task(pool: &PgPool, eq_type: i32, payload: &str, priority: i32) -> i64 {
    let mut tx = pool.begin().await.expect("begin");
    let id = tasks::next_task_id(tx.as_mut()).await.expect("next id");
    tasks::insert_task(tx.as_mut(), id, eq_type, payload, priority)
        .await
        .expect("insert task");
    tasks::insert_exp_task(tx.as_mut(), "exp-1", id)
        .await
        .expect("insert exp mapping");
    queue::push_out(tx.as_mut(), eq_type, id, priority)
        .await
        .expect("push out");
    tx.commit().await.expect("commit");
    id
}

/// Helper: pop one task of `eq_type` and mark it running on `pool_name`.
async fn claim_one(pool: &PgPool, eq_type: i32, pool_name: &str) -> Option<i64> {
    let mut tx = pool.begin().await.expect("begin");
    let rows = queue::pop_out_queue(tx.as_mut(), eq_type, 1).await.expect("pop");
    let id = rows.first().map(|r| r.eq_task_id);
    if let Some(id) = id {
        tasks::mark_tasks_running(tx.as_mut(), &[id], pool_name)
            .await
            .expect("mark running");
    }
    tx.commit().await.expect("commit");
    id
}

// ---- Tests ----

#[tokio::test]
async fn task_ids_are_monotonic_and_unique() {
    let (pool, db_name) = create_test_db().await;

    let a = enqueue_task(&pool, 0, "a", 0).await;
    let b = enqueue_task(&pool, 1, "b", 0).await;
    let c = enqueue_task(&pool, 2, "c", 0).await;
    assert!(a < b && b < c, "sequence ids should increase: {a} {b} {c}");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_records_pool_and_start_time() {
    let (pool, db_name) = create_test_db().await;

    let id = enqueue_task(&pool, 0, "{\"a\": 2}", 0).await;
    let claimed = claim_one(&pool, 0, "P1").await;
    assert_eq!(claimed, Some(id));

    let statuses = tasks::query_status(&pool, &[id]).await.expect("status");
    assert_eq!(statuses, vec![(id, TaskStatus::Running)]);

    let pools = tasks::query_worker_pools(&pool, &[id]).await.expect("pools");
    assert_eq!(pools, vec![(id, Some("P1".to_owned()))]);

    let task: eqsql_db::models::Task =
        sqlx::query_as("SELECT * FROM eq_tasks WHERE eq_task_id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .expect("fetch task");
    assert!(task.time_start.is_some());
    assert!(task.time_created.is_some());
    assert!(task.time_stop.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn payload_select_preserves_submitted_string() {
    let (pool, db_name) = create_test_db().await;

    let payload = "{\"x\": [1, 2, 3], \"label\": \"trial\"}";
    let id = enqueue_task(&pool, 0, payload, 0).await;

    let mut conn = pool.acquire().await.expect("acquire");
    let payloads = tasks::select_task_payloads(&mut conn, &[id])
        .await
        .expect("payloads");
    assert_eq!(payloads, vec![(id, Some(payload.to_owned()))]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn complete_records_result_and_stop_time() {
    let (pool, db_name) = create_test_db().await;

    let id = enqueue_task(&pool, 0, "in", 0).await;
    claim_one(&pool, 0, "P1").await;

    tasks::mark_task_complete(&pool, id, "out").await.expect("complete");

    let statuses = tasks::query_status(&pool, &[id]).await.expect("status");
    assert_eq!(statuses, vec![(id, TaskStatus::Complete)]);

    let mut conn = pool.acquire().await.expect("acquire");
    let result = tasks::select_task_result(&mut conn, id).await.expect("result");
    assert_eq!(result.as_deref(), Some("out"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_reports_only_unclaimed_ids() {
    let (pool, db_name) = create_test_db().await;

    let queued = enqueue_task(&pool, 0, "a", 0).await;
    let claimed = enqueue_task(&pool, 1, "b", 0).await;
    claim_one(&pool, 1, "P1").await;

    let deleted = tasks::cancel_tasks(&pool, &[queued, claimed])
        .await
        .expect("cancel");

    // Only the still-queued task is cancelable.
    assert_eq!(deleted, vec![queued]);
    let statuses = tasks::query_status(&pool, &[queued, claimed]).await.expect("status");
    for (id, status) in statuses {
        if id == queued {
            assert_eq!(status, TaskStatus::Canceled);
        } else {
            assert_eq!(status, TaskStatus::Running);
        }
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn priority_update_skips_claimed_tasks() {
    let (pool, db_name) = create_test_db().await;

    let queued = enqueue_task(&pool, 0, "a", 1).await;
    let claimed = enqueue_task(&pool, 1, "b", 1).await;
    claim_one(&pool, 1, "P1").await;

    let affected = tasks::update_priorities_single(&pool, &[queued, claimed], 9)
        .await
        .expect("update");
    assert_eq!(affected, vec![queued]);

    let priorities = tasks::query_priorities(&pool, &[queued, claimed])
        .await
        .expect("priorities");
    for (id, priority) in priorities {
        if id == queued {
            assert_eq!(priority, 9);
        } else {
            // Claimed tasks keep the priority they were claimed at.
            assert_eq!(priority, 1);
        }
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn per_task_priority_update() {
    let (pool, db_name) = create_test_db().await;

    let a = enqueue_task(&pool, 0, "a", 0).await;
    let b = enqueue_task(&pool, 0, "b", 0).await;

    let affected = tasks::update_priorities_per_task(&pool, &[(a, 3), (b, 7)])
        .await
        .expect("update");
    assert_eq!(affected.len(), 2);

    let mut priorities = tasks::query_priorities(&pool, &[a, b]).await.expect("priorities");
    priorities.sort();
    assert_eq!(priorities, vec![(a, 3), (b, 7)]);

    // The queue now pops b first.
    let mut tx = pool.begin().await.expect("begin");
    let rows = queue::pop_out_queue(tx.as_mut(), 0, 1).await.expect("pop");
    tx.commit().await.expect("commit");
    assert_eq!(rows[0].eq_task_id, b);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn requeue_selects_find_running_tasks_and_tags() {
    let (pool, db_name) = create_test_db().await;

    let id = enqueue_task(&pool, 0, "payload", 4).await;
    let mut tx = pool.begin().await.expect("begin");
    tasks::insert_task_tag(tx.as_mut(), id, "gen-12").await.expect("tag");
    tx.commit().await.expect("commit");

    claim_one(&pool, 0, "doomed-pool").await;

    let running = tasks::tasks_running_on_pool(&pool, "doomed-pool")
        .await
        .expect("running");
    assert_eq!(running.len(), 1);
    let (rid, rtype, rpayload, rpriority) = &running[0];
    assert_eq!(*rid, id);
    assert_eq!(*rtype, 0);
    assert_eq!(rpayload.as_deref(), Some("payload"));
    assert_eq!(*rpriority, 4);

    tasks::update_statuses(&pool, &[id], TaskStatus::Requeued)
        .await
        .expect("requeue mark");
    let statuses = tasks::query_status(&pool, &[id]).await.expect("status");
    assert_eq!(statuses, vec![(id, TaskStatus::Requeued)]);

    let tags = tasks::select_task_tags(&pool, &[id]).await.expect("tags");
    assert_eq!(tags, vec![(id, "gen-12".to_owned())]);

    pool.close().await;
    drop_test_db(&db_name).await;
}
