//! Integration tests for the task-queue lifecycle API: submission,
//! claiming, reporting, results, and the batched-claim accounting.

use std::time::Duration;

use eqsql_core::{StatusPayload, TaskMessage, TaskQueue};
use eqsql_db::models::TaskStatus;

use eqsql_test_utils::{create_test_db, drop_test_db};

const DELAY: Duration = Duration::from_millis(50);
const SHORT: Option<Duration> = Some(Duration::from_millis(500));

fn work_ids(messages: &[TaskMessage]) -> Vec<i64> {
    messages.iter().filter_map(TaskMessage::eq_task_id).collect()
}

// ---- Tests ----

#[tokio::test]
async fn submit_then_claim_in_priority_order() {
    let (pool, db_name) = create_test_db().await;
    let queue = TaskQueue::new(pool.clone());

    // Four tasks of one type with rising priorities.
    let mut ids = Vec::new();
    for priority in [0, 1, 2, 3] {
        let ft = queue
            .submit_task("exp", 0, &format!("{{\"p\": {priority}}}"), priority, None)
            .await
            .expect("submit");
        ids.push(ft.eq_task_id());
    }

    // Serial single-task claims come back highest priority first, which
    // is reverse submission order here.
    let mut claimed = Vec::new();
    for _ in 0..4 {
        let messages = queue.query_task(0, 1, "default", DELAY, SHORT).await;
        claimed.extend(work_ids(&messages));
    }
    let expected: Vec<i64> = ids.iter().rev().copied().collect();
    assert_eq!(claimed, expected);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claims_respect_task_type() {
    let (pool, db_name) = create_test_db().await;
    let queue = TaskQueue::new(pool.clone());

    let mut ids = Vec::new();
    for eq_type in [0, 1, 2, 3] {
        let ft = queue
            .submit_task("exp", eq_type, "payload", 0, None)
            .await
            .expect("submit");
        ids.push(ft.eq_task_id());
    }

    // Claim types out of submission order; each claim sees only its type.
    let mut claimed = Vec::new();
    for eq_type in [1, 0, 3, 2] {
        let messages = queue.query_task(eq_type, 1, "default", DELAY, SHORT).await;
        claimed.extend(work_ids(&messages));
    }
    assert_eq!(claimed, vec![ids[1], ids[0], ids[3], ids[2]]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn round_trip_returns_reported_result_unchanged() {
    let (pool, db_name) = create_test_db().await;
    let queue = TaskQueue::new(pool.clone());

    let payload = "{\"params\": [0.5, 1.5]}";
    let ft = queue
        .submit_task("exp", 0, payload, 0, None)
        .await
        .expect("submit");

    let messages = queue.query_task(0, 1, "default", DELAY, SHORT).await;
    assert_eq!(messages.len(), 1);
    let TaskMessage::Work { eq_task_id, payload: claimed_payload } = &messages[0] else {
        panic!("expected work, got {messages:?}");
    };
    assert_eq!(*eq_task_id, ft.eq_task_id());
    assert_eq!(claimed_payload, payload);

    let reported = "{\"objective\": 0.125}";
    queue
        .report_task(*eq_task_id, 0, reported)
        .await
        .expect("report");

    let result = ft.result(DELAY, SHORT).await;
    assert!(result.is_done());
    assert_eq!(result.payload(), reported);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn empty_queue_times_out_with_status_message() {
    let (pool, db_name) = create_test_db().await;
    let queue = TaskQueue::new(pool.clone());

    let messages = queue
        .query_task(0, 1, "default", DELAY, Some(Duration::from_millis(200)))
        .await;
    assert_eq!(
        messages,
        vec![TaskMessage::Status {
            payload: StatusPayload::Timeout
        }]
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_is_atomic_with_running_update() {
    let (pool, db_name) = create_test_db().await;
    let queue = TaskQueue::new(pool.clone());

    let ft = queue
        .submit_task("exp", 0, "payload", 0, None)
        .await
        .expect("submit");

    let messages = queue.query_task(0, 1, "pool-7", DELAY, SHORT).await;
    assert_eq!(work_ids(&messages), vec![ft.eq_task_id()]);

    // Observed state after the claim transaction: RUNNING, owned by the
    // claiming pool.
    let statuses = queue.query_status(&[ft.eq_task_id()]).await.expect("status");
    assert_eq!(statuses, vec![(ft.eq_task_id(), TaskStatus::Running)]);
    let pools = queue
        .query_worker_pools(&[ft.eq_task_id()])
        .await
        .expect("pools");
    assert_eq!(pools, vec![(ft.eq_task_id(), Some("pool-7".to_owned()))]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn result_is_durable_before_delivery() {
    let (pool, db_name) = create_test_db().await;
    let queue = TaskQueue::new(pool.clone());

    let ft = queue
        .submit_task("exp", 0, "payload", 0, None)
        .await
        .expect("submit");
    queue.query_task(0, 1, "default", DELAY, SHORT).await;
    queue
        .report_task(ft.eq_task_id(), 0, "result")
        .await
        .expect("report");

    // The result write committed before the queue push: json_in is
    // durable in eq_tasks regardless of delivery.
    let json_in: Option<String> =
        sqlx::query_scalar("SELECT json_in FROM eq_tasks WHERE eq_task_id = $1")
            .bind(ft.eq_task_id())
            .fetch_one(&pool)
            .await
            .expect("select json_in");
    assert_eq!(json_in.as_deref(), Some("result"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn stop_sentinel_is_claimed_after_all_work() {
    let (pool, db_name) = create_test_db().await;
    let queue = TaskQueue::new(pool.clone());

    for i in 0..3 {
        queue
            .submit_task("exp", 5, &format!("task-{i}"), 0, None)
            .await
            .expect("submit");
    }
    queue.stop_worker_pool(5).await.expect("stop");

    // All queued work drains first.
    for _ in 0..3 {
        let messages = queue.query_task(5, 1, "default", DELAY, SHORT).await;
        assert!(
            matches!(messages[0], TaskMessage::Work { .. }),
            "expected work before the sentinel, got {messages:?}"
        );
    }

    // Then the sentinel, at priority -1, tells the pool to stop.
    let messages = queue.query_task(5, 1, "default", DELAY, SHORT).await;
    assert_eq!(
        messages,
        vec![TaskMessage::Status {
            payload: StatusPayload::Stop
        }]
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn submit_tasks_returns_future_per_payload() {
    let (pool, db_name) = create_test_db().await;
    let queue = TaskQueue::new(pool.clone());

    let payloads: Vec<String> = (0..5).map(|i| format!("task-{i}")).collect();
    let (futures, status) = queue
        .submit_tasks("exp", 0, &payloads, 0, Some("batch-1"))
        .await;
    status.expect("submission should succeed");
    assert_eq!(futures.len(), 5);
    for ft in &futures {
        assert_eq!(ft.tag(), Some("batch-1"));
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn query_more_tasks_validates_arguments() {
    let (pool, db_name) = create_test_db().await;
    let queue = TaskQueue::new(pool.clone());

    assert!(
        queue
            .query_more_tasks(0, &[], 4, 0, "default", DELAY, SHORT)
            .await
            .is_err()
    );
    assert!(
        queue
            .query_more_tasks(0, &[], 0, 1, "default", DELAY, SHORT)
            .await
            .is_err()
    );
    assert!(
        queue
            .query_more_tasks(0, &[], 2, 3, "default", DELAY, SHORT)
            .await
            .is_err()
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn query_more_tasks_respects_threshold() {
    let (pool, db_name) = create_test_db().await;
    let queue = TaskQueue::new(pool.clone());

    // Queue plenty of work.
    let (futures, status) = queue
        .submit_tasks(
            "exp",
            0,
            &(0..8).map(|i| format!("t{i}")).collect::<Vec<_>>(),
            0,
            None,
        )
        .await;
    status.expect("submit");

    // Claim 3 tasks: they are in flight.
    let messages = queue.query_task(0, 3, "default", DELAY, SHORT).await;
    let in_flight = work_ids(&messages);
    assert_eq!(in_flight.len(), 3);

    // batch_size 4, threshold 2: only one free slot, below threshold, so
    // no claim is issued and the in-flight list is just what still runs.
    let (retained, new_messages) = queue
        .query_more_tasks(0, &in_flight, 4, 2, "default", DELAY, SHORT)
        .await
        .expect("query_more_tasks");
    assert_eq!(retained.len(), 3);
    assert!(new_messages.is_empty());

    // Complete one: now two slots are free, meeting the threshold.
    queue
        .report_task(in_flight[0], 0, "done")
        .await
        .expect("report");
    let (retained, new_messages) = queue
        .query_more_tasks(0, &in_flight, 4, 2, "default", DELAY, SHORT)
        .await
        .expect("query_more_tasks");
    assert_eq!(new_messages.len(), 2);
    // The retained list holds the two still-running plus the new claims.
    assert_eq!(retained.len(), 4);

    let _ = futures;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_and_claim_race_has_one_winner() {
    let (pool, db_name) = create_test_db().await;
    let queue = TaskQueue::new(pool.clone());

    for _ in 0..20 {
        let ft = queue
            .submit_task("exp", 9, "contested", 0, None)
            .await
            .expect("submit");

        let cancel_queue = queue.clone();
        let cancel_ft = ft.clone();
        let cancel_handle =
            tokio::spawn(async move { cancel_ft.cancel().await.expect("cancel") });

        let claim_queue = queue.clone();
        let claim_handle = tokio::spawn(async move {
            let messages = claim_queue
                .query_task(9, 1, "default", Duration::from_millis(10), Some(Duration::ZERO))
                .await;
            messages.iter().any(|m| m.eq_task_id().is_some())
        });

        let canceled = cancel_handle.await.expect("cancel task");
        let claimed = claim_handle.await.expect("claim task");

        // Exactly one side can win; a claimed task is not cancelable and
        // a canceled task is not claimable.
        assert!(
            !(canceled && claimed),
            "task was both canceled and claimed"
        );
        if claimed {
            queue
                .report_task(ft.eq_task_id(), 9, "done")
                .await
                .expect("report");
        }
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn clear_queues_cancels_pending_futures() {
    let (pool, db_name) = create_test_db().await;
    let queue = TaskQueue::new(pool.clone());

    let (futures, status) = queue
        .submit_tasks(
            "exp",
            0,
            &(0..5).map(|i| format!("t{i}")).collect::<Vec<_>>(),
            0,
            None,
        )
        .await;
    status.expect("submit");

    queue.clear_queues().await.expect("clear");

    assert!(queue.are_queues_empty(None).await.expect("empty"));
    for ft in &futures {
        assert_eq!(ft.status().await.expect("status"), TaskStatus::Canceled);
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}
