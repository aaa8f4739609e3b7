//! Query functions for the `eq_tasks`, `eq_exp_id_tasks` and
//! `eq_task_tags` tables.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use sqlx::{PgConnection, PgPool};

use crate::models::TaskStatus;

/// Current time as an RFC 3339 string with offset, the format stored in
/// the `time_*` columns.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Draw the next task id from the `emews_id_generator` sequence.
pub async fn next_task_id(conn: &mut PgConnection) -> Result<i64> {
    let id: i64 = sqlx::query_scalar("SELECT nextval('emews_id_generator')")
        .fetch_one(conn)
        .await
        .context("failed to get next task id")?;

    Ok(id)
}

/// Insert the canonical task row. Status defaults to QUEUED; the caller
/// is expected to push the matching out-queue row in the same
/// transaction.
pub async fn insert_task(
    conn: &mut PgConnection,
    eq_task_id: i64,
    eq_task_type: i32,
    payload: &str,
    priority: i32,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO eq_tasks (eq_task_id, eq_task_type, json_out, time_created, eq_priority) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(eq_task_id)
    .bind(eq_task_type)
    .bind(payload)
    .bind(now_timestamp())
    .bind(priority)
    .execute(conn)
    .await
    .context("failed to insert task")?;

    Ok(())
}

/// Map a task to its submitter-chosen experiment id.
pub async fn insert_exp_task(
    conn: &mut PgConnection,
    exp_id: &str,
    eq_task_id: i64,
) -> Result<()> {
    sqlx::query("INSERT INTO eq_exp_id_tasks (exp_id, eq_task_id) VALUES ($1, $2)")
        .bind(exp_id)
        .bind(eq_task_id)
        .execute(conn)
        .await
        .context("failed to insert experiment mapping")?;

    Ok(())
}

/// Attach a metadata tag to a task.
pub async fn insert_task_tag(conn: &mut PgConnection, eq_task_id: i64, tag: &str) -> Result<()> {
    sqlx::query("INSERT INTO eq_task_tags (eq_task_id, tag) VALUES ($1, $2)")
        .bind(eq_task_id)
        .bind(tag)
        .execute(conn)
        .await
        .context("failed to insert task tag")?;

    Ok(())
}

/// Select the work payloads for a set of just-claimed task ids, in
/// ascending id order.
pub async fn select_task_payloads(
    conn: &mut PgConnection,
    eq_task_ids: &[i64],
) -> Result<Vec<(i64, Option<String>)>> {
    let rows: Vec<(i64, Option<String>)> = sqlx::query_as(
        "SELECT eq_task_id, json_out FROM eq_tasks \
         WHERE eq_task_id = ANY($1) ORDER BY eq_task_id ASC",
    )
    .bind(eq_task_ids)
    .fetch_all(conn)
    .await
    .context("failed to select task payloads")?;

    Ok(rows)
}

/// Mark a set of claimed tasks RUNNING, recording the claiming pool and
/// the start time. `worker_pool` is written exactly once per task, here.
pub async fn mark_tasks_running(
    conn: &mut PgConnection,
    eq_task_ids: &[i64],
    worker_pool: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE eq_tasks SET eq_status = $1, worker_pool = $2, time_start = $3 \
         WHERE eq_task_id = ANY($4)",
    )
    .bind(TaskStatus::Running)
    .bind(worker_pool)
    .bind(now_timestamp())
    .bind(eq_task_ids)
    .execute(conn)
    .await
    .context("failed to mark tasks running")?;

    Ok(())
}

/// Record a task's result payload, set it COMPLETE, and stamp the stop
/// time. A single statement, so this is atomic on its own connection.
pub async fn mark_task_complete(pool: &PgPool, eq_task_id: i64, result: &str) -> Result<()> {
    sqlx::query(
        "UPDATE eq_tasks SET json_in = $1, eq_status = $2, time_stop = $3 \
         WHERE eq_task_id = $4",
    )
    .bind(result)
    .bind(TaskStatus::Complete)
    .bind(now_timestamp())
    .bind(eq_task_id)
    .execute(pool)
    .await
    .context("failed to mark task complete")?;

    Ok(())
}

/// Read a task's result payload (`json_in`).
pub async fn select_task_result(
    conn: &mut PgConnection,
    eq_task_id: i64,
) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT json_in FROM eq_tasks WHERE eq_task_id = $1")
            .bind(eq_task_id)
            .fetch_optional(conn)
            .await
            .context("failed to select task result")?;

    Ok(row.and_then(|(json_in,)| json_in))
}

/// Status of each of the given task ids.
pub async fn query_status(pool: &PgPool, eq_task_ids: &[i64]) -> Result<Vec<(i64, TaskStatus)>> {
    let rows: Vec<(i64, TaskStatus)> = sqlx::query_as(
        "SELECT eq_task_id, eq_status FROM eq_tasks WHERE eq_task_id = ANY($1)",
    )
    .bind(eq_task_ids)
    .fetch_all(pool)
    .await
    .context("failed to query task statuses")?;

    Ok(rows)
}

/// Claiming worker pool of each of the given task ids (null until
/// claimed).
pub async fn query_worker_pools(
    pool: &PgPool,
    eq_task_ids: &[i64],
) -> Result<Vec<(i64, Option<String>)>> {
    let rows: Vec<(i64, Option<String>)> = sqlx::query_as(
        "SELECT eq_task_id, worker_pool FROM eq_tasks WHERE eq_task_id = ANY($1)",
    )
    .bind(eq_task_ids)
    .fetch_all(pool)
    .await
    .context("failed to query worker pools")?;

    Ok(rows)
}

/// Priority of each of the given task ids.
pub async fn query_priorities(pool: &PgPool, eq_task_ids: &[i64]) -> Result<Vec<(i64, i32)>> {
    let rows: Vec<(i64, i32)> = sqlx::query_as(
        "SELECT eq_task_id, eq_priority FROM eq_tasks WHERE eq_task_id = ANY($1)",
    )
    .bind(eq_task_ids)
    .fetch_all(pool)
    .await
    .context("failed to query task priorities")?;

    Ok(rows)
}

/// Cancel the given tasks where still possible.
///
/// The DELETE from the out queue is the source of truth: its RETURNING
/// set names exactly the tasks nobody has claimed, and only those are
/// marked CANCELED. A task claimed concurrently is absent from the
/// returned list and keeps running.
pub async fn cancel_tasks(pool: &PgPool, eq_task_ids: &[i64]) -> Result<Vec<i64>> {
    let mut tx = pool.begin().await.context("failed to begin cancel")?;

    let deleted: Vec<(i64,)> = sqlx::query_as(
        "DELETE FROM emews_queue_out WHERE eq_task_id = ANY($1) RETURNING eq_task_id",
    )
    .bind(eq_task_ids)
    .fetch_all(tx.as_mut())
    .await
    .context("failed to delete canceled tasks from the out queue")?;

    let deleted_ids: Vec<i64> = deleted.into_iter().map(|(id,)| id).collect();

    if !deleted_ids.is_empty() {
        sqlx::query("UPDATE eq_tasks SET eq_status = $1 WHERE eq_task_id = ANY($2)")
            .bind(TaskStatus::Canceled)
            .bind(&deleted_ids)
            .execute(tx.as_mut())
            .await
            .context("failed to mark tasks canceled")?;
    }

    tx.commit().await.context("failed to commit cancel")?;
    Ok(deleted_ids)
}

/// Set one priority on every given task still waiting on the out queue.
///
/// The queue update's RETURNING set defines which tasks were still
/// unclaimed; the new priority is mirrored onto `eq_tasks` for that
/// subset only, so claimed tasks are untouched. Returns the affected
/// ids.
pub async fn update_priorities_single(
    pool: &PgPool,
    eq_task_ids: &[i64],
    new_priority: i32,
) -> Result<Vec<i64>> {
    let mut tx = pool.begin().await.context("failed to begin priority update")?;

    let affected: Vec<(i64,)> = sqlx::query_as(
        "UPDATE emews_queue_out SET eq_priority = $1 \
         WHERE eq_task_id = ANY($2) RETURNING eq_task_id",
    )
    .bind(new_priority)
    .bind(eq_task_ids)
    .fetch_all(tx.as_mut())
    .await
    .context("failed to update queue priorities")?;

    let affected_ids: Vec<i64> = affected.into_iter().map(|(id,)| id).collect();

    if !affected_ids.is_empty() {
        sqlx::query("UPDATE eq_tasks SET eq_priority = $1 WHERE eq_task_id = ANY($2)")
            .bind(new_priority)
            .bind(&affected_ids)
            .execute(tx.as_mut())
            .await
            .context("failed to mirror priorities onto eq_tasks")?;
    }

    tx.commit().await.context("failed to commit priority update")?;
    Ok(affected_ids)
}

/// Set a per-task priority on every given task still waiting on the out
/// queue. `updates` pairs each task id with its new priority.
///
/// Same claimed-task semantics as [`update_priorities_single`].
pub async fn update_priorities_per_task(
    pool: &PgPool,
    updates: &[(i64, i32)],
) -> Result<Vec<i64>> {
    let ids: Vec<i64> = updates.iter().map(|(id, _)| *id).collect();
    let priorities: Vec<i32> = updates.iter().map(|(_, p)| *p).collect();

    let mut tx = pool.begin().await.context("failed to begin priority update")?;

    let affected: Vec<(i64,)> = sqlx::query_as(
        "UPDATE emews_queue_out AS q SET eq_priority = u.priority \
         FROM (SELECT UNNEST($1::bigint[]) AS id, UNNEST($2::int[]) AS priority) AS u \
         WHERE q.eq_task_id = u.id \
         RETURNING q.eq_task_id",
    )
    .bind(&ids)
    .bind(&priorities)
    .fetch_all(tx.as_mut())
    .await
    .context("failed to update queue priorities")?;

    let affected_ids: Vec<i64> = affected.into_iter().map(|(id,)| id).collect();

    if !affected_ids.is_empty() {
        sqlx::query(
            "UPDATE eq_tasks AS t SET eq_priority = u.priority \
             FROM (SELECT UNNEST($1::bigint[]) AS id, UNNEST($2::int[]) AS priority) AS u \
             WHERE t.eq_task_id = u.id AND t.eq_task_id = ANY($3)",
        )
        .bind(&ids)
        .bind(&priorities)
        .bind(&affected_ids)
        .execute(tx.as_mut())
        .await
        .context("failed to mirror priorities onto eq_tasks")?;
    }

    tx.commit().await.context("failed to commit priority update")?;
    Ok(affected_ids)
}

/// Everything needed to resubmit the in-flight tasks of a canceled pool:
/// `(eq_task_id, eq_task_type, json_out, eq_priority)` of each RUNNING
/// task claimed by `worker_pool`.
pub async fn tasks_running_on_pool(
    pool: &PgPool,
    worker_pool: &str,
) -> Result<Vec<(i64, i32, Option<String>, i32)>> {
    let rows: Vec<(i64, i32, Option<String>, i32)> = sqlx::query_as(
        "SELECT eq_task_id, eq_task_type, json_out, eq_priority \
         FROM eq_tasks WHERE worker_pool = $1 AND eq_status = $2",
    )
    .bind(worker_pool)
    .bind(TaskStatus::Running)
    .fetch_all(pool)
    .await
    .context("failed to select tasks running on pool")?;

    Ok(rows)
}

/// Force a status onto a set of tasks. Used by the requeue path to mark
/// a canceled pool's tasks REQUEUED before resubmission.
pub async fn update_statuses(
    pool: &PgPool,
    eq_task_ids: &[i64],
    status: TaskStatus,
) -> Result<()> {
    sqlx::query("UPDATE eq_tasks SET eq_status = $1 WHERE eq_task_id = ANY($2)")
        .bind(status)
        .bind(eq_task_ids)
        .execute(pool)
        .await
        .context("failed to update task statuses")?;

    Ok(())
}

/// Tags of the given tasks (tasks without a tag are absent).
pub async fn select_task_tags(pool: &PgPool, eq_task_ids: &[i64]) -> Result<Vec<(i64, String)>> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
        "SELECT eq_task_id, tag FROM eq_task_tags WHERE eq_task_id = ANY($1)",
    )
    .bind(eq_task_ids)
    .fetch_all(pool)
    .await
    .context("failed to select task tags")?;

    Ok(rows)
}
