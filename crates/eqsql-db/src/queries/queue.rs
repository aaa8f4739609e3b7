//! The queue engine: skip-locked pops, pushes, and whole-queue operations
//! on `emews_queue_out` and `emews_queue_in`.
//!
//! Pops and pushes take a `&mut PgConnection` so callers can bracket them
//! inside a transaction together with the matching `eq_tasks` update; the
//! whole-queue operations manage their own transactions.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};

use crate::models::{InQueueRow, OutQueueRow, TaskStatus};

/// Claim up to `n` tasks of the given type, highest priority first and
/// FIFO within a priority class.
///
/// A single statement deletes the selected rows and returns them:
/// `FOR UPDATE SKIP LOCKED` makes concurrent claimants pass over rows
/// another transaction holds rather than block, so each row is claimed by
/// exactly one caller. Returns fewer than `n` rows (possibly none) when
/// the queue is drained; never waits.
pub async fn pop_out_queue(
    conn: &mut PgConnection,
    eq_task_type: i32,
    n: i64,
) -> Result<Vec<OutQueueRow>> {
    let rows = sqlx::query_as::<_, OutQueueRow>(
        "DELETE FROM emews_queue_out \
         WHERE eq_task_id = ANY(ARRAY( \
             SELECT eq_task_id \
             FROM emews_queue_out \
             WHERE eq_task_type = $1 \
             ORDER BY eq_priority DESC, eq_task_id ASC \
             FOR UPDATE SKIP LOCKED \
             LIMIT $2 \
         )) \
         RETURNING eq_task_type, eq_task_id, eq_priority",
    )
    .bind(eq_task_type)
    .bind(n)
    .fetch_all(conn)
    .await
    .context("failed to pop from the out queue")?;

    Ok(rows)
}

/// Pop the result-ready marker for one specific task, if present.
///
/// Single-consumer semantics: only the submitter of `eq_task_id` polls
/// for it, so the statement is keyed on the id rather than ordered.
pub async fn pop_in_queue(
    conn: &mut PgConnection,
    eq_task_id: i64,
) -> Result<Option<InQueueRow>> {
    let row = sqlx::query_as::<_, InQueueRow>(
        "DELETE FROM emews_queue_in \
         WHERE eq_task_id = ( \
             SELECT eq_task_id \
             FROM emews_queue_in \
             WHERE eq_task_id = $1 \
             FOR UPDATE SKIP LOCKED \
             LIMIT 1 \
         ) \
         RETURNING eq_task_type, eq_task_id",
    )
    .bind(eq_task_id)
    .fetch_optional(conn)
    .await
    .context("failed to pop from the in queue")?;

    Ok(row)
}

/// Make a task claimable: insert its out-queue row and set its status to
/// QUEUED, in the caller's transaction.
pub async fn push_out(
    conn: &mut PgConnection,
    eq_task_type: i32,
    eq_task_id: i64,
    priority: i32,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO emews_queue_out (eq_task_type, eq_task_id, eq_priority) \
         VALUES ($1, $2, $3)",
    )
    .bind(eq_task_type)
    .bind(eq_task_id)
    .bind(priority)
    .execute(&mut *conn)
    .await
    .context("failed to push onto the out queue")?;

    sqlx::query("UPDATE eq_tasks SET eq_status = $1 WHERE eq_task_id = $2")
        .bind(TaskStatus::Queued)
        .bind(eq_task_id)
        .execute(conn)
        .await
        .context("failed to mark task queued")?;

    Ok(())
}

/// Publish a task's result marker onto the in queue.
pub async fn push_in(conn: &mut PgConnection, eq_task_type: i32, eq_task_id: i64) -> Result<()> {
    sqlx::query("INSERT INTO emews_queue_in (eq_task_type, eq_task_id) VALUES ($1, $2)")
        .bind(eq_task_type)
        .bind(eq_task_id)
        .execute(conn)
        .await
        .context("failed to push onto the in queue")?;

    Ok(())
}

/// Whether both queues are empty, optionally restricted to one task type.
pub async fn are_queues_empty(pool: &PgPool, eq_task_type: Option<i32>) -> Result<bool> {
    for table in ["emews_queue_in", "emews_queue_out"] {
        // Table names are from a fixed list, only values are bound.
        let count: i64 = match eq_task_type {
            Some(eq_type) => {
                let query =
                    format!("SELECT COUNT(eq_task_id) FROM {table} WHERE eq_task_type = $1");
                sqlx::query_scalar(&query)
                    .bind(eq_type)
                    .fetch_one(pool)
                    .await
            }
            None => {
                let query = format!("SELECT COUNT(eq_task_id) FROM {table}");
                sqlx::query_scalar(&query).fetch_one(pool).await
            }
        }
        .with_context(|| format!("failed to count rows in {table}"))?;

        if count > 0 {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Reset both queues to empty, marking every task still sitting on either
/// queue as CANCELED.
///
/// This is a cold-reset convenience for returning the database to a
/// coherent starting state; it must not be used to cancel individual
/// tasks.
pub async fn clear_queues(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin clear_queues")?;

    for table in ["emews_queue_in", "emews_queue_out"] {
        let update = format!(
            "UPDATE eq_tasks SET eq_status = $1 \
             FROM (SELECT eq_task_id FROM {table}) AS cleared \
             WHERE eq_tasks.eq_task_id = cleared.eq_task_id"
        );
        sqlx::query(&update)
            .bind(TaskStatus::Canceled)
            .execute(tx.as_mut())
            .await
            .with_context(|| format!("failed to cancel tasks on {table}"))?;

        let delete = format!("DELETE FROM {table}");
        sqlx::query(&delete)
            .execute(tx.as_mut())
            .await
            .with_context(|| format!("failed to clear {table}"))?;
    }

    tx.commit().await.context("failed to commit clear_queues")?;
    Ok(())
}
