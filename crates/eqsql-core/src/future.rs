//! Client-side handles for submitted tasks and helpers for iterating over
//! their completion.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::Stream;

use eqsql_db::models::TaskStatus;

use crate::task_queue::{PriorityUpdate, TaskQueue, TaskResult};

/// Error raised when [`as_completed`] or [`pop_completed`] exceeds its
/// time budget.
#[derive(Debug, Clone, thiserror::Error)]
#[error("as_completed timed out after {0:?}")]
pub struct TimeoutError(pub Duration);

/// Terminal observations cached on a future so repeated calls avoid
/// re-querying the database.
#[derive(Debug, Default)]
struct CachedState {
    /// Cached when Done (terminal) or Abort (retryable; replaced on a
    /// later success). Timeout is never cached so a late result can
    /// still be picked up.
    result: Option<TaskResult>,
    /// Cached only for terminal statuses; QUEUED/RUNNING are re-read.
    status: Option<TaskStatus>,
    /// Cached once non-null; a pool claim is never undone.
    worker_pool: Option<String>,
}

/// The eventual result of a submitted task.
///
/// Returned by [`TaskQueue::submit_task`]. Clones share the cached
/// terminal state, so a working copy observes completions recorded
/// through the original and vice versa.
#[derive(Debug, Clone)]
pub struct TaskFuture {
    queue: TaskQueue,
    eq_task_id: i64,
    tag: Option<String>,
    state: Arc<Mutex<CachedState>>,
}

impl TaskFuture {
    pub(crate) fn new(queue: TaskQueue, eq_task_id: i64, tag: Option<String>) -> Self {
        Self {
            queue,
            eq_task_id,
            tag,
            state: Arc::new(Mutex::new(CachedState::default())),
        }
    }

    pub fn eq_task_id(&self) -> i64 {
        self.eq_task_id
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub(crate) fn set_cached_status(&self, status: TaskStatus) {
        self.state.lock().expect("future state poisoned").status = Some(status);
    }

    pub(crate) fn set_cached_result(&self, result: TaskResult) {
        self.state.lock().expect("future state poisoned").result = Some(result);
    }

    /// Get this task's result, long-polling the database.
    ///
    /// A `Done` result is cached and returned on every later call. An
    /// `Abort` is cached but retried: a later call queries again, so the
    /// future recovers once the database does. A `Timeout` is never
    /// cached, letting a subsequent call pick up a late result.
    pub async fn result(&self, delay: Duration, timeout: Option<Duration>) -> TaskResult {
        {
            let state = self.state.lock().expect("future state poisoned");
            if let Some(result) = &state.result {
                if result.is_done() {
                    return result.clone();
                }
            }
        }

        let result = self.queue.query_result(self.eq_task_id, delay, timeout).await;
        if matches!(result, TaskResult::Done(_) | TaskResult::Abort) {
            self.set_cached_result(result.clone());
        }
        result
    }

    /// Current status of this task.
    ///
    /// COMPLETE and CANCELED are cached once observed; the transient
    /// states are re-read on every call.
    pub async fn status(&self) -> Result<TaskStatus> {
        {
            let state = self.state.lock().expect("future state poisoned");
            if let Some(status) = state.status {
                return Ok(status);
            }
        }

        let statuses = self.queue.query_status(&[self.eq_task_id]).await?;
        let (_, status) = statuses
            .first()
            .copied()
            .with_context(|| format!("task {} not found", self.eq_task_id))?;
        if status.is_terminal() {
            self.set_cached_status(status);
        }
        Ok(status)
    }

    /// The worker pool that claimed this task, or `None` while it is
    /// still queued. Cached once non-null.
    pub async fn worker_pool(&self) -> Result<Option<String>> {
        {
            let state = self.state.lock().expect("future state poisoned");
            if state.worker_pool.is_some() {
                return Ok(state.worker_pool.clone());
            }
        }

        let pools = self.queue.query_worker_pools(&[self.eq_task_id]).await?;
        let pool = pools.into_iter().next().and_then(|(_, pool)| pool);
        if pool.is_some() {
            self.state.lock().expect("future state poisoned").worker_pool = pool.clone();
        }
        Ok(pool)
    }

    /// This task's current priority.
    pub async fn priority(&self) -> Result<i32> {
        let priorities = self.queue.query_priorities(&[self.eq_task_id]).await?;
        priorities
            .first()
            .map(|(_, priority)| *priority)
            .with_context(|| format!("task {} not found", self.eq_task_id))
    }

    /// Update this task's priority. Returns true if the task was still
    /// on the queue and the update took effect.
    pub async fn set_priority(&self, new_priority: i32) -> Result<bool> {
        let affected = self
            .queue
            .update_priorities(std::slice::from_ref(self), PriorityUpdate::Single(new_priority))
            .await?;
        Ok(affected.contains(&self.eq_task_id))
    }

    /// Cancel this task by removing it from the out queue.
    ///
    /// Returns true only if this task's id is in the canceled set; a task
    /// claimed before the delete lands cannot be canceled. Idempotent on
    /// an already-canceled task.
    pub async fn cancel(&self) -> Result<bool> {
        if self.status().await? == TaskStatus::Canceled {
            return Ok(true);
        }

        let deleted = self.queue.cancel_tasks(std::slice::from_ref(self)).await?;
        Ok(deleted.contains(&self.eq_task_id))
    }

    /// True once this task is COMPLETE or CANCELED.
    pub async fn done(&self) -> Result<bool> {
        Ok(self.status().await?.is_terminal())
    }
}

// ---------------------------------------------------------------------------
// Completion iteration
// ---------------------------------------------------------------------------

/// Stream the given futures in completion order, in batches.
///
/// Iterates over a working copy of `futures`, probing each
/// not-yet-completed future with a zero-timeout result query; completed
/// futures (result available, or aborted) accumulate into batches of
/// `batch_size` which are yielded as they fill. The stream ends after
/// `n` futures (all of them when `None`) have been yielded; the final
/// batch may be short. When `timeout` elapses, the stream yields
/// `Err(TimeoutError)` and ends. `sleep` is the pause between full
/// passes over the remaining futures.
///
/// Because the stream works on a copy, mutating the original list while
/// iterating has no effect on the iteration. Clones share their cached
/// results, so the caller's futures observe the completions.
pub fn as_completed(
    futures: &[TaskFuture],
    timeout: Option<Duration>,
    n: Option<usize>,
    batch_size: usize,
    sleep: Duration,
) -> impl Stream<Item = Result<Vec<TaskFuture>, TimeoutError>> + use<> {
    let working: Vec<TaskFuture> = futures.to_vec();
    let batch_size = batch_size.max(1);

    async_stream::stream! {
        let start = Instant::now();
        let target = n.unwrap_or(working.len()).min(working.len());
        let mut completed: HashSet<i64> = HashSet::new();
        let mut batch: Vec<TaskFuture> = Vec::new();

        if target == 0 {
            return;
        }

        loop {
            for future in &working {
                if !completed.contains(&future.eq_task_id()) {
                    let result = future.result(Duration::ZERO, Some(Duration::ZERO)).await;
                    if matches!(result, TaskResult::Done(_) | TaskResult::Abort) {
                        completed.insert(future.eq_task_id());
                        batch.push(future.clone());

                        if batch.len() == batch_size {
                            yield Ok(std::mem::take(&mut batch));
                        }

                        if completed.len() == target {
                            if !batch.is_empty() {
                                yield Ok(std::mem::take(&mut batch));
                            }
                            return;
                        }
                    }
                }

                if let Some(timeout) = timeout {
                    if start.elapsed() > timeout {
                        yield Err(TimeoutError(timeout));
                        return;
                    }
                }
            }

            if sleep > Duration::ZERO {
                tokio::time::sleep(sleep).await;
            }
        }
    }
}

/// Pop and return the first completed future from `futures`.
///
/// Polls every future with a zero-timeout result query until one
/// completes, removing it from the caller's list. `sleep` is the pause
/// between passes; `timeout` bounds the total wait.
pub async fn pop_completed(
    futures: &mut Vec<TaskFuture>,
    timeout: Option<Duration>,
    sleep: Duration,
) -> Result<TaskFuture, TimeoutError> {
    let start = Instant::now();

    loop {
        let mut completed_index = None;
        for (index, future) in futures.iter().enumerate() {
            let result = future.result(Duration::ZERO, Some(Duration::ZERO)).await;
            if matches!(result, TaskResult::Done(_) | TaskResult::Abort) {
                completed_index = Some(index);
                break;
            }

            if let Some(timeout) = timeout {
                if start.elapsed() > timeout {
                    return Err(TimeoutError(timeout));
                }
            }
        }

        if let Some(index) = completed_index {
            return Ok(futures.remove(index));
        }
        if let Some(timeout) = timeout {
            if start.elapsed() > timeout {
                return Err(TimeoutError(timeout));
            }
        }

        if sleep > Duration::ZERO {
            tokio::time::sleep(sleep).await;
        }
    }
}
