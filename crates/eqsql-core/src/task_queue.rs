//! The task-queue lifecycle API: submit, claim, report, cancel, reprioritize.
//!
//! Every operation acquires a connection from the pool, brackets one
//! transaction (two for [`TaskQueue::report_task`], deliberately), and
//! returns the connection. The only place anything blocks is the poll loop
//! between claim attempts.

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, error, warn};

use eqsql_db::config::DbConfig;
use eqsql_db::models::{EQ_ABORT, EQ_STOP, EQ_TIMEOUT, TaskStatus};
use eqsql_db::pool::connect_with_retry;
use eqsql_db::queries::{queue, tasks};

use crate::future::TaskFuture;

/// Poll delay increment applied after each empty attempt.
const DELAY_INCREMENT: Duration = Duration::from_millis(250);
/// Ceiling for the poll delay.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Pool identity written by claims that do not name one. A non-null
/// sentinel keeps `worker_pool IS NULL` meaning exactly "not yet
/// claimed".
pub const DEFAULT_WORKER_POOL: &str = "default";

// ---------------------------------------------------------------------------
// Message and result types
// ---------------------------------------------------------------------------

/// Non-work payload returned in place of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusPayload {
    /// The pool should shut down: the stop sentinel was claimed.
    #[serde(rename = "EQ_STOP")]
    Stop,
    /// A database error aborted the operation.
    #[serde(rename = "EQ_ABORT")]
    Abort,
    /// The poll loop exhausted its time budget.
    #[serde(rename = "EQ_TIMEOUT")]
    Timeout,
}

impl StatusPayload {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => EQ_STOP,
            Self::Abort => EQ_ABORT,
            Self::Timeout => EQ_TIMEOUT,
        }
    }
}

/// One message returned to a polling worker pool: either work to do or a
/// status telling the pool why there is none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskMessage {
    Work { eq_task_id: i64, payload: String },
    Status { payload: StatusPayload },
}

impl TaskMessage {
    /// The task id, when this message carries work.
    pub fn eq_task_id(&self) -> Option<i64> {
        match self {
            Self::Work { eq_task_id, .. } => Some(*eq_task_id),
            Self::Status { .. } => None,
        }
    }
}

/// Outcome of a result query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskResult {
    /// The task completed; this is its reported result payload.
    Done(String),
    /// The poll loop exhausted its time budget before a result appeared.
    Timeout,
    /// A database error aborted the query.
    Abort,
}

impl TaskResult {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    /// The wire payload: the result string, or the failure constant.
    pub fn payload(&self) -> &str {
        match self {
            Self::Done(value) => value,
            Self::Timeout => EQ_TIMEOUT,
            Self::Abort => EQ_ABORT,
        }
    }
}

/// New priorities for a set of tasks: one value for all of them, or one
/// value per task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriorityUpdate {
    Single(i32),
    PerTask(Vec<i32>),
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// Handle to an EQSQL task queue in one PostgreSQL database.
///
/// Cheap to clone; all clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    pool: PgPool,
}

/// Connect to the database with bounded retry and return a [`TaskQueue`].
///
/// On connection failure the connect is retried up to `retry_threshold`
/// times with a random 0-4 s pause between attempts, then the error is
/// returned.
pub async fn init_task_queue(config: &DbConfig, retry_threshold: u32) -> Result<TaskQueue> {
    let pool = connect_with_retry(config, retry_threshold).await?;
    Ok(TaskQueue::new(pool))
}

impl TaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the underlying connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -- submission ---------------------------------------------------------

    /// Submit one payload of the given type and priority.
    ///
    /// The task row, the experiment mapping, the optional tag, and the
    /// out-queue row commit in a single transaction, so once this returns
    /// the task is visible to any pool polling its type. On failure the
    /// transaction rolls back and nothing was submitted.
    pub async fn submit_task(
        &self,
        exp_id: &str,
        eq_type: i32,
        payload: &str,
        priority: i32,
        tag: Option<&str>,
    ) -> Result<TaskFuture> {
        let mut tx = self.pool.begin().await.context("failed to begin submit")?;

        let eq_task_id = tasks::next_task_id(tx.as_mut()).await?;
        tasks::insert_task(tx.as_mut(), eq_task_id, eq_type, payload, priority).await?;
        tasks::insert_exp_task(tx.as_mut(), exp_id, eq_task_id).await?;
        if let Some(tag) = tag {
            tasks::insert_task_tag(tx.as_mut(), eq_task_id, tag).await?;
        }
        queue::push_out(tx.as_mut(), eq_type, eq_task_id, priority).await?;

        tx.commit().await.context("failed to commit submit")?;

        debug!(eq_task_id, eq_type, priority, "task submitted");
        Ok(TaskFuture::new(self.clone(), eq_task_id, tag.map(String::from)))
    }

    /// Submit a list of payloads, stopping at the first failure.
    ///
    /// Returns the futures for the tasks submitted before any failure,
    /// together with `Ok(())` or the error that stopped the iteration.
    pub async fn submit_tasks(
        &self,
        exp_id: &str,
        eq_type: i32,
        payloads: &[String],
        priority: i32,
        tag: Option<&str>,
    ) -> (Vec<TaskFuture>, Result<()>) {
        let mut futures = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match self.submit_task(exp_id, eq_type, payload, priority, tag).await {
                Ok(ft) => futures.push(ft),
                Err(e) => return (futures, Err(e)),
            }
        }
        (futures, Ok(()))
    }

    /// Insert the stop sentinel for the given work type.
    ///
    /// The sentinel carries `EQ_STOP` as its payload and priority -1, so
    /// it is claimed only after all pending work of that type. Each pool
    /// that claims it shuts down.
    pub async fn stop_worker_pool(&self, eq_type: i32) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin stop")?;

        let eq_task_id = tasks::next_task_id(tx.as_mut()).await?;
        tasks::insert_task(tx.as_mut(), eq_task_id, eq_type, EQ_STOP, -1).await?;
        queue::push_out(tx.as_mut(), eq_type, eq_task_id, -1).await?;

        tx.commit().await.context("failed to commit stop")?;
        debug!(eq_type, "stop sentinel submitted");
        Ok(())
    }

    // -- claiming -----------------------------------------------------------

    /// Claim up to `n` tasks of the given type for `worker_pool`.
    ///
    /// Long-polls until at least one task is claimable or `timeout`
    /// elapses (`None` polls forever). Per claim attempt, the queue pop
    /// and the RUNNING update commit atomically. Returns one
    /// [`TaskMessage`] per claimed task, or a single status message
    /// (`Timeout`, `Abort`, or `Stop` when the stop sentinel was popped).
    pub async fn query_task(
        &self,
        eq_type: i32,
        n: usize,
        worker_pool: &str,
        delay: Duration,
        timeout: Option<Duration>,
    ) -> Vec<TaskMessage> {
        let start = Instant::now();
        let mut delay = delay;

        loop {
            match self.try_claim(eq_type, n, worker_pool).await {
                Err(e) => {
                    error!(eq_type, error = ?e, "query_task aborted");
                    return vec![TaskMessage::Status {
                        payload: StatusPayload::Abort,
                    }];
                }
                Ok(messages) if !messages.is_empty() => return messages,
                Ok(_) => {}
            }

            // One attempt always precedes the timeout verdict.
            if let Some(timeout) = timeout {
                if start.elapsed() > timeout {
                    return vec![TaskMessage::Status {
                        payload: StatusPayload::Timeout,
                    }];
                }
            }

            tokio::time::sleep(delay).await;
            if delay < MAX_DELAY {
                delay += DELAY_INCREMENT;
            }
        }
    }

    /// One claim attempt: pop up to `n` out-queue rows and mark the
    /// claimed tasks RUNNING, atomically.
    async fn try_claim(
        &self,
        eq_type: i32,
        n: usize,
        worker_pool: &str,
    ) -> Result<Vec<TaskMessage>> {
        let mut tx = self.pool.begin().await.context("failed to begin claim")?;

        let rows = queue::pop_out_queue(tx.as_mut(), eq_type, n as i64).await?;
        if rows.is_empty() {
            tx.commit().await.context("failed to commit empty claim")?;
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.eq_task_id).collect();
        let payloads = tasks::select_task_payloads(tx.as_mut(), &ids).await?;
        tasks::mark_tasks_running(tx.as_mut(), &ids, worker_pool).await?;

        tx.commit().await.context("failed to commit claim")?;

        let messages = payloads
            .into_iter()
            .map(|(eq_task_id, payload)| {
                let payload = payload.unwrap_or_default();
                if payload == EQ_STOP {
                    TaskMessage::Status {
                        payload: StatusPayload::Stop,
                    }
                } else {
                    TaskMessage::Work {
                        eq_task_id,
                        payload,
                    }
                }
            })
            .collect();

        Ok(messages)
    }

    /// Claim work while keeping the pool's in-flight count below its
    /// capacity.
    ///
    /// `running` holds the ids the pool believes are in flight; the ids
    /// still RUNNING are retained and the claim asks for
    /// `batch_size - |running'|` tasks, but only when that count reaches
    /// `threshold`. Returns the updated in-flight id list (retained plus
    /// newly claimed) and the new task messages.
    pub async fn query_more_tasks(
        &self,
        eq_type: i32,
        running: &[i64],
        batch_size: usize,
        threshold: usize,
        worker_pool: &str,
        delay: Duration,
        timeout: Option<Duration>,
    ) -> Result<(Vec<i64>, Vec<TaskMessage>)> {
        if threshold < 1 {
            bail!("invalid threshold: must be greater than 0, got {threshold}");
        }
        if batch_size < 1 {
            bail!("invalid batch_size: must be greater than 0, got {batch_size}");
        }
        if threshold > batch_size {
            bail!(
                "invalid threshold / batch_size: threshold must be less than or equal to \
                 batch_size: threshold = {threshold}, batch_size = {batch_size}"
            );
        }

        let mut retained: Vec<i64> = Vec::new();
        if !running.is_empty() {
            let statuses = match self.query_status(running).await {
                Ok(statuses) => statuses,
                Err(e) => {
                    error!(error = ?e, "query_more_tasks status check aborted");
                    return Ok((
                        Vec::new(),
                        vec![TaskMessage::Status {
                            payload: StatusPayload::Abort,
                        }],
                    ));
                }
            };
            retained = statuses
                .into_iter()
                .filter(|(_, status)| *status == TaskStatus::Running)
                .map(|(id, _)| id)
                .collect();
        }

        let n_query = batch_size - retained.len().min(batch_size);
        if n_query < threshold {
            return Ok((retained, Vec::new()));
        }

        let messages = self
            .query_task(eq_type, n_query, worker_pool, delay, timeout)
            .await;
        let mut in_flight = retained;
        in_flight.extend(messages.iter().filter_map(TaskMessage::eq_task_id));
        Ok((in_flight, messages))
    }

    // -- reporting and results ----------------------------------------------

    /// Report a task's result.
    ///
    /// Two separate transactions, in order: first the result write
    /// (payload, COMPLETE, stop time), then the in-queue push. The split
    /// is deliberate: if the push fails the result is still durable and
    /// can be re-pushed, whereas a combined transaction would lose the
    /// result on a commit failure.
    pub async fn report_task(&self, eq_task_id: i64, eq_type: i32, result: &str) -> Result<()> {
        tasks::mark_task_complete(&self.pool, eq_task_id, result)
            .await
            .context("failed to record task result")?;

        let mut conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire connection for result push")?;
        queue::push_in(&mut conn, eq_type, eq_task_id)
            .await
            .context("failed to publish task result")?;

        debug!(eq_task_id, eq_type, "task reported");
        Ok(())
    }

    /// Long-poll for the result of one task.
    ///
    /// Same poll loop as [`TaskQueue::query_task`]: the delay grows by
    /// 0.25 s per empty attempt up to 30 s, a `None` timeout polls
    /// forever, and a database error aborts.
    pub async fn query_result(
        &self,
        eq_task_id: i64,
        delay: Duration,
        timeout: Option<Duration>,
    ) -> TaskResult {
        let start = Instant::now();
        let mut delay = delay;

        loop {
            match self.try_take_result(eq_task_id).await {
                Err(e) => {
                    error!(eq_task_id, error = ?e, "query_result aborted");
                    return TaskResult::Abort;
                }
                Ok(Some(result)) => return TaskResult::Done(result),
                Ok(None) => {}
            }

            if let Some(timeout) = timeout {
                if start.elapsed() > timeout {
                    return TaskResult::Timeout;
                }
            }

            tokio::time::sleep(delay).await;
            if delay < MAX_DELAY {
                delay += DELAY_INCREMENT;
            }
        }
    }

    /// One result attempt: pop this task's in-queue row and read
    /// `json_in` in the same transaction.
    ///
    /// The reporter publishes `json_in` before inserting the in-queue
    /// row, so a successful pop always reads a non-null result.
    async fn try_take_result(&self, eq_task_id: i64) -> Result<Option<String>> {
        let mut tx = self.pool.begin().await.context("failed to begin result pop")?;

        let popped = queue::pop_in_queue(tx.as_mut(), eq_task_id).await?;
        if popped.is_none() {
            tx.commit().await.context("failed to commit empty result pop")?;
            return Ok(None);
        }

        let result = tasks::select_task_result(tx.as_mut(), eq_task_id).await?;
        tx.commit().await.context("failed to commit result pop")?;

        if result.is_none() {
            warn!(eq_task_id, "in-queue row present but json_in is null");
        }
        Ok(Some(result.unwrap_or_default()))
    }

    // -- cancellation and priorities ----------------------------------------

    /// Cancel the given futures' tasks where still possible.
    ///
    /// Returns the ids actually canceled; a task claimed before the
    /// delete is not in the list and keeps running. The returned list is
    /// the only truth about what was canceled -- callers must check it.
    pub async fn cancel_tasks(&self, futures: &[TaskFuture]) -> Result<Vec<i64>> {
        let ids: Vec<i64> = futures.iter().map(TaskFuture::eq_task_id).collect();
        let deleted = self.cancel_task_ids(&ids).await?;

        for future in futures {
            if deleted.contains(&future.eq_task_id()) {
                future.set_cached_status(TaskStatus::Canceled);
            }
        }
        Ok(deleted)
    }

    /// Cancel by raw task id. Used by the RPC gateway, where no futures
    /// exist on the server side.
    pub async fn cancel_task_ids(&self, eq_task_ids: &[i64]) -> Result<Vec<i64>> {
        tasks::cancel_tasks(&self.pool, eq_task_ids).await
    }

    /// Update the priorities of the given futures' tasks.
    ///
    /// Only tasks still waiting on the out queue are affected; their ids
    /// are returned. With [`PriorityUpdate::PerTask`] the list length
    /// must match the future list.
    pub async fn update_priorities(
        &self,
        futures: &[TaskFuture],
        new_priority: PriorityUpdate,
    ) -> Result<Vec<i64>> {
        let ids: Vec<i64> = futures.iter().map(TaskFuture::eq_task_id).collect();
        self.update_priority_ids(&ids, new_priority).await
    }

    /// Update priorities by raw task id. Used by the RPC gateway.
    pub async fn update_priority_ids(
        &self,
        eq_task_ids: &[i64],
        new_priority: PriorityUpdate,
    ) -> Result<Vec<i64>> {
        match new_priority {
            PriorityUpdate::Single(priority) => {
                tasks::update_priorities_single(&self.pool, eq_task_ids, priority).await
            }
            PriorityUpdate::PerTask(priorities) => {
                if priorities.len() != eq_task_ids.len() {
                    bail!(
                        "number of task ids and updated priorities must be equal: \
                         {} ids, {} priorities",
                        eq_task_ids.len(),
                        priorities.len()
                    );
                }
                let updates: Vec<(i64, i32)> =
                    eq_task_ids.iter().copied().zip(priorities).collect();
                tasks::update_priorities_per_task(&self.pool, &updates).await
            }
        }
    }

    // -- read-only queries --------------------------------------------------

    /// Status of each of the given task ids.
    pub async fn query_status(&self, eq_task_ids: &[i64]) -> Result<Vec<(i64, TaskStatus)>> {
        tasks::query_status(&self.pool, eq_task_ids).await
    }

    /// Priority of each of the given task ids.
    pub async fn query_priorities(&self, eq_task_ids: &[i64]) -> Result<Vec<(i64, i32)>> {
        tasks::query_priorities(&self.pool, eq_task_ids).await
    }

    /// Claiming worker pool of each of the given task ids, `None` until
    /// the task is claimed.
    pub async fn query_worker_pools(
        &self,
        eq_task_ids: &[i64],
    ) -> Result<Vec<(i64, Option<String>)>> {
        tasks::query_worker_pools(&self.pool, eq_task_ids).await
    }

    // -- diagnostics and reset ----------------------------------------------

    /// Whether both queues are empty, optionally for one task type only.
    pub async fn are_queues_empty(&self, eq_type: Option<i32>) -> Result<bool> {
        queue::are_queues_empty(&self.pool, eq_type).await
    }

    /// Cold-reset both queues, marking the tasks still sitting on them
    /// CANCELED. Not a per-task cancellation mechanism.
    pub async fn clear_queues(&self) -> Result<()> {
        queue::clear_queues(&self.pool).await
    }
}
