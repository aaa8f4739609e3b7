//! HTTP access to a task queue through the RPC gateway.
//!
//! The gateway keeps no session state: every request body carries the
//! database connection parameters ([`DbParams`]) alongside the operation
//! arguments, and the server opens a fresh task queue per request. The
//! request/response types here are shared with the server so both ends
//! agree on the wire shapes.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use eqsql_db::config::DbConfig;
use eqsql_db::models::TaskStatus;

use crate::future::TimeoutError;
use crate::task_queue::{PriorityUpdate, TaskResult};

/// Database connection parameters as they travel in request bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbParams {
    pub user: String,
    pub host: String,
    pub db_name: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub retry: u32,
}

impl DbParams {
    pub fn to_db_config(&self) -> DbConfig {
        DbConfig::new(
            self.host.clone(),
            self.port.unwrap_or(5432),
            self.user.clone(),
            self.password.clone(),
            self.db_name.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Outcome marker carried by every gateway response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireStatus {
    Ok,
    Fail,
    TimeoutError,
}

/// Wire form of a result query outcome: the success/failure flag of the
/// original protocol (0 = success, 1 = failure) plus the payload, which
/// on failure is one of the `EQ_*` constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResult {
    pub result_status: i32,
    pub result: String,
}

impl From<&TaskResult> for WireResult {
    fn from(result: &TaskResult) -> Self {
        Self {
            result_status: if result.is_done() { 0 } else { 1 },
            result: result.payload().to_owned(),
        }
    }
}

impl WireResult {
    pub fn into_task_result(self) -> TaskResult {
        if self.result_status == 0 {
            TaskResult::Done(self.result)
        } else if self.result == eqsql_db::models::EQ_TIMEOUT {
            TaskResult::Timeout
        } else {
            TaskResult::Abort
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTasksRequest {
    pub db_params: DbParams,
    pub exp_id: String,
    pub eq_type: i32,
    pub payload: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTasksResponse {
    pub status: WireStatus,
    pub task_ids: Vec<i64>,
}

/// Request shape shared by the id-keyed operations (`get_status`,
/// `get_worker_pools`, `get_priorities`, `cancel_tasks`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIdsRequest {
    pub db_params: DbParams,
    pub task_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: WireStatus,
    pub result: Vec<(i64, i32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolsResponse {
    pub status: WireStatus,
    pub result: Vec<(i64, Option<String>)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioritiesResponse {
    pub status: WireStatus,
    pub result: Vec<(i64, i32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePrioritiesRequest {
    pub db_params: DbParams,
    pub task_ids: Vec<i64>,
    pub new_priority: PriorityUpdate,
}

/// Response for both `update_priorities` and `cancel_tasks`: the ids the
/// operation actually affected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIdsResponse {
    pub status: WireStatus,
    pub result: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResultRequest {
    pub db_params: DbParams,
    pub eq_task_id: i64,
    /// Initial poll delay, seconds.
    pub delay: f64,
    /// Poll budget, seconds; `None` polls forever.
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResultResponse {
    pub status: WireStatus,
    pub result: WireResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesEmptyRequest {
    pub db_params: DbParams,
    #[serde(default)]
    pub eq_type: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesEmptyResponse {
    pub status: WireStatus,
    pub result: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsCompletedRequest {
    pub db_params: DbParams,
    pub task_ids: Vec<i64>,
    /// Ids the client has already seen complete; the server skips them.
    #[serde(default)]
    pub completed_tasks: Vec<i64>,
    /// Server-side wall-clock budget, seconds.
    pub timeout: Option<f64>,
    /// Stop after this many newly-completed tasks.
    #[serde(default)]
    pub n: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between sweeps, seconds.
    #[serde(default)]
    pub sleep: f64,
}

fn default_batch_size() -> usize {
    1
}

/// One newly-completed task in an `as_completed` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTask {
    pub eq_task_id: i64,
    /// `eq_status` of the task, when it could be read.
    pub task_status: Option<i32>,
    #[serde(flatten)]
    pub result: WireResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsCompletedResponse {
    pub status: WireStatus,
    pub result: Vec<CompletedTask>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A task queue driven through the RPC gateway instead of a direct
/// database connection.
///
/// Operations are keyed by task id; submission returns the new ids. The
/// gateway performs each call with a fresh task-queue connection built
/// from `db_params`.
#[derive(Debug, Clone)]
pub struct ServiceTaskQueue {
    base_url: String,
    db_params: DbParams,
    client: reqwest::Client,
}

impl ServiceTaskQueue {
    pub fn new(service_url: impl Into<String>, db_params: DbParams) -> Self {
        Self {
            base_url: service_url.into().trim_end_matches('/').to_owned(),
            db_params,
            client: reqwest::Client::new(),
        }
    }

    async fn post<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> Result<Resp> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("failed to reach gateway at {url}"))?;
        let response = response
            .error_for_status()
            .with_context(|| format!("gateway request to {endpoint} failed"))?;
        response
            .json()
            .await
            .with_context(|| format!("failed to decode gateway response from {endpoint}"))
    }

    /// Check that the gateway is alive.
    pub async fn ping(&self) -> Result<String> {
        let url = format!("{}/ping", self.base_url);
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach gateway at {url}"))?
            .text()
            .await
            .context("failed to read ping response")?;
        Ok(body)
    }

    /// Ask the gateway to shut down gracefully.
    pub async fn shutdown(&self) -> Result<String> {
        let url = format!("{}/shutdown", self.base_url);
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach gateway at {url}"))?
            .text()
            .await
            .context("failed to read shutdown response")?;
        Ok(body)
    }

    /// Submit one payload; returns the new task id.
    pub async fn submit_task(
        &self,
        exp_id: &str,
        eq_type: i32,
        payload: &str,
        priority: i32,
        tag: Option<&str>,
    ) -> Result<i64> {
        let ids = self
            .submit_tasks(exp_id, eq_type, &[payload.to_owned()], priority, tag)
            .await?;
        ids.first()
            .copied()
            .context("gateway returned no task id for submission")
    }

    /// Submit a list of payloads; returns the new task ids.
    pub async fn submit_tasks(
        &self,
        exp_id: &str,
        eq_type: i32,
        payloads: &[String],
        priority: i32,
        tag: Option<&str>,
    ) -> Result<Vec<i64>> {
        let request = SubmitTasksRequest {
            db_params: self.db_params.clone(),
            exp_id: exp_id.to_owned(),
            eq_type,
            payload: payloads.to_vec(),
            priority,
            tag: tag.map(String::from),
        };
        let response: SubmitTasksResponse = self.post("submit_tasks", &request).await?;
        if response.status != WireStatus::Ok {
            bail!("gateway submission failed (submitted: {:?})", response.task_ids);
        }
        Ok(response.task_ids)
    }

    /// Status of each of the given task ids.
    pub async fn query_status(&self, task_ids: &[i64]) -> Result<Vec<(i64, TaskStatus)>> {
        let request = TaskIdsRequest {
            db_params: self.db_params.clone(),
            task_ids: task_ids.to_vec(),
        };
        let response: StatusResponse = self.post("get_status", &request).await?;
        if response.status != WireStatus::Ok {
            bail!("gateway status query failed");
        }
        response
            .result
            .into_iter()
            .map(|(id, status)| {
                let status = TaskStatus::try_from(status)
                    .with_context(|| format!("bad status for task {id}"))?;
                Ok((id, status))
            })
            .collect()
    }

    /// Worker pool of each of the given task ids.
    pub async fn query_worker_pools(
        &self,
        task_ids: &[i64],
    ) -> Result<Vec<(i64, Option<String>)>> {
        let request = TaskIdsRequest {
            db_params: self.db_params.clone(),
            task_ids: task_ids.to_vec(),
        };
        let response: WorkerPoolsResponse = self.post("get_worker_pools", &request).await?;
        if response.status != WireStatus::Ok {
            bail!("gateway worker-pool query failed");
        }
        Ok(response.result)
    }

    /// Priority of each of the given task ids.
    pub async fn query_priorities(&self, task_ids: &[i64]) -> Result<Vec<(i64, i32)>> {
        let request = TaskIdsRequest {
            db_params: self.db_params.clone(),
            task_ids: task_ids.to_vec(),
        };
        let response: PrioritiesResponse = self.post("get_priorities", &request).await?;
        if response.status != WireStatus::Ok {
            bail!("gateway priority query failed");
        }
        Ok(response.result)
    }

    /// Update priorities; returns the ids still on the queue that were
    /// actually updated.
    pub async fn update_priorities(
        &self,
        task_ids: &[i64],
        new_priority: PriorityUpdate,
    ) -> Result<Vec<i64>> {
        let request = UpdatePrioritiesRequest {
            db_params: self.db_params.clone(),
            task_ids: task_ids.to_vec(),
            new_priority,
        };
        let response: TaskIdsResponse = self.post("update_priorities", &request).await?;
        if response.status != WireStatus::Ok {
            bail!("gateway priority update failed");
        }
        Ok(response.result)
    }

    /// Cancel tasks; returns the ids actually canceled.
    pub async fn cancel_tasks(&self, task_ids: &[i64]) -> Result<Vec<i64>> {
        let request = TaskIdsRequest {
            db_params: self.db_params.clone(),
            task_ids: task_ids.to_vec(),
        };
        let response: TaskIdsResponse = self.post("cancel_tasks", &request).await?;
        if response.status != WireStatus::Ok {
            bail!("gateway cancel failed");
        }
        Ok(response.result)
    }

    /// Long-poll for one task's result through the gateway.
    pub async fn query_result(
        &self,
        eq_task_id: i64,
        delay: Duration,
        timeout: Option<Duration>,
    ) -> Result<TaskResult> {
        let request = QueryResultRequest {
            db_params: self.db_params.clone(),
            eq_task_id,
            delay: delay.as_secs_f64(),
            timeout: timeout.map(|t| t.as_secs_f64()),
        };
        let response: QueryResultResponse = self.post("query_result", &request).await?;
        Ok(response.result.into_task_result())
    }

    /// Whether both queues are empty, optionally for one task type.
    pub async fn are_queues_empty(&self, eq_type: Option<i32>) -> Result<bool> {
        let request = QueuesEmptyRequest {
            db_params: self.db_params.clone(),
            eq_type,
        };
        let response: QueuesEmptyResponse = self.post("are_queues_empty", &request).await?;
        if response.status != WireStatus::Ok {
            bail!("gateway queue check failed");
        }
        Ok(response.result)
    }

    /// Collect `n` completions (all of `task_ids` when `None`) as the
    /// server observes them.
    ///
    /// The completed-id set lives on this side of the wire: each request
    /// retransmits it so the stateless server knows what to skip, and the
    /// ids are shuffled first so tasks at the head of the list cannot
    /// starve the rest. The server sweeps with zero-timeout result
    /// queries and returns each newly-completed batch; when its
    /// wall-clock budget runs out a `TimeoutError` surfaces here.
    pub async fn as_completed(
        &self,
        task_ids: &[i64],
        timeout: Option<Duration>,
        n: Option<usize>,
        batch_size: usize,
        sleep: Duration,
    ) -> Result<Vec<CompletedTask>> {
        let target = n.unwrap_or(task_ids.len()).min(task_ids.len());
        let mut completed: Vec<CompletedTask> = Vec::new();
        let mut completed_ids: Vec<i64> = Vec::new();
        let mut shuffled: Vec<i64> = task_ids.to_vec();

        while completed.len() < target {
            shuffled.shuffle(&mut rand::rng());
            let request = AsCompletedRequest {
                db_params: self.db_params.clone(),
                task_ids: shuffled.clone(),
                completed_tasks: completed_ids.clone(),
                timeout: timeout.map(|t| t.as_secs_f64()),
                n: Some(target - completed.len()),
                batch_size,
                sleep: sleep.as_secs_f64(),
            };
            let response: AsCompletedResponse = self.post("as_completed", &request).await?;
            match response.status {
                WireStatus::TimeoutError => {
                    return Err(TimeoutError(timeout.unwrap_or_default()).into());
                }
                WireStatus::Fail => bail!("gateway as_completed failed"),
                WireStatus::Ok => {}
            }
            for task in response.result {
                completed_ids.push(task.eq_task_id);
                completed.push(task);
            }
        }

        Ok(completed)
    }

    /// Pop the first completion among `task_ids`.
    pub async fn pop_completed(
        &self,
        task_ids: &[i64],
        timeout: Option<Duration>,
        sleep: Duration,
    ) -> Result<CompletedTask> {
        let mut completed = self
            .as_completed(task_ids, timeout, Some(1), 1, sleep)
            .await?;
        completed
            .pop()
            .context("gateway returned an empty completion batch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_params_field_names() {
        let params = DbParams {
            user: "alice".to_owned(),
            host: "dbhost".to_owned(),
            db_name: "experiments".to_owned(),
            password: None,
            port: Some(5433),
            retry: 3,
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "user": "alice",
                "host": "dbhost",
                "db_name": "experiments",
                "password": null,
                "port": 5433,
                "retry": 3
            })
        );
    }

    #[test]
    fn priority_update_wire_forms() {
        let single: PriorityUpdate = serde_json::from_str("5").unwrap();
        assert_eq!(single, PriorityUpdate::Single(5));

        let per_task: PriorityUpdate = serde_json::from_str("[1, 2, 3]").unwrap();
        assert_eq!(per_task, PriorityUpdate::PerTask(vec![1, 2, 3]));
    }

    #[test]
    fn wire_result_roundtrip() {
        let done = WireResult::from(&TaskResult::Done("42".to_owned()));
        assert_eq!(done.result_status, 0);
        assert_eq!(done.clone().into_task_result(), TaskResult::Done("42".to_owned()));

        let timeout = WireResult::from(&TaskResult::Timeout);
        assert_eq!(timeout.result_status, 1);
        assert_eq!(timeout.result, "EQ_TIMEOUT");
        assert_eq!(timeout.clone().into_task_result(), TaskResult::Timeout);

        let abort = WireResult::from(&TaskResult::Abort);
        assert_eq!(abort.result, "EQ_ABORT");
        assert_eq!(abort.clone().into_task_result(), TaskResult::Abort);
    }

    #[test]
    fn status_payload_constants() {
        use crate::task_queue::StatusPayload;
        assert_eq!(
            serde_json::to_value(StatusPayload::Stop).unwrap(),
            serde_json::json!("EQ_STOP")
        );
        assert_eq!(
            serde_json::to_value(StatusPayload::Abort).unwrap(),
            serde_json::json!("EQ_ABORT")
        );
        assert_eq!(
            serde_json::to_value(StatusPayload::Timeout).unwrap(),
            serde_json::json!("EQ_TIMEOUT")
        );
    }
}
