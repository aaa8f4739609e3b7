//! Worker-pool lifecycle: launching local or scheduler-submitted pools,
//! cancelling them, and requeueing their in-flight tasks.
//!
//! A launch script receives `(exp_id, cfg_file)` as positional arguments.
//! Scheduler submit scripts must additionally print a `JOB_ID=<digits>`
//! line on stdout so the job can be cancelled and polled later.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use eqsql_db::models::TaskStatus;
use eqsql_db::queries::tasks;

use crate::future::TaskFuture;
use crate::task_queue::TaskQueue;

/// State of a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Active,
    Completed,
    Failed,
    Canceled,
}

/// Common surface of [`LocalPool`] and [`ScheduledPool`].
#[async_trait]
pub trait WorkerPool: Send {
    /// The pool's identity string, as written into `eq_tasks.worker_pool`
    /// when the pool claims tasks.
    fn name(&self) -> &str;

    /// Cancel the pool, waiting up to `timeout` for it to go down.
    async fn cancel(&mut self, timeout: Duration) -> Result<()>;

    /// Current status of the pool.
    async fn status(&mut self) -> Result<PoolStatus>;
}

/// Compose the experiment id a pool launch runs under: the submitter's
/// experiment id, the pool name, and a timestamp.
pub fn format_pool_exp_id(exp_id: &str, name: &str) -> String {
    let ts = Utc::now().timestamp();
    format!("{exp_id}-{name}_{ts}")
}

/// Write pool launch parameters as a `KEY=value` config file and return
/// its path. The file persists until the pool is done with it.
pub fn write_cfg_file(cfg_params: &HashMap<String, String>) -> Result<PathBuf> {
    let mut file = tempfile::NamedTempFile::new().context("failed to create pool cfg file")?;
    for (key, value) in cfg_params {
        writeln!(file, "{key}={value}").context("failed to write pool cfg file")?;
    }
    let (_, path) = file.keep().context("failed to persist pool cfg file")?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// LocalPool
// ---------------------------------------------------------------------------

/// A worker pool running as a local subprocess.
///
/// Create with [`start_local_pool`].
#[derive(Debug)]
pub struct LocalPool {
    name: String,
    child: Child,
    cfg_file: PathBuf,
    canceled: bool,
}

impl LocalPool {
    pub fn cfg_file(&self) -> &Path {
        &self.cfg_file
    }
}

/// Start a local worker pool from its launch script.
///
/// The script is spawned in its own process group with
/// `(exp_id, cfg_file)` as arguments. An early exit within the first few
/// seconds is treated as a launch failure and reported with the script's
/// output.
pub async fn start_local_pool(
    name: &str,
    launch_script: &Path,
    exp_id: &str,
    cfg_params: &HashMap<String, String>,
) -> Result<LocalPool> {
    let mut cfg_params = cfg_params.clone();
    cfg_params.insert("CFG_POOL_ID".to_owned(), name.to_owned());
    let cfg_file = write_cfg_file(&cfg_params)?;
    let pool_exp_id = format_pool_exp_id(exp_id, name);

    let mut cmd = Command::new(launch_script);
    cmd.arg(&pool_exp_id)
        .arg(&cfg_file)
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    // Own process group so cancel() can signal the script and every
    // worker it spawned in one call.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().with_context(|| {
        format!("failed to spawn pool launch script {}", launch_script.display())
    })?;

    // Probe for an early failure before handing the pool back.
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(2)).await;
        if let Some(status) = child.try_wait().context("failed to poll pool process")? {
            let output = child
                .wait_with_output()
                .await
                .context("failed to collect pool output")?;
            bail!(
                "start_local_pool failed with {status}: {}",
                String::from_utf8_lossy(&output.stdout)
            );
        }
    }

    info!(pool = name, exp_id = %pool_exp_id, "local pool started");
    Ok(LocalPool {
        name: name.to_owned(),
        child,
        cfg_file,
        canceled: false,
    })
}

#[async_trait]
impl WorkerPool for LocalPool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn cancel(&mut self, timeout: Duration) -> Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // Negative pid signals the whole process group: the launch
            // script and every worker under it.
            // SAFETY: pid is from a child we spawned.
            let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if ret != 0 {
                warn!(pool = %self.name, pid, "SIGTERM to process group failed");
            }
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pool = %self.name, %status, "pool exited after SIGTERM");
            }
            _ => {
                debug!(pool = %self.name, "pool did not exit after SIGTERM, killing");
                let _ = self.child.kill().await;
            }
        }

        self.canceled = true;
        Ok(())
    }

    async fn status(&mut self) -> Result<PoolStatus> {
        if self.canceled {
            return Ok(PoolStatus::Canceled);
        }
        match self.child.try_wait().context("failed to poll pool process")? {
            None => Ok(PoolStatus::Active),
            Some(status) if status.success() => Ok(PoolStatus::Completed),
            Some(_) => Ok(PoolStatus::Failed),
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduledPool
// ---------------------------------------------------------------------------

/// Cancel/status operations against a batch scheduler, keyed by job id.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn cancel(&self, job_id: &str) -> Result<()>;
    async fn status(&self, job_id: &str) -> Result<PoolStatus>;
}

/// Scheduler backend driving Slurm through its command-line tools.
#[derive(Debug, Clone, Default)]
pub struct SlurmScheduler;

#[async_trait]
impl Scheduler for SlurmScheduler {
    async fn cancel(&self, job_id: &str) -> Result<()> {
        let output = Command::new("scancel")
            .arg(job_id)
            .output()
            .await
            .context("failed to run scancel")?;
        if !output.status.success() {
            bail!(
                "scancel {job_id} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    async fn status(&self, job_id: &str) -> Result<PoolStatus> {
        let output = Command::new("squeue")
            .args(["-h", "-j", job_id, "-o", "%T"])
            .output()
            .await
            .context("failed to run squeue")?;

        // squeue only knows queued/running jobs; an empty answer means the
        // job already left the queue.
        let state = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        let status = match state.as_str() {
            "" => PoolStatus::Completed,
            "PENDING" | "RUNNING" | "COMPLETING" | "CONFIGURING" => PoolStatus::Active,
            "CANCELLED" => PoolStatus::Canceled,
            "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" => PoolStatus::Failed,
            other => {
                warn!(job_id, state = other, "unrecognized scheduler state");
                PoolStatus::Active
            }
        };
        Ok(status)
    }
}

/// A worker pool submitted to a batch scheduler.
///
/// Create with [`start_scheduled_pool`].
pub struct ScheduledPool {
    name: String,
    job_id: String,
    scheduler: Arc<dyn Scheduler>,
    cfg_file: PathBuf,
}

impl std::fmt::Debug for ScheduledPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledPool")
            .field("name", &self.name)
            .field("job_id", &self.job_id)
            .field("cfg_file", &self.cfg_file)
            .finish()
    }
}

impl ScheduledPool {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cfg_file(&self) -> &Path {
        &self.cfg_file
    }
}

/// Submit a worker pool to a batch scheduler via its submit script.
///
/// The script runs to completion; its stdout must contain a line of the
/// form `JOB_ID=<digits>` naming the scheduler job, which is then
/// controlled through `scheduler`.
pub async fn start_scheduled_pool(
    name: &str,
    submit_script: &Path,
    exp_id: &str,
    cfg_params: &HashMap<String, String>,
    scheduler: Arc<dyn Scheduler>,
) -> Result<ScheduledPool> {
    let mut cfg_params = cfg_params.clone();
    cfg_params.insert("CFG_POOL_ID".to_owned(), name.to_owned());
    let cfg_file = write_cfg_file(&cfg_params)?;
    let pool_exp_id = format_pool_exp_id(exp_id, name);

    let mut cmd = Command::new(submit_script);
    cmd.arg(&pool_exp_id).arg(&cfg_file);
    if let Some(cwd) = submit_script.parent().filter(|p| !p.as_os_str().is_empty()) {
        cmd.current_dir(cwd);
    }

    let output = cmd.output().await.with_context(|| {
        format!("failed to run pool submit script {}", submit_script.display())
    })?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        bail!("start_scheduled_pool failed with {}: {stdout}", output.status);
    }

    let job_id = parse_job_id(&stdout)
        .with_context(|| format!("no JOB_ID line in submit script output: {stdout}"))?;

    info!(pool = name, job_id = %job_id, "scheduled pool submitted");
    Ok(ScheduledPool {
        name: name.to_owned(),
        job_id,
        scheduler,
        cfg_file,
    })
}

/// Extract the job id from a `JOB_ID=<digits>` stdout line.
fn parse_job_id(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let digits = line.trim().strip_prefix("JOB_ID=")?;
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            Some(digits.to_owned())
        } else {
            None
        }
    })
}

#[async_trait]
impl WorkerPool for ScheduledPool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn cancel(&mut self, timeout: Duration) -> Result<()> {
        self.scheduler.cancel(&self.job_id).await?;

        // The scheduler cancels asynchronously; poll until it reports so.
        let poll = Duration::from_millis(250);
        let mut waited = Duration::ZERO;
        while waited < timeout {
            if self.scheduler.status(&self.job_id).await? == PoolStatus::Canceled {
                break;
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        }
        Ok(())
    }

    async fn status(&mut self) -> Result<PoolStatus> {
        self.scheduler.status(&self.job_id).await
    }
}

// ---------------------------------------------------------------------------
// Cancellation with requeue
// ---------------------------------------------------------------------------

/// Cancel a worker pool and resubmit its in-flight tasks.
///
/// The pool's RUNNING tasks are marked REQUEUED and resubmitted as fresh
/// tasks preserving payload, priority, and tag -- new ids are issued, old
/// ids are not reused. Returns the futures of the resubmitted tasks,
/// merged with those of `futures` that were not requeued.
pub async fn cancel_worker_pool(
    pool: &mut dyn WorkerPool,
    queue: &TaskQueue,
    exp_id: &str,
    futures: Vec<TaskFuture>,
) -> Result<Vec<TaskFuture>> {
    pool.cancel(Duration::from_secs(60)).await?;

    let running = tasks::tasks_running_on_pool(queue.pool(), pool.name()).await?;
    let task_ids: Vec<i64> = running.iter().map(|(id, _, _, _)| *id).collect();

    tasks::update_statuses(queue.pool(), &task_ids, TaskStatus::Requeued).await?;

    let tags: HashMap<i64, String> = tasks::select_task_tags(queue.pool(), &task_ids)
        .await?
        .into_iter()
        .collect();

    let mut new_futures = Vec::with_capacity(running.len());
    for (eq_task_id, eq_task_type, payload, priority) in &running {
        let payload = payload.as_deref().unwrap_or_default();
        let tag = tags.get(eq_task_id).map(String::as_str);
        let future = queue
            .submit_task(exp_id, *eq_task_type, payload, *priority, tag)
            .await
            .with_context(|| format!("failed to resubmit task {eq_task_id}"))?;
        new_futures.push(future);
    }

    info!(
        pool = pool.name(),
        requeued = new_futures.len(),
        "pool canceled, in-flight tasks requeued"
    );

    let requeued: std::collections::HashSet<i64> = task_ids.into_iter().collect();
    for future in futures {
        if !requeued.contains(&future.eq_task_id()) {
            new_futures.push(future);
        }
    }

    Ok(new_futures)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_job_id_matches_digit_lines() {
        assert_eq!(
            parse_job_id("Submitted batch job\nJOB_ID=12345\n"),
            Some("12345".to_owned())
        );
        assert_eq!(parse_job_id("JOB_ID=\n"), None);
        assert_eq!(parse_job_id("JOB_ID=12a45\n"), None);
        assert_eq!(parse_job_id("nothing here\n"), None);
    }

    #[test]
    fn pool_exp_id_includes_both_names() {
        let id = format_pool_exp_id("exp-3", "pool-a");
        assert!(id.starts_with("exp-3-pool-a_"));
    }

    #[test]
    fn cfg_file_contains_params() {
        let mut params = HashMap::new();
        params.insert("CFG_BATCH_SIZE".to_owned(), "4".to_owned());
        params.insert("CFG_POOL_ID".to_owned(), "p1".to_owned());

        let path = write_cfg_file(&params).expect("cfg file");
        let contents = std::fs::read_to_string(&path).expect("read cfg");
        assert!(contents.contains("CFG_BATCH_SIZE=4"));
        assert!(contents.contains("CFG_POOL_ID=p1"));
        std::fs::remove_file(path).ok();
    }
}
