use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status payload pushed in place of work when a pool should shut down.
pub const EQ_STOP: &str = "EQ_STOP";
/// Status payload returned when a queue operation hit a database error.
pub const EQ_ABORT: &str = "EQ_ABORT";
/// Status payload returned when a poll loop exhausted its time budget.
pub const EQ_TIMEOUT: &str = "EQ_TIMEOUT";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task, stored as an integer in `eq_tasks.eq_status`.
///
/// Permitted transitions: QUEUED -> RUNNING, RUNNING -> COMPLETE,
/// QUEUED -> CANCELED, RUNNING -> REQUEUED, REQUEUED -> QUEUED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued = 0,
    Running = 1,
    Complete = 2,
    Canceled = 3,
    Requeued = 4,
}

impl TaskStatus {
    /// True for statuses a task can never leave through normal operation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Canceled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Canceled => "canceled",
            Self::Requeued => "requeued",
        };
        f.write_str(s)
    }
}

impl TryFrom<i32> for TaskStatus {
    type Error = TaskStatusParseError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Queued),
            1 => Ok(Self::Running),
            2 => Ok(Self::Complete),
            3 => Ok(Self::Canceled),
            4 => Ok(Self::Requeued),
            other => Err(TaskStatusParseError(other)),
        }
    }
}

/// Error returned when an integer is not a valid [`TaskStatus`].
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub i32);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status value: {}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A row in `eq_tasks` -- the canonical record for one unit of work.
///
/// Time columns hold RFC 3339 strings with offsets; payloads are opaque
/// to the queue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub eq_task_id: i64,
    pub eq_task_type: i32,
    pub eq_priority: i32,
    pub eq_status: TaskStatus,
    pub worker_pool: Option<String>,
    pub json_out: Option<String>,
    pub json_in: Option<String>,
    pub time_created: Option<String>,
    pub time_start: Option<String>,
    pub time_stop: Option<String>,
}

/// A row in `emews_queue_out`: work awaiting a claim.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutQueueRow {
    pub eq_task_type: i32,
    pub eq_task_id: i64,
    pub eq_priority: i32,
}

/// A row in `emews_queue_in`: a result awaiting its submitter.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InQueueRow {
    pub eq_task_type: i32,
    pub eq_task_id: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_int_roundtrip() {
        let variants = [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Complete,
            TaskStatus::Canceled,
            TaskStatus::Requeued,
        ];
        for v in &variants {
            let n = *v as i32;
            let parsed = TaskStatus::try_from(n).expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!(TaskStatus::try_from(9).is_err());
        assert!(TaskStatus::try_from(-1).is_err());
    }

    #[test]
    fn task_status_terminal() {
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Requeued.is_terminal());
    }

    #[test]
    fn task_status_display() {
        assert_eq!(TaskStatus::Queued.to_string(), "queued");
        assert_eq!(TaskStatus::Canceled.to_string(), "canceled");
    }
}
