//! The EQSQL client library: the task-queue lifecycle API, the `TaskFuture`
//! handle and its polling helpers, the HTTP service client, and the
//! worker-pool controller.
//!
//! A management engine submits opaque payloads through a [`TaskQueue`] and
//! consumes results through [`TaskFuture`]s; worker pools claim work with
//! [`TaskQueue::query_task`] and report results back with
//! [`TaskQueue::report_task`]. PostgreSQL is the only rendezvous between
//! the two sides.

pub mod future;
pub mod service;
pub mod task_queue;
pub mod worker_pool;

pub use future::{TaskFuture, TimeoutError, as_completed, pop_completed};
pub use task_queue::{
    DEFAULT_WORKER_POOL, PriorityUpdate, StatusPayload, TaskMessage, TaskQueue, TaskResult,
    init_task_queue,
};
