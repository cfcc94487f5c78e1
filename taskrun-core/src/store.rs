use crate::events::RunEvent;
use crate::types::*;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors surfaced by store backends. Illegal transitions are rejected here,
/// not by callers: the store is the only component allowed to write the run
/// tables, and it enforces the transition table on every write.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("illegal status transition for stack run {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        id: StackRunId,
        from: StackRunStatus,
        to: StackRunStatus,
    },
    #[error("stack run not found: {0}")]
    StackRunNotFound(StackRunId),
    #[error("task run not found: {0}")]
    TaskRunNotFound(TaskRunId),
    #[error("stack run {child} names missing parent {parent}")]
    OrphanedFrame {
        child: StackRunId,
        parent: StackRunId,
    },
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Persistence contract for the two run tables plus the audit trail.
///
/// Every method is atomic: backends either apply the whole state change or
/// none of it. The dispatcher and engine operate exclusively through this
/// trait (`MemoryRunStore` for tests and embedding, Postgres for
/// production).
///
/// Task-run status bookkeeping is the store's job, not the caller's:
/// claiming a task-root frame moves its task run to `processing`,
/// suspending it moves the task run to `suspended`, and terminating it
/// terminates the task run exactly once.
#[async_trait]
pub trait RunStore: Send + Sync {
    // ── Creation ──

    /// Insert a `queued` task run plus its root stack run (`pending`,
    /// service `tasks`, method `execute`, args `[task_name, input]`).
    async fn create_task_run(&self, task_name: &str, input: Value) -> Result<TaskRun, StoreError>;

    // ── Claims ──

    /// Atomically select the oldest claimable stack run (`pending` or
    /// `pending_resume`, FIFO by creation time), flip it to `processing`
    /// and return it. Returns `None` when nothing is ready.
    async fn claim_next_ready(&self) -> Result<Option<StackRun>, StoreError>;

    /// Same, for a caller-named id (the self-trigger fast path). Returns
    /// `None` if the row is not in a claimable status.
    async fn claim_specific(&self, id: StackRunId) -> Result<Option<StackRun>, StoreError>;

    // ── Transitions ──

    /// Persist `continuation` on the suspending frame, flip it to
    /// `suspended_waiting_child`, and insert the child frame as `pending`.
    /// Returns the created child.
    async fn suspend(
        &self,
        stack_run_id: StackRunId,
        continuation: &Continuation,
        child: &ChildSpec,
    ) -> Result<StackRun, StoreError>;

    /// The `tasks/execute` arm: create a child task run and its root stack
    /// run (`pending`, parented on `stack_run_id`), and flip the claimed
    /// frame to `suspended_waiting_child` on that root.
    async fn spawn_child_task(
        &self,
        stack_run_id: StackRunId,
        task_name: &str,
        input: Value,
    ) -> Result<(TaskRun, StackRun), StoreError>;

    /// Terminate a stack run successfully. The result is written before the
    /// parent (if any, and still waiting on this child) is staged with
    /// `resume_payload` and flipped to `pending_resume`; that parent's id is
    /// returned. Completing a task-root frame promotes its task run.
    async fn complete(
        &self,
        stack_run_id: StackRunId,
        result: Value,
    ) -> Result<Option<StackRunId>, StoreError>;

    /// Terminate a stack run with an error and propagate upward: every
    /// still-suspended ancestor is failed with a wrapped error, every task
    /// run rooted along the way is failed with the original error. Siblings
    /// are never resurrected. Returns the enclosing root task run id.
    async fn fail(&self, stack_run_id: StackRunId, error: &RunError)
        -> Result<TaskRunId, StoreError>;

    // ── Reads ──

    async fn get_task_run(&self, id: TaskRunId) -> Result<Option<TaskRun>, StoreError>;
    async fn get_stack_run(&self, id: StackRunId) -> Result<Option<StackRun>, StoreError>;

    // ── Audit trail ──

    /// Append an event and return its sequence number.
    async fn append_event(
        &self,
        task_run_id: TaskRunId,
        event: &RunEvent,
    ) -> Result<u64, StoreError>;

    async fn read_events(
        &self,
        task_run_id: TaskRunId,
        from_seq: u64,
    ) -> Result<Vec<(u64, RunEvent)>, StoreError>;
}

// ─── Task registry ────────────────────────────────────────────

/// Source of task handler code. The core consumes code as an opaque string;
/// durable code storage lives outside it.
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    async fn register(&self, name: &str, code: &str) -> anyhow::Result<()>;
    async fn lookup(&self, name: &str) -> anyhow::Result<Option<String>>;
    async fn list(&self) -> anyhow::Result<Vec<String>>;
}

/// In-memory registry for tests and single-process deployments.
pub struct MemoryTaskRegistry {
    tasks: RwLock<HashMap<String, String>>,
}

impl MemoryTaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRegistry for MemoryTaskRegistry {
    async fn register(&self, name: &str, code: &str) -> anyhow::Result<()> {
        let mut w = self.tasks.write().await;
        w.insert(name.to_string(), code.to_string());
        Ok(())
    }

    async fn lookup(&self, name: &str) -> anyhow::Result<Option<String>> {
        let r = self.tasks.read().await;
        Ok(r.get(name).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        let r = self.tasks.read().await;
        let mut names: Vec<String> = r.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
