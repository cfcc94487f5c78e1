use crate::events::RunEvent;
use crate::store::{RunStore, StoreError};
use crate::types::*;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Inner {
    task_runs: HashMap<TaskRunId, TaskRun>,
    stack_runs: HashMap<StackRunId, StackRun>,
    /// Arrival counter per stack run — breaks `created_at` ties so claim
    /// order stays FIFO even when rows share a millisecond.
    arrival: HashMap<StackRunId, u64>,
    next_arrival: u64,
    events: HashMap<TaskRunId, Vec<(u64, RunEvent)>>,
    event_seq: HashMap<TaskRunId, u64>,
}

/// In-memory implementation of `RunStore` for tests and single-process
/// embedding. One `RwLock` serializes every mutation, which makes each
/// trait method trivially atomic.
pub struct MemoryRunStore {
    inner: RwLock<Inner>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                task_runs: HashMap::new(),
                stack_runs: HashMap::new(),
                arrival: HashMap::new(),
                next_arrival: 0,
                events: HashMap::new(),
                event_seq: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn insert_stack_run(&mut self, run: StackRun) {
        self.arrival.insert(run.id, self.next_arrival);
        self.next_arrival += 1;
        self.stack_runs.insert(run.id, run);
    }

    /// Flip a claimable row to `processing` and mirror the claim onto its
    /// task run when the row is a task-root frame.
    fn claim_row(&mut self, id: StackRunId, now: Timestamp) -> Option<StackRun> {
        let run = self.stack_runs.get_mut(&id)?;
        if !run.status.is_claimable() {
            return None;
        }
        run.status = StackRunStatus::Processing;
        run.updated_at = now;
        let claimed = run.clone();

        if let Some(task_id) = claimed.root_of_task_run_id {
            if let Some(task) = self.task_runs.get_mut(&task_id) {
                if !task.status.is_terminal() {
                    task.status = TaskRunStatus::Processing;
                    task.waiting_on_stack_run_id = None;
                    task.updated_at = now;
                }
            }
        }
        Some(claimed)
    }

    /// Terminate a task run exactly once. Late writes against an already
    /// terminal run are dropped, keeping terminal fields write-once.
    fn finish_task(
        &mut self,
        task_id: TaskRunId,
        status: TaskRunStatus,
        result: Option<Value>,
        error: Option<RunError>,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let task = self
            .task_runs
            .get_mut(&task_id)
            .ok_or(StoreError::TaskRunNotFound(task_id))?;
        if task.status.is_terminal() {
            tracing::warn!(%task_id, ?status, "ignoring terminal write to ended task run");
            return Ok(());
        }
        task.status = status;
        task.result = result;
        task.error = error;
        task.waiting_on_stack_run_id = None;
        task.updated_at = now;
        task.ended_at = Some(now);
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    // ── Creation ──

    async fn create_task_run(&self, task_name: &str, input: Value) -> Result<TaskRun, StoreError> {
        let now = now_ms();
        let task_id = Uuid::now_v7();
        let root_id = Uuid::now_v7();

        let task = TaskRun {
            id: task_id,
            task_name: task_name.to_string(),
            input: input.clone(),
            status: TaskRunStatus::Queued,
            result: None,
            error: None,
            root_stack_run_id: root_id,
            waiting_on_stack_run_id: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };
        let root = StackRun {
            id: root_id,
            parent_task_run_id: task_id,
            parent_stack_run_id: None,
            root_of_task_run_id: Some(task_id),
            service_name: TASKS_SERVICE.to_string(),
            method_name: EXECUTE_METHOD.to_string(),
            args: vec![Value::String(task_name.to_string()), input],
            status: StackRunStatus::Pending,
            result: None,
            error: None,
            vm_state: None,
            resume_payload: None,
            waiting_on_stack_run_id: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };

        let mut w = self.inner.write().await;
        w.task_runs.insert(task_id, task.clone());
        w.insert_stack_run(root);
        Ok(task)
    }

    // ── Claims ──

    async fn claim_next_ready(&self) -> Result<Option<StackRun>, StoreError> {
        let mut w = self.inner.write().await;
        let next = w
            .stack_runs
            .values()
            .filter(|r| r.status.is_claimable())
            .min_by_key(|r| (r.created_at, w.arrival.get(&r.id).copied().unwrap_or(u64::MAX)))
            .map(|r| r.id);
        Ok(next.and_then(|id| w.claim_row(id, now_ms())))
    }

    async fn claim_specific(&self, id: StackRunId) -> Result<Option<StackRun>, StoreError> {
        let mut w = self.inner.write().await;
        Ok(w.claim_row(id, now_ms()))
    }

    // ── Transitions ──

    async fn suspend(
        &self,
        stack_run_id: StackRunId,
        continuation: &Continuation,
        child: &ChildSpec,
    ) -> Result<StackRun, StoreError> {
        let now = now_ms();
        let mut w = self.inner.write().await;

        let parent = w
            .stack_runs
            .get_mut(&stack_run_id)
            .ok_or(StoreError::StackRunNotFound(stack_run_id))?;
        if !parent
            .status
            .can_transition_to(StackRunStatus::SuspendedWaitingChild)
        {
            return Err(StoreError::IllegalTransition {
                id: stack_run_id,
                from: parent.status,
                to: StackRunStatus::SuspendedWaitingChild,
            });
        }

        let child_id = Uuid::now_v7();
        parent.status = StackRunStatus::SuspendedWaitingChild;
        parent.vm_state = Some(continuation.clone());
        parent.waiting_on_stack_run_id = Some(child_id);
        parent.resume_payload = None;
        parent.updated_at = now;

        let parent_task = parent.parent_task_run_id;
        let parent_root_of = parent.root_of_task_run_id;

        let child_run = StackRun {
            id: child_id,
            parent_task_run_id: parent_task,
            parent_stack_run_id: Some(stack_run_id),
            root_of_task_run_id: None,
            service_name: child.service.clone(),
            method_name: child.method.clone(),
            args: child.args.clone(),
            status: StackRunStatus::Pending,
            result: None,
            error: None,
            vm_state: None,
            resume_payload: None,
            waiting_on_stack_run_id: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };
        w.insert_stack_run(child_run.clone());

        if let Some(task_id) = parent_root_of {
            if let Some(task) = w.task_runs.get_mut(&task_id) {
                if !task.status.is_terminal() {
                    task.status = TaskRunStatus::Suspended;
                    task.waiting_on_stack_run_id = Some(child_id);
                    task.updated_at = now;
                }
            }
        }

        Ok(child_run)
    }

    async fn spawn_child_task(
        &self,
        stack_run_id: StackRunId,
        task_name: &str,
        input: Value,
    ) -> Result<(TaskRun, StackRun), StoreError> {
        let now = now_ms();
        let mut w = self.inner.write().await;

        let frame = w
            .stack_runs
            .get_mut(&stack_run_id)
            .ok_or(StoreError::StackRunNotFound(stack_run_id))?;
        if !frame
            .status
            .can_transition_to(StackRunStatus::SuspendedWaitingChild)
        {
            return Err(StoreError::IllegalTransition {
                id: stack_run_id,
                from: frame.status,
                to: StackRunStatus::SuspendedWaitingChild,
            });
        }

        let child_task_id = Uuid::now_v7();
        let child_root_id = Uuid::now_v7();

        frame.status = StackRunStatus::SuspendedWaitingChild;
        frame.waiting_on_stack_run_id = Some(child_root_id);
        frame.updated_at = now;
        let frame_task = frame.parent_task_run_id;

        let child_task = TaskRun {
            id: child_task_id,
            task_name: task_name.to_string(),
            input: input.clone(),
            status: TaskRunStatus::Queued,
            result: None,
            error: None,
            root_stack_run_id: child_root_id,
            waiting_on_stack_run_id: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };
        let child_root = StackRun {
            id: child_root_id,
            parent_task_run_id: frame_task,
            parent_stack_run_id: Some(stack_run_id),
            root_of_task_run_id: Some(child_task_id),
            service_name: TASKS_SERVICE.to_string(),
            method_name: EXECUTE_METHOD.to_string(),
            args: vec![Value::String(task_name.to_string()), input],
            status: StackRunStatus::Pending,
            result: None,
            error: None,
            vm_state: None,
            resume_payload: None,
            waiting_on_stack_run_id: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };

        w.task_runs.insert(child_task_id, child_task.clone());
        w.insert_stack_run(child_root.clone());
        Ok((child_task, child_root))
    }

    async fn complete(
        &self,
        stack_run_id: StackRunId,
        result: Value,
    ) -> Result<Option<StackRunId>, StoreError> {
        let now = now_ms();
        let mut w = self.inner.write().await;

        // Validate up front so the whole operation is all-or-nothing.
        let run = w
            .stack_runs
            .get(&stack_run_id)
            .ok_or(StoreError::StackRunNotFound(stack_run_id))?;
        if !run.status.can_transition_to(StackRunStatus::Completed) {
            return Err(StoreError::IllegalTransition {
                id: stack_run_id,
                from: run.status,
                to: StackRunStatus::Completed,
            });
        }
        if let Some(pid) = run.parent_stack_run_id {
            if !w.stack_runs.contains_key(&pid) {
                return Err(StoreError::OrphanedFrame {
                    child: stack_run_id,
                    parent: pid,
                });
            }
        }

        let run = w
            .stack_runs
            .get_mut(&stack_run_id)
            .ok_or(StoreError::StackRunNotFound(stack_run_id))?;
        run.status = StackRunStatus::Completed;
        run.result = Some(result.clone());
        run.resume_payload = None;
        run.waiting_on_stack_run_id = None;
        run.updated_at = now;
        run.ended_at = Some(now);

        let root_of = run.root_of_task_run_id;
        let parent_id = run.parent_stack_run_id;

        if let Some(task_id) = root_of {
            w.finish_task(
                task_id,
                TaskRunStatus::Completed,
                Some(result.clone()),
                None,
                now,
            )?;
        }

        // The child's result is already written; only now may the parent be
        // staged for resume.
        if let Some(pid) = parent_id {
            let parent = w.stack_runs.get_mut(&pid).ok_or(StoreError::OrphanedFrame {
                child: stack_run_id,
                parent: pid,
            })?;
            if parent.status == StackRunStatus::SuspendedWaitingChild
                && parent.waiting_on_stack_run_id == Some(stack_run_id)
            {
                parent.status = StackRunStatus::PendingResume;
                parent.resume_payload = Some(result);
                parent.waiting_on_stack_run_id = None;
                parent.updated_at = now;
                return Ok(Some(pid));
            }
            tracing::warn!(
                child = %stack_run_id,
                parent = %pid,
                status = ?parent.status,
                "completed child has no waiting parent; result not delivered"
            );
        }
        Ok(None)
    }

    async fn fail(
        &self,
        stack_run_id: StackRunId,
        error: &RunError,
    ) -> Result<TaskRunId, StoreError> {
        let now = now_ms();
        let mut w = self.inner.write().await;

        let run = w
            .stack_runs
            .get_mut(&stack_run_id)
            .ok_or(StoreError::StackRunNotFound(stack_run_id))?;
        if !run.status.can_transition_to(StackRunStatus::Failed) {
            return Err(StoreError::IllegalTransition {
                id: stack_run_id,
                from: run.status,
                to: StackRunStatus::Failed,
            });
        }

        let mut original = error.clone();
        if original.failed_stack_run_id.is_none() {
            original.failed_stack_run_id = Some(stack_run_id);
        }

        run.status = StackRunStatus::Failed;
        run.error = Some(original.clone());
        run.waiting_on_stack_run_id = None;
        run.updated_at = now;
        run.ended_at = Some(now);

        let enclosing = run.parent_task_run_id;
        let root_of = run.root_of_task_run_id;
        let mut cursor = run.parent_stack_run_id;

        if let Some(task_id) = root_of {
            w.finish_task(
                task_id,
                TaskRunStatus::Failed,
                None,
                Some(original.clone()),
                now,
            )?;
        }

        // Walk ancestors: still-suspended frames fail with a wrapped error,
        // task runs rooted along the way fail with the original. The walk
        // stops at the first ancestor that is not waiting — failures never
        // resurrect settled frames.
        let mut child_id = stack_run_id;
        let mut child_err = original.clone();
        while let Some(pid) = cursor {
            let Some(parent) = w.stack_runs.get_mut(&pid) else {
                // Structural corruption: fail the root task run with a
                // diagnostic naming the offending id.
                tracing::error!(child = %child_id, parent = %pid, "stack run names missing parent");
                w.finish_task(
                    enclosing,
                    TaskRunStatus::Failed,
                    None,
                    Some(RunError::internal(format!(
                        "stack run {child_id} names missing parent {pid}"
                    ))),
                    now,
                )?;
                break;
            };
            if parent.status != StackRunStatus::SuspendedWaitingChild {
                break;
            }
            let wrapped = RunError::propagated(child_id, child_err);
            parent.status = StackRunStatus::Failed;
            parent.error = Some(wrapped.clone());
            parent.waiting_on_stack_run_id = None;
            parent.updated_at = now;
            parent.ended_at = Some(now);

            let parent_root_of = parent.root_of_task_run_id;
            cursor = parent.parent_stack_run_id;
            child_id = pid;
            child_err = wrapped;

            if let Some(task_id) = parent_root_of {
                w.finish_task(
                    task_id,
                    TaskRunStatus::Failed,
                    None,
                    Some(original.clone()),
                    now,
                )?;
            }
        }

        Ok(enclosing)
    }

    // ── Reads ──

    async fn get_task_run(&self, id: TaskRunId) -> Result<Option<TaskRun>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.task_runs.get(&id).cloned())
    }

    async fn get_stack_run(&self, id: StackRunId) -> Result<Option<StackRun>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.stack_runs.get(&id).cloned())
    }

    // ── Audit trail ──

    async fn append_event(
        &self,
        task_run_id: TaskRunId,
        event: &RunEvent,
    ) -> Result<u64, StoreError> {
        let mut w = self.inner.write().await;
        let seq = w.event_seq.get(&task_run_id).copied().unwrap_or(0);
        w.events
            .entry(task_run_id)
            .or_default()
            .push((seq, event.clone()));
        w.event_seq.insert(task_run_id, seq + 1);
        Ok(seq)
    }

    async fn read_events(
        &self,
        task_run_id: TaskRunId,
        from_seq: u64,
    ) -> Result<Vec<(u64, RunEvent)>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.events
            .get(&task_run_id)
            .map(|evs| {
                evs.iter()
                    .filter(|(seq, _)| *seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
