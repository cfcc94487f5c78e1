use crate::types::*;
use serde::{Deserialize, Serialize};

/// Audit events — the append-only trail for every task run. Diagnostics
/// only; nothing in the engine reads these back to make decisions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RunEvent {
    TaskSubmitted {
        task_run_id: TaskRunId,
        task_name: String,
    },
    StackRunClaimed {
        stack_run_id: StackRunId,
        service: String,
        method: String,
    },
    FrameSuspended {
        stack_run_id: StackRunId,
        child_stack_run_id: StackRunId,
        service: String,
        method: String,
    },
    ChildTaskSpawned {
        stack_run_id: StackRunId,
        child_task_run_id: TaskRunId,
        task_name: String,
    },
    StackRunCompleted {
        stack_run_id: StackRunId,
        /// Parent staged for resume, if any.
        resumed_parent: Option<StackRunId>,
    },
    StackRunFailed {
        stack_run_id: StackRunId,
        kind: ErrorKind,
        message: String,
    },
    TaskRunCompleted {
        task_run_id: TaskRunId,
    },
    TaskRunFailed {
        task_run_id: TaskRunId,
    },
}
