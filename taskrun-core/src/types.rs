use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Identifier of a task run (one per external submission).
pub type TaskRunId = Uuid;

/// Identifier of a stack run (one per call frame).
pub type StackRunId = Uuid;

/// The service name reserved for task execution frames.
pub const TASKS_SERVICE: &str = "tasks";

/// The method name used by task execution frames.
pub const EXECUTE_METHOD: &str = "execute";

// ─── Statuses ─────────────────────────────────────────────────

/// Lifecycle of a task run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Queued,
    Processing,
    Suspended,
    Completed,
    Failed,
}

impl TaskRunStatus {
    /// Terminal statuses are write-once; `ended_at` is set iff terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskRunStatus::Completed | TaskRunStatus::Failed)
    }
}

/// Lifecycle of a stack run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackRunStatus {
    Pending,
    Processing,
    SuspendedWaitingChild,
    PendingResume,
    Completed,
    Failed,
}

impl StackRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StackRunStatus::Completed | StackRunStatus::Failed)
    }

    /// The only statuses a dispatcher may claim.
    pub fn is_claimable(&self) -> bool {
        matches!(self, StackRunStatus::Pending | StackRunStatus::PendingResume)
    }

    /// The status transition table. The store rejects any transition for
    /// which this returns false.
    pub fn can_transition_to(self, next: StackRunStatus) -> bool {
        use StackRunStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Processing, SuspendedWaitingChild)
                | (Processing, Completed)
                | (Processing, Failed)
                | (SuspendedWaitingChild, PendingResume)
                | (SuspendedWaitingChild, Failed)
                | (PendingResume, Processing)
        )
    }
}

// ─── Errors carried on rows ───────────────────────────────────

/// Classification of a failure, as stored and surfaced to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Handler code raised between calls.
    Handler,
    /// The module gateway could not obtain a response.
    Module,
    /// The per-frame execution budget expired.
    Timeout,
    /// Replay diverged from the recorded call history.
    NondeterministicReplay,
    /// Store invariant violation or structural corruption.
    Internal,
}

/// One `(service, method, args)` triple, used in nondeterminism diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallSite {
    pub service: String,
    pub method: String,
    pub args: Vec<Value>,
}

/// Structured error persisted on failed stack runs and task runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stack_run_id: Option<StackRunId>,
    /// Set on ancestors failed by propagation: the direct child that failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_failed: Option<StackRunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<RunError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<CallSite>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<CallSite>,
}

impl RunError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
            failed_stack_run_id: None,
            child_failed: None,
            cause: None,
            expected: None,
            observed: None,
        }
    }

    pub fn handler(message: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            stack,
            ..Self::new(ErrorKind::Handler, message)
        }
    }

    pub fn module(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Module, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn nondeterministic(expected: CallSite, observed: CallSite) -> Self {
        Self {
            expected: Some(expected),
            observed: Some(observed),
            ..Self::new(
                ErrorKind::NondeterministicReplay,
                "replayed call does not match the recorded call history",
            )
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Wrap `cause` for an ancestor failed by propagation from `child`.
    pub fn propagated(child: StackRunId, cause: RunError) -> Self {
        Self {
            kind: cause.kind,
            message: format!("child stack run {child} failed"),
            stack: None,
            failed_stack_run_id: cause.failed_stack_run_id,
            child_failed: Some(child),
            cause: Some(Box::new(cause)),
            expected: None,
            observed: None,
        }
    }
}

// ─── Continuation ─────────────────────────────────────────────

/// One recorded external call. `result` is empty only for the trailing
/// entry of a suspended frame (the call whose child is outstanding).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub service: String,
    pub method: String,
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl CallRecord {
    pub fn site(&self) -> CallSite {
        CallSite {
            service: self.service.clone(),
            method: self.method.clone(),
            args: self.args.clone(),
        }
    }
}

/// The information a runner needs to resume a suspended frame. A plain
/// record, not an interpreter snapshot: resume re-runs the handler from the
/// top and replays `call_history` positionally.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Continuation {
    pub task_code: String,
    pub task_name: String,
    pub task_input: Value,
    #[serde(default)]
    pub call_history: Vec<CallRecord>,
    /// Checkpoint data the handler chose to persist via the `checkpoint`
    /// table. Restored verbatim on resume.
    #[serde(default)]
    pub scratch: serde_json::Map<String, Value>,
}

/// The child frame a suspension asks the dispatcher to create.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub service: String,
    pub method: String,
    pub args: Vec<Value>,
}

// ─── Rows ─────────────────────────────────────────────────────

/// One user submission end-to-end.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub task_name: String,
    pub input: Value,
    pub status: TaskRunStatus,
    pub result: Option<Value>,
    pub error: Option<RunError>,
    pub root_stack_run_id: StackRunId,
    pub waiting_on_stack_run_id: Option<StackRunId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub ended_at: Option<Timestamp>,
}

/// One call frame in the dynamic tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StackRun {
    pub id: StackRunId,
    /// The root task run owning the whole tree. Always set.
    pub parent_task_run_id: TaskRunId,
    /// Null only for submission roots.
    pub parent_stack_run_id: Option<StackRunId>,
    /// Set iff this frame is the root frame of that task run (submission
    /// roots and nested child-task roots). Such frames run handler code.
    pub root_of_task_run_id: Option<TaskRunId>,
    pub service_name: String,
    pub method_name: String,
    pub args: Vec<Value>,
    pub status: StackRunStatus,
    pub result: Option<Value>,
    pub error: Option<RunError>,
    /// The continuation, written only when the frame suspends.
    pub vm_state: Option<Continuation>,
    /// Child result staged for delivery, written when the child completes.
    pub resume_payload: Option<Value>,
    pub waiting_on_stack_run_id: Option<StackRunId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub ended_at: Option<Timestamp>,
}

impl StackRun {
    /// Handler frames execute task code in the sandbox; every handler frame
    /// is the root frame of exactly one task run.
    pub fn is_handler_frame(&self) -> bool {
        self.root_of_task_run_id.is_some()
    }

    /// True for the `tasks/execute` frames created when a handler invokes a
    /// nested task. These never run code; the dispatcher turns them into a
    /// child task run.
    pub fn is_task_call_frame(&self) -> bool {
        self.root_of_task_run_id.is_none()
            && self.service_name == TASKS_SERVICE
            && self.method_name == EXECUTE_METHOD
    }
}

pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_design() {
        use StackRunStatus::*;
        let all = [
            Pending,
            Processing,
            SuspendedWaitingChild,
            PendingResume,
            Completed,
            Failed,
        ];

        let allowed = [
            (Pending, Processing),
            (Pending, Completed),
            (Pending, Failed),
            (Processing, SuspendedWaitingChild),
            (Processing, Completed),
            (Processing, Failed),
            (SuspendedWaitingChild, PendingResume),
            (SuspendedWaitingChild, Failed),
            (PendingResume, Processing),
        ];

        for from in all {
            for to in all {
                let expect = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expect,
                    "transition {from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(StackRunStatus::Completed.is_terminal());
        assert!(StackRunStatus::Failed.is_terminal());
        assert!(!StackRunStatus::SuspendedWaitingChild.is_terminal());
        assert!(TaskRunStatus::Failed.is_terminal());
        assert!(!TaskRunStatus::Suspended.is_terminal());
    }

    #[test]
    fn claimable_statuses() {
        assert!(StackRunStatus::Pending.is_claimable());
        assert!(StackRunStatus::PendingResume.is_claimable());
        assert!(!StackRunStatus::Processing.is_claimable());
        assert!(!StackRunStatus::SuspendedWaitingChild.is_claimable());
    }

    #[test]
    fn run_error_serde_shape() {
        let err = RunError::nondeterministic(
            CallSite {
                service: "keystore".into(),
                method: "get".into(),
                args: vec![serde_json::json!("X")],
            },
            CallSite {
                service: "keystore".into(),
                method: "put".into(),
                args: vec![serde_json::json!("X")],
            },
        );
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "nondeterministic_replay");
        assert_eq!(json["expected"]["method"], "get");
        assert_eq!(json["observed"]["method"], "put");
        // Unset optional fields are omitted entirely.
        assert!(json.get("cause").is_none());
        assert!(json.get("stack").is_none());

        let back: RunError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn propagated_error_keeps_original_as_cause() {
        let child = Uuid::now_v7();
        let original = RunError::handler("boom", None);
        let wrapped = RunError::propagated(child, original.clone());
        assert_eq!(wrapped.kind, ErrorKind::Handler);
        assert_eq!(wrapped.child_failed, Some(child));
        assert_eq!(*wrapped.cause.unwrap(), original);
    }

    #[test]
    fn continuation_round_trips() {
        let cont = Continuation {
            task_code: "return 1".into(),
            task_name: "t".into(),
            task_input: serde_json::json!({"n": 3}),
            call_history: vec![CallRecord {
                service: "a".into(),
                method: "m1".into(),
                args: vec![],
                result: Some(serde_json::json!(1)),
            }],
            scratch: serde_json::Map::new(),
        };
        let json = serde_json::to_value(&cont).unwrap();
        let back: Continuation = serde_json::from_value(json).unwrap();
        assert_eq!(back, cont);
    }
}
