use crate::config::EngineConfig;
use crate::events::RunEvent;
use crate::gateway::ModuleGateway;
use crate::runner::{FrameContext, Outcome, TaskRunner};
use crate::store::{RunStore, TaskRegistry};
use crate::types::*;
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// Result of one dispatch step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchStatus {
    /// No claimable stack run was found.
    Idle,
    Completed(StackRunId),
    Suspended(StackRunId),
    Failed(StackRunId),
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Idle => "idle",
            DispatchStatus::Completed(_) => "completed",
            DispatchStatus::Suspended(_) => "suspended",
            DispatchStatus::Failed(_) => "failed",
        }
    }
}

/// A self-trigger: advisory request for another dispatch step, either on a
/// named id (fast path) or in scan mode. Lost triggers are harmless — the
/// periodic scan drains whatever is ready, and `claim_*` is the gate.
type Trigger = Option<StackRunId>;

/// Drains the ready queue: claim a stack run, drive it through the runner
/// or the gateway, write the outcome back, self-trigger.
///
/// Any number of dispatchers may run in parallel; safety rests entirely on
/// the store's atomic claim.
pub struct Dispatcher {
    store: Arc<dyn RunStore>,
    registry: Arc<dyn TaskRegistry>,
    gateway: Arc<dyn ModuleGateway>,
    runner: TaskRunner,
    config: EngineConfig,
    tx: mpsc::UnboundedSender<Trigger>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Trigger>>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RunStore>,
        registry: Arc<dyn TaskRegistry>,
        gateway: Arc<dyn ModuleGateway>,
        config: EngineConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store,
            registry,
            gateway,
            runner: TaskRunner::new(config.runner_deadline),
            config,
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Fire-and-forget request for another dispatch step.
    pub fn trigger(&self, id: Trigger) {
        let _ = self.tx.send(id);
    }

    /// One dispatch step: claim (named id fast path, else scan), drive,
    /// react, self-trigger. At most one stack run changes state.
    pub async fn step(&self, hint: Option<StackRunId>) -> Result<DispatchStatus> {
        let claimed = match hint {
            Some(id) => match self.store.claim_specific(id).await? {
                Some(run) => Some(run),
                None => self.store.claim_next_ready().await?,
            },
            None => self.store.claim_next_ready().await?,
        };
        let Some(run) = claimed else {
            return Ok(DispatchStatus::Idle);
        };

        tracing::debug!(
            stack_run_id = %run.id,
            service = %run.service_name,
            method = %run.method_name,
            "claimed stack run"
        );
        self.append(
            run.parent_task_run_id,
            RunEvent::StackRunClaimed {
                stack_run_id: run.id,
                service: run.service_name.clone(),
                method: run.method_name.clone(),
            },
        )
        .await;

        let status = match self.drive(&run).await {
            Ok(status) => status,
            Err(err) => {
                // Store invariant violations and other internal errors fail
                // the frame and propagate like any other failure.
                tracing::error!(stack_run_id = %run.id, error = %err, "dispatch step failed");
                let run_err = RunError::internal(format!("dispatch failed: {err}"));
                match self.store.fail(run.id, &run_err).await {
                    Ok(_) => {
                        self.append(
                            run.parent_task_run_id,
                            RunEvent::StackRunFailed {
                                stack_run_id: run.id,
                                kind: ErrorKind::Internal,
                                message: run_err.message.clone(),
                            },
                        )
                        .await;
                    }
                    Err(fail_err) => {
                        tracing::error!(
                            stack_run_id = %run.id,
                            error = %fail_err,
                            "could not record frame failure"
                        );
                    }
                }
                DispatchStatus::Failed(run.id)
            }
        };

        // Keep draining: other rows may be ready even if this one is done.
        self.trigger(None);
        Ok(status)
    }

    /// Route the claimed frame: handler frames run in the sandbox,
    /// `tasks/execute` frames spawn (or forward) a child task run, anything
    /// else goes to the module gateway.
    async fn drive(&self, run: &StackRun) -> Result<DispatchStatus> {
        if run.is_handler_frame() {
            let outcome = self.run_handler_frame(run).await?;
            return self.react(run, outcome).await;
        }

        if run.is_task_call_frame() {
            if let Some(payload) = run.resume_payload.clone() {
                // The child task run finished; this frame only forwards its
                // result to the suspended handler above it.
                return self.finish(run, payload).await;
            }
            let (task_name, input) = parse_task_args(&run.args)?;
            let (child_task, child_root) = self
                .store
                .spawn_child_task(run.id, &task_name, input)
                .await?;
            self.append(
                run.parent_task_run_id,
                RunEvent::ChildTaskSpawned {
                    stack_run_id: run.id,
                    child_task_run_id: child_task.id,
                    task_name,
                },
            )
            .await;
            self.trigger(Some(child_root.id));
            return Ok(DispatchStatus::Suspended(run.id));
        }

        self.run_module_frame(run).await
    }

    async fn run_handler_frame(&self, run: &StackRun) -> Result<Outcome> {
        let ctx = FrameContext {
            task_run_id: run.root_of_task_run_id.unwrap_or(run.parent_task_run_id),
            stack_run_id: run.id,
        };
        match (&run.vm_state, &run.resume_payload) {
            (Some(continuation), Some(payload)) => Ok(self
                .runner
                .resume(continuation.clone(), payload.clone(), ctx)
                .await),
            (None, None) => {
                let (task_name, input) = parse_task_args(&run.args)?;
                let Some(code) = self.registry.lookup(&task_name).await? else {
                    return Ok(Outcome::Failed(RunError::internal(format!(
                        "task not registered: {task_name}"
                    ))));
                };
                Ok(self.runner.execute(code, task_name, input, ctx).await)
            }
            _ => Ok(Outcome::Failed(RunError::internal(
                "inconsistent frame: continuation and resume payload must arrive together",
            ))),
        }
    }

    async fn run_module_frame(&self, run: &StackRun) -> Result<DispatchStatus> {
        let call = tokio::time::timeout(
            self.config.runner_deadline,
            self.gateway
                .call(&run.service_name, &run.method_name, &run.args),
        )
        .await;

        match call {
            Ok(Ok(value)) => self.finish(run, value).await,
            Ok(Err(err)) => {
                let error = RunError::module(err.to_string());
                self.fail_frame(run, error).await
            }
            Err(_elapsed) => {
                let error = RunError::timeout(format!(
                    "module call exceeded its {}s budget",
                    self.config.runner_deadline.as_secs()
                ));
                self.fail_frame(run, error).await
            }
        }
    }

    async fn react(&self, run: &StackRun, outcome: Outcome) -> Result<DispatchStatus> {
        match outcome {
            Outcome::Completed(value) => self.finish(run, value).await,
            Outcome::Suspended {
                child,
                continuation,
            } => {
                let child_run = self.store.suspend(run.id, &continuation, &child).await?;
                self.append(
                    run.parent_task_run_id,
                    RunEvent::FrameSuspended {
                        stack_run_id: run.id,
                        child_stack_run_id: child_run.id,
                        service: child_run.service_name.clone(),
                        method: child_run.method_name.clone(),
                    },
                )
                .await;
                self.trigger(Some(child_run.id));
                Ok(DispatchStatus::Suspended(run.id))
            }
            Outcome::Failed(error) => self.fail_frame(run, error).await,
        }
    }

    async fn finish(&self, run: &StackRun, result: Value) -> Result<DispatchStatus> {
        let resumed_parent = self.store.complete(run.id, result).await?;
        self.append(
            run.parent_task_run_id,
            RunEvent::StackRunCompleted {
                stack_run_id: run.id,
                resumed_parent,
            },
        )
        .await;
        if let Some(task_run_id) = run.root_of_task_run_id {
            self.append(
                run.parent_task_run_id,
                RunEvent::TaskRunCompleted { task_run_id },
            )
            .await;
        }
        if let Some(parent) = resumed_parent {
            self.trigger(Some(parent));
        }
        Ok(DispatchStatus::Completed(run.id))
    }

    async fn fail_frame(&self, run: &StackRun, error: RunError) -> Result<DispatchStatus> {
        self.store.fail(run.id, &error).await?;
        self.append(
            run.parent_task_run_id,
            RunEvent::StackRunFailed {
                stack_run_id: run.id,
                kind: error.kind,
                message: error.message.clone(),
            },
        )
        .await;
        if let Some(task_run_id) = run.root_of_task_run_id {
            self.append(
                run.parent_task_run_id,
                RunEvent::TaskRunFailed { task_run_id },
            )
            .await;
        }
        Ok(DispatchStatus::Failed(run.id))
    }

    /// Audit writes are best-effort; losing one never affects execution.
    async fn append(&self, task_run_id: TaskRunId, event: RunEvent) {
        if let Err(err) = self.store.append_event(task_run_id, &event).await {
            tracing::warn!(%task_run_id, error = %err, "failed to append run event");
        }
    }

    /// Worker loop: consume self-triggers, falling back to a periodic scan
    /// so lost triggers cannot stall the queue.
    pub async fn run_worker(self: Arc<Self>, index: usize) {
        tracing::info!(worker = index, "dispatcher worker started");
        loop {
            let received = {
                let mut rx = self.rx.lock().await;
                tokio::time::timeout(self.config.scan_interval, rx.recv()).await
            };
            let mut hint = match received {
                Ok(Some(hint)) => hint,
                Ok(None) => break,
                Err(_) => None,
            };
            for _ in 0..self.config.claim_batch_limit.max(1) {
                match self.step(hint.take()).await {
                    Ok(DispatchStatus::Idle) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(worker = index, error = %err, "dispatch step error");
                        break;
                    }
                }
            }
        }
        tracing::info!(worker = index, "dispatcher worker stopped");
    }
}

fn parse_task_args(args: &[Value]) -> Result<(String, Value)> {
    let name = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("tasks/execute args must start with a task name"))?;
    let input = args.get(1).cloned().unwrap_or_else(|| json!({}));
    Ok((name.to_string(), input))
}
