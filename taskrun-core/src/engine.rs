use crate::config::EngineConfig;
use crate::dispatcher::{DispatchStatus, Dispatcher};
use crate::events::RunEvent;
use crate::gateway::ModuleGateway;
use crate::store::{RunStore, TaskRegistry};
use crate::types::*;
use anyhow::{bail, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Top-level facade wiring store, registry, gateway and dispatcher. Every
/// collaborator is injected at construction; there are no ambient
/// singletons. HTTP handlers delegate to this.
pub struct TaskEngine {
    store: Arc<dyn RunStore>,
    registry: Arc<dyn TaskRegistry>,
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
}

impl TaskEngine {
    pub fn new(
        store: Arc<dyn RunStore>,
        registry: Arc<dyn TaskRegistry>,
        gateway: Arc<dyn ModuleGateway>,
        config: EngineConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            registry.clone(),
            gateway,
            config.clone(),
        ));
        Self {
            store,
            registry,
            dispatcher,
            config,
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Register handler code under a task name.
    pub async fn register_task(&self, name: &str, code: &str) -> Result<()> {
        self.registry.register(name, code).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<String>> {
        self.registry.list().await
    }

    /// Submit a task: insert the task run and its root stack run, then
    /// enqueue a self-trigger. Completion is asynchronous — poll `task_run`.
    pub async fn submit(&self, task_name: &str, input: Value) -> Result<TaskRunId> {
        if self.registry.lookup(task_name).await?.is_none() {
            bail!("unknown task: {task_name}");
        }
        let task = self.store.create_task_run(task_name, input).await?;
        if let Err(err) = self
            .store
            .append_event(
                task.id,
                &RunEvent::TaskSubmitted {
                    task_run_id: task.id,
                    task_name: task_name.to_string(),
                },
            )
            .await
        {
            tracing::warn!(task_run_id = %task.id, error = %err, "failed to append submit event");
        }
        tracing::info!(task_run_id = %task.id, task_name, "task submitted");
        self.dispatcher.trigger(Some(task.root_stack_run_id));
        Ok(task.id)
    }

    pub async fn task_run(&self, id: TaskRunId) -> Result<Option<TaskRun>> {
        Ok(self.store.get_task_run(id).await?)
    }

    pub async fn stack_run(&self, id: StackRunId) -> Result<Option<StackRun>> {
        Ok(self.store.get_stack_run(id).await?)
    }

    pub async fn read_events(
        &self,
        task_run_id: TaskRunId,
        from_seq: u64,
    ) -> Result<Vec<(u64, RunEvent)>> {
        Ok(self.store.read_events(task_run_id, from_seq).await?)
    }

    /// Drive dispatch steps until the queue is drained. Deterministic
    /// alternative to worker tasks, used by tests and embedders.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut steps = 0;
        loop {
            match self.dispatcher.step(None).await? {
                DispatchStatus::Idle => break,
                _ => steps += 1,
            }
        }
        Ok(steps)
    }

    /// Spawn the configured number of dispatcher workers.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        (0..self.config.dispatcher_concurrency.max(1))
            .map(|index| tokio::spawn(self.dispatcher.clone().run_worker(index)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::StaticGateway;
    use crate::store::MemoryTaskRegistry;
    use crate::store_memory::MemoryRunStore;
    use serde_json::json;

    fn engine_with(gateway: StaticGateway) -> TaskEngine {
        TaskEngine::new(
            Arc::new(MemoryRunStore::new()),
            Arc::new(MemoryTaskRegistry::new()),
            Arc::new(gateway),
            EngineConfig::default(),
        )
    }

    async fn finished(engine: &TaskEngine, id: TaskRunId) -> TaskRun {
        let task = engine.task_run(id).await.unwrap().unwrap();
        assert!(
            task.status.is_terminal(),
            "task run not terminal: {:?}",
            task.status
        );
        task
    }

    /// Child stack run ids recorded in the audit trail — reaches child rows
    /// without poking store internals.
    async fn suspension_children(engine: &TaskEngine, id: TaskRunId) -> Vec<StackRunId> {
        engine
            .read_events(id, 0)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|(_, ev)| match ev {
                RunEvent::FrameSuspended {
                    child_stack_run_id, ..
                } => Some(child_stack_run_id),
                _ => None,
            })
            .collect()
    }

    // ── Scenario 1: echo ──

    #[tokio::test]
    async fn echo_completes_in_one_step() {
        let engine = engine_with(StaticGateway::new());
        engine
            .register_task("echo", "local input = ...\nreturn input")
            .await
            .unwrap();

        let id = engine.submit("echo", json!({"msg": "hi"})).await.unwrap();
        let steps = engine.run_until_idle().await.unwrap();
        assert_eq!(steps, 1, "no suspensions: one dispatch step");

        let task = finished(&engine, id).await;
        assert_eq!(task.status, TaskRunStatus::Completed);
        assert_eq!(task.result, Some(json!({"msg": "hi"})));
        assert!(task.ended_at.is_some());

        let root = engine
            .stack_run(task.root_stack_run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(root.status, StackRunStatus::Completed);
        assert!(suspension_children(&engine, id).await.is_empty());
    }

    // ── Scenario 2: single external call ──

    #[tokio::test]
    async fn single_external_call_round_trip() {
        let engine = engine_with(StaticGateway::new().with_result("keystore", "get", json!("v")));
        let code = r#"
            local input = ...
            local v = tools.keystore.get("X")
            return { wrapped = v }
        "#;
        engine.register_task("wrap", code).await.unwrap();

        let id = engine.submit("wrap", json!({})).await.unwrap();
        engine.run_until_idle().await.unwrap();

        let task = finished(&engine, id).await;
        assert_eq!(task.status, TaskRunStatus::Completed);
        assert_eq!(task.result, Some(json!({"wrapped": "v"})));

        let root = engine
            .stack_run(task.root_stack_run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(root.status, StackRunStatus::Completed);

        let children = suspension_children(&engine, id).await;
        assert_eq!(children.len(), 1);
        let child = engine.stack_run(children[0]).await.unwrap().unwrap();
        assert_eq!(child.status, StackRunStatus::Completed);
        assert_eq!(child.result, Some(json!("v")));
        assert_eq!(child.service_name, "keystore");
        assert_eq!(child.parent_stack_run_id, Some(root.id));
    }

    // ── Scenario 3: sequential two-call ──

    #[tokio::test]
    async fn sequential_calls_replay_in_program_order() {
        let engine = engine_with(
            StaticGateway::new()
                .with_result("a", "m1", json!(1))
                .with_result("a", "m2", json!(2)),
        );
        let code = r#"
            local input = ...
            local a = tools.a.m1()
            local b = tools.a.m2(a)
            return { first = a, second = b }
        "#;
        engine.register_task("seq", code).await.unwrap();

        let id = engine.submit("seq", json!({})).await.unwrap();
        engine.run_until_idle().await.unwrap();

        let task = finished(&engine, id).await;
        assert_eq!(
            task.status,
            TaskRunStatus::Completed,
            "no nondeterministic-replay failure: {:?}",
            task.error
        );
        assert_eq!(task.result, Some(json!({"first": 1, "second": 2})));

        // Two children, created in program order.
        let children = suspension_children(&engine, id).await;
        assert_eq!(children.len(), 2);
        let c1 = engine.stack_run(children[0]).await.unwrap().unwrap();
        let c2 = engine.stack_run(children[1]).await.unwrap().unwrap();
        assert_eq!(
            (c1.method_name.as_str(), c2.method_name.as_str()),
            ("m1", "m2")
        );
        assert!(c1.created_at <= c2.created_at);

        // The continuation stored at the second suspension replays m1 from
        // history; its pending slot was m2.
        let root = engine
            .stack_run(task.root_stack_run_id)
            .await
            .unwrap()
            .unwrap();
        let history = root.vm_state.unwrap().call_history;
        assert_eq!(history[0].service, "a");
        assert_eq!(history[0].method, "m1");
        assert_eq!(history[0].result, Some(json!(1)));
        assert_eq!(history[1].method, "m2");
        assert_eq!(history[1].args, vec![json!(1)]);
    }

    // ── Scenario 4: nested task ──

    #[tokio::test]
    async fn nested_task_run_completes_parent() {
        let engine = engine_with(StaticGateway::new());
        engine
            .register_task(
                "parent",
                r#"
                local input = ...
                return tools.tasks.execute("child", { n = input.n })
                "#,
            )
            .await
            .unwrap();
        engine
            .register_task(
                "child",
                r#"
                local input = ...
                return { doubled = input.n * 2 }
                "#,
            )
            .await
            .unwrap();

        let id = engine.submit("parent", json!({"n": 3})).await.unwrap();
        engine.run_until_idle().await.unwrap();

        let task = finished(&engine, id).await;
        assert_eq!(task.status, TaskRunStatus::Completed);
        assert_eq!(task.result, Some(json!({"doubled": 6})));

        // A genuine child task run was created and completed.
        let spawned: Vec<TaskRunId> = engine
            .read_events(id, 0)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|(_, ev)| match ev {
                RunEvent::ChildTaskSpawned {
                    child_task_run_id, ..
                } => Some(child_task_run_id),
                _ => None,
            })
            .collect();
        assert_eq!(spawned.len(), 1);
        let child_task = engine.task_run(spawned[0]).await.unwrap().unwrap();
        assert_eq!(child_task.task_name, "child");
        assert_eq!(child_task.status, TaskRunStatus::Completed);
        assert_eq!(child_task.result, Some(json!({"doubled": 6})));

        // Single ownership: the child task's root frame still belongs to
        // the submission's tree.
        let child_root = engine
            .stack_run(child_task.root_stack_run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(child_root.parent_task_run_id, id);
        assert_eq!(child_root.root_of_task_run_id, Some(child_task.id));
    }

    // ── Scenario 5: handler failure after a successful call ──

    #[tokio::test]
    async fn handler_failure_preserves_completed_child() {
        let engine = engine_with(StaticGateway::new().with_result("keystore", "get", json!("v")));
        let code = r#"
            local input = ...
            local v = tools.keystore.get("X")
            error("boom after call")
        "#;
        engine.register_task("fails", code).await.unwrap();

        let id = engine.submit("fails", json!({})).await.unwrap();
        engine.run_until_idle().await.unwrap();

        let task = finished(&engine, id).await;
        assert_eq!(task.status, TaskRunStatus::Failed);
        let error = task.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Handler);
        assert!(
            error.message.contains("boom after call"),
            "message: {}",
            error.message
        );
        assert_eq!(error.failed_stack_run_id, Some(task.root_stack_run_id));

        // The successfully completed child keeps its record intact.
        let children = suspension_children(&engine, id).await;
        assert_eq!(children.len(), 1);
        let child = engine.stack_run(children[0]).await.unwrap().unwrap();
        assert_eq!(child.status, StackRunStatus::Completed);
        assert_eq!(child.result, Some(json!("v")));
    }

    // ── Scenario 6: module failure surfaced as a value ──

    #[tokio::test]
    async fn module_error_handled_by_handler() {
        let engine = engine_with(StaticGateway::new().with_error("mail", "send", "smtp down"));
        let code = r#"
            local input = ...
            local res = tools.mail.send({ to = "x" })
            if res.error then return { ok = false } end
            return { ok = true }
        "#;
        engine.register_task("mailer", code).await.unwrap();

        let id = engine.submit("mailer", json!({})).await.unwrap();
        engine.run_until_idle().await.unwrap();

        let task = finished(&engine, id).await;
        assert_eq!(task.status, TaskRunStatus::Completed);
        assert_eq!(task.result, Some(json!({"ok": false})));

        // The child is completed — the module error was a value, not a
        // failure.
        let children = suspension_children(&engine, id).await;
        let child = engine.stack_run(children[0]).await.unwrap().unwrap();
        assert_eq!(child.status, StackRunStatus::Completed);
        assert_eq!(
            child.result,
            Some(json!({"error": {"message": "smtp down"}}))
        );
    }

    // ── Submission guards and worker-driven execution ──

    #[tokio::test]
    async fn submit_rejects_unknown_task() {
        let engine = engine_with(StaticGateway::new());
        assert!(engine.submit("nope", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let engine = engine_with(StaticGateway::new().with_result("keystore", "get", json!("v")));
        engine
            .register_task(
                "wrap",
                r#"
                local input = ...
                local v = tools.keystore.get("X")
                return { wrapped = v }
                "#,
            )
            .await
            .unwrap();

        let workers = engine.spawn_workers();
        let id = engine.submit("wrap", json!({})).await.unwrap();

        let mut task = None;
        for _ in 0..200 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let current = engine.task_run(id).await.unwrap().unwrap();
            if current.status.is_terminal() {
                task = Some(current);
                break;
            }
        }
        for worker in workers {
            worker.abort();
        }

        let task = task.expect("task run did not finish under workers");
        assert_eq!(task.status, TaskRunStatus::Completed);
        assert_eq!(task.result, Some(json!({"wrapped": "v"})));
    }

    #[tokio::test]
    async fn events_tell_the_story_of_a_run() {
        let engine = engine_with(StaticGateway::new().with_result("keystore", "get", json!("v")));
        engine
            .register_task(
                "wrap",
                r#"
                local input = ...
                local v = tools.keystore.get("X")
                return { wrapped = v }
                "#,
            )
            .await
            .unwrap();

        let id = engine.submit("wrap", json!({})).await.unwrap();
        engine.run_until_idle().await.unwrap();

        let events: Vec<RunEvent> = engine
            .read_events(id, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, ev)| ev)
            .collect();

        assert!(matches!(events[0], RunEvent::TaskSubmitted { .. }));
        assert!(events
            .iter()
            .any(|ev| matches!(ev, RunEvent::FrameSuspended { .. })));
        assert!(events
            .iter()
            .any(|ev| matches!(ev, RunEvent::TaskRunCompleted { .. })));
    }
}
