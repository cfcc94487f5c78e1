use crate::types::*;
use mlua::{Lua, LuaOptions, LuaSerdeExt, StdLib};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How often the deadline hook samples the clock, in VM instructions.
const DEADLINE_CHECK_EVERY: u32 = 4096;

/// Result of driving one frame through the sandbox. Suspension is a value
/// returned to the dispatcher, never an error crossing this boundary.
#[derive(Debug)]
pub enum Outcome {
    Completed(Value),
    Suspended {
        child: ChildSpec,
        continuation: Continuation,
    },
    Failed(RunError),
}

/// Identifies the frame being executed, for the handler's logging sink.
#[derive(Clone, Copy, Debug)]
pub struct FrameContext {
    pub task_run_id: TaskRunId,
    pub stack_run_id: StackRunId,
}

/// Executes handler code in an isolated Lua VM.
///
/// The handler is the chunk itself: it receives the task input as its
/// vararg and its return value becomes the frame result. The only door to
/// the outside world is the `tools` namespace; every `tools.<service>.<method>(...)`
/// lands in the single intercept, which either replays a recorded result or
/// suspends the frame.
pub struct TaskRunner {
    deadline: Duration,
}

impl TaskRunner {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    /// Fresh start of a frame: empty call history.
    pub async fn execute(
        &self,
        task_code: String,
        task_name: String,
        input: Value,
        ctx: FrameContext,
    ) -> Outcome {
        let continuation = Continuation {
            task_code,
            task_name,
            task_input: input,
            call_history: Vec::new(),
            scratch: serde_json::Map::new(),
        };
        self.run(continuation, None, ctx).await
    }

    /// Re-enter a suspended frame. The handler re-runs from the top; prior
    /// calls replay from `continuation.call_history` and `delivered` fills
    /// the empty result slot of the call that suspended the frame.
    pub async fn resume(
        &self,
        continuation: Continuation,
        delivered: Value,
        ctx: FrameContext,
    ) -> Outcome {
        self.run(continuation, Some(delivered), ctx).await
    }

    async fn run(
        &self,
        continuation: Continuation,
        delivered: Option<Value>,
        ctx: FrameContext,
    ) -> Outcome {
        let budget = self.deadline;
        match tokio::task::spawn_blocking(move || run_frame(budget, continuation, delivered, ctx))
            .await
        {
            Ok(outcome) => outcome,
            Err(join) => Outcome::Failed(RunError::internal(format!(
                "runner thread panicked: {join}"
            ))),
        }
    }
}

// ─── Replay cursor ────────────────────────────────────────────

/// What the intercept does with one observed call.
enum Observed {
    /// Recorded (or just-delivered) result, returned synchronously.
    Replay(Value),
    /// The frame must stop: suspension armed, divergence, or internal.
    Interrupt,
}

/// The runner's position in the call history during (re-)execution.
///
/// Once `pending`, `divergence` or `internal` is set the frame is done for;
/// later intercept hits in the same doomed execution record nothing. That
/// makes the armed state authoritative over whatever the chunk returns, so
/// a `pcall` around a tools call cannot swallow a suspension.
struct ReplayState {
    history: Vec<CallRecord>,
    cursor: usize,
    delivered: Option<Value>,
    pending: Option<ChildSpec>,
    divergence: Option<(CallSite, CallSite)>,
    internal: Option<String>,
}

impl ReplayState {
    fn new(history: Vec<CallRecord>, delivered: Option<Value>) -> Self {
        Self {
            history,
            cursor: 0,
            delivered,
            pending: None,
            divergence: None,
            internal: None,
        }
    }

    fn observe(&mut self, service: &str, method: &str, args: Vec<Value>) -> Observed {
        if self.pending.is_some() || self.divergence.is_some() || self.internal.is_some() {
            return Observed::Interrupt;
        }

        if self.cursor < self.history.len() {
            let rec = &mut self.history[self.cursor];
            if rec.service != service || rec.method != method || rec.args != args {
                let expected = rec.site();
                self.divergence = Some((
                    expected,
                    CallSite {
                        service: service.to_string(),
                        method: method.to_string(),
                        args,
                    },
                ));
                return Observed::Interrupt;
            }
            return match rec.result.clone() {
                Some(v) => {
                    self.cursor += 1;
                    Observed::Replay(v)
                }
                // The empty result slot: this is the call whose child was
                // outstanding. The delivered value fills it exactly once.
                None => match self.delivered.take() {
                    Some(v) => {
                        rec.result = Some(v.clone());
                        self.cursor += 1;
                        Observed::Replay(v)
                    }
                    None => {
                        self.internal =
                            Some("pending call reached without a delivered result".to_string());
                        Observed::Interrupt
                    }
                },
            };
        }

        // Brand-new call: record it with an empty result slot and suspend.
        self.history.push(CallRecord {
            service: service.to_string(),
            method: method.to_string(),
            args: args.clone(),
            result: None,
        });
        self.pending = Some(ChildSpec {
            service: service.to_string(),
            method: method.to_string(),
            args,
        });
        Observed::Interrupt
    }
}

// ─── Frame execution (blocking) ───────────────────────────────

/// Error used to unwind the Lua stack when the frame must stop.
#[derive(Debug)]
struct FrameInterrupt;

impl std::fmt::Display for FrameInterrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame suspended awaiting an external call")
    }
}

impl std::error::Error for FrameInterrupt {}

#[derive(Debug)]
struct DeadlineExceeded;

impl std::fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame deadline exceeded")
    }
}

impl std::error::Error for DeadlineExceeded {}

fn run_frame(
    budget: Duration,
    mut continuation: Continuation,
    delivered: Option<Value>,
    ctx: FrameContext,
) -> Outcome {
    let lua = match Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::OS,
        LuaOptions::default(),
    ) {
        Ok(lua) => lua,
        Err(e) => return Outcome::Failed(RunError::internal(format!("sandbox init failed: {e}"))),
    };

    let state = Arc::new(Mutex::new(ReplayState::new(
        continuation.call_history.clone(),
        delivered,
    )));

    if let Err(e) = install_sandbox(&lua, &state, &continuation, ctx) {
        return Outcome::Failed(RunError::internal(format!("sandbox setup failed: {e}")));
    }

    let deadline_hit = Arc::new(AtomicBool::new(false));
    {
        let hit = deadline_hit.clone();
        let start = Instant::now();
        let _ = lua.set_hook(
            mlua::HookTriggers::new().every_nth_instruction(DEADLINE_CHECK_EVERY),
            move |_lua, _debug| {
                if start.elapsed() > budget {
                    hit.store(true, Ordering::Relaxed);
                    Err(mlua::Error::external(DeadlineExceeded))
                } else {
                    Ok(mlua::VmState::Continue)
                }
            },
        );
    }

    let chunk_result = run_chunk(&lua, &continuation);
    let scratch = read_checkpoint(&lua);

    let st = match state.lock() {
        Ok(st) => st,
        Err(poisoned) => poisoned.into_inner(),
    };

    if deadline_hit.load(Ordering::Relaxed) {
        return Outcome::Failed(RunError::timeout(format!(
            "frame exceeded its {}s execution budget",
            budget.as_secs()
        )));
    }
    if let Some((expected, observed)) = st.divergence.clone() {
        return Outcome::Failed(RunError::nondeterministic(expected, observed));
    }
    if let Some(msg) = st.internal.clone() {
        return Outcome::Failed(RunError::internal(msg));
    }
    if let Some(child) = st.pending.clone() {
        continuation.call_history = st.history.clone();
        if let Some(scratch) = scratch {
            continuation.scratch = scratch;
        }
        return Outcome::Suspended {
            child,
            continuation,
        };
    }

    match chunk_result {
        Ok(value) => Outcome::Completed(value),
        Err(e) => Outcome::Failed(RunError::handler(e.to_string(), None)),
    }
}

fn run_chunk(lua: &Lua, continuation: &Continuation) -> mlua::Result<Value> {
    let func = lua
        .load(&continuation.task_code)
        .set_name(&continuation.task_name)
        .into_function()?;
    let input = lua.to_value(&continuation.task_input)?;
    let returned: mlua::Value = func.call(input)?;
    lua.from_value(returned)
}

/// Lua source of the `tools` proxy. Nested member access accumulates a
/// dotted method path; invocation routes through the single intercept.
const TOOLS_PROXY: &str = r#"
local invoke = ...
local function proxy(service, path)
  return setmetatable({}, {
    __index = function(_, key)
      local sub = path and (path .. "." .. tostring(key)) or tostring(key)
      return proxy(service, sub)
    end,
    __call = function(_, ...)
      if not path then
        error("module '" .. service .. "' is not callable; call one of its methods", 2)
      end
      return invoke(service, path, { ... })
    end,
  })
end
return setmetatable({}, {
  __index = function(_, service)
    return proxy(tostring(service), nil)
  end,
})
"#;

fn install_sandbox(
    lua: &Lua,
    state: &Arc<Mutex<ReplayState>>,
    continuation: &Continuation,
    ctx: FrameContext,
) -> mlua::Result<()> {
    let globals = lua.globals();

    // The os library stays for date/time formatting, but everything that
    // touches processes or the filesystem goes. Wall-clock reads remain a
    // documented handler obligation: only intercepted values replay.
    let os_table: mlua::Table = globals.get("os")?;
    for denied in [
        "execute", "exit", "getenv", "remove", "rename", "setlocale", "tmpname",
    ] {
        os_table.set(denied, mlua::Value::Nil)?;
    }

    // json.encode / json.decode
    let json = lua.create_table()?;
    json.set(
        "encode",
        lua.create_function(|lua, v: mlua::Value| {
            let j: Value = lua.from_value(v)?;
            serde_json::to_string(&j).map_err(mlua::Error::external)
        })?,
    )?;
    json.set(
        "decode",
        lua.create_function(|lua, s: String| {
            let j: Value = serde_json::from_str(&s).map_err(mlua::Error::external)?;
            lua.to_value(&j)
        })?,
    )?;
    globals.set("json", json)?;

    // Structured logging sink bound to this frame.
    let log = lua.create_table()?;
    for level in ["debug", "info", "warn", "error"] {
        log.set(level, log_fn(lua, level, ctx)?)?;
    }
    globals.set("log", log.clone())?;
    // print goes to the same sink instead of stdout.
    globals.set("print", log_fn(lua, "info", ctx)?)?;

    // Checkpoint data, restored from the continuation and persisted with it.
    let checkpoint = lua.to_value(&Value::Object(continuation.scratch.clone()))?;
    globals.set("checkpoint", checkpoint)?;

    // The external-call intercept.
    let st = state.clone();
    let invoke = lua.create_function(
        move |lua, (service, method, args): (String, String, mlua::Table)| {
            let mut call_args = Vec::new();
            for v in args.sequence_values::<mlua::Value>() {
                call_args.push(lua.from_value::<Value>(v?)?);
            }
            let observed = {
                let mut st = match st.lock() {
                    Ok(st) => st,
                    Err(poisoned) => poisoned.into_inner(),
                };
                st.observe(&service, &method, call_args)
            };
            match observed {
                Observed::Replay(v) => lua.to_value(&v),
                Observed::Interrupt => Err(mlua::Error::external(FrameInterrupt)),
            }
        },
    )?;
    let tools: mlua::Table = lua.load(TOOLS_PROXY).set_name("tools").call(invoke)?;
    globals.set("tools", tools)?;

    Ok(())
}

fn log_fn(lua: &Lua, level: &'static str, ctx: FrameContext) -> mlua::Result<mlua::Function> {
    lua.create_function(move |_, msg: mlua::Variadic<mlua::Value>| {
        let text = msg
            .iter()
            .map(describe_lua_value)
            .collect::<Vec<_>>()
            .join(" ");
        let task_run_id = ctx.task_run_id;
        let stack_run_id = ctx.stack_run_id;
        match level {
            "debug" => {
                tracing::debug!(target: "taskrun::handler", %task_run_id, %stack_run_id, "{text}")
            }
            "warn" => {
                tracing::warn!(target: "taskrun::handler", %task_run_id, %stack_run_id, "{text}")
            }
            "error" => {
                tracing::error!(target: "taskrun::handler", %task_run_id, %stack_run_id, "{text}")
            }
            _ => tracing::info!(target: "taskrun::handler", %task_run_id, %stack_run_id, "{text}"),
        }
        Ok(())
    })
}

fn describe_lua_value(v: &mlua::Value) -> String {
    match v {
        mlua::Value::Nil => "nil".to_string(),
        mlua::Value::Boolean(b) => b.to_string(),
        mlua::Value::Integer(n) => n.to_string(),
        mlua::Value::Number(n) => n.to_string(),
        mlua::Value::String(s) => s.to_string_lossy().to_string(),
        other => format!("<{}>", other.type_name()),
    }
}

fn read_checkpoint(lua: &Lua) -> Option<serde_json::Map<String, Value>> {
    let v: mlua::Value = lua.globals().get("checkpoint").ok()?;
    match lua.from_value::<Value>(v).ok()? {
        Value::Object(m) => Some(m),
        _ => None,
    }
}
