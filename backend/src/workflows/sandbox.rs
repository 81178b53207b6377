//! Sandboxed execution of user scripts
//!
//! Every run gets a fresh QuickJS runtime on the blocking pool. The script is
//! the body of `function (context, db)`: `context` is a deep-frozen copy of the
//! run context and `db` exposes `create`, `update` and `delete` bound to the
//! invoking user. Nothing else from the host is reachable: the interpreter has
//! no module loader, filesystem, network, timers or process object.

use flowcore_shared::User;
use rquickjs::{CatchResultExt, Context, Function, Runtime};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::{WorkflowError, WorkflowResult};
use crate::services::DataLayer;

/// Extra time the async side waits for the interpreter to honour its own
/// interrupt before giving up on it.
const OUTER_GRACE: Duration = Duration::from_millis(500);

const STACK_LIMIT: usize = 512 * 1024;

const PRELUDE: &str = r#"
(() => {
    "use strict";
    const call = globalThis.__dbCall;
    const raw = globalThis.__contextJson;
    const source = globalThis.__script;
    delete globalThis.__dbCall;
    delete globalThis.__contextJson;
    delete globalThis.__script;

    const invoke = (op, model, args) => {
        const reply = JSON.parse(call(op, String(model), JSON.stringify(args)));
        if (reply.error !== undefined) {
            throw new Error(reply.error);
        }
        return reply.value;
    };
    const db = Object.freeze({
        create: (model, data) => invoke("create", model, [data]),
        update: (model, selector, patch) => invoke("update", model, [selector, patch]),
        delete: (model, selector) => invoke("delete", model, [selector]),
    });
    const freeze = (value) => {
        if (value !== null && typeof value === "object") {
            Object.values(value).forEach(freeze);
            Object.freeze(value);
        }
        return value;
    };

    const body = new Function("context", "db", "\"use strict\";\n" + source);
    const result = body(freeze(JSON.parse(raw)), db);
    const out = result === undefined ? undefined : JSON.stringify(result);
    return out === undefined ? "null" : out;
})()
"#;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("script timed out after {0}ms")]
    Timeout(u64),
    #[error("script exceeded its memory limit")]
    MemoryLimit,
    #[error("script threw: {0}")]
    Exception(String),
    #[error("script returned an unusable value: {0}")]
    Output(String),
    #[error("script runtime failure: {0}")]
    Runtime(String),
}

fn runtime_err(e: rquickjs::Error) -> ScriptError {
    ScriptError::Runtime(e.to_string())
}

fn classify(message: String) -> ScriptError {
    if message.contains("out of memory") {
        ScriptError::MemoryLimit
    } else {
        ScriptError::Exception(message)
    }
}

/// Host side of the `db` object.
struct DbBridge {
    data: Arc<dyn DataLayer>,
    user: Option<User>,
    handle: Handle,
}

impl DbBridge {
    fn call(&self, op: &str, model: &str, args: &str) -> String {
        let reply = match self.dispatch(op, model, args) {
            Ok(value) => json!({ "value": value }),
            Err(e) => json!({ "error": e.to_string() }),
        };
        reply.to_string()
    }

    fn dispatch(&self, op: &str, model: &str, args: &str) -> WorkflowResult<Value> {
        let args: Vec<Value> = serde_json::from_str(args)?;
        let mut args = args.into_iter();
        let mut next = || args.next().unwrap_or(Value::Null);
        let user = self.user.as_ref();

        debug!("Script db.{} on {}", op, model);
        match op {
            "create" => {
                let data = next();
                let id = self.handle.block_on(self.data.create(model, data, user))?;
                Ok(Value::String(id.to_string()))
            }
            "update" => {
                let selector = next();
                let patch = next();
                let count = self
                    .handle
                    .block_on(self.data.update(model, selector, patch, user))?;
                Ok(json!(count))
            }
            "delete" => {
                let selector = next();
                let count = self.handle.block_on(self.data.delete(model, selector, user))?;
                Ok(json!(count))
            }
            other => Err(WorkflowError::InvalidAction(format!(
                "unknown db operation `{}`",
                other
            ))),
        }
    }
}

struct ScriptJob {
    script: String,
    context_json: String,
    bridge: DbBridge,
    timeout: Duration,
    memory_limit: usize,
}

fn execute_blocking(job: ScriptJob) -> Result<Value, ScriptError> {
    let runtime = Runtime::new().map_err(runtime_err)?;
    runtime.set_memory_limit(job.memory_limit);
    runtime.set_max_stack_size(STACK_LIMIT);

    let deadline = Instant::now() + job.timeout;
    runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

    let context = Context::full(&runtime).map_err(runtime_err)?;
    let timeout_ms = job.timeout.as_millis() as u64;
    let bridge = job.bridge;

    let output = context.with(|ctx| -> Result<String, ScriptError> {
        let globals = ctx.globals();
        let db_call = Function::new(ctx.clone(), move |op: String, model: String, args: String| {
            bridge.call(&op, &model, &args)
        })
        .map_err(runtime_err)?;

        globals.set("__dbCall", db_call).map_err(runtime_err)?;
        globals.set("__contextJson", job.context_json).map_err(runtime_err)?;
        globals.set("__script", job.script).map_err(runtime_err)?;

        ctx.eval::<String, _>(PRELUDE).catch(&ctx).map_err(|caught| {
            if Instant::now() >= deadline {
                ScriptError::Timeout(timeout_ms)
            } else {
                classify(caught.to_string())
            }
        })
    })?;

    serde_json::from_str(&output).map_err(|e| ScriptError::Output(e.to_string()))
}

#[derive(Clone)]
pub struct ScriptSandbox {
    data: Arc<dyn DataLayer>,
    timeout: Duration,
    memory_limit: usize,
}

impl ScriptSandbox {
    pub fn new(data: Arc<dyn DataLayer>, timeout: Duration, memory_limit: usize) -> Self {
        Self {
            data,
            timeout,
            memory_limit,
        }
    }

    /// Run `script` and return its JSON result.
    pub async fn run(
        &self,
        script: &str,
        context: &Value,
        user: Option<&User>,
        timeout: Option<Duration>,
    ) -> Result<Value, ScriptError> {
        let timeout = timeout.unwrap_or(self.timeout);
        let timeout_ms = timeout.as_millis() as u64;

        let job = ScriptJob {
            script: script.to_string(),
            context_json: context.to_string(),
            bridge: DbBridge {
                data: self.data.clone(),
                user: user.cloned(),
                handle: Handle::current(),
            },
            timeout,
            memory_limit: self.memory_limit,
        };

        let task = tokio::task::spawn_blocking(move || execute_blocking(job));
        match tokio::time::timeout(timeout + OUTER_GRACE, task).await {
            Err(_) => Err(ScriptError::Timeout(timeout_ms)),
            Ok(Err(join)) => Err(ScriptError::Runtime(join.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}
