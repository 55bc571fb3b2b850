//! Tool registration, argument coercion, parallel execution, and the
//! sub-agent tool.
//!
//! Tools are async functions registered under a name together with an
//! ordered parameter schema. The model addresses them with a name→value JSON
//! argument map; before invocation the runtime zips that map against the
//! schema's positional order and coerces each value to its declared type, so
//! the function receives exactly one [`serde_json::Value`] per schema
//! parameter, already of the right JSON kind.
//!
//! Batches arrive as [`ToolsExecRequest`] events. Each call in a batch runs
//! on its own task; the runtime collects the outcomes and emits a single
//! [`ToolsExecResults`] with results in the **same order** as the request,
//! regardless of which call finished first. A failing call never aborts the
//! batch — its error text becomes that call's result.
//!
//! # The sub-agent tool
//!
//! `create_sub_agent` is a tool like any other from the model's point of
//! view, but its implementation crosses runtimes: it emits an
//! [`AgentCreate`] for a fresh `<invoker>_<uuid>` agent and then parks the
//! invoking tool slot on a single-slot rendezvous channel until that agent's
//! [`AgentFinish`] arrives (or a 5-minute timeout / cancellation fires).
//! There is no direct handle to the agent runtime — the rendezvous happens
//! entirely through the bus.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::agentloop::event_bus::EventBus;
use crate::agentloop::events::{
    AgentCreate, AgentFinish, AgentLauncherShutdown, ToolCall, ToolExecError, ToolExecFinish,
    ToolExecStart, ToolResult, ToolRuntimeError, ToolsExecRequest, ToolsExecResults,
};
use crate::agentloop::ids;
use crate::agentloop::messages::{ToolParamSchema, ToolParamType, ToolSchema};

/// How long a sub-agent may run before its invoking tool call gives up.
const SUB_AGENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Out-of-band invocation context handed to every tool function as its
/// first argument. The model never sees these fields.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// ID of the agent whose tool call is being executed.
    pub agent_id: String,
    /// ID of the tool call, unique within its response.
    pub tool_call_id: String,
    /// Cancelled when the launcher shuts down; long-running tools should
    /// select against it.
    pub cancel: CancellationToken,
}

/// A registered tool function.
///
/// Receives the invocation context and one positional [`Value`] per schema
/// parameter (coerced to the declared type; zero-valued when optional and
/// absent). The returned value is stringified for the conversation: strings
/// pass through, `null` becomes `""`, anything else is JSON-encoded. A
/// returned error becomes the tool's textual result.
pub type ToolFn = Arc<
    dyn Fn(ToolContext, Vec<Value>) -> BoxFuture<'static, Result<Value, Box<dyn Error + Send + Sync>>>
        + Send
        + Sync,
>;

/// Error types for tool registration and execution.
#[derive(Debug)]
pub enum ToolError {
    /// A tool with this name is already registered.
    Duplicate(String),
    /// Requested tool is not in the registry.
    NotFound(String),
    /// A required argument was absent from the model's argument map.
    MissingArgument(String),
    /// An argument value could not be coerced to its declared type.
    Coercion {
        argument: String,
        actual: &'static str,
        expected: ToolParamType,
    },
    /// The tool function itself failed.
    Execution(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::Duplicate(name) => write!(f, "tool '{name}' is already registered"),
            ToolError::NotFound(name) => write!(f, "tool '{name}' not found"),
            ToolError::MissingArgument(name) => write!(f, "missing required argument: {name}"),
            ToolError::Coercion {
                argument,
                actual,
                expected,
            } => write!(
                f,
                "argument '{argument}': cannot convert {actual} to {}",
                expected.type_name()
            ),
            ToolError::Execution(message) => write!(f, "{message}"),
        }
    }
}

impl Error for ToolError {}

#[derive(Clone)]
struct RegisteredTool {
    schema: ToolSchema,
    function: ToolFn,
}

/// Owns the tool registry and the sub-agent rendezvous table. See the
/// [module docs](self).
pub struct ToolRuntime {
    bus: Arc<EventBus>,
    tools: Arc<SyncRwLock<HashMap<String, RegisteredTool>>>,
    pending_sub_agents: Arc<SyncMutex<HashMap<String, oneshot::Sender<String>>>>,
    cancel: CancellationToken,
}

impl ToolRuntime {
    /// Create the runtime and subscribe its handlers on `bus`.
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        let runtime = Arc::new(Self {
            bus: Arc::clone(&bus),
            tools: Arc::new(SyncRwLock::new(HashMap::new())),
            pending_sub_agents: Arc::new(SyncMutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |event: ToolsExecRequest| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_tools_exec_request(event).await;
                }
            }
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |event: AgentFinish| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_agent_finish(event);
                }
            }
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |_event: AgentLauncherShutdown| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_shutdown();
                }
            }
        });

        runtime
    }

    /// Register `function` under `name` with the given ordered parameter
    /// schema. Duplicate names fail; use
    /// [`setup_sub_agent_tool`](ToolRuntime::setup_sub_agent_tool) for the
    /// idempotent built-in.
    pub fn register(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        function: ToolFn,
        params: Vec<ToolParamSchema>,
    ) -> Result<(), ToolError> {
        let name = name.into();
        let mut tools = self.tools.write();
        if tools.contains_key(&name) {
            return Err(ToolError::Duplicate(name));
        }
        let mut schema = ToolSchema::new(name.clone(), description);
        schema.parameters = params;
        tools.insert(name, RegisteredTool { schema, function });
        Ok(())
    }

    /// Names of all registered tools.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.read().keys().cloned().collect()
    }

    /// Schemas for the named tools; names absent from the registry are
    /// silently skipped.
    pub fn schemas_for(&self, names: &[String]) -> Vec<ToolSchema> {
        collect_schemas(&self.tools, names)
    }

    /// Number of sub-agents currently awaited by blocked tool calls.
    pub fn pending_sub_agents(&self) -> usize {
        self.pending_sub_agents.lock().len()
    }

    /// Register the `create_sub_agent` tool. Idempotent: calling this when
    /// the tool already exists is a no-op, so every `run` may call it.
    pub fn setup_sub_agent_tool(&self) {
        let bus = Arc::clone(&self.bus);
        let tools = Arc::clone(&self.tools);
        let pending = Arc::clone(&self.pending_sub_agents);
        let function: ToolFn = Arc::new(move |ctx, args| {
            let bus = Arc::clone(&bus);
            let tools = Arc::clone(&tools);
            let pending = Arc::clone(&pending);
            Box::pin(create_sub_agent(bus, tools, pending, ctx, args))
        });

        let mut schema = ToolSchema::new(
            ids::SUB_AGENT_TOOL_NAME,
            "Create a sub-agent to handle a specific task",
        );
        schema.parameters = vec![
            ToolParamSchema::new("task", ToolParamType::String)
                .with_description("Task for the sub-agent to accomplish")
                .required(),
            ToolParamSchema::new("toolNameList", ToolParamType::Array)
                .with_description("List of tool names the sub-agent can use")
                .required()
                .with_items(ToolParamType::String),
        ];

        let mut registry = self.tools.write();
        if registry.contains_key(ids::SUB_AGENT_TOOL_NAME) {
            return;
        }
        registry.insert(
            ids::SUB_AGENT_TOOL_NAME.to_string(),
            RegisteredTool { schema, function },
        );
    }

    async fn handle_tools_exec_request(self: Arc<Self>, event: ToolsExecRequest) {
        let missing: Vec<String> = {
            let tools = self.tools.read();
            event
                .tool_calls
                .iter()
                .filter(|call| !tools.contains_key(&call.tool_name))
                .map(|call| call.tool_name.clone())
                .collect()
        };
        if !missing.is_empty() {
            self.bus
                .emit(ToolRuntimeError {
                    agent_id: event.agent_id.clone(),
                    error: format!("Missing tools: {missing:?}"),
                })
                .await;
            // Empty results keep the agent loop moving.
            self.bus
                .emit(ToolsExecResults {
                    agent_id: event.agent_id,
                    tool_results: Vec::new(),
                })
                .await;
            return;
        }

        // Run the batch on its own task so a slow call (a sub-agent
        // rendezvous can park for minutes) does not occupy a bus worker.
        tokio::spawn(async move {
            let total = event.tool_calls.len();
            let (tx, mut rx) = mpsc::channel::<(usize, ToolResult)>(total.max(1));

            for (index, call) in event.tool_calls.into_iter().enumerate() {
                let runtime = Arc::clone(&self);
                let agent_id = event.agent_id.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = runtime.tool_exec(agent_id, call).await;
                    let _ = tx.send((index, result)).await;
                });
            }
            drop(tx);

            let mut ordered: Vec<Option<ToolResult>> = vec![None; total];
            while let Some((index, result)) = rx.recv().await {
                ordered[index] = Some(result);
            }

            self.bus
                .emit(ToolsExecResults {
                    agent_id: event.agent_id,
                    tool_results: ordered.into_iter().flatten().collect(),
                })
                .await;
        });
    }

    async fn tool_exec(&self, agent_id: String, call: ToolCall) -> ToolResult {
        self.bus
            .emit(ToolExecStart {
                agent_id: agent_id.clone(),
                tool_call_id: call.tool_call_id.clone(),
                tool_name: call.tool_name.clone(),
                arguments: call.arguments.clone(),
            })
            .await;

        let result = match self.execute_tool_function(&agent_id, &call).await {
            Ok(text) => {
                self.bus
                    .emit(ToolExecFinish {
                        agent_id: agent_id.clone(),
                        tool_call_id: call.tool_call_id.clone(),
                        tool_name: call.tool_name.clone(),
                        result: text.clone(),
                    })
                    .await;
                text
            }
            Err(err) => {
                let error = err.to_string();
                self.bus
                    .emit(ToolExecError {
                        agent_id: agent_id.clone(),
                        tool_call_id: call.tool_call_id.clone(),
                        tool_name: call.tool_name.clone(),
                        error: error.clone(),
                    })
                    .await;
                error
            }
        };

        ToolResult {
            agent_id,
            tool_call_id: call.tool_call_id,
            tool_name: call.tool_name,
            result,
        }
    }

    async fn execute_tool_function(
        &self,
        agent_id: &str,
        call: &ToolCall,
    ) -> Result<String, ToolError> {
        let (function, schema) = {
            let tools = self.tools.read();
            match tools.get(&call.tool_name) {
                Some(tool) => (Arc::clone(&tool.function), tool.schema.clone()),
                None => return Err(ToolError::NotFound(call.tool_name.clone())),
            }
        };

        let args = build_positional_args(&schema, &call.arguments)?;
        let ctx = ToolContext {
            agent_id: agent_id.to_string(),
            tool_call_id: call.tool_call_id.clone(),
            cancel: self.cancel.clone(),
        };

        let value = function(ctx, args)
            .await
            .map_err(|err| ToolError::Execution(err.to_string()))?;
        stringify_result(value)
    }

    fn handle_agent_finish(&self, event: AgentFinish) {
        let waiting = self.pending_sub_agents.lock().remove(&event.agent_id);
        if let Some(sender) = waiting {
            let _ = sender.send(event.result);
        }
    }

    fn handle_shutdown(&self) {
        self.pending_sub_agents.lock().clear();
        self.cancel.cancel();
    }
}

/// Schemas for the named tools, skipping names absent from the registry.
/// Shared between [`ToolRuntime::schemas_for`] and the sub-agent tool, which
/// narrows a sub-agent's toolbox to the listed names.
fn collect_schemas(
    tools: &SyncRwLock<HashMap<String, RegisteredTool>>,
    names: &[String],
) -> Vec<ToolSchema> {
    let tools = tools.read();
    names
        .iter()
        .filter_map(|name| tools.get(name).map(|tool| tool.schema.clone()))
        .collect()
}

/// Zip the model's name→value argument map against the schema's positional
/// parameter order, coercing each value to its declared type.
fn build_positional_args(
    schema: &ToolSchema,
    arguments: &Map<String, Value>,
) -> Result<Vec<Value>, ToolError> {
    let mut args = Vec::with_capacity(schema.parameters.len());
    for param in &schema.parameters {
        match arguments.get(&param.name) {
            None if param.required => {
                return Err(ToolError::MissingArgument(param.name.clone()));
            }
            None => args.push(param.param_type.zero_value()),
            Some(value) => args.push(coerce_argument(&param.name, value, param.param_type, param.items)?),
        }
    }
    Ok(args)
}

fn coerce_argument(
    argument: &str,
    value: &Value,
    target: ToolParamType,
    items: Option<ToolParamType>,
) -> Result<Value, ToolError> {
    let mismatch = || ToolError::Coercion {
        argument: argument.to_string(),
        actual: json_type_name(value),
        expected: target,
    };

    match target {
        ToolParamType::String => match value {
            Value::Null => Err(mismatch()),
            Value::String(text) => Ok(Value::String(text.clone())),
            Value::Bool(flag) => Ok(Value::String(flag.to_string())),
            Value::Number(number) => Ok(Value::String(number.to_string())),
            // Composite values stringify to their JSON text.
            other => Ok(Value::String(other.to_string())),
        },
        ToolParamType::Integer => match value {
            Value::Number(number) if number.is_i64() || number.is_u64() => Ok(value.clone()),
            Value::Number(number) => match number.as_f64() {
                Some(float) => Ok(Value::from(float.trunc() as i64)),
                None => Err(mismatch()),
            },
            _ => Err(mismatch()),
        },
        ToolParamType::Number => match value {
            Value::Number(number) => match number.as_f64() {
                Some(float) => Ok(Value::from(float)),
                None => Err(mismatch()),
            },
            _ => Err(mismatch()),
        },
        ToolParamType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            _ => Err(mismatch()),
        },
        ToolParamType::Array => match value {
            Value::Array(elements) => match items {
                Some(item_type) => {
                    let mut coerced = Vec::with_capacity(elements.len());
                    for element in elements {
                        coerced.push(coerce_argument(argument, element, item_type, None)?);
                    }
                    Ok(Value::Array(coerced))
                }
                None => Ok(value.clone()),
            },
            _ => Err(mismatch()),
        },
        ToolParamType::Object => match value {
            Value::Object(_) => Ok(value.clone()),
            _ => Err(mismatch()),
        },
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(number) if number.is_i64() || number.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn stringify_result(value: Value) -> Result<String, ToolError> {
    match value {
        Value::String(text) => Ok(text),
        Value::Null => Ok(String::new()),
        other => serde_json::to_string(&other)
            .map_err(|err| ToolError::Execution(format!("failed to serialize result: {err}"))),
    }
}

async fn create_sub_agent(
    bus: Arc<EventBus>,
    tools: Arc<SyncRwLock<HashMap<String, RegisteredTool>>>,
    pending: Arc<SyncMutex<HashMap<String, oneshot::Sender<String>>>>,
    ctx: ToolContext,
    args: Vec<Value>,
) -> Result<Value, Box<dyn Error + Send + Sync>> {
    let task = args
        .first()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_names: Vec<String> = args
        .get(1)
        .and_then(Value::as_array)
        .map(|elements| {
            elements
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let sub_id = ids::sub_agent_id(&ctx.agent_id);
    let (sender, receiver) = oneshot::channel::<String>();
    pending.lock().insert(sub_id.clone(), sender);

    let tool_schemas = collect_schemas(&tools, &tool_names);

    // No system prompt: sub-agents run bare.
    bus.emit(AgentCreate {
        agent_id: sub_id.clone(),
        task,
        tool_schemas,
        conversation: Vec::new(),
        system_prompt: String::new(),
    })
    .await;

    tokio::select! {
        delivered = receiver => match delivered {
            Ok(result) => Ok(Value::String(result)),
            Err(_) => Err(Box::new(ToolError::Execution(
                "sub-agent result channel closed".to_string(),
            )) as Box<dyn Error + Send + Sync>),
        },
        _ = ctx.cancel.cancelled() => {
            pending.lock().remove(&sub_id);
            Err(Box::new(ToolError::Execution("sub-agent cancelled".to_string())) as Box<dyn Error + Send + Sync>)
        }
        _ = tokio::time::sleep(SUB_AGENT_TIMEOUT) => {
            pending.lock().remove(&sub_id);
            Err(Box::new(ToolError::Execution("sub-agent timeout".to_string())) as Box<dyn Error + Send + Sync>)
        }
    }
}
