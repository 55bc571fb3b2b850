//! The event taxonomy.
//!
//! One struct per event kind, grouped by the runtime that owns the concern:
//! launcher, task, agent, LLM, tool, and message/streaming. Every event
//! carries the `agent_id` it concerns; the [`Event`] impl exposes it to the
//! bus for filtering and logging.
//!
//! The streaming kinds (`MessageDeltaStreaming`, `ToolCallNameStreaming`,
//! ...) are emitted by LLM handlers that stream tokens; the runtimes never
//! consume them — they exist for external renderers.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::agentloop::event_bus::Event;
use crate::agentloop::messages::{Message, ToolSchema};

macro_rules! impl_event {
    ($($ty:ident),+ $(,)?) => {$(
        impl Event for $ty {
            fn agent_id(&self) -> &str {
                &self.agent_id
            }
            fn kind(&self) -> &'static str {
                stringify!($ty)
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
    )+};
}

// ── Launcher ─────────────────────────────────────────────────────────────

/// A task was submitted to the launcher.
#[derive(Debug, Clone, Serialize)]
pub struct AgentLauncherRun {
    pub agent_id: String,
    pub task: String,
}

/// A task run was stopped before completion.
#[derive(Debug, Clone, Serialize)]
pub struct AgentLauncherStop {
    pub agent_id: String,
    pub task: String,
}

/// The launcher is shutting down; runtimes drop all per-agent state.
#[derive(Debug, Clone, Serialize)]
pub struct AgentLauncherShutdown {
    pub agent_id: String,
}

/// A launcher-level failure, for external observers.
#[derive(Debug, Clone, Serialize)]
pub struct AgentLauncherError {
    pub agent_id: String,
    pub error: String,
}

// ── Task ─────────────────────────────────────────────────────────────────

/// Request to start a primary agent on `task`. `conversation` carries prior
/// transcript messages when a run continues an earlier exchange.
#[derive(Debug, Clone, Serialize)]
pub struct TaskCreate {
    pub agent_id: String,
    pub task: String,
    pub tool_schemas: Vec<ToolSchema>,
    pub system_prompt: String,
    pub conversation: Vec<Message>,
}

/// The primary agent produced its final result; resolves the waiting run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskFinish {
    pub agent_id: String,
    pub result: String,
}

// ── Agent ────────────────────────────────────────────────────────────────

/// Request to construct and start an agent (primary or sub).
#[derive(Debug, Clone, Serialize)]
pub struct AgentCreate {
    pub agent_id: String,
    pub task: String,
    pub tool_schemas: Vec<ToolSchema>,
    pub conversation: Vec<Message>,
    pub system_prompt: String,
}

/// The agent entered its reason–act loop.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStart {
    pub agent_id: String,
}

/// The agent produced a final textual result. For sub-agents this feeds the
/// rendezvous with the invoking tool call; for primaries it becomes
/// [`TaskFinish`].
#[derive(Debug, Clone, Serialize)]
pub struct AgentFinish {
    pub agent_id: String,
    pub result: String,
}

/// Agent-layer failure (unknown ID, duplicate creation). Terminates the
/// task with an error result.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRuntimeError {
    pub agent_id: String,
    pub error: String,
}

/// The agent was removed from the runtime's index.
#[derive(Debug, Clone, Serialize)]
pub struct AgentDeleted {
    pub agent_id: String,
}

// ── LLM ──────────────────────────────────────────────────────────────────

/// Request for one model round-trip. `retry_count` tracks how many times
/// this request was re-issued after handler failures.
#[derive(Debug, Clone, Serialize)]
pub struct LLMRequest {
    pub agent_id: String,
    pub messages: Vec<Message>,
    pub tool_schemas: Vec<ToolSchema>,
    pub retry_count: u32,
}

/// A model response. Carries the originating request so errors downstream
/// can retry it.
#[derive(Debug, Clone, Serialize)]
pub struct LLMResponse {
    pub agent_id: String,
    pub request_event: LLMRequest,
    pub response: Vec<Message>,
}

/// Model-layer failure; retried up to the policy limit, then surfaced as a
/// synthesized assistant message.
#[derive(Debug, Clone, Serialize)]
pub struct LLMRuntimeError {
    pub agent_id: String,
    pub error: String,
    pub request_event: LLMRequest,
}

// ── Tool ─────────────────────────────────────────────────────────────────

/// One model-emitted tool invocation inside a [`ToolsExecRequest`] batch.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCall {
    pub agent_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

/// The textual outcome of one tool invocation, in the same batch position as
/// its originating call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub agent_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub result: String,
}

/// Request to execute a batch of tool calls in parallel.
#[derive(Debug, Clone, Serialize)]
pub struct ToolsExecRequest {
    pub agent_id: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Results for a batch, in the same order as the originating request.
#[derive(Debug, Clone, Serialize)]
pub struct ToolsExecResults {
    pub agent_id: String,
    pub tool_results: Vec<ToolResult>,
}

/// Batch-level tool failure (e.g. unknown tool names).
#[derive(Debug, Clone, Serialize)]
pub struct ToolRuntimeError {
    pub agent_id: String,
    pub error: String,
}

/// A single tool invocation began executing.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecStart {
    pub agent_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

/// A single tool invocation finished successfully.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecFinish {
    pub agent_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub result: String,
}

/// A single tool invocation failed; its error text becomes the tool result.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecError {
    pub agent_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub error: String,
}

// ── Message ──────────────────────────────────────────────────────────────

/// Messages were appended to a primary agent's history. Observer-only, for
/// transcript printers and similar subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct MessagesAdd {
    pub agent_id: String,
    pub messages: Vec<Message>,
}

// ── Streaming ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct MessageStartStreaming {
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageDeltaStreaming {
    pub agent_id: String,
    pub delta: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageDoneStreaming {
    pub agent_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageErrorStreaming {
    pub agent_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallNameStreaming {
    pub agent_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallArgumentsStartStreaming {
    pub agent_id: String,
    pub tool_call_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallArgumentsDeltaStreaming {
    pub agent_id: String,
    pub tool_call_id: String,
    pub arguments_delta: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallArgumentsDoneStreaming {
    pub agent_id: String,
    pub tool_call_id: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallArgumentsErrorStreaming {
    pub agent_id: String,
    pub tool_call_id: String,
    pub error: String,
}

impl_event!(
    AgentLauncherRun,
    AgentLauncherStop,
    AgentLauncherShutdown,
    AgentLauncherError,
    TaskCreate,
    TaskFinish,
    AgentCreate,
    AgentStart,
    AgentFinish,
    AgentRuntimeError,
    AgentDeleted,
    LLMRequest,
    LLMResponse,
    LLMRuntimeError,
    ToolsExecRequest,
    ToolsExecResults,
    ToolRuntimeError,
    ToolExecStart,
    ToolExecFinish,
    ToolExecError,
    MessagesAdd,
    MessageStartStreaming,
    MessageDeltaStreaming,
    MessageDoneStreaming,
    MessageErrorStreaming,
    ToolCallNameStreaming,
    ToolCallArgumentsStartStreaming,
    ToolCallArgumentsDeltaStreaming,
    ToolCallArgumentsDoneStreaming,
    ToolCallArgumentsErrorStreaming,
);
