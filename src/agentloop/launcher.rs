//! The launcher façade.
//!
//! [`AgentLauncher`] wires the four runtimes to a single event bus, owns the
//! default system prompt, and exposes the public entry points: builder-style
//! configuration, [`run`](AgentLauncher::run) /
//! [`run_with_history`](AgentLauncher::run_with_history), and
//! [`close`](AgentLauncher::close).
//!
//! Each launcher instance owns its own bus and tables, so multiple launchers
//! can coexist in one process. `run` is safe to call concurrently: every
//! call is assigned a fresh primary agent ID (`agent0`, `agent1`, …) and an
//! independent single-slot result channel drained by the `TaskFinish`
//! handler.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentloop::{AgentLauncher, ToolParamSchema, ToolParamType};
//! use std::sync::Arc;
//!
//! # async fn run(handler: Arc<dyn agentloop::LLMHandler>) {
//! let launcher = AgentLauncher::new(handler.clone(), handler)
//!     .with_tool(
//!         "echo",
//!         "Echo the input text",
//!         Arc::new(|_ctx, args| {
//!             Box::pin(async move { Ok(args.into_iter().next().unwrap_or_default()) })
//!         }),
//!         vec![ToolParamSchema::new("text", ToolParamType::String).required()],
//!     )
//!     .unwrap();
//!
//! let result = launcher.run("Say hi via the echo tool").await;
//! println!("{result}");
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use tokio::sync::oneshot;

use crate::agentloop::agent_runtime::AgentRuntime;
use crate::agentloop::event_bus::{Event, EventBus, EventBusError, VerboseLevel};
use crate::agentloop::events::{AgentLauncherRun, AgentLauncherShutdown, TaskCreate, TaskFinish};
use crate::agentloop::ids;
use crate::agentloop::llm_runtime::{LLMHandler, LLMRuntime};
use crate::agentloop::message_runtime::MessageRuntime;
use crate::agentloop::messages::{Message, ToolParamSchema};
use crate::agentloop::tool_runtime::{ToolError, ToolFn, ToolRuntime};

/// How long `run` waits for the primary agent before giving up.
const TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Wires the runtimes together and drives tasks end to end. See the
/// [module docs](self).
pub struct AgentLauncher {
    bus: Arc<EventBus>,
    agent_runtime: Arc<AgentRuntime>,
    // Held for its bus subscriptions; they are weak and die with the Arc.
    _llm_runtime: Arc<LLMRuntime>,
    tool_runtime: Arc<ToolRuntime>,
    message_runtime: Arc<MessageRuntime>,
    system_prompt: SyncRwLock<String>,
    final_results: Arc<SyncMutex<HashMap<String, oneshot::Sender<String>>>>,
    next_primary_index: AtomicUsize,
    sub_agent_tool_enabled: AtomicBool,
}

impl std::fmt::Debug for AgentLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLauncher").finish_non_exhaustive()
    }
}

impl AgentLauncher {
    /// Build a launcher around the two injected model handlers (primary
    /// agents use the first, sub-agents the second — often the same handler
    /// with a cheaper model). Must be called within a Tokio runtime.
    pub fn new(
        primary_handler: Arc<dyn LLMHandler>,
        sub_agent_handler: Arc<dyn LLMHandler>,
    ) -> Self {
        let bus = EventBus::new();
        let final_results: Arc<SyncMutex<HashMap<String, oneshot::Sender<String>>>> =
            Arc::new(SyncMutex::new(HashMap::new()));

        let results = Arc::clone(&final_results);
        bus.subscribe(move |event: TaskFinish| {
            let results = Arc::clone(&results);
            async move {
                let waiting = results.lock().remove(&event.agent_id);
                if let Some(sender) = waiting {
                    let _ = sender.send(event.result);
                }
            }
        });

        Self {
            agent_runtime: AgentRuntime::new(Arc::clone(&bus)),
            _llm_runtime: LLMRuntime::new(
                Arc::clone(&bus),
                Some(primary_handler),
                Some(sub_agent_handler),
            ),
            tool_runtime: ToolRuntime::new(Arc::clone(&bus)),
            message_runtime: MessageRuntime::new(Arc::clone(&bus)),
            system_prompt: SyncRwLock::new(ids::DEFAULT_PRIMARY_SYSTEM_PROMPT.to_string()),
            final_results,
            next_primary_index: AtomicUsize::new(0),
            sub_agent_tool_enabled: AtomicBool::new(true),
            bus,
        }
    }

    /// Set the bus emission-logging verbosity.
    pub fn with_verbose_level(self, level: VerboseLevel) -> Self {
        self.bus.with_verbose_level(level);
        self
    }

    /// Replace the default primary-agent system prompt.
    pub fn with_system_prompt(self, prompt: impl Into<String>) -> Self {
        *self.system_prompt.write() = prompt.into();
        self
    }

    /// Register a tool. Fails on duplicate names.
    pub fn with_tool(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        function: ToolFn,
        params: Vec<ToolParamSchema>,
    ) -> Result<Self, ToolError> {
        self.tool_runtime
            .register(name, description, function, params)?;
        Ok(self)
    }

    /// Install a hook transforming each primary model response before it is
    /// appended to history.
    pub fn with_response_message_handler(
        self,
        handler: impl Fn(Vec<Message>) -> Vec<Message> + Send + Sync + 'static,
    ) -> Self {
        self.message_runtime
            .set_response_message_handler(Arc::new(handler));
        self
    }

    /// Install a hook observing each finished task's transcript.
    pub fn with_conversation_handler(
        self,
        handler: impl Fn(Vec<Message>) -> Vec<Message> + Send + Sync + 'static,
    ) -> Self {
        self.message_runtime
            .set_conversation_handler(Arc::new(handler));
        self
    }

    /// Do not register the `create_sub_agent` tool; agents then cannot
    /// delegate.
    pub fn disable_sub_agent_tool(self) -> Self {
        self.sub_agent_tool_enabled.store(false, Ordering::Relaxed);
        self
    }

    /// Subscribe an external observer for events of type `E`.
    pub fn subscribe_event<E, F, Fut>(self, handler: F) -> Self
    where
        E: Event + Clone,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.bus.subscribe(handler);
        self
    }

    /// The agent runtime, for introspection (e.g. live agent counts).
    pub fn agent_runtime(&self) -> &Arc<AgentRuntime> {
        &self.agent_runtime
    }

    /// The tool runtime, for introspection (e.g. registered tool names).
    pub fn tool_runtime(&self) -> &Arc<ToolRuntime> {
        &self.tool_runtime
    }

    /// The message runtime, for introspection (e.g. live transcripts).
    pub fn message_runtime(&self) -> &Arc<MessageRuntime> {
        &self.message_runtime
    }

    /// Run a task to completion and return the final textual result.
    pub async fn run(&self, task: impl Into<String>) -> String {
        self.run_with_history(task, Vec::new()).await
    }

    /// Like [`run`](AgentLauncher::run), seeding the primary agent's
    /// conversation with prior transcript messages.
    pub async fn run_with_history(&self, task: impl Into<String>, history: Vec<Message>) -> String {
        let task = task.into();
        if self.sub_agent_tool_enabled.load(Ordering::Relaxed) {
            self.tool_runtime.setup_sub_agent_tool();
        }

        let agent_id = ids::primary_agent_id(self.next_primary_index.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = oneshot::channel::<String>();
        self.final_results.lock().insert(agent_id.clone(), sender);

        let system_prompt = self.system_prompt.read().clone();
        let tool_names = self.tool_runtime.tool_names();
        self.bus
            .emit(AgentLauncherRun {
                agent_id: agent_id.clone(),
                task: task.clone(),
            })
            .await;
        self.bus
            .emit(TaskCreate {
                agent_id: agent_id.clone(),
                task,
                tool_schemas: self.tool_runtime.schemas_for(&tool_names),
                system_prompt,
                conversation: history,
            })
            .await;

        match tokio::time::timeout(TASK_TIMEOUT, receiver).await {
            Ok(Ok(result)) => result,
            // Result slot dropped (launcher torn down) or deadline elapsed.
            Ok(Err(_)) => "Task timed out".to_string(),
            Err(_) => {
                self.final_results.lock().remove(&agent_id);
                "Task timed out".to_string()
            }
        }
    }

    /// Announce shutdown (runtimes drop all per-agent state) and drain the
    /// bus. Returns [`EventBusError::ShutdownTimeout`] if `deadline` elapses
    /// before the drain completes.
    pub async fn close(&self, deadline: Duration) -> Result<(), EventBusError> {
        self.bus
            .emit(AgentLauncherShutdown {
                agent_id: String::new(),
            })
            .await;
        self.bus.shutdown(deadline).await
    }
}
