//! Agent lifecycle and conversation accumulation.
//!
//! The [`AgentRuntime`] owns every live [`Agent`] and drives the reason–act
//! loop purely through bus events: each handler appends to the agent's
//! conversation and emits the follow-up event, so the sequence
//! `LLMRequest → LLMResponse → (ToolsExecRequest → ToolsExecResults)* →
//! AgentFinish` is causally serial per agent with no direct call chain
//! between runtimes.
//!
//! Agents are passive records. Their methods compute the follow-up events
//! under the agent's lock; handlers emit them after the lock is released so
//! no lock ever spans a bus emission.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::agentloop::event_bus::{Event, EventBus};
use crate::agentloop::events::{
    AgentCreate, AgentDeleted, AgentFinish, AgentLauncherShutdown, AgentRuntimeError, AgentStart,
    LLMRequest, LLMResponse, TaskCreate, TaskFinish, ToolCall, ToolResult, ToolsExecRequest,
    ToolsExecResults,
};
use crate::agentloop::ids;
use crate::agentloop::messages::{Message, ToolSchema};

/// A live agent: identity, task, append-only conversation, and the tool
/// schemas it may request. Referenced only by the runtime's index.
pub struct Agent {
    pub agent_id: String,
    pub task: String,
    pub conversation: Vec<Message>,
    pub system_prompt: String,
    pub tool_schemas: Vec<ToolSchema>,
}

impl Agent {
    fn from_create(event: &AgentCreate) -> Self {
        Self {
            agent_id: event.agent_id.clone(),
            task: event.task.clone(),
            // Prior transcript messages (empty for sub-agents and fresh runs).
            conversation: event.conversation.clone(),
            system_prompt: event.system_prompt.clone(),
            tool_schemas: event.tool_schemas.clone(),
        }
    }

    /// Enter the loop: record the task as a user message and request the
    /// first model round-trip.
    fn start(&mut self) -> Vec<Arc<dyn Event>> {
        self.conversation.push(Message::User {
            content: self.task.clone(),
        });
        vec![
            Arc::new(AgentStart {
                agent_id: self.agent_id.clone(),
            }),
            Arc::new(self.llm_request()),
        ]
    }

    /// Append the model response; request tool execution if it contains tool
    /// calls, otherwise finish with the joined assistant contents.
    fn handle_llm_response(&mut self, response: Vec<Message>) -> Arc<dyn Event> {
        self.conversation.extend(response.iter().cloned());

        let tool_calls: Vec<ToolCall> = response
            .iter()
            .filter_map(|message| match message {
                Message::ToolCall {
                    tool_call_id,
                    tool_name,
                    arguments,
                } => Some(ToolCall {
                    agent_id: self.agent_id.clone(),
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect();

        if tool_calls.is_empty() {
            let mut result = String::new();
            for message in &response {
                if let Message::Assistant { content } = message {
                    result.push('\n');
                    result.push_str(content);
                }
            }
            Arc::new(AgentFinish {
                agent_id: self.agent_id.clone(),
                result,
            })
        } else {
            Arc::new(ToolsExecRequest {
                agent_id: self.agent_id.clone(),
                tool_calls,
            })
        }
    }

    /// Append the tool results and request the next model round-trip.
    fn handle_tools_exec_results(&mut self, results: Vec<ToolResult>) -> Arc<dyn Event> {
        for result in results {
            self.conversation.push(Message::ToolResult {
                tool_call_id: result.tool_call_id,
                tool_name: result.tool_name,
                result: result.result,
            });
        }
        Arc::new(self.llm_request())
    }

    fn llm_request(&self) -> LLMRequest {
        let mut messages = Vec::with_capacity(self.conversation.len() + 1);
        if !self.system_prompt.is_empty() {
            messages.push(Message::System {
                content: self.system_prompt.clone(),
            });
        }
        messages.extend(self.conversation.iter().cloned());
        LLMRequest {
            agent_id: self.agent_id.clone(),
            messages,
            tool_schemas: self.tool_schemas.clone(),
            retry_count: 0,
        }
    }
}

/// Owns the agent index and the lifecycle transition handlers.
pub struct AgentRuntime {
    bus: Arc<EventBus>,
    agents: RwLock<HashMap<String, Arc<Mutex<Agent>>>>,
}

impl AgentRuntime {
    /// Create the runtime and subscribe its handlers on `bus`.
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        let runtime = Arc::new(Self {
            bus: Arc::clone(&bus),
            agents: RwLock::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |event: TaskCreate| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_task_create(event).await;
                }
            }
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |event: AgentCreate| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_agent_create(event).await;
                }
            }
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |event: LLMResponse| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_llm_response(event).await;
                }
            }
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |event: ToolsExecResults| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_tools_exec_results(event).await;
                }
            }
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |event: AgentFinish| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_agent_finish(event).await;
                }
            }
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |event: AgentRuntimeError| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_agent_runtime_error(event).await;
                }
            }
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |event: TaskFinish| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_task_finish(event).await;
                }
            }
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |event: AgentLauncherShutdown| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_shutdown(event).await;
                }
            }
        });

        runtime
    }

    /// Number of live agents, for introspection and tests.
    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    async fn handle_task_create(&self, event: TaskCreate) {
        let system_prompt = if event.system_prompt.is_empty() {
            ids::DEFAULT_PRIMARY_SYSTEM_PROMPT.to_string()
        } else {
            event.system_prompt
        };
        self.bus
            .emit(AgentCreate {
                agent_id: event.agent_id,
                task: event.task,
                tool_schemas: event.tool_schemas,
                conversation: event.conversation,
                system_prompt,
            })
            .await;
    }

    async fn handle_agent_create(&self, event: AgentCreate) {
        let agent_id = event.agent_id.clone();
        let agent = Arc::new(Mutex::new(Agent::from_create(&event)));
        {
            let mut agents = self.agents.write().await;
            if agents.contains_key(&agent_id) {
                drop(agents);
                self.bus
                    .emit(AgentRuntimeError {
                        agent_id,
                        error: "Agent with this ID already exists".to_string(),
                    })
                    .await;
                return;
            }
            agents.insert(agent_id, Arc::clone(&agent));
        }

        let outgoing = {
            let mut agent = agent.lock().await;
            agent.start()
        };
        for event in outgoing {
            self.bus.emit_shared(event).await;
        }
    }

    async fn handle_llm_response(&self, event: LLMResponse) {
        match self.get_agent(&event.agent_id).await {
            None => self.emit_not_found(event.agent_id).await,
            Some(agent) => {
                let outgoing = {
                    let mut agent = agent.lock().await;
                    agent.handle_llm_response(event.response)
                };
                self.bus.emit_shared(outgoing).await;
            }
        }
    }

    async fn handle_tools_exec_results(&self, event: ToolsExecResults) {
        match self.get_agent(&event.agent_id).await {
            None => self.emit_not_found(event.agent_id).await,
            Some(agent) => {
                let outgoing = {
                    let mut agent = agent.lock().await;
                    agent.handle_tools_exec_results(event.tool_results)
                };
                self.bus.emit_shared(outgoing).await;
            }
        }
    }

    async fn handle_agent_finish(&self, event: AgentFinish) {
        if self.get_agent(&event.agent_id).await.is_none() {
            self.emit_not_found(event.agent_id).await;
            return;
        }

        if ids::is_primary_agent(&event.agent_id) {
            self.bus
                .emit(TaskFinish {
                    agent_id: event.agent_id,
                    result: event.result,
                })
                .await;
        } else {
            self.agents.write().await.remove(&event.agent_id);
            self.bus
                .emit(AgentDeleted {
                    agent_id: event.agent_id,
                })
                .await;
        }
    }

    async fn handle_agent_runtime_error(&self, event: AgentRuntimeError) {
        let removed = self.agents.write().await.remove(&event.agent_id).is_some();
        if removed {
            self.bus
                .emit(AgentDeleted {
                    agent_id: event.agent_id.clone(),
                })
                .await;
        }
        self.bus
            .emit(TaskFinish {
                agent_id: event.agent_id,
                result: format!("Error: {}", event.error),
            })
            .await;
    }

    async fn handle_task_finish(&self, event: TaskFinish) {
        if !ids::is_primary_agent(&event.agent_id) {
            return;
        }
        let removed = self.agents.write().await.remove(&event.agent_id).is_some();
        if removed {
            self.bus
                .emit(AgentDeleted {
                    agent_id: event.agent_id,
                })
                .await;
        }
    }

    async fn handle_shutdown(&self, _event: AgentLauncherShutdown) {
        let drained: Vec<String> = {
            let mut agents = self.agents.write().await;
            agents.drain().map(|(agent_id, _)| agent_id).collect()
        };
        for agent_id in drained {
            self.bus.emit(AgentDeleted { agent_id }).await;
        }
    }

    async fn get_agent(&self, agent_id: &str) -> Option<Arc<Mutex<Agent>>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    async fn emit_not_found(&self, agent_id: String) {
        self.bus
            .emit(AgentRuntimeError {
                agent_id,
                error: "Agent not found".to_string(),
            })
            .await;
    }
}
