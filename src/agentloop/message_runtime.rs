//! Per-primary-agent conversation history and caller hooks.
//!
//! Keeps one transcript per primary agent (`agent<N>`); sub-agent events are
//! filtered out entirely. Every append re-emits the added messages as a
//! [`MessagesAdd`] event so external subscribers (transcript printers,
//! persistence layers) can observe the history without owning it.
//!
//! Two optional hooks:
//! - the response-message handler transforms each primary model response
//!   before it is appended;
//! - the conversation handler runs once per task completion with the final
//!   transcript, letting the caller observe or redact it before the entry
//!   is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::RwLock;

use crate::agentloop::event_bus::EventBus;
use crate::agentloop::events::{
    AgentLauncherShutdown, LLMResponse, MessagesAdd, TaskCreate, TaskFinish, ToolsExecResults,
};
use crate::agentloop::ids;
use crate::agentloop::messages::Message;

/// Transforms a model response before it is appended to history.
pub type ResponseMessageHandler = Arc<dyn Fn(Vec<Message>) -> Vec<Message> + Send + Sync>;

/// Observes (or redacts) a finished task's transcript.
pub type ConversationHandler = Arc<dyn Fn(Vec<Message>) -> Vec<Message> + Send + Sync>;

/// Owns the per-primary-agent history map.
pub struct MessageRuntime {
    bus: Arc<EventBus>,
    history: RwLock<HashMap<String, Vec<Message>>>,
    response_message_handler: SyncRwLock<Option<ResponseMessageHandler>>,
    conversation_handler: SyncRwLock<Option<ConversationHandler>>,
}

impl MessageRuntime {
    /// Create the runtime and subscribe its handlers on `bus`.
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        let runtime = Arc::new(Self {
            bus: Arc::clone(&bus),
            history: RwLock::new(HashMap::new()),
            response_message_handler: SyncRwLock::new(None),
            conversation_handler: SyncRwLock::new(None),
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
        bus.subscribe(move |event: TaskFinish| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_task_finish(event).await;
                }
            }
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |_event: AgentLauncherShutdown| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.history.write().await.clear();
                }
            }
        });

        runtime
    }

    /// Install the response-message hook. Replaces any previous hook.
    pub fn set_response_message_handler(&self, handler: ResponseMessageHandler) {
        *self.response_message_handler.write() = Some(handler);
    }

    /// Install the conversation hook. Replaces any previous hook.
    pub fn set_conversation_handler(&self, handler: ConversationHandler) {
        *self.conversation_handler.write() = Some(handler);
    }

    /// Snapshot of a primary agent's transcript, if the task is still live.
    pub async fn history(&self, agent_id: &str) -> Option<Vec<Message>> {
        self.history.read().await.get(agent_id).cloned()
    }

    async fn handle_task_create(&self, event: TaskCreate) {
        if !ids::is_primary_agent(&event.agent_id) {
            return;
        }
        let user_message = Message::User {
            content: event.task,
        };
        {
            let mut history = self.history.write().await;
            let entry = history.entry(event.agent_id.clone()).or_default();
            entry.extend(event.conversation);
            entry.push(user_message.clone());
        }
        self.bus
            .emit(MessagesAdd {
                agent_id: event.agent_id,
                messages: vec![user_message],
            })
            .await;
    }

    async fn handle_llm_response(&self, event: LLMResponse) {
        if !ids::is_primary_agent(&event.agent_id) {
            return;
        }
        let transform = self.response_message_handler.read().clone();
        let messages = match transform {
            Some(handler) => handler(event.response),
            None => event.response,
        };
        {
            let mut history = self.history.write().await;
            history
                .entry(event.agent_id.clone())
                .or_default()
                .extend(messages.iter().cloned());
        }
        self.bus
            .emit(MessagesAdd {
                agent_id: event.agent_id,
                messages,
            })
            .await;
    }

    async fn handle_tools_exec_results(&self, event: ToolsExecResults) {
        if !ids::is_primary_agent(&event.agent_id) {
            return;
        }
        let messages: Vec<Message> = event
            .tool_results
            .into_iter()
            .map(|result| Message::ToolResult {
                tool_call_id: result.tool_call_id,
                tool_name: result.tool_name,
                result: result.result,
            })
            .collect();
        {
            let mut history = self.history.write().await;
            history
                .entry(event.agent_id.clone())
                .or_default()
                .extend(messages.iter().cloned());
        }
        self.bus
            .emit(MessagesAdd {
                agent_id: event.agent_id,
                messages,
            })
            .await;
    }

    async fn handle_task_finish(&self, event: TaskFinish) {
        if !ids::is_primary_agent(&event.agent_id) {
            return;
        }
        let transcript = self.history.write().await.remove(&event.agent_id);
        if let (Some(transcript), Some(handler)) =
            (transcript, self.conversation_handler.read().clone())
        {
            // Observation only: the entry is already gone.
            let _ = handler(transcript);
        }
    }
}
