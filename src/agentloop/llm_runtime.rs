//! LLM handler dispatch and the retry policy.
//!
//! The runtime never talks to a model provider itself. It holds two injected
//! [`LLMHandler`]s — one for primary agents, one for sub-agents — and turns
//! every [`LLMRequest`] into either an [`LLMResponse`] or an
//! [`LLMRuntimeError`]. Errors are retried up to [`MAX_LLM_RETRIES`] times;
//! after that a response containing a single
//! `Assistant("Runtime error: …")` message is synthesized so the agent loop
//! still terminates cleanly instead of hanging.

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;

use crate::agentloop::event_bus::EventBus;
use crate::agentloop::events::{LLMRequest, LLMResponse, LLMRuntimeError};
use crate::agentloop::ids;
use crate::agentloop::messages::{Message, ToolSchema};

/// Upper bound on re-issued requests; no `LLMRequest` with a retry count
/// above this is ever emitted.
pub const MAX_LLM_RETRIES: u32 = 5;

/// The injected model contract: turn a message list and the available tool
/// schemas into a response message list (zero or more `Assistant` and
/// `ToolCall` messages; tool call IDs unique within one response).
///
/// The bus reference lets streaming handlers emit `MessageDeltaStreaming`
/// and related events for external renderers. Returning `Err` is the way to
/// report a model-layer failure — the runtime converts it into an
/// [`LLMRuntimeError`] and applies the retry policy.
#[async_trait]
pub trait LLMHandler: Send + Sync {
    async fn handle(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSchema>,
        agent_id: &str,
        bus: Arc<EventBus>,
    ) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>>;
}

/// Routes model round-trips to the injected handlers.
pub struct LLMRuntime {
    bus: Arc<EventBus>,
    primary_handler: Option<Arc<dyn LLMHandler>>,
    sub_handler: Option<Arc<dyn LLMHandler>>,
}

impl LLMRuntime {
    /// Create the runtime and subscribe its handlers on `bus`. A `None`
    /// handler slot turns requests for that agent class into
    /// `LLMRuntimeError`s.
    pub fn new(
        bus: Arc<EventBus>,
        primary_handler: Option<Arc<dyn LLMHandler>>,
        sub_handler: Option<Arc<dyn LLMHandler>>,
    ) -> Arc<Self> {
        let runtime = Arc::new(Self {
            bus: Arc::clone(&bus),
            primary_handler,
            sub_handler,
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |event: LLMRequest| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_llm_request(event).await;
                }
            }
        });

        let weak = Arc::downgrade(&runtime);
        bus.subscribe(move |event: LLMRuntimeError| {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.handle_llm_runtime_error(event).await;
                }
            }
        });

        runtime
    }

    async fn handle_llm_request(&self, event: LLMRequest) {
        let handler = if ids::is_primary_agent(&event.agent_id) {
            self.primary_handler.clone()
        } else {
            self.sub_handler.clone()
        };

        let Some(handler) = handler else {
            self.bus
                .emit(LLMRuntimeError {
                    agent_id: event.agent_id.clone(),
                    error: "No LLM handler configured".to_string(),
                    request_event: event,
                })
                .await;
            return;
        };

        let outcome = handler
            .handle(
                event.messages.clone(),
                event.tool_schemas.clone(),
                &event.agent_id,
                Arc::clone(&self.bus),
            )
            .await;

        match outcome {
            Ok(response) => {
                self.bus
                    .emit(LLMResponse {
                        agent_id: event.agent_id.clone(),
                        request_event: event,
                        response,
                    })
                    .await;
            }
            Err(err) => {
                self.bus
                    .emit(LLMRuntimeError {
                        agent_id: event.agent_id.clone(),
                        error: err.to_string(),
                        request_event: event,
                    })
                    .await;
            }
        }
    }

    async fn handle_llm_runtime_error(&self, event: LLMRuntimeError) {
        if event.request_event.retry_count < MAX_LLM_RETRIES {
            let retry = LLMRequest {
                retry_count: event.request_event.retry_count + 1,
                ..event.request_event
            };
            self.bus.emit(retry).await;
            return;
        }

        log::warn!(
            "[{}] LLM handler failed after {} retries: {}",
            event.agent_id,
            MAX_LLM_RETRIES,
            event.error
        );
        let response = vec![Message::Assistant {
            content: format!("Runtime error: {}", event.error),
        }];
        self.bus
            .emit(LLMResponse {
                agent_id: event.agent_id,
                request_event: event.request_event,
                response,
            })
            .await;
    }
}
