// src/lib.rs

// Import the top-level `agentloop` module.
pub mod agentloop;

// Re-exporting key items for easier external access.
pub use agentloop::event_bus::{Event, EventBus, VerboseLevel};
pub use agentloop::launcher::AgentLauncher;
pub use agentloop::llm_runtime::LLMHandler;
pub use agentloop::messages::{Message, ToolParamSchema, ToolParamType, ToolSchema};
pub use agentloop::tool_runtime::{ToolContext, ToolFn};
