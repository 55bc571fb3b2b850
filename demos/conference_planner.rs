//! Runs three conference-planning tasks concurrently against a scripted
//! model handler, exercising tool calls and sub-agent delegation without
//! any network access.
//!
//! ```sh
//! RUST_LOG=info cargo run --example conference_planner
//! ```

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use agentloop::agentloop::events::MessagesAdd;
use agentloop::agentloop::ids;
use agentloop::{
    AgentLauncher, EventBus, LLMHandler, Message, ToolParamSchema, ToolParamType, ToolSchema,
    VerboseLevel,
};

/// Deterministic stand-in for a model: first turn delegates (primary) or
/// calls a tool (sub-agent), second turn summarizes.
struct ScriptedHandler {
    turns: Mutex<HashMap<String, usize>>,
}

impl ScriptedHandler {
    fn new() -> Self {
        Self {
            turns: Mutex::new(HashMap::new()),
        }
    }

    fn next_turn(&self, agent_id: &str) -> usize {
        let mut turns = self.turns.lock();
        let turn = turns.entry(agent_id.to_string()).or_insert(0);
        *turn += 1;
        *turn
    }
}

#[async_trait]
impl LLMHandler for ScriptedHandler {
    async fn handle(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSchema>,
        agent_id: &str,
        _bus: Arc<EventBus>,
    ) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>> {
        let turn = self.next_turn(agent_id);
        let can_delegate = tools.iter().any(|t| t.name == ids::SUB_AGENT_TOOL_NAME);

        if turn == 1 && can_delegate {
            // Primary agent, first turn: fan out two sub-agents.
            let sub_call = |id: &str, task: &str, tool: &str| Message::ToolCall {
                tool_call_id: id.to_string(),
                tool_name: ids::SUB_AGENT_TOOL_NAME.to_string(),
                arguments: Map::from_iter([
                    ("task".to_string(), json!(task)),
                    ("toolNameList".to_string(), json!([tool])),
                ]),
            };
            return Ok(vec![
                sub_call("call-1", "List suitable hosting platforms", "list_platforms"),
                sub_call(
                    "call-2",
                    "Estimate a budget for 250 attendees at $40 per seat",
                    "estimate_budget",
                ),
            ]);
        }

        if turn == 1 {
            // Sub-agent, first turn: use whichever tool it was granted.
            if let Some(tool) = tools.first() {
                let arguments = if tool.name == "estimate_budget" {
                    Map::from_iter([
                        ("attendees".to_string(), json!(250)),
                        ("price_per_seat".to_string(), json!(40.0)),
                    ])
                } else {
                    Map::new()
                };
                return Ok(vec![Message::ToolCall {
                    tool_call_id: "call-1".to_string(),
                    tool_name: tool.name.clone(),
                    arguments,
                }]);
            }
        }

        // Second turn: summarize the tool results into a final answer.
        let summary = messages
            .iter()
            .rev()
            .find_map(|message| match message {
                Message::ToolResult { result, .. } => Some(result.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "nothing to report".to_string());
        Ok(vec![Message::Assistant {
            content: format!("Done. Latest finding: {summary}"),
        }])
    }
}

fn list_platforms() -> agentloop::ToolFn {
    Arc::new(|_ctx, _args| {
        Box::pin(async move {
            Ok(json!([
                "MeetSphere",
                "Conferly",
                "StageCast",
            ]))
        })
    })
}

fn estimate_budget() -> agentloop::ToolFn {
    Arc::new(|_ctx, args| {
        Box::pin(async move {
            let attendees = args.first().and_then(Value::as_i64).unwrap_or(0);
            let price = args.get(1).and_then(Value::as_f64).unwrap_or(0.0);
            Ok(json!({
                "attendees": attendees,
                "total": attendees as f64 * price,
            }))
        })
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::init();

    let handler = Arc::new(ScriptedHandler::new());
    let launcher = AgentLauncher::new(handler.clone(), handler)
        .with_verbose_level(VerboseLevel::Basic)
        .with_tool(
            "list_platforms",
            "List online platforms suitable for hosting a conference",
            list_platforms(),
            vec![],
        )?
        .with_tool(
            "estimate_budget",
            "Estimate an event budget",
            estimate_budget(),
            vec![
                ToolParamSchema::new("attendees", ToolParamType::Integer)
                    .with_description("Expected number of attendees")
                    .required(),
                ToolParamSchema::new("price_per_seat", ToolParamType::Number)
                    .with_description("Ticket price in dollars")
                    .required(),
            ],
        )?
        .subscribe_event(|event: MessagesAdd| async move {
            for message in &event.messages {
                match message {
                    Message::User { content } => println!("[{}] user: {content}", event.agent_id),
                    Message::Assistant { content } => {
                        println!("[{}] assistant: {content}", event.agent_id)
                    }
                    Message::ToolCall { tool_name, .. } => {
                        println!("[{}] tool call: {tool_name}", event.agent_id)
                    }
                    Message::ToolResult {
                        tool_name, result, ..
                    } => println!("[{}] {tool_name} -> {result}", event.agent_id),
                    Message::System { .. } => {}
                }
            }
        });

    let launcher = Arc::new(launcher);
    let mut runs = Vec::new();
    for _ in 0..3 {
        let launcher = Arc::clone(&launcher);
        runs.push(tokio::spawn(async move {
            launcher
                .run("Help me organize a virtual conference: platforms, budget, and a summary.")
                .await
        }));
    }
    for run in runs {
        let result = run.await?;
        println!("final result:{result}");
    }

    launcher.close(std::time::Duration::from_secs(5)).await?;
    Ok(())
}
