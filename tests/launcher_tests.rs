use std::collections::VecDeque;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use agentloop::agentloop::events::{AgentStart, LLMRequest, MessagesAdd, ToolsExecRequest};
use agentloop::agentloop::ids;
use agentloop::{
    AgentLauncher, EventBus, LLMHandler, Message, ToolFn, ToolParamSchema, ToolParamType,
    ToolSchema,
};

/// Plays back a fixed script of responses, one entry per request. When the
/// script is exhausted it keeps failing with `fallback_error` if set, or
/// answers with a marker message otherwise.
struct SeqHandler {
    script: Mutex<VecDeque<Result<Vec<Message>, String>>>,
    fallback_error: Option<String>,
}

impl SeqHandler {
    fn new(script: Vec<Result<Vec<Message>, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback_error: None,
        }
    }

    fn failing(error: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback_error: Some(error.to_string()),
        }
    }
}

#[async_trait]
impl LLMHandler for SeqHandler {
    async fn handle(
        &self,
        _messages: Vec<Message>,
        _tools: Vec<ToolSchema>,
        _agent_id: &str,
        _bus: Arc<EventBus>,
    ) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>> {
        let next = self.script.lock().pop_front();
        match next {
            Some(Ok(messages)) => Ok(messages),
            Some(Err(message)) => Err(message.into()),
            None => match &self.fallback_error {
                Some(message) => Err(message.clone().into()),
                None => Ok(vec![Message::Assistant {
                    content: "script exhausted".to_string(),
                }]),
            },
        }
    }
}

/// Answers every request with an assistant message derived from the task
/// (the first user message seen).
struct EchoTask;

#[async_trait]
impl LLMHandler for EchoTask {
    async fn handle(
        &self,
        messages: Vec<Message>,
        _tools: Vec<ToolSchema>,
        _agent_id: &str,
        _bus: Arc<EventBus>,
    ) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>> {
        let task = messages
            .iter()
            .find_map(|message| match message {
                Message::User { content } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_default();
        Ok(vec![Message::Assistant {
            content: format!("answer:{task}"),
        }])
    }
}

fn assistant(content: &str) -> Message {
    Message::Assistant {
        content: content.to_string(),
    }
}

fn tool_call(id: &str, tool: &str, arguments: &[(&str, Value)]) -> Message {
    Message::ToolCall {
        tool_call_id: id.to_string(),
        tool_name: tool.to_string(),
        arguments: arguments
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect::<Map<String, Value>>(),
    }
}

fn echo_tool() -> ToolFn {
    Arc::new(|_ctx, args| {
        Box::pin(async move { Ok(args.into_iter().next().unwrap_or(Value::Null)) })
    })
}

fn echo_params() -> Vec<ToolParamSchema> {
    vec![ToolParamSchema::new("text", ToolParamType::String).required()]
}

/// `add(a, b)`; sleeps when `a == 1` so completion order differs from
/// request order.
fn add_tool() -> ToolFn {
    Arc::new(|_ctx, args| {
        Box::pin(async move {
            let a = args.first().and_then(Value::as_i64).unwrap_or(0);
            let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
            if a == 1 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(json!(a + b))
        })
    })
}

fn add_params() -> Vec<ToolParamSchema> {
    vec![
        ToolParamSchema::new("a", ToolParamType::Integer).required(),
        ToolParamSchema::new("b", ToolParamType::Integer).required(),
    ]
}

#[tokio::test]
async fn test_single_step_tool_then_answer() {
    let primary = SeqHandler::new(vec![
        Ok(vec![tool_call("call-1", "echo", &[("text", json!("hi"))])]),
        Ok(vec![assistant("done")]),
    ]);

    let transcript: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let collector = Arc::clone(&transcript);

    let launcher = AgentLauncher::new(Arc::new(primary), Arc::new(SeqHandler::new(vec![])))
        .with_tool("echo", "Echo the input text", echo_tool(), echo_params())
        .unwrap()
        .subscribe_event(move |event: MessagesAdd| {
            let collector = Arc::clone(&collector);
            async move {
                collector.lock().extend(event.messages);
            }
        });

    let result = launcher.run("go").await;
    assert_eq!(result, "\ndone");

    launcher.close(Duration::from_secs(5)).await.unwrap();

    // User, ToolCall, ToolResult, Assistant.
    let transcript = transcript.lock();
    assert_eq!(transcript.len(), 4);
    assert!(transcript.contains(&Message::User {
        content: "go".to_string()
    }));
    assert!(transcript.contains(&Message::ToolResult {
        tool_call_id: "call-1".to_string(),
        tool_name: "echo".to_string(),
        result: "hi".to_string(),
    }));
    assert!(transcript.contains(&assistant("done")));
}

#[tokio::test]
async fn test_parallel_tool_results_keep_request_order() {
    let primary = SeqHandler::new(vec![
        Ok(vec![
            // The first call sleeps, so the second finishes first.
            tool_call("call-1", "add", &[("a", json!(1)), ("b", json!(2))]),
            tool_call("call-2", "add", &[("a", json!(3)), ("b", json!(4))]),
        ]),
        Ok(vec![assistant("summed")]),
    ]);

    let batches: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let collector = Arc::clone(&batches);

    let launcher = AgentLauncher::new(Arc::new(primary), Arc::new(SeqHandler::new(vec![])))
        .with_tool("add", "Adds two numbers", add_tool(), add_params())
        .unwrap()
        .subscribe_event(move |event: MessagesAdd| {
            let collector = Arc::clone(&collector);
            async move {
                let results: Vec<String> = event
                    .messages
                    .iter()
                    .filter_map(|message| match message {
                        Message::ToolResult { result, .. } => Some(result.clone()),
                        _ => None,
                    })
                    .collect();
                if !results.is_empty() {
                    collector.lock().push(results);
                }
            }
        });

    let result = launcher.run("sum things").await;
    assert_eq!(result, "\nsummed");

    launcher.close(Duration::from_secs(5)).await.unwrap();

    let batches = batches.lock();
    assert_eq!(batches.as_slice(), &[vec!["3".to_string(), "7".to_string()]]);
}

#[tokio::test]
async fn test_sub_agent_delegation() {
    let primary = SeqHandler::new(vec![
        Ok(vec![tool_call(
            "call-1",
            ids::SUB_AGENT_TOOL_NAME,
            &[("task", json!("t")), ("toolNameList", json!(["calc"]))],
        )]),
        Ok(vec![assistant("final:42")]),
    ]);
    let sub = SeqHandler::new(vec![Ok(vec![assistant("42")])]);

    let launcher = AgentLauncher::new(Arc::new(primary), Arc::new(sub))
        .with_tool("calc", "Calculates", add_tool(), add_params())
        .unwrap();

    let result = launcher.run("delegate").await;
    assert_eq!(result, "\nfinal:42");

    launcher.close(Duration::from_secs(5)).await.unwrap();
    assert_eq!(launcher.tool_runtime().pending_sub_agents(), 0);
    assert_eq!(launcher.agent_runtime().agent_count().await, 0);
}

#[tokio::test]
async fn test_llm_retry_then_success() {
    let primary = SeqHandler::new(vec![
        Err("flaky".to_string()),
        Err("flaky".to_string()),
        Err("flaky".to_string()),
        Ok(vec![assistant("ok")]),
    ]);

    let requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&requests);

    let launcher = AgentLauncher::new(Arc::new(primary), Arc::new(SeqHandler::new(vec![])))
        .subscribe_event(move |_event: LLMRequest| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

    let result = launcher.run("try hard").await;
    assert_eq!(result, "\nok");

    launcher.close(Duration::from_secs(5)).await.unwrap();
    assert_eq!(requests.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_llm_failure_exhausts_retries() {
    let primary = SeqHandler::failing("model down");

    let launcher = AgentLauncher::new(Arc::new(primary), Arc::new(SeqHandler::new(vec![])));

    let result = launcher.run("doomed").await;
    assert_eq!(result, "\nRuntime error: model down");

    launcher.close(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_no_tool_calls_skips_tool_execution() {
    let primary = SeqHandler::new(vec![Ok(vec![assistant("direct")])]);

    let exec_requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&exec_requests);

    let launcher = AgentLauncher::new(Arc::new(primary), Arc::new(SeqHandler::new(vec![])))
        .subscribe_event(move |_event: ToolsExecRequest| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

    let result = launcher.run("just answer").await;
    assert_eq!(result, "\ndirect");

    launcher.close(Duration::from_secs(5)).await.unwrap();
    assert_eq!(exec_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_concurrent_runs_are_independent() {
    let ids_seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let collector = Arc::clone(&ids_seen);
    let launcher = Arc::new(
        AgentLauncher::new(Arc::new(EchoTask), Arc::new(EchoTask)).subscribe_event(
            move |event: AgentStart| {
                let collector = Arc::clone(&collector);
                async move {
                    collector.lock().push(event.agent_id);
                }
            },
        ),
    );

    let mut runs = Vec::new();
    for task in ["alpha", "beta", "gamma"] {
        let launcher = Arc::clone(&launcher);
        runs.push(tokio::spawn(
            async move { (task, launcher.run(task).await) },
        ));
    }
    for run in runs {
        let (task, result) = run.await.unwrap();
        assert_eq!(result, format!("\nanswer:{task}"));
    }

    launcher.close(Duration::from_secs(5)).await.unwrap();

    let mut ids_seen = ids_seen.lock().clone();
    ids_seen.sort();
    assert_eq!(ids_seen, vec!["agent0", "agent1", "agent2"]);
}

#[tokio::test]
async fn test_identity_response_handler_changes_nothing() {
    let script = || {
        SeqHandler::new(vec![
            Ok(vec![tool_call("call-1", "echo", &[("text", json!("hi"))])]),
            Ok(vec![assistant("done")]),
        ])
    };

    let count_messages = |launcher: AgentLauncher| {
        let transcript: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let collector = Arc::clone(&transcript);
        let launcher = launcher.subscribe_event(move |event: MessagesAdd| {
            let collector = Arc::clone(&collector);
            async move {
                collector.lock().extend(event.messages);
            }
        });
        (launcher, transcript)
    };

    let (plain, plain_transcript) = count_messages(
        AgentLauncher::new(Arc::new(script()), Arc::new(SeqHandler::new(vec![])))
            .with_tool("echo", "Echo the input text", echo_tool(), echo_params())
            .unwrap(),
    );
    let (hooked, hooked_transcript) = count_messages(
        AgentLauncher::new(Arc::new(script()), Arc::new(SeqHandler::new(vec![])))
            .with_tool("echo", "Echo the input text", echo_tool(), echo_params())
            .unwrap()
            .with_response_message_handler(|messages| messages),
    );

    assert_eq!(plain.run("go").await, "\ndone");
    assert_eq!(hooked.run("go").await, "\ndone");
    plain.close(Duration::from_secs(5)).await.unwrap();
    hooked.close(Duration::from_secs(5)).await.unwrap();

    let mut plain_transcript = plain_transcript.lock().clone();
    let mut hooked_transcript = hooked_transcript.lock().clone();
    let key = |message: &Message| serde_json::to_string(message).unwrap_or_default();
    plain_transcript.sort_by_key(key);
    hooked_transcript.sort_by_key(key);
    assert_eq!(plain_transcript, hooked_transcript);
}

#[tokio::test]
async fn test_conversation_handler_sees_final_transcript() {
    let primary = SeqHandler::new(vec![Ok(vec![assistant("short answer")])]);

    let seen: Arc<Mutex<Option<Vec<Message>>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);

    let launcher = AgentLauncher::new(Arc::new(primary), Arc::new(SeqHandler::new(vec![])))
        .with_conversation_handler(move |history| {
            *sink.lock() = Some(history.clone());
            history
        });

    let result = launcher.run("quick question").await;
    assert_eq!(result, "\nshort answer");

    launcher.close(Duration::from_secs(5)).await.unwrap();

    let transcript = seen.lock().clone().expect("conversation handler not called");
    assert_eq!(transcript.len(), 2);
    assert!(transcript.contains(&Message::User {
        content: "quick question".to_string()
    }));
    assert!(transcript.contains(&assistant("short answer")));

    // The history entry is dropped once the task finishes.
    assert!(launcher.message_runtime().history("agent0").await.is_none());
}

#[tokio::test]
async fn test_run_with_history_seeds_conversation() {
    /// Answers with the number of request messages, exposing what the agent
    /// actually sent.
    struct CountMessages;

    #[async_trait]
    impl LLMHandler for CountMessages {
        async fn handle(
            &self,
            messages: Vec<Message>,
            _tools: Vec<ToolSchema>,
            _agent_id: &str,
            _bus: Arc<EventBus>,
        ) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>> {
            Ok(vec![Message::Assistant {
                content: messages.len().to_string(),
            }])
        }
    }

    let launcher = AgentLauncher::new(Arc::new(CountMessages), Arc::new(CountMessages));

    let history = vec![
        Message::User {
            content: "earlier".to_string(),
        },
        assistant("earlier answer"),
    ];
    // System + 2 prior + User(task) = 4.
    let result = launcher.run_with_history("again", history).await;
    assert_eq!(result, "\n4");

    launcher.close(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_tool_registration_fails() {
    let launcher = AgentLauncher::new(
        Arc::new(SeqHandler::new(vec![])),
        Arc::new(SeqHandler::new(vec![])),
    )
    .with_tool("echo", "Echo the input text", echo_tool(), echo_params())
    .unwrap();

    let err = launcher
        .with_tool("echo", "Echo the input text", echo_tool(), echo_params())
        .unwrap_err();
    assert_eq!(err.to_string(), "tool 'echo' is already registered");
}

#[tokio::test]
async fn test_disabled_sub_agent_tool_is_not_offered() {
    /// Captures the tool schemas offered on the first request.
    struct CaptureTools {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl LLMHandler for CaptureTools {
        async fn handle(
            &self,
            _messages: Vec<Message>,
            tools: Vec<ToolSchema>,
            _agent_id: &str,
            _bus: Arc<EventBus>,
        ) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>> {
            *self.seen.lock() = tools.into_iter().map(|schema| schema.name).collect();
            Ok(vec![Message::Assistant {
                content: "noted".to_string(),
            }])
        }
    }

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let launcher = AgentLauncher::new(
        Arc::new(CaptureTools {
            seen: Arc::clone(&seen),
        }),
        Arc::new(SeqHandler::new(vec![])),
    )
    .with_tool("echo", "Echo the input text", echo_tool(), echo_params())
    .unwrap()
    .disable_sub_agent_tool();

    launcher.run("peek").await;
    launcher.close(Duration::from_secs(5)).await.unwrap();

    let seen = seen.lock();
    assert!(seen.contains(&"echo".to_string()));
    assert!(!seen.iter().any(|name| name == ids::SUB_AGENT_TOOL_NAME));
}
