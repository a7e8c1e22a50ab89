use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::state::{RunStatus, ToolCallStatus, TurnStatus, TurnStopReason};
use super::{Agent, BudgetLimits, PacingConfig, RunRequest, TurnDefinition};
use crate::adapters::store::SqliteLedger;
use crate::core::error::{CompletionError, RunError, ToolError};
use crate::core::ports::emitter::EmitterPort;
use crate::core::ports::llm::{
    ChatMessage, CompletionPort, CompletionRequest, CompletionResponse, ContentBlock, Role,
    StopReason, TokenUsage, ToolSchema,
};
use crate::core::ports::store::LedgerStore;
use crate::core::ports::tools::{ToolFilter, ToolPort};

const MODEL: &str = "claude-sonnet-4-5";

#[derive(Debug, Clone)]
struct RecordedRequest {
    model: String,
    system: Option<String>,
    messages: Vec<ChatMessage>,
}

#[derive(Default)]
struct ScriptedCompletion {
    script: Mutex<VecDeque<Result<CompletionResponse, CompletionError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedCompletion {
    fn new(script: Vec<Result<CompletionResponse, CompletionError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl CompletionPort for ScriptedCompletion {
    fn complete<'a>(
        &'a self,
        request: CompletionRequest<'a>,
    ) -> BoxFuture<'a, Result<CompletionResponse, CompletionError>> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(RecordedRequest {
                model: request.model.to_string(),
                system: request.system.map(str::to_string),
                messages: request.messages.to_vec(),
            });
        let next = self.script.lock().expect("script lock").pop_front();
        Box::pin(async move {
            next.unwrap_or_else(|| Err(CompletionError::Decode("script exhausted".to_string())))
        })
    }
}

#[derive(Clone)]
enum Behavior {
    Reply(Value),
    Slow(u64, Value),
    Timeout,
    Panic,
}

#[derive(Default)]
struct FakeTools {
    behaviors: HashMap<String, Behavior>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTools {
    fn new(behaviors: Vec<(&str, Behavior)>) -> Arc<Self> {
        Arc::new(Self {
            behaviors: behaviors
                .into_iter()
                .map(|(name, behavior)| (name.to_string(), behavior))
                .collect(),
            ..Self::default()
        })
    }
}

impl ToolPort for FakeTools {
    fn tool_definitions(&self, _filter: &ToolFilter) -> Vec<ToolSchema> {
        let mut names: Vec<_> = self.behaviors.keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| ToolSchema {
                name,
                description: String::new(),
                input_schema: json!({ "type": "object" }),
            })
            .collect()
    }

    fn execute<'a>(&'a self, name: &'a str, _args: Value) -> BoxFuture<'a, Result<Value, ToolError>> {
        Box::pin(async move {
            let Some(behavior) = self.behaviors.get(name).cloned() else {
                return Err(ToolError::UnknownTool(name.to_string()));
            };
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            let result = match behavior {
                Behavior::Reply(value) => Ok(value),
                Behavior::Slow(ms, value) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(value)
                }
                Behavior::Timeout => Err(ToolError::Timeout {
                    after: Duration::from_secs(30),
                    stderr: "warming model".to_string(),
                }),
                Behavior::Panic => panic!("tool adapter bug"),
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

#[derive(Default)]
struct RecordingEmitter {
    channels: Mutex<Vec<String>>,
}

impl EmitterPort for RecordingEmitter {
    fn emit(&self, channel: &str, _payload: &Value) {
        self.channels
            .lock()
            .expect("channels lock")
            .push(channel.to_string());
    }
}

fn text_response(text: &str, input: u64, output: u64) -> Result<CompletionResponse, CompletionError> {
    Ok(CompletionResponse {
        content: vec![ContentBlock::text(text)],
        stop_reason: Some(StopReason::EndTurn),
        usage: TokenUsage::new(input, output),
    })
}

fn tool_response(calls: &[(&str, &str)], input: u64, output: u64) -> Result<CompletionResponse, CompletionError> {
    let mut content = vec![ContentBlock::text("Let me check.")];
    content.extend(calls.iter().map(|(id, name)| ContentBlock::ToolUse {
        id: id.to_string(),
        name: name.to_string(),
        input: json!({ "symbol": "BTC" }),
    }));
    Ok(CompletionResponse {
        content,
        stop_reason: Some(StopReason::ToolUse),
        usage: TokenUsage::new(input, output),
    })
}

struct Harness {
    agent: Agent,
    ledger: Arc<SqliteLedger>,
    completion: Arc<ScriptedCompletion>,
    tools: Arc<FakeTools>,
    emitter: Arc<RecordingEmitter>,
}

fn harness(
    script: Vec<Result<CompletionResponse, CompletionError>>,
    tools: Vec<(&str, Behavior)>,
) -> Harness {
    let ledger = Arc::new(SqliteLedger::open_in_memory().expect("open ledger"));
    let completion = ScriptedCompletion::new(script);
    let tools = FakeTools::new(tools);
    let emitter = Arc::new(RecordingEmitter::default());
    let agent = Agent::new(
        completion.clone(),
        tools.clone(),
        ledger.clone(),
        emitter.clone(),
    );
    Harness {
        agent,
        ledger,
        completion,
        tools,
        emitter,
    }
}

fn two_turn_request() -> RunRequest {
    let mut request = RunRequest::new(
        "market-brief",
        MODEL,
        vec![
            TurnDefinition::new("gather", "Collect today's BTC price."),
            TurnDefinition::new("summarize", "Write a one-line summary."),
        ],
    );
    request.system_prompt = "You are a market analyst.".to_string();
    request.pacing = PacingConfig::Fixed { cooldown_ms: 0 };
    request
}

fn cost(input: u64, output: u64) -> f64 {
    (input as f64 * 3.0 + output as f64 * 15.0) / 1_000_000.0
}

#[tokio::test]
async fn two_turn_run_with_one_tool_call_succeeds() {
    let h = harness(
        vec![
            tool_response(&[("toolu_1", "prices__quote")], 100, 20),
            text_response("BTC trades at 64k.", 150, 30),
            text_response("BTC flat at 64k.", 200, 10),
        ],
        vec![("prices__quote", Behavior::Reply(json!({ "content": [{ "type": "text", "text": "64000" }] })))],
    );
    let request = two_turn_request();
    let run_id = request.run_id.clone();

    let outcome = h.agent.run(request).await.expect("run succeeds");
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.turns_completed, 2);
    assert_eq!(
        outcome.turns.iter().map(|t| t.tool_call_count).collect::<Vec<_>>(),
        vec![1, 0]
    );
    assert_eq!(outcome.turns[0].response_text, "Let me check.\nBTC trades at 64k.");
    assert_eq!(outcome.turns[0].steps, 2);
    assert_eq!(outcome.usage, TokenUsage::new(450, 60));

    let history = h.ledger.load_history(&run_id).expect("history");
    assert_eq!(history.run.status, RunStatus::Success);
    assert_eq!(history.run.turns_completed, 2);
    assert_eq!(history.run.input_tokens, 450);
    assert!((history.run.cost_usd - cost(450, 60)).abs() < 1e-9);
    assert_eq!(history.turns.len(), 2);
    assert_eq!(history.turns[0].turn.tool_call_count, 1);
    assert_eq!(history.turns[0].turn.stop_reason, Some(TurnStopReason::EndTurn));
    assert_eq!(history.turns[1].turn.tool_call_count, 0);
    let call = &history.turns[0].tool_calls[0];
    assert_eq!(call.call_id, "toolu_1");
    assert_eq!(call.status, ToolCallStatus::Success);
    assert!(call.duration_ms.is_some());

    let channels = h.emitter.channels.lock().expect("channels lock").clone();
    assert_eq!(channels.first().map(String::as_str), Some("agent:run_state"));
    assert_eq!(channels.last().map(String::as_str), Some("agent:run_state"));
    assert_eq!(channels.iter().filter(|c| *c == "agent:tool_start").count(), 1);
}

#[tokio::test]
async fn system_prompt_and_date_only_lead_the_first_request() {
    let h = harness(
        vec![
            tool_response(&[("toolu_1", "prices__quote")], 10, 5),
            text_response("ok", 10, 5),
            text_response("done", 10, 5),
        ],
        vec![("prices__quote", Behavior::Reply(json!("64000")))],
    );
    let mut request = two_turn_request();
    request.turns[0].rules = Some("Quote exact figures.".to_string());
    request.turns[1].model = Some("claude-haiku-4-5".to_string());
    h.agent.run(request).await.expect("run succeeds");

    let requests = h.completion.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(
        requests[0].system.as_deref(),
        Some("You are a market analyst.\n\nQuote exact figures.")
    );
    assert_eq!(requests[1].system, None);
    assert_eq!(requests[2].system, None);
    assert_eq!(requests[0].model, MODEL);
    assert_eq!(requests[2].model, "claude-haiku-4-5");

    let opening = &requests[0].messages[0];
    assert!(matches!(
        &opening.content[0],
        ContentBlock::Text { text } if text.starts_with("Current date: ")
    ));

    // Turn two sees the whole prior conversation plus its own prompt.
    let second_turn = &requests[2].messages;
    assert_eq!(second_turn.len(), 5);
    assert_eq!(second_turn[4].role, Role::User);
    assert_eq!(second_turn[4].content.len(), 1);
    assert_eq!(second_turn[4].text(), "Write a one-line summary.");
}

#[tokio::test]
async fn timed_out_tool_is_folded_back_and_run_still_succeeds() {
    let h = harness(
        vec![
            tool_response(&[("toolu_slow", "graph__query")], 100, 20),
            text_response("The graph service is unavailable.", 120, 15),
            text_response("Summary without graph data.", 90, 10),
        ],
        vec![("graph__query", Behavior::Timeout)],
    );
    let request = two_turn_request();
    let run_id = request.run_id.clone();

    let outcome = h.agent.run(request).await.expect("run succeeds");
    assert_eq!(outcome.status, RunStatus::Success);

    let history = h.ledger.load_history(&run_id).expect("history");
    let call = &history.turns[0].tool_calls[0];
    assert_eq!(call.status, ToolCallStatus::Error);
    assert!(call
        .error
        .as_deref()
        .is_some_and(|error| error.contains("timed out") && error.contains("warming model")));
    assert_eq!(history.turns[0].turn.status, TurnStatus::Success);

    let requests = h.completion.requests();
    let tool_results = &requests[1].messages.last().expect("tool results").content;
    assert!(matches!(
        &tool_results[0],
        ContentBlock::ToolResult { tool_use_id, is_error: true, .. } if tool_use_id == "toolu_slow"
    ));
}

#[tokio::test]
async fn completion_failure_in_second_turn_keeps_partial_usage() {
    let h = harness(
        vec![
            text_response("BTC at 64k.", 100, 20),
            tool_response(&[("toolu_2", "prices__quote")], 50, 10),
            Err(CompletionError::Api {
                status: 400,
                body: "prompt is too long".to_string(),
            }),
        ],
        vec![("prices__quote", Behavior::Reply(json!("64000")))],
    );
    let request = two_turn_request();
    let run_id = request.run_id.clone();

    let err = h.agent.run(request).await.expect_err("run fails");
    assert!(matches!(err, RunError::Completion(CompletionError::Api { status: 400, .. })));

    let history = h.ledger.load_history(&run_id).expect("history");
    assert_eq!(history.run.status, RunStatus::Error);
    assert_eq!(history.run.turns_completed, 1);
    assert_eq!(history.run.input_tokens, 150);
    assert_eq!(history.run.output_tokens, 30);
    assert!((history.run.cost_usd - cost(150, 30)).abs() < 1e-9);
    assert!(history
        .run
        .error
        .as_deref()
        .is_some_and(|error| error.contains("prompt is too long")));

    let failed = &history.turns[1].turn;
    assert_eq!(failed.status, TurnStatus::Error);
    assert_eq!(failed.stop_reason, Some(TurnStopReason::Error));
    assert_eq!(failed.input_tokens, 50);
    assert_eq!(history.turns[1].tool_calls[0].status, ToolCallStatus::Success);
}

#[tokio::test]
async fn step_limit_ends_turn_softly_and_next_prompt_merges() {
    let h = harness(
        vec![
            tool_response(&[("toolu_a", "prices__quote")], 10, 5),
            tool_response(&[("toolu_b", "prices__quote")], 10, 5),
            text_response("Final.", 10, 5),
        ],
        vec![("prices__quote", Behavior::Reply(json!("64000")))],
    );
    let mut request = two_turn_request();
    request.turns[0].max_steps = Some(2);
    let run_id = request.run_id.clone();

    let outcome = h.agent.run(request).await.expect("run succeeds");
    assert_eq!(outcome.turns[0].stop_reason, TurnStopReason::StepLimit);
    assert_eq!(outcome.turns[0].steps, 2);
    assert_eq!(outcome.turns[0].tool_call_count, 2);

    let history = h.ledger.load_history(&run_id).expect("history");
    assert_eq!(history.turns[0].turn.status, TurnStatus::Success);
    assert_eq!(history.turns[0].turn.stop_reason, Some(TurnStopReason::StepLimit));

    let requests = h.completion.requests();
    let last = requests[2].messages.last().expect("merged prompt");
    assert_eq!(last.role, Role::User);
    assert!(matches!(&last.content[0], ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "toolu_b"));
    assert_eq!(last.text(), "Write a one-line summary.");
}

#[tokio::test]
async fn invalid_definition_is_recorded_and_finalized_without_turns() {
    let h = harness(vec![text_response("never", 1, 1)], Vec::new());
    let mut request = two_turn_request();
    request.known_providers = vec!["prices".to_string()];
    request.turns[1].providers = Some(vec!["ghost".to_string()]);
    let run_id = request.run_id.clone();

    let err = h.agent.run(request).await.expect_err("configuration error");
    assert!(matches!(err, RunError::Configuration(ref message) if message.contains("ghost")));

    let history = h.ledger.load_history(&run_id).expect("history");
    assert_eq!(history.run.status, RunStatus::Error);
    assert!(history.turns.is_empty());
    assert!(h.completion.requests().is_empty());
}

#[tokio::test]
async fn cancellation_interrupts_a_running_tool() {
    let h = harness(
        vec![tool_response(&[("toolu_1", "index__embed")], 10, 5)],
        vec![("index__embed", Behavior::Slow(10_000, json!("never")))],
    );
    let request = two_turn_request();
    let run_id = request.run_id.clone();
    let cancel = request.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let started = std::time::Instant::now();
    let err = h.agent.run(request).await.expect_err("cancelled");
    assert!(matches!(err, RunError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));

    let history = h.ledger.load_history(&run_id).expect("history");
    assert_eq!(history.run.status, RunStatus::Error);
    let call = &history.turns[0].tool_calls[0];
    assert_eq!(call.status, ToolCallStatus::Error);
    assert_eq!(call.error.as_deref(), Some("tool call cancelled"));
}

#[tokio::test]
async fn budget_is_checked_before_each_completion() {
    let h = harness(
        vec![
            tool_response(&[("toolu_1", "prices__quote")], 80, 30),
            text_response("unreachable", 1, 1),
        ],
        vec![("prices__quote", Behavior::Reply(json!("64000")))],
    );
    let mut request = two_turn_request();
    request.budget = BudgetLimits {
        max_total_tokens: Some(100),
        max_cost_usd: None,
    };
    let run_id = request.run_id.clone();

    let err = h.agent.run(request).await.expect_err("budget exceeded");
    assert!(matches!(err, RunError::BudgetExceeded(_)));
    assert_eq!(h.completion.requests().len(), 1);

    let run = h.ledger.load_history(&run_id).expect("history").run;
    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(run.input_tokens, 80);
    assert_eq!(run.output_tokens, 30);
}

#[tokio::test]
async fn parallel_tools_keep_block_order_in_results() {
    let h = harness(
        vec![
            tool_response(
                &[("toolu_a", "slow__a"), ("toolu_b", "fast__b"), ("toolu_c", "mid__c")],
                10,
                5,
            ),
            text_response("done", 10, 5),
            text_response("done", 10, 5),
        ],
        vec![
            ("slow__a", Behavior::Slow(150, json!("a"))),
            ("fast__b", Behavior::Slow(10, json!("b"))),
            ("mid__c", Behavior::Slow(80, json!("c"))),
        ],
    );
    let mut request = two_turn_request();
    request.parallel_tool_calls = true;
    let run_id = request.run_id.clone();

    h.agent.run(request).await.expect("run succeeds");
    assert_eq!(h.tools.max_in_flight.load(Ordering::SeqCst), 3);

    let requests = h.completion.requests();
    let results: Vec<_> = requests[1]
        .messages
        .last()
        .expect("tool results")
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => Some((tool_use_id.as_str(), content.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(results, vec![("toolu_a", "a"), ("toolu_b", "b"), ("toolu_c", "c")]);

    let history = h.ledger.load_history(&run_id).expect("history");
    let calls = &history.turns[0].tool_calls;
    let started: Vec<_> = calls.iter().map(|call| call.call_id.as_str()).collect();
    assert_eq!(started, vec!["toolu_a", "toolu_b", "toolu_c"]);

    let finished = |index: usize| {
        chrono::DateTime::parse_from_rfc3339(calls[index].finished_at.as_deref().expect("finished"))
            .expect("rfc3339")
    };
    assert!(finished(1) < finished(2));
    assert!(finished(2) < finished(0));
}

#[tokio::test]
async fn panicking_tool_still_finalizes_the_run() {
    let h = harness(
        vec![tool_response(&[("toolu_1", "broken__tool")], 10, 5)],
        vec![("broken__tool", Behavior::Panic)],
    );
    let request = two_turn_request();
    let run_id = request.run_id.clone();

    let err = h.agent.run(request).await.expect_err("panic surfaces as error");
    assert!(matches!(err, RunError::Panicked(ref message) if message.contains("tool adapter bug")));

    let history = h.ledger.load_history(&run_id).expect("history");
    assert_eq!(history.run.status, RunStatus::Error);
    assert_eq!(history.run.input_tokens, 10);
    assert!(history.run.finished_at.is_some());

    let turn = &history.turns[0];
    assert_eq!(turn.turn.status, TurnStatus::Error);
    assert_eq!(turn.turn.stop_reason, Some(TurnStopReason::Error));
    assert_eq!(turn.tool_calls[0].status, ToolCallStatus::Error);
    assert!(turn.tool_calls[0]
        .error
        .as_deref()
        .is_some_and(|error| error.contains("tool adapter bug")));
}
