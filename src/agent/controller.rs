//! Loop controller - the agent's turn state machine
//!
//! The controller is synchronous and does no I/O. It turns user input into
//! request bodies, consumes responses, decides which tool calls to run and
//! when to continue. The [`AgentClient`](super::AgentClient) actor performs the
//! HTTP exchanges and tool executions it asks for, tagging every result with
//! the epoch it was started under so that results from a cancelled turn are
//! dropped.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::Error;
use crate::tools::{
    call_signature, parse_arguments, Capability, PolicyHint, RepeatPolicy, Tool, ToolDefinition,
    ToolRegistry, ToolResult,
};
use crate::Result;

use super::event::{AgentEvent, TurnOutcome};
use super::message::{ConversationMessage, Role, ToolCall};
use super::protocol::{
    self, encode_tool_calls, is_reasoning_summary_unsupported, strip_reasoning_summary,
    ProviderMode, RequestOptions, TerminalStatus,
};
use super::state::{Checkpoint, ConversationState};
use super::transport::{HttpRequest, HttpResponse};

/// Shown in place of the assistant text when a response only requests tools
const EXECUTING_TOOLS_MESSAGE: &str = "Executing tools...";

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingResponse,
    ExecutingTools,
}

/// Per-client settings the controller needs
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub mode: ProviderMode,
    pub model: String,
    pub instructions: String,
    pub max_iterations: usize,
    pub max_tool_result_size: usize,
    pub repeat_policy: RepeatPolicy,
    pub policy_hints: bool,
}

impl ControllerConfig {
    pub fn from_settings(settings: &Settings, instructions: String) -> Self {
        Self {
            url: settings.effective_url(),
            api_key: settings.resolved_api_key(),
            mode: settings.provider_mode(),
            model: settings.model.clone(),
            instructions,
            max_iterations: settings.iteration_cap(),
            max_tool_result_size: settings.max_tool_result_size,
            repeat_policy: settings.repeat_policy,
            policy_hints: settings.policy_hints,
        }
    }
}

/// A request to put on the wire, tagged with the epoch it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub epoch: u64,
    pub request: HttpRequest,
}

/// What the driver should do next
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Send(Outbound),
    /// Run these calls in order, then call [`LoopController::finish_dispatch`]
    Dispatch(Vec<ToolCall>),
    /// Asynchronous tools are still running
    Wait,
    Idle,
}

/// How to run one tool call
pub enum ToolPlan {
    /// Run now and report before starting the next call
    Inline(Arc<dyn Tool>, Value),
    /// Run on a spawned task; report whenever it finishes
    Background(Arc<dyn Tool>, Value),
    /// Already answered without running the tool
    Answered,
}

/// Turn state machine over one conversation
pub struct LoopController {
    config: ControllerConfig,
    registry: Arc<ToolRegistry>,
    definitions: Vec<ToolDefinition>,
    state: ConversationState,
    phase: Phase,
    epoch: u64,
    checkpoint: Option<Checkpoint>,
    reasoning_summary: bool,
    last_body: Option<Value>,
    soft_retry_used: bool,
    /// A dispatch batch is being handed out and not all inline calls are done
    dispatching: bool,
    pending_async: HashSet<String>,
    warned_calls: HashSet<String>,
    carried_images: Vec<Vec<u8>>,
    events: Vec<AgentEvent>,
}

impl LoopController {
    pub fn new(config: ControllerConfig, registry: Arc<ToolRegistry>) -> Self {
        let definitions = registry.definitions();
        Self {
            config,
            registry,
            definitions,
            state: ConversationState::new(),
            phase: Phase::Idle,
            epoch: 0,
            checkpoint: None,
            reasoning_summary: true,
            last_body: None,
            soft_retry_used: false,
            dispatching: false,
            pending_async: HashSet::new(),
            warned_calls: HashSet::new(),
            carried_images: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn mode(&self) -> ProviderMode {
        self.config.mode
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn history(&self) -> Vec<ConversationMessage> {
        self.state.messages().to_vec()
    }

    /// Take the notifications produced since the last drain.
    pub fn drain_events(&mut self) -> Vec<AgentEvent> {
        std::mem::take(&mut self.events)
    }

    /// Start a turn with user text, or continue the current one with empty text.
    ///
    /// Continuing counts one iteration; past the cap the turn ends with
    /// [`Error::LoopLimit`] and nothing is sent.
    pub fn send_message(&mut self, text: &str, images: Vec<Vec<u8>>) -> Result<Outbound> {
        let is_continuation = text.trim().is_empty();

        if is_continuation {
            match self.phase {
                Phase::ExecutingTools if self.dispatching || !self.pending_async.is_empty() => {
                    return Err(Error::InvalidState("Tool calls are still running".to_string()));
                }
                Phase::ExecutingTools => {}
                Phase::AwaitingResponse => return Err(Error::Busy),
                Phase::Idle => return Err(Error::InvalidState("Nothing to continue".to_string())),
            }
        } else if self.phase != Phase::Idle {
            return Err(Error::Busy);
        }

        if self.config.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(Error::Config(format!(
                "No API key configured (set api_key in {} or {})",
                crate::config::config_path().display(),
                crate::config::API_KEY_ENV
            )));
        }

        if is_continuation {
            let count = self.state.increment_iterations();
            if count > self.config.max_iterations {
                warn!("Iteration cap of {} reached", self.config.max_iterations);
                let max = self.config.max_iterations;
                self.checkpoint = None;
                self.reset_turn();
                return Err(Error::LoopLimit { max });
            }
            debug!("Continuation {}/{}", count, self.config.max_iterations);
        } else {
            self.state.begin_task();
            if self.state.is_empty() {
                self.state.start_fresh();
            }
            self.checkpoint = Some(self.state.checkpoint());
            self.state.append(ConversationMessage::user(text))?;
            info!("New user message ({} chars)", text.chars().count());
        }

        let options = RequestOptions {
            model: &self.config.model,
            instructions: &self.config.instructions,
            reasoning_summary: self.reasoning_summary,
            policy_hints: self.config.policy_hints,
        };
        let body = protocol::build_request(
            &self.state,
            &images,
            &self.definitions,
            self.config.mode,
            &options,
        );

        let outbound = self.outbound(&body);
        self.last_body = Some(body);
        self.soft_retry_used = false;
        self.phase = Phase::AwaitingResponse;
        Ok(outbound)
    }

    /// Consume the transport outcome for a request sent under `epoch`.
    pub fn on_response(&mut self, epoch: u64, result: Result<HttpResponse>) -> Step {
        if epoch != self.epoch || self.phase != Phase::AwaitingResponse {
            debug!("Dropping stale response (epoch {}, current {})", epoch, self.epoch);
            return Step::Wait;
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => return self.fail(e.to_string()),
        };

        if !response.is_success() {
            if let Some(step) = self.retry_without_summary(&response) {
                return step;
            }
            return self.fail(format!("HTTP {}: {}", response.status, response.body));
        }

        let parsed = match protocol::parse_response(&response.body, self.config.mode) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(e.to_string()),
        };

        match parsed.status() {
            TerminalStatus::Completed => {}
            TerminalStatus::Failed(reason) => return self.fail(reason),
            TerminalStatus::Cancelled => {
                return self.fail("Response was cancelled by the provider".to_string());
            }
        }

        if parsed.continuation_token.is_some() {
            self.state.set_continuation_token(parsed.continuation_token.clone());
        }

        for summary in parsed.reasoning() {
            self.emit(AgentEvent::Reasoning(summary.to_string()));
        }

        let text = parsed.text();
        let (server_calls, client_calls): (Vec<ToolCall>, Vec<ToolCall>) = parsed
            .tool_calls()
            .into_iter()
            .partition(|call| self.registry.is_server_executed(&call.name));

        for call in &server_calls {
            debug!("Provider executed {}", call.name);
            self.emit(AgentEvent::ToolCall {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
        }

        if client_calls.is_empty() {
            let outcome = if !server_calls.is_empty() {
                TurnOutcome::ServerHandled
            } else if !text.is_empty() {
                TurnOutcome::Completed
            } else {
                TurnOutcome::NoContent
            };
            if !text.is_empty() {
                self.record_assistant(ConversationMessage::assistant(text));
            }
            self.state.mark_sent();
            return self.finish(outcome);
        }

        let ids: Vec<String> = client_calls.iter().map(|call| call.id.clone()).collect();
        let payload = encode_tool_calls(&client_calls);
        let message = ConversationMessage::assistant_with_tools(&text, ids, payload);
        let display = if text.is_empty() { EXECUTING_TOOLS_MESSAGE.to_string() } else { text };
        if let Err(e) = self.state.append(message.clone()) {
            return self.fail(e.to_string());
        }
        self.state.mark_sent();
        self.emit(AgentEvent::Message {
            role: Role::Assistant,
            content: display,
            tool_call_ids: message.tool_call_ids,
        });

        info!("Model requested {} tool call(s)", client_calls.len());
        self.phase = Phase::ExecutingTools;
        self.dispatching = true;
        Step::Dispatch(client_calls)
    }

    /// Decide how to run one requested call.
    ///
    /// Calls that cannot run (unknown tool, bad arguments, blocked repeat) are
    /// answered here with an error result.
    pub fn begin_tool(&mut self, call: &ToolCall) -> ToolPlan {
        let repeated = !self.state.record_signature(call_signature(&call.name, &call.arguments));
        self.emit(AgentEvent::ToolCall {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let epoch = self.epoch;
        let Some(tool) = self.registry.get(&call.name) else {
            warn!("Model requested unknown tool '{}'", call.name);
            let message = format!("Unknown tool: {}", call.name);
            self.complete_tool(epoch, call, Err(Error::Tool(message)));
            return ToolPlan::Answered;
        };

        if repeated {
            match self.config.repeat_policy {
                RepeatPolicy::Allow => debug!("Repeated call to {}", call.name),
                RepeatPolicy::Warn => {
                    warn!("Repeated call to {} with identical arguments", call.name);
                    self.warned_calls.insert(call.id.clone());
                }
                RepeatPolicy::Block => {
                    warn!("Blocking repeated call to {}", call.name);
                    let message = format!(
                        "Blocked: {} was already called with identical arguments in this task",
                        call.name
                    );
                    self.complete_tool(epoch, call, Err(Error::Tool(message)));
                    return ToolPlan::Answered;
                }
            }
        }

        let params = match parse_arguments(&call.arguments) {
            Ok(params) => params,
            Err(e) => {
                self.complete_tool(epoch, call, Err(e));
                return ToolPlan::Answered;
            }
        };

        match tool.capability() {
            Capability::Asynchronous => {
                self.pending_async.insert(call.id.clone());
                ToolPlan::Background(tool, params)
            }
            _ => ToolPlan::Inline(tool, params),
        }
    }

    /// Record the outcome of a call started under `epoch`.
    pub fn complete_tool(&mut self, epoch: u64, call: &ToolCall, outcome: Result<String>) {
        if epoch != self.epoch || self.phase != Phase::ExecutingTools {
            debug!("Dropping stale result for call {}", call.id);
            return;
        }
        self.pending_async.remove(&call.id);

        let raw_output = match outcome {
            Ok(output) => output,
            Err(e) => {
                warn!("Tool {} failed: {}", call.name, e);
                error_result(e)
            }
        };

        let class = self.registry.class(&call.name);
        let mut result = ToolResult::new(raw_output, class, self.config.max_tool_result_size);
        result.policy_hint = self.state.heuristics().advise(class, &result.raw_output);
        self.state.heuristics_mut().observe(class, &result.raw_output);

        let mut hints: Vec<PolicyHint> = result.policy_hint.into_iter().collect();
        if self.warned_calls.remove(&call.id) {
            hints.push(PolicyHint::RepeatedCall);
        }
        self.carried_images.append(&mut result.side_effect_images);

        let message =
            ConversationMessage::tool_result(&call.id, result.for_history).with_hints(hints);
        if let Err(e) = self.state.append(message) {
            error!("{}", e);
            return;
        }

        self.emit(AgentEvent::ToolResult {
            call_id: call.id.clone(),
            result: result.raw_output,
        });
    }

    /// Every inline call of the batch has reported.
    pub fn finish_dispatch(&mut self) -> Step {
        if self.phase != Phase::ExecutingTools {
            return Step::Wait;
        }
        self.dispatching = false;
        self.try_continue()
    }

    /// Continue the turn once no tool is outstanding.
    pub fn try_continue(&mut self) -> Step {
        if self.phase != Phase::ExecutingTools
            || self.dispatching
            || !self.pending_async.is_empty()
        {
            return Step::Wait;
        }

        let images = std::mem::take(&mut self.carried_images);
        match self.send_message("", images) {
            Ok(outbound) => Step::Send(outbound),
            Err(Error::LoopLimit { max }) => {
                self.emit(AgentEvent::TurnFinished(TurnOutcome::LoopLimit { max }));
                Step::Idle
            }
            Err(e) => self.fail(e.to_string()),
        }
    }

    /// Abandon the current turn and roll back to where it started.
    pub fn cancel(&mut self) {
        self.epoch += 1;
        if self.phase == Phase::Idle {
            return;
        }

        info!("Cancelling turn");
        if let Some(checkpoint) = self.checkpoint.take() {
            self.state.restore(checkpoint);
        }
        self.reset_turn();
        self.emit(AgentEvent::TurnFinished(TurnOutcome::Cancelled));
    }

    /// Forget the whole conversation.
    pub fn clear(&mut self) {
        let was_active = self.phase != Phase::Idle;
        self.epoch += 1;
        self.state.clear();
        self.checkpoint = None;
        self.reset_turn();
        if was_active {
            self.emit(AgentEvent::TurnFinished(TurnOutcome::Cancelled));
        }
        info!("Conversation cleared");
    }

    fn outbound(&self, body: &Value) -> Outbound {
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(key) = &self.config.api_key {
            headers.push(("Authorization".to_string(), format!("Bearer {}", key)));
        }

        Outbound {
            epoch: self.epoch,
            request: HttpRequest {
                url: self.config.url.clone(),
                headers,
                body: body.to_string(),
            },
        }
    }

    /// Resend the cached body once without `reasoning.summary` if the provider rejected it.
    fn retry_without_summary(&mut self, response: &HttpResponse) -> Option<Step> {
        if self.config.mode != ProviderMode::Stateful
            || self.soft_retry_used
            || !is_reasoning_summary_unsupported(response.status, &response.body)
        {
            return None;
        }

        let mut body = self.last_body.clone()?;
        strip_reasoning_summary(&mut body);
        warn!("Provider rejected reasoning summaries; retrying without them");
        self.reasoning_summary = false;
        self.soft_retry_used = true;

        let outbound = self.outbound(&body);
        self.last_body = Some(body);
        Some(Step::Send(outbound))
    }

    fn record_assistant(&mut self, message: ConversationMessage) {
        self.emit(AgentEvent::Message {
            role: Role::Assistant,
            content: message.content.clone(),
            tool_call_ids: Vec::new(),
        });
        if let Err(e) = self.state.append(message) {
            error!("{}", e);
        }
    }

    fn finish(&mut self, outcome: TurnOutcome) -> Step {
        debug!("Turn finished: {:?}", outcome);
        self.checkpoint = None;
        self.reset_turn();
        self.emit(AgentEvent::TurnFinished(outcome));
        Step::Idle
    }

    fn fail(&mut self, reason: String) -> Step {
        error!("Turn failed: {}", reason);
        if let Some(checkpoint) = self.checkpoint.take() {
            self.state.restore(checkpoint);
        }
        self.reset_turn();
        self.emit(AgentEvent::TurnFinished(TurnOutcome::Failed(reason)));
        Step::Idle
    }

    fn reset_turn(&mut self) {
        self.phase = Phase::Idle;
        self.state.reset_iterations();
        self.dispatching = false;
        self.pending_async.clear();
        self.warned_calls.clear();
        self.carried_images.clear();
        self.last_body = None;
        self.soft_retry_used = false;
    }

    fn emit(&mut self, event: AgentEvent) {
        self.events.push(event);
    }
}

/// Structured result for a call that failed or could not run
fn error_result(error: Error) -> String {
    let message = match error {
        Error::Tool(message) => message,
        other => other.to_string(),
    };
    json!({"status": "error", "message": message}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{StaticTool, ToolClass};

    const PNG: &str = "iVBORw0KGgo=";

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(
            StaticTool::new("scene_query", r#"[{"name":"PointLight_1"}]"#).with_class(ToolClass::Verification),
        );
        registry.register(
            StaticTool::new("python_execute", r#"{"status":"ok","message":"Done","details":{}}"#)
                .with_class(ToolClass::CodeExecution),
        );
        registry.register(StaticTool::new("viewport_screenshot", PNG).with_class(ToolClass::Capture));
        registry.register(
            StaticTool::new("replicate_generate", r#"{"status":"success"}"#)
                .with_capability(Capability::Asynchronous)
                .with_class(ToolClass::Generation),
        );
        registry.register(StaticTool::new("web_search", "").with_capability(Capability::ServerExecuted));
        registry.register(StaticTool::new("file_search", "").with_capability(Capability::ServerExecuted));
        Arc::new(registry)
    }

    fn config(mode: ProviderMode) -> ControllerConfig {
        let url = match mode {
            ProviderMode::Stateful => "https://api.example.com/v1/responses",
            ProviderMode::Stateless => "https://api.example.com/v1/chat/completions",
        };
        ControllerConfig {
            url: url.to_string(),
            api_key: Some("sk-test".to_string()),
            mode,
            model: "gpt-4o".to_string(),
            instructions: "You are an editor assistant.".to_string(),
            max_iterations: 25,
            max_tool_result_size: 10000,
            repeat_policy: RepeatPolicy::Allow,
            policy_hints: true,
        }
    }

    fn controller(mode: ProviderMode) -> LoopController {
        LoopController::new(config(mode), registry())
    }

    fn ok(body: Value) -> Result<HttpResponse> {
        Ok(HttpResponse::new(200, body.to_string()))
    }

    fn body_of(outbound: &Outbound) -> Value {
        serde_json::from_str(&outbound.request.body).unwrap()
    }

    fn response(id: &str, output: Vec<Value>) -> Value {
        json!({"id": id, "object": "response", "status": "completed", "output": output})
    }

    fn function_call(id: &str, name: &str, arguments: &str) -> Value {
        json!({"type": "function_call", "call_id": id, "name": name, "arguments": arguments})
    }

    fn text_item(text: &str) -> Value {
        json!({"type": "message", "content": [{"type": "output_text", "text": text}]})
    }

    fn expect_send(step: Step) -> Outbound {
        match step {
            Step::Send(outbound) => outbound,
            other => panic!("expected Send, got {:?}", other),
        }
    }

    fn expect_dispatch(step: Step) -> Vec<ToolCall> {
        match step {
            Step::Dispatch(calls) => calls,
            other => panic!("expected Dispatch, got {:?}", other),
        }
    }

    /// Run a batch the way the client does, awaiting every tool in place.
    async fn run_batch(controller: &mut LoopController, calls: Vec<ToolCall>) -> Step {
        let epoch = controller.epoch();
        for call in &calls {
            match controller.begin_tool(call) {
                ToolPlan::Inline(tool, params) | ToolPlan::Background(tool, params) => {
                    let outcome = tool.execute(params).await;
                    controller.complete_tool(epoch, call, outcome);
                }
                ToolPlan::Answered => {}
            }
        }
        controller.finish_dispatch()
    }

    fn assert_results_answer_earlier_calls(history: &[ConversationMessage]) {
        for (i, message) in history.iter().enumerate() {
            if message.role != Role::Tool {
                continue;
            }
            let id = message.tool_call_id.clone().unwrap();
            assert!(
                history[..i].iter().any(|m| m.role == Role::Assistant && m.tool_call_ids.contains(&id)),
                "tool result {} has no earlier call",
                id
            );
        }
    }

    #[test]
    fn test_stateless_first_message() {
        let mut controller = controller(ProviderMode::Stateless);
        let outbound = controller.send_message("hello", vec![]).unwrap();

        let body = body_of(&outbound);
        assert_eq!(body["messages"], json!([{"role": "user", "content": "hello"}]));
        assert!(body.get("previous_response_id").is_none());
        assert_eq!(outbound.request.url, "https://api.example.com/v1/chat/completions");
        assert!(outbound.request.headers.contains(&("Authorization".to_string(), "Bearer sk-test".to_string())));

        let step = controller.on_response(
            outbound.epoch,
            ok(json!({"choices": [{"message": {"role": "assistant", "content": "Hi!"}}]})),
        );
        assert_eq!(step, Step::Idle);
        assert_eq!(controller.history().len(), 2);
        assert_eq!(controller.history()[1].content, "Hi!");
        assert!(controller.drain_events().contains(&AgentEvent::TurnFinished(TurnOutcome::Completed)));
    }

    #[tokio::test]
    async fn test_stateful_scene_query_round_trip() {
        let mut controller = controller(ProviderMode::Stateful);
        let first = controller.send_message("Where are the lights?", vec![]).unwrap();
        assert_eq!(body_of(&first)["input"], json!([{"role": "user", "content": "Where are the lights?"}]));
        assert_eq!(body_of(&first)["instructions"], "You are an editor assistant.");

        let calls = expect_dispatch(controller.on_response(
            first.epoch,
            ok(response("resp_1", vec![function_call("c1", "scene_query", r#"{"class_contains":"Light"}"#)])),
        ));
        assert_eq!(calls.len(), 1);
        assert_eq!(controller.history()[1].tool_call_ids, vec!["c1".to_string()]);

        let second = expect_send(run_batch(&mut controller, calls).await);
        let body = body_of(&second);
        assert_eq!(body["previous_response_id"], "resp_1");
        let input = body["input"].as_array().unwrap();
        assert_eq!(input.len(), 1);
        assert_eq!(input[0]["type"], "function_call_output");
        assert_eq!(input[0]["call_id"], "c1");
        let output = input[0]["output"].as_str().unwrap();
        assert!(output.starts_with(r#"[{"name":"PointLight_1"}]"#));
        assert!(output.contains("evaluate whether the user's request has been completed"));
        assert_eq!(controller.state().iteration_count(), 1);

        let step = controller.on_response(second.epoch, ok(response("resp_2", vec![text_item("Found one light.")])));
        assert_eq!(step, Step::Idle);
        assert_eq!(controller.phase(), Phase::Idle);
        assert_eq!(controller.state().continuation_token(), Some("resp_2"));
        assert_eq!(controller.state().iteration_count(), 0);
        assert_results_answer_earlier_calls(&controller.history());
    }

    #[test]
    fn test_server_executed_calls_end_turn() {
        let mut controller = controller(ProviderMode::Stateful);
        let outbound = controller.send_message("Search the docs", vec![]).unwrap();
        controller.drain_events();

        let step = controller.on_response(outbound.epoch, ok(response("resp_1", vec![
            json!({"type": "web_search_call", "id": "ws_1", "status": "completed", "action": {"query": "unreal lights"}}),
            json!({"type": "file_search_call", "id": "fs_1", "status": "completed", "queries": ["lights"]}),
        ])));

        assert_eq!(step, Step::Idle);
        assert_eq!(controller.phase(), Phase::Idle);
        assert_eq!(controller.state().iteration_count(), 0);
        assert_eq!(controller.history().len(), 1);

        let events = controller.drain_events();
        let names: Vec<&str> = events.iter()
            .filter_map(|e| match e {
                AgentEvent::ToolCall { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["web_search", "file_search"]);
        assert_eq!(events.last(), Some(&AgentEvent::TurnFinished(TurnOutcome::ServerHandled)));
    }

    #[tokio::test]
    async fn test_iteration_cap_boundary() {
        let mut config = config(ProviderMode::Stateful);
        config.max_iterations = 3;
        let mut controller = LoopController::new(config, registry());

        let mut outbound = controller.send_message("Inspect the scene", vec![]).unwrap();
        for round in 1..=3 {
            let calls = expect_dispatch(controller.on_response(
                outbound.epoch,
                ok(response(
                    &format!("resp_{}", round),
                    vec![function_call(&format!("c{}", round), "scene_query", &format!(r#"{{"max_results":{}}}"#, round))],
                )),
            ));
            outbound = expect_send(run_batch(&mut controller, calls).await);
            assert_eq!(controller.state().iteration_count(), round);
        }

        let calls = expect_dispatch(controller.on_response(
            outbound.epoch,
            ok(response("resp_4", vec![function_call("c4", "scene_query", "{}")])),
        ));
        assert_eq!(run_batch(&mut controller, calls).await, Step::Idle);
        assert_eq!(controller.phase(), Phase::Idle);
        assert_eq!(controller.state().iteration_count(), 0);
        assert!(controller.drain_events().contains(&AgentEvent::TurnFinished(TurnOutcome::LoopLimit { max: 3 })));

        // Results are kept so the user can resume
        assert_eq!(controller.history().last().unwrap().role, Role::Tool);
        assert_results_answer_earlier_calls(&controller.history());

        assert!(matches!(controller.send_message("", vec![]), Err(Error::InvalidState(_))));
        controller.send_message("keep going", vec![]).unwrap();
        assert_eq!(controller.state().iteration_count(), 0);
    }

    #[test]
    fn test_same_request_after_clear() {
        let mut controller = controller(ProviderMode::Stateful);
        let first = controller.send_message("hi", vec![]).unwrap();
        controller.on_response(first.epoch, ok(response("resp_1", vec![text_item("Hello")])));

        controller.clear();
        assert!(controller.history().is_empty());
        let second = controller.send_message("hi", vec![]).unwrap();
        assert_eq!(body_of(&first), body_of(&second));
    }

    #[tokio::test]
    async fn test_large_result_truncated_in_history_only() {
        let mut registry = ToolRegistry::new();
        registry.register(StaticTool::new("dump_scene", &"x".repeat(500)));
        let mut config = config(ProviderMode::Stateless);
        config.max_tool_result_size = 100;
        let mut controller = LoopController::new(config, Arc::new(registry));

        let outbound = controller.send_message("dump", vec![]).unwrap();
        let calls = expect_dispatch(controller.on_response(outbound.epoch, ok(json!({"choices": [{"message": {
            "role": "assistant",
            "content": null,
            "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "dump_scene", "arguments": "{}"}}]
        }}]}))));
        expect_send(run_batch(&mut controller, calls).await);

        let history = controller.history();
        let stored = &history[2].content;
        assert!(stored.starts_with(&"x".repeat(100)));
        assert!(!stored.starts_with(&"x".repeat(101)));
        assert!(stored.contains("original length: 500 characters"));

        let delivered = controller.drain_events().into_iter()
            .find_map(|e| match e {
                AgentEvent::ToolResult { result, .. } => Some(result),
                _ => None,
            })
            .unwrap();
        assert_eq!(delivered.len(), 500);
    }

    #[test]
    fn test_reasoning_summary_soft_retry() {
        let mut config = config(ProviderMode::Stateful);
        config.model = "gpt-5.1".to_string();
        let mut controller = LoopController::new(config, registry());
        let soft_error = || {
            Ok(HttpResponse::new(400, json!({"error": {
                "message": "Unsupported value",
                "param": "reasoning.summary",
                "code": "unsupported_value"
            }}).to_string()))
        };

        let first = controller.send_message("hi", vec![]).unwrap();
        assert_eq!(body_of(&first)["reasoning"]["summary"], "auto");

        let retry = expect_send(controller.on_response(first.epoch, soft_error()));
        let body = body_of(&retry);
        assert!(body["reasoning"].get("summary").is_none());
        assert_eq!(body["reasoning"]["effort"], "low");
        assert_eq!(body["input"], body_of(&first)["input"]);

        // Only one retry per request
        assert_eq!(controller.on_response(retry.epoch, soft_error()), Step::Idle);
        assert!(controller.history().is_empty());

        let next = controller.send_message("hi again", vec![]).unwrap();
        assert!(body_of(&next)["reasoning"].get("summary").is_none());
    }

    #[test]
    fn test_failure_restores_previous_turn() {
        let mut controller = controller(ProviderMode::Stateful);
        let first = controller.send_message("first", vec![]).unwrap();
        controller.on_response(first.epoch, ok(response("resp_1", vec![text_item("One")])));
        controller.drain_events();

        let second = controller.send_message("second", vec![]).unwrap();
        let step = controller.on_response(second.epoch, Ok(HttpResponse::new(500, "upstream exploded")));
        assert_eq!(step, Step::Idle);
        assert_eq!(controller.history().len(), 2);
        assert_eq!(controller.state().continuation_token(), Some("resp_1"));
        match controller.drain_events().last() {
            Some(AgentEvent::TurnFinished(TurnOutcome::Failed(reason))) => assert!(reason.contains("HTTP 500")),
            other => panic!("unexpected event {:?}", other),
        }

        let third = controller.send_message("third", vec![]).unwrap();
        let body = body_of(&third);
        assert_eq!(body["input"], json!([{"role": "user", "content": "third"}]));
        assert_eq!(body["previous_response_id"], "resp_1");
    }

    #[test]
    fn test_transport_and_parse_errors_fail_turn() {
        let mut controller = controller(ProviderMode::Stateless);
        let outbound = controller.send_message("hi", vec![]).unwrap();
        controller.on_response(outbound.epoch, ok(json!({"unexpected": true})));
        assert!(controller.history().is_empty());

        let outbound = controller.send_message("hi", vec![]).unwrap();
        controller.on_response(outbound.epoch, Err(Error::Transport("connection refused".to_string())));
        assert!(controller.history().is_empty());
        assert_eq!(controller.phase(), Phase::Idle);

        let failures = controller.drain_events().into_iter()
            .filter(|e| matches!(e, AgentEvent::TurnFinished(TurnOutcome::Failed(_))))
            .count();
        assert_eq!(failures, 2);
    }

    #[test]
    fn test_rejects_send_while_busy_or_unconfigured() {
        let mut controller = controller(ProviderMode::Stateful);
        controller.send_message("one", vec![]).unwrap();
        assert!(matches!(controller.send_message("two", vec![]), Err(Error::Busy)));
        assert_eq!(controller.history().len(), 1);

        let mut config = config(ProviderMode::Stateful);
        config.api_key = None;
        let mut unconfigured = LoopController::new(config, registry());
        assert!(matches!(unconfigured.send_message("one", vec![]), Err(Error::Config(_))));
        assert!(unconfigured.history().is_empty());
        assert_eq!(unconfigured.phase(), Phase::Idle);
    }

    #[test]
    fn test_cancel_drops_late_response() {
        let mut controller = controller(ProviderMode::Stateful);
        let outbound = controller.send_message("hi", vec![]).unwrap();

        controller.cancel();
        assert_eq!(controller.phase(), Phase::Idle);
        assert!(controller.history().is_empty());

        let step = controller.on_response(outbound.epoch, ok(response("resp_1", vec![text_item("late")])));
        assert_eq!(step, Step::Wait);
        assert!(controller.history().is_empty());
        assert_eq!(controller.drain_events(), vec![AgentEvent::TurnFinished(TurnOutcome::Cancelled)]);
    }

    #[tokio::test]
    async fn test_async_tool_continues_after_last_completion() {
        let mut controller = controller(ProviderMode::Stateful);
        let outbound = controller.send_message("Make a rock texture and apply it", vec![]).unwrap();
        let calls = expect_dispatch(controller.on_response(outbound.epoch, ok(response("resp_1", vec![
            function_call("c1", "python_execute", r#"{"code":"print(1)"}"#),
            function_call("c2", "replicate_generate", r#"{"prompt":"rock","output_kind":"image"}"#),
        ]))));

        let epoch = controller.epoch();
        let mut background = Vec::new();
        for call in &calls {
            match controller.begin_tool(call) {
                ToolPlan::Inline(tool, params) => {
                    let outcome = tool.execute(params).await;
                    controller.complete_tool(epoch, call, outcome);
                }
                ToolPlan::Background(tool, params) => background.push((call.clone(), tool, params)),
                ToolPlan::Answered => {}
            }
        }
        assert_eq!(controller.finish_dispatch(), Step::Wait);
        assert!(matches!(controller.send_message("", vec![]), Err(Error::InvalidState(_))));

        for (call, tool, params) in background {
            let outcome = tool.execute(params).await;
            controller.complete_tool(epoch, &call, outcome);
        }
        let next = expect_send(controller.try_continue());
        let input = body_of(&next)["input"].as_array().unwrap().clone();
        let ids: Vec<&str> = input.iter().map(|i| i["call_id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert!(input[0]["output"].as_str().unwrap().contains("After this python_execute"));
    }

    #[tokio::test]
    async fn test_stale_async_result_after_cancel_is_dropped() {
        let mut controller = controller(ProviderMode::Stateful);
        let outbound = controller.send_message("Make a rock texture", vec![]).unwrap();
        let calls = expect_dispatch(controller.on_response(
            outbound.epoch,
            ok(response("resp_1", vec![function_call("c1", "replicate_generate", "{}")])),
        ));

        let old_epoch = controller.epoch();
        let (tool, params) = match controller.begin_tool(&calls[0]) {
            ToolPlan::Background(tool, params) => (tool, params),
            _ => panic!("replicate_generate should run in the background"),
        };
        assert_eq!(controller.finish_dispatch(), Step::Wait);

        controller.cancel();
        let outbound = controller.send_message("new", vec![]).unwrap();
        controller.drain_events();

        let outcome = tool.execute(params.clone()).await;
        controller.complete_tool(old_epoch, &calls[0], outcome);
        assert_eq!(controller.phase(), Phase::AwaitingResponse);
        assert_eq!(controller.history().len(), 1);
        assert!(controller.drain_events().is_empty());

        // Same call id requested again in the new turn: the stale result must not answer it.
        let calls = expect_dispatch(controller.on_response(
            outbound.epoch,
            ok(response("resp_2", vec![function_call("c1", "replicate_generate", "{}")])),
        ));
        assert!(matches!(controller.begin_tool(&calls[0]), ToolPlan::Background(..)));
        assert_eq!(controller.finish_dispatch(), Step::Wait);

        let outcome = tool.execute(params).await;
        controller.complete_tool(old_epoch, &calls[0], outcome);
        assert_eq!(controller.phase(), Phase::ExecutingTools);
        assert_eq!(controller.try_continue(), Step::Wait);
        assert!(controller.history().iter().all(|m| m.tool_call_id.is_none()));
    }

    #[tokio::test]
    async fn test_repeat_policy_block() {
        let mut config = config(ProviderMode::Stateful);
        config.repeat_policy = RepeatPolicy::Block;
        let mut controller = LoopController::new(config, registry());

        let outbound = controller.send_message("Add a light", vec![]).unwrap();
        let calls = expect_dispatch(controller.on_response(outbound.epoch, ok(response("resp_1", vec![
            function_call("c1", "python_execute", r#"{"code":"spawn()"}"#),
        ]))));
        let outbound = expect_send(run_batch(&mut controller, calls).await);

        let calls = expect_dispatch(controller.on_response(outbound.epoch, ok(response("resp_2", vec![
            function_call("c2", "python_execute", r#"{ "code": "spawn()" }"#),
        ]))));
        expect_send(run_batch(&mut controller, calls).await);

        let last = controller.history().last().unwrap().clone();
        assert_eq!(last.tool_call_id.as_deref(), Some("c2"));
        let result: Value = serde_json::from_str(&last.content).unwrap();
        assert_eq!(result["status"], "error");
        assert!(result["message"].as_str().unwrap().starts_with("Blocked"));
    }

    #[tokio::test]
    async fn test_repeat_policy_warn_adds_hint() {
        let mut config = config(ProviderMode::Stateful);
        config.repeat_policy = RepeatPolicy::Warn;
        let mut controller = LoopController::new(config, registry());

        let outbound = controller.send_message("Look around", vec![]).unwrap();
        let calls = expect_dispatch(controller.on_response(outbound.epoch, ok(response("resp_1", vec![
            function_call("c1", "scene_query", "{}"),
            function_call("c2", "scene_query", "{}"),
        ]))));
        expect_send(run_batch(&mut controller, calls).await);

        let history = controller.history();
        assert!(!history[2].policy_hints.contains(&PolicyHint::RepeatedCall));
        assert!(history[3].policy_hints.contains(&PolicyHint::RepeatedCall));
        assert_eq!(history[3].content, r#"[{"name":"PointLight_1"}]"#);
    }

    #[tokio::test]
    async fn test_screenshot_attached_to_continuation() {
        let mut controller = controller(ProviderMode::Stateful);
        let outbound = controller.send_message("How does it look?", vec![]).unwrap();
        let calls = expect_dispatch(controller.on_response(outbound.epoch, ok(response("resp_1", vec![
            function_call("c1", "viewport_screenshot", "{}"),
        ]))));
        let next = expect_send(run_batch(&mut controller, calls).await);

        assert!(controller.history()[2].content.starts_with("Screenshot captured successfully"));
        let body = body_of(&next);
        assert_eq!(body["input"][0]["call_id"], "c1");
        assert_eq!(body["input"][1]["role"], "user");
        assert_eq!(body["input"][1]["content"][1]["type"], "input_image");
        assert_eq!(body["input"][1]["content"][1]["image_url"], format!("data:image/png;base64,{}", PNG));
    }

    #[tokio::test]
    async fn test_unknown_tool_answered_with_error() {
        let mut controller = controller(ProviderMode::Stateless);
        let outbound = controller.send_message("hi", vec![]).unwrap();
        let calls = expect_dispatch(controller.on_response(outbound.epoch, ok(json!({"choices": [{"message": {
            "role": "assistant",
            "content": "Let me try.",
            "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "format_disk", "arguments": "{}"}}]
        }}]}))));

        let next = expect_send(run_batch(&mut controller, calls).await);
        let messages = body_of(&next)["messages"].as_array().unwrap().clone();
        assert_eq!(messages[1]["tool_calls"][0]["id"], "c1");
        assert_eq!(messages[2]["tool_call_id"], "c1");
        assert_eq!(
            serde_json::from_str::<Value>(messages[2]["content"].as_str().unwrap()).unwrap(),
            json!({"status": "error", "message": "Unknown tool: format_disk"})
        );
        assert_results_answer_earlier_calls(&controller.history());
    }
}
