// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Tool-Call Loop
//!
//! Runs one chat turn against a provider. When the model asks for tools they
//! are executed through the [`ToolRuntime`], one after another in the order
//! the model emitted them, and the results are appended to the conversation
//! for a follow-up call. Usage is summed across all calls of the turn.
//!
//! In stream mode the model's text deltas and the tool lifecycle events are
//! written to one channel in the order they happen. A closed receiver means
//! the client went away: the upstream stream is dropped and any running tool
//! worker is cancelled.

mod manager;

pub use manager::{ReadyCall, ToolCallManager};

use crate::llm::{Provider, ProviderError, ProviderRequest, StreamDelta, ToolUse};
use crate::tool_runtime::{ExecutionEventKind, ToolRuntime};
use routerbox_core::{
    ChatCompletion, ChatCompletionChunk, ErrorBody, FunctionCall, StreamItem, ToolCall, ToolExchange, Usage,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything needed to run one turn
#[derive(Clone)]
pub struct LoopTurn {
    /// Shared by every chunk of the response
    pub response_id: String,
    /// Client-visible model id, echoed in envelopes
    pub model: String,
    /// Model tools run on behalf of
    pub tool_model: String,
    pub provider: Arc<dyn Provider>,
    pub request: ProviderRequest,
}

/// Result of running one tool for the model
#[derive(Debug, Clone, PartialEq)]
struct ToolRun {
    output: Value,
    error: Option<String>,
}

pub struct ToolLoop {
    runtime: Arc<ToolRuntime>,
    max_rounds: usize,
}

impl ToolLoop {
    pub fn new(runtime: Arc<ToolRuntime>, max_rounds: usize) -> Self {
        Self { runtime, max_rounds }
    }

    pub fn max_rounds(&self) -> usize {
        self.max_rounds
    }

    /// Non-streaming turn
    pub async fn complete(&self, turn: LoopTurn) -> Result<ChatCompletion, ProviderError> {
        let LoopTurn {
            response_id,
            model,
            tool_model,
            provider,
            mut request,
        } = turn;
        let mut usage = Usage::default();
        let mut round = 0;

        loop {
            let response = provider.complete(&request).await?;
            usage.add(&response.usage);

            if response.tool_uses.is_empty() || request.tools.is_empty() {
                return Ok(ChatCompletion::new(
                    response_id,
                    model,
                    response.text,
                    response.finish_reason,
                    usage,
                ));
            }
            if round >= self.max_rounds {
                warn!(model = %model, rounds = round, "Tool round limit reached, returning pending calls");
                let mut completion =
                    ChatCompletion::new(response_id, model, response.text, "tool_calls", usage);
                completion.choices[0].message.tool_calls = Some(response.tool_uses.iter().map(to_tool_call).collect());
                return Ok(completion);
            }
            round += 1;

            let mut exchanges = Vec::with_capacity(response.tool_uses.len());
            for call in &response.tool_uses {
                let run = self
                    .run_tool(&request, &tool_model, &call.id, &call.name, call.input.clone(), None)
                    .await;
                exchanges.push(ToolExchange {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                    output: run.output,
                    is_error: run.error.is_some(),
                });
            }
            debug!(model = %model, round, calls = exchanges.len(), "Tool round finished");
            request.conversation.push_tool_round(&response.text, &exchanges);
        }
    }

    /// Streaming turn.
    ///
    /// The returned channel yields chunks and tool events and closes when the
    /// turn is over; a failure is the last item, as [`StreamItem::Error`].
    pub fn stream(self: &Arc<Self>, turn: LoopTurn) -> mpsc::Receiver<StreamItem> {
        let (tx, rx) = mpsc::channel(64);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let model = turn.model.clone();
            let mut manager = ToolCallManager::new();
            let outcome = this.drive_stream(turn, &mut manager, &tx).await;

            let closing = match &outcome {
                Ok(()) => "stream ended before the tool call finished".to_string(),
                Err(Some(error)) => error.clone(),
                Err(None) => "client disconnected".to_string(),
            };
            for event in manager.close(&closing) {
                let _ = tx.send(StreamItem::Tool(event)).await;
            }
            match outcome {
                Ok(()) => {}
                Err(Some(error)) => {
                    warn!(model = %model, error = %error, "Chat stream failed");
                    let _ = tx
                        .send(StreamItem::Error(ErrorBody::new(error, "upstream_error", None)))
                        .await;
                }
                Err(None) => info!(model = %model, "Client disconnected, chat stream abandoned"),
            }
        });
        rx
    }

    /// `Err(None)` when the client went away, `Err(Some(message))` on failure
    async fn drive_stream(
        &self,
        turn: LoopTurn,
        manager: &mut ToolCallManager,
        tx: &mpsc::Sender<StreamItem>,
    ) -> Result<(), Option<String>> {
        let LoopTurn {
            response_id,
            model,
            tool_model,
            provider,
            mut request,
        } = turn;
        let emit = |item: StreamItem| async move { tx.send(item).await.map_err(|_| None::<String>) };

        emit(StreamItem::Chunk(ChatCompletionChunk::role(&response_id, &model))).await?;

        let mut usage: Option<Usage> = None;
        let mut round = 0;
        loop {
            manager.begin_round();
            let mut deltas = tokio::select! {
                _ = tx.closed() => return Err(None),
                result = provider.stream(&request) => result.map_err(|e| Some(e.to_string()))?,
            };

            let mut text = String::new();
            let mut finish_reason = None;
            loop {
                let delta = tokio::select! {
                    _ = tx.closed() => return Err(None),
                    delta = deltas.recv() => delta,
                };
                match delta {
                    None => break,
                    Some(Err(e)) => return Err(Some(e.to_string())),
                    Some(Ok(StreamDelta::Text(fragment))) => {
                        text.push_str(&fragment);
                        emit(StreamItem::Chunk(ChatCompletionChunk::content(&response_id, &model, fragment))).await?;
                    }
                    Some(Ok(StreamDelta::ToolCallStart { index, id, name })) => {
                        emit(StreamItem::Tool(manager.start(index, &id, &name))).await?;
                    }
                    Some(Ok(StreamDelta::ToolCallArgs { index, fragment })) => {
                        if !manager.append_arguments(index, &fragment) {
                            debug!(index, "Arguments for unannounced tool call dropped");
                        }
                    }
                    Some(Ok(StreamDelta::Finish { reason, usage: reported })) => {
                        finish_reason = Some(reason);
                        if let Some(reported) = reported {
                            usage.get_or_insert_with(Usage::default).add(&reported);
                        }
                    }
                }
            }

            let calls = manager.round_calls();
            if calls.is_empty() || request.tools.is_empty() || round >= self.max_rounds {
                if !calls.is_empty() {
                    warn!(model = %model, rounds = round, "Tool calls left unexecuted");
                    for call in &calls {
                        if let Some(event) = manager.failed(&call.id, "tool round limit reached") {
                            emit(StreamItem::Tool(event)).await?;
                        }
                    }
                }
                let reason = finish_reason.unwrap_or_else(|| "stop".to_string());
                emit(StreamItem::Chunk(ChatCompletionChunk::finish(&response_id, &model, reason, usage))).await?;
                return Ok(());
            }
            round += 1;

            let mut exchanges = Vec::with_capacity(calls.len());
            for call in calls {
                if let Some(event) = manager.executing(&call.id, call.input.clone()) {
                    emit(StreamItem::Tool(event)).await?;
                }
                let run = self
                    .run_tool(
                        &request,
                        &tool_model,
                        &call.id,
                        &call.name,
                        call.input.clone(),
                        Some((&mut *manager, tx)),
                    )
                    .await;
                if tx.is_closed() {
                    return Err(None);
                }
                let event = match &run.error {
                    None => manager.completed(&call.id, run.output.clone()),
                    Some(error) => manager.failed(&call.id, error.clone()),
                };
                if let Some(event) = event {
                    emit(StreamItem::Tool(event)).await?;
                }
                exchanges.push(ToolExchange {
                    id: call.id,
                    name: call.name,
                    input: call.input,
                    output: run.output,
                    is_error: run.error.is_some(),
                });
            }
            request.conversation.push_tool_round(&text, &exchanges);
        }
    }

    /// Execute one call. Failures become an `{error}` result for the model.
    ///
    /// With a progress sink, structured worker progress is forwarded as
    /// `tool_call_progress`; the worker is cancelled if the sink closes.
    async fn run_tool(
        &self,
        request: &ProviderRequest,
        model_id: &str,
        call_id: &str,
        name: &str,
        input: Value,
        mut progress: Option<(&mut ToolCallManager, &mpsc::Sender<StreamItem>)>,
    ) -> ToolRun {
        if !request.tools.iter().any(|t| t.name == name) {
            let error = format!("Tool {} is not available to this model", name);
            return ToolRun {
                output: json!({ "error": error }),
                error: Some(error),
            };
        }

        let mut handle = match self.runtime.start(name, input, Some(model_id)) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(tool = %name, call_id = %call_id, error = %e, "Tool call rejected");
                let error = e.to_string();
                return ToolRun {
                    output: json!({ "error": error }),
                    error: Some(error),
                };
            }
        };

        loop {
            let event = match progress.as_ref() {
                Some((_, tx)) => tokio::select! {
                    // dropping the handle cancels the worker
                    _ = tx.closed() => {
                        return ToolRun { output: Value::Null, error: Some("client disconnected".into()) };
                    }
                    event = handle.next_event() => event,
                },
                None => handle.next_event().await,
            };
            let Some(event) = event else { break };

            let data = match event.kind {
                ExecutionEventKind::Progress { data, structured: true } => data,
                ExecutionEventKind::Status { data } => json!({ "status": data }),
                _ => continue,
            };
            if let Some((manager, tx)) = progress.as_mut() {
                if let Some(event) = manager.progress(call_id, data) {
                    if tx.send(StreamItem::Tool(event)).await.is_err() {
                        return ToolRun {
                            output: Value::Null,
                            error: Some("client disconnected".into()),
                        };
                    }
                }
            }
        }

        let outcome = handle.wait().await;
        debug!(
            tool = %name,
            call_id = %call_id,
            execution_id = %outcome.execution_id,
            success = outcome.success,
            elapsed_ms = outcome.elapsed_ms,
            "Tool call finished"
        );
        ToolRun {
            output: outcome.to_tool_result(),
            error: if outcome.success {
                None
            } else {
                Some(outcome.error.clone().unwrap_or_else(|| format!("tool execution {}", outcome.state)))
            },
        }
    }
}

fn to_tool_call(call: &ToolUse) -> ToolCall {
    ToolCall {
        id: call.id.clone(),
        call_type: "function".to_string(),
        function: FunctionCall {
            name: call.name.clone(),
            arguments: call.input.to_string(),
        },
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ToolsConfig;
    use crate::llm::{DeltaStream, ProviderResponse};
    use parking_lot::Mutex;
    use routerbox_core::{ConfigStore, Conversation, StorePaths, ToolCallEvent, ToolDeclaration, Turn};
    use std::collections::VecDeque;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Replays canned rounds and records the requests it saw
    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<ProviderResponse>>,
        streams: Mutex<VecDeque<Vec<Result<StreamDelta, ProviderError>>>>,
        seen: Mutex<Vec<ProviderRequest>>,
    }

    #[async_trait::async_trait]
    impl Provider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            self.seen.lock().push(request.clone());
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| ProviderError::Api {
                    status: 500,
                    message: "script exhausted".into(),
                })
        }

        async fn stream(&self, request: &ProviderRequest) -> Result<DeltaStream, ProviderError> {
            self.seen.lock().push(request.clone());
            let deltas = self.streams.lock().pop_front().ok_or_else(|| ProviderError::Api {
                status: 503,
                message: "script exhausted".into(),
            })?;
            let (tx, rx) = mpsc::channel(deltas.len().max(1));
            for delta in deltas {
                tx.try_send(delta).unwrap();
            }
            Ok(rx)
        }
    }

    struct Setup {
        _dir: TempDir,
        tool_loop: Arc<ToolLoop>,
    }

    fn setup(script: &str) -> Setup {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path().join("model_config"), dir.path().join("tools"));
        fs::create_dir_all(paths.models_root().join("openai")).unwrap();
        fs::write(
            paths.models_root().join("openai").join("gpt-4o.json"),
            json!({"id": "gpt-4o", "displayName": "GPT-4o", "provider": "openai", "apiModel": "gpt-4o", "capabilities": ["text", "tools"],
                   "tools": {"enabled": true}})
            .to_string(),
        )
        .unwrap();
        let tool_dir = paths.tools_dir.join("answer");
        fs::create_dir_all(&tool_dir).unwrap();
        fs::write(tool_dir.join("config.json"), json!({"description": "The answer"}).to_string()).unwrap();
        let controller = tool_dir.join("controller");
        fs::write(&controller, format!("#!/bin/sh\n{}\n", script)).unwrap();
        fs::set_permissions(&controller, fs::Permissions::from_mode(0o755)).unwrap();

        let store = Arc::new(ConfigStore::load(paths).unwrap());
        let runtime = Arc::new(ToolRuntime::new(ToolsConfig::default(), store));
        Setup {
            _dir: dir,
            tool_loop: Arc::new(ToolLoop::new(runtime, 4)),
        }
    }

    fn turn(provider: Arc<Scripted>) -> LoopTurn {
        LoopTurn {
            response_id: "chatcmpl-test".into(),
            model: "openai/gpt-4o".into(),
            tool_model: "openai/gpt-4o".into(),
            provider,
            request: ProviderRequest {
                api_model: "gpt-4o".into(),
                conversation: Conversation {
                    system: None,
                    turns: vec![Turn::user("What is the answer?")],
                },
                tools: vec![ToolDeclaration {
                    name: "answer".into(),
                    description: "The answer".into(),
                    parameters: json!({"type": "object"}),
                }],
                temperature: None,
                max_tokens: None,
            },
        }
    }

    fn tool_round(id: &str, name: &str) -> ProviderResponse {
        ProviderResponse {
            text: "Let me check.".into(),
            tool_uses: vec![ToolUse {
                id: id.into(),
                name: name.into(),
                input: json!({"q": 1}),
            }],
            finish_reason: "tool_calls".into(),
            usage: Usage::new(10, 5),
            ..Default::default()
        }
    }

    fn final_round(text: &str) -> ProviderResponse {
        ProviderResponse {
            text: text.into(),
            finish_reason: "stop".into(),
            usage: Usage::new(20, 3),
            ..Default::default()
        }
    }

    async fn collect(mut rx: mpsc::Receiver<StreamItem>) -> Vec<StreamItem> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_complete_runs_tools_and_sums_usage() {
        let setup = setup(r#"read input; echo '{"ok": true, "value": 42}'"#);
        let provider = Arc::new(Scripted::default());
        provider.responses.lock().extend([tool_round("toolu_1", "answer"), final_round("It is 42.")]);

        let completion = setup.tool_loop.complete(turn(provider.clone())).await.unwrap();
        assert_eq!(completion.text(), "It is 42.");
        assert_eq!(completion.model, "openai/gpt-4o");
        assert_eq!(completion.usage, Usage::new(30, 8));

        let seen = provider.seen.lock();
        let follow_up = &seen[1].conversation;
        assert_eq!(follow_up.turns.len(), 3);
        assert!(matches!(
            &follow_up.turns[2].parts[0],
            routerbox_core::Part::ToolResult { tool_use_id, content, is_error: false, .. }
                if tool_use_id == "toolu_1" && content == &json!({"ok": true, "value": 42})
        ));
    }

    #[tokio::test]
    async fn test_tool_failure_is_fed_back_as_error() {
        let setup = setup("read input; echo 'boom' >&2; exit 3");
        let provider = Arc::new(Scripted::default());
        provider.responses.lock().extend([
            tool_round("toolu_1", "answer"),
            tool_round("toolu_2", "missing"),
            final_round("Sorry."),
        ]);

        let completion = setup.tool_loop.complete(turn(provider.clone())).await.unwrap();
        assert_eq!(completion.text(), "Sorry.");

        let seen = provider.seen.lock();
        let results: Vec<&Value> = seen[2]
            .conversation
            .turns
            .iter()
            .flat_map(|t| &t.parts)
            .filter_map(|p| match p {
                routerbox_core::Part::ToolResult { content, is_error: true, .. } => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 2);
        assert!(results[0]["error"].as_str().unwrap().contains("boom"));
        assert!(results[1]["error"].as_str().unwrap().contains("not available"));
    }

    #[tokio::test]
    async fn test_round_limit_returns_pending_calls() {
        let setup = setup(r#"read input; echo '{}'"#);
        let tool_loop = Arc::new(ToolLoop::new(setup.tool_loop.runtime.clone(), 1));
        let provider = Arc::new(Scripted::default());
        provider.responses.lock().extend([tool_round("a", "answer"), tool_round("b", "answer")]);

        let completion = tool_loop.complete(turn(provider)).await.unwrap();
        assert_eq!(completion.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        let calls = completion.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "b");
    }

    #[tokio::test]
    async fn test_stream_interleaves_text_and_tool_events() {
        let setup = setup(
            r#"read input
echo 'PROGRESS:{"percent": 50}'
echo '{"ok": true, "value": 42}'"#,
        );
        let provider = Arc::new(Scripted::default());
        provider.streams.lock().extend([
            vec![
                Ok(StreamDelta::Text("Checking".into())),
                Ok(StreamDelta::ToolCallStart {
                    index: 1,
                    id: "toolu_1".into(),
                    name: "answer".into(),
                }),
                Ok(StreamDelta::ToolCallArgs {
                    index: 1,
                    fragment: "{\"q\":1}".into(),
                }),
                Ok(StreamDelta::Finish {
                    reason: "tool_calls".into(),
                    usage: Some(Usage::new(10, 5)),
                }),
            ],
            vec![
                Ok(StreamDelta::Text("It is 42.".into())),
                Ok(StreamDelta::Finish {
                    reason: "stop".into(),
                    usage: Some(Usage::new(20, 3)),
                }),
            ],
        ]);

        let items = collect(setup.tool_loop.stream(turn(provider))).await;
        let labels: Vec<String> = items
            .iter()
            .map(|item| match item {
                StreamItem::Chunk(chunk) => match (&chunk.choices[0].delta.content, &chunk.choices[0].finish_reason) {
                    (Some(text), _) => format!("text:{}", text),
                    (None, Some(reason)) => format!("finish:{}", reason),
                    (None, None) => "role".to_string(),
                },
                StreamItem::Tool(event) => serde_json::to_value(event).unwrap()["type"].as_str().unwrap().to_string(),
                StreamItem::Error(_) => "error".to_string(),
            })
            .collect();
        assert_eq!(
            labels,
            vec![
                "role",
                "text:Checking",
                "tool_call_start",
                "tool_call_executing",
                "tool_call_progress",
                "tool_call_completed",
                "text:It is 42.",
                "finish:stop",
            ]
        );

        let completed = items.iter().find_map(|item| match item {
            StreamItem::Tool(ToolCallEvent::ToolCallCompleted { id, result, .. }) => Some((id, result)),
            _ => None,
        });
        assert_eq!(completed, Some((&"toolu_1".to_string(), &json!({"ok": true, "value": 42}))));
        match items.last() {
            Some(StreamItem::Chunk(chunk)) => assert_eq!(chunk.usage, Some(Usage::new(30, 8))),
            other => panic!("unexpected last item {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_follow_up_failure_ends_with_error() {
        let setup = setup(r#"read input; echo '{}'"#);
        let provider = Arc::new(Scripted::default());
        provider.streams.lock().push_back(vec![
            Ok(StreamDelta::ToolCallStart {
                index: 0,
                id: "toolu_1".into(),
                name: "answer".into(),
            }),
            Ok(StreamDelta::Finish {
                reason: "tool_calls".into(),
                usage: None,
            }),
        ]);

        let items = collect(setup.tool_loop.stream(turn(provider))).await;
        assert!(matches!(
            items.last(),
            Some(StreamItem::Error(body)) if body.error.message.contains("script exhausted")
        ));
        let starts = items
            .iter()
            .filter(|i| matches!(i, StreamItem::Tool(ToolCallEvent::ToolCallStart { .. })))
            .count();
        let terminals = items
            .iter()
            .filter(|i| matches!(i, StreamItem::Tool(e) if e.is_terminal()))
            .count();
        assert_eq!((starts, terminals), (1, 1));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_running_tool() {
        let setup = setup("read input; sleep 30; echo '{}'");
        let runtime = setup.tool_loop.runtime.clone();
        let provider = Arc::new(Scripted::default());
        provider.streams.lock().push_back(vec![
            Ok(StreamDelta::ToolCallStart {
                index: 0,
                id: "toolu_1".into(),
                name: "answer".into(),
            }),
            Ok(StreamDelta::Finish {
                reason: "tool_calls".into(),
                usage: None,
            }),
        ]);

        let mut rx = setup.tool_loop.stream(turn(provider));
        while let Some(item) = rx.recv().await {
            if matches!(item, StreamItem::Tool(ToolCallEvent::ToolCallExecuting { .. })) {
                break;
            }
        }
        drop(rx);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while runtime.active_count() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "worker was not cancelled");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}
