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

//! Ollama `/api/chat`

use crate::llm::sse::{pump, Framing, StreamParser};
use crate::llm::{
    check_status, result_text, DeltaStream, Provider, ProviderError, ProviderRequest, ProviderResponse,
    StreamDelta, ToolUse, Upstream,
};
use routerbox_core::{ImageSource, Part, Role, Usage};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    upstream: Upstream,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(upstream: Upstream, base_url: Option<String>) -> Self {
        Self {
            upstream,
            base_url: base_url.unwrap_or_else(|| OLLAMA_BASE_URL.to_string()),
        }
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        self.upstream
            .client
            .post(format!("{}/api/chat", self.base_url.trim_end_matches('/')))
            .json(body)
    }
}

pub(crate) fn build_body(request: &ProviderRequest, stream: bool) -> Value {
    let conversation = &request.conversation;
    let mut messages = Vec::new();
    if let Some(system) = conversation.system.as_deref().filter(|s| !s.is_empty()) {
        messages.push(json!({ "role": "system", "content": system }));
    }

    for turn in &conversation.turns {
        let mut text = Vec::new();
        let mut images = Vec::new();
        let mut tool_calls = Vec::new();
        for part in &turn.parts {
            match part {
                Part::Text { text: t } => text.push(t.as_str()),
                Part::Image {
                    source: ImageSource::Base64 { data, .. },
                } => images.push(data.clone()),
                Part::Image {
                    source: ImageSource::Url(url),
                } => debug!(url = %url, "Ollama accepts inline images only, dropping URL image"),
                Part::ToolUse { name, input, .. } => {
                    tool_calls.push(json!({ "function": { "name": name, "arguments": input } }))
                }
                Part::ToolResult { content, .. } => {
                    messages.push(json!({ "role": "tool", "content": result_text(content) }))
                }
            }
        }
        if text.is_empty() && images.is_empty() && tool_calls.is_empty() {
            continue;
        }

        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let mut message = json!({ "role": role, "content": text.join("\n") });
        if !images.is_empty() {
            message["images"] = json!(images);
        }
        if !tool_calls.is_empty() {
            message["tool_calls"] = Value::Array(tool_calls);
        }
        messages.push(message);
    }

    let mut body = json!({
        "model": request.api_model,
        "messages": messages,
        "stream": stream,
    });
    let mut options = serde_json::Map::new();
    if let Some(t) = request.temperature {
        options.insert("temperature".into(), json!(t));
    }
    if let Some(max) = request.max_tokens {
        options.insert("num_predict".into(), json!(max));
    }
    if !options.is_empty() {
        body["options"] = Value::Object(options);
    }
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": { "name": t.name, "description": t.description, "parameters": t.parameters },
                })
            })
            .collect();
    }
    body
}

fn tool_uses(message: &Value) -> Vec<ToolUse> {
    message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|call| ToolUse {
                    id: format!("call_{}", Uuid::new_v4().simple()),
                    name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                    input: call["function"].get("arguments").cloned().unwrap_or_else(|| json!({})),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn usage_from(body: &Value) -> Usage {
    Usage::new(
        body["prompt_eval_count"].as_u64().unwrap_or(0) as u32,
        body["eval_count"].as_u64().unwrap_or(0) as u32,
    )
}

fn finish_reason(body: &Value, has_calls: bool) -> String {
    if has_calls {
        return "tool_calls".to_string();
    }
    match body["done_reason"].as_str() {
        Some("length") => "length".to_string(),
        _ => "stop".to_string(),
    }
}

pub(crate) fn parse_response(body: &Value) -> Result<ProviderResponse, ProviderError> {
    let message = body
        .get("message")
        .ok_or_else(|| ProviderError::Decode("response has no message".into()))?;
    let tool_uses = tool_uses(message);
    Ok(ProviderResponse {
        id: None,
        text: message["content"].as_str().unwrap_or_default().to_string(),
        finish_reason: finish_reason(body, !tool_uses.is_empty()),
        tool_uses,
        usage: usage_from(body),
    })
}

/// One JSON object per line until `done: true`
#[derive(Default)]
pub(crate) struct LineParser {
    calls: usize,
    finished: bool,
}

impl StreamParser for LineParser {
    fn frame(&mut self, _event: Option<&str>, data: &str) -> Result<Vec<StreamDelta>, ProviderError> {
        if self.finished {
            return Ok(vec![]);
        }
        let body: Value = serde_json::from_str(data).map_err(|e| ProviderError::Decode(e.to_string()))?;
        if let Some(error) = body["error"].as_str() {
            return Err(ProviderError::Stream(error.to_string()));
        }

        let mut deltas = Vec::new();
        if let Some(text) = body["message"]["content"].as_str().filter(|t| !t.is_empty()) {
            deltas.push(StreamDelta::Text(text.to_string()));
        }
        for call in tool_uses(&body["message"]) {
            let index = self.calls;
            self.calls += 1;
            deltas.push(StreamDelta::ToolCallStart {
                index,
                id: call.id,
                name: call.name,
            });
            deltas.push(StreamDelta::ToolCallArgs {
                index,
                fragment: call.input.to_string(),
            });
        }
        if body["done"].as_bool() == Some(true) {
            self.finished = true;
            deltas.push(StreamDelta::Finish {
                reason: finish_reason(&body, self.calls > 0),
                usage: Some(usage_from(&body)),
            });
        }
        Ok(deltas)
    }

    fn finish(&mut self) -> Vec<StreamDelta> {
        if self.finished {
            return vec![];
        }
        self.finished = true;
        vec![StreamDelta::Finish {
            reason: if self.calls > 0 { "tool_calls" } else { "stop" }.to_string(),
            usage: None,
        }]
    }
}

#[async_trait::async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let response = self
            .post(&build_body(request, false))
            .timeout(self.upstream.timeout)
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;
        parse_response(&body)
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<DeltaStream, ProviderError> {
        let response = self.post(&build_body(request, true)).send().await?;
        let response = check_status(response).await?;
        Ok(pump(response, Framing::Ndjson, LineParser::default()))
    }
}
