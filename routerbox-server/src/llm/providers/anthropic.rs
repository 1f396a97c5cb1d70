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

//! Anthropic Messages API

use crate::llm::sse::{pump, Framing, StreamParser};
use crate::llm::{
    check_status, result_text, DeltaStream, Provider, ProviderError, ProviderRequest, ProviderResponse,
    StreamDelta, ToolUse, Upstream, DEFAULT_MAX_TOKENS,
};
use routerbox_core::{ImageSource, Part, Role, Usage};
use serde_json::{json, Value};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    upstream: Upstream,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(upstream: Upstream, api_key: String, base_url: Option<String>) -> Self {
        Self {
            upstream,
            api_key,
            base_url: base_url.unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
        }
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        self.upstream
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
    }
}

fn block(part: &Part) -> Value {
    match part {
        Part::Text { text } => json!({ "type": "text", "text": text }),
        Part::Image {
            source: ImageSource::Base64 { media_type, data },
        } => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        }),
        Part::Image {
            source: ImageSource::Url(url),
        } => json!({
            "type": "image",
            "source": { "type": "url", "url": url },
        }),
        Part::ToolUse { id, name, input } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        Part::ToolResult {
            tool_use_id,
            content,
            is_error,
            ..
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": result_text(content),
            "is_error": is_error,
        }),
    }
}

pub(crate) fn build_body(request: &ProviderRequest, stream: bool) -> Value {
    let messages: Vec<Value> = request
        .conversation
        .turns
        .iter()
        .filter(|turn| !turn.parts.is_empty())
        .map(|turn| {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            json!({
                "role": role,
                "content": turn.parts.iter().map(block).collect::<Vec<_>>(),
            })
        })
        .collect();

    let mut body = json!({
        "model": request.api_model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
        "stream": stream,
    });
    if let Some(system) = request.conversation.system.as_deref().filter(|s| !s.is_empty()) {
        body["system"] = json!(system);
    }
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
    }
    body
}

fn finish_reason(stop_reason: Option<&str>) -> String {
    match stop_reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    }
    .to_string()
}

fn usage_from(value: &Value) -> Usage {
    Usage::new(
        value["input_tokens"].as_u64().unwrap_or(0) as u32,
        value["output_tokens"].as_u64().unwrap_or(0) as u32,
    )
}

pub(crate) fn parse_message(body: &Value) -> Result<ProviderResponse, ProviderError> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| ProviderError::Decode("message has no content".into()))?;

    let mut text = String::new();
    let mut tool_uses = Vec::new();
    for block in content {
        match block["type"].as_str() {
            Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
            Some("tool_use") => tool_uses.push(ToolUse {
                id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                input: block.get("input").cloned().unwrap_or_else(|| json!({})),
            }),
            _ => {}
        }
    }

    Ok(ProviderResponse {
        id: body["id"].as_str().map(str::to_string),
        text,
        tool_uses,
        finish_reason: finish_reason(body["stop_reason"].as_str()),
        usage: usage_from(&body["usage"]),
    })
}

/// Messages streaming events
#[derive(Default)]
pub(crate) struct EventParser {
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<String>,
    finished: bool,
}

impl StreamParser for EventParser {
    fn frame(&mut self, event: Option<&str>, data: &str) -> Result<Vec<StreamDelta>, ProviderError> {
        if self.finished {
            return Ok(vec![]);
        }
        let payload: Value = serde_json::from_str(data).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let kind = event.or_else(|| payload["type"].as_str()).unwrap_or_default();

        let deltas = match kind {
            "message_start" => {
                let usage = &payload["message"]["usage"];
                self.input_tokens = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
                vec![]
            }
            "content_block_start" => {
                let block = &payload["content_block"];
                let index = payload["index"].as_u64().unwrap_or(0) as usize;
                match block["type"].as_str() {
                    Some("tool_use") => vec![StreamDelta::ToolCallStart {
                        index,
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                    }],
                    Some("text") => block["text"]
                        .as_str()
                        .filter(|t| !t.is_empty())
                        .map(|t| vec![StreamDelta::Text(t.to_string())])
                        .unwrap_or_default(),
                    _ => vec![],
                }
            }
            "content_block_delta" => {
                let delta = &payload["delta"];
                let index = payload["index"].as_u64().unwrap_or(0) as usize;
                match delta["type"].as_str() {
                    Some("text_delta") => vec![StreamDelta::Text(delta["text"].as_str().unwrap_or_default().to_string())],
                    Some("input_json_delta") => vec![StreamDelta::ToolCallArgs {
                        index,
                        fragment: delta["partial_json"].as_str().unwrap_or_default().to_string(),
                    }],
                    _ => vec![],
                }
            }
            "message_delta" => {
                if let Some(reason) = payload["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(out) = payload["usage"]["output_tokens"].as_u64() {
                    self.output_tokens = out as u32;
                }
                vec![]
            }
            "message_stop" => self.finish(),
            "error" => {
                let message = payload["error"]["message"].as_str().unwrap_or("upstream stream error");
                return Err(ProviderError::Stream(message.to_string()));
            }
            _ => vec![],
        };
        Ok(deltas)
    }

    fn finish(&mut self) -> Vec<StreamDelta> {
        if self.finished {
            return vec![];
        }
        self.finished = true;
        vec![StreamDelta::Finish {
            reason: finish_reason(self.stop_reason.as_deref()),
            usage: Some(Usage::new(self.input_tokens, self.output_tokens)),
        }]
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let response = self
            .post(&build_body(request, false))
            .timeout(self.upstream.timeout)
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;
        parse_message(&body)
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<DeltaStream, ProviderError> {
        let response = self.post(&build_body(request, true)).send().await?;
        let response = check_status(response).await?;
        Ok(pump(response, Framing::Sse, EventParser::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::providers::fixtures;
    use routerbox_core::{Conversation, ToolExchange, Turn};
    use std::time::Duration;

    fn request() -> ProviderRequest {
        let mut conversation = Conversation {
            system: Some("You are helpful.".into()),
            turns: vec![Turn::user("What is 6*7?")],
        };
        conversation.push_tool_round(
            "Calculating.",
            &[ToolExchange {
                id: "toolu_1".into(),
                name: "calculator".into(),
                input: json!({"expression": "6*7"}),
                output: json!({"error": "division by zero"}),
                is_error: true,
            }],
        );
        ProviderRequest {
            api_model: "claude-sonnet-4-20250514".into(),
            conversation,
            tools: vec![],
            temperature: None,
            max_tokens: None,
        }
    }

    #[test]
    fn test_body_uses_content_blocks() {
        let body = build_body(&request(), false);
        assert_eq!(body["system"], "You are helpful.");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["messages"][1]["content"][1]["type"], "tool_use");
        let result = &body["messages"][2]["content"][0];
        assert_eq!(result["type"], "tool_result");
        assert_eq!(result["tool_use_id"], "toolu_1");
        assert_eq!(result["is_error"], true);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_stream_events() {
        let mut parser = EventParser::default();
        let frames = [
            ("message_start", r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":30,"output_tokens":1}}}"#),
            ("content_block_start", r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Checking"}}"#),
            ("content_block_start", r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_2","name":"calculator","input":{}}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"expression\": \"6*7\"}"}}"#),
            ("content_block_stop", r#"{"type":"content_block_stop","index":1}"#),
            ("message_delta", r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":18}}"#),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ];
        let mut deltas: Vec<StreamDelta> = frames
            .iter()
            .flat_map(|(event, data)| parser.frame(Some(event), data).unwrap())
            .collect();
        deltas.extend(parser.finish());

        assert_eq!(deltas.len(), 4);
        assert_eq!(deltas[0], StreamDelta::Text("Checking".into()));
        assert!(matches!(&deltas[1], StreamDelta::ToolCallStart { index: 1, id, .. } if id == "toolu_2"));
        assert_eq!(
            deltas[3],
            StreamDelta::Finish {
                reason: "tool_calls".into(),
                usage: Some(Usage::new(30, 18))
            }
        );
    }

    #[test]
    fn test_error_event_fails_stream() {
        let mut parser = EventParser::default();
        let err = parser
            .frame(Some("error"), r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#)
            .unwrap_err();
        assert_eq!(err.to_string(), "Upstream stream failed: Overloaded");
    }

    #[tokio::test]
    async fn test_complete_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "sk-ant")
            .match_header("anthropic-version", ANTHROPIC_VERSION)
            .with_status(200)
            .with_body(
                json!({
                    "id": "msg_01",
                    "type": "message",
                    "role": "assistant",
                    "content": [{"type": "text", "text": "Hello there."}],
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 9, "output_tokens": 4}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let upstream = Upstream::new(Duration::from_secs(5)).unwrap();
        let provider = AnthropicProvider::new(upstream, "sk-ant".into(), Some(server.url()));
        let response = provider
            .complete(&ProviderRequest {
                api_model: "claude-sonnet-4-20250514".into(),
                conversation: Conversation {
                    system: None,
                    turns: vec![Turn::user("hi")],
                },
                tools: vec![],
                temperature: None,
                max_tokens: Some(64),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.text, "Hello there.");
        assert_eq!(response.finish_reason, "stop");
        assert_eq!(response.usage, Usage::new(9, 4));
    }

    #[test]
    fn test_reply_survives_replay() {
        let reply = fixtures::tool_reply();
        let body = build_body(&fixtures::replay(&reply), false);
        let message = &body["messages"][1];
        assert_eq!(message["role"], "assistant");

        let upstream = json!({
            "id": "resp_1",
            "type": "message",
            "role": "assistant",
            "content": message["content"],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 30, "output_tokens": 18}
        });
        assert_eq!(parse_message(&upstream).unwrap(), reply);
    }
}
