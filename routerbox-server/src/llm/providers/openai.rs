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

//! OpenAI Chat Completions and the many servers that speak it

use crate::llm::sse::{pump, Framing, StreamParser};
use crate::llm::{
    check_status, parse_arguments, result_text, DeltaStream, Provider, ProviderError, ProviderRequest,
    ProviderResponse, StreamDelta, ToolUse, Upstream,
};
use routerbox_core::{Part, Role, Usage};
use serde_json::{json, Value};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

pub struct OpenAiProvider {
    name: String,
    upstream: Upstream,
    base_url: String,
    api_key: Option<String>,
    /// Ask for a usage chunk at the end of streams
    stream_usage: bool,
    extra_headers: Vec<(&'static str, String)>,
}

impl OpenAiProvider {
    pub fn openai(upstream: Upstream, api_key: String, base_url: Option<String>) -> Self {
        Self {
            name: "openai".to_string(),
            upstream,
            base_url: base_url.unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            api_key: Some(api_key),
            stream_usage: true,
            extra_headers: vec![],
        }
    }

    pub fn openrouter(upstream: Upstream, api_key: String, base_url: Option<String>) -> Self {
        Self {
            name: "openrouter".to_string(),
            upstream,
            base_url: base_url.unwrap_or_else(|| OPENROUTER_BASE_URL.to_string()),
            api_key: Some(api_key),
            stream_usage: true,
            extra_headers: vec![("X-Title", "Routerbox".to_string())],
        }
    }

    /// Any server exposing `/chat/completions` under `base_url`
    pub fn compatible(name: &str, upstream: Upstream, base_url: String, api_key: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            upstream,
            base_url,
            api_key,
            stream_usage: false,
            extra_headers: vec![],
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut builder = self.upstream.client.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        for (name, value) in &self.extra_headers {
            builder = builder.header(*name, value);
        }
        builder
    }

    pub(crate) fn build_body(&self, request: &ProviderRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.api_model,
            "messages": messages(request),
            "stream": stream,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if stream && self.stream_usage {
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }
}

/// Conversation turns as Chat Completions messages
pub(crate) fn messages(request: &ProviderRequest) -> Vec<Value> {
    let conversation = &request.conversation;
    let mut out = Vec::new();
    if let Some(system) = conversation.system.as_deref().filter(|s| !s.is_empty()) {
        out.push(json!({ "role": "system", "content": system }));
    }

    for turn in &conversation.turns {
        match turn.role {
            Role::Assistant => {
                let text = turn.text();
                let tool_calls: Vec<Value> = turn
                    .tool_uses()
                    .map(|(id, name, input)| {
                        json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": input.to_string() },
                        })
                    })
                    .collect();
                let mut message = json!({ "role": "assistant" });
                message["content"] = if text.is_empty() && !tool_calls.is_empty() {
                    Value::Null
                } else {
                    Value::String(text)
                };
                if !tool_calls.is_empty() {
                    message["tool_calls"] = Value::Array(tool_calls);
                }
                out.push(message);
            }
            Role::User => {
                let mut content = Vec::new();
                for part in &turn.parts {
                    match part {
                        Part::ToolResult {
                            tool_use_id, content: result, ..
                        } => out.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": result_text(result),
                        })),
                        Part::Text { text } => content.push(json!({ "type": "text", "text": text })),
                        Part::Image { source } => content.push(json!({
                            "type": "image_url",
                            "image_url": { "url": source.to_data_url() },
                        })),
                        Part::ToolUse { .. } => {}
                    }
                }
                if content.is_empty() {
                    continue;
                }
                let only_text = content.iter().all(|c| c["type"] == "text");
                let content = if only_text {
                    Value::String(
                        content
                            .iter()
                            .filter_map(|c| c["text"].as_str())
                            .collect::<Vec<_>>()
                            .join("\n"),
                    )
                } else {
                    Value::Array(content)
                };
                out.push(json!({ "role": "user", "content": content }));
            }
        }
    }
    out
}

fn usage_from(value: &Value) -> Option<Usage> {
    let prompt = value.get("prompt_tokens")?.as_u64()? as u32;
    let completion = value.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0) as u32;
    Some(Usage::new(prompt, completion))
}

pub(crate) fn parse_completion(body: &Value) -> Result<ProviderResponse, ProviderError> {
    let choice = body
        .pointer("/choices/0")
        .ok_or_else(|| ProviderError::Decode("response has no choices".into()))?;
    let message = &choice["message"];

    let tool_uses = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    Some(ToolUse {
                        id: call["id"].as_str().unwrap_or_default().to_string(),
                        name: function["name"].as_str()?.to_string(),
                        input: parse_arguments(function["arguments"].as_str().unwrap_or("")),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ProviderResponse {
        id: body["id"].as_str().map(str::to_string),
        text: message["content"].as_str().unwrap_or_default().to_string(),
        tool_uses,
        finish_reason: choice["finish_reason"].as_str().unwrap_or("stop").to_string(),
        usage: body.get("usage").and_then(usage_from).unwrap_or_default(),
    })
}

/// `data:` chunks of a Chat Completions stream
#[derive(Default)]
pub(crate) struct ChunkParser {
    finish_reason: Option<String>,
    usage: Option<Usage>,
    finished: bool,
}

impl StreamParser for ChunkParser {
    fn frame(&mut self, _event: Option<&str>, data: &str) -> Result<Vec<StreamDelta>, ProviderError> {
        if self.finished {
            return Ok(vec![]);
        }
        if data.trim() == "[DONE]" {
            return Ok(self.finish());
        }
        let chunk: Value = serde_json::from_str(data).map_err(|e| ProviderError::Decode(e.to_string()))?;
        if let Some(error) = chunk.get("error") {
            let message = error["message"].as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            return Err(ProviderError::Stream(message));
        }

        if let Some(usage) = chunk.get("usage").and_then(usage_from) {
            self.usage = Some(usage);
        }

        let mut deltas = Vec::new();
        let Some(choice) = chunk.pointer("/choices/0") else {
            return Ok(deltas);
        };
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            deltas.push(StreamDelta::Text(text.to_string()));
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for (position, call) in calls.iter().enumerate() {
                let index = call["index"].as_u64().map(|i| i as usize).unwrap_or(position);
                let id = call["id"].as_str();
                let name = call["function"]["name"].as_str();
                if id.is_some() || name.is_some() {
                    deltas.push(StreamDelta::ToolCallStart {
                        index,
                        id: id.unwrap_or_default().to_string(),
                        name: name.unwrap_or_default().to_string(),
                    });
                }
                if let Some(fragment) = call["function"]["arguments"].as_str().filter(|a| !a.is_empty()) {
                    deltas.push(StreamDelta::ToolCallArgs {
                        index,
                        fragment: fragment.to_string(),
                    });
                }
            }
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }
        Ok(deltas)
    }

    fn finish(&mut self) -> Vec<StreamDelta> {
        if self.finished {
            return vec![];
        }
        self.finished = true;
        vec![StreamDelta::Finish {
            reason: self.finish_reason.take().unwrap_or_else(|| "stop".to_string()),
            usage: self.usage.take(),
        }]
    }
}

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_body(request, false);
        let response = self.post(&body).timeout(self.upstream.timeout).send().await?;
        let response = check_status(response).await?;
        let body: Value = response.json().await?;
        parse_completion(&body)
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<DeltaStream, ProviderError> {
        let body = self.build_body(request, true);
        let response = self.post(&body).send().await?;
        let response = check_status(response).await?;
        Ok(pump(response, Framing::Sse, ChunkParser::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::providers::fixtures;
    use routerbox_core::{Conversation, ImageSource, ToolDeclaration, ToolExchange, Turn};
    use std::time::Duration;

    fn request(conversation: Conversation) -> ProviderRequest {
        ProviderRequest {
            api_model: "gpt-4o".into(),
            conversation,
            tools: vec![ToolDeclaration {
                name: "calculator".into(),
                description: "Evaluate arithmetic".into(),
                parameters: json!({"type": "object", "properties": {"expression": {"type": "string"}}}),
            }],
            temperature: Some(0.2),
            max_tokens: None,
        }
    }

    fn upstream() -> Upstream {
        Upstream::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_messages_translate_tool_rounds_and_images() {
        let mut conversation = Conversation {
            system: Some("Be terse.".into()),
            turns: vec![Turn::user("What is 6*7? Look at this.")],
        };
        conversation.turns[0].parts.push(Part::Image {
            source: ImageSource::Base64 {
                media_type: "image/png".into(),
                data: "iVBOR".into(),
            },
        });
        conversation.push_tool_round(
            "",
            &[ToolExchange {
                id: "call_1".into(),
                name: "calculator".into(),
                input: json!({"expression": "6*7"}),
                output: json!({"value": 42}),
                is_error: false,
            }],
        );

        let messages = messages(&request(conversation));
        assert_eq!(messages[0], json!({"role": "system", "content": "Be terse."}));
        assert_eq!(messages[1]["content"][1]["image_url"]["url"], "data:image/png;base64,iVBOR");
        assert_eq!(messages[2]["content"], Value::Null);
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], r#"{"expression":"6*7"}"#);
        assert_eq!(
            messages[3],
            json!({"role": "tool", "tool_call_id": "call_1", "content": r#"{"value":42}"#})
        );
    }

    #[test]
    fn test_stream_chunks_assemble_tool_calls() {
        let mut parser = ChunkParser::default();
        let frames = [
            r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Let me check."}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_9","type":"function","function":{"name":"calculator","arguments":""}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"expression\":"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"6*7\"}"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":7,"total_tokens":19}}"#,
            "[DONE]",
        ];
        let mut deltas: Vec<StreamDelta> = frames
            .iter()
            .flat_map(|f| parser.frame(None, f).unwrap())
            .collect();
        deltas.extend(parser.finish());

        assert_eq!(
            deltas,
            vec![
                StreamDelta::Text("Let me check.".into()),
                StreamDelta::ToolCallStart {
                    index: 0,
                    id: "call_9".into(),
                    name: "calculator".into()
                },
                StreamDelta::ToolCallArgs {
                    index: 0,
                    fragment: "{\"expression\":".into()
                },
                StreamDelta::ToolCallArgs {
                    index: 0,
                    fragment: "\"6*7\"}".into()
                },
                StreamDelta::Finish {
                    reason: "tool_calls".into(),
                    usage: Some(Usage::new(12, 7))
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_complete_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(mockito::Matcher::PartialJson(json!({"model": "gpt-4o", "stream": false})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "id": "chatcmpl-1",
                    "choices": [{
                        "index": 0,
                        "message": {
                            "role": "assistant",
                            "content": null,
                            "tool_calls": [{
                                "id": "call_1",
                                "type": "function",
                                "function": {"name": "calculator", "arguments": "{\"expression\":\"6*7\"}"}
                            }]
                        },
                        "finish_reason": "tool_calls"
                    }],
                    "usage": {"prompt_tokens": 20, "completion_tokens": 5, "total_tokens": 25}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let provider = OpenAiProvider::openai(upstream(), "sk-test".into(), Some(format!("{}/v1", server.url())));
        let response = provider
            .complete(&request(Conversation {
                system: None,
                turns: vec![Turn::user("6*7?")],
            }))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.finish_reason, "tool_calls");
        assert_eq!(response.tool_uses[0].input, json!({"expression": "6*7"}));
        assert_eq!(response.usage.total_tokens, 25);
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_propagated() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#)
            .create_async()
            .await;

        let provider = OpenAiProvider::compatible("groq", upstream(), server.url(), None);
        let err = provider
            .complete(&request(Conversation {
                system: None,
                turns: vec![Turn::user("hi")],
            }))
            .await
            .unwrap_err();
        match err {
            ProviderError::Api { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Incorrect API key provided");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_reply_survives_replay() {
        let reply = fixtures::tool_reply();
        let messages = messages(&fixtures::replay(&reply));
        assert_eq!(messages.len(), 2);

        let upstream = json!({
            "id": "resp_1",
            "object": "chat.completion",
            "choices": [{"index": 0, "message": messages[1], "finish_reason": "tool_calls"}],
            "usage": {"prompt_tokens": 30, "completion_tokens": 18, "total_tokens": 48}
        });
        assert_eq!(parse_completion(&upstream).unwrap(), reply);
    }
}
