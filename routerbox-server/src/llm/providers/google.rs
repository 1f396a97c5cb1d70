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

//! Google Gemini `generateContent`

use crate::llm::sse::{pump, Framing, StreamParser};
use crate::llm::{
    check_status, DeltaStream, Provider, ProviderError, ProviderRequest, ProviderResponse, StreamDelta, ToolUse,
    Upstream,
};
use routerbox_core::{ImageSource, Part, Role, Usage};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

pub const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleProvider {
    upstream: Upstream,
    api_key: String,
    base_url: String,
}

impl GoogleProvider {
    pub fn new(upstream: Upstream, api_key: String, base_url: Option<String>) -> Self {
        Self {
            upstream,
            api_key,
            base_url: base_url.unwrap_or_else(|| GOOGLE_BASE_URL.to_string()),
        }
    }

    fn url(&self, model: &str, stream: bool) -> String {
        let base = self.base_url.trim_end_matches('/');
        if stream {
            format!("{}/models/{}:streamGenerateContent?alt=sse", base, model)
        } else {
            format!("{}/models/{}:generateContent", base, model)
        }
    }

    fn post(&self, model: &str, stream: bool, body: &Value) -> reqwest::RequestBuilder {
        self.upstream
            .client
            .post(self.url(model, stream))
            .header("x-goog-api-key", &self.api_key)
            .json(body)
    }
}

/// Gemini has no call ids; they are minted here and mapped back by name
fn call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

pub(crate) fn build_body(request: &ProviderRequest) -> Value {
    let conversation = &request.conversation;
    // functionResponse parts are matched by name, not id
    let names: HashMap<&str, &str> = conversation
        .turns
        .iter()
        .flat_map(|t| t.tool_uses())
        .map(|(id, name, _)| (id, name))
        .collect();

    let contents: Vec<Value> = conversation
        .turns
        .iter()
        .filter(|turn| !turn.parts.is_empty())
        .map(|turn| {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            let parts: Vec<Value> = turn
                .parts
                .iter()
                .map(|part| match part {
                    Part::Text { text } => json!({ "text": text }),
                    Part::Image {
                        source: ImageSource::Base64 { media_type, data },
                    } => json!({ "inline_data": { "mime_type": media_type, "data": data } }),
                    Part::Image {
                        source: ImageSource::Url(url),
                    } => json!({ "file_data": { "file_uri": url } }),
                    Part::ToolUse { name, input, .. } => json!({ "functionCall": { "name": name, "args": input } }),
                    Part::ToolResult {
                        tool_use_id,
                        name,
                        content,
                        ..
                    } => {
                        let name = if name.is_empty() {
                            names.get(tool_use_id.as_str()).copied().unwrap_or_default()
                        } else {
                            name.as_str()
                        };
                        let response = if content.is_object() {
                            content.clone()
                        } else {
                            json!({ "result": content })
                        };
                        json!({ "functionResponse": { "name": name, "response": response } })
                    }
                })
                .collect();
            json!({ "role": role, "parts": parts })
        })
        .collect();

    let mut body = json!({ "contents": contents });
    if let Some(system) = conversation.system.as_deref().filter(|s| !s.is_empty()) {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    let mut generation = serde_json::Map::new();
    if let Some(t) = request.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(max) = request.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(max));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|t| json!({ "name": t.name, "description": t.description, "parameters": t.parameters }))
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    body
}

fn finish_reason(reason: Option<&str>, has_calls: bool) -> String {
    if has_calls {
        return "tool_calls".to_string();
    }
    match reason {
        Some("MAX_TOKENS") => "length",
        Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT") => "content_filter",
        _ => "stop",
    }
    .to_string()
}

fn usage_from(value: &Value) -> Option<Usage> {
    let meta = value.get("usageMetadata")?;
    Some(Usage::new(
        meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
    ))
}

fn candidate_parts(body: &Value) -> &[Value] {
    body.pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub(crate) fn parse_response(body: &Value) -> Result<ProviderResponse, ProviderError> {
    if body.pointer("/candidates/0").is_none() {
        let reason = body
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
            .unwrap_or("no candidates returned");
        return Err(ProviderError::Decode(reason.to_string()));
    }

    let mut text = String::new();
    let mut tool_uses = Vec::new();
    for part in candidate_parts(body) {
        if let Some(t) = part["text"].as_str() {
            text.push_str(t);
        }
        if let Some(call) = part.get("functionCall") {
            tool_uses.push(ToolUse {
                id: call_id(),
                name: call["name"].as_str().unwrap_or_default().to_string(),
                input: call.get("args").cloned().unwrap_or_else(|| json!({})),
            });
        }
    }

    let reason = body.pointer("/candidates/0/finishReason").and_then(Value::as_str);
    Ok(ProviderResponse {
        id: body["responseId"].as_str().map(str::to_string),
        finish_reason: finish_reason(reason, !tool_uses.is_empty()),
        text,
        tool_uses,
        usage: usage_from(body).unwrap_or_default(),
    })
}

/// Each SSE event is a whole `GenerateContentResponse`
#[derive(Default)]
pub(crate) struct ResponseParser {
    calls: usize,
    reason: Option<String>,
    usage: Option<Usage>,
    finished: bool,
}

impl StreamParser for ResponseParser {
    fn frame(&mut self, _event: Option<&str>, data: &str) -> Result<Vec<StreamDelta>, ProviderError> {
        if self.finished {
            return Ok(vec![]);
        }
        let body: Value = serde_json::from_str(data).map_err(|e| ProviderError::Decode(e.to_string()))?;
        if let Some(error) = body.get("error") {
            let message = error["message"].as_str().unwrap_or("upstream stream error");
            return Err(ProviderError::Stream(message.to_string()));
        }

        let mut deltas = Vec::new();
        for part in candidate_parts(&body) {
            if let Some(t) = part["text"].as_str().filter(|t| !t.is_empty()) {
                deltas.push(StreamDelta::Text(t.to_string()));
            }
            if let Some(call) = part.get("functionCall") {
                let index = self.calls;
                self.calls += 1;
                deltas.push(StreamDelta::ToolCallStart {
                    index,
                    id: call_id(),
                    name: call["name"].as_str().unwrap_or_default().to_string(),
                });
                deltas.push(StreamDelta::ToolCallArgs {
                    index,
                    fragment: call.get("args").cloned().unwrap_or_else(|| json!({})).to_string(),
                });
            }
        }
        if let Some(reason) = body.pointer("/candidates/0/finishReason").and_then(Value::as_str) {
            self.reason = Some(reason.to_string());
        }
        if let Some(usage) = usage_from(&body) {
            self.usage = Some(usage);
        }
        Ok(deltas)
    }

    fn finish(&mut self) -> Vec<StreamDelta> {
        if self.finished {
            return vec![];
        }
        self.finished = true;
        vec![StreamDelta::Finish {
            reason: finish_reason(self.reason.as_deref(), self.calls > 0),
            usage: self.usage.take(),
        }]
    }
}

#[async_trait::async_trait]
impl Provider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let response = self
            .post(&request.api_model, false, &build_body(request))
            .timeout(self.upstream.timeout)
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;
        parse_response(&body)
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<DeltaStream, ProviderError> {
        let response = self.post(&request.api_model, true, &build_body(request)).send().await?;
        let response = check_status(response).await?;
        Ok(pump(response, Framing::Sse, ResponseParser::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::providers::fixtures;
    use routerbox_core::{Conversation, ToolDeclaration, ToolExchange, Turn};
    use std::time::Duration;

    #[test]
    fn test_body_maps_roles_and_function_parts() {
        let mut conversation = Conversation {
            system: Some("Answer in French.".into()),
            turns: vec![Turn::user("Quelle heure est-il ?")],
        };
        conversation.push_tool_round(
            "",
            &[ToolExchange {
                id: "call_x".into(),
                name: "clock".into(),
                input: json!({}),
                output: json!("12:00"),
                is_error: false,
            }],
        );
        let body = build_body(&ProviderRequest {
            api_model: "gemini-2.5-flash".into(),
            conversation,
            tools: vec![ToolDeclaration {
                name: "clock".into(),
                description: "Current time".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }],
            temperature: Some(0.0),
            max_tokens: Some(256),
        });

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Answer in French.");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["functionCall"]["name"], "clock");
        assert_eq!(
            body["contents"][2]["parts"][0]["functionResponse"],
            json!({"name": "clock", "response": {"result": "12:00"}})
        );
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "clock");
    }

    #[test]
    fn test_stream_function_call_is_whole() {
        let mut parser = ResponseParser::default();
        let deltas = parser
            .frame(
                None,
                r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"clock","args":{"tz":"UTC"}}}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":8,"candidatesTokenCount":3}}"#,
            )
            .unwrap();
        assert!(matches!(&deltas[0], StreamDelta::ToolCallStart { index: 0, name, .. } if name == "clock"));
        assert_eq!(
            deltas[1],
            StreamDelta::ToolCallArgs {
                index: 0,
                fragment: r#"{"tz":"UTC"}"#.into()
            }
        );
        assert_eq!(
            parser.finish(),
            vec![StreamDelta::Finish {
                reason: "tool_calls".into(),
                usage: Some(Usage::new(8, 3))
            }]
        );
    }

    #[tokio::test]
    async fn test_complete_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/models/gemini-2.5-flash:generateContent")
            .match_header("x-goog-api-key", "g-key")
            .with_status(200)
            .with_body(
                json!({
                    "candidates": [{
                        "content": {"role": "model", "parts": [{"text": "Bonjour"}]},
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 1, "totalTokenCount": 5}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let upstream = Upstream::new(Duration::from_secs(5)).unwrap();
        let provider = GoogleProvider::new(upstream, "g-key".into(), Some(server.url()));
        let response = provider
            .complete(&ProviderRequest {
                api_model: "gemini-2.5-flash".into(),
                conversation: Conversation {
                    system: None,
                    turns: vec![Turn::user("Salut")],
                },
                tools: vec![],
                temperature: None,
                max_tokens: None,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.text, "Bonjour");
        assert_eq!(response.usage.total_tokens, 5);
    }

    #[test]
    fn test_reply_survives_replay() {
        let reply = fixtures::tool_reply();
        let body = build_body(&fixtures::replay(&reply));
        assert_eq!(body["contents"][1]["role"], "model");

        let upstream = json!({
            "responseId": "resp_1",
            "candidates": [{"content": body["contents"][1], "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 30, "candidatesTokenCount": 18}
        });
        let parsed = parse_response(&upstream).unwrap();
        assert_eq!(fixtures::without_call_ids(parsed), fixtures::without_call_ids(reply));
    }
}
