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

//! HTTP surface driven through the axum router

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use routerbox_core::{ConfigStore, StorePaths, Usage};
use routerbox_server::{
    build_router,
    config::{LocalConfig, RateLimitConfig},
    llm::{DeltaStream, Provider, ProviderError, ProviderRegistry, ProviderRequest, ProviderResponse, StreamDelta},
    local::LocalSupervisor,
    AppContext, ServerConfig,
};
use serde_json::{json, Value};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;

/// Answers every request with the same text
struct Canned;

#[async_trait::async_trait]
impl Provider for Canned {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, _request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            id: Some("up-1".into()),
            text: "Hello there.".into(),
            finish_reason: "stop".into(),
            usage: Usage::new(5, 3),
            ..Default::default()
        })
    }

    async fn stream(&self, _request: &ProviderRequest) -> Result<DeltaStream, ProviderError> {
        let (tx, rx) = mpsc::channel(8);
        for delta in [
            StreamDelta::Text("Hello".into()),
            StreamDelta::Text(" there.".into()),
            StreamDelta::Finish {
                reason: "stop".into(),
                usage: Some(Usage::new(5, 2)),
            },
        ] {
            tx.send(Ok(delta)).await.unwrap();
        }
        Ok(rx)
    }
}

/// Upstream that always rejects the key
struct Unauthorized;

#[async_trait::async_trait]
impl Provider for Unauthorized {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, _request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::Api {
            status: 401,
            message: "invalid x-api-key".into(),
        })
    }

    async fn stream(&self, _request: &ProviderRequest) -> Result<DeltaStream, ProviderError> {
        Err(ProviderError::Api {
            status: 401,
            message: "invalid x-api-key".into(),
        })
    }
}

struct TestApp {
    _dir: TempDir,
    app: Router,
}

fn write_model(root: &std::path::Path, provider: &str, id: &str, doc: Value) {
    let dir = root.join("model_config").join("models").join(provider);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{}.json", id)), doc.to_string()).unwrap();
}

fn test_app(rate_limit: RateLimitConfig) -> TestApp {
    let dir = TempDir::new().unwrap();
    write_model(
        dir.path(),
        "openai",
        "gpt-4o",
        json!({"id": "gpt-4o", "displayName": "GPT-4o", "provider": "openai", "apiModel": "gpt-4o"}),
    );
    write_model(
        dir.path(),
        "openai",
        "limited",
        json!({
            "id": "limited", "displayName": "Limited", "provider": "openai", "apiModel": "gpt-4o-mini",
            "userRateLimit": {"requests": 1, "window": {"amount": 1, "unit": "minute"}}
        }),
    );
    write_model(
        dir.path(),
        "openai",
        "retired",
        json!({"id": "retired", "displayName": "Retired", "provider": "openai", "apiModel": "x", "enabled": false}),
    );
    write_model(
        dir.path(),
        "anthropic",
        "claude",
        json!({"id": "claude", "displayName": "Claude", "provider": "anthropic", "apiModel": "claude-3-5-sonnet"}),
    );
    fs::create_dir_all(dir.path().join("tools")).unwrap();

    let mut config = ServerConfig::default();
    config.paths.model_config_dir = dir.path().join("model_config");
    config.paths.tools_dir = dir.path().join("tools");
    config.rate_limit = rate_limit;

    let store = Arc::new(
        ConfigStore::load(StorePaths::new(
            config.paths.model_config_dir.clone(),
            config.paths.tools_dir.clone(),
        ))
        .unwrap(),
    );
    let local = Arc::new(LocalSupervisor::new(
        LocalConfig {
            probe_ports: vec![],
            ..LocalConfig::default()
        },
        reqwest::Client::new(),
    ));
    let providers = ProviderRegistry::empty();
    providers.register("openai", Arc::new(Canned));
    providers.register("anthropic", Arc::new(Unauthorized));

    let ctx = AppContext::from_parts(&config, store, local, providers);
    TestApp {
        _dir: dir,
        app: build_router(ctx, &config),
    }
}

fn chat_request(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-user-id", "tester")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

fn hello(model: &str) -> Value {
    json!({"model": model, "messages": [{"role": "user", "content": "hi"}]})
}

#[tokio::test]
async fn test_non_stream_completion() {
    let test = test_app(RateLimitConfig::default());
    let response = test
        .app
        .oneshot(chat_request("/v1/chat/completions", hello("openai/gpt-4o")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ratelimit-queued").is_none());

    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "openai/gpt-4o");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello there.");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 8);
}

#[tokio::test]
async fn test_stream_ends_with_single_done() {
    let test = test_app(RateLimitConfig::default());
    let mut body = hello("openai/gpt-4o");
    body["stream"] = json!(true);
    let response = test.app.oneshot(chat_request("/chat/completions", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let text = body_text(response).await;
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(data.last(), Some(&"[DONE]"));
    assert_eq!(data.iter().filter(|d| **d == "[DONE]").count(), 1);

    let chunks: Vec<Value> = data[..data.len() - 1]
        .iter()
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    let content: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(content, "Hello there.");
    let last = chunks.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));
}

#[tokio::test]
async fn test_unknown_and_disabled_models() {
    let test = test_app(RateLimitConfig::default());
    let response = test
        .app
        .clone()
        .oneshot(chat_request("/v1/chat/completions", hello("openai/missing")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "model_not_found");
    assert!(body["error"]["message"].as_str().unwrap().contains("openai/missing"));

    let response = test
        .app
        .oneshot(chat_request("/v1/chat/completions", hello("openai/retired")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_invalid_requests_are_400() {
    let test = test_app(RateLimitConfig::default());
    let response = test
        .app
        .clone()
        .oneshot(chat_request("/v1/chat/completions", json!({"model": "openai/gpt-4o", "messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let malformed = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = test.app.oneshot(malformed).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"]["message"].is_string());
}

#[tokio::test]
async fn test_rate_limit_returns_429_with_retry_after() {
    let test = test_app(RateLimitConfig {
        queue_enabled: false,
        ..RateLimitConfig::default()
    });
    let first = test
        .app
        .clone()
        .oneshot(chat_request("/v1/chat/completions", hello("openai/limited")))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = test
        .app
        .oneshot(chat_request("/v1/chat/completions", hello("openai/limited")))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = second.headers()[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    let body = body_json(second).await;
    assert_eq!(body["error"]["code"], "rate_limit_exceeded");
}

#[tokio::test]
async fn test_upstream_status_propagates() {
    let test = test_app(RateLimitConfig::default());
    let response = test
        .app
        .clone()
        .oneshot(chat_request("/v1/chat/completions", hello("anthropic/claude")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "upstream_error");

    // in stream mode the failure becomes one error event before [DONE]
    let mut request = hello("anthropic/claude");
    request["stream"] = json!(true);
    let response = test.app.oneshot(chat_request("/v1/chat/completions", request)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;
    let data: Vec<&str> = text.lines().filter_map(|l| l.strip_prefix("data: ")).collect();
    assert_eq!(data.last(), Some(&"[DONE]"));
    assert!(data.iter().any(|d| d.contains("\"error\"") && d.contains("invalid x-api-key")));
}

#[tokio::test]
async fn test_models_lists_enabled_models() {
    let test = test_app(RateLimitConfig::default());
    let response = test.app.clone().oneshot(get("/v1/models")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["anthropic/claude", "openai/gpt-4o", "openai/limited"]);
    assert_eq!(body["data"][1]["owned_by"], "openai");
    assert_eq!(body["data"][1]["object"], "model");

    let response = test.app.oneshot(get("/models/openai/gpt-4o")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["id"], "openai/gpt-4o");
}

#[tokio::test]
async fn test_health_and_executions() {
    let test = test_app(RateLimitConfig::default());
    let response = test.app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["config"]["models"], 4);
    assert_eq!(body["config"]["enabled_models"], 3);
    assert_eq!(body["active_tool_executions"], 0);

    let response = test.app.clone().oneshot(get("/v1/tools/executions")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["executions"], json!([]));

    let response = test.app.oneshot(get("/v1/tools/executions/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

fn data_lines(text: &str) -> Vec<&str> {
    text.lines().filter_map(|l| l.strip_prefix("data: ")).collect()
}

#[tokio::test]
async fn test_stream_rejections_are_error_events() {
    let test = test_app(RateLimitConfig {
        queue_enabled: false,
        ..RateLimitConfig::default()
    });

    let mut missing = hello("openai/missing");
    missing["stream"] = json!(true);
    let response = test
        .app
        .clone()
        .oneshot(chat_request("/v1/chat/completions", missing))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let text = body_text(response).await;
    let data = data_lines(&text);
    assert_eq!(data.len(), 2);
    let event: Value = serde_json::from_str(data[0]).unwrap();
    assert_eq!(event["error"]["code"], "model_not_found");
    assert_eq!(event["error"]["type"], "invalid_request_error");
    assert!(event["error"]["message"].as_str().unwrap().contains("openai/missing"));
    assert_eq!(data[1], "[DONE]");

    let mut limited = hello("openai/limited");
    limited["stream"] = json!(true);
    let first = test
        .app
        .clone()
        .oneshot(chat_request("/v1/chat/completions", limited.clone()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    body_text(first).await;

    let second = test
        .app
        .oneshot(chat_request("/v1/chat/completions", limited))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key(header::RETRY_AFTER));
    let text = body_text(second).await;
    let data = data_lines(&text);
    let event: Value = serde_json::from_str(data[0]).unwrap();
    assert_eq!(event["error"]["code"], "rate_limit_exceeded");
    assert_eq!(data.last(), Some(&"[DONE]"));
    assert_eq!(data.iter().filter(|d| **d == "[DONE]").count(), 1);
}
