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

//! Provider adapters
//!
//! Each adapter translates a provider-neutral [`ProviderRequest`] into the
//! upstream's native schema and normalizes what comes back: a whole
//! [`ProviderResponse`] or a channel of [`StreamDelta`]s. The
//! [`ProviderRegistry`] picks the adapter for a model.

mod providers;
mod sse;

pub use providers::{AnthropicProvider, GoogleProvider, LocalProvider, OllamaProvider, OpenAiProvider};
pub use sse::{LineBuffer, SseDecoder, SseEvent};

use crate::config::ProvidersConfig;
use crate::local::{LocalSupervisor, SupervisorError};
use dashmap::DashMap;
use routerbox_core::{Conversation, ModelConfig, ToolDeclaration, Usage};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Failed to decode upstream response: {0}")]
    Decode(String),

    #[error("Upstream stream failed: {0}")]
    Stream(String),

    #[error(transparent)]
    Local(#[from] SupervisorError),
}

/// Provider-neutral request for one generation round
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Upstream model name
    pub api_model: String,
    pub conversation: Conversation,
    pub tools: Vec<ToolDeclaration>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A tool invocation emitted by the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProviderResponse {
    pub id: Option<String>,
    pub text: String,
    pub tool_uses: Vec<ToolUse>,
    /// OpenAI vocabulary: `stop`, `length`, `tool_calls`
    pub finish_reason: String,
    pub usage: Usage,
}

/// One normalized streaming event.
///
/// Tool calls are keyed by the upstream's block index: a start carries the id
/// and name, argument fragments follow and concatenate into a JSON document.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallArgs {
        index: usize,
        fragment: String,
    },
    /// Always the last delta of a successful stream
    Finish {
        reason: String,
        usage: Option<Usage>,
    },
}

pub type DeltaStream = mpsc::Receiver<Result<StreamDelta, ProviderError>>;

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Dropping the receiver aborts the upstream request
    async fn stream(&self, request: &ProviderRequest) -> Result<DeltaStream, ProviderError>;
}

/// HTTP client plus the timeout applied to non-streaming calls
#[derive(Debug, Clone)]
pub struct Upstream {
    pub client: reqwest::Client,
    pub timeout: Duration,
}

impl Upstream {
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, timeout })
    }
}

/// Map a non-success response to [`ProviderError::Api`], keeping the
/// upstream's own error message when it sends one
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("error"))
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.chars().take(500).collect());
    Err(ProviderError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Tool arguments arrive as a JSON string; malformed ones are kept as text
pub(crate) fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Tool results travel as text to most providers
pub(crate) fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Adapter lookup: `routing.service`, then `provider`, then the id prefix
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            providers: DashMap::new(),
        }
    }

    /// Register every provider that has what it needs to run
    pub fn from_config(
        config: &ProvidersConfig,
        upstream: Upstream,
        local: Arc<LocalSupervisor>,
    ) -> Self {
        let registry = Self::empty();

        match &config.anthropic.api_key {
            Some(key) => {
                let provider = AnthropicProvider::new(upstream.clone(), key.clone(), config.anthropic.base_url.clone());
                registry.register("anthropic", Arc::new(provider));
                info!("Initialized Anthropic provider");
            }
            None => warn!("ANTHROPIC_API_KEY not set, Anthropic provider disabled"),
        }

        match &config.openai.api_key {
            Some(key) => {
                let provider = OpenAiProvider::openai(upstream.clone(), key.clone(), config.openai.base_url.clone());
                registry.register("openai", Arc::new(provider));
                info!("Initialized OpenAI provider");
            }
            None => warn!("OPENAI_API_KEY not set, OpenAI provider disabled"),
        }

        match &config.google.api_key {
            Some(key) => {
                let provider = GoogleProvider::new(upstream.clone(), key.clone(), config.google.base_url.clone());
                registry.register("google", Arc::new(provider));
                info!("Initialized Google provider");
            }
            None => warn!("GOOGLE_API_KEY not set, Google provider disabled"),
        }

        match &config.openrouter.api_key {
            Some(key) => {
                let provider =
                    OpenAiProvider::openrouter(upstream.clone(), key.clone(), config.openrouter.base_url.clone());
                registry.register("openrouter", Arc::new(provider));
                info!("Initialized OpenRouter provider");
            }
            None => debug!("OPENROUTER_API_KEY not set, OpenRouter provider disabled"),
        }

        let ollama = OllamaProvider::new(upstream.clone(), config.ollama.base_url.clone());
        registry.register("ollama", Arc::new(ollama));

        for (name, service) in &config.services {
            let provider = OpenAiProvider::compatible(
                name,
                upstream.clone(),
                service.base_url.clone(),
                service.resolved_api_key(),
            );
            registry.register(name, Arc::new(provider));
            info!(service = %name, url = %service.base_url, "Initialized OpenAI-compatible service");
        }

        if local.is_enabled() || local.has_pre_started_server() {
            registry.register("local", Arc::new(LocalProvider::new(upstream, local)));
            info!("Initialized local inference provider");
        }

        registry
    }

    pub fn register(&self, key: &str, provider: Arc<dyn Provider>) {
        self.providers.insert(key.to_string(), provider);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(key).map(|p| p.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn resolve(&self, model: &ModelConfig) -> Result<Arc<dyn Provider>, ProviderError> {
        if let Some(service) = &model.routing.service {
            match self.get(service) {
                Some(provider) => return Ok(provider),
                None => warn!(model = %model.full_id, service = %service, "Routing service not registered, falling back"),
            }
        }
        if let Some(provider) = self.get(model.provider.as_str()) {
            return Ok(provider);
        }
        if let Some((prefix, _)) = model.full_id.split_once('/') {
            if let Some(provider) = self.get(prefix) {
                return Ok(provider);
            }
        }
        Err(ProviderError::NotConfigured(format!(
            "no provider available for {} ({})",
            model.full_id, model.provider
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routerbox_core::model::{ModelDefaults, ModelDocument};
    use std::path::PathBuf;

    struct Named(&'static str);

    #[async_trait::async_trait]
    impl Provider for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn complete(&self, _request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Err(ProviderError::NotConfigured(self.0.to_string()))
        }

        async fn stream(&self, _request: &ProviderRequest) -> Result<DeltaStream, ProviderError> {
            Err(ProviderError::NotConfigured(self.0.to_string()))
        }
    }

    fn model(provider: &str, local_id: &str, service: Option<&str>) -> ModelConfig {
        let mut doc = serde_json::json!({
            "id": local_id,
            "displayName": local_id,
            "provider": provider,
            "apiModel": local_id,
        });
        if let Some(service) = service {
            doc["routing"] = serde_json::json!({ "service": service });
        }
        let doc: ModelDocument = serde_json::from_value(doc).unwrap();
        doc.into_config(provider, local_id, &ModelDefaults::default(), PathBuf::from("/tmp/x.json"))
            .unwrap()
    }

    #[test]
    fn test_resolution_order() {
        let registry = ProviderRegistry::empty();
        registry.register("openai", Arc::new(Named("openai")));
        registry.register("groq", Arc::new(Named("groq")));

        let routed = model("openai-compatible", "llama-70b", Some("groq"));
        assert_eq!(registry.resolve(&routed).unwrap().name(), "groq");

        let direct = model("openai", "gpt-4o", None);
        assert_eq!(registry.resolve(&direct).unwrap().name(), "openai");

        let stale_route = model("openai", "gpt-4o", Some("retired"));
        assert_eq!(registry.resolve(&stale_route).unwrap().name(), "openai");

        let missing = model("anthropic", "claude", None);
        assert!(matches!(registry.resolve(&missing), Err(ProviderError::NotConfigured(_))));
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(""), serde_json::json!({}));
        assert_eq!(parse_arguments(r#"{"a":1}"#), serde_json::json!({"a": 1}));
        assert_eq!(parse_arguments("{oops"), serde_json::json!("{oops"));
    }
}
