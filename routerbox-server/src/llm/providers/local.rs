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

//! Local inference through supervised llama-server children

use super::OpenAiProvider;
use crate::llm::{DeltaStream, Provider, ProviderError, ProviderRequest, ProviderResponse, Upstream};
use crate::local::LocalSupervisor;
use std::sync::Arc;

/// `api_model` names the model directory; the server for it is started on
/// first use and spoken to over its OpenAI-compatible API.
pub struct LocalProvider {
    upstream: Upstream,
    supervisor: Arc<LocalSupervisor>,
}

impl LocalProvider {
    pub fn new(upstream: Upstream, supervisor: Arc<LocalSupervisor>) -> Self {
        Self { upstream, supervisor }
    }

    async fn client_for(&self, model_name: &str) -> Result<OpenAiProvider, ProviderError> {
        let endpoint = self.supervisor.ensure_running(model_name).await?;
        Ok(OpenAiProvider::compatible(
            "local",
            self.upstream.clone(),
            format!("{}/v1", endpoint.base_url.trim_end_matches('/')),
            None,
        ))
    }
}

#[async_trait::async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.client_for(&request.api_model).await?.complete(request).await
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<DeltaStream, ProviderError> {
        self.client_for(&request.api_model).await?.stream(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalConfig;
    use crate::local::SupervisorError;
    use routerbox_core::{Conversation, Turn};
    use serde_json::json;
    use std::time::Duration;

    fn request(model: &str) -> ProviderRequest {
        ProviderRequest {
            api_model: model.into(),
            conversation: Conversation {
                system: None,
                turns: vec![Turn::user("hi")],
            },
            tools: vec![],
            temperature: None,
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn test_uses_pre_started_server() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/models")
            .with_status(200)
            .with_body(json!({"object": "list", "data": [{"id": "tinyllama"}]}).to_string())
            .create_async()
            .await;
        let chat = server
            .mock("POST", "/v1/chat/completions")
            .match_body(mockito::Matcher::PartialJson(json!({"model": "tinyllama"})))
            .with_status(200)
            .with_body(
                json!({
                    "id": "local-1",
                    "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let config = LocalConfig {
            server_url: Some(format!("{}/v1", server.url())),
            server_name: Some("tinyllama".into()),
            probe_ports: vec![],
            ..LocalConfig::default()
        };
        let supervisor = Arc::new(LocalSupervisor::new(config, reqwest::Client::new()));
        let upstream = Upstream::new(Duration::from_secs(5)).unwrap();
        let provider = LocalProvider::new(upstream, supervisor.clone());

        let response = provider.complete(&request("tinyllama")).await.unwrap();
        chat.assert_async().await;
        assert_eq!(response.text, "hello");
        assert_eq!(supervisor.running_count(), 1);
    }

    #[tokio::test]
    async fn test_disabled_without_server() {
        let config = LocalConfig {
            probe_ports: vec![],
            ..LocalConfig::default()
        };
        let supervisor = Arc::new(LocalSupervisor::new(config, reqwest::Client::new()));
        let provider = LocalProvider::new(Upstream::new(Duration::from_secs(5)).unwrap(), supervisor);

        let err = provider.complete(&request("tinyllama")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Local(SupervisorError::Disabled)));
    }
}
