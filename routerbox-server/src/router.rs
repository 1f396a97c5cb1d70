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

//! Chat Router
//!
//! Entry point for chat-completion requests: validate, resolve the model,
//! admit through the rate limiter, pick a provider adapter and hand the turn
//! to the tool-call loop.

use crate::llm::{ProviderError, ProviderRegistry, ProviderRequest};
use crate::rate_limit::{Decision, RateLimitError, RateLimiter};
use crate::tool_loop::{LoopTurn, ToolLoop};
use routerbox_core::{
    ChatCompletion, ChatCompletionRequest, ConfigStore, Conversation, ModelConfig, RouterboxError, StreamItem,
    ToolConfig, ToolDeclaration,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

pub const ANONYMOUS_USER: &str = "anonymous";

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub user_id: String,
    pub ip: Option<IpAddr>,
}

impl CallerContext {
    pub fn new(user_id: Option<&str>, ip: Option<IpAddr>) -> Self {
        let user_id = user_id
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(ANONYMOUS_USER);
        Self {
            user_id: user_id.to_string(),
            ip,
        }
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Request(#[from] RouterboxError),

    #[error("Rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error(transparent)]
    Queue(#[from] RateLimitError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// How the request got past the rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Admission {
    pub queued: bool,
    pub waited: Duration,
}

pub enum ChatReply {
    Complete(ChatCompletion),
    /// Closes after the last item; the transport appends `[DONE]`
    Stream(mpsc::Receiver<StreamItem>),
}

pub struct RoutedChat {
    pub admission: Admission,
    pub reply: ChatReply,
}

/// Tool-usage guidance appended to the system prompt
pub fn tool_guidance(tools: &[Arc<ToolConfig>]) -> Option<String> {
    if tools.is_empty() {
        return None;
    }
    let mut guidance = String::from("You can call the following tools when they help answer the request:\n");
    for tool in tools {
        let description = if tool.description.is_empty() {
            &tool.name
        } else {
            &tool.description
        };
        guidance.push_str(&format!("- {}: {}\n", tool.id, description));
    }
    guidance.push_str(
        "Call a tool only when its result is needed. If a tool returns an error, \
         tell the user what went wrong or try another approach.",
    );
    Some(guidance)
}

pub struct ChatRouter {
    store: Arc<ConfigStore>,
    limiter: Arc<RateLimiter>,
    providers: Arc<ProviderRegistry>,
    tool_loop: Arc<ToolLoop>,
}

impl ChatRouter {
    pub fn new(
        store: Arc<ConfigStore>,
        limiter: Arc<RateLimiter>,
        providers: Arc<ProviderRegistry>,
        tool_loop: Arc<ToolLoop>,
    ) -> Self {
        Self {
            store,
            limiter,
            providers,
            tool_loop,
        }
    }

    /// Resolve an enabled model by full or bare local id
    pub fn resolve_model(&self, id: &str) -> Result<Arc<ModelConfig>, RouterboxError> {
        let model = self
            .store
            .get_model_config(id)
            .ok_or_else(|| RouterboxError::ModelNotFound(id.to_string()))?;
        if !model.enabled {
            return Err(RouterboxError::ModelDisabled(id.to_string()));
        }
        Ok(model)
    }

    pub async fn handle(
        &self,
        request: ChatCompletionRequest,
        caller: &CallerContext,
    ) -> Result<RoutedChat, RouterError> {
        let model_id = request.model.trim().to_string();
        if model_id.is_empty() {
            return Err(RouterboxError::Validation("model is required".to_string()).into());
        }
        if let Some(t) = request.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(RouterboxError::Validation(format!("temperature must be between 0 and 2 (got {})", t)).into());
            }
        }
        let mut conversation = Conversation::from_messages(&request.messages)?;
        let model = self.resolve_model(&model_id)?;

        let admission = match self
            .limiter
            .check_rate_limit(&caller.user_id, &model, caller.ip)
            .await?
        {
            Decision::Allowed => Admission::default(),
            Decision::Queued { waited } => Admission { queued: true, waited },
            Decision::Denied { retry_after_secs, .. } => {
                info!(user = %caller.user_id, model = %model.full_id, retry_after_secs, "Rate limited");
                return Err(RouterError::RateLimited { retry_after_secs });
            }
        };

        let provider = self.providers.resolve(&model)?;

        if let Some(prompt) = model.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            conversation.system = Some(match conversation.system.take() {
                Some(client) if !client.is_empty() => format!("{}\n\n{}", prompt, client),
                _ => prompt.to_string(),
            });
        }
        let tools: Vec<ToolDeclaration> = if model.tools_active() {
            let tools = self.store.get_tools_for_model(&model.full_id);
            if let Some(guidance) = tool_guidance(&tools) {
                conversation.append_system(&guidance);
            }
            tools.iter().map(|t| t.declaration()).collect()
        } else {
            Vec::new()
        };
        if request.web_search == Some(true) {
            debug!(model = %model.full_id, "web_search requested but not served by this gateway");
        }

        let api_model = if model.api_model.is_empty() {
            model.local_id.clone()
        } else {
            model.api_model.clone()
        };
        info!(
            model = %model.full_id,
            provider = %provider.name(),
            user = %caller.user_id,
            stream = request.stream,
            tools = tools.len(),
            queued = admission.queued,
            "Routing chat completion"
        );

        let turn = LoopTurn {
            response_id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            // the id the client sent, even when it was a bare local id
            model: model_id,
            tool_model: model.full_id.clone(),
            provider,
            request: ProviderRequest {
                api_model,
                conversation,
                tools,
                temperature: request.temperature,
                max_tokens: request.max_tokens.or(model.max_tokens),
            },
        };

        let reply = if request.stream {
            ChatReply::Stream(self.tool_loop.stream(turn))
        } else {
            ChatReply::Complete(self.tool_loop.complete(turn).await?)
        };
        Ok(RoutedChat { admission, reply })
    }
}
