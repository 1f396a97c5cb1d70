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

//! Upstream adapters

mod anthropic;
mod google;
mod local;
mod ollama;
mod openai;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use local::LocalProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

/// Shared by the adapter tests: a normalized reply and the follow-up request
/// that replays it upstream as the assistant turn
#[cfg(test)]
pub(crate) mod fixtures {
    use crate::llm::{ProviderRequest, ProviderResponse, ToolUse};
    use routerbox_core::{Conversation, Part, Role, Turn, Usage};
    use serde_json::json;

    pub(crate) fn tool_reply() -> ProviderResponse {
        ProviderResponse {
            id: Some("resp_1".into()),
            text: "Let me calculate.".into(),
            tool_uses: vec![ToolUse {
                id: "call_1".into(),
                name: "calculator".into(),
                input: json!({"expression": "6*7"}),
            }],
            finish_reason: "tool_calls".into(),
            usage: Usage::new(30, 18),
        }
    }

    pub(crate) fn replay(reply: &ProviderResponse) -> ProviderRequest {
        let mut parts = vec![Part::text(reply.text.clone())];
        parts.extend(reply.tool_uses.iter().map(|u| Part::ToolUse {
            id: u.id.clone(),
            name: u.name.clone(),
            input: u.input.clone(),
        }));
        ProviderRequest {
            api_model: "test-model".into(),
            conversation: Conversation {
                system: None,
                turns: vec![
                    Turn::user("What is 6*7?"),
                    Turn {
                        role: Role::Assistant,
                        parts,
                    },
                ],
            },
            tools: vec![],
            temperature: None,
            max_tokens: None,
        }
    }

    /// For upstreams without call ids, which are minted on parse
    pub(crate) fn without_call_ids(mut reply: ProviderResponse) -> ProviderResponse {
        for tool_use in &mut reply.tool_uses {
            assert!(tool_use.id.starts_with("call_"), "{}", tool_use.id);
            tool_use.id.clear();
        }
        reply
    }
}
