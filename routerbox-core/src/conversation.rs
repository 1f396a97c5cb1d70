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

//! Provider-neutral conversation
//!
//! Adapters translate a [`Conversation`] role-by-role into their native
//! schema. Tool uses and tool results are first-class parts so the tool-call
//! loop can append them between rounds.

use crate::chat::{ChatMessage, ContentPart, MessageContent};
use crate::error::{Result, RouterboxError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url(String),
}

impl ImageSource {
    /// Parse `data:<media type>;base64,<payload>` or keep a remote URL as is
    pub fn from_url(url: &str) -> Self {
        if let Some(rest) = url.strip_prefix("data:") {
            if let Some((meta, data)) = rest.split_once(',') {
                if let Some(media_type) = meta.strip_suffix(";base64") {
                    return ImageSource::Base64 {
                        media_type: media_type.to_string(),
                        data: data.to_string(),
                    };
                }
            }
        }
        ImageSource::Url(url.to_string())
    }

    pub fn to_data_url(&self) -> String {
        match self {
            ImageSource::Base64 { media_type, data } => format!("data:{};base64,{}", media_type, data),
            ImageSource::Url(url) => url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        name: String,
        content: Value,
        is_error: bool,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            parts: vec![Part::text(text)],
        }
    }

    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }

    pub fn has_tool_results(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, Part::ToolResult { .. }))
    }
}

/// A tool call emitted by a model and the result fed back to it
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExchange {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub output: Value,
    pub is_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub system: Option<String>,
    pub turns: Vec<Turn>,
}

impl Conversation {
    /// Validate and normalize an OpenAI-style message list.
    ///
    /// System messages are folded into `system`. `tool` messages become
    /// tool-result parts of a user turn. Adjacent turns with the same role
    /// are merged.
    pub fn from_messages(messages: &[ChatMessage]) -> Result<Self> {
        if messages.is_empty() {
            return Err(RouterboxError::Validation(
                "messages must be a non-empty array".to_string(),
            ));
        }

        let mut conversation = Conversation::default();
        let mut system_parts: Vec<String> = Vec::new();

        for (idx, message) in messages.iter().enumerate() {
            let role = message.role.trim();
            if role.is_empty() {
                return Err(RouterboxError::Validation(format!(
                    "messages[{}].role is required",
                    idx
                )));
            }

            match role {
                "system" | "developer" => {
                    let content = require_content(message, idx)?;
                    system_parts.push(content.as_text());
                }
                "user" => {
                    let content = require_content(message, idx)?;
                    conversation.push(Turn {
                        role: Role::User,
                        parts: content_parts(content),
                    });
                }
                "assistant" => {
                    let mut parts = match &message.content {
                        Some(content) if !content.is_empty() => content_parts(content),
                        Some(_) | None if message.tool_calls.is_some() => Vec::new(),
                        Some(content) => content_parts(content),
                        None => {
                            return Err(RouterboxError::Validation(format!(
                                "messages[{}].content is required",
                                idx
                            )))
                        }
                    };
                    for call in message.tool_calls.iter().flatten() {
                        let input = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| Value::Object(Default::default()));
                        parts.push(Part::ToolUse {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            input,
                        });
                    }
                    conversation.push(Turn {
                        role: Role::Assistant,
                        parts,
                    });
                }
                "tool" => {
                    let tool_use_id = message.tool_call_id.clone().ok_or_else(|| {
                        RouterboxError::Validation(format!(
                            "messages[{}].tool_call_id is required for tool messages",
                            idx
                        ))
                    })?;
                    let text = message
                        .content
                        .as_ref()
                        .map(MessageContent::as_text)
                        .unwrap_or_default();
                    let content = serde_json::from_str(&text).unwrap_or(Value::String(text));
                    conversation.push(Turn {
                        role: Role::User,
                        parts: vec![Part::ToolResult {
                            tool_use_id,
                            name: message.name.clone().unwrap_or_default(),
                            content,
                            is_error: false,
                        }],
                    });
                }
                other => {
                    return Err(RouterboxError::Validation(format!(
                        "messages[{}].role '{}' is not one of system, user, assistant",
                        idx, other
                    )))
                }
            }
        }

        if !system_parts.is_empty() {
            conversation.system = Some(system_parts.join("\n\n"));
        }
        if conversation.turns.is_empty() {
            return Err(RouterboxError::Validation(
                "messages must contain at least one user or assistant message".to_string(),
            ));
        }
        Ok(conversation)
    }

    /// Append a turn, merging into the previous one when roles match
    pub fn push(&mut self, turn: Turn) {
        match self.turns.last_mut() {
            Some(last) if last.role == turn.role => last.parts.extend(turn.parts),
            _ => self.turns.push(turn),
        }
    }

    /// Append the assistant turn carrying tool uses and the user turn
    /// carrying their results, keyed by tool-use id.
    pub fn push_tool_round(&mut self, assistant_text: &str, exchanges: &[ToolExchange]) {
        let mut assistant_parts = Vec::new();
        if !assistant_text.is_empty() {
            assistant_parts.push(Part::text(assistant_text));
        }
        assistant_parts.extend(exchanges.iter().map(|ex| Part::ToolUse {
            id: ex.id.clone(),
            name: ex.name.clone(),
            input: ex.input.clone(),
        }));
        self.push(Turn {
            role: Role::Assistant,
            parts: assistant_parts,
        });
        self.push(Turn {
            role: Role::User,
            parts: exchanges
                .iter()
                .map(|ex| Part::ToolResult {
                    tool_use_id: ex.id.clone(),
                    name: ex.name.clone(),
                    content: ex.output.clone(),
                    is_error: ex.is_error,
                })
                .collect(),
        });
    }

    /// Append text to the system prompt
    pub fn append_system(&mut self, text: &str) {
        self.system = Some(match self.system.take() {
            Some(existing) if !existing.is_empty() => format!("{}\n\n{}", existing, text),
            _ => text.to_string(),
        });
    }

    pub fn last_user_text(&self) -> Option<String> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User && !t.has_tool_results())
            .map(Turn::text)
    }
}

fn require_content(message: &ChatMessage, idx: usize) -> Result<&MessageContent> {
    message.content.as_ref().ok_or_else(|| {
        RouterboxError::Validation(format!("messages[{}].content is required", idx))
    })
}

fn content_parts(content: &MessageContent) -> Vec<Part> {
    match content {
        MessageContent::Text(text) => vec![Part::text(text.clone())],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(Part::text(text.clone())),
                ContentPart::ImageUrl { image_url } => Some(Part::Image {
                    source: ImageSource::from_url(&image_url.url),
                }),
                ContentPart::Image {
                    data: Some(data),
                    media_type,
                    ..
                } => Some(Part::Image {
                    source: ImageSource::Base64 {
                        media_type: media_type.clone().unwrap_or_else(|| "image/png".to_string()),
                        data: data.clone(),
                    },
                }),
                ContentPart::Image { url: Some(url), .. } => Some(Part::Image {
                    source: ImageSource::from_url(url),
                }),
                ContentPart::Image { .. } => None,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{FunctionCall, ToolCall};
    use serde_json::json;

    #[test]
    fn test_from_messages_folds_system_and_merges_roles() {
        let conversation = Conversation::from_messages(&[
            ChatMessage::text("system", "be brief"),
            ChatMessage::text("user", "hello"),
            ChatMessage::text("user", "are you there?"),
            ChatMessage::text("assistant", "yes"),
        ])
        .unwrap();

        assert_eq!(conversation.system.as_deref(), Some("be brief"));
        assert_eq!(conversation.turns.len(), 2);
        assert_eq!(conversation.turns[0].text(), "hello\nare you there?");
    }

    #[test]
    fn test_from_messages_rejects_bad_shapes() {
        assert!(Conversation::from_messages(&[]).is_err());

        let missing_content = ChatMessage {
            role: "user".into(),
            ..Default::default()
        };
        let err = Conversation::from_messages(&[missing_content]).unwrap_err();
        assert!(err.to_string().contains("content"));

        let bad_role = ChatMessage::text("narrator", "once upon a time");
        assert!(Conversation::from_messages(&[bad_role]).is_err());

        let only_system = ChatMessage::text("system", "rules");
        assert!(Conversation::from_messages(&[only_system]).is_err());
    }

    #[test]
    fn test_replayed_tool_calls() {
        let conversation = Conversation::from_messages(&[
            ChatMessage::text("user", "add 2 and 2"),
            ChatMessage {
                role: "assistant".into(),
                tool_calls: Some(vec![ToolCall {
                    id: "call_1".into(),
                    call_type: "function".into(),
                    function: FunctionCall {
                        name: "calc".into(),
                        arguments: r#"{"expr":"2+2"}"#.into(),
                    },
                }]),
                ..Default::default()
            },
            ChatMessage {
                role: "tool".into(),
                tool_call_id: Some("call_1".into()),
                content: Some(MessageContent::Text(r#"{"value":4}"#.into())),
                ..Default::default()
            },
        ])
        .unwrap();

        assert_eq!(conversation.turns.len(), 3);
        let uses: Vec<_> = conversation.turns[1].tool_uses().collect();
        assert_eq!(uses[0].2, &json!({"expr": "2+2"}));
        assert!(conversation.turns[2].has_tool_results());
        assert_eq!(conversation.last_user_text().as_deref(), Some("add 2 and 2"));
    }

    #[test]
    fn test_image_data_url() {
        let source = ImageSource::from_url("data:image/jpeg;base64,/9j/4AAQ");
        assert_eq!(
            source,
            ImageSource::Base64 {
                media_type: "image/jpeg".into(),
                data: "/9j/4AAQ".into()
            }
        );
        assert_eq!(source.to_data_url(), "data:image/jpeg;base64,/9j/4AAQ");
    }

    #[test]
    fn test_push_tool_round() {
        let mut conversation = Conversation {
            system: Some("sys".into()),
            turns: vec![Turn::user("weather?")],
        };
        conversation.push_tool_round(
            "checking",
            &[ToolExchange {
                id: "t1".into(),
                name: "weather".into(),
                input: json!({"city": "Oslo"}),
                output: json!({"error": "offline"}),
                is_error: true,
            }],
        );
        assert_eq!(conversation.turns.len(), 3);
        assert_eq!(conversation.turns[1].role, Role::Assistant);
        assert_eq!(conversation.turns[1].parts.len(), 2);
        assert!(conversation.turns[2].has_tool_results());
    }
}
