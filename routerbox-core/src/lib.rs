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

//! Routerbox Core
//!
//! Configuration model, the hot-reloading configuration store, and the
//! OpenAI-compatible schema shared by the gateway.

pub mod chat;
pub mod config_store;
pub mod conversation;
pub mod error;
pub mod model;
pub mod tool;

pub use chat::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ChatMessage, Choice, ChunkChoice,
    ContentPart, Delta, ErrorBody, ErrorDetail, FunctionCall, ImageUrl, MessageContent,
    ModelEntry, ModelList, ResponseMessage, StreamItem, ToolCall, ToolCallEvent, Usage,
};
pub use config_store::{ConfigChange, ConfigSnapshot, ConfigStore, ConfigWatcher, StorePaths, DEFAULT_DEBOUNCE};
pub use conversation::{Conversation, ImageSource, Part, Role, ToolExchange, Turn};
pub use error::{Result, RouterboxError};
pub use model::{
    AllowedTools, Capabilities, Capability, GlobalModelConfig, ModelConfig, ModelDefaults,
    ProviderKind, RateLimitSpec, Routing, ToolsPolicy, Window, WindowUnit,
};
pub use tool::{ModelToolAccess, ToolConfig, ToolDeclaration, ToolSecurity, ToolsGlobalConfig};
