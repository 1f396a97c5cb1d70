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

//! Routable model configuration
//!
//! A model document lives at `models/<provider>/<local_id>.json` under the
//! model configuration root. The directory name and file stem form the
//! client-visible identifier `<provider>/<local_id>`.

use crate::error::{Result, RouterboxError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Upstream provider family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Anthropic,
    Openai,
    Google,
    OpenaiCompatible,
    Ollama,
    Local,
    Openrouter,
    Custom,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 8] = [
        ProviderKind::Anthropic,
        ProviderKind::Openai,
        ProviderKind::Google,
        ProviderKind::OpenaiCompatible,
        ProviderKind::Ollama,
        ProviderKind::Local,
        ProviderKind::Openrouter,
        ProviderKind::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Openai => "openai",
            ProviderKind::Google => "google",
            ProviderKind::OpenaiCompatible => "openai-compatible",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Local => "local",
            ProviderKind::Openrouter => "openrouter",
            ProviderKind::Custom => "custom",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = RouterboxError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        ProviderKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| RouterboxError::Validation(format!("unknown provider '{}'", s)))
    }
}

/// Model capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Text,
    Vision,
    Audio,
    Tools,
    Thinking,
}

/// Set of capabilities.
///
/// Accepts either `["text", "tools"]` or `{"text": true, "tools": true}` on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self(caps.into_iter().collect())
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            List(Vec<Capability>),
            Flags(std::collections::HashMap<Capability, bool>),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::List(list) => Capabilities::new(list),
            Repr::Flags(flags) => {
                Capabilities::new(flags.into_iter().filter(|(_, on)| *on).map(|(cap, _)| cap))
            }
        })
    }
}

/// Time unit of a rate-limit window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowUnit {
    #[serde(alias = "seconds", alias = "sec", alias = "s")]
    Second,
    #[serde(alias = "minutes", alias = "min", alias = "m")]
    Minute,
    #[serde(alias = "hours", alias = "h")]
    Hour,
    #[serde(alias = "days", alias = "d")]
    Day,
}

impl WindowUnit {
    pub fn as_secs(&self) -> u64 {
        match self {
            WindowUnit::Second => 1,
            WindowUnit::Minute => 60,
            WindowUnit::Hour => 3_600,
            WindowUnit::Day => 86_400,
        }
    }
}

/// A rate-limit window, e.g. `{ "amount": 1, "unit": "minute" }`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    #[serde(default = "default_window_amount")]
    pub amount: u32,
    pub unit: WindowUnit,
}

fn default_window_amount() -> u32 {
    1
}

impl Window {
    pub fn new(amount: u32, unit: WindowUnit) -> Self {
        Self { amount, unit }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.unit.as_secs() * u64::from(self.amount.max(1)))
    }
}

/// `requests` per `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub requests: u32,
    pub window: Window,
}

impl RateLimitSpec {
    pub fn new(requests: u32, window: Window) -> Self {
        Self { requests, window }
    }

    pub fn per_minute(requests: u32) -> Self {
        Self::new(requests, Window::new(1, WindowUnit::Minute))
    }

    pub fn per_hour(requests: u32) -> Self {
        Self::new(requests, Window::new(1, WindowUnit::Hour))
    }
}

/// Which tools a model may call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AllowedTools {
    #[default]
    All,
    Only(Vec<String>),
}

impl AllowedTools {
    pub fn permits(&self, tool_id: &str) -> bool {
        match self {
            AllowedTools::All => true,
            AllowedTools::Only(ids) => ids.iter().any(|id| id == "*" || id == tool_id),
        }
    }
}

impl Serialize for AllowedTools {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            AllowedTools::All => serializer.serialize_str("*"),
            AllowedTools::Only(ids) => ids.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for AllowedTools {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Star(String),
            List(Vec<String>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Star(s) if s == "*" => Ok(AllowedTools::All),
            Repr::Star(s) => Ok(AllowedTools::Only(vec![s])),
            Repr::List(ids) if ids.iter().any(|id| id == "*") => Ok(AllowedTools::All),
            Repr::List(ids) => Ok(AllowedTools::Only(ids)),
        }
    }
}

/// Per-model tool policy
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_tools: AllowedTools,
}

/// Explicit adapter override
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Routing {
    #[serde(default)]
    pub service: Option<String>,
}

/// Defaults applied to models that omit rate-limit fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDefaults {
    #[serde(default)]
    pub global_rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub user_rate_limit: Option<RateLimitSpec>,
}

/// Top-level `config.json` of the model configuration root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalModelConfig {
    #[serde(default)]
    pub defaults: ModelDefaults,
    /// `false` turns hot reload off even when the server enables it
    #[serde(default)]
    pub hot_reload: Option<bool>,
    #[serde(default)]
    pub default_model: Option<String>,
}

/// Raw on-disk model document.
///
/// Required fields are optional here so a missing field yields a precise
/// diagnostic instead of a generic serde error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDocument {
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub provider: Option<String>,
    pub api_model: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub global_rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub user_rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub tools: ToolsPolicy,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl ModelDocument {
    /// Validate required fields and produce a complete [`ModelConfig`].
    pub fn into_config(
        self,
        provider_dir: &str,
        local_id: &str,
        defaults: &ModelDefaults,
        source: PathBuf,
    ) -> Result<ModelConfig> {
        let path = source.display().to_string();
        let require = |field: Option<String>, name: &str| -> Result<String> {
            match field {
                Some(value) if !value.trim().is_empty() => Ok(value),
                _ => Err(RouterboxError::invalid_config(
                    path.clone(),
                    format!("missing required field '{}'", name),
                )),
            }
        };

        let id = require(self.id, "id")?;
        let display_name = require(self.display_name, "displayName")?;
        let provider_raw = require(self.provider, "provider")?;
        let api_model = require(self.api_model, "apiModel")?;
        let provider = provider_raw
            .parse::<ProviderKind>()
            .map_err(|e| RouterboxError::invalid_config(path.clone(), e.to_string()))?;

        for (name, limit) in [
            ("globalRateLimit", &self.global_rate_limit),
            ("userRateLimit", &self.user_rate_limit),
        ] {
            if let Some(limit) = limit {
                if limit.window.amount == 0 {
                    return Err(RouterboxError::invalid_config(
                        path.clone(),
                        format!("{} window amount must be positive", name),
                    ));
                }
            }
        }

        Ok(ModelConfig {
            full_id: format!("{}/{}", provider_dir, local_id),
            local_id: local_id.to_string(),
            id,
            display_name,
            provider,
            api_model,
            description: self.description,
            enabled: self.enabled.unwrap_or(true),
            routing: self.routing,
            capabilities: self.capabilities,
            global_rate_limit: self.global_rate_limit.or(defaults.global_rate_limit),
            user_rate_limit: self.user_rate_limit.or(defaults.user_rate_limit),
            tools: self.tools,
            max_tokens: self.max_tokens,
            system_prompt: self.system_prompt,
            source,
            loaded_at: Utc::now(),
        })
    }
}

/// Canonical description of a routable model. Never mutated after load.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// `<provider>/<local_id>`, the identifier clients send
    pub full_id: String,
    pub local_id: String,
    /// `id` as declared in the document
    pub id: String,
    pub display_name: String,
    pub provider: ProviderKind,
    pub api_model: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub routing: Routing,
    pub capabilities: Capabilities,
    pub global_rate_limit: Option<RateLimitSpec>,
    pub user_rate_limit: Option<RateLimitSpec>,
    pub tools: ToolsPolicy,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    #[serde(skip)]
    pub source: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

impl ModelConfig {
    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap)
    }

    /// Whether tool declarations should be attached to upstream requests
    pub fn tools_active(&self) -> bool {
        self.tools.enabled && self.supports(Capability::Tools)
    }

    /// Matches either the full id or, for legacy callers, the bare local id
    pub fn answers_to(&self, id: &str) -> bool {
        self.full_id == id || self.local_id == id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> ModelDocument {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_capabilities_accept_list_and_flags() {
        let list: Capabilities = serde_json::from_value(json!(["text", "tools"])).unwrap();
        assert!(list.contains(Capability::Tools));
        assert!(!list.contains(Capability::Vision));

        let flags: Capabilities =
            serde_json::from_value(json!({"text": true, "vision": true, "tools": false})).unwrap();
        assert!(flags.contains(Capability::Vision));
        assert!(!flags.contains(Capability::Tools));
    }

    #[test]
    fn test_allowed_tools_star_and_list() {
        let all: AllowedTools = serde_json::from_value(json!("*")).unwrap();
        assert_eq!(all, AllowedTools::All);
        let star_list: AllowedTools = serde_json::from_value(json!(["*"])).unwrap();
        assert_eq!(star_list, AllowedTools::All);
        let only: AllowedTools = serde_json::from_value(json!(["calc"])).unwrap();
        assert!(only.permits("calc"));
        assert!(!only.permits("shell"));
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!(
            "openai-compatible".parse::<ProviderKind>().unwrap(),
            ProviderKind::OpenaiCompatible
        );
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::Openai);
        assert!("bogus".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_window_duration() {
        let window: Window = serde_json::from_value(json!({"amount": 2, "unit": "minutes"})).unwrap();
        assert_eq!(window.duration(), Duration::from_secs(120));
    }

    #[test]
    fn test_into_config_merges_defaults() {
        let defaults = ModelDefaults {
            global_rate_limit: Some(RateLimitSpec::per_minute(100)),
            user_rate_limit: Some(RateLimitSpec::per_minute(10)),
        };
        let model = doc(json!({
            "id": "claude-4-sonnet",
            "displayName": "Claude 4 Sonnet",
            "provider": "anthropic",
            "apiModel": "claude-sonnet-4-20250514",
            "userRateLimit": {"requests": 3, "window": {"amount": 1, "unit": "minute"}}
        }))
        .into_config("anthropic", "claude-4-sonnet", &defaults, PathBuf::from("x.json"))
        .unwrap();

        assert_eq!(model.full_id, "anthropic/claude-4-sonnet");
        assert!(model.enabled);
        assert_eq!(model.global_rate_limit, Some(RateLimitSpec::per_minute(100)));
        assert_eq!(model.user_rate_limit, Some(RateLimitSpec::per_minute(3)));
        assert!(model.answers_to("claude-4-sonnet"));
    }

    #[test]
    fn test_into_config_requires_fields() {
        let err = doc(json!({"id": "x", "provider": "openai", "apiModel": "gpt"}))
            .into_config("openai", "x", &ModelDefaults::default(), PathBuf::from("x.json"))
            .unwrap_err();
        assert!(err.to_string().contains("displayName"));
    }
}
