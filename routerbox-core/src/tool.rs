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

//! Out-of-process tool configuration
//!
//! Each tool lives in `tools/<id>/config.json` next to its worker executable.
//! `tools/config.json` holds global toggles and per-model access lists.

use crate::error::{Result, RouterboxError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Security flags passed to the worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSecurity {
    #[serde(default)]
    pub sandboxed: bool,
    #[serde(default, alias = "noFile")]
    pub no_file_access: bool,
    #[serde(default)]
    pub no_network: bool,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    /// Hard timeout in milliseconds, used when `maxExecutionTime` is absent
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
}

/// On-disk tool document
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolDocument {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "empty_schema")]
    parameters: Value,
    #[serde(default)]
    returns: Option<Value>,
    #[serde(default)]
    allowed_models: Vec<String>,
    #[serde(default)]
    max_execution_time: Option<u64>,
    #[serde(default)]
    security: ToolSecurity,
    #[serde(default)]
    controller_path: Option<String>,
    #[serde(default)]
    category: Option<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Name of the worker executable when the document does not set `controllerPath`
pub const DEFAULT_CONTROLLER: &str = "controller";

/// An out-of-process capability
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub enabled: bool,
    pub parameters: Value,
    pub returns: Option<Value>,
    pub allowed_models: Vec<String>,
    pub max_execution_time: Option<u64>,
    pub security: ToolSecurity,
    /// Absolute path to the worker
    pub controller_path: PathBuf,
    pub category: Option<String>,
    /// Directory holding `config.json`
    #[serde(skip)]
    pub tool_dir: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

impl ToolConfig {
    /// Parse `config.json` from a tool directory. Relative controller paths resolve
    /// against that directory.
    pub fn from_json(raw: &str, tool_dir: &Path) -> Result<Self> {
        let source = tool_dir.join("config.json").display().to_string();
        let doc: ToolDocument = serde_json::from_str(raw)
            .map_err(|e| RouterboxError::invalid_config(source.clone(), e.to_string()))?;

        let dir_name = tool_dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);
        let id = doc
            .id
            .filter(|id| !id.trim().is_empty())
            .or(dir_name)
            .ok_or_else(|| RouterboxError::invalid_config(source.clone(), "missing tool id"))?;
        let name = doc.name.unwrap_or_else(|| id.clone());

        if !doc.parameters.is_object() {
            return Err(RouterboxError::invalid_config(
                source,
                "parameters must be a JSON-schema object",
            ));
        }

        let controller = doc
            .controller_path
            .unwrap_or_else(|| DEFAULT_CONTROLLER.to_string());
        let controller_path = if Path::new(&controller).is_absolute() {
            PathBuf::from(controller)
        } else {
            tool_dir.join(controller)
        };

        Ok(Self {
            id,
            name,
            description: doc.description,
            version: doc.version,
            enabled: doc.enabled,
            parameters: doc.parameters,
            returns: doc.returns,
            allowed_models: doc.allowed_models,
            max_execution_time: doc.max_execution_time,
            security: doc.security,
            controller_path,
            category: doc.category,
            tool_dir: tool_dir.to_path_buf(),
            loaded_at: Utc::now(),
        })
    }

    /// Empty `allowedModels` admits every model
    pub fn allows_model(&self, full_id: &str, local_id: &str) -> bool {
        self.allowed_models.is_empty()
            || self
                .allowed_models
                .iter()
                .any(|m| m == "*" || m == full_id || m == local_id)
    }

    /// Effective timeout: tool setting, then security timeout, then the global default
    pub fn timeout_ms(&self, default_ms: u64) -> u64 {
        self.max_execution_time
            .or(self.security.timeout_ms)
            .unwrap_or(default_ms)
    }

    pub fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.id.clone(),
            description: if self.description.is_empty() {
                self.name.clone()
            } else {
                self.description.clone()
            },
            parameters: self.parameters.clone(),
        }
    }
}

/// Provider-neutral tool declaration attached to upstream requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Allow/block lists for one model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelToolAccess {
    #[serde(default, alias = "allow", alias = "allowed")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, alias = "block", alias = "blocked")]
    pub blocked_tools: Vec<String>,
}

impl ModelToolAccess {
    pub fn permits(&self, tool_id: &str) -> bool {
        let allowed = self
            .allowed_tools
            .as_ref()
            .map(|list| list.iter().any(|t| t == "*" || t == tool_id))
            .unwrap_or(true);
        allowed && !self.blocked_tools.iter().any(|t| t == tool_id)
    }
}

/// `tools/config.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsGlobalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub max_concurrent_tool_calls: Option<usize>,
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
    #[serde(default)]
    pub model_tool_access: HashMap<String, ModelToolAccess>,
}

impl Default for ToolsGlobalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_tool_calls: None,
            default_timeout_ms: None,
            model_tool_access: HashMap::new(),
        }
    }
}

impl ToolsGlobalConfig {
    pub fn access_for(&self, full_id: &str, local_id: &str) -> Option<&ModelToolAccess> {
        self.model_tool_access
            .get(full_id)
            .or_else(|| self.model_tool_access.get(local_id))
    }
}
