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

//! Filesystem loading of model and tool documents

use crate::error::{Result, RouterboxError};
use crate::model::{GlobalModelConfig, ModelConfig, ModelDocument};
use crate::tool::{ToolConfig, ToolsGlobalConfig};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const GLOBAL_CONFIG_FILE: &str = "config.json";
pub const MODELS_DIR: &str = "models";

/// Roots of the two configuration trees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    /// Holds `config.json` and `models/<provider>/<id>.json`
    pub model_config_dir: PathBuf,
    /// Holds `config.json` and `<id>/config.json`
    pub tools_dir: PathBuf,
}

impl StorePaths {
    pub fn new(model_config_dir: impl Into<PathBuf>, tools_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_config_dir: model_config_dir.into(),
            tools_dir: tools_dir.into(),
        }
    }

    /// Both roots as absolute, symlink-free paths, so they compare equal to
    /// the paths watcher backends report. A root that does not exist yet is
    /// only made absolute.
    pub fn canonicalize(self) -> Self {
        Self {
            model_config_dir: absolute(self.model_config_dir),
            tools_dir: absolute(self.tools_dir),
        }
    }

    pub fn models_root(&self) -> PathBuf {
        self.model_config_dir.join(MODELS_DIR)
    }

    pub fn model_globals_file(&self) -> PathBuf {
        self.model_config_dir.join(GLOBAL_CONFIG_FILE)
    }

    pub fn tool_globals_file(&self) -> PathBuf {
        self.tools_dir.join(GLOBAL_CONFIG_FILE)
    }
}

/// Read `config.json` of the model tree. A missing file yields defaults.
pub(crate) fn absolute(path: PathBuf) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            return cwd.join(path);
        }
    }
    path
}

pub fn load_model_globals(path: &Path) -> Result<GlobalModelConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "No global model config, using defaults");
        return Ok(GlobalModelConfig::default());
    }
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| RouterboxError::invalid_config(path.display().to_string(), e.to_string()))
}

/// `(provider_dir, local_id)` for a model file under `models_root`
pub fn model_key(path: &Path, models_root: &Path) -> Option<(String, String)> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    let relative = path.strip_prefix(models_root).ok()?;
    let mut components = relative.components();
    let provider = components.next()?.as_os_str().to_str()?.to_string();
    let file = components.next()?;
    if components.next().is_some() {
        return None;
    }
    let local_id = Path::new(file.as_os_str()).file_stem()?.to_str()?.to_string();
    Some((provider, local_id))
}

/// Parse and validate a single model document
pub fn load_model_file(
    path: &Path,
    models_root: &Path,
    globals: &GlobalModelConfig,
) -> Result<ModelConfig> {
    let (provider_dir, local_id) = model_key(path, models_root).ok_or_else(|| {
        RouterboxError::invalid_config(
            path.display().to_string(),
            "expected models/<provider>/<id>.json",
        )
    })?;
    let raw = fs::read_to_string(path)?;
    let doc: ModelDocument = serde_json::from_str(&raw)
        .map_err(|e| RouterboxError::invalid_config(path.display().to_string(), e.to_string()))?;
    doc.into_config(&provider_dir, &local_id, &globals.defaults, path.to_path_buf())
}

/// Walk the models tree. Invalid documents are skipped with a warning.
pub fn scan_models(
    models_root: &Path,
    globals: &GlobalModelConfig,
) -> HashMap<String, Arc<ModelConfig>> {
    let mut models = HashMap::new();
    if !models_root.is_dir() {
        warn!(path = %models_root.display(), "Models directory does not exist");
        return models;
    }

    for entry in WalkDir::new(models_root)
        .min_depth(2)
        .max_depth(2)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if model_key(path, models_root).is_none() {
            continue;
        }
        match load_model_file(path, models_root, globals) {
            Ok(model) => {
                debug!(model = %model.full_id, "Loaded model config");
                models.insert(model.full_id.clone(), Arc::new(model));
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid model config"),
        }
    }
    models
}

pub fn load_tool_globals(path: &Path) -> Result<ToolsGlobalConfig> {
    if !path.exists() {
        return Ok(ToolsGlobalConfig::default());
    }
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| RouterboxError::invalid_config(path.display().to_string(), e.to_string()))
}

/// Tool directory owning `path`, if `path` is `<tools_dir>/<id>/config.json`
pub fn tool_dir_for(path: &Path, tools_dir: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(tools_dir).ok()?;
    let mut components = relative.components();
    let id = components.next()?;
    let file = components.next()?;
    if components.next().is_some() || file.as_os_str() != GLOBAL_CONFIG_FILE {
        return None;
    }
    Some(tools_dir.join(id.as_os_str()))
}

pub fn load_tool_dir(tool_dir: &Path) -> Result<ToolConfig> {
    let raw = fs::read_to_string(tool_dir.join(GLOBAL_CONFIG_FILE))?;
    ToolConfig::from_json(&raw, tool_dir)
}

/// Load every `<tools_dir>/<id>/config.json`
pub fn scan_tools(tools_dir: &Path) -> HashMap<String, Arc<ToolConfig>> {
    let mut tools = HashMap::new();
    let entries = match fs::read_dir(tools_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %tools_dir.display(), error = %e, "Tools directory is not readable");
            return tools;
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.join(GLOBAL_CONFIG_FILE).is_file())
        .collect();
    dirs.sort();

    for dir in dirs {
        match load_tool_dir(&dir) {
            Ok(tool) => {
                if !tool.controller_path.exists() {
                    warn!(tool = %tool.id, path = %tool.controller_path.display(), "Tool worker is missing");
                }
                debug!(tool = %tool.id, "Loaded tool config");
                tools.insert(tool.id.clone(), Arc::new(tool));
            }
            Err(e) => warn!(path = %dir.display(), error = %e, "Skipping invalid tool config"),
        }
    }
    tools
}
