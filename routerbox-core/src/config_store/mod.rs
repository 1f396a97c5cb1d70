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

//! Hot-reloading model and tool configuration store
//!
//! The store serves immutable [`ConfigSnapshot`]s behind a versioned pointer.
//! Writers build a modified copy and swap it in; readers take one snapshot per
//! request and never observe a partially applied change.

mod loader;
mod watcher;

pub use loader::{
    load_model_file, load_model_globals, load_tool_dir, load_tool_globals, model_key,
    scan_models, scan_tools, tool_dir_for, StorePaths, GLOBAL_CONFIG_FILE, MODELS_DIR,
};
pub use watcher::{ConfigWatcher, DEFAULT_DEBOUNCE};

use crate::error::{Result, RouterboxError};
use crate::model::{GlobalModelConfig, ModelConfig};
use crate::tool::{ToolConfig, ToolsGlobalConfig};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Immutable view of all configuration at one version
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub models: HashMap<String, Arc<ModelConfig>>,
    pub tools: HashMap<String, Arc<ToolConfig>>,
    pub model_globals: GlobalModelConfig,
    pub tool_globals: ToolsGlobalConfig,
    pub swapped_at: Option<DateTime<Utc>>,
}

impl ConfigSnapshot {
    /// Look up by full id, then by bare local id
    pub fn model(&self, id: &str) -> Option<&Arc<ModelConfig>> {
        self.models.get(id).or_else(|| {
            self.models
                .values()
                .filter(|m| m.local_id == id)
                .min_by(|a, b| a.full_id.cmp(&b.full_id))
        })
    }

    pub fn tool(&self, id: &str) -> Option<&Arc<ToolConfig>> {
        self.tools.get(id)
    }

    /// Tools the model may call, sorted by id
    pub fn tools_for_model(&self, id: &str) -> Vec<Arc<ToolConfig>> {
        let Some(model) = self.model(id) else {
            return Vec::new();
        };
        if !self.tool_globals.enabled || !model.tools.enabled {
            return Vec::new();
        }
        let access = self
            .tool_globals
            .access_for(&model.full_id, &model.local_id);

        let mut tools: Vec<Arc<ToolConfig>> = self
            .tools
            .values()
            .filter(|tool| tool.enabled)
            .filter(|tool| tool.allows_model(&model.full_id, &model.local_id))
            .filter(|tool| model.tools.allowed_tools.permits(&tool.id))
            .filter(|tool| access.map(|a| a.permits(&tool.id)).unwrap_or(true))
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        tools
    }

    pub fn enabled_models(&self) -> Vec<Arc<ModelConfig>> {
        let mut models: Vec<_> = self.models.values().filter(|m| m.enabled).cloned().collect();
        models.sort_by(|a, b| a.full_id.cmp(&b.full_id));
        models
    }

    pub fn all_models(&self) -> Vec<Arc<ModelConfig>> {
        let mut models: Vec<_> = self.models.values().cloned().collect();
        models.sort_by(|a, b| a.full_id.cmp(&b.full_id));
        models
    }

    pub fn all_tools(&self) -> Vec<Arc<ToolConfig>> {
        let mut tools: Vec<_> = self.tools.values().cloned().collect();
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        tools
    }
}

/// What a filesystem change did to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    ModelUpdated(String),
    ModelsRemoved(Vec<String>),
    ModelDefaultsReloaded,
    ToolUpdated(String),
    ToolsRemoved(Vec<String>),
    ToolGlobalsReloaded,
    /// The new document was invalid; the previous entry stays in place
    Rejected(String),
    Ignored,
}

/// Holds the current snapshot and applies reloads
pub struct ConfigStore {
    paths: StorePaths,
    current: RwLock<Arc<ConfigSnapshot>>,
    version: AtomicU64,
}

impl ConfigStore {
    /// Walk both trees and build the first snapshot
    pub fn load(paths: StorePaths) -> Result<Self> {
        if !paths.model_config_dir.is_dir() {
            return Err(RouterboxError::invalid_config(
                paths.model_config_dir.display().to_string(),
                "model config directory does not exist",
            ));
        }
        let paths = paths.canonicalize();

        let snapshot = Self::read_all(&paths);
        info!(
            models = snapshot.models.len(),
            tools = snapshot.tools.len(),
            path = %paths.model_config_dir.display(),
            "Configuration loaded"
        );
        if snapshot.models.is_empty() {
            warn!("No valid model configurations found");
        }

        Ok(Self {
            paths,
            current: RwLock::new(Arc::new(ConfigSnapshot {
                version: 1,
                swapped_at: Some(Utc::now()),
                ..snapshot
            })),
            version: AtomicU64::new(1),
        })
    }

    fn read_all(paths: &StorePaths) -> ConfigSnapshot {
        let model_globals = load_model_globals(&paths.model_globals_file()).unwrap_or_else(|e| {
            warn!(error = %e, "Invalid global model config, using defaults");
            GlobalModelConfig::default()
        });
        let tool_globals = load_tool_globals(&paths.tool_globals_file()).unwrap_or_else(|e| {
            warn!(error = %e, "Invalid global tools config, using defaults");
            ToolsGlobalConfig::default()
        });

        ConfigSnapshot {
            version: 0,
            models: scan_models(&paths.models_root(), &model_globals),
            tools: scan_tools(&paths.tools_dir),
            model_globals,
            tool_globals,
            swapped_at: None,
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Current snapshot. Hold it for the duration of a request.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn get_model_config(&self, id: &str) -> Option<Arc<ModelConfig>> {
        self.snapshot().model(id).cloned()
    }

    pub fn get_tools_for_model(&self, id: &str) -> Vec<Arc<ToolConfig>> {
        self.snapshot().tools_for_model(id)
    }

    pub fn get_tool(&self, id: &str) -> Option<Arc<ToolConfig>> {
        self.snapshot().tool(id).cloned()
    }

    /// Enabled models only
    pub fn get_all_models(&self) -> Vec<Arc<ModelConfig>> {
        self.snapshot().enabled_models()
    }

    pub fn get_all_models_including_disabled(&self) -> Vec<Arc<ModelConfig>> {
        self.snapshot().all_models()
    }

    pub fn get_all_tools(&self) -> Vec<Arc<ToolConfig>> {
        self.snapshot().all_tools()
    }

    pub fn tool_globals(&self) -> ToolsGlobalConfig {
        self.snapshot().tool_globals.clone()
    }

    /// Copy the current snapshot, apply `f`, and publish the result under a new version
    fn swap<F>(&self, f: F) -> u64
    where
        F: FnOnce(&mut ConfigSnapshot),
    {
        let mut guard = self.current.write();
        let mut next = ConfigSnapshot::clone(&guard);
        f(&mut next);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        next.version = version;
        next.swapped_at = Some(Utc::now());
        *guard = Arc::new(next);
        version
    }

    /// Re-read both trees. The swap only happens when at least one model loaded.
    pub fn reload_all(&self) -> Result<usize> {
        let fresh = Self::read_all(&self.paths);
        if fresh.models.is_empty() {
            warn!("Full reload produced no models, keeping current configuration");
            return Err(RouterboxError::invalid_config(
                self.paths.models_root().display().to_string(),
                "no valid model configurations",
            ));
        }
        let count = fresh.models.len();
        self.swap(move |snapshot| {
            snapshot.models = fresh.models;
            snapshot.tools = fresh.tools;
            snapshot.model_globals = fresh.model_globals;
            snapshot.tool_globals = fresh.tool_globals;
        });
        info!(models = count, "Configuration fully reloaded");
        Ok(count)
    }

    /// React to a change of one path in either tree
    pub fn apply_change(&self, path: &Path) -> ConfigChange {
        let relative_to_cwd;
        let path = if path.is_relative() {
            relative_to_cwd = loader::absolute(path.to_path_buf());
            relative_to_cwd.as_path()
        } else {
            path
        };
        if path == self.paths.model_globals_file() {
            return self.reload_model_globals();
        }
        if path == self.paths.tool_globals_file() {
            return self.reload_tool_globals();
        }

        let models_root = self.paths.models_root();
        if path.starts_with(&models_root) {
            return self.apply_model_change(path, &models_root);
        }
        if path.starts_with(&self.paths.tools_dir) {
            return self.apply_tool_change(path);
        }
        ConfigChange::Ignored
    }

    fn apply_model_change(&self, path: &Path, models_root: &Path) -> ConfigChange {
        if !path.exists() {
            let (removed, total): (Vec<String>, usize) = {
                let snapshot = self.snapshot();
                let removed = snapshot
                    .models
                    .values()
                    .filter(|m| m.source.starts_with(path))
                    .map(|m| m.full_id.clone())
                    .collect();
                (removed, snapshot.models.len())
            };
            if removed.is_empty() {
                return ConfigChange::Ignored;
            }
            if removed.len() == total {
                warn!(models = ?removed, "Keeping the last model configs, the store may not become empty");
                return ConfigChange::Rejected(format!(
                    "removing {} would leave no model configurations",
                    path.display()
                ));
            }
            let ids = removed.clone();
            self.swap(move |snapshot| {
                for id in &ids {
                    snapshot.models.remove(id);
                }
            });
            info!(models = ?removed, "Removed model config");
            return ConfigChange::ModelsRemoved(removed);
        }

        if model_key(path, models_root).is_none() || !path.is_file() {
            return ConfigChange::Ignored;
        }

        let globals = self.snapshot().model_globals.clone();
        match load_model_file(path, models_root, &globals) {
            Ok(model) => {
                let id = model.full_id.clone();
                let enabled = model.enabled;
                self.swap(move |snapshot| {
                    snapshot.models.insert(model.full_id.clone(), Arc::new(model));
                });
                info!(model = %id, enabled, "Reloaded model config");
                ConfigChange::ModelUpdated(id)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring invalid model config change");
                ConfigChange::Rejected(e.to_string())
            }
        }
    }

    fn apply_tool_change(&self, path: &Path) -> ConfigChange {
        if !path.exists() {
            let removed: Vec<String> = {
                let snapshot = self.snapshot();
                snapshot
                    .tools
                    .values()
                    .filter(|t| t.tool_dir.join(GLOBAL_CONFIG_FILE) == path || t.tool_dir.starts_with(path))
                    .map(|t| t.id.clone())
                    .collect()
            };
            if removed.is_empty() {
                return ConfigChange::Ignored;
            }
            let ids = removed.clone();
            self.swap(move |snapshot| {
                for id in &ids {
                    snapshot.tools.remove(id);
                }
            });
            info!(tools = ?removed, "Removed tool config");
            return ConfigChange::ToolsRemoved(removed);
        }

        let Some(tool_dir) = tool_dir_for(path, &self.paths.tools_dir) else {
            return ConfigChange::Ignored;
        };
        match load_tool_dir(&tool_dir) {
            Ok(tool) => {
                let id = tool.id.clone();
                self.swap(move |snapshot| {
                    snapshot.tools.retain(|_, t| t.tool_dir != tool.tool_dir);
                    snapshot.tools.insert(tool.id.clone(), Arc::new(tool));
                });
                info!(tool = %id, "Reloaded tool config");
                ConfigChange::ToolUpdated(id)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring invalid tool config change");
                ConfigChange::Rejected(e.to_string())
            }
        }
    }

    fn reload_model_globals(&self) -> ConfigChange {
        match load_model_globals(&self.paths.model_globals_file()) {
            Ok(globals) => {
                self.swap(move |snapshot| snapshot.model_globals = globals);
                info!("Reloaded global model defaults");
                ConfigChange::ModelDefaultsReloaded
            }
            Err(e) => {
                warn!(error = %e, "Ignoring invalid global model config change");
                ConfigChange::Rejected(e.to_string())
            }
        }
    }

    fn reload_tool_globals(&self) -> ConfigChange {
        match load_tool_globals(&self.paths.tool_globals_file()) {
            Ok(globals) => {
                self.swap(move |snapshot| snapshot.tool_globals = globals);
                info!("Reloaded global tools config");
                ConfigChange::ToolGlobalsReloaded
            }
            Err(e) => {
                warn!(error = %e, "Ignoring invalid global tools config change");
                ConfigChange::Rejected(e.to_string())
            }
        }
    }
}
