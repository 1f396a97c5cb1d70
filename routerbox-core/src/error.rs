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

//! Error types shared by the gateway crates

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, RouterboxError>;

/// Errors surfaced by the configuration store and request model
#[derive(Debug, Error)]
pub enum RouterboxError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model is disabled: {0}")]
    ModelDisabled(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid configuration in {path}: {reason}")]
    InvalidConfig { path: String, reason: String },

    #[error("Watcher error: {0}")]
    Watch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RouterboxError {
    pub fn invalid_config(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request",
            Self::ModelNotFound(_) => "model_not_found",
            Self::ModelDisabled(_) => "model_disabled",
            Self::ToolNotFound(_) => "tool_not_found",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::Watch(_) => "watch_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "invalid_json",
        }
    }
}

impl From<notify::Error> for RouterboxError {
    fn from(err: notify::Error) -> Self {
        Self::Watch(err.to_string())
    }
}
