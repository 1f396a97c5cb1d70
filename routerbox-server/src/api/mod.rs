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

//! HTTP API
//!
//! OpenAI-compatible chat and model endpoints plus the operational surface
//! (health, tool executions). Every route is served both at the root and
//! under `/v1`.

pub mod chat;
pub mod error;
pub mod health;
pub mod models;
pub mod tools;

pub use chat::chat_completions;
pub use error::ApiError;
pub use health::health_check;
pub use models::{get_model, list_models};
pub use tools::{
    cancel_execution, get_execution, list_executions, list_tools, pause_execution, resume_execution,
};

use crate::context::AppContext;
use axum::{
    routing::{get, post},
    Router,
};

/// Public routes, unprefixed
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/models", get(list_models))
        .route("/models/:provider/:id", get(get_model))
        .route("/tools", get(list_tools))
        .route("/tools/executions", get(list_executions))
        .route("/tools/executions/:id", get(get_execution))
        .route("/tools/executions/:id/pause", post(pause_execution))
        .route("/tools/executions/:id/resume", post(resume_execution))
        .route("/tools/executions/:id/cancel", post(cancel_execution))
        .route("/health", get(health_check))
}
