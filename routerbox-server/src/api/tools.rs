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

use crate::api::ApiError;
use crate::context::AppContext;
use crate::tool_runtime::{ExecutionRecord, ExecutionState};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Serialize)]
pub struct ToolSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub enabled: bool,
    pub allowed_models: Vec<String>,
    pub category: Option<String>,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ToolListResponse {
    pub enabled: bool,
    pub tools: Vec<ToolSummary>,
}

/// GET /tools - every configured tool, including disabled ones
pub async fn list_tools(State(ctx): State<AppContext>) -> Json<ToolListResponse> {
    let tools = ctx
        .store
        .get_all_tools()
        .iter()
        .map(|tool| ToolSummary {
            id: tool.id.clone(),
            name: tool.name.clone(),
            description: tool.description.clone(),
            version: tool.version.clone(),
            enabled: tool.enabled,
            allowed_models: tool.allowed_models.clone(),
            category: tool.category.clone(),
            parameters: tool.parameters.clone(),
        })
        .collect();
    Json(ToolListResponse {
        enabled: ctx.store.tool_globals().enabled,
        tools,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecutionQuery {
    /// Only records in this state (`running`, `paused`, ...)
    pub state: Option<String>,
    pub tool: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecutionListResponse {
    pub active: usize,
    pub executions: Vec<ExecutionRecord>,
}

fn state_name(state: ExecutionState) -> String {
    serde_json::to_value(state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// GET /tools/executions - active and recently finished executions
pub async fn list_executions(
    State(ctx): State<AppContext>,
    Query(query): Query<ExecutionQuery>,
) -> Json<ExecutionListResponse> {
    let executions = ctx
        .tools
        .list_executions()
        .into_iter()
        .filter(|r| query.state.as_deref().map_or(true, |s| state_name(r.state) == s))
        .filter(|r| query.tool.as_deref().map_or(true, |t| r.tool_id == t))
        .collect();
    Json(ExecutionListResponse {
        active: ctx.tools.active_count(),
        executions,
    })
}

/// GET /tools/executions/:id
pub async fn get_execution(
    State(ctx): State<AppContext>,
    Path(execution_id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    current(&ctx, &execution_id)
}

fn current(ctx: &AppContext, execution_id: &str) -> Result<Json<ExecutionRecord>, ApiError> {
    ctx.tools
        .get_status(execution_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("execution {}", execution_id)))
}

/// POST /tools/executions/:id/pause
pub async fn pause_execution(
    State(ctx): State<AppContext>,
    Path(execution_id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    ctx.tools.pause(&execution_id).await?;
    info!(execution_id = %execution_id, "Paused tool execution");
    current(&ctx, &execution_id)
}

/// POST /tools/executions/:id/resume
pub async fn resume_execution(
    State(ctx): State<AppContext>,
    Path(execution_id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    ctx.tools.resume(&execution_id).await?;
    info!(execution_id = %execution_id, "Resumed tool execution");
    current(&ctx, &execution_id)
}

/// POST /tools/executions/:id/cancel
pub async fn cancel_execution(
    State(ctx): State<AppContext>,
    Path(execution_id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    ctx.tools.cancel(&execution_id).await?;
    info!(execution_id = %execution_id, "Cancelled tool execution");
    current(&ctx, &execution_id)
}
