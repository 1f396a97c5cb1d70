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

use crate::context::AppContext;
use crate::local::ServerHandle;
use crate::rate_limit::RateLimitStats;
use axum::{extract::State, Json};
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: i64,
    pub config: ConfigHealth,
    pub providers: Vec<String>,
    pub local_servers: Vec<ServerHandle>,
    pub active_tool_executions: usize,
    pub rate_limit: RateLimitStats,
}

#[derive(Debug, Serialize)]
pub struct ConfigHealth {
    pub version: u64,
    pub models: usize,
    pub enabled_models: usize,
    pub tools: usize,
}

/// GET /health
pub async fn health_check(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    debug!("Health check requested");
    let snapshot = ctx.store.snapshot();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (Utc::now() - ctx.started_at).num_seconds(),
        config: ConfigHealth {
            version: snapshot.version,
            models: snapshot.models.len(),
            enabled_models: snapshot.models.values().filter(|m| m.enabled).count(),
            tools: snapshot.tools.len(),
        },
        providers: ctx.providers.names(),
        local_servers: ctx.local.servers(),
        active_tool_executions: ctx.tools.active_count(),
        rate_limit: ctx.limiter.stats(),
    })
}
