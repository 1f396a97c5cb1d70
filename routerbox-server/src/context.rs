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

//! Shared application state

use crate::config::ServerConfig;
use crate::llm::{ProviderRegistry, Upstream};
use crate::local::LocalSupervisor;
use crate::rate_limit::RateLimiter;
use crate::router::ChatRouter;
use crate::tool_loop::ToolLoop;
use crate::tool_runtime::ToolRuntime;
use anyhow::Result;
use chrono::{DateTime, Utc};
use routerbox_core::{ConfigStore, StorePaths};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Services behind the HTTP API, held in axum `State`
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<ConfigStore>,
    pub limiter: Arc<RateLimiter>,
    pub tools: Arc<ToolRuntime>,
    pub local: Arc<LocalSupervisor>,
    pub providers: Arc<ProviderRegistry>,
    pub router: Arc<ChatRouter>,
    /// Bound on a whole non-streaming completion
    pub request_timeout: Duration,
    pub started_at: DateTime<Utc>,
}

impl AppContext {
    /// Load the configuration trees and wire every service from server config
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let paths = StorePaths::new(config.paths.model_config_dir.clone(), config.paths.tools_dir.clone());
        let store = Arc::new(ConfigStore::load(paths)?);
        let snapshot = store.snapshot();
        info!(
            models = snapshot.models.len(),
            tools = snapshot.tools.len(),
            "Loaded model and tool configuration"
        );

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        let local = Arc::new(LocalSupervisor::new(config.local.clone(), client));
        let upstream = Upstream::new(Duration::from_secs(config.providers.request_timeout_secs))?;
        let providers = ProviderRegistry::from_config(&config.providers, upstream, local.clone());
        info!(providers = ?providers.names(), "Provider registry ready");

        Ok(Self::from_parts(config, store, local, providers))
    }

    /// Wire the services around an already loaded store and registry
    pub fn from_parts(
        config: &ServerConfig,
        store: Arc<ConfigStore>,
        local: Arc<LocalSupervisor>,
        providers: ProviderRegistry,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let tools = Arc::new(ToolRuntime::new(config.tools.clone(), store.clone()));
        let providers = Arc::new(providers);
        let tool_loop = Arc::new(ToolLoop::new(tools.clone(), config.tools.max_tool_rounds));
        let router = Arc::new(ChatRouter::new(
            store.clone(),
            limiter.clone(),
            providers.clone(),
            tool_loop,
        ));

        Self {
            store,
            limiter,
            tools,
            local,
            providers,
            router,
            request_timeout: Duration::from_secs(config.server.request_timeout_secs.max(1)),
            started_at: Utc::now(),
        }
    }

    /// Rate-limit sweep and local idle reaper; both stop when `cancel` fires
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.limiter.spawn_sweeper(cancel.clone())];
        tasks.extend(self.local.spawn_idle_reaper(cancel.clone()));
        tasks
    }

    /// Reject queued requests, cancel running tools, stop local servers
    pub async fn shutdown(&self) {
        self.limiter.shutdown();
        self.tools.cancel_all().await;
        self.local.stop_all().await;
        info!("Services shut down");
    }
}
