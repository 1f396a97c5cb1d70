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

pub mod api;
pub mod config;
pub mod context;
pub mod llm;
pub mod local;
pub mod rate_limit;
pub mod router;
pub mod tool_loop;
pub mod tool_runtime;

use anyhow::Result;
use axum::{http::HeaderValue, Router};
use routerbox_core::{ConfigWatcher, GlobalModelConfig, DEFAULT_DEBOUNCE};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use config::ServerConfig;
pub use context::AppContext;

fn cors_layer(server: &config::HttpServerConfig) -> CorsLayer {
    if !server.enable_cors {
        return CorsLayer::new();
    }
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if server.cors_origins.is_empty() {
        tracing::warn!("CORS: Allowing all origins (development mode). Set cors_origins in production!");
        return cors.allow_origin(Any);
    }
    tracing::info!("CORS: Allowing origins: {:?}", server.cors_origins);
    let origins: Vec<HeaderValue> = server
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("CORS: Ignoring invalid origin {:?}", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

/// Public routes at the root and under `/v1`, with CORS and request tracing
pub fn build_router(ctx: AppContext, config: &ServerConfig) -> Router {
    Router::new()
        .merge(api::routes())
        .nest("/v1", api::routes())
        .with_state(ctx)
        .layer(cors_layer(&config.server))
        .layer(TraceLayer::new_for_http())
}

fn init_tracing(log_format: &str) {
    let json = log_format.eq_ignore_ascii_case("json");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "routerbox_server=info,routerbox_core=info,tower_http=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            futures::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                futures::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// The server toggle (file, env or `--no-hot-reload`) can only switch
/// watching off; `hotReload` in config.json can switch it off as well.
pub fn hot_reload_enabled(config: &ServerConfig, globals: &GlobalModelConfig) -> bool {
    config.paths.hot_reload && globals.hot_reload.unwrap_or(true)
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    init_tracing(&config.server.log_format);

    tracing::info!("Starting Routerbox");
    tracing::debug!("Configuration: {:#?}", config);

    config.validate()?;
    let addr = config.socket_addr()?;

    let ctx = AppContext::new(&config)?;

    let hot_reload = hot_reload_enabled(&config, &ctx.store.snapshot().model_globals);
    let watcher = if hot_reload {
        match ConfigWatcher::spawn(ctx.store.clone(), DEFAULT_DEBOUNCE) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!("Hot reload disabled, failed to start config watcher: {}", e);
                None
            }
        }
    } else {
        tracing::info!("Hot reload disabled");
        None
    };

    let cancel = CancellationToken::new();
    let background = ctx.spawn_background(&cancel);

    let app = build_router(ctx.clone(), &config);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Routerbox listening on http://{}", addr);

    let shutdown_ctx = ctx.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, draining");
            shutdown_ctx.shutdown().await;
        })
        .await?;

    cancel.cancel();
    for task in background {
        let _ = task.await;
    }
    drop(watcher);
    tracing::info!("Routerbox stopped");
    Ok(())
}
