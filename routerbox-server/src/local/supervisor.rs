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

//! Child inference-server supervision

use super::discovery::{self, LocalModel};
use crate::config::{resolve_binary, LocalConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);
const PORT_SCAN_SPAN: u16 = 100;
const OUTPUT_TAIL_LINES: usize = 20;
/// Time a stopping server gets to exit on SIGTERM before it is killed
const STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Local inference is disabled")]
    Disabled,

    #[error("Local model not found: {0}")]
    ModelNotFound(String),

    #[error("No free port in {from}..{to}")]
    NoFreePort { from: u16, to: u16 },

    #[error("Failed to start inference server for {model}: {reason}")]
    Spawn { model: String, reason: String },

    #[error("Inference server for {model} not ready after {secs}s")]
    StartupTimeout { model: String, secs: u64 },

    #[error("Inference server for {model} failed its health check: {reason}")]
    HealthCheck { model: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Starting,
    Ready,
    Dead,
}

/// Address of a ready server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEndpoint {
    pub model_name: String,
    pub port: u16,
    pub base_url: String,
}

/// What a launcher is asked to start
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub model: LocalModel,
    pub binary: String,
    pub host: String,
    pub port: u16,
    pub extra_args: Vec<String>,
}

/// Starts the child process for a model. The default spawns `llama-server`.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Child>;
}

/// `<binary> -m <artifact> --host <host> --port <port> [extra args]`
#[derive(Debug, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl ServerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Child> {
        let binary = resolve_binary(&spec.binary).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("inference binary {} not found", spec.binary),
            )
        })?;

        Command::new(binary)
            .arg("-m")
            .arg(&spec.model.artifact)
            .arg("--host")
            .arg(&spec.host)
            .arg("--port")
            .arg(spec.port.to_string())
            .args(&spec.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Copy of one server's bookkeeping
#[derive(Debug, Clone, Serialize)]
pub struct ServerHandle {
    pub model_name: String,
    pub port: u16,
    pub base_url: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub state: ServerState,
    /// Found already running rather than spawned by us
    pub external: bool,
}

struct ServerEntry {
    generation: u64,
    handle: ServerHandle,
    last_used: Instant,
    stop: Option<CancellationToken>,
}

impl ServerEntry {
    fn endpoint(&self) -> LocalEndpoint {
        LocalEndpoint {
            model_name: self.handle.model_name.clone(),
            port: self.handle.port,
            base_url: self.handle.base_url.clone(),
        }
    }
}

pub struct LocalSupervisor {
    config: LocalConfig,
    client: reqwest::Client,
    launcher: Arc<dyn ServerLauncher>,
    servers: Arc<DashMap<String, ServerEntry>>,
    startup: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    reserved_ports: Arc<Mutex<BTreeSet<u16>>>,
    generation: AtomicU64,
}

impl LocalSupervisor {
    pub fn new(config: LocalConfig, client: reqwest::Client) -> Self {
        Self::with_launcher(config, client, Arc::new(ProcessLauncher))
    }

    pub fn with_launcher(
        config: LocalConfig,
        client: reqwest::Client,
        launcher: Arc<dyn ServerLauncher>,
    ) -> Self {
        Self {
            config,
            client,
            launcher,
            servers: Arc::new(DashMap::new()),
            startup: DashMap::new(),
            reserved_ports: Arc::new(Mutex::new(BTreeSet::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn has_pre_started_server(&self) -> bool {
        self.config.server_url.is_some()
    }

    pub fn available_models(&self) -> Vec<LocalModel> {
        discovery::discover(&self.config.models_dir)
    }

    pub fn servers(&self) -> Vec<ServerHandle> {
        let mut servers: Vec<ServerHandle> =
            self.servers.iter().map(|e| e.handle.clone()).collect();
        servers.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        servers
    }

    pub fn running_count(&self) -> usize {
        self.servers.len()
    }

    /// Return a ready server for `model_name`, spawning one if needed.
    ///
    /// A pre-started server is adopted even when spawning is disabled. Concurrent callers for the same model wait on one startup; the returned
    /// port has answered `/v1/models`.
    pub async fn ensure_running(&self, model_name: &str) -> Result<LocalEndpoint, SupervisorError> {
        let lock = self
            .startup
            .entry(model_name.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        if let Some(endpoint) = self.reuse_tracked(model_name).await {
            return Ok(endpoint);
        }
        if let Some(endpoint) = self.adopt_running(model_name).await {
            return Ok(endpoint);
        }

        if !self.config.enabled {
            return Err(SupervisorError::Disabled);
        }
        let model = discovery::find(&self.config.models_dir, model_name)
            .ok_or_else(|| SupervisorError::ModelNotFound(model_name.to_string()))?;
        self.spawn_server(model).await
    }

    /// Tracked server that still answers
    async fn reuse_tracked(&self, model_name: &str) -> Option<LocalEndpoint> {
        let (endpoint, generation, stop) = {
            let entry = self.servers.get(model_name)?;
            (entry.endpoint(), entry.generation, entry.stop.clone())
        };

        if probe_models(&self.client, &endpoint.base_url).await.is_ok() {
            if let Some(mut entry) = self.servers.get_mut(model_name) {
                entry.last_used = Instant::now();
                entry.handle.last_used_at = Utc::now();
            }
            return Some(endpoint);
        }

        warn!(model = %model_name, port = endpoint.port, "Local server stopped answering, replacing it");
        self.servers
            .remove_if(model_name, |_, entry| entry.generation == generation);
        if let Some(stop) = stop {
            stop.cancel();
        }
        None
    }

    /// A server we did not start, at the configured URL or a common port
    async fn adopt_running(&self, model_name: &str) -> Option<LocalEndpoint> {
        let mut candidates = Vec::new();
        if let Some(url) = &self.config.server_url {
            let url = url.trim_end_matches('/').trim_end_matches("/v1").to_string();
            match &self.config.server_name {
                // the named model is assumed to be what that server serves
                Some(name) if name == model_name => {
                    if probe_models(&self.client, &url).await.is_ok() {
                        return Some(self.track_external(model_name, &url));
                    }
                }
                Some(_) => {}
                None => candidates.push(url),
            }
        }
        candidates.extend(
            self.config
                .probe_ports
                .iter()
                .map(|port| format!("http://{}:{}", self.config.host, port)),
        );

        for base_url in candidates {
            match probe_models(&self.client, &base_url).await {
                Ok(ids) if serves(&ids, model_name) => {
                    return Some(self.track_external(model_name, &base_url));
                }
                Ok(_) => debug!(url = %base_url, model = %model_name, "Server serves a different model"),
                Err(_) => {}
            }
        }
        None
    }

    fn track_external(&self, model_name: &str, base_url: &str) -> LocalEndpoint {
        let port = url::Url::parse(base_url)
            .ok()
            .and_then(|u| u.port_or_known_default())
            .unwrap_or(0);
        info!(model = %model_name, url = %base_url, "Reusing running inference server");

        let now = Utc::now();
        let entry = ServerEntry {
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            handle: ServerHandle {
                model_name: model_name.to_string(),
                port,
                base_url: base_url.to_string(),
                pid: None,
                started_at: now,
                last_used_at: now,
                state: ServerState::Ready,
                external: true,
            },
            last_used: Instant::now(),
            stop: None,
        };
        let endpoint = entry.endpoint();
        self.servers.insert(model_name.to_string(), entry);
        endpoint
    }

    fn reserve_port(&self) -> Result<u16, SupervisorError> {
        let from = self.config.base_port;
        let to = from.saturating_add(PORT_SCAN_SPAN);
        let mut reserved = self.reserved_ports.lock();
        for port in from..to {
            if reserved.contains(&port) {
                continue;
            }
            if std::net::TcpListener::bind((self.config.host.as_str(), port)).is_ok() {
                reserved.insert(port);
                return Ok(port);
            }
        }
        Err(SupervisorError::NoFreePort { from, to })
    }

    async fn spawn_server(&self, model: LocalModel) -> Result<LocalEndpoint, SupervisorError> {
        let name = model.name.clone();
        let port = self.reserve_port()?;
        let release = |reserved: &Mutex<BTreeSet<u16>>| {
            reserved.lock().remove(&port);
        };

        let spec = LaunchSpec {
            model,
            binary: self.config.server_binary.clone(),
            host: self.config.host.clone(),
            port,
            extra_args: self.config.extra_args.clone(),
        };
        info!(model = %name, port, artifact = %spec.model.artifact.display(), "Starting inference server");

        let mut child = match self.launcher.launch(&spec).await {
            Ok(child) => child,
            Err(e) => {
                release(&self.reserved_ports);
                return Err(SupervisorError::Spawn {
                    model: name,
                    reason: e.to_string(),
                });
            }
        };
        let pid = child.id();
        let base_url = format!("http://{}:{}", self.config.host, port);

        let (line_tx, mut lines) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, line_tx);
        }

        let timeout = Duration::from_secs(self.config.startup_timeout_secs);
        let deadline = Instant::now() + timeout;
        let ready = async {
            self.wait_for_marker(&name, &mut child, &mut lines, deadline)
                .await?;
            self.wait_for_health(&name, &base_url, deadline).await
        }
        .await;

        if let Err(e) = ready {
            warn!(model = %name, port, error = %e, "Inference server failed to start");
            let _ = child.kill().await;
            release(&self.reserved_ports);
            return Err(e);
        }

        let stop = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let entry = ServerEntry {
            generation,
            handle: ServerHandle {
                model_name: name.clone(),
                port,
                base_url,
                pid,
                started_at: now,
                last_used_at: now,
                state: ServerState::Ready,
                external: false,
            },
            last_used: Instant::now(),
            stop: Some(stop.clone()),
        };
        let endpoint = entry.endpoint();
        self.servers.insert(name.clone(), entry);
        info!(model = %name, port, pid = ?pid, "Inference server ready");

        self.monitor(name, generation, port, child, lines, stop);
        Ok(endpoint)
    }

    async fn wait_for_marker(
        &self,
        name: &str,
        child: &mut Child,
        lines: &mut mpsc::Receiver<String>,
        deadline: Instant,
    ) -> Result<(), SupervisorError> {
        let markers = &self.config.readiness_markers;
        if markers.is_empty() {
            return Ok(());
        }

        let mut tail: VecDeque<String> = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        let mut output_open = true;
        loop {
            tokio::select! {
                line = lines.recv(), if output_open => match line {
                    Some(line) => {
                        if markers.iter().any(|m| line.contains(m.as_str())) {
                            return Ok(());
                        }
                        if tail.len() == OUTPUT_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                    None => output_open = false,
                },
                status = child.wait() => {
                    let status = status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|e| e.to_string());
                    // output still in the pipes explains the exit
                    while let Ok(Some(line)) =
                        tokio::time::timeout(Duration::from_millis(200), lines.recv()).await
                    {
                        if tail.len() == OUTPUT_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                    let output: Vec<String> = tail.into_iter().collect();
                    return Err(SupervisorError::Spawn {
                        model: name.to_string(),
                        reason: format!("exited ({}) before ready: {}", status, output.join(" | ")),
                    });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(SupervisorError::StartupTimeout {
                        model: name.to_string(),
                        secs: self.config.startup_timeout_secs,
                    });
                }
            }
        }
    }

    async fn wait_for_health(
        &self,
        name: &str,
        base_url: &str,
        deadline: Instant,
    ) -> Result<(), SupervisorError> {
        loop {
            let last_error = match probe_models(&self.client, base_url).await {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };
            if Instant::now() + HEALTH_POLL_INTERVAL >= deadline {
                return Err(SupervisorError::HealthCheck {
                    model: name.to_string(),
                    reason: last_error,
                });
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// Drain output and drop the entry when the process exits
    fn monitor(
        &self,
        name: String,
        generation: u64,
        port: u16,
        mut child: Child,
        mut lines: mpsc::Receiver<String>,
        stop: CancellationToken,
    ) {
        let servers = self.servers.clone();
        let reserved = self.reserved_ports.clone();
        tokio::spawn(async move {
            let mut output_open = true;
            let status = loop {
                tokio::select! {
                    line = lines.recv(), if output_open => match line {
                        Some(line) => debug!(model = %name, "{}", line),
                        None => output_open = false,
                    },
                    status = child.wait() => break status.ok(),
                    _ = stop.cancelled() => {
                        shutdown_child(&mut child, STOP_GRACE).await;
                        break None;
                    }
                }
            };

            if let Some(mut entry) = servers.get_mut(&name) {
                if entry.generation == generation {
                    entry.handle.state = ServerState::Dead;
                }
            }
            servers.remove_if(&name, |_, entry| entry.generation == generation);
            reserved.lock().remove(&port);
            match status {
                Some(status) => warn!(model = %name, port, %status, "Inference server exited"),
                None => info!(model = %name, port, "Inference server stopped"),
            }
        });
    }

    pub fn stop(&self, model_name: &str) -> bool {
        let stop = match self.servers.get(model_name) {
            Some(entry) => entry.stop.clone(),
            None => return false,
        };
        match stop {
            Some(stop) => {
                stop.cancel();
                true
            }
            None => self.servers.remove(model_name).is_some(),
        }
    }

    /// Stop every spawned server and forget adopted ones
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        for name in &names {
            self.stop(name);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.servers.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !names.is_empty() {
            info!(count = names.len(), "Local inference servers stopped");
        }
    }

    /// Stop spawned servers unused for longer than `idle`
    pub fn reap_idle(&self, idle: Duration) -> usize {
        let idle_names: Vec<String> = self
            .servers
            .iter()
            .filter(|e| !e.handle.external && e.last_used.elapsed() > idle)
            .map(|e| e.key().clone())
            .collect();
        for name in &idle_names {
            info!(model = %name, "Stopping idle inference server");
            self.stop(name);
        }
        idle_names.len()
    }

    pub fn spawn_idle_reaper(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let idle = Duration::from_secs(self.config.idle_timeout_secs?);
        let tick = (idle / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
        let supervisor = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        supervisor.reap_idle(idle);
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }))
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

/// Model ids listed by `GET {base_url}/v1/models`
async fn probe_models(client: &reqwest::Client, base_url: &str) -> Result<Vec<String>, String> {
    let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let response = client
        .get(&url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("{} returned {}", url, response.status()));
    }
    let body: Value = response.json().await.map_err(|e| e.to_string())?;
    Ok(body
        .get("data")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get("id").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default())
}

/// llama-server reports the artifact path or an alias as the model id
fn serves(ids: &[String], model_name: &str) -> bool {
    ids.iter().any(|id| {
        let path = Path::new(id);
        id == model_name
            || path.components().any(|c| c.as_os_str() == model_name)
            || path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|stem| stem.starts_with(model_name))
                .unwrap_or(false)
    })
}

#[cfg(unix)]
fn request_exit(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn request_exit(_pid: u32) -> bool {
    false
}

/// SIGTERM, then SIGKILL once `grace` runs out
async fn shutdown_child(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        if request_exit(pid) && tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill inference server");
    }
}
