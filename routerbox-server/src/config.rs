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

use anyhow::Result;
use routerbox_core::RateLimitSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Routerbox Server Configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpServerConfig {
    /// HTTP API listen address (e.g., "127.0.0.1:3000")
    #[serde(default = "default_http_addr")]
    pub listen_addr: String,

    /// Request timeout in seconds for non-streaming requests
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,

    /// Allowed CORS origins (empty = allow all)
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_http_addr(),
            request_timeout_secs: default_request_timeout(),
            enable_cors: true,
            cors_origins: vec![],
            log_format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    /// Holds `config.json` and `models/<provider>/<id>.json`
    #[serde(default = "default_model_config_dir")]
    pub model_config_dir: PathBuf,

    /// Holds `config.json` and one directory per tool
    #[serde(default = "default_tools_dir")]
    pub tools_dir: PathBuf,

    /// Watch both trees and apply changes without a restart
    #[serde(default = "default_true")]
    pub hot_reload: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model_config_dir: default_model_config_dir(),
            tools_dir: default_tools_dir(),
            hot_reload: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Master switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Park blocked requests instead of rejecting them
    #[serde(default = "default_true")]
    pub queue_enabled: bool,

    /// Maximum waiting requests per queue
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// How long a request may wait in a queue
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,

    /// Queue worker recheck interval
    #[serde(default = "default_worker_interval_ms")]
    pub worker_interval_ms: u64,

    /// Gateway-wide per-IP limit; `None` disables the IP scope
    #[serde(default = "default_ip_limit")]
    pub ip_limit: Option<RateLimitSpec>,

    /// Interval of the expired bucket sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_enabled: true,
            max_queue_size: default_max_queue_size(),
            processing_timeout_ms: default_processing_timeout_ms(),
            worker_interval_ms: default_worker_interval_ms(),
            ip_limit: default_ip_limit(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolsConfig {
    /// Fallback when a tool sets no `maxExecutionTime`
    #[serde(default = "default_tool_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Simultaneous tool executions across the gateway
    #[serde(default = "default_max_concurrent_tool_calls")]
    pub max_concurrent_tool_calls: usize,

    /// Tool rounds per chat turn before the loop gives up
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,

    /// Capacity of the execution event bus
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Time between terminate and kill on cancel or timeout
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// How long finished execution records stay queryable
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_tool_timeout_ms(),
            max_concurrent_tool_calls: default_max_concurrent_tool_calls(),
            max_tool_rounds: default_max_tool_rounds(),
            event_buffer: default_event_buffer(),
            kill_grace_ms: default_kill_grace_ms(),
            retention_secs: default_retention_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalConfig {
    /// Serve `local` provider models from child inference servers
    #[serde(default)]
    pub enabled: bool,

    /// One subdirectory per model, each holding a `.gguf` artifact
    #[serde(default = "default_local_models_dir")]
    pub models_dir: PathBuf,

    /// Inference server binary (name on PATH or a path)
    #[serde(default = "default_server_binary")]
    pub server_binary: String,

    /// Extra arguments appended to the launch command
    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default = "default_local_host")]
    pub host: String,

    /// First port tried when spawning
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// Output substrings that signal readiness
    #[serde(default = "default_readiness_markers")]
    pub readiness_markers: Vec<String>,

    /// Pre-started server to reuse before spawning
    #[serde(default)]
    pub server_url: Option<String>,

    /// Model name served by `server_url`
    #[serde(default)]
    pub server_name: Option<String>,

    /// Ports probed on `host` for an already-running server
    #[serde(default = "default_probe_ports")]
    pub probe_ports: Vec<u16>,

    /// Stop servers unused for this long
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            models_dir: default_local_models_dir(),
            server_binary: default_server_binary(),
            extra_args: vec![],
            host: default_local_host(),
            base_port: default_base_port(),
            startup_timeout_secs: default_startup_timeout_secs(),
            readiness_markers: default_readiness_markers(),
            server_url: None,
            server_name: None,
            probe_ports: default_probe_ports(),
            idle_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProviderEndpoint {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

/// A named OpenAI-compatible upstream, selectable via `routing.service`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceEndpoint {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Read the key from this variable when `api_key` is unset
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ServiceEndpoint {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_ref()
                .and_then(|name| std::env::var(name).ok())
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub anthropic: ProviderEndpoint,
    #[serde(default)]
    pub openai: ProviderEndpoint,
    #[serde(default)]
    pub google: ProviderEndpoint,
    #[serde(default)]
    pub openrouter: ProviderEndpoint,
    #[serde(default)]
    pub ollama: ProviderEndpoint,

    /// Named OpenAI-compatible services
    #[serde(default)]
    pub services: HashMap<String, ServiceEndpoint>,

    /// Upstream request timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic: ProviderEndpoint::default(),
            openai: ProviderEndpoint::default(),
            google: ProviderEndpoint::default(),
            openrouter: ProviderEndpoint::default(),
            ollama: ProviderEndpoint::default(),
            services: HashMap::new(),
            request_timeout_secs: default_provider_timeout(),
        }
    }
}

// Default values
fn default_http_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_model_config_dir() -> PathBuf {
    PathBuf::from("./model_config")
}

fn default_tools_dir() -> PathBuf {
    PathBuf::from("./tools")
}

fn default_max_queue_size() -> usize {
    100
}

fn default_processing_timeout_ms() -> u64 {
    30_000
}

fn default_worker_interval_ms() -> u64 {
    1_000
}

fn default_ip_limit() -> Option<RateLimitSpec> {
    Some(RateLimitSpec::per_hour(50))
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrent_tool_calls() -> usize {
    5
}

fn default_max_tool_rounds() -> usize {
    5
}

fn default_event_buffer() -> usize {
    256
}

fn default_kill_grace_ms() -> u64 {
    5_000
}

fn default_retention_secs() -> u64 {
    600
}

fn default_local_models_dir() -> PathBuf {
    PathBuf::from("./local_models")
}

fn default_server_binary() -> String {
    "llama-server".to_string()
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_base_port() -> u16 {
    8090
}

fn default_startup_timeout_secs() -> u64 {
    120
}

fn default_readiness_markers() -> Vec<String> {
    vec![
        "server is listening".to_string(),
        "HTTP server listening".to_string(),
    ]
}

fn default_probe_ports() -> Vec<u16> {
    vec![8080, 8081, 8000, 1234, 5000]
}

fn default_provider_timeout() -> u64 {
    120
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - ROUTERBOX_HTTP_ADDR: HTTP listen address (default: 127.0.0.1:3000)
    /// - ROUTERBOX_MODEL_CONFIG_DIR: model configuration root (default: ./model_config)
    /// - ROUTERBOX_TOOLS_DIR: tools root (default: ./tools)
    /// - ROUTERBOX_LOG_FORMAT: "pretty" or "json"
    /// - RATE_LIMITING_ENABLED, RATE_LIMIT_QUEUE_ENABLED, RATE_LIMIT_QUEUE_MAX_SIZE,
    ///   RATE_LIMIT_QUEUE_TIMEOUT_MS
    /// - MODEL_CONFIG_HOT_RELOAD
    /// - ANTHROPIC_API_KEY, OPENAI_API_KEY, GOOGLE_API_KEY (or GEMINI_API_KEY),
    ///   OPENROUTER_API_KEY, OLLAMA_BASE_URL
    /// - LOCAL_MODELS_PATH, LLAMA_SERVER_PATH, LOCAL_LLM_SERVER_URL, LOCAL_LLM_SERVER_NAME
    ///   (any of these enables local inference)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Server configuration
        if let Ok(addr) = std::env::var("ROUTERBOX_HTTP_ADDR") {
            config.server.listen_addr = addr;
        }

        if let Ok(format) = std::env::var("ROUTERBOX_LOG_FORMAT") {
            config.server.log_format = format;
        }

        // Paths
        if let Ok(dir) = std::env::var("ROUTERBOX_MODEL_CONFIG_DIR") {
            config.paths.model_config_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("ROUTERBOX_TOOLS_DIR") {
            config.paths.tools_dir = PathBuf::from(dir);
        }

        if let Some(hot) = env_flag("MODEL_CONFIG_HOT_RELOAD") {
            config.paths.hot_reload = hot;
        }

        // Rate limiting
        if let Some(enabled) = env_flag("RATE_LIMITING_ENABLED") {
            config.rate_limit.enabled = enabled;
        }

        if let Some(enabled) = env_flag("RATE_LIMIT_QUEUE_ENABLED") {
            config.rate_limit.queue_enabled = enabled;
        }

        if let Ok(size) = std::env::var("RATE_LIMIT_QUEUE_MAX_SIZE") {
            if let Ok(val) = size.parse() {
                config.rate_limit.max_queue_size = val;
            }
        }

        if let Ok(timeout) = std::env::var("RATE_LIMIT_QUEUE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse() {
                config.rate_limit.processing_timeout_ms = val;
            }
        }

        // Providers
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            config.providers.anthropic.api_key = Some(key);
        }

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.providers.openai.api_key = Some(key);
        }

        if let Ok(key) = std::env::var("GOOGLE_API_KEY").or_else(|_| std::env::var("GEMINI_API_KEY")) {
            config.providers.google.api_key = Some(key);
        }

        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            config.providers.openrouter.api_key = Some(key);
        }

        if let Ok(base_url) = std::env::var("OLLAMA_BASE_URL") {
            config.providers.ollama.base_url = Some(base_url);
        }

        // Local inference
        if let Ok(path) = std::env::var("LOCAL_MODELS_PATH") {
            config.local.models_dir = PathBuf::from(path);
            config.local.enabled = true;
        }

        if let Ok(path) = std::env::var("LLAMA_SERVER_PATH") {
            config.local.server_binary = path;
            config.local.enabled = true;
        }

        if let Ok(url) = std::env::var("LOCAL_LLM_SERVER_URL") {
            config.local.server_url = Some(url);
            config.local.enabled = true;
        }

        if let Ok(name) = std::env::var("LOCAL_LLM_SERVER_NAME") {
            config.local.server_name = Some(name);
        }

        config
    }

    /// Load configuration with priority: file > env > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
        } else {
            Self::default()
        };

        // Override with environment variables
        config = Self::merge_with_env(config);

        Ok(config)
    }

    /// Merge config with environment variables (env takes priority)
    fn merge_with_env(mut config: Self) -> Self {
        let env_config = Self::from_env();
        let set = |name: &str| std::env::var(name).is_ok();

        // Only override if env var was explicitly set
        if set("ROUTERBOX_HTTP_ADDR") {
            config.server.listen_addr = env_config.server.listen_addr;
        }
        if set("ROUTERBOX_LOG_FORMAT") {
            config.server.log_format = env_config.server.log_format;
        }
        if set("ROUTERBOX_MODEL_CONFIG_DIR") {
            config.paths.model_config_dir = env_config.paths.model_config_dir;
        }
        if set("ROUTERBOX_TOOLS_DIR") {
            config.paths.tools_dir = env_config.paths.tools_dir;
        }
        if set("MODEL_CONFIG_HOT_RELOAD") {
            config.paths.hot_reload = env_config.paths.hot_reload;
        }
        if set("RATE_LIMITING_ENABLED") {
            config.rate_limit.enabled = env_config.rate_limit.enabled;
        }
        if set("RATE_LIMIT_QUEUE_ENABLED") {
            config.rate_limit.queue_enabled = env_config.rate_limit.queue_enabled;
        }
        if set("RATE_LIMIT_QUEUE_MAX_SIZE") {
            config.rate_limit.max_queue_size = env_config.rate_limit.max_queue_size;
        }
        if set("RATE_LIMIT_QUEUE_TIMEOUT_MS") {
            config.rate_limit.processing_timeout_ms = env_config.rate_limit.processing_timeout_ms;
        }

        // Secrets from the environment fill gaps left by the file
        let providers = env_config.providers;
        config.providers.anthropic.api_key = config.providers.anthropic.api_key.or(providers.anthropic.api_key);
        config.providers.openai.api_key = config.providers.openai.api_key.or(providers.openai.api_key);
        config.providers.google.api_key = config.providers.google.api_key.or(providers.google.api_key);
        config.providers.openrouter.api_key = config.providers.openrouter.api_key.or(providers.openrouter.api_key);
        if set("OLLAMA_BASE_URL") {
            config.providers.ollama.base_url = providers.ollama.base_url;
        }

        if set("LOCAL_MODELS_PATH") {
            config.local.models_dir = env_config.local.models_dir;
            config.local.enabled = true;
        }
        if set("LLAMA_SERVER_PATH") {
            config.local.server_binary = env_config.local.server_binary;
            config.local.enabled = true;
        }
        if set("LOCAL_LLM_SERVER_URL") {
            config.local.server_url = env_config.local.server_url;
            config.local.enabled = true;
        }
        if set("LOCAL_LLM_SERVER_NAME") {
            config.local.server_name = env_config.local.server_name;
        }

        config
    }

    /// Parse listen address as SocketAddr
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Validate socket address
        self.socket_addr()?;

        if !self.paths.model_config_dir.is_dir() {
            anyhow::bail!(
                "Model config directory does not exist: {}",
                self.paths.model_config_dir.display()
            );
        }

        if self.rate_limit.worker_interval_ms == 0 {
            anyhow::bail!("rate_limit.worker_interval_ms must be positive");
        }

        if self.tools.max_concurrent_tool_calls == 0 {
            anyhow::bail!("tools.max_concurrent_tool_calls must be positive");
        }

        // A pre-started server makes the binary optional
        if self.local.enabled
            && self.local.server_url.is_none()
            && resolve_binary(&self.local.server_binary).is_none()
        {
            anyhow::bail!(
                "Local inference enabled but inference binary '{}' was not found",
                self.local.server_binary
            );
        }

        Ok(())
    }
}

/// Resolve a binary given as a path or as a name on `PATH`
pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(binary))
            .find(|path| path.is_file())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:3000");
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.processing_timeout_ms, 30_000);
        assert_eq!(config.rate_limit.ip_limit, Some(RateLimitSpec::per_hour(50)));
        assert!(!config.local.enabled);
    }

    #[test]
    fn test_from_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            [server]
            listen_addr = "0.0.0.0:9000"

            [rate_limit]
            queue_enabled = false
            ip_limit = { requests = 10, window = { amount = 1, unit = "minute" } }

            [providers.services.groq]
            base_url = "https://api.groq.com/openai/v1"
            api_key_env = "GROQ_API_KEY"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert!(!config.rate_limit.queue_enabled);
        assert_eq!(config.rate_limit.ip_limit, Some(RateLimitSpec::per_minute(10)));
        assert!(config.providers.services.contains_key("groq"));
        assert_eq!(config.tools.max_tool_rounds, 5);
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("ROUTERBOX_HTTP_ADDR", "0.0.0.0:8080");
        std::env::set_var("RATE_LIMIT_QUEUE_ENABLED", "false");

        let config = ServerConfig::from_env();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert!(!config.rate_limit.queue_enabled);

        std::env::remove_var("ROUTERBOX_HTTP_ADDR");
        std::env::remove_var("RATE_LIMIT_QUEUE_ENABLED");
    }

    #[test]
    fn test_validate_rejects_missing_model_dir() {
        let mut config = ServerConfig::default();
        config.paths.model_config_dir = PathBuf::from("/definitely/not/here");
        assert!(config.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        config.paths.model_config_dir = dir.path().to_path_buf();
        config.validate().unwrap();

        config.local.enabled = true;
        config.local.server_binary = "/definitely/not/llama-server".to_string();
        assert!(config.validate().is_err());
        config.local.server_url = Some("http://127.0.0.1:8080".to_string());
        config.validate().unwrap();
    }
}
