use crate::error::{ProxyError, Result};
use crate::providers::{BackendPreset, Dialect};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Used when an Anthropic request does not say whether it wants a stream.
    #[serde(default)]
    pub stream_default: bool,
    pub backend: BackendConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub model_cache: ModelCacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<Dialect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub normal: String,
    #[serde(default)]
    pub small: String,
    #[serde(default)]
    pub normal_provider: String,
    #[serde(default)]
    pub small_provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Explicit requested-name to upstream-name overrides.
    #[serde(default)]
    pub map: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    #[serde(default = "default_stream_idle_secs")]
    pub stream_idle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Send `message_stop` even when the model asked for a tool call.
    #[serde(default = "default_true")]
    pub stop_after_tool_use: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

fn default_port() -> u16 {
    4222
}

fn default_true() -> bool {
    true
}

fn default_connect_secs() -> u64 {
    30
}

fn default_request_secs() -> u64 {
    120
}

fn default_stream_idle_secs() -> u64 {
    300
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            request_secs: default_request_secs(),
            stream_idle_secs: default_stream_idle_secs(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stop_after_tool_use: true,
        }
    }
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
        }
    }
}

impl TimeoutsConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn stream_idle(&self) -> Duration {
        Duration::from_secs(self.stream_idle_secs)
    }
}

impl ProxyConfig {
    /// A config for the named backend preset with every other field defaulted.
    pub fn for_backend(name: impl Into<String>) -> Self {
        Self {
            port: default_port(),
            stream_default: false,
            backend: BackendConfig {
                name: name.into(),
                kind: None,
                base_url: None,
                api_key_env: None,
                api_key: None,
            },
            models: ModelsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            stream: StreamConfig::default(),
            model_cache: ModelCacheConfig::default(),
        }
    }

    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        Err(ProxyError::config(format!(
            "No config file found. Searched: {}",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    /// Resolve the upstream dialect (explicit kind or preset default)
    pub fn dialect(&self) -> Result<Dialect> {
        if let Some(kind) = self.backend.kind {
            return Ok(kind);
        }

        BackendPreset::from_name(&self.backend.name)
            .map(|p| p.dialect)
            .ok_or_else(|| {
                ProxyError::config(format!(
                    "Unknown backend '{}' and no kind configured. \
                     Set backend.kind to one of: openai, openwebui, ollama",
                    self.backend.name
                ))
            })
    }

    /// Resolve the effective base URL (config override or preset default)
    pub fn effective_base_url(&self) -> Result<String> {
        if let Some(ref url) = self.backend.base_url {
            return Ok(url.clone());
        }

        let preset = BackendPreset::from_name(&self.backend.name).ok_or_else(|| {
            ProxyError::config(format!(
                "Unknown backend '{}' and no base_url configured. Known backends: {}",
                self.backend.name,
                BackendPreset::all()
                    .iter()
                    .map(|p| p.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;

        Ok(preset.base_url.to_string())
    }

    /// Resolve the API key: literal value first, then the configured (or preset)
    /// environment variable. Local backends usually run without one.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(ref key) = self.backend.api_key {
            if !key.trim().is_empty() {
                return Some(key.clone());
            }
        }

        let env_name = self.backend.api_key_env.clone().or_else(|| {
            BackendPreset::from_name(&self.backend.name)
                .map(|p| p.default_api_key_env.to_string())
        })?;

        std::env::var(env_name).ok().filter(|k| !k.trim().is_empty())
    }

    /// Resolve the logical aliases clients send instead of a concrete model name.
    pub fn resolve_model_alias<'a>(&'a self, requested: &'a str) -> &'a str {
        let target = match requested {
            "base_model" | "normal" => &self.models.normal,
            "small_fast_model" | "small" => &self.models.small,
            _ => return requested,
        };
        if target.is_empty() {
            requested
        } else {
            target
        }
    }

    /// OpenRouter provider preference for an already-resolved model name.
    /// Models that are neither alias fall back to the normal preference.
    pub fn provider_preference(&self, model: &str) -> Option<&str> {
        let preference = if !self.models.small.is_empty() && model == self.models.small {
            &self.models.small_provider
        } else {
            &self.models.normal_provider
        };
        let preference = preference.trim();
        (!preference.is_empty()).then_some(preference)
    }

    /// Model id used for the synthetic entry when the backend can't be listed.
    pub fn fallback_model(&self) -> &str {
        match self.models.default.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ if !self.models.normal.is_empty() => self.models.normal.as_str(),
            _ => "default",
        }
    }
}

/// Candidate config file locations, in search order.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("dialect-proxy.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("dialect-proxy")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("dialect-proxy").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join("dialect-proxy").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".dialect-proxy.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
