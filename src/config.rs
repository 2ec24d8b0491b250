use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Environment variable consulted when a request arrives without a bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_client_header")]
    pub client_header: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_model")]
    pub default: String,
    #[serde(default = "default_embeddings_model")]
    pub default_embeddings: String,
    /// Name prefixes that are forwarded untouched.
    #[serde(default = "default_families")]
    pub families: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Finish reason reported at end of stream for a candidate whose last
    /// frame carried none.
    #[serde(default = "default_flush_finish_reason")]
    pub flush_finish_reason: String,
}

fn default_port() -> u16 {
    8080
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_api_version() -> String {
    "v1beta".to_string()
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

fn default_client_header() -> String {
    format!("gemini-openai-proxy/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_embeddings_model() -> String {
    "text-embedding-004".to_string()
}

fn default_families() -> Vec<String> {
    vec![
        "gemini-".to_string(),
        "gemma-".to_string(),
        "learnlm-".to_string(),
    ]
}

fn default_flush_finish_reason() -> String {
    "stop".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            upstream: UpstreamConfig::default(),
            models: ModelsConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_version: default_api_version(),
            api_key_env: default_api_key_env(),
            client_header: default_client_header(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default: default_model(),
            default_embeddings: default_embeddings_model(),
            families: default_families(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_finish_reason: default_flush_finish_reason(),
        }
    }
}

impl ProxyConfig {
    /// Load config from a TOML file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir > built-in defaults
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in &config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn validate(&self) -> Result<()> {
        if self.models.default.trim().is_empty() {
            return Err(ProxyError::config("models.default must not be empty"));
        }
        if self.upstream.base_url.trim().is_empty() {
            return Err(ProxyError::config("upstream.base_url must not be empty"));
        }
        if self.stream.flush_finish_reason.trim().is_empty() {
            return Err(ProxyError::config(
                "stream.flush_finish_reason must not be empty",
            ));
        }
        Ok(())
    }

    /// `{base_url}/{api_version}` without a trailing slash.
    pub fn api_root(&self) -> String {
        format!(
            "{}/{}",
            self.upstream.base_url.trim_end_matches('/'),
            self.upstream.api_version.trim_matches('/')
        )
    }

    /// Credential from the configured environment variable, if set.
    pub fn fallback_api_key(&self) -> Option<String> {
        std::env::var(&self.upstream.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("gemini-proxy.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("gemini-proxy")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("gemini-proxy").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join("gemini-proxy").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".gemini-proxy.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
