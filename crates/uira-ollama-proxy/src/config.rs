//! Configuration from environment variables and an optional YAML file.
//!
//! **Environment variables:**
//! - `HOST`: listen address (default: 127.0.0.1)
//! - `PORT`: server port (default: 11434, Ollama's port)
//! - `BACKEND_BASE_URL`: OpenAI-compatible backend (default: http://localhost:4000)
//! - `BACKEND_API_KEY`: bearer token sent when the client sends none
//! - `REQUEST_TIMEOUT_SECS`: per-request deadline (default: 60)
//! - `STREAM_IDLE_TIMEOUT_SECS`: max silence between stream fragments (default: 30)
//! - `MODEL_CACHE_TTL_SECS`: model inventory TTL (default: 60)
//! - `DEFAULT_TEMPERATURE`, `DEFAULT_MAX_TOKENS`: injected when a request omits them
//!
//! A YAML file can override any of these:
//!
//! ```yaml
//! proxy:
//!   port: 11434
//!   backend_base_url: "http://localhost:4000"
//!   model_cache_ttl_secs: 30
//!   defaults:
//!     temperature: 0.2
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Version string reported on `/api/version`. IDE clients gate features on it.
pub const DEFAULT_REPORTED_VERSION: &str = "0.11.4";

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub backend_base_url: String,
    pub backend_api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub model_cache_ttl_secs: u64,
    pub defaults: SamplingDefaults,
    pub reported_version: String,
}

/// Sampling parameters filled in when the client leaves them out.
///
/// These are global. No per-model defaults are guessed.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SamplingDefaults {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        Self {
            temperature: env_parse("DEFAULT_TEMPERATURE").unwrap_or(0.7),
            max_tokens: env_parse("DEFAULT_MAX_TOKENS").unwrap_or(2048),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProxyYamlFile {
    #[serde(default)]
    proxy: ProxyYamlSection,
}

#[derive(Debug, Default, Deserialize)]
struct ProxyYamlSection {
    host: Option<String>,
    port: Option<u16>,
    backend_base_url: Option<String>,
    backend_api_key: Option<String>,
    request_timeout_secs: Option<u64>,
    stream_idle_timeout_secs: Option<u64>,
    model_cache_ttl_secs: Option<u64>,
    reported_version: Option<String>,
    #[serde(default)]
    defaults: DefaultsYaml,
}

#[derive(Debug, Default, Deserialize)]
struct DefaultsYaml {
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_parse("PORT").unwrap_or(11434),
            backend_base_url: env::var("BACKEND_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:4000".to_string()),
            backend_api_key: env::var("BACKEND_API_KEY").ok().filter(|k| !k.is_empty()),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS").unwrap_or(60),
            stream_idle_timeout_secs: env_parse("STREAM_IDLE_TIMEOUT_SECS").unwrap_or(30),
            model_cache_ttl_secs: env_parse("MODEL_CACHE_TTL_SECS").unwrap_or(60),
            defaults: SamplingDefaults::default(),
            reported_version: DEFAULT_REPORTED_VERSION.to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn from_yaml_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read proxy config from {:?}", path))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let file: ProxyYamlFile =
            serde_yaml_ng::from_str(content).context("Failed to parse proxy config")?;
        let section = file.proxy;
        let base = Self::default();

        Ok(Self {
            host: section.host.unwrap_or(base.host),
            port: section.port.unwrap_or(base.port),
            backend_base_url: section.backend_base_url.unwrap_or(base.backend_base_url),
            backend_api_key: section.backend_api_key.or(base.backend_api_key),
            request_timeout_secs: section
                .request_timeout_secs
                .unwrap_or(base.request_timeout_secs),
            stream_idle_timeout_secs: section
                .stream_idle_timeout_secs
                .unwrap_or(base.stream_idle_timeout_secs),
            model_cache_ttl_secs: section
                .model_cache_ttl_secs
                .unwrap_or(base.model_cache_ttl_secs),
            defaults: SamplingDefaults {
                temperature: section
                    .defaults
                    .temperature
                    .unwrap_or(base.defaults.temperature),
                max_tokens: section
                    .defaults
                    .max_tokens
                    .unwrap_or(base.defaults.max_tokens),
            },
            reported_version: section.reported_version.unwrap_or(base.reported_version),
        })
    }

    pub fn backend_base_url_trimmed(&self) -> String {
        self.backend_base_url.trim_end_matches('/').to_string()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn model_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.model_cache_ttl_secs)
    }

    /// Budget for one registry refresh. Half the request deadline, so a stalled
    /// refresh fails in time for callers to fall back to the stale list.
    pub fn model_refresh_timeout(&self) -> Duration {
        self.request_timeout() / 2
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_overrides_selected_fields() {
        let config = ProxyConfig::from_yaml_str(
            r#"
proxy:
  port: 9000
  backend_base_url: "http://litellm:4000/"
  model_cache_ttl_secs: 5
  defaults:
    temperature: 0.1
"#,
        )
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.backend_base_url_trimmed(), "http://litellm:4000");
        assert_eq!(config.model_cache_ttl(), Duration::from_secs(5));
        assert_eq!(config.defaults.temperature, 0.1);
        assert_eq!(
            config.defaults.max_tokens,
            SamplingDefaults::default().max_tokens
        );
    }

    #[test]
    fn test_refresh_timeout_is_within_request_deadline() {
        let config = ProxyConfig {
            request_timeout_secs: 1,
            ..ProxyConfig::default()
        };
        assert_eq!(config.model_refresh_timeout(), Duration::from_millis(500));
        assert!(config.model_refresh_timeout() < config.request_timeout());
    }

    #[test]
    fn test_empty_yaml_keeps_defaults() {
        let config = ProxyConfig::from_yaml_str("{}").unwrap();
        let base = ProxyConfig::default();
        assert_eq!(config.port, base.port);
        assert_eq!(config.reported_version, DEFAULT_REPORTED_VERSION);
    }
}
