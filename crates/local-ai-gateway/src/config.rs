use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::manager::ManagerConfig;
use crate::schedule::{CredentialEndpoints, EngineConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub gateway_prefix: String,
    pub api_version: String,
    pub flavor_dir: Option<PathBuf>,
    pub providers_file: Option<PathBuf>,
    pub ollama_host: String,
    pub queue_size: usize,
    pub queue_timeout_seconds: u64,
    pub model_idle_timeout_seconds: u64,
    pub model_cleanup_interval_seconds: u64,
    pub upstream_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub credential_endpoints: CredentialEndpoints,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let path = |key: &str| lookup(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from);

        let credential_endpoints: CredentialEndpoints =
            serde_json::from_str(&var("CREDENTIAL_ENDPOINTS", "{}"))
                .context("CREDENTIAL_ENDPOINTS must be a JSON object of endpoints")?;

        Ok(Self {
            api_host: var("API_HOST", "127.0.0.1"),
            api_port: var("API_PORT", "16688").parse().context("API_PORT")?,
            gateway_prefix: var("GATEWAY_PREFIX", "gateway").trim_matches('/').to_string(),
            api_version: var("GATEWAY_API_VERSION", "v0.1").trim_matches('/').to_string(),
            flavor_dir: path("FLAVOR_DIR"),
            providers_file: path("PROVIDERS_FILE"),
            ollama_host: var("OLLAMA_HOST", "http://127.0.0.1:11434"),
            queue_size: var("LOCAL_MODEL_QUEUE_SIZE", "10")
                .parse()
                .context("LOCAL_MODEL_QUEUE_SIZE")?,
            queue_timeout_seconds: var("LOCAL_MODEL_QUEUE_TIMEOUT_SECONDS", "30")
                .parse()
                .context("LOCAL_MODEL_QUEUE_TIMEOUT_SECONDS")?,
            model_idle_timeout_seconds: var("MODEL_IDLE_TIMEOUT_SECONDS", "600")
                .parse()
                .context("MODEL_IDLE_TIMEOUT_SECONDS")?,
            model_cleanup_interval_seconds: var("MODEL_CLEANUP_INTERVAL_SECONDS", "60")
                .parse()
                .context("MODEL_CLEANUP_INTERVAL_SECONDS")?,
            upstream_timeout_seconds: var("UPSTREAM_TIMEOUT_SECONDS", "600")
                .parse()
                .context("UPSTREAM_TIMEOUT_SECONDS")?,
            poll_interval_ms: var("POLL_INTERVAL_MS", "500")
                .parse()
                .context("POLL_INTERVAL_MS")?,
            credential_endpoints,
        })
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Route Prefix: /{}/{}", self.gateway_prefix, self.api_version);
        match &self.flavor_dir {
            Some(dir) => info!("- Flavor Definitions: {}", dir.display()),
            None => info!("- Flavor Definitions: built-in"),
        }
        match &self.providers_file {
            Some(file) => info!("- Providers File: {}", file.display()),
            None => info!("- Providers File: none"),
        }
        info!("- Ollama Host: {}", self.ollama_host);
        info!("- Queue Size: {}", self.queue_size);
        info!("- Queue Timeout: {}s", self.queue_timeout_seconds);
        info!("- Model Idle Timeout: {}s", self.model_idle_timeout_seconds);
        info!("- Cleanup Interval: {}s", self.model_cleanup_interval_seconds);
        info!("- Upstream Timeout: {}s", self.upstream_timeout_seconds);
        info!("- Poll Interval: {}ms", self.poll_interval_ms);
        info!("- Credential Environments: {}", self.credential_endpoints.len());
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.api_host, self.api_port))
    }

    /// `/<prefix>/<version>`
    pub fn route_base(&self) -> String {
        format!("/{}/{}", self.gateway_prefix, self.api_version)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            queue_size: self.queue_size,
            queue_timeout: Duration::from_secs(self.queue_timeout_seconds),
            idle_timeout: Duration::from_secs(self.model_idle_timeout_seconds),
            cleanup_interval: Duration::from_secs(self.model_cleanup_interval_seconds.max(1)),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            upstream_timeout: Duration::from_secs(self.upstream_timeout_seconds),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            credential_endpoints: self.credential_endpoints.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    /// Helper function to create a test Config with default values
    fn create_test_config() -> Config {
        config_from(&[]).unwrap()
    }

    // ===== Defaults =====

    #[test]
    fn test_config_creation_with_default_values() {
        let config = create_test_config();
        assert_eq!(config.api_host, "127.0.0.1");
        assert_eq!(config.api_port, 16688);
        assert_eq!(config.route_base(), "/gateway/v0.1");
        assert!(config.flavor_dir.is_none());
        assert!(config.providers_file.is_none());
        assert_eq!(config.queue_size, 10);
        assert_eq!(config.poll_interval_ms, 500);
        assert!(config.credential_endpoints.is_empty());
    }

    #[test]
    fn test_projections() {
        let config = create_test_config();
        let manager = config.manager_config();
        assert_eq!(manager.queue_timeout, Duration::from_secs(30));
        assert_eq!(manager.idle_timeout, Duration::from_secs(600));
        assert_eq!(manager.cleanup_interval, Duration::from_secs(60));
        let engine = config.engine_config();
        assert_eq!(engine.poll_interval, Duration::from_millis(500));
        assert_eq!(engine.upstream_timeout, Duration::from_secs(600));
    }

    // ===== Overrides =====

    #[test]
    fn test_overrides_and_prefix_trimming() {
        let config = config_from(&[
            ("API_PORT", "3000"),
            ("GATEWAY_PREFIX", "/aigw/"),
            ("GATEWAY_API_VERSION", "v1"),
            ("FLAVOR_DIR", "/etc/gateway/flavors"),
            ("PROVIDERS_FILE", ""),
        ])
        .unwrap();
        assert_eq!(config.api_port, 3000);
        assert_eq!(config.route_base(), "/aigw/v1");
        assert_eq!(config.flavor_dir, Some(PathBuf::from("/etc/gateway/flavors")));
        assert!(config.providers_file.is_none());
    }

    #[test]
    fn test_credential_endpoints_parse() {
        let config = config_from(&[(
            "CREDENTIAL_ENDPOINTS",
            r#"{"prod": {"url": "https://llm.example.com", "access_token": "t", "chat_path": "/chat"}}"#,
        )])
        .unwrap();
        let prod = &config.credential_endpoints["prod"];
        assert_eq!(prod.url, "https://llm.example.com");
        assert_eq!(prod.chat_path, "/chat");
        assert!(prod.embed_path.is_empty());
    }

    #[test]
    fn test_bad_numbers_are_errors() {
        assert!(config_from(&[("API_PORT", "not-a-port")]).is_err());
        assert!(config_from(&[("POLL_INTERVAL_MS", "-1")]).is_err());
        assert!(config_from(&[("CREDENTIAL_ENDPOINTS", "[")]).is_err());
    }

    // ===== API Address Tests =====

    #[test]
    fn test_api_addr_parsing() {
        let config = create_test_config();
        let addr = config.api_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(addr.port(), 16688);
    }

    #[test]
    fn test_api_addr_with_zero_address() {
        let mut config = create_test_config();
        config.api_host = "0.0.0.0".to_string();
        config.api_port = 5000;
        let addr = config.api_addr().unwrap();
        assert_eq!(addr.port(), 5000);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
    }

    #[test]
    fn test_api_addr_rejects_hostnames() {
        let mut config = create_test_config();
        config.api_host = "not a host".to_string();
        assert!(config.api_addr().is_err());
    }
}
