//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. Explicit path (CLI flag or caller)
//! 2. `~/.skirnir/config.toml` (user)
//! 3. `/etc/skirnir/config.toml` (system)
//!
//! Credentials never live in the config file. Each service names the
//! environment variables holding its keys (`key_env`).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::geo::ClusterOptions;
use crate::orchestrator::{DEFAULT_FAILURE_ALERT_THRESHOLD, MaintenanceConfig};
use crate::providers::{FallbackStage, ServicePolicy};
use crate::{Result, SkirnirError};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Per-service policies keyed by service name.
    #[serde(default)]
    pub services: HashMap<String, ServicePolicy>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub geo: ClusterOptions,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// Consecutive failures before a provider alert. Default: 5.
    #[serde(default = "default_failure_alert_threshold")]
    pub failure_alert_threshold: u32,
}

fn default_failure_alert_threshold() -> u32 {
    DEFAULT_FAILURE_ALERT_THRESHOLD
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            services: HashMap::new(),
            cache: CacheConfig::default(),
            geo: ClusterOptions::default(),
            maintenance: MaintenanceConfig::default(),
            failure_alert_threshold: default_failure_alert_threshold(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from the standard locations.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SkirnirError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            SkirnirError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-service references and value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.failure_alert_threshold == 0 {
            return Err(SkirnirError::Configuration(
                "failure_alert_threshold must be at least 1".to_string(),
            ));
        }
        if self.geo.radius_km <= 0.0 || !self.geo.radius_km.is_finite() {
            return Err(SkirnirError::Configuration(format!(
                "geo.radius_km must be positive, got {}",
                self.geo.radius_km
            )));
        }
        let mut names: Vec<_> = self.services.keys().collect();
        names.sort();
        for name in names {
            let policy = &self.services[name];
            policy.cache.ttl.validate().map_err(|e| {
                SkirnirError::Configuration(format!("service '{name}': cache.ttl.{e}"))
            })?;
            for window in &policy.rate_limit.windows {
                if window.length_secs == 0 {
                    return Err(SkirnirError::Configuration(format!(
                        "service '{name}': window '{}' has zero length",
                        window.name
                    )));
                }
            }
            for stage in &policy.fallback.stages {
                if let FallbackStage::BackupProvider { provider } = stage
                    && (provider == name || !self.services.contains_key(provider))
                {
                    return Err(SkirnirError::Configuration(format!(
                        "service '{name}': backup provider '{provider}' is not a configured service"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(SkirnirError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".skirnir").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/skirnir/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(SkirnirError::Configuration(
            "No config file found. Create ~/.skirnir/config.toml or /etc/skirnir/config.toml"
                .to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config: OrchestratorConfig = toml::from_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.failure_alert_threshold, 5);
        assert_eq!(config.cache.promotion_threshold, 3);
    }

    #[test]
    fn parse_service_policy() {
        let toml = r#"
            [services.weather]
            timeout_ms = 5000
            key_env = ["WEATHER_KEY_1", "WEATHER_KEY_2"]

            [services.weather.retry]
            max_retries = 2
            initial_delay_ms = 250

            [[services.weather.rate_limit.windows]]
            name = "daily"
            length_secs = 86400
            limit = 1000

            [[services.weather.fallback.stages]]
            kind = "stale_cache"

            [[services.weather.fallback.stages]]
            kind = "backup_provider"
            provider = "backup_weather"

            [services.backup_weather]
        "#;
        let config: OrchestratorConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        let weather = &config.services["weather"];
        assert_eq!(weather.timeout_ms, 5000);
        assert_eq!(weather.retry.max_retries, 2);
        assert_eq!(weather.rate_limit.windows[0].limit, 1000);
        assert_eq!(weather.fallback.stages.len(), 2);
        assert_eq!(weather.key_env.len(), 2);
    }

    #[test]
    fn unknown_backup_is_rejected() {
        let toml = r#"
            [[services.weather.fallback.stages]]
            kind = "backup_provider"
            provider = "missing"
        "#;
        let config: OrchestratorConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn config_not_found_returns_error() {
        let result = OrchestratorConfig::load(Some(Path::new("/nonexistent/config.toml")));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Config file not found"));
    }
}
