use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StewardError};

/// Timeouts for the externally-configured verification commands, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_health_check_timeout")]
    pub health_check: u64,
    #[serde(default = "default_smoke_test_timeout")]
    pub smoke_test: u64,
    #[serde(default = "default_full_test_timeout")]
    pub full_test: u64,
}

fn default_health_check_timeout() -> u64 {
    30
}

fn default_smoke_test_timeout() -> u64 {
    120
}

fn default_full_test_timeout() -> u64 {
    600
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            health_check: default_health_check_timeout(),
            smoke_test: default_smoke_test_timeout(),
            full_test: default_full_test_timeout(),
        }
    }
}

/// Project configuration document. Consumed read-only by the health probe
/// and the implement procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project_type: String,
    #[serde(default)]
    pub init_script: Option<String>,
    pub health_check: String,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub smoke_test: Option<String>,
    #[serde(default)]
    pub dev_server_port: Option<u16>,
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: TimeoutConfig,
    /// Unrecognized fields are preserved so re-serialization is lossless.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ProjectConfig {
    /// Load and validate the project configuration. Missing or invalid
    /// configuration is fatal and never retried.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            StewardError::Config(format!(
                "Cannot read project config {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            StewardError::Config(format!(
                "Invalid project config {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health_check.trim().is_empty() {
            return Err(StewardError::Config(
                "health_check command must not be empty".into(),
            ));
        }
        if self.timeout_seconds.health_check == 0 {
            return Err(StewardError::Config(
                "timeout_seconds.health_check must be positive".into(),
            ));
        }
        for var in &self.required_env {
            if std::env::var(var).is_err() {
                return Err(StewardError::Config(format!(
                    "required environment variable not set: {}",
                    var
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> ProjectConfig {
        serde_json::from_value(serde_json::json!({
            "project_type": "web",
            "health_check": "npm run build"
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = minimal();
        assert_eq!(config.timeout_seconds.health_check, 30);
        assert_eq!(config.timeout_seconds.full_test, 600);
        assert!(config.required_env.is_empty());
        assert!(config.init_script.is_none());
    }

    #[test]
    fn test_empty_health_check_rejected() {
        let mut config = minimal();
        config.health_check = "  ".into();
        assert!(matches!(
            config.validate(),
            Err(StewardError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let config: ProjectConfig = serde_json::from_value(serde_json::json!({
            "project_type": "web",
            "health_check": "make check",
            "deploy_target": "pages"
        }))
        .unwrap();
        assert!(config.extra.contains_key("deploy_target"));
    }
}
