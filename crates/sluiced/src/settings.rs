//! YAML settings file
//!
//! ```yaml
//! mode: cluster
//! data_dir: /var/lib/sluice
//! node_url: http://${HOSTNAME}:8060
//! reconcile_interval_ms: 60000
//! coordinator:
//!   backend: mysql
//!   mysql:
//!     url: ${SLUICE_MYSQL_URL}
//!   request_timeout_ms: 5000
//!   update_attempts: 3
//! shutdown_timeout_secs: 30
//! ```
//!
//! `${VAR}` and `${VAR:-default}` are expanded from the environment before
//! parsing.

use serde::{Deserialize, Serialize};
use sluice_meta::MetadataConfig;
use std::path::Path;
use std::sync::LazyLock;

static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var pattern is a valid regex")
});

/// Daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub metadata: MetadataConfig,

    /// Seconds to wait for background tasks on shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            metadata: MetadataConfig::standalone(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(content);
        let settings: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        Ok(settings)
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
pub fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_meta::{CoordinatorBackend, DeploymentMode};
    use std::io::Write;

    #[test]
    fn test_expand_defaults() {
        let out = expand_env_vars("url: ${SLUICE_TEST_SURELY_UNSET_VAR:-mysql://localhost/sluice}");
        assert_eq!(out, "url: mysql://localhost/sluice");

        let out = expand_env_vars("url: '${SLUICE_TEST_SURELY_UNSET_VAR}'");
        assert_eq!(out, "url: ''");
    }

    #[test]
    fn test_expand_from_environment() {
        std::env::set_var("SLUICE_TEST_EXPAND_NODE", "node-7");
        let out = expand_env_vars("node_url: http://${SLUICE_TEST_EXPAND_NODE:-unused}:8060");
        assert_eq!(out, "node_url: http://node-7:8060");
    }

    #[test]
    fn test_parse_cluster_file() {
        let yaml = r#"
mode: cluster
data_dir: /var/lib/sluice
node_url: http://node-1:8060
coordinator:
  backend: mysql
  mysql:
    url: ${SLUICE_TEST_SURELY_UNSET_VAR:-mysql://sluice@db:3306/sluice}
  update_attempts: 5
shutdown_timeout_secs: 10
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.metadata.mode, DeploymentMode::Cluster);
        assert_eq!(settings.metadata.coordinator.backend, CoordinatorBackend::Mysql);
        assert_eq!(
            settings.metadata.coordinator.mysql.url.as_deref(),
            Some("mysql://sluice@db:3306/sluice")
        );
        assert_eq!(settings.metadata.coordinator.update_attempts, 5);
        assert_eq!(settings.metadata.coordinator.request_timeout_ms, 5_000);
        assert_eq!(settings.shutdown_timeout_secs, 10);
        settings.metadata.validate().unwrap();
    }

    #[test]
    fn test_empty_file_is_standalone() {
        let settings = Settings::from_yaml("{}").unwrap();
        assert!(!settings.metadata.is_cluster());
        assert_eq!(settings.shutdown_timeout_secs, 30);
    }

    #[test]
    fn test_missing_file() {
        let err = Settings::from_file(Path::new("/nonexistent/sluice.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
