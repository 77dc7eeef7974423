//! Master configuration.

use kiln_core::builder::BuilderConfig;
use kiln_scheduler::backoff::RetryPolicy;
use kiln_scheduler::DispatchConfig;
use serde::{Deserialize, Serialize};

/// Master configuration, loaded once at startup. The builder set it carries
/// is immutable for the life of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Address the HTTP/WebSocket listener binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// SQLite database URL.
    #[serde(default = "default_db_url")]
    pub db_url: String,
    /// Human-readable instance name, shown to workers and in responses.
    #[serde(default = "default_title")]
    pub title: String,
    /// Public base URL of this master, if it differs from the bind address.
    #[serde(default)]
    pub external_url: Option<String>,
    /// Shared secret every worker must present.
    pub worker_credential: String,
    /// Operator accounts allowed to force and cancel builds.
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub builders: Vec<BuilderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
}

/// Dispatch timeouts and retry pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8010".to_string()
}

fn default_db_url() -> String {
    "sqlite://kiln.sqlite".to_string()
}

fn default_title() -> String {
    "Kiln CI".to_string()
}

fn default_ack_timeout() -> u64 {
    30
}

fn default_cancel_grace() -> u64 {
    20
}

fn default_tick_interval() -> u64 {
    500
}

fn default_heartbeat_timeout() -> u64 {
    120
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    1_000
}

fn default_retry_max_delay() -> u64 {
    60_000
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            ack_timeout_secs: default_ack_timeout(),
            cancel_grace_secs: default_cancel_grace(),
            tick_interval_ms: default_tick_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

impl DispatchSettings {
    pub fn to_dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            ack_timeout_secs: self.ack_timeout_secs,
            cancel_grace_secs: self.cancel_grace_secs,
            tick_interval_ms: self.tick_interval_ms,
            heartbeat_timeout_secs: self.heartbeat_timeout_secs,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                base_delay_ms: self.retry_base_delay_ms,
                max_delay_ms: self.retry_max_delay_ms,
            },
        }
    }
}

impl MasterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.yaml");
        std::fs::write(&path, "worker_credential: hunter2\ntitle: Test Rig\n").unwrap();

        let config = MasterConfig::from_file(&path).unwrap();
        assert_eq!(config.title, "Test Rig");
        assert_eq!(config.worker_credential, "hunter2");
    }

    #[test]
    fn test_from_file_rejects_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.yaml");
        std::fs::write(&path, "worker_credential: [unterminated\n").unwrap();

        let err = MasterConfig::from_file(&path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: MasterConfig = serde_yaml::from_str("worker_credential: hunter2\n").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8010");
        assert_eq!(config.title, "Kiln CI");
        assert_eq!(config.dispatch.ack_timeout_secs, 30);
        assert!(config.builders.is_empty());
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn test_builders_parse_with_step_defaults() {
        let yaml = r#"
worker_credential: hunter2
accounts:
  - username: admin
    password: changeme
builders:
  - name: linux-x64-builder
    requires:
      platform: linux
      arch: x64
      tags: []
    steps:
      - name: bootstrap
        command: sh ci/build.sh
"#;
        let config: MasterConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.builders.len(), 1);
        let builder = &config.builders[0];
        assert_eq!(builder.name.as_str(), "linux-x64-builder");
        assert_eq!(builder.max_duration_secs, 7200);
        assert_eq!(builder.steps[0].timeout_secs, 3600);
        assert!(!builder.steps[0].continue_on_failure);
        assert_eq!(config.accounts[0].username, "admin");
    }
}
