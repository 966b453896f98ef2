//! Declarative pipeline configuration (YAML or JSON), with
//! `REPLICATOR_<SECTION>_<FIELD>` environment-variable overlay.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::rule::Rule;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Binlog {
        host: String,
        port: u16,
        username: String,
        password: String,
        database: Option<String>,
        #[serde(default)]
        options: std::collections::HashMap<String, String>,
    },
    ChangeStream {
        uri: String,
        database: String,
        #[serde(default)]
        collection: Option<String>,
    },
    Kafka {
        host: String,
        port: u16,
        #[serde(default)]
        options: std::collections::HashMap<String, String>,
    },
    ChangeFeed {
        uri: String,
        database: String,
        #[serde(default)]
        options: std::collections::HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetConfig {
    Kafka {
        host: String,
        port: u16,
    },
    SearchIndex {
        uri: String,
    },
    DocumentStore {
        uri: String,
        database: String,
    },
    Relational {
        host: String,
        port: u16,
        database: String,
        username: String,
        password: String,
    },
    Stdout,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransformationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source: SourceConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub transformation: TransformationConfig,
    /// Cadence at which the orchestrator flushes this stream's cursor to
    /// the position store. Default 1s; MUST NOT be less than 1s.
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
}

fn default_update_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PositionConfig {
    File {
        directory: String,
        #[serde(default = "default_true")]
        enable_backup: bool,
        #[serde(default = "default_backup_count")]
        backup_count: usize,
    },
    Mongo {
        uri: String,
        database: String,
        collection: String,
    },
}

fn default_backup_count() -> usize {
    5
}

impl Default for PositionConfig {
    fn default() -> Self {
        PositionConfig::File {
            directory: "./positions".to_string(),
            enable_backup: true,
            backup_count: default_backup_count(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ServicePrincipal,
    ManagedIdentity,
    Cli,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub method: AuthMethod,
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub position: PositionConfig,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    pub streams: Vec<StreamConfig>,
}

impl ReplicatorConfig {
    /// Loads configuration from a YAML/JSON file, then overlays environment
    /// variables of the form `REPLICATOR_SERVER_PORT`.
    pub fn load(path: &std::path::Path) -> Result<Self, crate::error::CdcError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("REPLICATOR").separator("_"));
        let raw = builder
            .build()
            .map_err(|e| crate::error::CdcError::Config(e.to_string()))?;
        raw.try_deserialize()
            .map_err(|e| crate::error::CdcError::Config(e.to_string()))
    }

    pub fn validate_streams(&self) -> Result<(), crate::error::CdcError> {
        let mut seen = std::collections::HashSet::new();
        for stream in &self.streams {
            if !seen.insert(&stream.name) {
                return Err(crate::error::CdcError::Validation(format!(
                    "duplicate stream name {:?}",
                    stream.name
                )));
            }
            if stream.update_interval_ms < 1_000 {
                return Err(crate::error::CdcError::Validation(format!(
                    "stream {:?}: update_interval_ms must be >= 1000",
                    stream.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_round_trips_through_minimal_stream() {
        let yaml = r#"
streams:
  - name: orders
    source:
      type: binlog
      host: localhost
      port: 3306
      username: root
      password: secret
    target:
      type: stdout
"#;
        let config: ReplicatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.streams[0].name, "orders");
        assert_eq!(config.streams[0].update_interval_ms, 1_000);
        assert!(config.validate_streams().is_ok());
    }

    #[test]
    fn duplicate_stream_names_rejected() {
        let yaml = r#"
streams:
  - name: orders
    source: { type: binlog, host: h, port: 1, username: u, password: p }
    target: { type: stdout }
  - name: orders
    source: { type: binlog, host: h, port: 1, username: u, password: p }
    target: { type: stdout }
"#;
        let config: ReplicatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate_streams().is_err());
    }
}
