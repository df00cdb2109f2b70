//! Configuration for Cohort

use serde::{Deserialize, Serialize};

use crate::types::ClusterConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CohortConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl CohortConfig {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to parse config: {}", e)))
    }

    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to render config: {}", e)))
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay `COHORT_*` environment variables onto this configuration
    pub fn apply_env(&mut self) {
        if let Ok(id) = std::env::var("COHORT_SERVER_ID") {
            self.cluster.server_id = id;
        }
        if let Ok(addr) = std::env::var("COHORT_BIND_ADDRESS") {
            self.cluster.bind_address = addr;
        }
        if let Ok(addr) = std::env::var("COHORT_ADVERTISE_ADDRESS") {
            self.cluster.advertise_address = Some(addr);
        }
        if let Ok(members) = std::env::var("COHORT_MEMBERS") {
            self.cluster.members = parse_member_list(&members);
        }
        if let Ok(transport) = std::env::var("COHORT_TRANSPORT") {
            match transport.parse() {
                Ok(kind) => self.cluster.transport = kind,
                Err(e) => tracing::warn!("Ignoring COHORT_TRANSPORT: {}", e),
            }
        }
        if let Ok(level) = std::env::var("COHORT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("COHORT_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(port) = std::env::var("COHORT_METRICS_PORT") {
            if let Ok(p) = port.parse() {
                self.metrics.enabled = true;
                self.metrics.port = p;
            }
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.cluster.validate()?;

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(crate::Error::InvalidConfig(format!(
                    "unknown log format '{}', expected pretty or json",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// Split a comma separated member list, dropping blanks
pub fn parse_member_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Prometheus exporter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "0.0.0.0".to_string(),
            port: 9302,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransportKind;
    use std::io::Write;

    #[test]
    fn test_from_toml_partial() {
        let config = CohortConfig::from_toml(
            r#"
            [cluster]
            server_id = "node-a"
            bind_address = "127.0.0.1:9401"
            members = ["127.0.0.1:9401", "127.0.0.1:9402"]
            transport = "datagram"
            failure_threshold = 5

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.cluster.server_id, "node-a");
        assert_eq!(config.cluster.members.len(), 2);
        assert_eq!(config.cluster.transport, TransportKind::Datagram);
        assert_eq!(config.cluster.failure_threshold, 5);
        // untouched fields keep their defaults
        assert_eq!(config.cluster.broadcast_deadline_ms, 500);
        assert_eq!(config.logging.level, "info");
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cluster]\nserver_id = \"from-file\"").unwrap();

        let config = CohortConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.cluster.server_id, "from-file");
    }

    #[test]
    fn test_missing_file() {
        let err = CohortConfig::from_file("/nonexistent/cohort.toml").unwrap_err();
        assert!(matches!(err, crate::Error::InvalidConfig(_)));
    }

    #[test]
    fn test_toml_roundtrip_keeps_values() {
        let mut config = CohortConfig::default();
        config.cluster.server_id = "node-b".to_string();
        config.cluster.members = vec!["10.0.0.1:9301".to_string()];

        let rendered = config.to_toml().unwrap();
        let parsed = CohortConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_parse_member_list() {
        assert_eq!(
            parse_member_list(" a:1, ,b:2,"),
            vec!["a:1".to_string(), "b:2".to_string()]
        );
    }

    #[test]
    fn test_validate_log_format() {
        let mut config = CohortConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
