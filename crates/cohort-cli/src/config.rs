//! Configuration loading for the `cohort` binary
//!
//! Sources, later ones winning:
//! 1. Built-in defaults
//! 2. The TOML file given with `--config`, or `COHORT_*` variables without one
//! 3. Command-line flags (which clap also fills from `COHORT_*` variables)
//!
//! Example config:
//! ```toml
//! [cluster]
//! server_id = "app-1"
//! bind_address = "0.0.0.0:9301"
//! advertise_address = "10.0.0.1:9301"
//! members = ["10.0.0.1:9301", "10.0.0.2:9301", "10.0.0.3:9301"]
//! transport = "tcp"
//!
//! [logging]
//! level = "info"
//! format = "json"
//!
//! [metrics]
//! enabled = true
//! port = 9302
//! ```

use anyhow::{Context, Result};

use cohort_cluster::TransportKind;
use cohort_core::config::parse_member_list;
use cohort_core::CohortConfig;

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server_id: Option<String>,
    pub bind: Option<String>,
    pub advertise: Option<String>,
    pub members: Option<String>,
    pub transport: Option<TransportKind>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Overrides {
    pub fn apply(&self, config: &mut CohortConfig) {
        if let Some(id) = &self.server_id {
            config.cluster.server_id = id.clone();
        }
        if let Some(bind) = &self.bind {
            config.cluster.bind_address = bind.clone();
        }
        if let Some(advertise) = &self.advertise {
            config.cluster.advertise_address = Some(advertise.clone());
        }
        if let Some(members) = &self.members {
            config.cluster.members = parse_member_list(members);
        }
        if let Some(transport) = self.transport {
            config.cluster.transport = transport;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
        if let Some(port) = self.metrics_port {
            config.metrics.enabled = true;
            config.metrics.port = port;
        }
    }
}

/// Load, override and validate the configuration
pub fn load(path: Option<&str>, overrides: &Overrides) -> Result<CohortConfig> {
    let mut config = match path {
        Some(path) => CohortConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => CohortConfig::from_env(),
    };

    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_overrides_win_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [cluster]
            server_id = "from-file"
            members = ["10.0.0.1:9301"]
            "#
        )
        .unwrap();

        let overrides = Overrides {
            server_id: Some("from-flag".into()),
            members: Some("10.0.0.2:9301, 10.0.0.3:9301".into()),
            transport: Some(TransportKind::Datagram),
            metrics_port: Some(9999),
            ..Default::default()
        };
        let config = load(file.path().to_str(), &overrides).unwrap();

        assert_eq!(config.cluster.server_id, "from-flag");
        assert_eq!(
            config.cluster.members,
            vec!["10.0.0.2:9301".to_string(), "10.0.0.3:9301".to_string()]
        );
        assert_eq!(config.cluster.transport, TransportKind::Datagram);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9999);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let overrides = Overrides {
            log_format: Some("xml".into()),
            ..Default::default()
        };
        let mut config = CohortConfig::default();
        overrides.apply(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = load(Some("/nonexistent/cohort.toml"), &Overrides::default());
        assert!(result.is_err());
    }
}
