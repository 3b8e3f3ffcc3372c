use std::path::PathBuf;

use chrono_tz::Tz;
use thiserror::Error;

/// Server settings, read from `FLEETLINE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
    /// Zone for calendar rules: seasons, weekends, license expiry, fee dates.
    pub time_zone: Tz,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "fleetline".into(),
            max_connections: 256,
            compact_threshold: 1000,
            time_zone: Tz::UTC,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let config = Self {
            port: parse(&get, "FLEETLINE_PORT")?.unwrap_or(defaults.port),
            bind: get("FLEETLINE_BIND").unwrap_or(defaults.bind),
            data_dir: get("FLEETLINE_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: get("FLEETLINE_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse(&get, "FLEETLINE_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            compact_threshold: parse(&get, "FLEETLINE_COMPACT_THRESHOLD")?.unwrap_or(defaults.compact_threshold),
            time_zone: parse(&get, "FLEETLINE_TIMEZONE")?.unwrap_or(defaults.time_zone),
            tls_cert: get("FLEETLINE_TLS_CERT"),
            tls_key: get("FLEETLINE_TLS_KEY"),
            metrics_port: parse(&get, "FLEETLINE_METRICS_PORT")?,
        };
        if config.max_connections == 0 {
            return Err(ConfigError::Zero("FLEETLINE_MAX_CONNECTIONS"));
        }
        if config.compact_threshold == 0 {
            return Err(ConfigError::Zero("FLEETLINE_COMPACT_THRESHOLD"));
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: std::str::FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ServerConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
    }

    #[test]
    fn reads_every_variable() {
        let config = from_pairs(&[
            ("FLEETLINE_PORT", "6000"),
            ("FLEETLINE_BIND", "127.0.0.1"),
            ("FLEETLINE_DATA_DIR", "/var/lib/fleetline"),
            ("FLEETLINE_PASSWORD", "s3cret"),
            ("FLEETLINE_MAX_CONNECTIONS", "16"),
            ("FLEETLINE_COMPACT_THRESHOLD", "50"),
            ("FLEETLINE_TIMEZONE", "Europe/Rome"),
            ("FLEETLINE_TLS_CERT", "cert.pem"),
            ("FLEETLINE_TLS_KEY", "key.pem"),
            ("FLEETLINE_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/fleetline"));
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.time_zone, chrono_tz::Europe::Rome);
        assert_eq!(config.tls_key.as_deref(), Some("key.pem"));
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            from_pairs(&[("FLEETLINE_PORT", "http")]),
            Err(ConfigError::Invalid {
                var: "FLEETLINE_PORT",
                value: "http".into()
            })
        );
        assert!(matches!(
            from_pairs(&[("FLEETLINE_TIMEZONE", "Mars/Olympus")]),
            Err(ConfigError::Invalid { var: "FLEETLINE_TIMEZONE", .. })
        ));
        assert_eq!(
            from_pairs(&[("FLEETLINE_MAX_CONNECTIONS", "0")]),
            Err(ConfigError::Zero("FLEETLINE_MAX_CONNECTIONS"))
        );
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = from_pairs(&[("FLEETLINE_PORT", "  "), ("FLEETLINE_TLS_CERT", "")]).unwrap();
        assert_eq!(config.port, 5433);
        assert_eq!(config.tls_cert, None);
    }
}
