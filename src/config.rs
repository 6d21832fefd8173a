use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use ulid::Ulid;

use crate::directory::RoleDirectory;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is not a valid ULID: {value:?}")]
    InvalidUlid { var: &'static str, value: String },
}

/// Server settings, read from `INNKEEP_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub directory: RoleDirectory,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7070,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            directory: RoleDirectory::default(),
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to defaults; a malformed
    /// user id is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let user = |var: &'static str| -> Result<Option<Ulid>, ConfigError> {
            match lookup(var) {
                None => Ok(None),
                Some(value) if value.trim().is_empty() => Ok(None),
                Some(value) => Ulid::from_str(value.trim())
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidUlid { var, value }),
            }
        };

        Ok(Self {
            bind: lookup("INNKEEP_BIND").unwrap_or(defaults.bind),
            port: parse_var(&lookup, "INNKEEP_PORT").unwrap_or(defaults.port),
            data_dir: lookup("INNKEEP_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            max_connections: parse_var(&lookup, "INNKEEP_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "INNKEEP_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            metrics_port: parse_var(&lookup, "INNKEEP_METRICS_PORT"),
            directory: RoleDirectory {
                property: user("INNKEEP_PROPERTY_USER")?,
                bookkeeper: user("INNKEEP_BOOKKEEPER_USER")?,
                reservationist: user("INNKEEP_RESERVATIONIST_USER")?,
            },
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(from_pairs(&[]).unwrap(), Config::default());
    }

    #[test]
    fn values_override_defaults() {
        let user = Ulid::new();
        let config = from_pairs(&[
            ("INNKEEP_PORT", "9000"),
            ("INNKEEP_DATA_DIR", "/var/lib/innkeep"),
            ("INNKEEP_METRICS_PORT", "9100"),
            ("INNKEEP_BOOKKEEPER_USER", &user.to_string()),
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/innkeep"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.directory.bookkeeper, Some(user));
        assert_eq!(config.addr(), "0.0.0.0:9000");
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = from_pairs(&[("INNKEEP_MAX_CONNECTIONS", "lots"), ("INNKEEP_METRICS_PORT", "x")]).unwrap();
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.metrics_port, None);
    }

    #[test]
    fn bad_user_id_is_an_error() {
        let err = from_pairs(&[("INNKEEP_PROPERTY_USER", "nobody")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidUlid {
                var: "INNKEEP_PROPERTY_USER",
                value: "nobody".into()
            }
        );
    }
}
