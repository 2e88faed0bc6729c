use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub const INTERVAL_MS_RANGE: RangeInclusive<u32> = 1..=300_000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u32,
    #[serde(default)]
    pub tegrastats: TegrastatsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TegrastatsConfig {
    #[serde(default = "default_tegrastats_path")]
    pub path: String,
    /// Passed to the utility ahead of `--interval <ms>`.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            interval_ms: default_interval_ms(),
            tegrastats: TegrastatsConfig::default(),
        }
    }
}

impl Default for TegrastatsConfig {
    fn default() -> Self {
        Self {
            path: default_tegrastats_path(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port socket address".to_string(),
            ));
        }
        validate_interval_ms(self.interval_ms)?;
        if self.tegrastats.path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "tegrastats.path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

pub fn validate_interval_ms(interval_ms: u32) -> Result<(), ConfigError> {
    if !INTERVAL_MS_RANGE.contains(&interval_ms) {
        return Err(ConfigError::Validation(format!(
            "interval_ms must be in range {}..={}, got {}",
            INTERVAL_MS_RANGE.start(),
            INTERVAL_MS_RANGE.end(),
            interval_ms
        )));
    }
    Ok(())
}

fn default_listen() -> String {
    "127.0.0.1:9109".to_string()
}

const fn default_interval_ms() -> u32 {
    1000
}

fn default_tegrastats_path() -> String {
    "tegrastats".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_yaml_is_valid() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example parses");
        cfg.validate().expect("example validates");
        assert_eq!(cfg.interval_ms, 1000);
        assert_eq!(cfg.tegrastats.path, "tegrastats");
    }

    #[test]
    fn missing_fields_use_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").expect("empty mapping parses");
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.listen, "127.0.0.1:9109");
        assert_eq!(cfg.interval_ms, 1000);
        assert!(cfg.tegrastats.extra_args.is_empty());
    }

    #[test]
    fn interval_bounds() {
        let mut cfg = Config::default();
        for ok in [1, 1000, 300_000] {
            cfg.interval_ms = ok;
            cfg.validate().expect("interval within range");
        }
        for bad in [0, 300_001] {
            cfg.interval_ms = bad;
            assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
        }
    }

    #[test]
    fn rejects_bad_listen_and_empty_path() {
        let mut cfg = Config::default();
        cfg.listen = "not-an-address".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.tegrastats.path = "  ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn negative_interval_is_a_parse_error() {
        assert!(serde_yaml::from_str::<Config>("interval_ms: -5").is_err());
    }
}
