use crate::default_struct;
use std::{path::PathBuf, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    Missing(&'static str),
    #[error("{key} must be a {expected}, got `{value}`")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

default_struct! {
#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub save_location: PathBuf = PathBuf::from("SavedServers"),
    pub max_servers: usize = 5,
    pub server_host: String = "localhost".to_string(),
    pub java_path: String = "java".to_string(),
    pub default_memory_gb: u32 = 2,
    pub max_memory_gb: u32 = 16,
    pub settings_db: PathBuf = PathBuf::from("data/servers.db"),
}
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    expected: &'static str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(key) {
        *target = value.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            expected,
            value,
        })?;
    }
    Ok(())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self {
            discord_token: lookup("DISCORD_TOKEN").ok_or(ConfigError::Missing("DISCORD_TOKEN"))?,
            ..Self::default()
        };

        parse(&lookup, "SERVER_SAVE_LOCATION", "path", &mut config.save_location)?;
        parse(&lookup, "MAX_SERVERS", "whole number", &mut config.max_servers)?;
        parse(&lookup, "SERVER_HOST", "host name", &mut config.server_host)?;
        parse(&lookup, "JAVA_PATH", "path", &mut config.java_path)?;
        parse(&lookup, "DEFAULT_MEMORY_GB", "whole number", &mut config.default_memory_gb)?;
        parse(&lookup, "MAX_MEMORY_GB", "whole number", &mut config.max_memory_gb)?;
        parse(&lookup, "SETTINGS_DB", "path", &mut config.settings_db)?;

        if config.default_memory_gb == 0 || config.default_memory_gb > config.max_memory_gb {
            return Err(ConfigError::Invalid {
                key: "DEFAULT_MEMORY_GB",
                expected: "number between 1 and MAX_MEMORY_GB",
                value: config.default_memory_gb.to_string(),
            });
        }

        config.save_location = std::path::absolute(&config.save_location)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[("DISCORD_TOKEN", "abc")])).unwrap();
        assert_eq!(config.discord_token, "abc");
        assert_eq!(config.max_servers, 5);
        assert_eq!(config.java_path, "java");
        assert!(config.save_location.is_absolute());
        assert!(config.save_location.ends_with("SavedServers"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "abc"),
            ("MAX_SERVERS", " 2 "),
            ("SERVER_HOST", "mc.example.net"),
            ("MAX_MEMORY_GB", "8"),
            ("DEFAULT_MEMORY_GB", "4"),
        ]))
        .unwrap();
        assert_eq!(config.max_servers, 2);
        assert_eq!(config.server_host, "mc.example.net");
        assert_eq!(config.max_memory_gb, 8);
        assert_eq!(config.default_memory_gb, 4);
    }

    #[test]
    fn token_is_required() {
        assert!(matches!(
            Config::from_lookup(lookup(&[])),
            Err(ConfigError::Missing("DISCORD_TOKEN"))
        ));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = Config::from_lookup(lookup(&[("DISCORD_TOKEN", "abc"), ("MAX_SERVERS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_SERVERS", .. }));
        assert_eq!(err.to_string(), "MAX_SERVERS must be a whole number, got `lots`");
    }

    #[test]
    fn default_memory_must_fit_the_limit() {
        let err = Config::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "abc"),
            ("DEFAULT_MEMORY_GB", "32"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "DEFAULT_MEMORY_GB", .. }));
    }
}
