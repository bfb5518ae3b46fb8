use std::path::{Path, PathBuf};

use fleetwatch_core::config::EngineConfig;
use fleetwatch_core::i18n::Language;
use fleetwatch_core::profile::SourceRegistry;
use fleetwatch_core::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{var} must be {expected}, got '{value}'")]
    Env {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// JSON file holding the [`EngineConfig`]. Defaults apply without one.
    pub config_path: Option<PathBuf>,
    /// JSON file replacing the built-in source registry.
    pub registry_path: Option<PathBuf>,
    /// Telemetry dump replayed into the in-memory transport.
    pub snapshot_path: Option<PathBuf>,
    pub refresh_interval_secs: Option<u64>,
    pub language: Option<Language>,
    pub min_battery_percent: Option<f64>,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                 | Default                  |
    /// |-------------------------|--------------------------|
    /// | `FLEETWATCH_CONFIG`     | none (engine defaults)   |
    /// | `FLEETWATCH_REGISTRY`   | none (built-in sources)  |
    /// | `FLEETWATCH_SNAPSHOT`   | none (empty tree)        |
    /// | `REFRESH_INTERVAL_SECS` | from the config file     |
    /// | `FLEETWATCH_LANGUAGE`   | from the config file     |
    /// | `MIN_BATTERY_PERCENT`   | from the config file     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`WorkerConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let path = |var: &str| lookup(var).filter(|v| !v.is_empty()).map(PathBuf::from);

        let refresh_interval_secs = match lookup("REFRESH_INTERVAL_SECS") {
            Some(value) => Some(value.trim().parse().map_err(|_| ConfigError::Env {
                var: "REFRESH_INTERVAL_SECS",
                expected: "a whole number of seconds",
                value,
            })?),
            None => None,
        };
        let min_battery_percent = match lookup("MIN_BATTERY_PERCENT") {
            Some(value) => Some(value.trim().parse().map_err(|_| ConfigError::Env {
                var: "MIN_BATTERY_PERCENT",
                expected: "a number",
                value,
            })?),
            None => None,
        };

        Ok(Self {
            config_path: path("FLEETWATCH_CONFIG"),
            registry_path: path("FLEETWATCH_REGISTRY"),
            snapshot_path: path("FLEETWATCH_SNAPSHOT"),
            refresh_interval_secs,
            language: lookup("FLEETWATCH_LANGUAGE").map(|code| Language::from_code(&code)),
            min_battery_percent,
        })
    }

    /// Read the engine config file, apply the environment overrides and
    /// validate the result.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let mut config = match &self.config_path {
            Some(path) => parse_json_file::<EngineConfig>(path)?,
            None => EngineConfig::default(),
        };
        if let Some(secs) = self.refresh_interval_secs {
            config.refresh_interval_secs = secs;
        }
        if let Some(language) = self.language {
            config.language = language;
        }
        if let Some(percent) = self.min_battery_percent {
            config.min_battery_percent = percent;
        }
        Ok(config.validated()?)
    }

    pub fn source_registry(&self) -> Result<SourceRegistry, ConfigError> {
        match &self.registry_path {
            Some(path) => {
                let json = read_file(path)?;
                Ok(SourceRegistry::from_json(&json)?)
            }
            None => Ok(SourceRegistry::builtin()?),
        }
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let json = read_file(path)?;
    serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let worker = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert!(worker.config_path.is_none());
        let config = worker.engine_config().unwrap();
        assert_eq!(config.refresh_interval_secs, 60);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"sources": {{"zigbee": {{"max_minutes": 30}}}}, "refresh_interval_secs": 120, "language": "en"}}"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();

        let worker = WorkerConfig::from_lookup(lookup(&[
            ("FLEETWATCH_CONFIG", &path),
            ("REFRESH_INTERVAL_SECS", "300"),
            ("FLEETWATCH_LANGUAGE", "de"),
        ]))
        .unwrap();
        let config = worker.engine_config().unwrap();
        assert_eq!(config.refresh_interval_secs, 300);
        assert_eq!(config.language, Language::De);
        assert_eq!(config.max_minutes("zigbee"), 30);
    }

    #[test]
    fn bad_numbers_are_reported() {
        assert_matches!(
            WorkerConfig::from_lookup(lookup(&[("MIN_BATTERY_PERCENT", "low")])),
            Err(ConfigError::Env { var: "MIN_BATTERY_PERCENT", .. })
        );
    }

    #[test]
    fn out_of_range_override_fails_validation() {
        let worker = WorkerConfig::from_lookup(lookup(&[("MIN_BATTERY_PERCENT", "250")])).unwrap();
        assert_matches!(worker.engine_config(), Err(ConfigError::Core(CoreError::Validation(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let worker = WorkerConfig {
            config_path: Some(PathBuf::from("/nonexistent/fleetwatch.json")),
            ..Default::default()
        };
        assert_matches!(worker.engine_config(), Err(ConfigError::Io { .. }));
    }

    #[test]
    fn builtin_registry_loads() {
        let registry = WorkerConfig::default().source_registry().unwrap();
        assert!(!registry.is_empty());
    }
}
