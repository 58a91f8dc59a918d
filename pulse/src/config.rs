//! Server configuration file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use pulse_core::TickConfig;
use pulse_core::config::ConfigError;
use serde::Deserialize;

const DEFAULT_CONFIG: &str = include_str!("../package-content/pulse_config.json5");

/// Default location of the configuration file.
pub const CONFIG_PATH: &str = "pulse_config.json5";

/// Why the configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ServerConfigError {
    /// The file could not be read or created.
    #[error("could not access {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },
    /// The file is not valid JSON5 for this config.
    #[error("could not parse {path}: {source}")]
    Parse {
        /// The file involved.
        path: PathBuf,
        /// The parser error.
        source: serde_json5::Error,
    },
    /// A tick setting is out of range.
    #[error(transparent)]
    Tick(#[from] ConfigError),
    /// A server setting is out of range.
    #[error("{0}")]
    Invalid(&'static str),
}

/// Log line options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Prefix lines with the time.
    pub time: bool,
    /// Show the module a line came from.
    pub module_path: bool,
    /// Show structured fields.
    pub extra: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            time: true,
            module_path: false,
            extra: true,
        }
    }
}

/// Everything read from `pulse_config.json5`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// World names, ticked in this order.
    pub worlds: Vec<String>,
    /// Directory world saves live in.
    pub data_dir: PathBuf,
    /// Longest a single tick may take before the watchdog gives up, 0 disables.
    pub max_tick_time_ms: u64,
    /// Tick loop settings.
    pub tick: TickConfig,
    /// Log line options. `None` uses the defaults.
    pub log: Option<LogConfig>,
}

impl ServerConfig {
    /// Reads the config at `path`, writing the default file there first if it is missing.
    pub fn load_or_create(path: &Path) -> Result<Self, ServerConfigError> {
        let io_error = |source| ServerConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        let config = if path.exists() {
            let config_str = fs::read_to_string(path).map_err(io_error)?;
            serde_json5::from_str(&config_str).map_err(|source| ServerConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
            fs::write(path, DEFAULT_CONFIG).map_err(io_error)?;
            log::info!("Created default config at {}", path.display());
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks every value is in range.
    pub fn validate(&self) -> Result<(), ServerConfigError> {
        if self.worlds.is_empty() {
            return Err(ServerConfigError::Invalid("At least one world must be configured"));
        }
        let mut names: Vec<&str> = self.worlds.iter().map(String::as_str).collect();
        names.sort_unstable();
        if names.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(ServerConfigError::Invalid("World names must be unique"));
        }
        if self.worlds.iter().any(|name| !is_valid_world_name(name)) {
            return Err(ServerConfigError::Invalid(
                "World names may only contain a-z, 0-9, '_' and '-'",
            ));
        }
        self.tick.validate()?;
        Ok(())
    }

    /// Log options, falling back to the defaults.
    #[must_use]
    pub fn log_options(&self) -> LogConfig {
        self.log.unwrap_or_default()
    }
}

/// World names double as file names.
fn is_valid_world_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worlds: vec!["overworld".to_owned(), "nether".to_owned(), "end".to_owned()],
            data_dir: PathBuf::from("worlds"),
            max_tick_time_ms: 60_000,
            tick: TickConfig::default(),
            log: Some(LogConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_default_matches_default() {
        let parsed: ServerConfig = serde_json5::from_str(DEFAULT_CONFIG).expect("valid json5");
        assert_eq!(parsed, ServerConfig::default());
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config").join(CONFIG_PATH);

        let created = ServerConfig::load_or_create(&path).expect("default config");
        assert!(path.exists());
        let loaded = ServerConfig::load_or_create(&path).expect("existing config");
        assert_eq!(created, loaded);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(CONFIG_PATH);
        fs::write(&path, "{ worlds: ['lobby'], tick: { tick_rate: 40 } }").expect("writable");

        let config = ServerConfig::load_or_create(&path).expect("valid config");
        assert_eq!(config.worlds, vec!["lobby".to_owned()]);
        assert!((config.tick.tick_rate - 40.0).abs() < f32::EPSILON);
        assert_eq!(config.tick.autosave_interval, 900);
        assert_eq!(config.max_tick_time_ms, 60_000);
    }

    #[test]
    fn test_rejects_bad_values() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(CONFIG_PATH);

        fs::write(&path, "{ worlds: ['a', 'a'] }").expect("writable");
        assert!(matches!(
            ServerConfig::load_or_create(&path),
            Err(ServerConfigError::Invalid(_))
        ));

        fs::write(&path, "{ worlds: ['../etc'] }").expect("writable");
        assert!(matches!(
            ServerConfig::load_or_create(&path),
            Err(ServerConfigError::Invalid(_))
        ));

        fs::write(&path, "{ tick: { tick_rate: 0 } }").expect("writable");
        assert!(matches!(
            ServerConfig::load_or_create(&path),
            Err(ServerConfigError::Tick(ConfigError::TickRate(_)))
        ));

        fs::write(&path, "{ worlds: [").expect("writable");
        assert!(matches!(
            ServerConfig::load_or_create(&path),
            Err(ServerConfigError::Parse { .. })
        ));
    }
}
