//! User configuration for the debug session engine.
//!
//! Settings live in `config.toml` under the platform config directory
//! (`~/.config/scriptdap/config.toml` on Linux). Every field has a default, so
//! a missing file or a partial file is always valid.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::Context;
use serde::{Deserialize, Serialize};

const CONFIG_DIR_NAME: &str = "scriptdap";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub session: SessionSettings,
    pub formatting: FormattingSettings,
}

/// Settings for the session state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionSettings {
    /// How long a read or write request waits for the engine thread before
    /// giving up
    pub request_timeout_ms: u64,
}

impl SessionSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
        }
    }
}

/// Literal spellings used when rendering values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FormattingSettings {
    pub true_literal: String,
    pub false_literal: String,
    pub null_literal: String,
}

impl Default for FormattingSettings {
    fn default() -> Self {
        Self {
            true_literal: "$true".to_string(),
            false_literal: "$false".to_string(),
            null_literal: "$null".to_string(),
        }
    }
}

/// Default location of the configuration file, if a config directory exists
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load the configuration from the default location
pub fn load() -> eyre::Result<Config> {
    match default_path() {
        Some(path) => load_from(path),
        None => {
            tracing::warn!("cannot determine config directory, using default configuration");
            Ok(Config::default())
        }
    }
}

/// Load the configuration from a specific file, falling back to defaults if
/// the file does not exist
pub fn load_from(path: impl AsRef<Path>) -> eyre::Result<Config> {
    let path = path.as_ref();
    if !path.is_file() {
        tracing::debug!(path = %path.display(), "no config file found, using defaults");
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading config file {}", path.display()))?;
    let config = from_str(&contents)
        .wrap_err_with(|| format!("parsing config file {}", path.display()))?;
    tracing::debug!(path = %path.display(), ?config, "loaded config");
    Ok(config)
}

pub fn from_str(contents: &str) -> eyre::Result<Config> {
    toml::from_str(contents).context("deserializing configuration")
}

/// Write the configuration to a file, creating parent directories as needed
pub fn save_to(config: &Config, path: impl AsRef<Path>) -> eyre::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("creating config directory {}", parent.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("serializing configuration")?;
    std::fs::write(path, contents)
        .wrap_err_with(|| format!("writing config file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_from(dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.session.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = from_str(
            r#"
            [formatting]
            true-literal = "True"
            "#,
        )
        .unwrap();

        assert_eq!(config.formatting.true_literal, "True");
        assert_eq!(config.formatting.false_literal, "$false");
        assert_eq!(config.session, SessionSettings::default());
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nrequest-timeout-ms = \"soon\"\n").unwrap();

        let err = load_from(&path).unwrap_err();
        assert!(format!("{err:?}").contains("config.toml"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.session.request_timeout_ms = 250;

        save_to(&config, &path).unwrap();
        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
