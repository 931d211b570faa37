//! Minimal configuration loading for plumbline.
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): which remote to connect to and how
//!   to log. Fixed once a session starts.
//!
//! - **Session** (`SessionConfig`): defaults the session core falls back on
//!   when callers leave feature requests unspecified.
//!
//! # Usage
//!
//! ```rust,no_run
//! use plumbconf::PlumbConfig;
//!
//! let config = PlumbConfig::load().expect("Failed to load config");
//! println!("remote: {}", config.infra.remote.name);
//! println!("log level: {}", config.infra.telemetry.log_level);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/plumbline/config.toml` (system)
//! 2. `~/.config/plumbline/config.toml` (user)
//! 3. `./plumbline.toml` (local override)
//! 4. Environment variables (`PLUMBLINE_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [remote]
//! name = "pipewire-0"
//! app_name = "session-monitor"
//!
//! [telemetry]
//! log_level = "plumbline=debug,info"
//!
//! [session]
//! default_features = ["bound", "info"]
//! force_info_for_property_constraints = true
//! ```

pub mod infra;
pub mod loader;
pub mod session;

pub use infra::{InfraConfig, RemoteConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use session::SessionConfig;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete plumbline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlumbConfig {
    #[serde(flatten)]
    pub infra: InfraConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

impl PlumbConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace `./plumbline.toml`.
    ///
    /// System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = PlumbConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# plumbline configuration\n\n");

        output.push_str("[remote]\n");
        output.push_str(&format!("name = \"{}\"\n", self.infra.remote.name));
        output.push_str(&format!("app_name = \"{}\"\n", self.infra.remote.app_name));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.infra.telemetry.log_level
        ));

        output.push_str("\n[session]\n");
        let features: Vec<String> = self
            .session
            .default_features
            .iter()
            .map(|f| format!("\"{}\"", f))
            .collect();
        output.push_str(&format!("default_features = [{}]\n", features.join(", ")));
        output.push_str(&format!(
            "force_info_for_property_constraints = {}\n",
            self.session.force_info_for_property_constraints
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PlumbConfig::default();
        assert_eq!(config.infra.remote.name, "pipewire-0");
        assert_eq!(config.infra.remote.app_name, "plumbline");
        assert_eq!(config.infra.telemetry.log_level, "info");
        assert_eq!(config.session.default_features, vec!["bound".to_string()]);
        assert!(config.session.force_info_for_property_constraints);
    }

    #[test]
    fn test_to_toml_parses_back() {
        let mut config = PlumbConfig::default();
        config.infra.remote.app_name = "monitor".to_string();
        config.session.default_features = vec!["bound".to_string(), "info".to_string()];

        let toml_str = config.to_toml();
        let parsed: PlumbConfig = toml::from_str(&toml_str).expect("rendered TOML should parse");

        assert_eq!(parsed.infra.remote.app_name, "monitor");
        assert_eq!(parsed.session.default_features, config.session.default_features);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[remote]\nname = \"pipewire-test\"\n\n[session]\ndefault_features = [\"bound\", \"params\"]\n",
        )
        .unwrap();

        let (config, sources) = PlumbConfig::load_with_sources_from(Some(&path)).unwrap();
        assert_eq!(config.infra.remote.name, "pipewire-test");
        assert_eq!(
            config.session.default_features,
            vec!["bound".to_string(), "params".to_string()]
        );
        assert!(sources.files.contains(&path));
    }
}
