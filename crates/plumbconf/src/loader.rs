//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, InfraConfig, PlumbConfig, RemoteConfig, SessionConfig, TelemetryConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/plumbline/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("plumbline/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("plumbline.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<PlumbConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Parse config from a TOML string, section by section.
fn parse_toml(contents: &str, path: &Path) -> Result<PlumbConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut config = PlumbConfig::default();

    if let Some(remote) = table.get("remote").and_then(|v| v.as_table()) {
        if let Some(v) = remote.get("name").and_then(|v| v.as_str()) {
            config.infra.remote.name = v.to_string();
        }
        if let Some(v) = remote.get("app_name").and_then(|v| v.as_str()) {
            config.infra.remote.app_name = v.to_string();
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            config.infra.telemetry.log_level = v.to_string();
        }
    }

    if let Some(session) = table.get("session").and_then(|v| v.as_table()) {
        if let Some(features) = session.get("default_features") {
            let Some(list) = features.as_array() else {
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    message: "session.default_features must be an array of strings".to_string(),
                });
            };
            config.session.default_features = list
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = session
            .get("force_info_for_property_constraints")
            .and_then(|v| v.as_bool())
        {
            config.session.force_info_for_property_constraints = v;
        }
    }

    Ok(config)
}

fn pick<T: PartialEq>(base: T, overlay: T, default: T) -> T {
    if overlay != default {
        overlay
    } else {
        base
    }
}

/// Merge two configs, with `overlay` taking precedence wherever it differs
/// from the compiled default.
pub fn merge_configs(base: PlumbConfig, overlay: PlumbConfig) -> PlumbConfig {
    let remote_default = RemoteConfig::default();
    let telemetry_default = TelemetryConfig::default();
    let session_default = SessionConfig::default();

    PlumbConfig {
        infra: InfraConfig {
            remote: RemoteConfig {
                name: pick(
                    base.infra.remote.name,
                    overlay.infra.remote.name,
                    remote_default.name,
                ),
                app_name: pick(
                    base.infra.remote.app_name,
                    overlay.infra.remote.app_name,
                    remote_default.app_name,
                ),
            },
            telemetry: TelemetryConfig {
                log_level: pick(
                    base.infra.telemetry.log_level,
                    overlay.infra.telemetry.log_level,
                    telemetry_default.log_level,
                ),
            },
        },
        session: SessionConfig {
            default_features: pick(
                base.session.default_features,
                overlay.session.default_features,
                session_default.default_features,
            ),
            force_info_for_property_constraints: pick(
                base.session.force_info_for_property_constraints,
                overlay.session.force_info_for_property_constraints,
                session_default.force_info_for_property_constraints,
            ),
        },
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut PlumbConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("PLUMBLINE_REMOTE") {
        config.infra.remote.name = v;
        sources.env_overrides.push("PLUMBLINE_REMOTE".to_string());
    }
    if let Ok(v) = env::var("PLUMBLINE_APP_NAME") {
        config.infra.remote.app_name = v;
        sources.env_overrides.push("PLUMBLINE_APP_NAME".to_string());
    }

    if let Ok(v) = env::var("PLUMBLINE_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("PLUMBLINE_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    if let Ok(v) = env::var("PLUMBLINE_DEFAULT_FEATURES") {
        config.session.default_features = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        sources
            .env_overrides
            .push("PLUMBLINE_DEFAULT_FEATURES".to_string());
    }
}
