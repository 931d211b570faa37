//! Infrastructure configuration - where to connect and how to log.

use serde::{Deserialize, Serialize};

/// Infrastructure settings, fixed for the lifetime of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Connection to the media server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Name of the remote to connect to.
    /// Default: pipewire-0
    #[serde(default = "RemoteConfig::default_name")]
    pub name: String,

    /// Application name announced to the server.
    /// Default: plumbline
    #[serde(default = "RemoteConfig::default_app_name")]
    pub app_name: String,
}

impl RemoteConfig {
    fn default_name() -> String {
        "pipewire-0".to_string()
    }

    fn default_app_name() -> String {
        "plumbline".to_string()
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            app_name: Self::default_app_name(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Filter directive handed to the tracing subscriber.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
