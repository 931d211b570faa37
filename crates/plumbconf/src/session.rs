//! Session defaults - seed the behavior of object managers and proxies.

use serde::{Deserialize, Serialize};

/// Defaults applied by the session core when callers leave things unspecified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Features activated on matched objects when neither the interest nor
    /// a per-type request asks for any.
    /// Default: ["bound"]
    #[serde(default = "SessionConfig::default_features")]
    pub default_features: Vec<String>,

    /// Add the info feature when an interest filters on object properties,
    /// so those constraints can be checked once the object is bound.
    /// Default: true
    #[serde(default = "SessionConfig::default_force_info")]
    pub force_info_for_property_constraints: bool,
}

impl SessionConfig {
    fn default_features() -> Vec<String> {
        vec!["bound".to_string()]
    }

    fn default_force_info() -> bool {
        true
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_features: Self::default_features(),
            force_info_for_property_constraints: Self::default_force_info(),
        }
    }
}
