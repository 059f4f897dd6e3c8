use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Dispatcher tuning shared by every [`Function`](crate::runtime::jit::Function)
/// unless its builder overrides it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Widen shapes that keep retracing
    pub reduce_retracing: bool,
    /// Distinct compatible keys needed before a group is relaxed
    pub relaxation_threshold: usize,
    /// Convert literals bound to tensor-annotated parameters
    pub follow_type_hints: bool,
    /// Consecutive traces that trigger a retracing warning
    pub retrace_warning_threshold: u64,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            reduce_retracing: true,
            relaxation_threshold: 2,
            follow_type_hints: false,
            retrace_warning_threshold: 5,
        }
    }
}

static GLOBAL: Lazy<JitConfig> = Lazy::new(JitConfig::from_env);

impl JitConfig {
    /// Process-wide configuration, read from the environment on first use.
    pub fn global() -> &'static JitConfig {
        &GLOBAL
    }

    pub fn from_env() -> Self {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Overlays variables from `lookup` on the defaults. Unparsable values keep the default.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(val) = lookup("POLYTRACE_REDUCE_RETRACING") {
            config.reduce_retracing = val.parse().unwrap_or(config.reduce_retracing);
        }
        if let Some(val) = lookup("POLYTRACE_RELAX_THRESHOLD") {
            config.relaxation_threshold = val.parse().unwrap_or(config.relaxation_threshold);
        }
        if let Some(val) = lookup("POLYTRACE_FOLLOW_TYPE_HINTS") {
            config.follow_type_hints = val.parse().unwrap_or(config.follow_type_hints);
        }
        if let Some(val) = lookup("POLYTRACE_RETRACE_WARN") {
            config.retrace_warning_threshold =
                val.parse().unwrap_or(config.retrace_warning_threshold);
        }
        config
    }

    #[cfg(feature = "toml-config")]
    pub fn from_toml_str(source: &str) -> anyhow::Result<Self> {
        use anyhow::Context;
        toml::from_str(source).context("failed to parse polytrace configuration")
    }
}
