//! Runtime configuration.

use std::str::FromStr;

lazy_static::lazy_static! {
    /// Size at which a [`CommandQueue`][crate::command::CommandQueue] first checks whether it
    /// is worth compacting.
    #[doc(hidden)]
    pub static ref QUEUE_COMPACTION: usize = {
        let threshold = env_or("TROUPE_QUEUE_COMPACTION", 64usize).max(1);
        tracing::debug!("Configured TROUPE_QUEUE_COMPACTION = {}", threshold);
        threshold
    };
}

/// Settings for one [`System`][crate::system::System].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    pub name: String,
    /// Start a surveillance actor that watches every spawn and state change.
    pub surveillance: bool,
    /// The credit [`open_stream`][crate::actor::Activation::open_stream] asks for.
    pub stream_max_len: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            name: "troupe".to_owned(),
            surveillance: false,
            stream_max_len: 16,
        }
    }
}

impl SystemConfig {
    /// The defaults, overridden by `TROUPE_SYSTEM_NAME`, `TROUPE_SURVEILLANCE` and
    /// `TROUPE_STREAM_MAX_LEN` where set. Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let defaults = SystemConfig::default();
        SystemConfig {
            name: std::env::var("TROUPE_SYSTEM_NAME").unwrap_or(defaults.name),
            surveillance: env_or("TROUPE_SURVEILLANCE", defaults.surveillance),
            stream_max_len: env_or("TROUPE_STREAM_MAX_LEN", defaults.stream_max_len).max(1),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    pub fn with_surveillance(mut self, enabled: bool) -> Self {
        self.surveillance = enabled;
        self
    }

    pub fn with_stream_max_len(mut self, max_len: usize) -> Self {
        self.stream_max_len = max_len.max(1);
        self
    }
}

fn env_or<T: FromStr>(var: &str, default: T) -> T {
    match std::env::var(var) {
        Err(_) => default,
        Ok(s) => match s.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(var, value = %s, "ignoring unparseable setting");
                default
            }
        },
    }
}
