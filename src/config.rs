//! Process-wide settings read from the environment.
//!
//! | Variable                  | Effect                                              |
//! |---------------------------|-----------------------------------------------------|
//! | `NARRAY_DEBUG=1`          | dump resolved index arguments and loop plans        |
//! | `NARRAY_PARALLEL_MIN_LEN` | minimum iteration size before `ndloop_par` splits   |
//!
//! Dumps are emitted as `tracing` events at `DEBUG` level, so a subscriber
//! still has to be installed by the application to see them.

use std::sync::OnceLock;

/// Minimum number of elements to justify multi-threaded execution.
pub const DEFAULT_PARALLEL_MIN_LEN: usize = 1 << 15;

/// Settings resolved once per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Dump index arguments and loop plans.
    pub debug: bool,
    /// Iteration size below which parallel execution is not attempted.
    pub parallel_min_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            parallel_min_len: DEFAULT_PARALLEL_MIN_LEN,
        }
    }
}

impl Config {
    /// Build a configuration from a variable lookup function.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(v) = lookup("NARRAY_DEBUG") {
            config.debug = matches!(v.trim(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup("NARRAY_PARALLEL_MIN_LEN") {
            match v.trim().parse::<usize>() {
                Ok(n) => config.parallel_min_len = n,
                Err(_) => tracing::warn!(value = %v, "ignoring malformed NARRAY_PARALLEL_MIN_LEN"),
            }
        }
        config
    }

    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// The cached process configuration.
pub fn get() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(Config::from_env)
}

#[inline]
pub(crate) fn debug_enabled() -> bool {
    get().debug
}
