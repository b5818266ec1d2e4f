//! Runtime configuration.
//!
//! Values come from, in increasing priority: defaults, an optional file, and
//! `WEFT_*` environment variables (nested keys use `__`, e.g.
//! `WEFT_LOGGING__LEVEL=debug`).

use crate::error::{Error, ErrorKind, Result};
use crate::logging::LoggingConfig;

use config::{Config, ConfigBuilder, ConfigError, Environment, File, builder::DefaultState};
use serde::{Deserialize, Serialize};

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

/// Settings for building executors and runtime helpers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Base name for worker threads.
    pub thread_name: String,

    /// Threads polling tasks. Zero means one per available CPU.
    pub worker_threads: usize,

    /// Dedicated threads for `exec_blocking` bodies. Zero shares the workers.
    pub blocking_threads: usize,

    /// Lock timeout applied by callers that do not pick their own.
    pub lock_timeout_ms: u64,

    /// Default checkpoint cadence for yielding sequences.
    pub yield_every: usize,

    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name: "weft-worker".to_string(),
            worker_threads: 0,
            blocking_threads: 0,
            lock_timeout_ms: 30_000,
            yield_every: 64,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `WEFT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::load(builder())
    }

    /// `path` (any format the `config` crate recognizes by extension),
    /// overridden by `WEFT_*` environment variables.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(Config::builder().add_source(File::from(path.as_ref())).add_source(environment()))
    }

    fn load(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize::<Self>())
            .map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.thread_name.is_empty() {
            return Err(Error::new(ErrorKind::Config).with_message("thread_name must not be empty"));
        }
        if self.yield_every == 0 {
            return Err(Error::new(ErrorKind::Config).with_message("yield_every must be at least 1"));
        }
        Ok(())
    }

    /// Worker count with the zero default resolved.
    pub fn resolved_worker_threads(&self) -> usize {
        match self.worker_threads {
            0 => std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            n => n,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn yield_every(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.yield_every).unwrap_or(NonZeroUsize::MIN)
    }
}

fn builder() -> ConfigBuilder<DefaultState> {
    Config::builder().add_source(environment())
}

fn environment() -> Environment {
    Environment::with_prefix("WEFT")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn config_error(e: ConfigError) -> Error {
    Error::new(ErrorKind::Config).with_source(e)
}
