//! Pool and dispatcher configuration.
//!
//! Both configs are plain builder structs. `from_env()` applies the
//! `SLOTPOOL_LIMIT` / `SLOTPOOL_CONCURRENCY` overrides on top of the defaults.

use crate::error::ConfigError;

/// Environment variable overriding [`PoolConfig::limit`].
pub const LIMIT_ENV: &str = "SLOTPOOL_LIMIT";

/// Environment variable overriding [`DispatcherConfig::concurrency`].
pub const CONCURRENCY_ENV: &str = "SLOTPOOL_CONCURRENCY";

fn parse_count(var: &str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim().parse::<usize>().map_err(|e| {
        ConfigError::InvalidConfiguration(format!("{var}={raw:?} is not a valid count: {e}"))
    })
}

fn env_count(var: &str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse_count(var, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of resources alive at once.
    pub limit: usize,
}

impl PoolConfig {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    /// Defaults overridden by `SLOTPOOL_LIMIT` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(limit) = env_count(LIMIT_ENV)? {
            config.limit = limit;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "pool limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { limit: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Maximum number of tasks running (and slots created) at once.
    pub concurrency: usize,
    /// When false, [`Dispatcher::start`](crate::Dispatcher::start) creates
    /// every slot up front instead of on first demand.
    pub lazy: bool,
}

impl DispatcherConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    /// Defaults overridden by `SLOTPOOL_CONCURRENCY` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(concurrency) = env_count(CONCURRENCY_ENV)? {
            config.concurrency = concurrency;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "dispatcher concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lazy: true,
        }
    }
}
