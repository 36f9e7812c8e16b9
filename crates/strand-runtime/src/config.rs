//! Scheduler configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```ignore
//! use strand_runtime::SchedulerConfig;
//!
//! // Use defaults with env overrides
//! let config = SchedulerConfig::from_env();
//!
//! // Or customize programmatically
//! let config = SchedulerConfig::from_env().workers(8).use_caller(true);
//! ```

use strand_core::env::{env_get, env_get_bool};
use strand_core::error::{SchedError, SchedResult};

/// Compile-time defaults
pub mod defaults {
    /// Worker threads
    pub const WORKERS: usize = 4;
    /// Fiber stack size in bytes (0 = runtime default)
    pub const STACK_SIZE: usize = 0;
    /// Caller thread participates as a worker
    pub const USE_CALLER: bool = false;
    /// Enable the I/O hooks on every worker thread
    pub const HOOK_IO: bool = false;
}

/// Scheduler configuration with builder-style setters
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Total threads (includes the caller when `use_caller` is set)
    pub workers: usize,
    /// Fiber stack size in bytes; 0 selects the runtime default
    pub stack_size: usize,
    /// Run the scheduling loop on the constructing thread during stop
    pub use_caller: bool,
    /// Enable the blocking-call interception on worker threads
    pub hook_io: bool,
    /// Scheduler name (thread names derive from it)
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedulerConfig {
    /// Defaults with environment overrides
    ///
    /// Environment variables (all optional):
    /// - `STRAND_WORKERS` - number of threads
    /// - `STRAND_STACK_SIZE` - fiber stack size in bytes
    /// - `STRAND_USE_CALLER` - caller thread participates (0/1)
    /// - `STRAND_HOOK_IO` - enable I/O hooks on workers (0/1)
    pub fn from_env() -> Self {
        Self {
            workers: env_get("STRAND_WORKERS", defaults::WORKERS),
            stack_size: env_get("STRAND_STACK_SIZE", defaults::STACK_SIZE),
            use_caller: env_get_bool("STRAND_USE_CALLER", defaults::USE_CALLER),
            hook_io: env_get_bool("STRAND_HOOK_IO", defaults::HOOK_IO),
            name: "strand".to_string(),
        }
    }

    /// Explicit defaults, no env override
    pub fn new() -> Self {
        Self {
            workers: defaults::WORKERS,
            stack_size: defaults::STACK_SIZE,
            use_caller: defaults::USE_CALLER,
            hook_io: defaults::HOOK_IO,
            name: "strand".to_string(),
        }
    }

    // Builder methods

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn use_caller(mut self, enable: bool) -> Self {
        self.use_caller = enable;
        self
    }

    pub fn hook_io(mut self, enable: bool) -> Self {
        self.hook_io = enable;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> SchedResult<()> {
        if self.workers == 0 {
            return Err(SchedError::InvalidConfig("workers must be > 0"));
        }
        if self.workers > 256 {
            return Err(SchedError::InvalidConfig("workers must be <= 256"));
        }
        if self.stack_size != 0 && self.stack_size < 16 * 1024 {
            return Err(SchedError::InvalidConfig("stack_size must be >= 16KB"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_valid() {
        let config = SchedulerConfig::from_env();
        assert!(config.workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::new()
            .workers(8)
            .use_caller(true)
            .hook_io(true)
            .name("io");

        assert_eq!(config.workers, 8);
        assert!(config.use_caller);
        assert!(config.hook_io);
        assert_eq!(config.name, "io");
    }

    #[test]
    fn test_validation() {
        assert!(SchedulerConfig::new().workers(0).validate().is_err());
        assert!(SchedulerConfig::new().workers(1000).validate().is_err());
        assert!(SchedulerConfig::new().stack_size(1024).validate().is_err());
        assert!(SchedulerConfig::new().stack_size(0).validate().is_ok());
    }
}
