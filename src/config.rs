//! Scheduler configuration.
//!
//! The main entry point is [`Builder`], which sizes the thread pool and
//! tunes the dispatch loop before constructing a
//! [`Master`](crate::Master).
//!
//! # Example
//!
//! ```ignore
//! use pktgraph::Builder;
//!
//! let master = Builder::new()
//!     .threads(4)
//!     .burst(64)
//!     .cores(&[2, 3, 4, 5])
//!     .build()?;
//! master.start()?;
//! ```

use std::io;
use std::sync::Arc;

use crate::env_config::EnvConfig;
use crate::master::Master;

/// Default bound on tasks run per dispatch round. Any bound works for
/// fairness (the queue is strict round-robin); this one keeps timer and
/// I/O latency in check under task floods.
pub(crate) const DEFAULT_BURST: usize = 128;

#[derive(Debug, Clone)]
pub(crate) struct SchedulerConfig {
    /// Maximum tasks run per dispatch round.
    pub(crate) burst: usize,
    /// Worker thread name prefix.
    pub(crate) thread_name: String,
    /// Optional CPU core per worker, same length as the thread count.
    pub(crate) cores: Option<Vec<usize>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            burst: DEFAULT_BURST,
            thread_name: "pktgraph-worker".to_string(),
            cores: None,
        }
    }
}

/// Builder for a [`Master`] and its worker pool.
#[derive(Debug, Clone)]
pub struct Builder {
    threads: usize,
    config: SchedulerConfig,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            threads: 1,
            config: SchedulerConfig::default(),
        }
    }

    /// Starts from the JSON environment configuration (see
    /// [`EnvConfig`]); fails if none is present.
    pub fn from_env() -> io::Result<Builder> {
        let env = EnvConfig::load()?;
        env.validate()?;
        Ok(Builder::new().apply_env(&env))
    }

    /// Overlays the settings present in `env` onto this builder.
    pub fn apply_env(mut self, env: &EnvConfig) -> Builder {
        if let Some(threads) = env.threads {
            self.threads = threads;
        }
        if let Some(burst) = env.burst {
            self.config.burst = burst;
        }
        if !env.cores.is_empty() {
            self.config.cores = Some(env.cores.clone());
        }
        if let Some(name) = &env.thread_name {
            self.config.thread_name = name.clone();
        }
        self
    }

    /// Sets the number of worker threads (the quiescent pseudo-thread is
    /// always created in addition).
    pub fn threads(mut self, n: usize) -> Builder {
        self.threads = n;
        self
    }

    /// Sets the maximum number of tasks one dispatch round may run.
    pub fn burst(mut self, n: usize) -> Builder {
        self.config.burst = n;
        self
    }

    /// Pins each worker to a CPU core (Linux); one entry per worker.
    pub fn cores(mut self, cores: &[usize]) -> Builder {
        self.config.cores = Some(cores.to_vec());
        self
    }

    /// Sets the worker thread name prefix.
    pub fn thread_name(mut self, prefix: &str) -> Builder {
        self.config.thread_name = prefix.to_string();
        self
    }

    /// Checks the configuration is usable.
    pub fn validate(&self) -> io::Result<()> {
        if self.threads == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "thread count must be at least 1",
            ));
        }
        if self.config.burst == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "burst must be at least 1",
            ));
        }
        if let Some(cores) = &self.config.cores {
            if cores.len() != self.threads {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "core list has {} entries for {} threads",
                        cores.len(),
                        self.threads
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Validates and constructs the master. Worker threads are spawned
    /// later, by [`Master::start`].
    pub fn build(&self) -> io::Result<Arc<Master>> {
        self.validate()?;
        Master::with_config(self.threads, self.config.clone())
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let b = Builder::new();
        assert_eq!(b.threads, 1);
        assert_eq!(b.config.burst, DEFAULT_BURST);
        assert!(b.config.cores.is_none());
        b.validate().expect("defaults are valid");
    }

    #[test]
    fn test_rejects_zero_threads() {
        assert!(Builder::new().threads(0).validate().is_err());
    }

    #[test]
    fn test_rejects_zero_burst() {
        assert!(Builder::new().burst(0).validate().is_err());
    }

    #[test]
    fn test_rejects_core_count_mismatch() {
        let b = Builder::new().threads(2).cores(&[1]);
        assert!(b.validate().is_err());
        let b = Builder::new().threads(2).cores(&[1, 3]);
        b.validate().expect("matching core list");
    }

    #[test]
    fn test_apply_env_overlays_only_present_fields() {
        let env = EnvConfig::parse_json(r#"{ "threads": 3, "cores": [1, 2, 3] }"#).unwrap();
        let b = Builder::new().burst(7).apply_env(&env);
        assert_eq!(b.threads, 3);
        assert_eq!(b.config.burst, 7);
        assert_eq!(b.config.cores.as_deref(), Some(&[1, 2, 3][..]));
        assert_eq!(b.config.thread_name, "pktgraph-worker");
    }
}
