//! Controller configuration.

use std::time::Duration;

use crate::backoff::ExponentialBackoff;
use crate::error::ControllerError;
use crate::reflector::ReflectorConfig;

/// Tunables for a [`Controller`](crate::Controller).
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Name used for the queue, logs and metric labels
    pub name: String,
    /// Number of concurrent workers
    pub workers: usize,
    /// Rate-limited re-queues before a failing key is dropped
    pub max_retries: u32,
    /// Period for re-delivering every cached object; zero disables resync
    pub resync_period: Duration,
    /// First per-key retry delay
    pub backoff_base: Duration,
    /// Maximum per-key retry delay
    pub backoff_cap: Duration,
    /// Enqueue every object returned by the initial list
    pub initial_reconcile: bool,
    /// Time in-flight reconciles get to finish on shutdown
    pub shutdown_grace_period: Duration,
    /// First delay between failed re-lists
    pub relist_backoff_base: Duration,
    /// Maximum delay between failed re-lists
    pub relist_backoff_cap: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "controller".to_string(),
            workers: 1,
            max_retries: 5,
            resync_period: Duration::ZERO,
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_secs(1000),
            initial_reconcile: true,
            shutdown_grace_period: Duration::from_secs(30),
            relist_backoff_base: Duration::from_millis(800),
            relist_backoff_cap: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    /// Defaults with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Number of concurrent workers.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Retries before a failing key is dropped.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Resync period; zero disables resync.
    #[must_use]
    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Per-key retry backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Whether the initial list is enqueued.
    #[must_use]
    pub fn with_initial_reconcile(mut self, initial_reconcile: bool) -> Self {
        self.initial_reconcile = initial_reconcile;
        self
    }

    /// Grace period for in-flight reconciles on shutdown.
    #[must_use]
    pub fn with_shutdown_grace_period(mut self, period: Duration) -> Self {
        self.shutdown_grace_period = period;
        self
    }

    /// Backoff bounds between failed re-lists.
    #[must_use]
    pub fn with_relist_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.relist_backoff_base = base;
        self.relist_backoff_cap = cap;
        self
    }

    /// Per-key retry backoff for the work queue.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.backoff_base, self.backoff_cap)
    }

    /// Delay policy between failed re-lists.
    pub fn relist_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.relist_backoff_base, self.relist_backoff_cap)
    }

    /// Reflector settings derived from this configuration.
    pub fn reflector(&self) -> ReflectorConfig {
        ReflectorConfig {
            initial_reconcile: self.initial_reconcile,
            resync_period: self.resync_period,
            relist_backoff: self.relist_backoff(),
        }
    }

    /// Checks the configuration for values the controller cannot run with.
    ///
    /// # Errors
    ///
    /// [`ControllerError::InvalidConfig`] describing the first bad field.
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.name.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "name must not be empty".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        check_backoff("backoff", self.backoff_base, self.backoff_cap)?;
        check_backoff(
            "relist_backoff",
            self.relist_backoff_base,
            self.relist_backoff_cap,
        )?;
        Ok(())
    }
}

fn check_backoff(field: &str, base: Duration, cap: Duration) -> Result<(), ControllerError> {
    if base.is_zero() {
        return Err(ControllerError::InvalidConfig(format!(
            "{field}_base must be greater than zero"
        )));
    }
    if base > cap {
        return Err(ControllerError::InvalidConfig(format!(
            "{field}_base ({base:?}) exceeds {field}_cap ({cap:?})"
        )));
    }
    Ok(())
}
