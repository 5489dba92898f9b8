//! Environment configuration.
//!
//! | Variable             | Default        |
//! |----------------------|----------------|
//! | `WATCH_NAMESPACE`    | all namespaces |
//! | `WORKERS`            | 1              |
//! | `MAX_RETRIES`        | 5              |
//! | `RESYNC_PERIOD_SECS` | 0 (disabled)   |
//! | `BACKOFF_BASE_MS`    | 5              |
//! | `BACKOFF_CAP_SECS`   | 1000           |
//! | `INITIAL_RECONCILE`  | true           |
//! | `LABEL_SELECTOR`     | none           |
//! | `FIELD_SELECTOR`     | none           |
//! | `PROBE_ADDR`         | 0.0.0.0:8080   |

use std::env;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use controller_core::ControllerConfig;

use crate::error::PodControllerError;

const DEFAULT_PROBE_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080);

/// Runtime configuration of the Pod Controller.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Label selector applied to list and watch
    pub label_selector: Option<String>,
    /// Field selector applied to list and watch
    pub field_selector: Option<String>,
    /// Bind address of the probe and metrics server
    pub probe_addr: SocketAddr,
    /// Core controller tunables
    pub controller: ControllerConfig,
}

impl Config {
    /// Loads the configuration from environment variables.
    pub fn from_env() -> Result<Self, PodControllerError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, PodControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let mut controller = ControllerConfig::new("pods");
        if let Some(workers) = parse(&var, "WORKERS")? {
            controller.workers = workers;
        }
        if let Some(max_retries) = parse(&var, "MAX_RETRIES")? {
            controller.max_retries = max_retries;
        }
        if let Some(secs) = parse(&var, "RESYNC_PERIOD_SECS")? {
            controller.resync_period = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(&var, "BACKOFF_BASE_MS")? {
            controller.backoff_base = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&var, "BACKOFF_CAP_SECS")? {
            controller.backoff_cap = Duration::from_secs(secs);
        }
        if let Some(initial_reconcile) = parse(&var, "INITIAL_RECONCILE")? {
            controller.initial_reconcile = initial_reconcile;
        }
        controller
            .validate()
            .map_err(|e| PodControllerError::InvalidConfig(e.to_string()))?;

        let probe_addr = parse(&var, "PROBE_ADDR")?.unwrap_or(DEFAULT_PROBE_ADDR);

        Ok(Self {
            namespace: var("WATCH_NAMESPACE"),
            label_selector: var("LABEL_SELECTOR"),
            field_selector: var("FIELD_SELECTOR"),
            probe_addr,
            controller,
        })
    }
}

fn parse<T, F>(var: &F, name: &str) -> Result<Option<T>, PodControllerError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| {
                    PodControllerError::InvalidConfig(format!("{name}={raw:?}: {e}"))
                })
        })
        .transpose()
}
