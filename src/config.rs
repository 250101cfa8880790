//! Command-line and environment configuration

use crate::controller::{ControllerIdentity, ReconcilerConfig};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("event queue capacity must be at least 1")]
    ZeroQueueCapacity,

    #[error("apply timeout must be greater than zero")]
    ZeroApplyTimeout,

    #[error("initial backoff ({initial:?}) exceeds max backoff ({max:?})")]
    BackoffInverted { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, Parser)]
#[clap(name = "classgate", about = "An ingress-class admission controller")]
pub struct Args {
    /// Ingress class this instance serves.
    ///
    /// Empty selects default mode: only Ingresses without a class are owned.
    #[clap(long, env = "CLASSGATE_INGRESS_CLASS", default_value = "")]
    pub ingress_class: String,

    /// Also own Ingresses that carry no class marker.
    #[clap(long = "watch-ingress-without-class", env = "CLASSGATE_WATCH_WITHOUT_CLASS")]
    pub watch_without_class: bool,

    /// Restrict watches to one namespace.
    #[clap(long, env = "CLASSGATE_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    #[clap(long, env = "CLASSGATE_CONFIG_PATH", default_value = "/etc/classgate/router.conf")]
    pub config_path: PathBuf,

    /// Endpoint POSTed after each configuration write.
    #[clap(long, env = "CLASSGATE_RELOAD_URL")]
    pub reload_url: Option<String>,

    #[clap(long, env = "CLASSGATE_HEALTH_PORT", default_value = "8080")]
    pub health_port: u16,

    #[clap(long, env = "CLASSGATE_EVENT_QUEUE_CAPACITY", default_value = "256")]
    pub event_queue_capacity: usize,

    #[clap(long, env = "CLASSGATE_APPLY_TIMEOUT_SECS", default_value = "10")]
    pub apply_timeout_secs: u64,

    #[clap(long, env = "CLASSGATE_BACKOFF_INITIAL_MS", default_value = "500")]
    pub backoff_initial_ms: u64,

    #[clap(long, env = "CLASSGATE_BACKOFF_MAX_SECS", default_value = "30")]
    pub backoff_max_secs: u64,

    #[clap(long, env = "CLASSGATE_APPLY_MAX_RETRIES", default_value = "5")]
    pub apply_max_retries: u32,
}

impl Args {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.apply_timeout_secs == 0 {
            return Err(ConfigError::ZeroApplyTimeout);
        }
        let config = self.reconciler_config();
        if config.initial_backoff > config.max_backoff {
            return Err(ConfigError::BackoffInverted {
                initial: config.initial_backoff,
                max: config.max_backoff,
            });
        }
        Ok(())
    }

    pub fn identity(&self) -> ControllerIdentity {
        ControllerIdentity::new(self.ingress_class.trim(), self.watch_without_class)
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            apply_timeout: Duration::from_secs(self.apply_timeout_secs),
            initial_backoff: Duration::from_millis(self.backoff_initial_ms),
            max_backoff: Duration::from_secs(self.backoff_max_secs),
            max_retries: self.apply_max_retries,
        }
    }

    /// Namespace filter, `None` meaning all namespaces
    pub fn namespace(&self) -> Option<String> {
        self.watch_namespace.clone().filter(|ns| !ns.is_empty())
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
