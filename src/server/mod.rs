//! HTTP server and process-level plumbing
//!
//! - `/healthz` - Liveness probe (process is running)
//! - `/readyz` - Readiness probe (first configuration applied)
//! - `/metrics` - Prometheus metrics
//! - `/status` - Reconciler status JSON

mod health;
mod metrics;
mod shutdown;

pub use health::{router, run_health_server, ReadinessState, ServerState, StatusReport};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, ShutdownHandle, ShutdownSignal};

#[cfg(test)]
#[path = "health_test.rs"]
mod tests;

#[cfg(test)]
#[path = "metrics_test.rs"]
mod metrics_tests;
