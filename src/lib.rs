pub mod config;
pub mod controller;
pub mod model;
pub mod server;

// Re-export for main.rs and integration tests
pub use crate::config::{Args, ConfigError};
pub use crate::controller::{ControllerIdentity, Reconciler, ReconcilerConfig};
