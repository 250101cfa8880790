//! Admission and reconciliation engine
//!
//! - `ownership` - Which routing resources this instance owns
//! - `aggregator` - Snapshot of owned resources and their endpoints
//! - `synth` - Deterministic configuration rendering
//! - `dataplane` - Apply seam towards the running data plane
//! - `reconciler` - Sequential convergence loop
//! - `watcher` - Kubernetes watch adapter feeding the reconciler
//! - `fault` - Operator-visible fault reporting

pub mod aggregator;
pub mod dataplane;
pub mod fault;
pub mod ownership;
pub mod reconciler;
pub mod synth;
pub mod watcher;

pub use aggregator::{AggregateError, Aggregator, EventKind, ResourceEvent, Snapshot};
pub use dataplane::{ApplyError, DataPlane, FileDataPlane};
pub use fault::{Fault, FaultReporter};
pub use ownership::{is_owned, ControllerIdentity};
pub use reconciler::{
    AppliedConfig, Reconciler, ReconcilerConfig, ReconcilerHandle, ReconcilerState, WatchEvent,
};
pub use synth::{synthesize, ConfigArtifact};
pub use watcher::{run_watcher, EventForwarder, ForwardError, WatchError};
