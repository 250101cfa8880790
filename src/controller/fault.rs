//! Fault reporting
//!
//! Faults are recoverable conditions an operator should know about: the
//! controller keeps running, but some input was dropped or some artifact
//! never reached the data plane. Each fault is logged, counted, and
//! broadcast to any subscriber.

use crate::model::ResourceKey;
use crate::server::SharedMetrics;
use tokio::sync::broadcast;
use tracing::{error, warn};

const FAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// An owned resource carried rules that cannot be rendered
    MalformedResource { key: ResourceKey, reason: String },

    /// The data plane never accepted an artifact
    ApplyExhausted {
        checksum: String,
        attempts: u32,
        last_error: String,
    },

    /// The event queue overflowed and a full resync was scheduled
    QueueOverflow { dropped: ResourceKey },
}

impl Fault {
    pub fn kind(&self) -> &'static str {
        match self {
            Fault::MalformedResource { .. } => "malformed_resource",
            Fault::ApplyExhausted { .. } => "apply_exhausted",
            Fault::QueueOverflow { .. } => "queue_overflow",
        }
    }
}

#[derive(Clone)]
pub struct FaultReporter {
    metrics: Option<SharedMetrics>,
    tx: broadcast::Sender<Fault>,
}

impl FaultReporter {
    pub fn new(metrics: Option<SharedMetrics>) -> Self {
        let (tx, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        Self { metrics, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Fault> {
        self.tx.subscribe()
    }

    pub fn report(&self, fault: Fault) {
        match &fault {
            Fault::MalformedResource { key, reason } => {
                warn!(resource = %key, reason = %reason, "Dropped malformed resource");
            }
            Fault::ApplyExhausted {
                checksum,
                attempts,
                last_error,
            } => {
                error!(
                    checksum = %checksum,
                    attempts = attempts,
                    error = %last_error,
                    "Data plane rejected configuration, giving up until next change"
                );
            }
            Fault::QueueOverflow { dropped } => {
                warn!(resource = %dropped, "Event queue full, scheduling full resync");
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_fault(fault.kind());
        }
        // No subscribers is fine
        let _ = self.tx.send(fault);
    }
}

impl Default for FaultReporter {
    fn default() -> Self {
        Self::new(None)
    }
}
