//! Reconciliation loop
//!
//! A single sequential consumer of watch events. Each event is folded into
//! the aggregator; when the synthesized configuration differs from what the
//! data plane last accepted, it is applied. At most one apply is in flight:
//! events arriving meanwhile are absorbed and picked up by one follow-up
//! reconcile once the apply settles.
//!
//! States: `Idle` → `Reconciling` → (`Applying` → [`Backoff` → `Applying`]*) → `Idle`

use crate::controller::aggregator::{AggregateError, Aggregator, ResourceEvent};
use crate::controller::dataplane::{ApplyError, DataPlane};
use crate::controller::fault::{Fault, FaultReporter};
use crate::controller::ownership::ControllerIdentity;
use crate::controller::synth::{synthesize, ConfigArtifact};
use crate::server::{SharedMetrics, ShutdownSignal};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default bound on a single data-plane apply
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay before the first retry
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default cap on the retry delay
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default number of retries after the first failed apply
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcilerState {
    Idle,
    Reconciling,
    Applying,
    Backoff,
}

/// Item delivered by the watcher
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Resource(ResourceEvent),
    /// Complete listing replacing everything seen so far
    Resync(Vec<ResourceEvent>),
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub apply_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl ReconcilerConfig {
    /// Delay after the `failures`-th consecutive failed apply
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// An artifact the data plane accepted
#[derive(Debug, Clone)]
pub struct AppliedConfig {
    pub artifact: ConfigArtifact,
    pub applied_at: DateTime<Utc>,
}

/// Read-only view of a running reconciler
#[derive(Clone)]
pub struct ReconcilerHandle {
    state: watch::Receiver<ReconcilerState>,
    applied: watch::Receiver<Option<Arc<AppliedConfig>>>,
}

impl ReconcilerHandle {
    pub fn state(&self) -> ReconcilerState {
        *self.state.borrow()
    }

    /// Last artifact the data plane accepted
    pub fn last_applied(&self) -> Option<Arc<AppliedConfig>> {
        self.applied.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ReconcilerState> {
        self.state.clone()
    }

    pub fn watch_applied(&self) -> watch::Receiver<Option<Arc<AppliedConfig>>> {
        self.applied.clone()
    }
}

type ApplyOutcome = (Result<(), ApplyError>, Duration);
type ApplyFuture = BoxFuture<'static, ApplyOutcome>;

struct Pending {
    artifact: ConfigArtifact,
    /// Consecutive failed applies of this artifact
    failures: u32,
}

pub struct Reconciler {
    aggregator: Aggregator,
    data_plane: Arc<dyn DataPlane>,
    config: ReconcilerConfig,
    faults: FaultReporter,
    metrics: Option<SharedMetrics>,
    state_tx: watch::Sender<ReconcilerState>,
    applied_tx: watch::Sender<Option<Arc<AppliedConfig>>>,
    pending: Option<Pending>,
    // Snapshot changed while an apply was in flight or backing off
    dirty: bool,
    retry_at: Option<Instant>,
}

impl Reconciler {
    pub fn new(
        identity: ControllerIdentity,
        data_plane: Arc<dyn DataPlane>,
        config: ReconcilerConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ReconcilerState::Idle);
        let (applied_tx, _) = watch::channel(None);
        Self {
            aggregator: Aggregator::new(identity),
            data_plane,
            config,
            faults: FaultReporter::default(),
            metrics: None,
            state_tx,
            applied_tx,
            pending: None,
            dirty: false,
            retry_at: None,
        }
    }

    pub fn with_faults(mut self, faults: FaultReporter) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn handle(&self) -> ReconcilerHandle {
        ReconcilerHandle {
            state: self.state_tx.subscribe(),
            applied: self.applied_tx.subscribe(),
        }
    }

    /// Consume events until the stream ends or shutdown is requested
    pub async fn run(mut self, mut events: mpsc::Receiver<WatchEvent>, mut shutdown: ShutdownSignal) {
        info!(
            class = ?self.aggregator.identity().class(),
            owns_unclassed = self.aggregator.identity().owns_unclassed(),
            "Starting reconciler"
        );
        let mut in_flight: Option<ApplyFuture> = None;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    info!("Shutdown requested, stopping reconciler");
                    break;
                }
                outcome = wait_in_flight(&mut in_flight) => {
                    in_flight = self.finish_apply(outcome);
                }
                _ = sleep_until_deadline(self.retry_at) => {
                    self.retry_at = None;
                    in_flight = self.retry();
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(apply) = self.handle_event(event, in_flight.is_some()) {
                            in_flight = Some(apply);
                        }
                    }
                    None => {
                        info!("Event stream closed, stopping reconciler");
                        break;
                    }
                },
            }
        }

        if let Some(apply) = in_flight {
            debug!("Waiting for in-flight apply before exit");
            let (result, _) = apply.await;
            match result {
                Ok(()) => self.record_applied(),
                Err(e) => warn!(error = %e, "In-flight apply abandoned at shutdown"),
            }
        }
        self.set_state(ReconcilerState::Idle);
    }

    fn handle_event(&mut self, event: WatchEvent, applying: bool) -> Option<ApplyFuture> {
        let busy = applying || self.retry_at.is_some();
        if !busy {
            self.set_state(ReconcilerState::Reconciling);
        }

        let changed = self.absorb(event);
        if busy {
            self.dirty |= changed;
            return None;
        }
        self.reconcile()
    }

    /// Fold an event into the aggregator, returning whether the snapshot changed
    fn absorb(&mut self, event: WatchEvent) -> bool {
        let changed = match event {
            WatchEvent::Resource(event) => {
                self.record_event(event.kind.as_str());
                match self.aggregator.apply(event) {
                    Ok(changed) => changed,
                    Err(AggregateError::Malformed { key, source }) => {
                        self.faults.report(Fault::MalformedResource {
                            key,
                            reason: source.to_string(),
                        });
                        // Endpoints of the retained entry may have moved
                        true
                    }
                    Err(err @ AggregateError::Stale { .. }) => {
                        debug!(error = %err, "Ignoring out-of-order event");
                        false
                    }
                }
            }
            WatchEvent::Resync(listing) => {
                self.record_event("resync");
                let outcome = self.aggregator.resync(listing);
                for rejected in outcome.rejected {
                    if let AggregateError::Malformed { key, source } = rejected {
                        self.faults.report(Fault::MalformedResource {
                            key,
                            reason: source.to_string(),
                        });
                    }
                }
                outcome.changed
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.set_owned_resources(self.aggregator.snapshot().len());
        }
        changed
    }

    /// Synthesize and start an apply if the result differs from what is live
    fn reconcile(&mut self) -> Option<ApplyFuture> {
        self.dirty = false;
        let candidate = synthesize(self.aggregator.snapshot());

        if self.is_live(&candidate) {
            debug!(checksum = %candidate.checksum(), "Configuration unchanged");
            if let Some(metrics) = &self.metrics {
                metrics.record_unchanged();
            }
            self.pending = None;
            self.set_state(ReconcilerState::Idle);
            return None;
        }

        Some(self.start_apply(candidate, 0))
    }

    fn retry(&mut self) -> Option<ApplyFuture> {
        let Some(pending) = self.pending.take() else {
            self.set_state(ReconcilerState::Idle);
            return None;
        };

        if !self.dirty {
            return Some(self.start_apply(pending.artifact, pending.failures));
        }

        // The snapshot moved on while backing off; retry what it renders now
        self.set_state(ReconcilerState::Reconciling);
        self.dirty = false;
        let candidate = synthesize(self.aggregator.snapshot());
        if self.is_live(&candidate) {
            debug!("Pending configuration superseded by the live one");
            self.set_state(ReconcilerState::Idle);
            return None;
        }
        let failures = if candidate == pending.artifact {
            pending.failures
        } else {
            debug!(
                stale = %pending.artifact.checksum(),
                checksum = %candidate.checksum(),
                "Pending configuration superseded"
            );
            0
        };
        Some(self.start_apply(candidate, failures))
    }

    fn start_apply(&mut self, artifact: ConfigArtifact, failures: u32) -> ApplyFuture {
        debug!(
            checksum = %artifact.checksum(),
            hosts = artifact.hosts().len(),
            attempt = failures + 1,
            "Applying configuration"
        );
        self.set_state(ReconcilerState::Applying);

        let data_plane = Arc::clone(&self.data_plane);
        let timeout = self.config.apply_timeout;
        let payload = artifact.clone();
        self.pending = Some(Pending { artifact, failures });

        Box::pin(async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, data_plane.apply(&payload)).await {
                Ok(result) => result,
                Err(_) => Err(ApplyError::Timeout(timeout)),
            };
            (result, started.elapsed())
        })
    }

    fn finish_apply(&mut self, (result, elapsed): ApplyOutcome) -> Option<ApplyFuture> {
        match result {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_apply_success(elapsed.as_secs_f64());
                }
                self.record_applied();
                if self.dirty {
                    self.set_state(ReconcilerState::Reconciling);
                    return self.reconcile();
                }
                self.set_state(ReconcilerState::Idle);
                None
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_apply_failure(elapsed.as_secs_f64());
                }
                let Some(mut pending) = self.pending.take() else {
                    self.set_state(ReconcilerState::Idle);
                    return None;
                };
                pending.failures += 1;

                if pending.failures > self.config.max_retries {
                    self.faults.report(Fault::ApplyExhausted {
                        checksum: pending.artifact.checksum().to_string(),
                        attempts: pending.failures,
                        last_error: err.to_string(),
                    });
                    if self.dirty {
                        self.set_state(ReconcilerState::Reconciling);
                        return self.reconcile();
                    }
                    self.set_state(ReconcilerState::Idle);
                    return None;
                }

                let delay = self.config.backoff(pending.failures);
                warn!(
                    error = %err,
                    checksum = %pending.artifact.checksum(),
                    attempt = pending.failures,
                    retry_in = ?delay,
                    "Apply failed, backing off"
                );
                self.pending = Some(pending);
                self.retry_at = Some(Instant::now() + delay);
                self.set_state(ReconcilerState::Backoff);
                None
            }
        }
    }

    /// Promote the pending artifact to last applied
    fn record_applied(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        info!(
            checksum = %pending.artifact.checksum(),
            hosts = ?pending.artifact.hosts(),
            retries = pending.failures,
            "Configuration live"
        );
        self.applied_tx.send_replace(Some(Arc::new(AppliedConfig {
            artifact: pending.artifact,
            applied_at: Utc::now(),
        })));
    }

    fn is_live(&self, candidate: &ConfigArtifact) -> bool {
        self.applied_tx
            .borrow()
            .as_ref()
            .is_some_and(|applied| &applied.artifact == candidate)
    }

    fn record_event(&self, kind: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_event(kind);
        }
    }

    fn set_state(&self, next: ReconcilerState) {
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!(from = ?*state, to = ?next, "Reconciler state");
            *state = next;
            true
        });
    }
}

async fn wait_in_flight(in_flight: &mut Option<ApplyFuture>) -> ApplyOutcome {
    match in_flight {
        Some(apply) => apply.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod tests;
