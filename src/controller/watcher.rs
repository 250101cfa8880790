//! Resource watcher
//!
//! Turns Ingress and EndpointSlice watch events into [`WatchEvent`]s on the
//! bounded reconciler queue. The forwarder keeps its own cache of everything
//! it has seen so that, when the queue overflows, it can drop individual
//! events and later send one complete [`WatchEvent::Resync`] instead.

use crate::controller::aggregator::{EventKind, ResourceEvent};
use crate::controller::fault::{Fault, FaultReporter};
use crate::controller::reconciler::WatchEvent;
use crate::model::endpoints::SERVICE_NAME_LABEL;
use crate::model::routing::DEFAULT_NAMESPACE;
use crate::model::{BackendEndpoints, ResourceKey, RoutingResource};
use crate::server::ShutdownSignal;
use futures::StreamExt;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("event queue closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error("{resource} watch stream ended")]
    StreamEnded { resource: &'static str },
}

/// (namespace, service name)
type ServiceKey = (String, String);

pub struct EventForwarder {
    tx: mpsc::Sender<WatchEvent>,
    faults: FaultReporter,
    ingresses: BTreeMap<ResourceKey, RoutingResource>,
    slices: BTreeMap<ServiceKey, BTreeMap<String, EndpointSlice>>,
    ingress_relist: Option<BTreeMap<ResourceKey, RoutingResource>>,
    slice_relist: Option<BTreeMap<ServiceKey, BTreeMap<String, EndpointSlice>>>,
    ingresses_synced: bool,
    needs_resync: bool,
}

impl EventForwarder {
    pub fn new(tx: mpsc::Sender<WatchEvent>, faults: FaultReporter) -> Self {
        Self {
            tx,
            faults,
            ingresses: BTreeMap::new(),
            slices: BTreeMap::new(),
            ingress_relist: None,
            slice_relist: None,
            ingresses_synced: false,
            needs_resync: false,
        }
    }

    /// A resync is owed to the reconciler
    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    pub fn handle_ingress_event(&mut self, event: Event<Ingress>) -> Result<(), ForwardError> {
        match event {
            Event::Apply(ingress) => self.ingress_applied(&ingress),
            Event::Delete(ingress) => self.ingress_deleted(&ingress),
            Event::Init => {
                debug!("Ingress relist started");
                self.ingress_relist = Some(BTreeMap::new());
                Ok(())
            }
            Event::InitApply(ingress) => {
                let resource = RoutingResource::from_ingress(&ingress);
                self.ingress_relist
                    .get_or_insert_with(BTreeMap::new)
                    .insert(resource.key.clone(), resource);
                Ok(())
            }
            Event::InitDone => {
                self.ingresses = self.ingress_relist.take().unwrap_or_default();
                self.ingresses_synced = true;
                info!(ingresses = self.ingresses.len(), "Ingress relist complete");
                self.request_resync()
            }
        }
    }

    pub fn handle_slice_event(&mut self, event: Event<EndpointSlice>) -> Result<(), ForwardError> {
        match event {
            Event::Apply(slice) => self.slice_changed(slice, false),
            Event::Delete(slice) => self.slice_changed(slice, true),
            Event::Init => {
                debug!("EndpointSlice relist started");
                self.slice_relist = Some(BTreeMap::new());
                Ok(())
            }
            Event::InitApply(slice) => {
                if let Some(service) = service_key(&slice) {
                    self.slice_relist
                        .get_or_insert_with(BTreeMap::new)
                        .entry(service)
                        .or_default()
                        .insert(slice.name_any(), slice);
                }
                Ok(())
            }
            Event::InitDone => {
                self.slices = self.slice_relist.take().unwrap_or_default();
                info!(services = self.slices.len(), "EndpointSlice relist complete");
                // Before the first Ingress listing there is nothing to refresh
                if self.ingresses_synced {
                    self.request_resync()
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Wait for queue capacity and send the owed resync
    pub async fn flush_resync(&mut self) -> Result<(), ForwardError> {
        let permit = self.tx.reserve().await.map_err(|_| ForwardError::Closed)?;
        permit.send(WatchEvent::Resync(self.listing()));
        self.needs_resync = false;
        info!(ingresses = self.ingresses.len(), "Sent full resync");
        Ok(())
    }

    fn ingress_applied(&mut self, ingress: &Ingress) -> Result<(), ForwardError> {
        let resource = RoutingResource::from_ingress(ingress);
        let kind = if self.ingresses.contains_key(&resource.key) {
            EventKind::Update
        } else {
            EventKind::Create
        };
        self.ingresses.insert(resource.key.clone(), resource.clone());
        let dependents = self.dependents_of(&resource);
        self.forward(ResourceEvent::new(kind, resource, dependents))
    }

    fn ingress_deleted(&mut self, ingress: &Ingress) -> Result<(), ForwardError> {
        let resource = RoutingResource::from_ingress(ingress);
        self.ingresses.remove(&resource.key);
        self.forward(ResourceEvent::new(EventKind::Delete, resource, Vec::new()))
    }

    /// Re-send every cached Ingress backed by the slice's Service
    fn slice_changed(&mut self, slice: EndpointSlice, deleted: bool) -> Result<(), ForwardError> {
        let Some(service) = service_key(&slice) else {
            return Ok(());
        };
        let name = slice.name_any();
        if deleted {
            if let Some(slices) = self.slices.get_mut(&service) {
                slices.remove(&name);
                if slices.is_empty() {
                    self.slices.remove(&service);
                }
            }
        } else {
            self.slices.entry(service.clone()).or_default().insert(name, slice);
        }

        let affected: Vec<RoutingResource> = self
            .ingresses
            .values()
            .filter(|r| {
                r.key.namespace == service.0 && r.backends().iter().any(|b| b.service == service.1)
            })
            .cloned()
            .collect();
        debug!(
            namespace = %service.0,
            service = %service.1,
            affected = affected.len(),
            "Endpoints changed"
        );

        for resource in affected {
            let dependents = self.dependents_of(&resource);
            self.forward(ResourceEvent::new(EventKind::Update, resource, dependents))?;
        }
        Ok(())
    }

    fn dependents_of(&self, resource: &RoutingResource) -> Vec<BackendEndpoints> {
        resource
            .backends()
            .into_iter()
            .map(|backend| {
                let key = (resource.key.namespace.clone(), backend.service.clone());
                let slices = self.slices.get(&key).into_iter().flat_map(|s| s.values());
                BackendEndpoints::resolve(backend, slices)
            })
            .collect()
    }

    fn listing(&self) -> Vec<ResourceEvent> {
        self.ingresses
            .values()
            .map(|resource| {
                ResourceEvent::new(
                    EventKind::Update,
                    resource.clone(),
                    self.dependents_of(resource),
                )
            })
            .collect()
    }

    fn forward(&mut self, event: ResourceEvent) -> Result<(), ForwardError> {
        // The cache already holds this change; the owed resync carries it
        if self.needs_resync {
            return self.try_flush_resync();
        }

        match self.tx.try_send(WatchEvent::Resource(event)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => {
                self.needs_resync = true;
                if let WatchEvent::Resource(event) = dropped {
                    self.faults.report(Fault::QueueOverflow {
                        dropped: event.resource.key,
                    });
                }
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(ForwardError::Closed),
        }
    }

    fn request_resync(&mut self) -> Result<(), ForwardError> {
        self.needs_resync = true;
        self.try_flush_resync()
    }

    fn try_flush_resync(&mut self) -> Result<(), ForwardError> {
        match self.tx.try_reserve() {
            Ok(permit) => {
                permit.send(WatchEvent::Resync(self.listing()));
                self.needs_resync = false;
                debug!(ingresses = self.ingresses.len(), "Sent full resync");
                Ok(())
            }
            Err(TrySendError::Full(())) => Ok(()),
            Err(TrySendError::Closed(())) => Err(ForwardError::Closed),
        }
    }
}

fn service_key(slice: &EndpointSlice) -> Option<ServiceKey> {
    let service = slice.labels().get(SERVICE_NAME_LABEL)?.clone();
    let namespace = slice
        .namespace()
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    Some((namespace, service))
}

/// Watch Ingresses and EndpointSlices until shutdown
///
/// Watch errors are retried with the kube default backoff. Returns an error
/// only when the reconciler queue closes or a stream ends.
pub async fn run_watcher(
    client: Client,
    namespace: Option<String>,
    mut forwarder: EventForwarder,
    mut shutdown: ShutdownSignal,
) -> Result<(), WatchError> {
    let (ingress_api, slice_api): (Api<Ingress>, Api<EndpointSlice>) = match &namespace {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
        None => (Api::all(client.clone()), Api::all(client)),
    };

    let ingresses = watcher(ingress_api, watcher::Config::default()).default_backoff();
    let slices = watcher(
        slice_api,
        watcher::Config::default().labels(SERVICE_NAME_LABEL),
    )
    .default_backoff();
    let mut ingresses = std::pin::pin!(ingresses);
    let mut slices = std::pin::pin!(slices);

    info!(
        namespace = namespace.as_deref().unwrap_or("<all>"),
        "Starting resource watcher"
    );

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                info!("Shutdown requested, stopping watcher");
                return Ok(());
            }
            result = forwarder.flush_resync(), if forwarder.needs_resync() => result?,
            event = ingresses.next() => match event {
                Some(Ok(event)) => forwarder.handle_ingress_event(event)?,
                Some(Err(e)) => warn!(error = %e, "Ingress watch error, will retry"),
                None => return Err(WatchError::StreamEnded { resource: "Ingress" }),
            },
            event = slices.next() => match event {
                Some(Ok(event)) => forwarder.handle_slice_event(event)?,
                Some(Err(e)) => warn!(error = %e, "EndpointSlice watch error, will retry"),
                None => return Err(WatchError::StreamEnded { resource: "EndpointSlice" }),
            },
        }
    }
}

#[cfg(test)]
#[path = "watcher_test.rs"]
mod tests;
