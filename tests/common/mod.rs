//! Test harness for class admission scenarios
//!
//! Wires the watch forwarder, the bounded queue and the reconciler to an
//! in-memory data plane. Routing outcome is judged the way the data plane
//! would: a request for `/` is matched to a server block by host, falling
//! back to the default server, and answered by that block's root location.

#![allow(dead_code)] // Helpers are shared across test binaries

use async_trait::async_trait;
use classgate::controller::{
    ApplyError, ConfigArtifact, ControllerIdentity, DataPlane, EventForwarder, Fault,
    FaultReporter, Reconciler, ReconcilerConfig, ReconcilerHandle,
};
use classgate::model::endpoints::SERVICE_NAME_LABEL;
use classgate::server::{shutdown_channel, ShutdownHandle};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointPort, EndpointSlice};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::ObjectMeta;
use kube::runtime::watcher::Event;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub type TestResult = Result<(), Box<dyn Error>>;

pub const NAMESPACE: &str = "e2e";
pub const BACKEND: &str = "echo";

/// How long a routing change may take to converge
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Data plane holding the live artifact in memory
#[derive(Default)]
pub struct MemoryDataPlane {
    live: Mutex<Option<ConfigArtifact>>,
    applies: Mutex<u32>,
}

impl MemoryDataPlane {
    pub fn live(&self) -> Option<ConfigArtifact> {
        self.live.lock().unwrap().clone()
    }

    pub fn applies(&self) -> u32 {
        *self.applies.lock().unwrap()
    }

    /// HTTP status a request for `/` on `host` would get
    pub fn route(&self, host: &str) -> u16 {
        match self.live() {
            Some(artifact) => route_root(artifact.content(), host),
            None => 404,
        }
    }
}

/// Resolve `GET /` for `host` against rendered configuration
fn route_root(content: &str, host: &str) -> u16 {
    let blocks = server_blocks(content);
    let server = blocks
        .iter()
        .find(|block| server_name(block).is_some_and(|name| host_matches(name, host)))
        .or_else(|| blocks.iter().find(|block| block.iter().any(|l| l.contains("default_server"))));
    let Some(server) = server else {
        return 404;
    };

    // An exact match wins over the prefix location
    let body = location_body(server, "location = / {")
        .or_else(|| location_body(server, "location / {"));
    match body {
        Some(body) if body.iter().any(|l| l.starts_with("proxy_pass ")) => 200,
        Some(body) if body.iter().any(|l| *l == "return 503;") => 503,
        _ => 404,
    }
}

/// Top-level `server { ... }` blocks as trimmed lines
fn server_blocks(content: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    for line in content.lines() {
        if line == "server {" {
            current = Some(Vec::new());
        } else if line == "}" {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
        } else if let Some(block) = current.as_mut() {
            block.push(line.trim());
        }
    }
    blocks
}

fn server_name<'a>(block: &[&'a str]) -> Option<&'a str> {
    block
        .iter()
        .find_map(|l| l.strip_prefix("server_name ")?.strip_suffix(';'))
}

fn host_matches(name: &str, host: &str) -> bool {
    match name.strip_prefix("*.") {
        Some(suffix) => host
            .strip_suffix(suffix)
            .and_then(|label| label.strip_suffix('.'))
            .is_some_and(|label| !label.is_empty() && !label.contains('.')),
        None => name == host,
    }
}

fn location_body<'a>(block: &[&'a str], opener: &str) -> Option<Vec<&'a str>> {
    let start = block.iter().position(|l| *l == opener)?;
    Some(
        block[start + 1..]
            .iter()
            .take_while(|l| **l != "}")
            .copied()
            .collect(),
    )
}

#[async_trait]
impl DataPlane for MemoryDataPlane {
    async fn apply(&self, artifact: &ConfigArtifact) -> Result<(), ApplyError> {
        *self.live.lock().unwrap() = Some(artifact.clone());
        *self.applies.lock().unwrap() += 1;
        Ok(())
    }
}

pub struct TestController {
    pub plane: Arc<MemoryDataPlane>,
    pub handle: ReconcilerHandle,
    pub faults: broadcast::Receiver<Fault>,
    forwarder: EventForwarder,
    shutdown: ShutdownHandle,
    task: JoinHandle<()>,
}

impl TestController {
    pub fn start(identity: ControllerIdentity) -> Self {
        Self::with_queue(identity, 64)
    }

    pub fn with_queue(identity: ControllerIdentity, capacity: usize) -> Self {
        let plane = Arc::new(MemoryDataPlane::default());
        let faults = FaultReporter::default();
        let fault_rx = faults.subscribe();

        let reconciler = Reconciler::new(identity, plane.clone(), ReconcilerConfig::default())
            .with_faults(faults.clone());
        let handle = reconciler.handle();

        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown, signal) = shutdown_channel();
        let task = tokio::spawn(reconciler.run(rx, signal));

        Self {
            plane,
            handle,
            faults: fault_rx,
            forwarder: EventForwarder::new(tx, faults),
            shutdown,
            task,
        }
    }

    /// Initial listing, as the watcher delivers it on startup
    pub fn list(&mut self, ingresses: Vec<Ingress>, slices: Vec<EndpointSlice>) {
        self.forwarder.handle_slice_event(Event::Init).unwrap();
        for slice in slices {
            self.forwarder
                .handle_slice_event(Event::InitApply(slice))
                .unwrap();
        }
        self.forwarder.handle_slice_event(Event::InitDone).unwrap();

        self.forwarder.handle_ingress_event(Event::Init).unwrap();
        for ingress in ingresses {
            self.forwarder
                .handle_ingress_event(Event::InitApply(ingress))
                .unwrap();
        }
        self.forwarder.handle_ingress_event(Event::InitDone).unwrap();
    }

    pub fn apply(&mut self, ingress: Ingress) {
        self.forwarder
            .handle_ingress_event(Event::Apply(ingress))
            .unwrap();
    }

    pub fn delete(&mut self, ingress: Ingress) {
        self.forwarder
            .handle_ingress_event(Event::Delete(ingress))
            .unwrap();
    }

    pub fn apply_slice(&mut self, slice: EndpointSlice) {
        self.forwarder
            .handle_slice_event(Event::Apply(slice))
            .unwrap();
    }

    /// Send any resync the forwarder still owes
    pub async fn flush(&mut self) {
        if self.forwarder.needs_resync() {
            self.forwarder.flush_resync().await.unwrap();
        }
    }

    /// Wait until a request for `host` gets `expected`
    pub async fn wait_for_route(&self, host: &str, expected: u16) -> TestResult {
        let mut applied = self.handle.watch_applied();
        let converged = tokio::time::timeout(
            CONVERGE_TIMEOUT,
            applied.wait_for(|_| self.plane.route(host) == expected),
        )
        .await;

        match converged {
            Ok(Ok(_)) => Ok(()),
            _ => Err(format!(
                "host {}: expected {}, got {}",
                host,
                expected,
                self.plane.route(host)
            )
            .into()),
        }
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        self.task.await.expect("reconciler task should not panic");
    }
}

/// Ingress routing `host` to the echo backend
///
/// `annotation` sets the legacy class annotation, `class_name` the
/// `spec.ingressClassName` field.
pub fn ingress(
    name: &str,
    host: &str,
    annotation: Option<&str>,
    class_name: Option<&str>,
    version: u64,
) -> Ingress {
    let mut value = serde_json::json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": name,
            "namespace": NAMESPACE,
            "resourceVersion": version.to_string(),
        },
        "spec": {
            "rules": [{
                "host": host,
                "http": {
                    "paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": {
                            "service": { "name": BACKEND, "port": { "number": 80 } }
                        }
                    }]
                }
            }]
        }
    });
    if let Some(class) = annotation {
        value["metadata"]["annotations"] =
            serde_json::json!({ "kubernetes.io/ingress.class": class });
    }
    if let Some(class) = class_name {
        value["spec"]["ingressClassName"] = serde_json::json!(class);
    }
    serde_json::from_value(value).expect("valid Ingress fixture")
}

/// Ready endpoints of the echo backend
pub fn echo_slice() -> EndpointSlice {
    echo_slice_with(&["10.244.0.7"])
}

/// Echo backend slice with the given ready addresses
pub fn echo_slice_with(addresses: &[&str]) -> EndpointSlice {
    EndpointSlice {
        address_type: "IPv4".to_string(),
        metadata: ObjectMeta {
            name: Some(format!("{}-abcde", BACKEND)),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some([(SERVICE_NAME_LABEL.to_string(), BACKEND.to_string())].into()),
            ..Default::default()
        },
        ports: Some(vec![EndpointPort {
            name: Some("http".to_string()),
            port: Some(8080),
            ..Default::default()
        }]),
        endpoints: addresses
            .iter()
            .map(|address| Endpoint {
                addresses: vec![address.to_string()],
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}
