//! Data-plane configuration rendering
//!
//! `synthesize` turns a snapshot into an nginx-style configuration. The
//! output depends only on snapshot content: upstreams, servers, locations
//! and endpoints are all emitted in sorted order, so equal snapshots always
//! render byte-identical artifacts.

use crate::controller::aggregator::Snapshot;
use crate::model::{BackendRef, Endpoint, PathType, ResourceKey};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::hash::{Hash, Hasher};

/// `server_name` of the catch-all server answering unmatched hosts
pub const DEFAULT_SERVER_NAME: &str = "_";

const LISTEN_PORT: u16 = 80;

/// Rendered configuration handed to the data plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    content: String,
    checksum: String,
    hosts: Vec<String>,
}

impl ConfigArtifact {
    fn new(content: String, hosts: Vec<String>) -> Self {
        let checksum = content_checksum(&content);
        Self {
            content,
            checksum,
            hosts,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.content.as_bytes()
    }

    /// 16-character hex digest of the content
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Hosts with a dedicated server block, sorted
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Whether a request for `host` reaches a dedicated server block
    ///
    /// Hosts without one fall through to the default server and get a 404.
    pub fn serves_host(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| match h.strip_prefix("*.") {
            Some(suffix) => host
                .strip_suffix(suffix)
                .and_then(|label| label.strip_suffix('.'))
                .is_some_and(|label| !label.is_empty() && !label.contains('.')),
            None => h == host,
        })
    }
}

/// Short hex digest, stable within a build
fn content_checksum(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

struct Location {
    upstream: String,
    owner: ResourceKey,
}

type Locations = BTreeMap<(String, PathType), Location>;

/// Render the configuration for `snapshot`
pub fn synthesize(snapshot: &Snapshot) -> ConfigArtifact {
    let mut upstreams: BTreeMap<String, Vec<Endpoint>> = BTreeMap::new();
    let mut default_locations = Locations::new();
    let mut servers: BTreeMap<String, Locations> = BTreeMap::new();

    // Snapshot iterates in key order, so the first claimant of a
    // host/path pair is the resource whose key sorts first.
    for (key, entry) in snapshot.iter() {
        for rule in &entry.rules {
            let upstream = upstream_name(&key.namespace, &rule.backend);
            let endpoints = upstreams.entry(upstream.clone()).or_default();
            if let Some(dependents) = entry.endpoints_for(&rule.backend) {
                endpoints.extend(dependents.endpoints.iter().cloned());
            }

            let locations = if rule.host.is_empty() {
                &mut default_locations
            } else {
                servers.entry(rule.host.clone()).or_default()
            };
            locations
                .entry((rule.path.clone(), rule.path_type))
                .or_insert_with(|| Location {
                    upstream,
                    owner: key.clone(),
                });
        }
    }

    for endpoints in upstreams.values_mut() {
        endpoints.sort();
        endpoints.dedup();
    }

    let mut out = Renderer::default();
    out.line(0, "# Generated by classgate from owned Ingress resources. Do not edit.");

    for (name, endpoints) in upstreams.iter().filter(|(_, e)| !e.is_empty()) {
        out.blank();
        out.line(0, format_args!("upstream {} {{", name));
        for endpoint in endpoints {
            out.line(1, format_args!("server {};", endpoint));
        }
        out.line(0, "}");
    }

    render_server(&mut out, DEFAULT_SERVER_NAME, true, &default_locations, &upstreams);
    for (host, locations) in &servers {
        render_server(&mut out, host, false, locations, &upstreams);
    }

    ConfigArtifact::new(out.finish(), servers.into_keys().collect())
}

/// `<ns>_<svc>_<port>`; `_` never appears in namespace, service or port names
fn upstream_name(namespace: &str, backend: &BackendRef) -> String {
    match &backend.port {
        Some(port) => format!("{}_{}_{}", namespace, backend.service, port),
        None => format!("{}_{}", namespace, backend.service),
    }
}

fn render_server(
    out: &mut Renderer,
    host: &str,
    default_server: bool,
    locations: &Locations,
    upstreams: &BTreeMap<String, Vec<Endpoint>>,
) {
    out.blank();
    out.line(0, "server {");
    if default_server {
        out.line(1, format_args!("listen {} default_server;", LISTEN_PORT));
    } else {
        out.line(1, format_args!("listen {};", LISTEN_PORT));
    }
    out.line(1, format_args!("server_name {};", host));

    for ((path, path_type), location) in locations {
        out.blank();
        out.line(1, format_args!("# {}", location.owner));
        match path_type {
            PathType::Exact => out.line(1, format_args!("location = {} {{", path)),
            PathType::Prefix | PathType::ImplementationSpecific => {
                out.line(1, format_args!("location {} {{", path))
            }
        }
        let has_endpoints = upstreams
            .get(&location.upstream)
            .is_some_and(|e| !e.is_empty());
        if has_endpoints {
            out.line(2, format_args!("proxy_pass http://{};", location.upstream));
        } else {
            out.line(2, "return 503;");
        }
        out.line(1, "}");
    }

    let covers_root = locations
        .keys()
        .any(|(path, path_type)| path == "/" && *path_type != PathType::Exact);
    if !covers_root {
        out.blank();
        out.line(1, "location / {");
        out.line(2, "return 404;");
        out.line(1, "}");
    }
    out.line(0, "}");
}

#[derive(Default)]
struct Renderer {
    buf: String,
}

impl Renderer {
    fn line(&mut self, indent: usize, text: impl Display) {
        for _ in 0..indent {
            self.buf.push_str("    ");
        }
        self.buf.push_str(&text.to_string());
        self.buf.push('\n');
    }

    fn blank(&mut self) {
        self.buf.push('\n');
    }

    fn finish(self) -> String {
        self.buf
    }
}

#[cfg(test)]
#[path = "synth_test.rs"]
mod tests;
