//! Routing resources as seen by the admission engine
//!
//! A `RoutingResource` is the controller's view of a `networking.k8s.io/v1`
//! Ingress: its identity, the class marker used for ownership, and a flat
//! list of host/path rules pointing at service backends.

use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Annotation carrying the ingress class marker
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Namespace assumed when a resource carries none
pub const DEFAULT_NAMESPACE: &str = "default";

/// Identity of a routing resource (namespace/name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// How a rule's path is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathType {
    Exact,
    Prefix,
    ImplementationSpecific,
}

impl PathType {
    fn parse(value: &str) -> Self {
        match value {
            "Exact" => PathType::Exact,
            "Prefix" => PathType::Prefix,
            _ => PathType::ImplementationSpecific,
        }
    }
}

/// Service port referenced by a backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServicePort {
    Number(i32),
    Name(String),
}

impl fmt::Display for ServicePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServicePort::Number(n) => write!(f, "{}", n),
            ServicePort::Name(name) => f.write_str(name),
        }
    }
}

/// Service backend of a rule
///
/// `port` is `None` when the source object omitted it; validation rejects that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendRef {
    pub service: String,
    pub port: Option<ServicePort>,
}

impl BackendRef {
    pub fn new(service: impl Into<String>, port: ServicePort) -> Self {
        Self {
            service: service.into(),
            port: Some(port),
        }
    }
}

/// A single host/path → backend rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Empty host means "any host" (rendered into the default server)
    pub host: String,
    pub path: String,
    pub path_type: PathType,
    pub backend: BackendRef,
}

/// Reasons a rule set cannot be rendered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("invalid host {0:?}")]
    InvalidHost(String),

    #[error("invalid path {0:?}")]
    InvalidPath(String),

    #[error("backend for host {0:?} has no service name")]
    MissingService(String),

    #[error("backend service {0:?} has no port")]
    MissingPort(String),

    #[error("backend service {service:?} has invalid port {port}")]
    InvalidPort { service: String, port: String },
}

/// Controller view of an Ingress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingResource {
    pub key: ResourceKey,
    /// Class marker; `None` when absent or empty
    pub class: Option<String>,
    pub resource_version: Option<String>,
    pub rules: Vec<RoutingRule>,
}

impl RoutingResource {
    /// Build the routing view of an Ingress
    ///
    /// Conversion never fails: incomplete backends are carried through and
    /// rejected by [`RoutingResource::validate`] once ownership is known.
    pub fn from_ingress(ingress: &Ingress) -> Self {
        let namespace = ingress
            .namespace()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let key = ResourceKey::new(namespace, ingress.name_any());

        let annotated = ingress
            .annotations()
            .get(INGRESS_CLASS_ANNOTATION)
            .filter(|c| !c.is_empty())
            .cloned();
        let class = annotated.or_else(|| {
            ingress
                .spec
                .as_ref()
                .and_then(|s| s.ingress_class_name.clone())
                .filter(|c| !c.is_empty())
        });

        let mut rules = Vec::new();
        for rule in ingress
            .spec
            .as_ref()
            .and_then(|s| s.rules.as_ref())
            .into_iter()
            .flatten()
        {
            let host = rule.host.clone().unwrap_or_default();
            let Some(http) = rule.http.as_ref() else {
                continue;
            };
            for path in &http.paths {
                rules.push(RoutingRule {
                    host: host.clone(),
                    path: path.path.clone().unwrap_or_else(|| "/".to_string()),
                    path_type: PathType::parse(&path.path_type),
                    backend: backend_ref(&path.backend),
                });
            }
        }

        Self {
            key,
            class,
            resource_version: ingress.resource_version(),
            rules,
        }
    }

    /// Numeric resource version, if it parses
    pub fn version(&self) -> Option<u64> {
        self.resource_version.as_deref()?.parse().ok()
    }

    /// Check that every rule can be rendered
    pub fn validate(&self) -> Result<(), RuleError> {
        for rule in &self.rules {
            validate_host(&rule.host)?;
            validate_path(&rule.path)?;

            let backend = &rule.backend;
            if backend.service.is_empty() {
                return Err(RuleError::MissingService(rule.host.clone()));
            }
            match &backend.port {
                None => return Err(RuleError::MissingPort(backend.service.clone())),
                Some(ServicePort::Number(n)) if !(1..=65535).contains(n) => {
                    return Err(RuleError::InvalidPort {
                        service: backend.service.clone(),
                        port: n.to_string(),
                    })
                }
                Some(ServicePort::Name(name)) if name.is_empty() => {
                    return Err(RuleError::InvalidPort {
                        service: backend.service.clone(),
                        port: String::new(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Services referenced by this resource, deduplicated
    pub fn backends(&self) -> Vec<&BackendRef> {
        let mut backends: Vec<&BackendRef> = self.rules.iter().map(|r| &r.backend).collect();
        backends.sort();
        backends.dedup();
        backends
    }
}

fn backend_ref(backend: &IngressBackend) -> BackendRef {
    match &backend.service {
        Some(svc) => {
            let port = svc.port.as_ref().and_then(|p| match (&p.name, p.number) {
                (Some(name), _) if !name.is_empty() => Some(ServicePort::Name(name.clone())),
                (_, Some(number)) => Some(ServicePort::Number(number)),
                _ => None,
            });
            BackendRef {
                service: svc.name.clone(),
                port,
            }
        }
        // Resource backends are not routable by this controller
        None => BackendRef {
            service: String::new(),
            port: None,
        },
    }
}

fn validate_host(host: &str) -> Result<(), RuleError> {
    if host.is_empty() {
        return Ok(());
    }
    let name = host.strip_prefix("*.").unwrap_or(host);
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(RuleError::InvalidHost(host.to_string()))
    }
}

/// Characters that would end or comment out a `location` directive
const PATH_BREAKING_CHARS: &[char] = &['{', '}', ';', '#', '"', '\''];

fn validate_path(path: &str) -> Result<(), RuleError> {
    let valid = path.starts_with('/')
        && !path
            .chars()
            .any(|c| c.is_whitespace() || PATH_BREAKING_CHARS.contains(&c));
    if valid {
        Ok(())
    } else {
        Err(RuleError::InvalidPath(path.to_string()))
    }
}

#[cfg(test)]
#[path = "routing_test.rs"]
mod tests;
