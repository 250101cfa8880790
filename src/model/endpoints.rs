//! Backend endpoints resolved from EndpointSlices

use crate::model::routing::{BackendRef, ServicePort};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Label linking an EndpointSlice to its Service
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.contains(':') {
            write!(f, "[{}]:{}", self.ip, self.port)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

/// Ready endpoints of one backend
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendEndpoints {
    pub backend: BackendRef,
    pub endpoints: Vec<Endpoint>,
}

impl BackendEndpoints {
    pub fn new(backend: BackendRef, mut endpoints: Vec<Endpoint>) -> Self {
        endpoints.sort();
        endpoints.dedup();
        Self { backend, endpoints }
    }

    /// Resolve the ready endpoints of `backend` from the Service's slices
    ///
    /// Named ports match the slice port of the same name. Numbered ports
    /// match a slice port with the same number, or the slice's only port.
    pub fn resolve<'a>(
        backend: &BackendRef,
        slices: impl IntoIterator<Item = &'a EndpointSlice>,
    ) -> Self {
        let mut endpoints = Vec::new();

        for slice in slices {
            let Some(port) = slice_port(slice, backend.port.as_ref()) else {
                continue;
            };
            for endpoint in &slice.endpoints {
                let ready = endpoint
                    .conditions
                    .as_ref()
                    .and_then(|c| c.ready)
                    .unwrap_or(true);
                if !ready {
                    continue;
                }
                endpoints.extend(endpoint.addresses.iter().map(|ip| Endpoint {
                    ip: ip.clone(),
                    port,
                }));
            }
        }

        Self::new(backend.clone(), endpoints)
    }
}

fn slice_port(slice: &EndpointSlice, wanted: Option<&ServicePort>) -> Option<u16> {
    let ports = slice.ports.as_deref().unwrap_or_default();
    let found = match wanted? {
        ServicePort::Name(name) => ports
            .iter()
            .find(|p| p.name.as_deref() == Some(name.as_str())),
        ServicePort::Number(number) => ports
            .iter()
            .find(|p| p.port == Some(*number))
            .or_else(|| if ports.len() == 1 { ports.first() } else { None }),
    }?;
    u16::try_from(found.port?).ok()
}
