//! Resource model for the admission engine
//!
//! - `routing` - Ingress-derived routing resources and their validation
//! - `endpoints` - Ready backend endpoints resolved from EndpointSlices

pub mod endpoints;
pub mod routing;

pub use endpoints::{BackendEndpoints, Endpoint};
pub use routing::{BackendRef, PathType, ResourceKey, RoutingResource, RoutingRule, RuleError, ServicePort};
