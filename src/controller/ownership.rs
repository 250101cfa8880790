//! Ingress class ownership
//!
//! Decides whether this controller instance is responsible for a routing
//! resource, based on the resource's class marker and the class the
//! controller was started with.

use crate::model::RoutingResource;

/// Class configuration of this controller instance
///
/// Fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControllerIdentity {
    class: Option<String>,
    watch_without_class: bool,
}

impl ControllerIdentity {
    /// Build an identity from the configured class
    ///
    /// An empty class selects default mode, where only resources without a
    /// class marker are owned.
    pub fn new(class: impl Into<String>, watch_without_class: bool) -> Self {
        let class = class.into();
        Self {
            class: (!class.is_empty()).then_some(class),
            watch_without_class,
        }
    }

    /// Default mode: owns only resources without a class marker
    pub fn default_mode() -> Self {
        Self::default()
    }

    /// Explicit mode: owns resources whose marker equals `class`
    pub fn explicit(class: impl Into<String>) -> Self {
        Self::new(class, false)
    }

    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    /// Whether resources without a marker are owned
    pub fn owns_unclassed(&self) -> bool {
        self.class.is_none() || self.watch_without_class
    }

    /// Ownership decision for a raw class marker
    pub fn matches(&self, marker: Option<&str>) -> bool {
        match (self.class(), marker.filter(|m| !m.is_empty())) {
            (_, None) => self.owns_unclassed(),
            (None, Some(_)) => false,
            (Some(class), Some(marker)) => class == marker,
        }
    }
}

/// Whether `resource` is owned by the controller with `identity`
pub fn is_owned(resource: &RoutingResource, identity: &ControllerIdentity) -> bool {
    identity.matches(resource.class.as_deref())
}

#[cfg(test)]
#[path = "ownership_test.rs"]
mod tests;
