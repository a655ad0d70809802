//! Resolve context seam: everything the resolver needs from its caller.
//!
//! The context supplies the resource sets, candidate lookup, the opaque match
//! predicate, pre-existing wirings and the cancellation hook. The core only
//! ever adds to what the context reports; it never mutates the context's
//! state.

use crate::resource::{Candidate, CapabilityId, RequirementId, ResourceId, Wire};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-shot cancellation flag handed to the context before any other context
/// call. Flipping it aborts the owning resolve call at its next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Read-only snapshot of a resource's already-accepted wiring.
///
/// `capabilities` is the effective provided list and may contain hosted
/// candidates contributed by attached fragments; `wires` are the resource's
/// required wires. The core never alters entries already present here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Wiring {
    pub resource: ResourceId,
    pub capabilities: Vec<Candidate>,
    pub wires: Vec<Wire>,
}

impl Wiring {
    pub fn new(resource: ResourceId) -> Self {
        Wiring {
            resource,
            capabilities: Vec::new(),
            wires: Vec::new(),
        }
    }

    pub fn with_capability(mut self, candidate: Candidate) -> Self {
        self.capabilities.push(candidate);
        self
    }

    pub fn with_wire(mut self, wire: Wire) -> Self {
        self.wires.push(wire);
        self
    }

    /// Wires accepted for one specific requirement.
    pub fn wires_for(&self, requirement: RequirementId) -> impl Iterator<Item = &Wire> {
        self.wires.iter().filter(move |w| w.requirement == requirement)
    }
}

/// Existing wirings keyed by resource; a resource absent from the map is
/// unresolved.
pub type Wirings = HashMap<ResourceId, Wiring>;

/// The abstract environment a resolve call runs against.
///
/// Methods are invoked from arbitrary worker threads within one call and must
/// be idempotent and side-effect free, except `insert_hosted_capability` and
/// `on_cancel` which are called from the session thread only.
pub trait ResolveContext: Sync {
    /// Resources that must resolve or the whole call fails.
    fn mandatory_resources(&self) -> Vec<ResourceId>;

    /// Resources resolved best-effort; their failures are swallowed.
    fn optional_resources(&self) -> Vec<ResourceId> {
        Vec::new()
    }

    /// Additional resources that become interesting once `resource` resolves
    /// (e.g. fragments targeting it). Resolved best-effort.
    fn related_resources(&self, _resource: ResourceId) -> Vec<ResourceId> {
        Vec::new()
    }

    /// Candidate capabilities satisfying `requirement`, most preferred first.
    /// The ordering is the context's policy and the core preserves it.
    fn find_providers(&self, requirement: RequirementId) -> Vec<CapabilityId>;

    /// The opaque match predicate behind `find_providers`. The core consults
    /// it only where it must re-validate a candidate outside a provider
    /// lookup (the dynamic entry point).
    fn matches(&self, requirement: RequirementId, capability: CapabilityId) -> bool;

    /// Place a hosted capability into an existing candidate list, returning
    /// the insertion index. Called at most once per (list, hosted) pair; the
    /// default appends.
    fn insert_hosted_capability(
        &self,
        candidates: &mut Vec<Candidate>,
        hosted: Candidate,
    ) -> usize {
        candidates.push(hosted);
        candidates.len() - 1
    }

    /// Whether a requirement participates in this resolution at all.
    fn is_effective(&self, _requirement: RequirementId) -> bool {
        true
    }

    /// Snapshot of the already-accepted wirings. Taken once per session.
    fn wirings(&self) -> Wirings;

    /// Wires of `wiring`'s resource whose export was substituted by an
    /// import; those identities count as imported, not provided, during
    /// validation.
    fn substitution_wires(&self, _wiring: &Wiring) -> Vec<Wire> {
        Vec::new()
    }

    /// Receives the session's cancellation flag before any other context
    /// call. Called at most once per resolve call.
    fn on_cancel(&self, _flag: CancelFlag) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn wiring_filters_wires_by_requirement() {
        let wire_a = Wire {
            requirer: ResourceId(0),
            requirement: RequirementId(0),
            provider: ResourceId(1),
            capability: CapabilityId(0),
        };
        let wire_b = Wire {
            requirement: RequirementId(1),
            ..wire_a
        };
        let wiring = Wiring::new(ResourceId(0)).with_wire(wire_a).with_wire(wire_b);
        let for_first: Vec<_> = wiring.wires_for(RequirementId(0)).collect();
        assert_eq!(for_first, vec![&wire_a]);
    }
}
