//! Generic capability resolver.
//!
//! Resources declare capabilities and requirements; a [`ResolveContext`]
//! supplies candidate providers and pre-existing wirings. [`Resolver`] finds
//! a consistent assignment of one provider per requirement, backtracking over
//! `uses`-constraint conflicts, and returns the delta wirings for everything
//! the call newly resolved. Mandatory resources fail the call; optional ones
//! fail soft. [`Resolver::resolve_dynamic`] extends one already-wired
//! resource by a single dynamic requirement.
//!
//! The resolver owns no state between calls; all per-call state lives in an
//! internal session, and a call can be aborted through the [`CancelFlag`]
//! handed to the context.

mod candidates;
pub mod context;
pub mod error;
pub mod namespace;
pub mod resource;
mod session;
mod uses;
mod wires;

pub use context::{CancelFlag, ResolveContext, Wiring, Wirings};
pub use error::ResolutionError;
pub use namespace::{ConflictStrategy, Namespace};
pub use resource::{
    AttrValue, Candidate, Capability, CapabilityId, Cardinality, Catalog, Requirement,
    RequirementId, Resolution, Resource, ResourceId, Wire,
};

use session::Session;

/// Tuning knobs for a [`Resolver`].
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    max_branches: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            max_branches: 10_000,
        }
    }
}

impl ResolverConfig {
    /// Cap on the number of candidate branches one call may evaluate before
    /// giving up with the first conflict it saw.
    pub fn with_max_branches(mut self, max_branches: usize) -> Self {
        self.max_branches = max_branches;
        self
    }
}

/// Stateless resolver front end. Cheap to construct and safe to share; every
/// call builds its own session.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    config: ResolverConfig,
}

impl Resolver {
    pub fn new() -> Self {
        Resolver::default()
    }

    pub fn with_config(config: ResolverConfig) -> Self {
        Resolver { config }
    }

    /// Resolve the context's mandatory and optional resources, returning the
    /// wirings for every resource this call newly resolved.
    pub fn resolve(
        &self,
        catalog: &Catalog,
        context: &dyn ResolveContext,
    ) -> Result<Wirings, ResolutionError> {
        Session::new(catalog, context, self.config.max_branches).resolve()
    }

    /// Satisfy one dynamic requirement of an already-wired resource. The
    /// returned wirings hold the host's single new wire plus full wirings for
    /// any provider resolved along the way.
    pub fn resolve_dynamic(
        &self,
        catalog: &Catalog,
        context: &dyn ResolveContext,
        host: ResourceId,
        requirement: RequirementId,
    ) -> Result<Wirings, ResolutionError> {
        Session::new(catalog, context, self.config.max_branches).resolve_dynamic(host, requirement)
    }
}
