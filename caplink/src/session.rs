//! One resolve call: population, the backtracking search over candidate
//! branches, and the best-effort retry loop.
//!
//! The search keeps three queues of pending branches, drained in priority
//! order: uses-conflict branches first, then import permutations, then
//! substitution permutations. A branch is identified by its exclusion delta;
//! a delta seen once is never evaluated again.

use crate::candidates::{CandidateIndex, DeltaKey, Env, Populator};
use crate::context::{CancelFlag, ResolveContext, Wirings};
use crate::error::ResolutionError;
use crate::resource::{Candidate, Catalog, RequirementId, ResourceId};
use crate::uses::Validator;
use crate::wires::{delta_wirings, dynamic_wirings};
use dashmap::DashMap;
use itertools::Itertools;
use log::debug;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PermutationKind {
    Uses,
    Import,
    Substitute,
}

/// Pending backtrack branches, plus the requirements already permutated so
/// one decision point is not queued twice.
pub(crate) struct Permutations {
    uses: VecDeque<CandidateIndex>,
    import: VecDeque<CandidateIndex>,
    substitute: VecDeque<CandidateIndex>,
    permutated: HashSet<RequirementId>,
}

impl Permutations {
    pub fn new() -> Self {
        Permutations {
            uses: VecDeque::new(),
            import: VecDeque::new(),
            substitute: VecDeque::new(),
            permutated: HashSet::new(),
        }
    }

    pub fn push(&mut self, kind: PermutationKind, branch: CandidateIndex) {
        match kind {
            PermutationKind::Uses => self.uses.push_back(branch),
            PermutationKind::Import => self.import.push_back(branch),
            PermutationKind::Substitute => self.substitute.push_back(branch),
        }
    }

    pub fn pop(&mut self) -> Option<CandidateIndex> {
        self.uses
            .pop_front()
            .or_else(|| self.import.pop_front())
            .or_else(|| self.substitute.pop_front())
    }

    /// Queue a branch that drops the preferred candidate of `req`, unless
    /// that requirement was already permutated or has nothing to fall back
    /// to.
    pub fn permutate_if_needed(
        &mut self,
        catalog: &Catalog,
        index: &CandidateIndex,
        kind: PermutationKind,
        req: RequirementId,
    ) {
        if self.permutated.contains(&req) {
            return;
        }
        if let Some(branch) = index.branch_without_first(catalog, req) {
            self.permutated.insert(req);
            self.push(kind, branch);
        }
    }
}

pub(crate) struct Session<'a> {
    catalog: &'a Catalog,
    context: &'a dyn ResolveContext,
    wirings: Wirings,
    cancel: CancelFlag,
    uses_cache: DashMap<String, Arc<Vec<String>>>,
    max_branches: usize,
}

impl<'a> Session<'a> {
    pub fn new(catalog: &'a Catalog, context: &'a dyn ResolveContext, max_branches: usize) -> Self {
        let cancel = CancelFlag::new();
        context.on_cancel(cancel.clone());
        let wirings = context.wirings();
        Session {
            catalog,
            context,
            wirings,
            cancel,
            uses_cache: DashMap::new(),
            max_branches,
        }
    }

    fn env(&self) -> Env<'_> {
        Env {
            catalog: self.catalog,
            context: self.context,
            wirings: &self.wirings,
            cancel: self.cancel.clone(),
        }
    }

    /// Resources from the context's root sets that actually need resolving.
    /// Already-wired resources are done, except fragments, which may still
    /// attach to new hosts.
    fn pending_roots(&self, roots: Vec<ResourceId>) -> Vec<ResourceId> {
        roots
            .into_iter()
            .filter(|r| !self.wirings.contains_key(r) || self.catalog.is_fragment(*r))
            .collect()
    }

    pub fn resolve(&self) -> Result<Wirings, ResolutionError> {
        let mandatory_roots = self.pending_roots(self.context.mandatory_resources());
        let mut optional_roots = self.pending_roots(self.context.optional_resources());
        let mandatory_set: HashSet<ResourceId> = mandatory_roots.iter().copied().collect();
        let mut invalidated: HashSet<ResourceId> = HashSet::new();

        loop {
            let env = self.env();
            env.check_cancel()?;

            let mut populator = Populator::new(&env, mandatory_set.clone(), &invalidated);
            let mut to_populate = mandatory_roots.clone();
            to_populate.extend(optional_roots.iter().copied());
            populator.populate(to_populate)?;
            let related = populator.discovered_related();
            let base = populator.freeze();

            for root in &mandatory_roots {
                if !base.is_populated(*root) {
                    return Err(ResolutionError::Unsatisfiable {
                        resource: self.catalog.label(*root).to_string(),
                        requirements: base.failure(*root).into_iter().collect(),
                    });
                }
            }
            let mut roots: Vec<ResourceId> = mandatory_roots
                .iter()
                .copied()
                .chain(
                    optional_roots
                        .iter()
                        .copied()
                        .filter(|r| base.is_populated(*r)),
                )
                .collect();
            for resource in related {
                if base.is_populated(resource) && !roots.contains(&resource) {
                    roots.push(resource);
                }
            }

            match self.search(&env, base, &roots, None) {
                Ok(branch) => return Ok(delta_wirings(&env, &branch, &roots)),
                Err(error) => {
                    if error.is_cancelled() {
                        return Err(error);
                    }
                    // If everything implicated in the failure is best-effort,
                    // drop it and try again without it.
                    let failing: HashSet<ResourceId> = error
                        .unresolved_requirements()
                        .iter()
                        .map(|req| self.catalog.requirement(*req).owner())
                        .collect();
                    let removable = !failing.is_empty()
                        && failing.iter().all(|r| !mandatory_set.contains(r));
                    // No progress since the last retry means the same failure
                    // would recur forever.
                    if !removable || failing.iter().all(|r| invalidated.contains(r)) {
                        return Err(error);
                    }
                    debug!(
                        "retrying without {} best-effort resource(s)",
                        failing.len()
                    );
                    optional_roots.retain(|r| !failing.contains(r));
                    invalidated.extend(failing);
                }
            }
        }
    }

    /// Incrementally extend the wiring of an already-resolved `host` by
    /// satisfying one of its dynamic requirements.
    pub fn resolve_dynamic(
        &self,
        host: ResourceId,
        requirement: RequirementId,
    ) -> Result<Wirings, ResolutionError> {
        let failed = || ResolutionError::DynamicFailed {
            requirements: vec![requirement],
        };
        let req = self.catalog.requirement(requirement);
        let Some(host_wiring) = self.wirings.get(&host) else {
            return Err(failed());
        };
        if req.owner() != host
            || !req.is_dynamic()
            || host_wiring.wires_for(requirement).next().is_some()
        {
            return Err(failed());
        }

        // Identities the host already observes in this namespace cannot be
        // bound again.
        let namespace = req.namespace();
        let taken: HashSet<String> = host_wiring
            .capabilities
            .iter()
            .map(|c| c.capability)
            .chain(host_wiring.wires.iter().map(|w| w.capability))
            .filter(|cap| self.catalog.capability(*cap).namespace() == namespace)
            .filter_map(|cap| self.catalog.identity_of(cap))
            .collect();
        let candidates: Vec<Candidate> = self
            .context
            .find_providers(requirement)
            .into_iter()
            .filter(|cap| {
                self.catalog
                    .identity_of(*cap)
                    .map(|identity| !taken.contains(&identity))
                    .unwrap_or(true)
            })
            .map(|cap| self.catalog.declared(cap))
            .collect();
        if candidates.is_empty() {
            return Err(failed());
        }

        let env = self.env();
        let invalidated = HashSet::new();
        let mut populator = Populator::new(&env, HashSet::from([host]), &invalidated);
        let surviving = populator.populate_dynamic(host, requirement, candidates)?;
        if surviving.is_empty() {
            return Err(failed());
        }
        let base = populator.freeze();

        // Validation roots: the host for its existing context, plus every
        // provider the new requirement might bind to.
        let roots: Vec<ResourceId> = std::iter::once(host)
            .chain(surviving.iter().map(|c| c.provider))
            .unique()
            .collect();
        let branch = self.search(&env, base, &roots, Some((host, requirement)))?;
        let wirings = dynamic_wirings(&env, &branch, host, requirement);
        if wirings
            .get(&host)
            .map(|w| w.wires.is_empty())
            .unwrap_or(true)
        {
            return Err(failed());
        }
        Ok(wirings)
    }

    /// Drain branches until one validates. Keeps the first conflict error as
    /// the reported failure when every branch is exhausted.
    fn search(
        &self,
        env: &Env<'_>,
        base: CandidateIndex,
        roots: &[ResourceId],
        dynamic: Option<(ResourceId, RequirementId)>,
    ) -> Result<CandidateIndex, ResolutionError> {
        let mut permutations = Permutations::new();
        permutations.push(PermutationKind::Uses, base);
        let mut processed: HashSet<DeltaKey> = HashSet::new();
        let mut first_error: Option<ResolutionError> = None;
        let mut attempts = 0usize;

        while let Some(mut branch) = permutations.pop() {
            env.check_cancel()?;
            if !processed.insert(branch.delta_key()) {
                continue;
            }
            attempts += 1;
            if attempts > self.max_branches {
                debug!("branch budget exhausted after {} attempts", attempts - 1);
                break;
            }
            match branch.apply_substitutions(self.catalog) {
                Ok(substituted) => {
                    for req in substituted {
                        permutations.permutate_if_needed(
                            self.catalog,
                            &branch,
                            PermutationKind::Substitute,
                            req,
                        );
                    }
                }
                Err(error) => {
                    first_error.get_or_insert(error);
                    continue;
                }
            }
            let mut validator = Validator::new(env, &self.uses_cache);
            if let Some((host, requirement)) = dynamic {
                validator = validator.with_dynamic(host, requirement);
            }
            match validator.check(&branch, roots, &mut permutations) {
                Ok(()) => {
                    debug!("consistent branch found after {} attempt(s)", attempts);
                    return Ok(branch);
                }
                Err(error) => {
                    if error.is_cancelled() {
                        return Err(error);
                    }
                    first_error.get_or_insert(error);
                }
            }
        }
        Err(first_error.unwrap_or_else(|| ResolutionError::Unsatisfiable {
            resource: roots
                .first()
                .map(|r| self.catalog.label(*r).to_string())
                .unwrap_or_default(),
            requirements: Vec::new(),
        }))
    }
}
