//! Uses-constraint validation.
//!
//! Once a branch has one preferred candidate per requirement, every resource
//! gets a capability space: what it provides, what it pulls in directly, what
//! it aggregates transitively, and what reaches it through `uses` closures.
//! A branch is consistent when, for every identity a resource can observe
//! through two different paths, the two paths agree on a common source set.
//! On disagreement the validator reports the conflict and queues backtrack
//! branches that drop one side of it.

use crate::candidates::{CandidateIndex, Env};
use crate::error::ResolutionError;
use crate::namespace::{ConflictStrategy, Namespace};
use crate::resource::{Candidate, CapabilityId, RequirementId, ResourceId};
use crate::session::{PermutationKind, Permutations};
use dashmap::DashMap;
use indexmap::IndexMap;
use log::debug;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// A candidate plus the requirement chain through which it was reached from
/// the resource whose space it appears in.
#[derive(Debug, Clone)]
pub(crate) struct Blame {
    pub candidate: Candidate,
    pub chain: Vec<RequirementId>,
}

/// Capability space of one resource under the current branch.
#[derive(Debug, Default)]
struct Space {
    /// Identity -> exclusive capability this resource itself provides, after
    /// substitution by a same-identity import.
    provided: IndexMap<String, Candidate>,
    /// Identity -> direct imports (exclusive namespaces).
    imported: IndexMap<String, Vec<Blame>>,
    /// Identity -> capabilities aggregated transitively through re-exporting
    /// aggregate requirements.
    aggregated: IndexMap<String, Vec<Blame>>,
    /// Identity -> capability -> blame chains that constrain this resource to
    /// that capability via `uses` closures.
    used: IndexMap<String, IndexMap<Candidate, Vec<Blame>>>,
}

impl Space {
    /// The blames this resource itself holds for an identity, by precedence:
    /// an import wins over own provision, which wins over aggregation.
    fn own_blames(&self, identity: &str) -> Option<Vec<Blame>> {
        if let Some(blames) = self.imported.get(identity) {
            return Some(blames.clone());
        }
        if let Some(candidate) = self.provided.get(identity) {
            return Some(vec![Blame {
                candidate: *candidate,
                chain: Vec::new(),
            }]);
        }
        self.aggregated.get(identity).cloned()
    }

    /// Candidates this resource can hand out as sources of an identity.
    fn source_candidates(&self, identity: &str) -> Vec<Candidate> {
        let mut out = Vec::new();
        if let Some(candidate) = self.provided.get(identity) {
            out.push(*candidate);
        }
        if let Some(blames) = self.imported.get(identity) {
            out.extend(blames.iter().map(|b| b.candidate));
        }
        if let Some(blames) = self.aggregated.get(identity) {
            out.extend(blames.iter().map(|b| b.candidate));
        }
        out
    }
}

/// Effective selection of the branch: preferred candidate per single
/// requirement, all candidates for multiple cardinality, recorded wires for
/// already-wired resources.
struct Selection {
    chosen: HashMap<RequirementId, Vec<Candidate>>,
    /// Host -> capabilities projected onto it by attached fragments.
    hosted: HashMap<ResourceId, Vec<CapabilityId>>,
    /// Every resource participating in the branch, in discovery order.
    resources: Vec<ResourceId>,
}

pub(crate) struct Validator<'a, 'b> {
    env: &'b Env<'a>,
    uses_cache: &'b DashMap<String, Arc<Vec<String>>>,
    /// Host and requirement of a dynamic resolve. The host is wired, but its
    /// space must still be re-checked with the dynamic candidate added.
    dynamic: Option<(ResourceId, RequirementId)>,
}

impl<'a, 'b> Validator<'a, 'b> {
    pub fn new(env: &'b Env<'a>, uses_cache: &'b DashMap<String, Arc<Vec<String>>>) -> Self {
        Validator {
            env,
            uses_cache,
            dynamic: None,
        }
    }

    pub fn with_dynamic(mut self, host: ResourceId, requirement: RequirementId) -> Self {
        self.dynamic = Some((host, requirement));
        self
    }

    /// Validate the branch rooted at `roots`. On conflict, queues backtrack
    /// branches into `permutations` and returns the conflict error.
    pub fn check(
        &self,
        index: &CandidateIndex,
        roots: &[ResourceId],
        permutations: &mut Permutations,
    ) -> Result<(), ResolutionError> {
        let selection = self.collect_selection(index, roots)?;
        let spaces = self.compute_spaces(&selection)?;
        let mut checked: HashSet<ResourceId> = HashSet::new();
        for root in roots {
            self.check_space(index, &selection, &spaces, *root, &mut checked, permutations)?;
        }
        Ok(())
    }

    fn uses_of(&self, capability: CapabilityId) -> Option<Arc<Vec<String>>> {
        let directive = self.env.catalog.capability(capability).uses_directive()?;
        if let Some(parsed) = self.uses_cache.get(directive) {
            return Some(Arc::clone(parsed.value()));
        }
        let parsed: Arc<Vec<String>> = Arc::new(
            directive
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        );
        self.uses_cache
            .insert(directive.to_string(), Arc::clone(&parsed));
        Some(parsed)
    }

    /// Walk the branch from the roots, recording the chosen candidates per
    /// requirement and the fragment capabilities hosted on each host.
    fn collect_selection(
        &self,
        index: &CandidateIndex,
        roots: &[ResourceId],
    ) -> Result<Selection, ResolutionError> {
        let catalog = self.env.catalog;
        let mut selection = Selection {
            chosen: HashMap::new(),
            hosted: HashMap::new(),
            resources: Vec::new(),
        };
        let mut seen: HashSet<ResourceId> = HashSet::new();
        let mut work: Vec<ResourceId> = roots.to_vec();
        while let Some(resource) = work.pop() {
            self.env.check_cancel()?;
            if !seen.insert(resource) {
                continue;
            }
            selection.resources.push(resource);
            let is_fragment = catalog.is_fragment(resource);
            if let Some(wiring) = self.env.wirings.get(&resource) {
                for wire in &wiring.wires {
                    let candidate = Candidate {
                        capability: wire.capability,
                        provider: wire.provider,
                    };
                    selection
                        .chosen
                        .entry(wire.requirement)
                        .or_default()
                        .push(candidate);
                    work.push(wire.provider);
                }
                for hosted in wiring.capabilities.iter().filter(|c| c.is_hosted(catalog)) {
                    selection
                        .hosted
                        .entry(resource)
                        .or_default()
                        .push(hosted.capability);
                }
                // A dynamic host's tentative new import joins its recorded
                // wires so the host's space sees both.
                if let Some((host, requirement)) = self.dynamic {
                    if host == resource {
                        if let Some(candidates) = index.candidates(requirement) {
                            let chosen: Vec<Candidate> =
                                candidates.first().copied().into_iter().collect();
                            for candidate in &chosen {
                                work.push(candidate.provider);
                                if candidate.is_hosted(catalog) {
                                    work.push(catalog.capability(candidate.capability).owner());
                                }
                            }
                            selection.chosen.insert(requirement, chosen);
                        }
                    }
                }
                continue;
            }
            for req_id in catalog.resource(resource).requirements() {
                let Some(candidates) = index.candidates(*req_id) else {
                    continue;
                };
                let requirement = catalog.requirement(*req_id);
                let chosen: Vec<Candidate> = if requirement.is_multiple() {
                    candidates.to_vec()
                } else {
                    candidates.first().copied().into_iter().collect()
                };
                for candidate in &chosen {
                    work.push(candidate.provider);
                    if candidate.is_hosted(catalog) {
                        // Capability of an attached fragment observed on its
                        // host; the fragment body still resolves too.
                        work.push(catalog.capability(candidate.capability).owner());
                    }
                    if is_fragment && requirement.namespace() == Namespace::Host {
                        let host = candidate.provider;
                        for cap_id in catalog.resource(resource).capabilities() {
                            if catalog.capability(*cap_id).namespace().is_payload() {
                                selection.hosted.entry(host).or_default().push(*cap_id);
                            }
                        }
                    }
                }
                selection.chosen.insert(*req_id, chosen);
            }
        }
        Ok(selection)
    }

    /// Identity-bearing exclusive capabilities a resource offers in this
    /// branch, own and hosted.
    fn exclusive_capabilities(
        &self,
        selection: &Selection,
        resource: ResourceId,
    ) -> Vec<(String, Candidate)> {
        let catalog = self.env.catalog;
        let mut out = Vec::new();
        for cap_id in catalog.resource(resource).capabilities() {
            let capability = catalog.capability(*cap_id);
            if capability.namespace().strategy() != ConflictStrategy::Exclusive {
                continue;
            }
            if catalog.is_fragment(resource) {
                continue;
            }
            if let Some(identity) = capability.identity() {
                out.push((identity, catalog.declared(*cap_id)));
            }
        }
        for cap_id in selection.hosted.get(&resource).into_iter().flatten() {
            let capability = catalog.capability(*cap_id);
            if capability.namespace().strategy() != ConflictStrategy::Exclusive {
                continue;
            }
            if let Some(identity) = capability.identity() {
                out.push((identity, Candidate::hosted(*cap_id, resource)));
            }
        }
        out
    }

    /// Build every participating resource's capability space: first the
    /// direct layers sequentially (aggregation recurses across resources),
    /// then the uses closures in parallel, which only read the direct layers.
    fn compute_spaces(
        &self,
        selection: &Selection,
    ) -> Result<HashMap<ResourceId, Space>, ResolutionError> {
        let catalog = self.env.catalog;
        let mut spaces: HashMap<ResourceId, Space> = HashMap::new();

        // Direct imports and provisions.
        for resource in &selection.resources {
            let resource = *resource;
            let mut space = Space::default();
            for req_id in catalog.resource(resource).requirements() {
                let requirement = catalog.requirement(*req_id);
                if requirement.namespace().strategy() != ConflictStrategy::Exclusive {
                    continue;
                }
                for candidate in selection.chosen.get(req_id).into_iter().flatten() {
                    if let Some(identity) = catalog.identity_of(candidate.capability) {
                        space.imported.entry(identity).or_default().push(Blame {
                            candidate: *candidate,
                            chain: vec![*req_id],
                        });
                    }
                }
            }
            for (identity, candidate) in self.exclusive_capabilities(selection, resource) {
                if space.imported.contains_key(&identity) {
                    debug!(
                        "{} substitutes its own {} with an import",
                        catalog.label(resource),
                        identity
                    );
                    continue;
                }
                space.provided.entry(identity).or_insert(candidate);
            }
            spaces.insert(resource, space);
        }

        // Aggregation closure over re-exporting aggregate requirements.
        for resource in &selection.resources {
            self.env.check_cancel()?;
            let mut merged: Vec<(String, Blame)> = Vec::new();
            for req_id in catalog.resource(*resource).requirements() {
                if catalog.requirement(*req_id).namespace().strategy() != ConflictStrategy::Aggregate
                {
                    continue;
                }
                for candidate in selection.chosen.get(req_id).into_iter().flatten() {
                    let mut visited = HashSet::new();
                    self.merge_aggregated(
                        selection,
                        &spaces,
                        candidate.provider,
                        vec![*req_id],
                        &mut visited,
                        &mut merged,
                    );
                }
            }
            if let Some(space) = spaces.get_mut(resource) {
                for (identity, blame) in merged {
                    space.aggregated.entry(identity).or_default().push(blame);
                }
            }
        }

        // Uses closures. Each resource's closure reads other spaces' direct
        // layers only, so the pass parallelises over resources.
        let used_maps: Vec<(ResourceId, IndexMap<String, IndexMap<Candidate, Vec<Blame>>>)> =
            selection
                .resources
                .par_iter()
                .map(|resource| {
                    let mut used: IndexMap<String, IndexMap<Candidate, Vec<Blame>>> =
                        IndexMap::new();
                    let space = &spaces[resource];
                    let direct: Vec<Blame> = space
                        .imported
                        .values()
                        .chain(space.aggregated.values())
                        .flatten()
                        .cloned()
                        .collect();
                    for blame in direct {
                        let mut cycle = HashSet::new();
                        self.merge_uses(&spaces, blame.candidate, &blame.chain, &mut used, &mut cycle);
                    }
                    (*resource, used)
                })
                .collect();
        for (resource, used) in used_maps {
            if let Some(space) = spaces.get_mut(&resource) {
                space.used = used;
            }
        }
        self.env.check_cancel()?;
        Ok(spaces)
    }

    fn merge_aggregated(
        &self,
        selection: &Selection,
        spaces: &HashMap<ResourceId, Space>,
        provider: ResourceId,
        chain: Vec<RequirementId>,
        visited: &mut HashSet<ResourceId>,
        out: &mut Vec<(String, Blame)>,
    ) {
        if !visited.insert(provider) {
            return;
        }
        if let Some(space) = spaces.get(&provider) {
            for (identity, candidate) in &space.provided {
                out.push((
                    identity.clone(),
                    Blame {
                        candidate: *candidate,
                        chain: chain.clone(),
                    },
                ));
            }
        }
        let catalog = self.env.catalog;
        for req_id in catalog.resource(provider).requirements() {
            let requirement = catalog.requirement(*req_id);
            if requirement.namespace().strategy() != ConflictStrategy::Aggregate
                || !requirement.is_reexport()
            {
                continue;
            }
            for candidate in selection.chosen.get(req_id).into_iter().flatten() {
                let mut chain = chain.clone();
                chain.push(*req_id);
                self.merge_aggregated(selection, spaces, candidate.provider, chain, visited, out);
            }
        }
    }

    /// Transitive `uses` walk: every identity the candidate's uses clause
    /// names is resolved against the candidate's provider, and each source
    /// found there constrains the current resource, recursively.
    fn merge_uses(
        &self,
        spaces: &HashMap<ResourceId, Space>,
        candidate: Candidate,
        chain: &[RequirementId],
        used: &mut IndexMap<String, IndexMap<Candidate, Vec<Blame>>>,
        cycle: &mut HashSet<(Candidate, String)>,
    ) {
        let Some(identities) = self.uses_of(candidate.capability) else {
            return;
        };
        let Some(provider_space) = spaces.get(&candidate.provider) else {
            return;
        };
        for identity in identities.iter() {
            if !cycle.insert((candidate, identity.clone())) {
                continue;
            }
            for source in provider_space.source_candidates(identity) {
                used.entry(identity.clone())
                    .or_default()
                    .entry(source)
                    .or_default()
                    .push(Blame {
                        candidate,
                        chain: chain.to_vec(),
                    });
                self.merge_uses(spaces, source, chain, used, cycle);
            }
        }
    }

    /// All candidates a resource transitively accepts as sources of one
    /// identity. Two observations of an identity are compatible when one
    /// side's source set contains the other's.
    fn sources(
        &self,
        spaces: &HashMap<ResourceId, Space>,
        candidate: Candidate,
        memo: &mut HashMap<(ResourceId, String), BTreeSet<Candidate>>,
    ) -> BTreeSet<Candidate> {
        let catalog = self.env.catalog;
        let capability = catalog.capability(candidate.capability);
        if capability.namespace().strategy() != ConflictStrategy::Exclusive {
            return BTreeSet::from([candidate]);
        }
        let Some(identity) = capability.identity() else {
            return BTreeSet::from([candidate]);
        };
        let key = (candidate.provider, identity.clone());
        if let Some(cached) = memo.get(&key) {
            return cached.clone();
        }
        // Seed the memo to cut cycles; the fixpoint is a union so a partial
        // read during the cycle is safe.
        memo.insert(key.clone(), BTreeSet::from([candidate]));
        let mut set = BTreeSet::from([candidate]);
        if let Some(space) = spaces.get(&candidate.provider) {
            for other in space.source_candidates(&identity) {
                if other != candidate {
                    set.extend(self.sources(spaces, other, memo));
                }
            }
        }
        memo.insert(key, set.clone());
        set
    }

    fn compatible(
        &self,
        spaces: &HashMap<ResourceId, Space>,
        current: &[Blame],
        candidate: Candidate,
        memo: &mut HashMap<(ResourceId, String), BTreeSet<Candidate>>,
    ) -> bool {
        let mut current_sources: BTreeSet<Candidate> = BTreeSet::new();
        for blame in current {
            current_sources.extend(self.sources(spaces, blame.candidate, memo));
        }
        let candidate_sources = self.sources(spaces, candidate, memo);
        current_sources.is_subset(&candidate_sources)
            || candidate_sources.is_subset(&current_sources)
    }

    /// Check one resource's space, then recurse into its chosen providers.
    /// Consistent resources are cached; already-wired resources are trusted.
    fn check_space(
        &self,
        index: &CandidateIndex,
        selection: &Selection,
        spaces: &HashMap<ResourceId, Space>,
        resource: ResourceId,
        checked: &mut HashSet<ResourceId>,
        permutations: &mut Permutations,
    ) -> Result<(), ResolutionError> {
        if !checked.insert(resource) {
            return Ok(());
        }
        self.env.check_cancel()?;
        let catalog = self.env.catalog;
        let dynamic_host = self.dynamic.map_or(false, |(host, _)| host == resource);
        if !self.env.wirings.contains_key(&resource) || dynamic_host {
            let Some(space) = spaces.get(&resource) else {
                return Ok(());
            };
            let mut memo = HashMap::new();
            let mut conflict: Option<ResolutionError> = None;
            let mut mutation: Option<CandidateIndex> = None;
            let mut mutated: HashSet<RequirementId> = HashSet::new();
            for (identity, by_candidate) in &space.used {
                let Some(current) = space.own_blames(identity) else {
                    continue;
                };
                for (used_candidate, blames) in by_candidate {
                    if self.compatible(spaces, &current, *used_candidate, &mut memo) {
                        continue;
                    }
                    debug!(
                        "uses conflict in {} over {}: holds {:?}, constrained to {:?}",
                        catalog.label(resource),
                        identity,
                        current.first().map(|b| b.candidate),
                        used_candidate
                    );
                    for blame in blames {
                        self.permutate_chain(
                            index,
                            selection,
                            blame,
                            &mut mutation,
                            &mut mutated,
                        );
                        if conflict.is_none() {
                            let mut requirements: Vec<RequirementId> = blame.chain.clone();
                            requirements.extend(current.iter().flat_map(|b| b.chain.clone()));
                            conflict = Some(ResolutionError::UsesConflict {
                                identity: identity.clone(),
                                requirements,
                                detail: format!(
                                    "{} observes {} from {} but is constrained to {} via a uses chain",
                                    catalog.label(resource),
                                    identity,
                                    current
                                        .first()
                                        .map(|b| catalog.label(b.candidate.provider).to_string())
                                        .unwrap_or_default(),
                                    catalog.label(used_candidate.provider),
                                ),
                            });
                        }
                    }
                    // The import that established the current view is itself
                    // a backtrack point.
                    for blame in &current {
                        if let Some(req) = blame.chain.first() {
                            permutations.permutate_if_needed(
                                catalog,
                                index,
                                PermutationKind::Import,
                                *req,
                            );
                        }
                    }
                }
            }
            if let Some(error) = conflict {
                if let Some(branch) = mutation {
                    permutations.push(PermutationKind::Uses, branch);
                }
                return Err(error);
            }
        }
        for req_id in catalog.resource(resource).requirements() {
            for candidate in selection.chosen.get(req_id).into_iter().flatten() {
                self.check_space(index, selection, spaces, candidate.provider, checked, permutations)?;
            }
        }
        Ok(())
    }

    /// Walk a conflicting blame chain from its deepest requirement and drop
    /// one candidate in a shared backtrack branch. Single cardinality drops
    /// the preferred candidate; multiple cardinality drops just the
    /// conflicting one.
    fn permutate_chain(
        &self,
        index: &CandidateIndex,
        selection: &Selection,
        blame: &Blame,
        mutation: &mut Option<CandidateIndex>,
        mutated: &mut HashSet<RequirementId>,
    ) {
        let catalog = self.env.catalog;
        for (pos, req_id) in blame.chain.iter().enumerate().rev() {
            if mutated.contains(req_id) {
                continue;
            }
            let requirement = catalog.requirement(*req_id);
            if requirement.is_multiple() {
                let target = if pos + 1 == blame.chain.len() {
                    blame.candidate
                } else {
                    match selection.chosen.get(req_id).and_then(|c| c.first()) {
                        Some(candidate) => *candidate,
                        None => continue,
                    }
                };
                let list_len = index.candidates(*req_id).map(|l| l.len()).unwrap_or(0);
                if list_len > 1 || requirement.is_optional() {
                    let branch = mutation.get_or_insert_with(|| index.clone());
                    if branch.exclude(*req_id, target) {
                        mutated.insert(*req_id);
                        return;
                    }
                }
                continue;
            }
            if index.can_exclude_first(catalog, *req_id) {
                let branch = mutation.get_or_insert_with(|| index.clone());
                branch.exclude_first(*req_id);
                mutated.insert(*req_id);
                return;
            }
        }
    }
}
