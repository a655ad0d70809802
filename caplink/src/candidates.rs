//! Per-requirement candidate index.
//!
//! Population walks the requirement graph breadth-first, asking the context
//! for providers and recursively pulling in every unresolved provider it
//! meets. The resulting index is then branched copy-on-write during the
//! backtracking search: a branch shares candidate lists with its parent until
//! one is mutated, and tracks the set of exclusions it made (the delta), which
//! doubles as the permutation-memo key.

use crate::context::{ResolveContext, Wirings};
use crate::error::ResolutionError;
use crate::namespace::{ConflictStrategy, Namespace};
use crate::resource::{Candidate, Catalog, RequirementId, ResourceId};
use log::debug;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Shared read-only plumbing for one resolve call.
pub(crate) struct Env<'a> {
    pub catalog: &'a Catalog,
    pub context: &'a dyn ResolveContext,
    pub wirings: &'a Wirings,
    pub cancel: crate::context::CancelFlag,
}

impl<'a> Env<'a> {
    pub fn check_cancel(&self) -> Result<(), ResolutionError> {
        if self.cancel.is_cancelled() {
            Err(ResolutionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Terminal population state of a resource within one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResourceState {
    /// All effective requirements gathered candidates.
    Resolved,
    /// A mandatory-set resource ran out of candidates for this requirement.
    Failed(RequirementId),
    /// A best-effort resource failed, or was excluded by an earlier retry.
    Dropped(Option<RequirementId>),
}

/// Delta entry: a candidate excluded from a requirement's list relative to
/// the initial population.
pub(crate) type DeltaKey = Vec<(RequirementId, Candidate)>;

#[derive(Clone)]
pub(crate) struct CandidateIndex {
    lists: HashMap<RequirementId, Arc<Vec<Candidate>>>,
    delta: BTreeSet<(RequirementId, Candidate)>,
    states: Arc<HashMap<ResourceId, ResourceState>>,
    dependents: Arc<HashMap<Candidate, Vec<RequirementId>>>,
    /// Exclusive exports that might be shadowed by the owner's own matching
    /// requirement, mapped to that requirement.
    substitutable: Arc<HashMap<Candidate, RequirementId>>,
}

impl CandidateIndex {
    pub fn candidates(&self, req: RequirementId) -> Option<&[Candidate]> {
        self.lists.get(&req).map(|l| l.as_slice())
    }

    pub fn first(&self, req: RequirementId) -> Option<Candidate> {
        self.lists.get(&req).and_then(|l| l.first().copied())
    }

    pub fn is_populated(&self, resource: ResourceId) -> bool {
        matches!(self.states.get(&resource), Some(ResourceState::Resolved))
    }

    pub fn failure(&self, resource: ResourceId) -> Option<RequirementId> {
        match self.states.get(&resource) {
            Some(ResourceState::Failed(req)) => Some(*req),
            Some(ResourceState::Dropped(req)) => *req,
            _ => None,
        }
    }

    /// Memo key: the exclusions of this branch in deterministic order.
    pub fn delta_key(&self) -> DeltaKey {
        self.delta.iter().copied().collect()
    }

    /// Order-preserving removal of one candidate. Returns false when the
    /// candidate was not present.
    pub fn exclude(&mut self, req: RequirementId, candidate: Candidate) -> bool {
        let Some(list) = self.lists.get_mut(&req) else {
            return false;
        };
        let Some(pos) = list.iter().position(|c| *c == candidate) else {
            return false;
        };
        Arc::make_mut(list).remove(pos);
        if list.is_empty() {
            self.lists.remove(&req);
        }
        self.delta.insert((req, candidate));
        true
    }

    /// Drop the preferred candidate of a requirement, recording the delta.
    pub fn exclude_first(&mut self, req: RequirementId) -> Option<Candidate> {
        let first = self.first(req)?;
        self.exclude(req, first);
        Some(first)
    }

    /// Whether excluding the preferred candidate leaves the requirement in a
    /// satisfiable state: either an alternative remains or the requirement
    /// was best-effort to begin with.
    pub fn can_exclude_first(&self, catalog: &Catalog, req: RequirementId) -> bool {
        match self.lists.get(&req) {
            Some(list) => list.len() > 1 || catalog.requirement(req).is_optional(),
            None => false,
        }
    }

    /// Backtrack branch: a copy with the preferred candidate excluded. None
    /// when the requirement has no alternative (or accepts every candidate
    /// anyway, i.e. multiple cardinality).
    pub fn branch_without_first(&self, catalog: &Catalog, req: RequirementId) -> Option<Self> {
        if catalog.requirement(req).is_multiple() || !self.can_exclude_first(catalog, req) {
            return None;
        }
        let mut branch = self.clone();
        branch.exclude_first(req);
        Some(branch)
    }

    /// Per-branch substitutable-export pass: determine which exclusive
    /// exports are shadowed by their owner's own import decision in this
    /// branch, and drop the shadowed exports from dependent candidate lists.
    /// Returns the requirements whose import decision caused a substitution,
    /// so the session can queue backtrack branches for them.
    pub fn apply_substitutions(
        &mut self,
        catalog: &Catalog,
    ) -> Result<Vec<RequirementId>, ResolutionError> {
        if self.substitutable.is_empty() {
            return Ok(Vec::new());
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Status {
            Unprocessed,
            Processing,
            Substituted,
            Exported,
        }

        let substitutable = Arc::clone(&self.substitutable);
        let mut statuses: HashMap<Candidate, Status> = substitutable
            .keys()
            .map(|c| (*c, Status::Unprocessed))
            .collect();

        fn walk(
            index: &CandidateIndex,
            substitutable: &HashMap<Candidate, RequirementId>,
            statuses: &mut HashMap<Candidate, Status>,
            export: Candidate,
        ) -> bool {
            match statuses.get(&export).copied() {
                None => return false,
                Some(Status::Processing) => {
                    // Cycle: treat the initiator as a real export.
                    statuses.insert(export, Status::Exported);
                    return false;
                }
                Some(Status::Substituted) => return true,
                Some(Status::Exported) => return false,
                Some(Status::Unprocessed) => {}
            }
            statuses.insert(export, Status::Processing);
            let req = substitutable[&export];
            if let Some(candidates) = index.candidates(req) {
                for candidate in candidates.iter().copied().collect::<Vec<_>>() {
                    if candidate.provider == export.provider {
                        statuses.insert(export, Status::Exported);
                        return false;
                    }
                    if !walk(index, substitutable, statuses, candidate) {
                        statuses.insert(export, Status::Substituted);
                        return true;
                    }
                }
            }
            statuses.insert(export, Status::Exported);
            false
        }

        for export in substitutable.keys() {
            walk(self, &substitutable, &mut statuses, *export);
        }

        let mut permutate: Vec<RequirementId> = Vec::new();
        for (export, req) in substitutable.iter() {
            if statuses.get(export) != Some(&Status::Substituted) {
                continue;
            }
            permutate.push(*req);
            let Some(dependents) = self.dependents.get(export).cloned() else {
                continue;
            };
            for dependent in dependents {
                let Some(list) = self.candidates(dependent) else {
                    continue;
                };
                // Remove substituted candidates that shadow better-placed
                // exports; stop at the first surviving export.
                let mut doomed = Vec::new();
                for candidate in list {
                    match statuses.get(candidate).copied() {
                        Some(Status::Substituted) => doomed.push(*candidate),
                        _ => break,
                    }
                }
                for candidate in doomed {
                    self.exclude(dependent, candidate);
                }
                if self.candidates(dependent).is_none() {
                    let requirement = catalog.requirement(dependent);
                    if !requirement.is_optional() {
                        return Err(ResolutionError::Unsatisfiable {
                            resource: catalog.label(requirement.owner()).to_string(),
                            requirements: vec![dependent],
                        });
                    }
                }
            }
        }
        Ok(permutate)
    }
}

/// Transient population progress; collapses into a [`ResourceState`].
enum Progress {
    InProgress {
        remaining: VecDeque<RequirementId>,
        staged: Vec<(RequirementId, Vec<Candidate>)>,
    },
    Done(ResourceState),
}

/// Builds the initial [`CandidateIndex`] for a session.
pub(crate) struct Populator<'a, 'b> {
    env: &'b Env<'a>,
    /// Resources that must resolve; everything else fails soft.
    mandatory: HashSet<ResourceId>,
    /// Related resources invalidated by an earlier retry of this call.
    invalidated: &'b HashSet<ResourceId>,
    lists: HashMap<RequirementId, Vec<Candidate>>,
    states: HashMap<ResourceId, Progress>,
    dependents: HashMap<Candidate, Vec<RequirementId>>,
    related: Vec<ResourceId>,
}

impl<'a, 'b> Populator<'a, 'b> {
    pub fn new(
        env: &'b Env<'a>,
        mandatory: HashSet<ResourceId>,
        invalidated: &'b HashSet<ResourceId>,
    ) -> Self {
        Populator {
            env,
            mandatory,
            invalidated,
            lists: HashMap::new(),
            states: HashMap::new(),
            dependents: HashMap::new(),
            related: Vec::new(),
        }
    }

    /// Related resources discovered while populating, in discovery order.
    pub fn discovered_related(&self) -> Vec<ResourceId> {
        self.related.clone()
    }

    /// Populate candidates for `resources` and everything they transitively
    /// pull in. Failures are recorded per resource, never raised; only
    /// cancellation aborts.
    pub fn populate(&mut self, resources: Vec<ResourceId>) -> Result<(), ResolutionError> {
        let catalog = self.env.catalog;
        let mut failed: HashSet<ResourceId> = HashSet::new();
        let mut work: VecDeque<ResourceId> = resources.into();
        while let Some(resource) = work.front().copied() {
            self.env.check_cancel()?;
            if self.invalidated.contains(&resource) && !self.mandatory.contains(&resource) {
                self.states
                    .insert(resource, Progress::Done(ResourceState::Dropped(None)));
                work.pop_front();
                continue;
            }
            if !self.states.contains_key(&resource) {
                self.states.insert(
                    resource,
                    Progress::InProgress {
                        remaining: catalog.resource(resource).requirements().iter().copied().collect(),
                        staged: Vec::new(),
                    },
                );
            }
            let next_req = match self.states.get_mut(&resource) {
                Some(Progress::Done(_)) | None => {
                    work.pop_front();
                    continue;
                }
                Some(Progress::InProgress { remaining, .. }) => remaining.pop_front(),
            };
            let Some(req_id) = next_req else {
                // All requirements processed: commit and pull in related
                // resources (best-effort).
                work.pop_front();
                self.commit(resource);
                if !catalog.is_fragment(resource) {
                    for related in self.env.context.related_resources(resource) {
                        if !self.invalidated.contains(&related) {
                            self.related.push(related);
                            work.push_front(related);
                        }
                    }
                }
                continue;
            };
            let requirement = catalog.requirement(req_id);
            if requirement.is_dynamic() || !self.env.context.is_effective(req_id) {
                continue;
            }
            let mut candidates: Vec<Candidate> = self
                .env
                .context
                .find_providers(req_id)
                .into_iter()
                .map(|cap| catalog.declared(cap))
                .collect();
            let to_populate = self.process_candidates(req_id, &mut candidates);
            if candidates.is_empty() && !requirement.is_optional() {
                if catalog.is_fragment(resource) && self.env.wirings.contains_key(&resource) {
                    // Already-resolved fragment with no further host to
                    // attach to; keep what it gathered so far.
                    self.commit(resource);
                } else {
                    self.fail(resource, req_id);
                    failed.insert(resource);
                }
                work.pop_front();
            } else {
                if !candidates.is_empty() {
                    if let Some(Progress::InProgress { staged, .. }) = self.states.get_mut(&resource)
                    {
                        staged.push((req_id, candidates));
                    }
                }
                for dependency in to_populate.into_iter().rev() {
                    work.push_front(dependency);
                }
            }
        }

        // Cascade: a removed resource takes its capabilities with it, which
        // may strand other resources' mandatory requirements.
        let mut queue: Vec<ResourceId> = failed.into_iter().collect();
        let mut seen: HashSet<ResourceId> = queue.iter().copied().collect();
        while let Some(resource) = queue.pop() {
            for stranded in self.remove(resource) {
                if seen.insert(stranded) {
                    queue.push(stranded);
                }
            }
        }
        Ok(())
    }

    /// Seed the index for a dynamic resolve: the host's dynamic requirement
    /// starts out with the given candidates and the host itself counts as
    /// populated. Returns the candidates that survived population of their
    /// providers.
    pub fn populate_dynamic(
        &mut self,
        host: ResourceId,
        requirement: RequirementId,
        mut candidates: Vec<Candidate>,
    ) -> Result<Vec<Candidate>, ResolutionError> {
        let to_populate = self.process_candidates(requirement, &mut candidates);
        self.stage_list(requirement, candidates.clone());
        self.states.insert(host, Progress::Done(ResourceState::Resolved));
        self.populate(to_populate)?;
        let surviving: Vec<Candidate> = self
            .lists
            .get(&requirement)
            .map(|l| l.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|c| {
                let owner = self.env.catalog.capability(c.capability).owner();
                self.env.wirings.contains_key(&owner)
                    || matches!(self.states.get(&owner), Some(Progress::Done(ResourceState::Resolved)))
                    || owner == host
            })
            .collect();
        self.lists.insert(requirement, surviving.clone());
        Ok(surviving)
    }

    fn stage_list(&mut self, req: RequirementId, candidates: Vec<Candidate>) {
        for candidate in &candidates {
            self.dependents.entry(*candidate).or_default().push(req);
        }
        self.lists.insert(req, candidates);
    }

    fn commit(&mut self, resource: ResourceId) {
        let staged = match self
            .states
            .insert(resource, Progress::Done(ResourceState::Resolved))
        {
            Some(Progress::InProgress { staged, .. }) => staged,
            _ => Vec::new(),
        };
        for (req, candidates) in staged {
            self.stage_list(req, candidates);
        }
    }

    fn fail(&mut self, resource: ResourceId, requirement: RequirementId) {
        let state = if self.mandatory.contains(&resource) {
            ResourceState::Failed(requirement)
        } else {
            debug!(
                "dropping best-effort resource {}: no provider for a mandatory requirement",
                self.env.catalog.label(resource)
            );
            ResourceState::Dropped(Some(requirement))
        };
        self.states.insert(resource, Progress::Done(state));
    }

    /// Inspect candidates for one requirement: queue unresolved providers for
    /// population, drop candidates from providers already known to have
    /// failed, and substitute hosted capabilities for capabilities declared
    /// by already-resolved fragments.
    fn process_candidates(
        &mut self,
        req_id: RequirementId,
        candidates: &mut Vec<Candidate>,
    ) -> Vec<ResourceId> {
        let catalog = self.env.catalog;
        let owner = catalog.requirement(req_id).owner();
        let mut to_populate = Vec::new();
        let mut fragment_candidates: Vec<Candidate> = Vec::new();

        candidates.retain(|candidate| {
            let provider = catalog.capability(candidate.capability).owner();
            if self.invalidated.contains(&provider) {
                return false;
            }
            let is_fragment = catalog.is_fragment(provider);
            if is_fragment {
                fragment_candidates.push(*candidate);
            }
            if (is_fragment || !self.env.wirings.contains_key(&provider)) && provider != owner {
                match self.states.get(&provider) {
                    Some(Progress::Done(ResourceState::Failed(_)))
                    | Some(Progress::Done(ResourceState::Dropped(_))) => return false,
                    Some(_) => {}
                    None => to_populate.push(provider),
                }
            }
            true
        });

        // A capability declared by an already-attached fragment surfaces as a
        // hosted capability of each of its hosts.
        for fragment_candidate in fragment_candidates {
            let capability = catalog.capability(fragment_candidate.capability);
            if capability.namespace() == Namespace::Identity {
                continue;
            }
            let Some(wiring) = self.env.wirings.get(&capability.owner()) else {
                continue;
            };
            for wire in &wiring.wires {
                if catalog.requirement(wire.requirement).namespace() != Namespace::Host {
                    continue;
                }
                let host = wire.provider;
                let host_exposes = capability.namespace().strategy() != ConflictStrategy::Exclusive
                    || self
                        .env
                        .wirings
                        .get(&host)
                        .map(|w| {
                            w.capabilities
                                .iter()
                                .any(|c| c.capability == fragment_candidate.capability)
                        })
                        .unwrap_or(false);
                if host_exposes {
                    if let Some(pos) = candidates.iter().position(|c| *c == fragment_candidate) {
                        candidates.remove(pos);
                    }
                    let hosted = Candidate::hosted(fragment_candidate.capability, host);
                    self.env
                        .context
                        .insert_hosted_capability(candidates, hosted);
                }
            }
        }

        to_populate
    }

    /// Remove a failed resource's candidates everywhere; returns resources
    /// newly stranded by the removal.
    fn remove(&mut self, resource: ResourceId) -> Vec<ResourceId> {
        let catalog = self.env.catalog;
        // Drop the resource's own candidate lists.
        for req in catalog.resource(resource).requirements() {
            self.lists.remove(req);
        }
        let mut stranded = Vec::new();
        let affected: Vec<(Candidate, Vec<RequirementId>)> = self
            .dependents
            .iter()
            .filter(|(candidate, _)| {
                candidate.provider == resource
                    || catalog.capability(candidate.capability).owner() == resource
            })
            .map(|(candidate, reqs)| (*candidate, reqs.clone()))
            .collect();
        for (candidate, reqs) in affected {
            for req in reqs {
                let Some(list) = self.lists.get_mut(&req) else {
                    continue;
                };
                list.retain(|c| *c != candidate);
                if list.is_empty() {
                    self.lists.remove(&req);
                    let requirement = catalog.requirement(req);
                    if !requirement.is_optional() {
                        let dependent = requirement.owner();
                        if !matches!(
                            self.states.get(&dependent),
                            Some(Progress::Done(ResourceState::Failed(_)))
                                | Some(Progress::Done(ResourceState::Dropped(_)))
                        ) {
                            self.fail(dependent, req);
                            stranded.push(dependent);
                        }
                    }
                }
            }
            self.dependents.remove(&candidate);
        }
        stranded
    }

    /// Freeze into the immutable base index for the search.
    pub fn freeze(self) -> CandidateIndex {
        let catalog = self.env.catalog;
        let states: HashMap<ResourceId, ResourceState> = self
            .states
            .into_iter()
            .filter_map(|(res, progress)| match progress {
                Progress::Done(state) => Some((res, state)),
                Progress::InProgress { .. } => None,
            })
            .collect();

        // Substitutable exports: an exclusive capability whose owner also has
        // a same-namespace requirement currently aimed at the same identity,
        // with at least one foreign candidate.
        let mut substitutable: HashMap<Candidate, RequirementId> = HashMap::new();
        for (resource, state) in &states {
            if *state != ResourceState::Resolved {
                continue;
            }
            let resource = *resource;
            for cap_id in catalog.resource(resource).capabilities() {
                let capability = catalog.capability(*cap_id);
                if capability.namespace().strategy() != ConflictStrategy::Exclusive {
                    continue;
                }
                let Some(identity) = capability.identity() else {
                    continue;
                };
                for req_id in catalog.resource(resource).requirements() {
                    if catalog.requirement(*req_id).namespace() != capability.namespace() {
                        continue;
                    }
                    let Some(list) = self.lists.get(req_id) else {
                        continue;
                    };
                    let aims_here = list
                        .first()
                        .and_then(|c| catalog.identity_of(c.capability))
                        .map(|i| i == identity)
                        .unwrap_or(false);
                    let has_foreign = list.iter().any(|c| c.provider != resource);
                    if aims_here && has_foreign {
                        substitutable.insert(catalog.declared(*cap_id), *req_id);
                    }
                }
            }
        }

        CandidateIndex {
            lists: self
                .lists
                .into_iter()
                .map(|(req, list)| (req, Arc::new(list)))
                .collect(),
            delta: BTreeSet::new(),
            states: Arc::new(states),
            dependents: Arc::new(self.dependents),
            substitutable: Arc::new(substitutable),
        }
    }
}
