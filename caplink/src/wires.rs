//! Delta wiring construction.
//!
//! Once a branch passes validation, the surviving candidate choices are
//! turned into concrete wirings for every resource the call newly resolves.
//! Resources the context already reports as wired are left out; the result
//! is the delta the caller applies on top of its existing state.

use crate::candidates::{CandidateIndex, Env};
use crate::context::{Wiring, Wirings};
use crate::namespace::{ConflictStrategy, Namespace};
use crate::resource::{Candidate, RequirementId, ResourceId, Wire};
use std::collections::HashSet;

/// Build the delta wirings for everything reachable from `roots` in the
/// winning branch.
pub(crate) fn delta_wirings(
    env: &Env<'_>,
    branch: &CandidateIndex,
    roots: &[ResourceId],
) -> Wirings {
    let mut wirings = Wirings::new();
    for root in roots {
        populate_wiring(env, branch, *root, &mut wirings);
    }
    for wiring in wirings.values_mut() {
        let extra = env.context.substitution_wires(wiring);
        wiring.wires.extend(extra);
    }
    wirings
}

/// Wirings for a successful dynamic resolve: the host gains exactly one new
/// wire, plus full wirings for any provider resolved along the way.
pub(crate) fn dynamic_wirings(
    env: &Env<'_>,
    branch: &CandidateIndex,
    host: ResourceId,
    requirement: RequirementId,
) -> Wirings {
    let mut wirings = Wirings::new();
    if let Some(candidate) = branch.first(requirement) {
        populate_wiring(env, branch, candidate.provider, &mut wirings);
        let mut host_wiring = Wiring::new(host);
        host_wiring.wires.push(make_wire(env, host, requirement, candidate));
        wirings.insert(host, host_wiring);
    }
    wirings
}

fn make_wire(
    env: &Env<'_>,
    requirer: ResourceId,
    requirement: RequirementId,
    candidate: Candidate,
) -> Wire {
    let capability = env.catalog.capability(candidate.capability);
    // Identity wires always point at the declaring resource, even when the
    // capability is observed on a host.
    let provider = if capability.namespace() == Namespace::Identity {
        capability.owner()
    } else {
        candidate.provider
    };
    Wire {
        requirer,
        requirement,
        provider,
        capability: candidate.capability,
    }
}

fn selected<'c>(
    env: &Env<'_>,
    branch: &'c CandidateIndex,
    requirement: RequirementId,
) -> &'c [Candidate] {
    let list = branch.candidates(requirement).unwrap_or(&[]);
    if env.catalog.requirement(requirement).is_multiple() {
        list
    } else {
        &list[..list.len().min(1)]
    }
}

fn populate_wiring(
    env: &Env<'_>,
    branch: &CandidateIndex,
    resource: ResourceId,
    wirings: &mut Wirings,
) {
    let catalog = env.catalog;
    if env.wirings.contains_key(&resource)
        || wirings.contains_key(&resource)
        || !branch.is_populated(resource)
    {
        return;
    }
    // Placeholder first: wires can cycle back through providers.
    wirings.insert(resource, Wiring::new(resource));

    let is_fragment = catalog.is_fragment(resource);
    let mut exclusive_wires: Vec<Wire> = Vec::new();
    let mut aggregate_wires: Vec<Wire> = Vec::new();
    let mut other_wires: Vec<Wire> = Vec::new();
    let mut hosts: Vec<ResourceId> = Vec::new();

    for req_id in catalog.resource(resource).requirements() {
        let requirement = catalog.requirement(*req_id);
        if requirement.is_dynamic() {
            continue;
        }
        for candidate in selected(env, branch, *req_id).to_vec() {
            populate_wiring(env, branch, candidate.provider, wirings);
            if candidate.is_hosted(catalog) {
                // The declaring fragment resolves alongside its host.
                populate_wiring(env, branch, catalog.capability(candidate.capability).owner(), wirings);
            }
            if is_fragment && requirement.namespace() == Namespace::Host {
                hosts.push(candidate.provider);
            }
            let namespace = requirement.namespace();
            if namespace.suppresses_self_wires() && candidate.provider == resource {
                continue;
            }
            let wire = make_wire(env, resource, *req_id, candidate);
            match namespace.strategy() {
                ConflictStrategy::Exclusive => exclusive_wires.push(wire),
                ConflictStrategy::Aggregate => aggregate_wires.push(wire),
                _ => other_wires.push(wire),
            }
        }
    }

    let mut capabilities: Vec<Candidate> = catalog
        .resource(resource)
        .capabilities()
        .iter()
        .map(|cap| catalog.declared(*cap))
        .collect();
    if is_fragment {
        // Payload capabilities surface on the hosts, not on the fragment.
        capabilities.retain(|c| !catalog.capability(c.capability).namespace().is_payload());
    }

    if let Some(wiring) = wirings.get_mut(&resource) {
        wiring.capabilities = capabilities;
        wiring.wires = exclusive_wires;
        wiring.wires.extend(aggregate_wires);
        wiring.wires.extend(other_wires);
    }

    // Project this fragment's payload onto each newly resolved host.
    if is_fragment {
        let unique: HashSet<ResourceId> = hosts.into_iter().collect();
        for host in unique {
            let Some(host_wiring) = wirings.get_mut(&host) else {
                continue;
            };
            for cap_id in catalog.resource(resource).capabilities() {
                if !catalog.capability(*cap_id).namespace().is_payload() {
                    continue;
                }
                let hosted = Candidate::hosted(*cap_id, host);
                if !host_wiring.capabilities.contains(&hosted) {
                    env.context
                        .insert_hosted_capability(&mut host_wiring.capabilities, hosted);
                }
            }
        }
    }
}
