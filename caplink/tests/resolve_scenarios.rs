mod common;

use caplink::{
    Candidate, Capability, Catalog, Namespace, Requirement, ResolutionError, Resolver,
    ResolverConfig, Wire, Wiring,
};
use common::{init_logging, TableContext};

#[test]
fn simple_chain_resolves_transitively() {
    init_logging();
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let lib = catalog.add_resource("lib");
    let base = catalog.add_resource("base");

    let lib_cap = catalog.add_capability(
        lib,
        Capability::new(Namespace::Package).with_identity("lib.api"),
    );
    let base_cap = catalog.add_capability(
        base,
        Capability::new(Namespace::Package).with_identity("base.api"),
    );
    let app_req = catalog.add_requirement(app, Requirement::new(Namespace::Package));
    let lib_req = catalog.add_requirement(lib, Requirement::new(Namespace::Package));

    let context = TableContext::new()
        .mandatory(app)
        .providers(app_req, vec![lib_cap])
        .providers(lib_req, vec![base_cap]);

    let wirings = Resolver::new().resolve(&catalog, &context).expect("resolves");
    assert_eq!(wirings.len(), 3, "app, lib and base are all newly wired");
    assert_eq!(wirings[&app].wires[0].provider, lib);
    assert_eq!(wirings[&lib].wires[0].provider, base);
    assert!(wirings[&base].wires.is_empty());
}

#[test]
fn optional_requirement_without_provider_is_skipped() {
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let lib = catalog.add_resource("lib");
    let lib_cap = catalog.add_capability(
        lib,
        Capability::new(Namespace::Package).with_identity("lib.api"),
    );
    let needed = catalog.add_requirement(app, Requirement::new(Namespace::Package));
    let missing = catalog.add_requirement(app, Requirement::new(Namespace::Package).optional());

    let context = TableContext::new()
        .mandatory(app)
        .providers(needed, vec![lib_cap]);

    let wirings = Resolver::new().resolve(&catalog, &context).expect("resolves");
    assert_eq!(wirings[&app].wires.len(), 1);
    assert!(wirings[&app].wires_for(missing).next().is_none());
}

#[test]
fn missing_mandatory_provider_reports_the_requirement() {
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let req = catalog.add_requirement(app, Requirement::new(Namespace::Package));

    let context = TableContext::new().mandatory(app);
    let error = Resolver::new()
        .resolve(&catalog, &context)
        .expect_err("no provider anywhere");
    match error {
        ResolutionError::Unsatisfiable {
            resource,
            requirements,
        } => {
            assert_eq!(resource, "app");
            assert_eq!(requirements, vec![req]);
        }
        other => panic!("expected Unsatisfiable, got {:?}", other),
    }
}

#[test]
fn failing_optional_root_does_not_poison_the_call() {
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let extra = catalog.add_resource("extra");
    let lib = catalog.add_resource("lib");

    let lib_cap = catalog.add_capability(
        lib,
        Capability::new(Namespace::Package).with_identity("lib.api"),
    );
    let app_req = catalog.add_requirement(app, Requirement::new(Namespace::Package));
    // extra's requirement has no provider at all.
    catalog.add_requirement(extra, Requirement::new(Namespace::Package));

    let context = TableContext::new()
        .mandatory(app)
        .optional(extra)
        .providers(app_req, vec![lib_cap]);

    let wirings = Resolver::new().resolve(&catalog, &context).expect("resolves");
    assert!(wirings.contains_key(&app));
    assert!(!wirings.contains_key(&extra));
}

#[test]
fn uses_conflict_backtracks_to_the_agreeing_candidate() {
    init_logging();
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let api_v1 = catalog.add_resource("api-v1");
    let api_v2 = catalog.add_resource("api-v2");
    let middle = catalog.add_resource("middle");

    let cap_v1 = catalog.add_capability(
        api_v1,
        Capability::new(Namespace::Package).with_identity("api"),
    );
    let cap_v2 = catalog.add_capability(
        api_v2,
        Capability::new(Namespace::Package).with_identity("api"),
    );
    let cap_impl = catalog.add_capability(
        middle,
        Capability::new(Namespace::Package)
            .with_identity("impl")
            .with_directive("uses", "api"),
    );
    let middle_req = catalog.add_requirement(middle, Requirement::new(Namespace::Package));
    let api_req = catalog.add_requirement(app, Requirement::new(Namespace::Package));
    let impl_req = catalog.add_requirement(app, Requirement::new(Namespace::Package));

    // app prefers api-v2, but middle (which app also imports) is pinned to
    // api-v1 and its impl package uses api.
    let context = TableContext::new()
        .mandatory(app)
        .providers(middle_req, vec![cap_v1])
        .providers(api_req, vec![cap_v2, cap_v1])
        .providers(impl_req, vec![cap_impl]);

    let wirings = Resolver::new().resolve(&catalog, &context).expect("backtracks");
    let api_wire = wirings[&app].wires_for(api_req).next().expect("api wire");
    assert_eq!(api_wire.provider, api_v1, "second preference wins");
}

#[test]
fn unsolvable_uses_conflict_is_reported() {
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let api_v1 = catalog.add_resource("api-v1");
    let api_v2 = catalog.add_resource("api-v2");
    let middle = catalog.add_resource("middle");

    let cap_v1 = catalog.add_capability(
        api_v1,
        Capability::new(Namespace::Package).with_identity("api"),
    );
    let cap_v2 = catalog.add_capability(
        api_v2,
        Capability::new(Namespace::Package).with_identity("api"),
    );
    let cap_impl = catalog.add_capability(
        middle,
        Capability::new(Namespace::Package)
            .with_identity("impl")
            .with_directive("uses", "api"),
    );
    let middle_req = catalog.add_requirement(middle, Requirement::new(Namespace::Package));
    let api_req = catalog.add_requirement(app, Requirement::new(Namespace::Package));
    let impl_req = catalog.add_requirement(app, Requirement::new(Namespace::Package));

    // No alternative for app's api import this time.
    let context = TableContext::new()
        .mandatory(app)
        .providers(middle_req, vec![cap_v1])
        .providers(api_req, vec![cap_v2])
        .providers(impl_req, vec![cap_impl]);

    let error = Resolver::new()
        .resolve(&catalog, &context)
        .expect_err("no consistent branch exists");
    match error {
        ResolutionError::UsesConflict { identity, .. } => assert_eq!(identity, "api"),
        other => panic!("expected UsesConflict, got {:?}", other),
    }
}

#[test]
fn branch_budget_stops_the_search() {
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let api_v1 = catalog.add_resource("api-v1");
    let api_v2 = catalog.add_resource("api-v2");
    let middle = catalog.add_resource("middle");

    let cap_v1 = catalog.add_capability(
        api_v1,
        Capability::new(Namespace::Package).with_identity("api"),
    );
    let cap_v2 = catalog.add_capability(
        api_v2,
        Capability::new(Namespace::Package).with_identity("api"),
    );
    let cap_impl = catalog.add_capability(
        middle,
        Capability::new(Namespace::Package)
            .with_identity("impl")
            .with_directive("uses", "api"),
    );
    let middle_req = catalog.add_requirement(middle, Requirement::new(Namespace::Package));
    let api_req = catalog.add_requirement(app, Requirement::new(Namespace::Package));
    let impl_req = catalog.add_requirement(app, Requirement::new(Namespace::Package));

    let context = TableContext::new()
        .mandatory(app)
        .providers(middle_req, vec![cap_v1])
        .providers(api_req, vec![cap_v2, cap_v1])
        .providers(impl_req, vec![cap_impl]);

    // One branch is not enough to reach the consistent permutation.
    let resolver = Resolver::with_config(ResolverConfig::default().with_max_branches(1));
    let error = resolver
        .resolve(&catalog, &context)
        .expect_err("budget exhausted before the fix");
    assert!(matches!(error, ResolutionError::UsesConflict { .. }));
}

#[test]
fn multiple_cardinality_wires_every_candidate() {
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let red = catalog.add_resource("red");
    let blue = catalog.add_resource("blue");

    let red_cap = catalog.add_capability(
        red,
        Capability::new(Namespace::Bundle).with_identity("red"),
    );
    let blue_cap = catalog.add_capability(
        blue,
        Capability::new(Namespace::Bundle).with_identity("blue"),
    );
    let req = catalog.add_requirement(app, Requirement::new(Namespace::Bundle).multiple());

    let context = TableContext::new()
        .mandatory(app)
        .providers(req, vec![red_cap, blue_cap]);

    let wirings = Resolver::new().resolve(&catalog, &context).expect("resolves");
    let wires: Vec<&Wire> = wirings[&app].wires_for(req).collect();
    assert_eq!(wires.len(), 2);
    assert_eq!(wires[0].provider, red);
    assert_eq!(wires[1].provider, blue);
}

#[test]
fn own_capability_satisfies_without_a_self_wire() {
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let own = catalog.add_capability(
        app,
        Capability::new(Namespace::Package).with_identity("own.api"),
    );
    let req = catalog.add_requirement(app, Requirement::new(Namespace::Package));

    let context = TableContext::new().mandatory(app).providers(req, vec![own]);
    let wirings = Resolver::new().resolve(&catalog, &context).expect("resolves");
    assert!(wirings[&app].wires.is_empty(), "self wires are suppressed");
}

#[test]
fn already_wired_resources_stay_out_of_the_delta() {
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let lib = catalog.add_resource("lib");
    let lib_cap = catalog.add_capability(
        lib,
        Capability::new(Namespace::Package).with_identity("lib.api"),
    );
    let req = catalog.add_requirement(app, Requirement::new(Namespace::Package));

    let mut context = TableContext::new()
        .mandatory(app)
        .providers(req, vec![lib_cap]);
    context
        .wired
        .insert(lib, Wiring::new(lib).with_capability(Candidate {
            capability: lib_cap,
            provider: lib,
        }));

    let wirings = Resolver::new().resolve(&catalog, &context).expect("resolves");
    assert!(wirings.contains_key(&app));
    assert!(!wirings.contains_key(&lib), "lib was already wired");
    assert_eq!(wirings[&app].wires[0].provider, lib);
}

#[test]
fn resolved_fragment_capability_is_served_by_the_host() {
    init_logging();
    let mut catalog = Catalog::new();
    let host = catalog.add_resource("host");
    let fragment = catalog.add_resource("fragment");
    let app = catalog.add_resource("app");

    catalog.add_capability(host, Capability::new(Namespace::Host).with_identity("host"));
    let payload = catalog.add_capability(
        fragment,
        Capability::new(Namespace::Package).with_identity("extra.api"),
    );
    let attach = catalog.add_requirement(fragment, Requirement::new(Namespace::Host));
    let app_req = catalog.add_requirement(app, Requirement::new(Namespace::Package));

    // host and fragment were resolved by an earlier call; the payload is
    // already observed on the host.
    let mut context = TableContext::new()
        .mandatory(app)
        .providers(app_req, vec![payload]);
    context.wired.insert(
        host,
        Wiring::new(host).with_capability(Candidate::hosted(payload, host)),
    );
    context.wired.insert(
        fragment,
        Wiring::new(fragment).with_wire(Wire {
            requirer: fragment,
            requirement: attach,
            provider: host,
            capability: payload,
        }),
    );
    // The attach wire above carries the host capability in a real catalog;
    // only its requirement namespace matters here.

    let wirings = Resolver::new().resolve(&catalog, &context).expect("resolves");
    let wire = wirings[&app].wires_for(app_req).next().expect("hosted wire");
    assert_eq!(wire.provider, host, "wire points at the host, not the fragment");
    assert_eq!(wire.capability, payload);
}

#[test]
fn fresh_fragment_attaches_and_projects_payload() {
    let mut catalog = Catalog::new();
    let host = catalog.add_resource("host");
    let fragment = catalog.add_resource("fragment");

    let host_cap = catalog.add_capability(
        host,
        Capability::new(Namespace::Host).with_identity("host"),
    );
    let payload = catalog.add_capability(
        fragment,
        Capability::new(Namespace::Package).with_identity("extra.api"),
    );
    let attach = catalog.add_requirement(fragment, Requirement::new(Namespace::Host));

    let context = TableContext::new()
        .mandatory(host)
        .mandatory(fragment)
        .providers(attach, vec![host_cap]);

    let wirings = Resolver::new().resolve(&catalog, &context).expect("resolves");
    assert_eq!(wirings[&fragment].wires[0].provider, host);
    assert!(
        wirings[&host]
            .capabilities
            .contains(&Candidate::hosted(payload, host)),
        "payload capability surfaces on the host"
    );
}

#[test]
fn related_resources_resolve_alongside_their_trigger() {
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let companion = catalog.add_resource("companion");
    let lib = catalog.add_resource("lib");

    let lib_cap = catalog.add_capability(
        lib,
        Capability::new(Namespace::Package).with_identity("lib.api"),
    );
    let app_req = catalog.add_requirement(app, Requirement::new(Namespace::Package));
    let companion_req = catalog.add_requirement(companion, Requirement::new(Namespace::Package));

    let mut context = TableContext::new()
        .mandatory(app)
        .providers(app_req, vec![lib_cap])
        .providers(companion_req, vec![lib_cap]);
    context.related.insert(app, vec![companion]);

    let wirings = Resolver::new().resolve(&catalog, &context).expect("resolves");
    assert!(wirings.contains_key(&companion), "related resource got wired");
    assert_eq!(wirings[&companion].wires[0].provider, lib);
}

#[test]
fn repeated_calls_are_deterministic() {
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let a = catalog.add_resource("a");
    let b = catalog.add_resource("b");
    let cap_a = catalog.add_capability(a, Capability::new(Namespace::Package).with_identity("x"));
    let cap_b = catalog.add_capability(b, Capability::new(Namespace::Package).with_identity("x"));
    let req = catalog.add_requirement(app, Requirement::new(Namespace::Package));

    let context = TableContext::new()
        .mandatory(app)
        .providers(req, vec![cap_a, cap_b]);

    let first = Resolver::new().resolve(&catalog, &context).expect("resolves");
    let second = Resolver::new().resolve(&catalog, &context).expect("resolves");
    assert_eq!(first[&app].wires, second[&app].wires);
    assert_eq!(first[&app].wires[0].capability, cap_a, "preference order kept");
}

/// The context ranks execution environments newest first; the wire follows
/// that order.
#[test]
fn execution_environment_prefers_the_context_order() {
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let jre17 = catalog.add_resource("jre-17");
    let jre11 = catalog.add_resource("jre-11");

    let ee17 = catalog.add_capability(
        jre17,
        Capability::new(Namespace::ExecutionEnvironment)
            .with_identity("JavaSE")
            .with_attr("version", 17i64),
    );
    let ee11 = catalog.add_capability(
        jre11,
        Capability::new(Namespace::ExecutionEnvironment)
            .with_identity("JavaSE")
            .with_attr("version", 11i64),
    );
    let ee_req = catalog.add_requirement(app, Requirement::new(Namespace::ExecutionEnvironment));

    let context = TableContext::new()
        .mandatory(app)
        .providers(ee_req, vec![ee17, ee11]);

    let wirings = Resolver::new().resolve(&catalog, &context).expect("resolves");
    let wire = wirings[&app].wires_for(ee_req).next().expect("ee wire");
    assert_eq!(wire.capability, ee17);
    assert_eq!(wire.provider, jre17);
}

#[test]
fn cancellation_surfaces_as_cancelled() {
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let mut context = TableContext::new().mandatory(app);
    context.cancel_immediately = true;

    let error = Resolver::new()
        .resolve(&catalog, &context)
        .expect_err("cancelled up front");
    assert!(error.is_cancelled());
}

/// Cancellation fired while the call is already underway, from inside a
/// provider lookup, aborts at the next checkpoint instead of running the call
/// to completion.
#[test]
fn cancellation_mid_resolve_aborts_promptly() {
    let mut catalog = Catalog::new();
    let app = catalog.add_resource("app");
    let lib = catalog.add_resource("lib");
    let lib_cap = catalog.add_capability(
        lib,
        Capability::new(Namespace::Package).with_identity("lib.api"),
    );
    let app_req = catalog.add_requirement(app, Requirement::new(Namespace::Package));

    let mut context = TableContext::new()
        .mandatory(app)
        .providers(app_req, vec![lib_cap]);
    context.cancel_on_lookup = true;

    let error = Resolver::new()
        .resolve(&catalog, &context)
        .expect_err("cancelled mid-resolve");
    assert!(error.is_cancelled());
}
