//! Catalog arena for resources, capabilities and requirements.
//!
//! The graph the resolver works on is caller-owned and immutable for the
//! duration of one resolve call. Identity is arena identity: the id newtypes
//! are plain indices, cheap to copy and hash, and two capabilities are "the
//! same" exactly when their ids are equal.

use crate::namespace::Namespace;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a resource within a [`Catalog`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ResourceId(pub u32);

/// Identifies a capability within a [`Catalog`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CapabilityId(pub u32);

/// Identifies a requirement within a [`Catalog`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RequirementId(pub u32);

/// Attribute value of a capability. Closed set; the core never parses text
/// into these, callers build them directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<AttrValue>),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(s) => f.write_str(s),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Float(x) => write!(f, "{}", x),
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::List(items) => {
                let mut first = true;
                for item in items {
                    if !first {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<f64> for AttrValue {
    fn from(x: f64) -> Self {
        AttrValue::Float(x)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

/// Whether a requirement must be satisfied for its resource to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Resolution {
    #[default]
    Mandatory,
    Optional,
    /// Only considered by the dynamic entry point; skipped during normal
    /// resolution regardless of the context's effectiveness test.
    Dynamic,
}

/// How many wires a requirement accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Cardinality {
    #[default]
    Single,
    Multiple,
}

/// A named, attributed fact a resource provides.
///
/// Build with [`Capability::new`] and the `with_*` methods, then register via
/// [`Catalog::add_capability`], which fixes the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    owner: ResourceId,
    namespace: Namespace,
    attributes: IndexMap<String, AttrValue>,
    directives: IndexMap<String, String>,
}

impl Capability {
    pub fn new(namespace: Namespace) -> Self {
        Capability {
            owner: ResourceId(u32::MAX),
            namespace,
            attributes: IndexMap::new(),
            directives: IndexMap::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_directive(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.directives.insert(key.into(), value.into());
        self
    }

    /// Shorthand for setting the identity attribute of this capability's
    /// namespace.
    pub fn with_identity(self, value: impl Into<String>) -> Self {
        let key = self.namespace.key().to_string();
        self.with_attr(key, AttrValue::Str(value.into()))
    }

    pub fn owner(&self) -> ResourceId {
        self.owner
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn attributes(&self) -> &IndexMap<String, AttrValue> {
        &self.attributes
    }

    pub fn directives(&self) -> &IndexMap<String, String> {
        &self.directives
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    /// Raw `uses` directive, if any.
    pub fn uses_directive(&self) -> Option<&str> {
        self.directives.get("uses").map(String::as_str)
    }

    /// Identity value: the attribute named after the namespace key,
    /// stringified.
    pub fn identity(&self) -> Option<String> {
        self.attributes
            .get(self.namespace.key())
            .map(|v| v.to_string())
    }
}

/// A named need a resource declares against other resources' capabilities.
///
/// The match predicate itself is not stored here; it belongs to the resolve
/// context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    owner: ResourceId,
    namespace: Namespace,
    resolution: Resolution,
    cardinality: Cardinality,
    effective: String,
    directives: IndexMap<String, String>,
}

impl Requirement {
    pub fn new(namespace: Namespace) -> Self {
        Requirement {
            owner: ResourceId(u32::MAX),
            namespace,
            resolution: Resolution::Mandatory,
            cardinality: Cardinality::Single,
            effective: "resolve".to_string(),
            directives: IndexMap::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.resolution = Resolution::Optional;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.resolution = Resolution::Dynamic;
        self
    }

    pub fn multiple(mut self) -> Self {
        self.cardinality = Cardinality::Multiple;
        self
    }

    pub fn with_effective(mut self, effective: impl Into<String>) -> Self {
        self.effective = effective.into();
        self
    }

    pub fn with_directive(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.directives.insert(key.into(), value.into());
        self
    }

    pub fn owner(&self) -> ResourceId {
        self.owner
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn effective(&self) -> &str {
        &self.effective
    }

    pub fn directives(&self) -> &IndexMap<String, String> {
        &self.directives
    }

    pub fn is_optional(&self) -> bool {
        self.resolution == Resolution::Optional
    }

    pub fn is_dynamic(&self) -> bool {
        self.resolution == Resolution::Dynamic
    }

    pub fn is_multiple(&self) -> bool {
        self.cardinality == Cardinality::Multiple
    }

    /// Aggregate requirements with `visibility:=reexport` chain the provider's
    /// exclusive capabilities onward to the requirer's own dependents.
    pub fn is_reexport(&self) -> bool {
        self.directives.get("visibility").map(String::as_str) == Some("reexport")
    }
}

/// A resource: opaque identity plus ordered capability and requirement lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    name: String,
    capabilities: Vec<CapabilityId>,
    requirements: Vec<RequirementId>,
}

impl Resource {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &[CapabilityId] {
        &self.capabilities
    }

    pub fn requirements(&self) -> &[RequirementId] {
        &self.requirements
    }
}

/// A capability paired with the resource it is observed on.
///
/// For a declared capability the provider is the declaring resource. A hosted
/// capability (fragment attachment) is the same declared capability with the
/// host as provider: the pair identity makes two hostings of one capability
/// distinct candidates, while one capability reached via independent paths
/// stays substitutable with itself.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Candidate {
    pub capability: CapabilityId,
    pub provider: ResourceId,
}

impl Candidate {
    pub fn hosted(capability: CapabilityId, host: ResourceId) -> Self {
        Candidate {
            capability,
            provider: host,
        }
    }

    /// Whether the provider differs from the declaring resource.
    pub fn is_hosted(&self, catalog: &Catalog) -> bool {
        catalog.capability(self.capability).owner() != self.provider
    }
}

/// An accepted (requirer, requirement, provider, capability) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Wire {
    pub requirer: ResourceId,
    pub requirement: RequirementId,
    pub provider: ResourceId,
    pub capability: CapabilityId,
}

/// Arena holding the whole resource graph for one or more resolve calls.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    resources: Vec<Resource>,
    capabilities: Vec<Capability>,
    requirements: Vec<Requirement>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    pub fn add_resource(&mut self, name: impl Into<String>) -> ResourceId {
        let id = ResourceId(self.resources.len() as u32);
        self.resources.push(Resource {
            name: name.into(),
            capabilities: Vec::new(),
            requirements: Vec::new(),
        });
        id
    }

    pub fn add_capability(&mut self, owner: ResourceId, mut capability: Capability) -> CapabilityId {
        let id = CapabilityId(self.capabilities.len() as u32);
        capability.owner = owner;
        self.capabilities.push(capability);
        self.resources[owner.0 as usize].capabilities.push(id);
        id
    }

    pub fn add_requirement(
        &mut self,
        owner: ResourceId,
        mut requirement: Requirement,
    ) -> RequirementId {
        let id = RequirementId(self.requirements.len() as u32);
        requirement.owner = owner;
        self.requirements.push(requirement);
        self.resources[owner.0 as usize].requirements.push(id);
        id
    }

    pub fn resource(&self, id: ResourceId) -> &Resource {
        &self.resources[id.0 as usize]
    }

    pub fn capability(&self, id: CapabilityId) -> &Capability {
        &self.capabilities[id.0 as usize]
    }

    pub fn requirement(&self, id: RequirementId) -> &Requirement {
        &self.requirements[id.0 as usize]
    }

    pub fn resources(&self) -> impl Iterator<Item = ResourceId> + '_ {
        (0..self.resources.len() as u32).map(ResourceId)
    }

    /// Candidate for a capability observed on its declaring resource.
    pub fn declared(&self, capability: CapabilityId) -> Candidate {
        Candidate {
            capability,
            provider: self.capability(capability).owner(),
        }
    }

    /// Identity value of a capability, if it carries one.
    pub fn identity_of(&self, capability: CapabilityId) -> Option<String> {
        self.capability(capability).identity()
    }

    /// A fragment is a resource with a requirement in an `Attach` namespace.
    pub fn is_fragment(&self, resource: ResourceId) -> bool {
        self.host_requirement(resource).is_some()
    }

    pub fn host_requirement(&self, resource: ResourceId) -> Option<RequirementId> {
        self.resource(resource)
            .requirements()
            .iter()
            .copied()
            .find(|r| self.requirement(*r).namespace() == Namespace::Host)
    }

    /// Diagnostic label used in error messages and logs.
    pub fn label(&self, resource: ResourceId) -> &str {
        self.resource(resource).name()
    }
}
