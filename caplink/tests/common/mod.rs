use caplink::{
    CancelFlag, CapabilityId, RequirementId, ResolveContext, ResourceId, Wirings,
};
use std::collections::HashMap;
use std::sync::Mutex;

/// Table-driven context: provider lists are spelled out per requirement, most
/// preferred first, exactly as a real repository index would rank them.
#[derive(Default)]
pub struct TableContext {
    pub mandatory: Vec<ResourceId>,
    pub optional: Vec<ResourceId>,
    pub related: HashMap<ResourceId, Vec<ResourceId>>,
    pub providers: HashMap<RequirementId, Vec<CapabilityId>>,
    pub wired: Wirings,
    pub cancel_immediately: bool,
    /// Flip the flag from inside a provider lookup, mid-resolve.
    pub cancel_on_lookup: bool,
    pub flag: Mutex<Option<CancelFlag>>,
}

impl TableContext {
    pub fn new() -> Self {
        TableContext::default()
    }

    pub fn mandatory(mut self, resource: ResourceId) -> Self {
        self.mandatory.push(resource);
        self
    }

    pub fn optional(mut self, resource: ResourceId) -> Self {
        self.optional.push(resource);
        self
    }

    pub fn providers(
        mut self,
        requirement: RequirementId,
        capabilities: Vec<CapabilityId>,
    ) -> Self {
        self.providers.insert(requirement, capabilities);
        self
    }
}

impl ResolveContext for TableContext {
    fn mandatory_resources(&self) -> Vec<ResourceId> {
        self.mandatory.clone()
    }

    fn optional_resources(&self) -> Vec<ResourceId> {
        self.optional.clone()
    }

    fn related_resources(&self, resource: ResourceId) -> Vec<ResourceId> {
        self.related.get(&resource).cloned().unwrap_or_default()
    }

    fn find_providers(&self, requirement: RequirementId) -> Vec<CapabilityId> {
        if self.cancel_on_lookup {
            if let Some(flag) = self.flag.lock().unwrap().as_ref() {
                flag.cancel();
            }
        }
        self.providers.get(&requirement).cloned().unwrap_or_default()
    }

    fn matches(&self, requirement: RequirementId, capability: CapabilityId) -> bool {
        self.providers
            .get(&requirement)
            .map(|caps| caps.contains(&capability))
            .unwrap_or(false)
    }

    fn wirings(&self) -> Wirings {
        self.wired.clone()
    }

    fn on_cancel(&self, flag: CancelFlag) {
        if self.cancel_immediately {
            flag.cancel();
        }
        *self.flag.lock().unwrap() = Some(flag);
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
