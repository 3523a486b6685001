use std::collections::HashMap;

/// Stable string identifier for a managed device, e.g. `imx8mm-evk-sh11`.
/// Immutable for the process lifetime; the set of valid ids is fixed at
/// startup by [`ResourceRegistry`].
pub type ResourceId = String;

/// Stable string identifier for a registered framework plugin, e.g. `lava`.
pub type FrameworkId = String;

/// Stable identifier for a job inside a framework's own queue.
pub type JobId = String;

/// A single managed device: immutable attributes sourced from config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: ResourceId,
    pub farm_type: String,
    pub device_type: String,
}

/// Immutable mapping: resource -> (farm_type, device_type), plus the
/// farm-type index used by status queries. Built once at config load and
/// never mutated afterward — membership of the managed set never changes
/// for the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    resources: HashMap<ResourceId, Resource>,
    by_farm_type: HashMap<String, Vec<ResourceId>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<ResourceId>, farm_type: impl Into<String>, device_type: impl Into<String>) {
        let id = id.into();
        let farm_type = farm_type.into();
        let device_type = device_type.into();

        self.by_farm_type
            .entry(farm_type.clone())
            .or_default()
            .push(id.clone());

        self.resources.insert(
            id.clone(),
            Resource {
                id,
                farm_type,
                device_type,
            },
        );
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn device_type_of(&self, id: &str) -> Option<&str> {
        self.resources.get(id).map(|r| r.device_type.as_str())
    }

    pub fn farm_type_of(&self, id: &str) -> Option<&str> {
        self.resources.get(id).map(|r| r.farm_type.as_str())
    }

    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.resources.keys()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn resources_in_farm(&self, farm_type: &str) -> &[ResourceId] {
        self.by_farm_type
            .get(farm_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
