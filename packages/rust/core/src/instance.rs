//! Runtime instances and the instance table.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use sourcehub_providers::SourceProvider;
use sourcehub_shared::CapabilitySet;

use crate::supervisor::{ProcessHandle, ProcessState};

/// One live provider instance, keyed by its configuration `id`.
pub struct Instance {
    id: String,
    name: String,
    provider_type: String,
    capabilities: CapabilitySet,
    provider: Arc<dyn SourceProvider>,
    process: Option<Arc<ProcessHandle>>,
}

impl Instance {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider_type: impl Into<String>,
        capabilities: CapabilitySet,
        provider: Arc<dyn SourceProvider>,
        process: Option<Arc<ProcessHandle>>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider_type: provider_type.into(),
            capabilities,
            provider,
            process,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider_type(&self) -> &str {
        &self.provider_type
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    pub fn provider(&self) -> &Arc<dyn SourceProvider> {
        &self.provider
    }

    /// Child process handle, for subprocess-backed instances.
    pub fn process(&self) -> Option<&Arc<ProcessHandle>> {
        self.process.as_ref()
    }

    /// In-process instances are always available; subprocess-backed ones
    /// while their process is alive.
    pub fn is_available(&self) -> bool {
        self.process.as_ref().is_none_or(|p| p.is_alive())
    }

    pub fn status(&self) -> InstanceStatus {
        let process = self.process.as_deref();
        InstanceStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            provider_type: self.provider_type.clone(),
            capabilities: self.capabilities,
            available: self.is_available(),
            state: process.map(|p| p.state()),
            pid: process.and_then(|p| p.pid()),
            started_at: process.map(|p| p.started_at()),
            exited_at: process.and_then(|p| p.exited_at()),
            exit_status: process.and_then(|p| p.exit_status()),
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("provider_type", &self.provider_type)
            .field("capabilities", &self.capabilities)
            .field("process", &self.process)
            .finish()
    }
}

/// Point-in-time view of an instance, for display.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: String,
    pub name: String,
    pub provider_type: String,
    pub capabilities: CapabilitySet,
    pub available: bool,
    /// `None` for in-process instances.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ProcessState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
}

/// Immutable id → instance mapping; iteration follows id order.
#[derive(Debug, Default)]
pub struct InstanceTable {
    instances: BTreeMap<String, Arc<Instance>>,
}

impl InstanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Instance>> {
        self.instances.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Instance>> {
        self.instances.values()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Insert while building a table. Returns the instance back if the id is taken.
    pub(crate) fn insert(&mut self, instance: Instance) -> Result<(), Instance> {
        if self.instances.contains_key(instance.id()) {
            return Err(instance);
        }
        self.instances
            .insert(instance.id().to_string(), Arc::new(instance));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sourcehub_providers::StaticListSource;
    use sourcehub_shared::Capability;

    fn instance(id: &str) -> Instance {
        Instance::new(
            id,
            id.to_uppercase(),
            "static_source_provider",
            CapabilitySet::empty().with(Capability::Search),
            Arc::new(StaticListSource::new(id, Vec::new())),
            None,
        )
    }

    #[test]
    fn table_iterates_in_id_order() {
        let mut table = InstanceTable::new();
        for id in ["zeta", "alpha", "mid"] {
            assert!(table.insert(instance(id)).is_ok());
        }
        let ids: Vec<&str> = table.ids().collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut table = InstanceTable::new();
        assert!(table.insert(instance("a")).is_ok());
        let rejected = table.insert(instance("a")).unwrap_err();
        assert_eq!(rejected.id(), "a");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn in_process_instance_is_always_available() {
        let inst = instance("local");
        assert!(inst.is_available());
        let status = inst.status();
        assert!(status.available);
        assert!(status.state.is_none());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["capabilities"], serde_json::json!(["search"]));
        assert!(json.get("pid").is_none());
    }
}
