// src/core/registry.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::core::adapter::ToolAdapter;
use crate::core::models::Phase;

/// Phase-keyed table of adapters. Registration order is execution (queue) order.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    by_phase: BTreeMap<Phase, Vec<Arc<dyn ToolAdapter>>>,
    required: Vec<String>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under every phase it declares. An adapter with the
    /// same id already registered for a phase is replaced in place.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        for phase in adapter.phases() {
            let slot = self.by_phase.entry(*phase).or_default();
            match slot.iter().position(|a| a.id() == adapter.id()) {
                Some(idx) => slot[idx] = Arc::clone(&adapter),
                None => slot.push(Arc::clone(&adapter)),
            }
            debug!(adapter = adapter.id(), phase = %phase, "Adapter registered.");
        }
        if adapter.required() && !self.required.iter().any(|r| r == adapter.id()) {
            self.required.push(adapter.id().to_string());
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ToolAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Removes an adapter from every phase. Returns whether anything was removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let mut removed = false;
        for adapters in self.by_phase.values_mut() {
            let before = adapters.len();
            adapters.retain(|a| a.id() != id);
            removed |= adapters.len() != before;
        }
        self.required.retain(|r| r != id);
        if removed {
            info!(adapter = id, "Adapter removed.");
        }
        removed
    }

    /// Marks an already registered (or future) adapter id as required.
    pub fn require(&mut self, id: &str) {
        if !self.required.iter().any(|r| r == id) {
            self.required.push(id.to_string());
        }
    }

    pub fn adapters_for(&self, phase: Phase) -> Vec<Arc<dyn ToolAdapter>> {
        self.by_phase.get(&phase).cloned().unwrap_or_default()
    }

    /// Required adapter ids among those registered for `phase`.
    pub fn required_for(&self, phase: Phase) -> Vec<String> {
        self.adapters_for(phase)
            .iter()
            .filter(|a| self.required.iter().any(|r| r == a.id()))
            .map(|a| a.id().to_string())
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_phase.values().flatten().any(|a| a.id() == id)
    }

    pub fn list_ids(&self, phase: Phase) -> Vec<String> {
        self.adapters_for(phase).iter().map(|a| a.id().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adapter::{AdapterContext, AdapterOutcome};
    use async_trait::async_trait;

    struct Named {
        id: &'static str,
        phases: Vec<Phase>,
        required: bool,
    }

    #[async_trait]
    impl ToolAdapter for Named {
        fn id(&self) -> &str {
            self.id
        }
        fn phases(&self) -> &[Phase] {
            &self.phases
        }
        fn required(&self) -> bool {
            self.required
        }
        async fn execute(&self, _ctx: AdapterContext) -> AdapterOutcome {
            AdapterOutcome::Success(Vec::new())
        }
    }

    fn named(id: &'static str, phases: &[Phase], required: bool) -> Arc<dyn ToolAdapter> {
        Arc::new(Named { id, phases: phases.to_vec(), required })
    }

    #[test]
    fn registers_by_phase_in_order() {
        let registry = AdapterRegistry::new()
            .with_adapter(named("b", &[Phase::Discovery], false))
            .with_adapter(named("a", &[Phase::Discovery, Phase::VulnScanning], true));

        assert_eq!(registry.list_ids(Phase::Discovery), vec!["b", "a"]);
        assert_eq!(registry.list_ids(Phase::VulnScanning), vec!["a"]);
        assert!(registry.adapters_for(Phase::PortScanning).is_empty());
        assert_eq!(registry.required_for(Phase::Discovery), vec!["a"]);
    }

    #[test]
    fn replaces_and_removes() {
        let mut registry = AdapterRegistry::new().with_adapter(named("a", &[Phase::Discovery], false));
        registry.register(named("a", &[Phase::Discovery], false));
        assert_eq!(registry.list_ids(Phase::Discovery), vec!["a"]);

        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.adapters_for(Phase::Discovery).is_empty());
    }
}
