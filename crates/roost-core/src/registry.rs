use std::collections::HashMap;
use std::sync::Arc;

use crate::models::Source;
use crate::traits::ScraperAdapter;

/// Maps each source to the adapter that scrapes it.
///
/// Adding a site means implementing [`ScraperAdapter`] and registering it
/// here; the orchestrator builds one lane per registered source.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Source, Arc<dyn ScraperAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under its own source, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ScraperAdapter>) -> &mut Self {
        let source = adapter.source();
        if self.adapters.insert(source, adapter).is_some() {
            tracing::warn!(%source, "Replacing previously registered adapter");
        }
        self
    }

    pub fn with(mut self, adapter: Arc<dyn ScraperAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, source: Source) -> Option<Arc<dyn ScraperAdapter>> {
        self.adapters.get(&source).cloned()
    }

    pub fn contains(&self, source: Source) -> bool {
        self.adapters.contains_key(&source)
    }

    /// Registered sources in a stable order.
    pub fn sources(&self) -> Vec<Source> {
        let mut sources: Vec<_> = self.adapters.keys().copied().collect();
        sources.sort();
        sources
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("sources", &self.sources())
            .finish()
    }
}
