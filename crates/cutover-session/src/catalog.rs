//! Version catalog boundary.
//!
//! The catalog that publishes agent builds is an external system; the
//! orchestrator only performs read-only lookups through this trait.

use cutover_state::{AgentVersion, StateResult, StateStore};

/// Read-only lookup of published agent versions.
pub trait VersionCatalog: Send + Sync {
    fn get_version(&self, version: &str) -> StateResult<Option<AgentVersion>>;
}

/// Catalog backed by the local store's versions table.
pub struct StoreCatalog {
    store: StateStore,
}

impl StoreCatalog {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl VersionCatalog for StoreCatalog {
    fn get_version(&self, version: &str) -> StateResult<Option<AgentVersion>> {
        self.store.get_version(version)
    }
}
