//! ==============================================================================
//! cache.rs - asset and requirement caches
//! ==============================================================================
//!
//! purpose:
//!     two independent stores, each behind its own lock. no lock is held
//!     across an await point and readers get copies.
//!
//! relationships:
//!     - filled by cache_manager.rs from the geo query
//!     - kept current by observer.rs from the ledger event streams
//!     - read by operator.rs when it builds reading schedules
//!
//! ==============================================================================

use crate::domain::Requirement;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// asset ids currently in range of this device
#[derive(Default)]
pub struct AssetCache {
    assets: Mutex<BTreeSet<String>>,
}

impl AssetCache {
    pub fn flush(&self) {
        self.assets.lock().clear();
    }

    /// returns true when the asset was not cached yet
    pub fn put(&self, asset_id: &str) -> bool {
        self.assets.lock().insert(asset_id.to_string())
    }

    pub fn remove(&self, asset_id: &str) -> bool {
        self.assets.lock().remove(asset_id)
    }

    pub fn exists(&self, asset_id: &str) -> bool {
        self.assets.lock().contains(asset_id)
    }

    pub fn list(&self) -> Vec<String> {
        self.assets.lock().iter().cloned().collect()
    }
}

/// requirement id -> requirement
#[derive(Default)]
pub struct RequirementCache {
    requirements: Mutex<BTreeMap<String, Requirement>>,
}

impl RequirementCache {
    pub fn flush(&self) {
        self.requirements.lock().clear();
    }

    /// store `requirement`, replacing (never merging) any prior value
    pub fn put(&self, requirement: Requirement) -> Requirement {
        let stored = requirement.clone();
        self.requirements.lock().insert(requirement.id.clone(), requirement);
        stored
    }

    pub fn get(&self, id: &str) -> Option<Requirement> {
        self.requirements.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Requirement> {
        self.requirements.lock().remove(id)
    }

    pub fn list(&self) -> Vec<Requirement> {
        self.requirements.lock().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.requirements.lock().keys().cloned().collect()
    }

    /// requirements attached to one asset
    pub fn for_asset(&self, asset_id: &str) -> Vec<Requirement> {
        self.requirements
            .lock()
            .values()
            .filter(|r| r.asset_id == asset_id)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct Cache {
    pub assets: AssetCache,
    pub requirements: RequirementCache,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }
}
