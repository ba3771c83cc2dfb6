//! In-memory implementation of the storage traits.
//!
//! Used by the CLI when no database is configured and throughout the tests.
//! Everything lives behind `Arc<RwLock<_>>`, so clones share state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use crate::error::AppError;
use crate::job::ScrapeJob;
use crate::merge::AddressKey;
use crate::models::NormalizedProperty;
use crate::traits::{JobStore, PropertyStore};

#[derive(Clone, Default)]
pub struct MemoryStore {
    properties: Arc<RwLock<HashMap<Uuid, NormalizedProperty>>>,
    jobs: Arc<RwLock<HashMap<Uuid, ScrapeJob>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property_count(&self) -> usize {
        read(&self.properties).len()
    }

    pub fn properties(&self) -> Vec<NormalizedProperty> {
        read(&self.properties).values().cloned().collect()
    }

    pub fn jobs(&self) -> Vec<ScrapeJob> {
        read(&self.jobs).values().cloned().collect()
    }
}

impl PropertyStore for MemoryStore {
    async fn find_by_mls(&self, mls_number: &str) -> Result<Option<NormalizedProperty>, AppError> {
        Ok(read(&self.properties)
            .values()
            .find(|p| p.mls_number.as_deref() == Some(mls_number))
            .cloned())
    }

    async fn find_by_address(
        &self,
        key: &AddressKey,
    ) -> Result<Option<NormalizedProperty>, AppError> {
        Ok(read(&self.properties)
            .values()
            .find(|p| AddressKey::of(&p.address) == *key)
            .cloned())
    }

    async fn upsert(&self, property: &NormalizedProperty) -> Result<(), AppError> {
        write(&self.properties).insert(property.id, property.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<NormalizedProperty>, AppError> {
        Ok(read(&self.properties).get(&id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<NormalizedProperty>, AppError> {
        let mut all = self.properties();
        all.sort_by(|a, b| b.last_scraped_at.cmp(&a.last_scraped_at));
        all.truncate(limit);
        Ok(all)
    }
}

impl JobStore for MemoryStore {
    async fn save_job(&self, job: &ScrapeJob) -> Result<(), AppError> {
        write(&self.jobs).insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ScrapeJob>, AppError> {
        Ok(read(&self.jobs).get(&id).cloned())
    }

    async fn list_unfinished(&self) -> Result<Vec<ScrapeJob>, AppError> {
        let mut jobs: Vec<_> = read(&self.jobs)
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
