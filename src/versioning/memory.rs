use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::{MetadataStore, Source, SourceVersion, StoreError, VersionStatus, VersionUpdate};

#[derive(Debug, Default)]
struct Tables {
    sources: HashMap<String, Source>,
    versions: Vec<SourceVersion>,
}

/// Process-local [`MetadataStore`] for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a source record.
    pub fn register_source(&self, source: Source) {
        if let Ok(mut t) = self.tables.lock() {
            t.sources.insert(source.id.clone(), source);
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("metadata lock poisoned".to_string()))
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn get_source(&self, source_id: &str) -> Result<Source, StoreError> {
        self.lock()?
            .sources
            .get(source_id)
            .cloned()
            .ok_or_else(|| StoreError::SourceNotFound(source_id.to_string()))
    }

    async fn insert_version(&self, version: &SourceVersion) -> Result<(), StoreError> {
        let mut t = self.lock()?;
        if !t.sources.contains_key(&version.source_id) {
            return Err(StoreError::SourceNotFound(version.source_id.clone()));
        }
        if let Some(p) = t
            .versions
            .iter()
            .find(|v| v.source_id == version.source_id && v.status == VersionStatus::Pending)
        {
            return Err(StoreError::PendingExists {
                source_id: p.source_id.clone(),
                version: p.version,
            });
        }
        t.versions.push(version.clone());
        Ok(())
    }

    async fn update_version(&self, version_id: Uuid, update: &VersionUpdate) -> Result<(), StoreError> {
        let mut t = self.lock()?;
        let v = t
            .versions
            .iter_mut()
            .find(|v| v.id == version_id)
            .ok_or(StoreError::VersionNotFound(version_id))?;
        if !v.status.can_become(update.status) {
            return Err(StoreError::IllegalTransition {
                id: version_id,
                from: v.status,
                to: update.status,
            });
        }
        v.status = update.status;
        v.metrics = update.metrics;
        v.error_message = update.error_message.clone();
        Ok(())
    }

    async fn update_current_version(&self, source_id: &str, version: u32) -> Result<(), StoreError> {
        let mut t = self.lock()?;
        let is_active = t
            .versions
            .iter()
            .any(|v| v.source_id == source_id && v.version == version && v.status == VersionStatus::Active);
        let source = t
            .sources
            .get_mut(source_id)
            .ok_or_else(|| StoreError::SourceNotFound(source_id.to_string()))?;
        let invalid = |reason| StoreError::InvalidCurrentVersion {
            source_id: source_id.to_string(),
            version,
            reason,
        };
        if version <= source.current_version {
            return Err(invalid("current_version only increases"));
        }
        if !is_active {
            return Err(invalid("version is not active"));
        }
        source.current_version = version;
        Ok(())
    }

    async fn update_extraction_query(&self, source_id: &str, query: &str) -> Result<(), StoreError> {
        let mut t = self.lock()?;
        let source = t
            .sources
            .get_mut(source_id)
            .ok_or_else(|| StoreError::SourceNotFound(source_id.to_string()))?;
        source.extraction_query = Some(query.to_string());
        Ok(())
    }

    async fn list_versions(&self, source_id: &str) -> Result<Vec<SourceVersion>, StoreError> {
        Ok(self
            .lock()?
            .versions
            .iter()
            .filter(|v| v.source_id == source_id)
            .cloned()
            .collect())
    }
}
