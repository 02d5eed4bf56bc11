use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use portage_core::JobId;
use portage_migration::{JobRecord, JobRepository, MigrationJob, RepositoryError};

/// In-memory job repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    records: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobRepository for InMemoryJobRepository {
    fn insert(&self, job: &MigrationJob) -> Result<(), RepositoryError> {
        let mut records = self.records.write().unwrap();
        let id = job.id_typed();
        if records.contains_key(&id) {
            return Err(RepositoryError::AlreadyExists(id));
        }
        records.insert(id, job.record().clone());
        Ok(())
    }

    fn update(&self, job: &MigrationJob) -> Result<(), RepositoryError> {
        let mut records = self.records.write().unwrap();
        let id = job.id_typed();
        match records.get_mut(&id) {
            Some(stored) => {
                *stored = job.record().clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(id)),
        }
    }

    fn get(&self, id: JobId) -> Result<Option<MigrationJob>, RepositoryError> {
        Ok(self
            .records
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .map(MigrationJob::restore))
    }

    fn delete(&self, id: JobId) -> Result<bool, RepositoryError> {
        Ok(self.records.write().unwrap().remove(&id).is_some())
    }
}
