use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use portage_core::JobId;
use portage_migration::{BlobError, BlobStage};

#[derive(Debug, Clone)]
struct StagedBlob {
    filename: String,
    bytes: Vec<u8>,
}

/// In-memory blob stage for tests/dev. Contents do not survive the process.
#[derive(Debug, Default)]
pub struct InMemoryBlobStage {
    blobs: RwLock<HashMap<JobId, StagedBlob>>,
}

impl InMemoryBlobStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Name of the blob staged for a job.
    pub fn filename(&self, job_id: JobId) -> Option<String> {
        self.blobs
            .read()
            .unwrap()
            .get(&job_id)
            .map(|b| b.filename.clone())
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStage for InMemoryBlobStage {
    fn put(&self, job_id: JobId, filename: &str, bytes: &[u8]) -> Result<(), BlobError> {
        if filename.is_empty() {
            return Err(BlobError::InvalidName(filename.to_string()));
        }
        self.blobs.write().unwrap().insert(
            job_id,
            StagedBlob {
                filename: filename.to_string(),
                bytes: bytes.to_vec(),
            },
        );
        Ok(())
    }

    fn get(&self, job_id: JobId) -> Result<Option<Vec<u8>>, BlobError> {
        Ok(self.blobs.read().unwrap().get(&job_id).map(|b| b.bytes.clone()))
    }

    fn contains(&self, job_id: JobId, filename: &str) -> Result<bool, BlobError> {
        Ok(self
            .blobs
            .read()
            .unwrap()
            .get(&job_id)
            .is_some_and(|b| b.filename == filename))
    }

    fn delete(&self, job_id: JobId) -> Result<(), BlobError> {
        self.blobs.write().unwrap().remove(&job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_replaces_and_delete_releases() {
        let stage = InMemoryBlobStage::new();
        let job_id = JobId::new();

        stage.put(job_id, "a.json", b"a").unwrap();
        stage.put(job_id, "b.json", b"b").unwrap();
        assert_eq!(stage.filename(job_id).as_deref(), Some("b.json"));
        assert!(!stage.contains(job_id, "a.json").unwrap());
        assert_eq!(stage.len(), 1);

        stage.delete(job_id).unwrap();
        assert!(stage.is_empty());
        assert_eq!(stage.get(job_id).unwrap(), None);
    }
}
