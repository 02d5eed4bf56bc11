//! Filesystem blob stage.
//!
//! Layout: `<root>/<job_id>/<filename>`, one file per job directory. Blobs
//! survive restarts, so an upload staged by a request can be picked up later
//! by the executor.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use portage_core::JobId;
use portage_migration::{BlobError, BlobStage};

#[derive(Debug, Clone)]
pub struct FsBlobStage {
    root: PathBuf,
}

impl FsBlobStage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// The single file staged for a job, if any.
    fn staged_file(&self, job_id: JobId) -> io::Result<Option<PathBuf>> {
        let entries = match fs::read_dir(self.job_dir(job_id)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }
}

fn check_name(filename: &str) -> Result<(), BlobError> {
    let bad = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\', '\0']);
    if bad {
        Err(BlobError::InvalidName(filename.to_string()))
    } else {
        Ok(())
    }
}

fn io_error(job_id: JobId) -> impl FnOnce(io::Error) -> BlobError {
    move |source| BlobError::Io { job_id, source }
}

fn remove_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl BlobStage for FsBlobStage {
    fn put(&self, job_id: JobId, filename: &str, bytes: &[u8]) -> Result<(), BlobError> {
        check_name(filename)?;
        let dir = self.job_dir(job_id);

        remove_dir(&dir).map_err(io_error(job_id))?;
        fs::create_dir_all(&dir).map_err(io_error(job_id))?;
        fs::write(dir.join(filename), bytes).map_err(io_error(job_id))?;

        debug!(job_id = %job_id, file = filename, bytes = bytes.len(), "blob staged");
        Ok(())
    }

    fn get(&self, job_id: JobId) -> Result<Option<Vec<u8>>, BlobError> {
        match self.staged_file(job_id).map_err(io_error(job_id))? {
            Some(path) => fs::read(path).map(Some).map_err(io_error(job_id)),
            None => Ok(None),
        }
    }

    fn contains(&self, job_id: JobId, filename: &str) -> Result<bool, BlobError> {
        check_name(filename)?;
        Ok(self.job_dir(job_id).join(filename).is_file())
    }

    fn delete(&self, job_id: JobId) -> Result<(), BlobError> {
        remove_dir(&self.job_dir(job_id)).map_err(io_error(job_id))?;
        debug!(job_id = %job_id, "blob released");
        Ok(())
    }
}
