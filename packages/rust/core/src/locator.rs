//! Artifact locator: job identifier → published build artifact.
//!
//! Jobs known to the running pipeline are resolved from the registry. Jobs
//! from an earlier process are resolved from the `job.json` record left in
//! their output directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use webapk_shared::{
    JOB_RECORD_FILE, JobId, JobRecord, JobStatus, PipelineConfig, Result, WebApkError,
};

use crate::fsutil;
use crate::layout::JobPaths;
use crate::registry::JobRegistry;

/// Resolves job identifiers to artifact files and retrieval locators.
#[derive(Clone)]
pub struct ArtifactLocator {
    output_dir: PathBuf,
    artifact_name: String,
    download_base: String,
    registry: Option<Arc<JobRegistry>>,
}

impl ArtifactLocator {
    /// Locator backed only by the records on disk.
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            artifact_name: config.artifact_name.clone(),
            download_base: config.download_base.clone(),
            registry: None,
        }
    }

    /// Locator that consults a live registry before the disk.
    pub fn with_registry(config: &PipelineConfig, registry: Arc<JobRegistry>) -> Self {
        Self {
            registry: Some(registry),
            ..Self::new(config)
        }
    }

    /// Retrieval locator handed out in `apk_ready` events.
    pub fn retrieval_url(&self, job_id: JobId) -> String {
        format!("{}/{job_id}", self.download_base)
    }

    /// Path of the artifact of a `Ready` job.
    pub fn locate(&self, job_id: JobId) -> Result<PathBuf> {
        let status = match self.registry.as_ref().and_then(|r| r.status(job_id)) {
            Some(status) => status,
            None => self.read_record(job_id)?.status,
        };

        if status != JobStatus::Ready {
            return Err(WebApkError::not_found(format!(
                "job {job_id} is {status}, no artifact available"
            )));
        }

        let path = self.output_dir.join(job_id.to_string()).join(&self.artifact_name);
        if !path.is_file() {
            return Err(WebApkError::not_found(format!(
                "artifact for job {job_id} is missing from {}",
                path.display()
            )));
        }

        debug!(%job_id, path = %path.display(), "artifact located");
        Ok(path)
    }

    /// [`locate`](Self::locate) for a raw identifier from a download request.
    /// Malformed identifiers are unknown jobs.
    pub fn locate_str(&self, raw: &str) -> Result<PathBuf> {
        let job_id: JobId = raw
            .parse()
            .map_err(|_| WebApkError::not_found(format!("unknown job '{raw}'")))?;
        self.locate(job_id)
    }

    /// Read the persisted record of a finished job.
    pub fn read_record(&self, job_id: JobId) -> Result<JobRecord> {
        let path = self.output_dir.join(job_id.to_string()).join(JOB_RECORD_FILE);
        read_record_at(&path, job_id)
    }
}

/// Persist a job's record next to its output.
pub fn write_record(paths: &JobPaths, record: &JobRecord) -> Result<()> {
    std::fs::create_dir_all(&paths.output).map_err(|e| WebApkError::io(&paths.output, e))?;
    fsutil::write_json(&paths.record(), record)
}

fn read_record_at(path: &Path, job_id: JobId) -> Result<JobRecord> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(WebApkError::not_found(format!("unknown job {job_id}")));
        }
        Err(e) => return Err(WebApkError::io(path, e)),
    };
    serde_json::from_str(&content).map_err(|e| {
        WebApkError::validation(format!("invalid job record {}: {e}", path.display()))
    })
}
