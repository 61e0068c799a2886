//! On-disk layout of a job's exclusive directories.
//!
//! ```text
//! <work_dir>/workspaces/<job_id>/   extracted upload
//! <work_dir>/instances/<job_id>/    patched template copy, build runs here
//! <output_dir>/<job_id>/            published artifact + job.json
//! ```

use std::path::{Path, PathBuf};

use webapk_shared::{JOB_RECORD_FILE, JobId, PipelineConfig};

/// Paths owned by exactly one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub workspace: PathBuf,
    pub instance: PathBuf,
    pub output: PathBuf,
}

impl JobPaths {
    pub fn new(config: &PipelineConfig, job_id: JobId) -> Self {
        Self::from_roots(&config.work_dir, &config.output_dir, job_id)
    }

    pub fn from_roots(work_dir: &Path, output_dir: &Path, job_id: JobId) -> Self {
        let id = job_id.to_string();
        Self {
            workspace: work_dir.join("workspaces").join(&id),
            instance: work_dir.join("instances").join(&id),
            output: output_dir.join(&id),
        }
    }

    pub fn record(&self) -> PathBuf {
        self.output.join(JOB_RECORD_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_keyed_by_job_id() {
        let a = JobId::new();
        let b = JobId::new();
        let pa = JobPaths::from_roots(Path::new("/w"), Path::new("/o"), a);
        let pb = JobPaths::from_roots(Path::new("/w"), Path::new("/o"), b);

        assert_eq!(pa.workspace, PathBuf::from(format!("/w/workspaces/{a}")));
        assert_eq!(pa.instance, PathBuf::from(format!("/w/instances/{a}")));
        assert_eq!(pa.record(), PathBuf::from(format!("/o/{a}/job.json")));

        assert_ne!(pa.workspace, pb.workspace);
        assert_ne!(pa.instance, pb.instance);
        assert_ne!(pa.output, pb.output);
    }
}
