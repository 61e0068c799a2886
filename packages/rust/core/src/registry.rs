//! In-memory job table: lifecycle status and cancellation handles.
//!
//! Each entry belongs to one job; the table only serializes access to the map
//! itself. Status changes go through [`JobStatus::can_transition_to`], so a job
//! reaches exactly one terminal state.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info};

use webapk_shared::{
    ArtifactInfo, JobId, JobRecord, JobStatus, ProjectSettings, Result, WebApkError,
};

use crate::invoker::CancelSignal;
use crate::layout::JobPaths;

struct JobEntry {
    record: JobRecord,
    paths: JobPaths,
    cancel: watch::Sender<Option<String>>,
}

/// Registry of every job accepted by this process.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job in `Staging`. Returns its cancellation signal.
    pub fn insert(&self, job_id: JobId, settings: ProjectSettings, paths: JobPaths) -> CancelSignal {
        let (cancel, signal) = watch::channel(None);
        let record = JobRecord {
            id: job_id,
            settings,
            status: JobStatus::Staging,
            error_kind: None,
            error: None,
            artifact: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.write().insert(
            job_id,
            JobEntry {
                record,
                paths,
                cancel,
            },
        );
        signal
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.read().contains_key(&job_id)
    }

    pub fn status(&self, job_id: JobId) -> Option<JobStatus> {
        self.read().get(&job_id).map(|e| e.record.status)
    }

    /// Copy of the job's current record.
    pub fn record(&self, job_id: JobId) -> Option<JobRecord> {
        self.read().get(&job_id).map(|e| e.record.clone())
    }

    pub fn paths(&self, job_id: JobId) -> Option<JobPaths> {
        self.read().get(&job_id).map(|e| e.paths.clone())
    }

    /// Move a job to the next non-terminal stage.
    pub fn advance(&self, job_id: JobId, next: JobStatus) -> Result<()> {
        let mut jobs = self.write();
        let entry = jobs
            .get_mut(&job_id)
            .ok_or_else(|| WebApkError::not_found(format!("job {job_id}")))?;

        let current = entry.record.status;
        if next.is_terminal() || !current.can_transition_to(next) {
            return Err(WebApkError::validation(format!(
                "job {job_id}: illegal transition {current} -> {next}"
            )));
        }
        entry.record.status = next;
        debug!(%job_id, from = %current, to = %next, "job advanced");
        Ok(())
    }

    /// Mark a `Building` job `Ready`. Returns the final record, or `None` if
    /// the job was not in a state that can succeed.
    pub fn finish_ready(&self, job_id: JobId, artifact: ArtifactInfo) -> Option<JobRecord> {
        self.finish(job_id, JobStatus::Ready, |record| {
            record.artifact = Some(artifact);
        })
    }

    /// Mark a job `Failed`. Returns the final record, or `None` if it was
    /// already terminal.
    pub fn finish_failed(&self, job_id: JobId, error: &WebApkError) -> Option<JobRecord> {
        self.finish(job_id, JobStatus::Failed, |record| {
            record.error_kind = Some(error.kind().to_string());
            record.error = Some(error.summary());
        })
    }

    fn finish(
        &self,
        job_id: JobId,
        terminal: JobStatus,
        fill: impl FnOnce(&mut JobRecord),
    ) -> Option<JobRecord> {
        let mut jobs = self.write();
        let entry = jobs.get_mut(&job_id)?;
        if !entry.record.status.can_transition_to(terminal) {
            return None;
        }

        entry.record.status = terminal;
        entry.record.finished_at = Some(Utc::now());
        fill(&mut entry.record);
        info!(%job_id, status = %terminal, "job finished");
        Some(entry.record.clone())
    }

    /// Request cancellation. `Ok(false)` if the job is already terminal.
    pub fn cancel(&self, job_id: JobId, reason: &str) -> Result<bool> {
        let jobs = self.read();
        let entry = jobs
            .get(&job_id)
            .ok_or_else(|| WebApkError::not_found(format!("job {job_id}")))?;

        if entry.record.status.is_terminal() {
            return Ok(false);
        }
        entry.cancel.send_replace(Some(reason.to_string()));
        info!(%job_id, reason, "cancellation requested");
        Ok(true)
    }

    /// Drop a terminal job from the table. `Ok(false)` for unknown jobs.
    pub fn forget(&self, job_id: JobId) -> Result<bool> {
        let mut jobs = self.write();
        let Some(entry) = jobs.get(&job_id) else {
            return Ok(false);
        };
        let status = entry.record.status;
        if !status.is_terminal() {
            return Err(WebApkError::validation(format!(
                "job {job_id} is still {status}"
            )));
        }
        jobs.remove(&job_id);
        debug!(%job_id, "job forgotten");
        Ok(true)
    }

    /// Number of jobs not yet terminal.
    pub fn active(&self) -> usize {
        self.read()
            .values()
            .filter(|e| !e.record.status.is_terminal())
            .count()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}
