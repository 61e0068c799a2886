//! Build pipeline: upload + settings → staged → patched → built → notified.
//!
//! [`Pipeline::submit`] validates the request, registers the job and returns
//! its identifier immediately; the stages then run on a background task,
//! bounded by `max_concurrent_builds`. Every job works in its own workspace
//! and template instance (see [`JobPaths`]); the template source is only ever
//! read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Semaphore, broadcast};
use tracing::{error, info, instrument, warn};

use webapk_shared::{
    BuildEvent, JobId, JobRecord, JobStatus, PipelineConfig, ProjectSettings, Result, WebApkError,
};

use crate::fsutil;
use crate::invoker::{self, BuildInvoker, BuildOutcome, CancelSignal};
use crate::layout::JobPaths;
use crate::locator::{self, ArtifactLocator};
use crate::notifier::Notifier;
use crate::patcher;
use crate::registry::JobRegistry;
use crate::stager;

/// Handle to the build pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

struct Inner {
    config: PipelineConfig,
    registry: Arc<JobRegistry>,
    notifier: Notifier,
    invoker: BuildInvoker,
    locator: ArtifactLocator,
    permits: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let inner = Inner {
            invoker: BuildInvoker::new(&config),
            locator: ArtifactLocator::with_registry(&config, Arc::clone(&registry)),
            permits: Arc::new(Semaphore::new(config.max_concurrent_builds.max(1))),
            notifier: Notifier::default(),
            registry,
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn locator(&self) -> &ArtifactLocator {
        &self.inner.locator
    }

    /// Accept a job and start it in the background.
    ///
    /// Malformed settings or a non-archive upload are rejected here with a
    /// [`WebApkError::Validation`] and no job is created. Must be called from
    /// within a tokio runtime.
    #[instrument(skip_all, fields(package = %settings.package_name))]
    pub fn submit(&self, archive: impl Into<PathBuf>, settings: ProjectSettings) -> Result<JobId> {
        let archive = archive.into();
        settings.validate()?;
        stager::validate_archive(&archive)?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| WebApkError::config(format!("pipeline needs a tokio runtime: {e}")))?;

        let job_id = JobId::new();
        let paths = JobPaths::new(&self.inner.config, job_id);

        self.inner.notifier.register(job_id);
        let cancel = self
            .inner
            .registry
            .insert(job_id, settings.clone(), paths.clone());

        info!(%job_id, archive = %archive.display(), "job accepted");

        runtime.spawn(run_job(
            Arc::clone(&self.inner),
            job_id,
            archive,
            Arc::new(settings),
            paths,
            cancel,
        ));

        Ok(job_id)
    }

    /// Current record of a job, from memory or from its persisted `job.json`.
    pub fn status(&self, job_id: JobId) -> Result<JobRecord> {
        match self.inner.registry.record(job_id) {
            Some(record) => Ok(record),
            None => self.inner.locator.read_record(job_id),
        }
    }

    /// Subscribe to one job's terminal event. `None` once it has been published.
    pub fn subscribe(&self, job_id: JobId) -> Option<broadcast::Receiver<BuildEvent>> {
        self.inner.notifier.subscribe(job_id)
    }

    /// Subscribe to the terminal events of every job.
    pub fn subscribe_all(&self) -> broadcast::Receiver<BuildEvent> {
        self.inner.notifier.subscribe_all()
    }

    /// Wait until the job is terminal and return its event.
    ///
    /// Works whether or not the event has already been published.
    pub async fn wait(&self, job_id: JobId) -> Result<BuildEvent> {
        // Subscribe before looking at the status: the registry turns terminal
        // before the event is published, so one of the two always sees it.
        let rx = self.inner.notifier.subscribe(job_id);
        if let Some(event) = self.terminal_event(job_id)? {
            return Ok(event);
        }

        if let Some(mut rx) = rx {
            loop {
                match rx.recv().await {
                    Ok(event) => return Ok(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }

        self.terminal_event(job_id)?
            .ok_or_else(|| WebApkError::not_found(format!("job {job_id} has no terminal event")))
    }

    /// Ask a job to stop. The build tool is killed and the job ends `Failed`
    /// with a cancellation reason. `Ok(false)` if it had already finished.
    pub fn cancel(&self, job_id: JobId, reason: &str) -> Result<bool> {
        if !self.inner.registry.contains(job_id) {
            // Forgotten jobs are finished; truly unknown ones are NotFound.
            self.inner.locator.read_record(job_id)?;
            return Ok(false);
        }
        self.inner.registry.cancel(job_id, reason)
    }

    /// Remove a finished job's workspace and template instance. The build
    /// output is kept.
    pub fn cleanup(&self, job_id: JobId) -> Result<()> {
        let status = match self.inner.registry.status(job_id) {
            Some(status) => status,
            None => self.inner.locator.read_record(job_id)?.status,
        };
        if !status.is_terminal() {
            return Err(WebApkError::validation(format!(
                "job {job_id} is still {status}"
            )));
        }
        remove_scratch(&JobPaths::new(&self.inner.config, job_id))
    }

    /// Drop a finished job from memory. Later queries are answered from its
    /// `job.json`. `Ok(false)` if the job is not held in memory.
    pub fn forget(&self, job_id: JobId) -> Result<bool> {
        let Some(paths) = self.inner.registry.paths(job_id) else {
            return Ok(false);
        };
        if !paths.record().is_file() {
            return Err(WebApkError::validation(format!(
                "job {job_id} has no persisted record yet"
            )));
        }
        self.inner.registry.forget(job_id)
    }

    /// Jobs that have not reached a terminal state.
    pub fn active_jobs(&self) -> usize {
        self.inner.registry.active()
    }

    fn terminal_event(&self, job_id: JobId) -> Result<Option<BuildEvent>> {
        let record = self.status(job_id)?;
        Ok(match record.status {
            JobStatus::Ready => Some(BuildEvent::ApkReady {
                job_id,
                url: self.inner.locator.retrieval_url(job_id),
            }),
            JobStatus::Failed => Some(BuildEvent::ApkFailed {
                job_id,
                error: record.error.unwrap_or_default(),
            }),
            _ => None,
        })
    }
}

/// Remove scratch directories of a job, leaving the output alone.
pub fn remove_scratch(paths: &JobPaths) -> Result<()> {
    fsutil::remove_dir_if_exists(&paths.workspace)?;
    fsutil::remove_dir_if_exists(&paths.instance)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Job task
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(%job_id))]
async fn run_job(
    inner: Arc<Inner>,
    job_id: JobId,
    archive: PathBuf,
    settings: Arc<ProjectSettings>,
    paths: JobPaths,
    mut cancel: CancelSignal,
) {
    let result = execute(&inner, job_id, &archive, settings, &paths, &mut cancel).await;

    let finished = match result {
        Ok(outcome) => inner
            .registry
            .finish_ready(job_id, outcome.info)
            .map(|record| {
                let url = inner.locator.retrieval_url(job_id);
                info!(%url, elapsed_ms = outcome.elapsed.as_millis(), "apk ready");
                (record, BuildEvent::ApkReady { job_id, url })
            }),
        Err(err) => {
            error!(kind = err.kind(), error = %err, "job failed");
            inner.registry.finish_failed(job_id, &err).map(|record| {
                let error = err.summary();
                (record, BuildEvent::ApkFailed { job_id, error })
            })
        }
    };

    let Some((record, event)) = finished else {
        error!("job left its lifecycle out of order, no event published");
        return;
    };

    if let Err(e) = locator::write_record(&paths, &record) {
        warn!(error = %e, "failed to persist job record");
    }

    inner.notifier.publish(event);

    if !inner.config.retain_scratch {
        if let Err(e) = remove_scratch(&paths) {
            warn!(error = %e, "failed to remove job scratch directories");
        }
    }
}

/// Run the stages strictly in order. Cancellation is honoured while queued,
/// between stages, and during the build.
async fn execute(
    inner: &Inner,
    job_id: JobId,
    archive: &Path,
    settings: Arc<ProjectSettings>,
    paths: &JobPaths,
    cancel: &mut CancelSignal,
) -> Result<BuildOutcome> {
    let _permit = tokio::select! {
        permit = Arc::clone(&inner.permits).acquire_owned() => {
            permit.map_err(|_| WebApkError::cancelled("pipeline shut down"))?
        }
        reason = invoker::cancelled(cancel) => return Err(WebApkError::cancelled(reason)),
    };

    // --- Staging ---
    info!("staging upload");
    let (archive, workspace) = (archive.to_path_buf(), paths.workspace.clone());
    blocking(&paths.workspace, move || stager::stage(&archive, &workspace)).await?;
    invoker::check_cancelled(cancel)?;

    // --- Patching ---
    inner.registry.advance(job_id, JobStatus::Patching)?;
    info!("patching template instance");
    let template_dir = inner.config.template_dir.clone();
    let template = inner.config.template.clone();
    let (workspace, instance) = (paths.workspace.clone(), paths.instance.clone());
    blocking(&paths.instance, move || {
        patcher::seed_instance(&template_dir, &instance)?;
        patcher::merge_workspace(&workspace, &instance, &template.merge_subdir)?;
        patcher::patch(&instance, &template, &settings)
    })
    .await?;
    invoker::check_cancelled(cancel)?;

    // --- Building ---
    inner.registry.advance(job_id, JobStatus::Building)?;
    inner.invoker.run(&paths.instance, &paths.output, cancel).await
}

/// Run local filesystem work off the async workers.
async fn blocking<T, F>(context: &Path, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WebApkError::io(context, std::io::Error::other(e)))?
}
