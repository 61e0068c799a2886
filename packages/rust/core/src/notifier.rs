//! Completion notifier: per-job build-event channels plus a firehose.
//!
//! Delivery is best-effort. Publishing never blocks and never fails; an event
//! nobody is subscribed to is simply dropped.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use webapk_shared::{BuildEvent, JobId};

/// Events buffered per channel before slow receivers start lagging.
const DEFAULT_CAPACITY: usize = 16;

/// Routes terminal job events to the subscribers that asked for them.
#[derive(Debug)]
pub struct Notifier {
    jobs: Mutex<HashMap<JobId, broadcast::Sender<BuildEvent>>>,
    all: broadcast::Sender<BuildEvent>,
    capacity: usize,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            jobs: Mutex::new(HashMap::new()),
            all,
            capacity,
        }
    }

    /// Open the channel for a job. Called once when the job is accepted.
    pub fn register(&self, job_id: JobId) {
        let (tx, _) = broadcast::channel(self.capacity);
        self.lock().insert(job_id, tx);
    }

    /// Subscribe to one job's events.
    ///
    /// Returns `None` if the job is unknown or its event was already published.
    pub fn subscribe(&self, job_id: JobId) -> Option<broadcast::Receiver<BuildEvent>> {
        self.lock().get(&job_id).map(broadcast::Sender::subscribe)
    }

    /// Subscribe to the events of every job.
    pub fn subscribe_all(&self) -> broadcast::Receiver<BuildEvent> {
        self.all.subscribe()
    }

    /// Publish a terminal event and close the job's channel.
    ///
    /// Returns how many receivers the event reached.
    pub fn publish(&self, event: BuildEvent) -> usize {
        let job_id = event.job_id();
        let job_tx = self.lock().remove(&job_id);

        let mut delivered = 0;
        match job_tx {
            Some(tx) => delivered += tx.send(event.clone()).unwrap_or(0),
            None => warn!(%job_id, "publishing for a job without an open channel"),
        }
        delivered += self.all.send(event).unwrap_or(0);

        debug!(%job_id, delivered, "build event published");
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, broadcast::Sender<BuildEvent>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
