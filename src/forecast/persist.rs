//! Persistence of finished days and model snapshots off the control task.
//!
//! Inside a tokio runtime every write is queued to a single blocking worker,
//! so writes land in submission order and file I/O never stalls the poll
//! loop. Without a runtime the write happens inline.

use std::sync::Arc;

use chrono::NaiveDate;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::DayArchive;
use crate::domain::Observation;
use crate::ml::ModelStore;

enum Job<M> {
    Archive {
        day: NaiveDate,
        observations: Vec<Observation>,
    },
    Model(M),
}

impl<M> Job<M> {
    fn run(self, archive: &dyn DayArchive, store: &dyn ModelStore<M>) {
        match self {
            Job::Archive { day, observations } => {
                if let Err(e) = archive.persist(day, &observations) {
                    warn!(%day, error = %e, "failed to archive day");
                }
            }
            Job::Model(model) => {
                if let Err(e) = store.save(&model) {
                    warn!(error = %e, "failed to persist model");
                }
            }
        }
    }
}

struct Worker<M> {
    jobs: mpsc::UnboundedSender<Job<M>>,
    handle: JoinHandle<()>,
}

impl<M: Send + 'static> Worker<M> {
    fn spawn(runtime: &Handle, archive: Arc<dyn DayArchive>, store: Arc<dyn ModelStore<M>>) -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job<M>>();
        let handle = runtime.spawn_blocking(move || {
            while let Some(job) = queue.blocking_recv() {
                job.run(archive.as_ref(), store.as_ref());
            }
        });
        debug!("persistence worker started");
        Self { jobs, handle }
    }
}

/// Day archive and model store behind an ordered write queue
pub struct Persistence<M> {
    archive: Arc<dyn DayArchive>,
    store: Arc<dyn ModelStore<M>>,
    worker: Option<Worker<M>>,
}

impl<M: Send + 'static> Persistence<M> {
    pub fn new(archive: Arc<dyn DayArchive>, store: Arc<dyn ModelStore<M>>) -> Self {
        Self {
            archive,
            store,
            worker: None,
        }
    }

    pub fn set_archive(&mut self, archive: Arc<dyn DayArchive>) {
        // Queued days still go to the previous archive.
        self.worker = None;
        self.archive = archive;
    }

    pub fn archive_day(&mut self, day: NaiveDate, observations: Vec<Observation>) {
        self.submit(Job::Archive { day, observations });
    }

    pub fn save_model(&mut self, model: M) {
        self.submit(Job::Model(model));
    }

    /// Wait until every queued write has been attempted.
    pub async fn flush(&mut self) {
        let Some(Worker { jobs, handle }) = self.worker.take() else {
            return;
        };
        drop(jobs);
        if let Err(e) = handle.await {
            warn!(error = %e, "persistence worker failed");
        }
    }

    fn submit(&mut self, job: Job<M>) {
        let Ok(runtime) = Handle::try_current() else {
            job.run(self.archive.as_ref(), self.store.as_ref());
            return;
        };
        let (archive, store) = (&self.archive, &self.store);
        let worker = self
            .worker
            .get_or_insert_with(|| Worker::spawn(&runtime, Arc::clone(archive), Arc::clone(store)));
        if let Err(mpsc::error::SendError(job)) = worker.jobs.send(job) {
            warn!("persistence worker stopped, writing inline");
            self.worker = None;
            job.run(self.archive.as_ref(), self.store.as_ref());
        }
    }
}
