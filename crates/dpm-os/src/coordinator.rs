use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dpm::job::{Completion, JobId, JobLedger};

use tokio::sync::watch;

use tracing::{debug, warn};

#[derive(Debug)]
struct Inner {
    ledger: Mutex<JobLedger>,
    // Incremented each time the last outstanding job is released.
    permission: watch::Sender<u64>,
    next_user: AtomicU32,
}

/// The job coordinator.
///
/// Aggregates the start and done signals of every session, timer and
/// application job, and signals when sleep becomes permissible.
///
/// Cloning a [`Coordinator`] is cheap, every clone shares the same ledger.
#[derive(Debug, Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    /// Creates a [`Coordinator`] with no outstanding job.
    #[must_use]
    pub fn new() -> Self {
        let (permission, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                ledger: Mutex::new(JobLedger::new()),
                permission,
                next_user: AtomicU32::new(1),
            }),
        }
    }

    /// Starts a job and returns the guard which releases it.
    ///
    /// Starting a job which is already outstanding nests it: the job is
    /// completed only once all its guards have been released.
    #[must_use = "dropping the guard immediately completes the job"]
    pub fn start(&self, id: JobId) -> Job {
        let count = self.ledger().start(id);
        debug!("Start job {id} ({count} outstanding)");

        Job {
            id,
            coordinator: Some(self.clone()),
        }
    }

    /// Starts a job with a fresh [`JobId::User`] identifier.
    #[must_use = "dropping the guard immediately completes the job"]
    pub fn user_job(&self) -> Job {
        let id = self.inner.next_user.fetch_add(1, Ordering::Relaxed);
        self.start(JobId::User(id))
    }

    /// Releases one start of a job.
    ///
    /// Releasing a job which is not outstanding is a no-op.
    pub fn done(&self, id: JobId) -> Completion {
        let mut ledger = self.ledger();
        let completion = ledger.done(id);

        match completion {
            Completion::Idle => {}
            Completion::Released { remaining } => {
                debug!("Job {id} done, {remaining} outstanding");
            }
            Completion::AllDone => {
                debug!("Job {id} done, sleep permitted");
                // Bumped under the ledger lock so that a new start cannot slip
                // in between the release and the signal.
                self.inner.permission.send_modify(|epoch| *epoch += 1);
            }
        }

        completion
    }

    /// Number of outstanding job starts.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.ledger().outstanding()
    }

    /// Whether no job is outstanding.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.ledger().is_idle()
    }

    /// Outstanding jobs and their counts.
    #[must_use]
    pub fn outstanding_jobs(&self) -> Vec<(JobId, usize)> {
        self.ledger().iter().collect()
    }

    /// Subscribes to the sleep-permission signal.
    ///
    /// The value is an epoch incremented each time the last outstanding job
    /// is released.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.permission.subscribe()
    }

    /// Waits until no job is outstanding.
    pub async fn wait_idle(&self) {
        let mut permission = self.subscribe();
        loop {
            if self.is_idle() {
                return;
            }
            if permission.changed().await.is_err() {
                warn!("Sleep-permission signal closed");
                return;
            }
        }
    }

    fn ledger(&self) -> MutexGuard<'_, JobLedger> {
        self.inner
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A guard of an outstanding job.
///
/// The job is released when the guard is dropped or explicitly completed
/// through [`Job::done`]. Moving the guard into another task extends the
/// job until that task drops it.
#[derive(Debug)]
#[must_use = "dropping the guard immediately completes the job"]
pub struct Job {
    id: JobId,
    coordinator: Option<Coordinator>,
}

impl Job {
    /// Job identifier.
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Completes the job.
    pub fn done(self) {
        drop(self);
    }

    /// Detaches the guard, leaving the job outstanding.
    ///
    /// The job must then be completed through [`Coordinator::done`] with the
    /// returned identifier.
    pub fn detach(mut self) -> JobId {
        self.coordinator = None;
        self.id
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            let _ = coordinator.done(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn guard_releases_once() {
        let coordinator = Coordinator::new();
        let permission = coordinator.subscribe();

        let job = coordinator.start(JobId::Session(1));
        assert_eq!(coordinator.outstanding(), 1);

        job.done();
        assert!(coordinator.is_idle());
        assert_eq!(*permission.borrow(), 1);

        // A late explicit release is ignored.
        assert_eq!(coordinator.done(JobId::Session(1)), Completion::Idle);
        assert_eq!(*permission.borrow(), 1);
    }

    #[test]
    fn detached_job() {
        let coordinator = Coordinator::new();

        let id = coordinator.start(JobId::Timer(2)).detach();
        assert_eq!(coordinator.outstanding(), 1);

        assert_eq!(coordinator.done(id), Completion::AllDone);
        assert!(coordinator.is_idle());
    }

    #[test]
    fn permission_fires_on_each_transition_to_zero() {
        let coordinator = Coordinator::new();
        let permission = coordinator.subscribe();

        let session = coordinator.start(JobId::Session(1));
        let keepalive = coordinator.start(JobId::Keepalive(1));
        drop(session);
        assert_eq!(*permission.borrow(), 0);
        drop(keepalive);
        assert_eq!(*permission.borrow(), 1);

        let user = coordinator.user_job();
        assert!(matches!(user.id(), JobId::User(_)));
        drop(user);
        assert_eq!(*permission.borrow(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_across_tasks() {
        let coordinator = Coordinator::new();

        // Already idle.
        coordinator.wait_idle().await;

        let job = coordinator.start(JobId::Timer(1));
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            job.done();
        });

        coordinator.wait_idle().await;
        assert!(coordinator.is_idle());
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accounting() {
        let coordinator = Coordinator::new();
        let mut tasks = Vec::new();

        for session in 1..=4u8 {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..500 {
                    let job = coordinator.start(JobId::Session(session));
                    let nested = coordinator.start(JobId::Session(session));
                    tokio::task::yield_now().await;
                    drop(nested);
                    drop(job);
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert!(coordinator.is_idle());
        assert!(coordinator.outstanding_jobs().is_empty());
    }
}
