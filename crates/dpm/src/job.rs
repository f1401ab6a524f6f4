use core::fmt;

use hashbrown::HashMap;

use log::warn;

use serde::{Deserialize, Serialize};

/// Identifier of a job.
///
/// A job is any unit of work which must complete before the device is
/// allowed to sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobId {
    /// The boot and sleep-entry flows of the manager.
    Manager,
    /// A job opened by the application.
    User(u32),
    /// Input/output of a session.
    Session(u8),
    /// Keepalive of a session.
    Keepalive(u8),
    /// Callback of an application timer.
    Timer(u8),
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manager => f.write_str("manager"),
            Self::User(id) => write!(f, "user `{id}`"),
            Self::Session(id) => write!(f, "session `{id}`"),
            Self::Keepalive(id) => write!(f, "keepalive of session `{id}`"),
            Self::Timer(id) => write!(f, "timer `{id}`"),
        }
    }
}

/// Outcome of releasing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The job was not outstanding, nothing changed.
    Idle,
    /// The job has been released, other jobs are still outstanding.
    Released {
        /// Number of outstanding starts left for all jobs.
        remaining: usize,
    },
    /// The last outstanding job has been released, sleep is permitted.
    AllDone,
}

/// Reference-counted ledger of outstanding jobs.
///
/// The same job may be started several times before being released, for
/// example when a session receives data while its keepalive is still being
/// processed. Each start must be matched by one release.
#[derive(Debug, Default)]
pub struct JobLedger {
    counts: HashMap<JobId, usize>,
    total: usize,
}

impl JobLedger {
    /// Creates an empty [`JobLedger`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a job and returns how many starts of it are outstanding.
    pub fn start(&mut self, id: JobId) -> usize {
        let count = self.counts.entry(id).or_insert(0);
        *count += 1;
        self.total += 1;
        *count
    }

    /// Releases one start of a job.
    ///
    /// Releasing a job which is not outstanding changes nothing and logs a
    /// consistency warning.
    pub fn done(&mut self, id: JobId) -> Completion {
        let Some(count) = self.counts.get_mut(&id) else {
            warn!("Job done for {id} which is not outstanding, ignore it");
            return Completion::Idle;
        };

        *count -= 1;
        if *count == 0 {
            let _ = self.counts.remove(&id);
        }
        self.total -= 1;

        if self.total == 0 {
            Completion::AllDone
        } else {
            Completion::Released {
                remaining: self.total,
            }
        }
    }

    /// Number of outstanding starts of a job.
    #[must_use]
    pub fn count(&self, id: JobId) -> usize {
        self.counts.get(&id).copied().unwrap_or(0)
    }

    /// Number of outstanding starts of all jobs.
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.total
    }

    /// Whether no job is outstanding, which is the only state in which
    /// sleep is permitted.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.total == 0
    }

    /// Iterates over the outstanding jobs and their counts.
    pub fn iter(&self) -> impl Iterator<Item = (JobId, usize)> + '_ {
        self.counts.iter().map(|(id, count)| (*id, *count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;
    use std::vec::Vec;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Start(JobId),
        Done(JobId),
    }

    const IDS: [JobId; 2] = [JobId::Session(1), JobId::Timer(1)];

    // Every sequence of `len` operations over the two identifiers.
    fn sequences(len: usize) -> Vec<Vec<Op>> {
        let ops: Vec<Op> = IDS
            .iter()
            .flat_map(|id| [Op::Start(*id), Op::Done(*id)])
            .collect();

        let mut all = Vec::new();
        let total = ops.len().pow(u32::try_from(len).unwrap());
        for mut n in 0..total {
            let mut sequence = Vec::with_capacity(len);
            for _ in 0..len {
                sequence.push(ops[n % ops.len()]);
                n /= ops.len();
            }
            all.push(sequence);
        }
        all
    }

    #[test]
    fn nested_starts() {
        let mut ledger = JobLedger::new();

        assert_eq!(ledger.start(JobId::Session(1)), 1);
        assert_eq!(ledger.start(JobId::Session(1)), 2);
        assert_eq!(ledger.start(JobId::Keepalive(1)), 1);
        assert_eq!(ledger.outstanding(), 3);

        assert_eq!(
            ledger.done(JobId::Session(1)),
            Completion::Released { remaining: 2 }
        );
        assert_eq!(
            ledger.done(JobId::Keepalive(1)),
            Completion::Released { remaining: 1 }
        );
        assert_eq!(ledger.done(JobId::Session(1)), Completion::AllDone);
        assert!(ledger.is_idle());
    }

    #[test]
    fn done_without_start() {
        let mut ledger = JobLedger::new();

        assert_eq!(ledger.done(JobId::Timer(2)), Completion::Idle);
        assert!(ledger.is_idle());

        // A late release must not steal the count of another job.
        let _ = ledger.start(JobId::Timer(1));
        assert_eq!(ledger.done(JobId::Timer(2)), Completion::Idle);
        assert_eq!(ledger.outstanding(), 1);
        assert_eq!(ledger.count(JobId::Timer(1)), 1);
    }

    #[test]
    fn exhaustive_interleavings() {
        for len in 1..=7 {
            for sequence in sequences(len) {
                let mut ledger = JobLedger::new();
                let mut model = [0usize; IDS.len()];

                for op in &sequence {
                    let completion = match *op {
                        Op::Start(id) => {
                            let _ = ledger.start(id);
                            let index = IDS.iter().position(|i| *i == id).unwrap();
                            model[index] += 1;
                            None
                        }
                        Op::Done(id) => {
                            let index = IDS.iter().position(|i| *i == id).unwrap();
                            let before = model[index];
                            model[index] = before.saturating_sub(1);
                            Some((before, ledger.done(id)))
                        }
                    };

                    let expected: usize = model.iter().sum();
                    assert_eq!(ledger.outstanding(), expected, "{sequence:?}");
                    assert_eq!(ledger.is_idle(), expected == 0, "{sequence:?}");
                    for (index, id) in IDS.iter().enumerate() {
                        assert_eq!(ledger.count(*id), model[index], "{sequence:?}");
                    }

                    // Sleep permission is granted only by the release which
                    // brings the total to zero.
                    if let Some((before, completion)) = completion {
                        match completion {
                            Completion::Idle => assert_eq!(before, 0, "{sequence:?}"),
                            Completion::AllDone => assert_eq!(expected, 0, "{sequence:?}"),
                            Completion::Released { remaining } => {
                                assert!(remaining > 0, "{sequence:?}");
                                assert_eq!(remaining, expected, "{sequence:?}");
                            }
                        }
                    }
                }
            }
        }
    }
}
