//! Single-threaded time-ordered job queue.
//!
//! The core never sleeps and never reads the clock: it schedules jobs at
//! future instants and the host calls back in when the next one is due. Jobs
//! are a closed enum rather than closures so scheduling them does not borrow
//! the node.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::common::{Family, InfoHash};
use crate::messages::Tid;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
/// Work the node has deferred to a future instant.
pub enum Job {
    /// Drive one search forward.
    SearchStep { family: Family, target: InfoHash },
    /// Retry or expire one in-flight request.
    RequestTimeout { tid: Tid },
    /// Bucket and neighbourhood maintenance.
    ConfirmNodes,
    /// Roll the token secrets.
    RotateSecrets,
    /// Expire buckets, storage and searches.
    ExpireState,
    /// Push storage whose key drifted away to the current closest nodes.
    DataPersistence,
    /// Check whether a pending shutdown has drained.
    ShutdownDrain,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
/// Handle to a scheduled job, usable to cancel or reschedule it.
pub struct JobHandle {
    key: (Instant, u64),
}

#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BTreeMap<(Instant, u64), Job>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    /// Schedule `job` to run at `time`.
    pub fn add(&mut self, time: Instant, job: Job) -> JobHandle {
        let key = (time, self.next_seq);
        self.next_seq += 1;
        self.queue.insert(key, job);
        JobHandle { key }
    }

    /// Remove a scheduled job. A handle that already ran is ignored.
    pub fn cancel(&mut self, handle: JobHandle) {
        self.queue.remove(&handle.key);
    }

    /// Move a job to a new time, keeping the earlier of the two.
    pub fn advance(&mut self, handle: JobHandle, time: Instant) -> JobHandle {
        if time >= handle.key.0 {
            return handle;
        }
        match self.queue.remove(&handle.key) {
            Some(job) => self.add(time, job),
            None => handle,
        }
    }

    /// Time of the next scheduled job, if any.
    pub fn next_due(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(t, _)| *t)
    }

    /// Pop the next job whose time has come.
    pub fn pop_due(&mut self, now: Instant) -> Option<Job> {
        let key = *self.queue.keys().next().filter(|(t, _)| *t <= now)?;
        self.queue.remove(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn jobs_run_in_time_order() {
        let mut s = Scheduler::new();
        let now = Instant::now();

        s.add(now + Duration::from_secs(2), Job::RotateSecrets);
        s.add(now + Duration::from_secs(1), Job::ConfirmNodes);

        let later = now + Duration::from_secs(3);
        assert_eq!(s.pop_due(later), Some(Job::ConfirmNodes));
        assert_eq!(s.pop_due(later), Some(Job::RotateSecrets));
        assert_eq!(s.pop_due(later), None);
    }

    #[test]
    fn due_respects_now() {
        let mut s = Scheduler::new();
        let now = Instant::now();

        s.add(now + Duration::from_secs(5), Job::ExpireState);
        assert_eq!(s.pop_due(now), None);
        assert_eq!(s.next_due(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn cancel_and_advance() {
        let mut s = Scheduler::new();
        let now = Instant::now();

        let h = s.add(now + Duration::from_secs(10), Job::DataPersistence);
        let h = s.advance(h, now + Duration::from_secs(1));
        // Advancing backwards in time is a no-op.
        let h = s.advance(h, now + Duration::from_secs(8));
        assert_eq!(s.next_due(), Some(now + Duration::from_secs(1)));

        s.cancel(h);
        assert!(s.is_empty());
    }

    #[test]
    fn same_instant_keeps_insertion_order() {
        let mut s = Scheduler::new();
        let now = Instant::now();

        s.add(now, Job::ConfirmNodes);
        s.add(now, Job::RotateSecrets);
        assert_eq!(s.pop_due(now), Some(Job::ConfirmNodes));
        assert_eq!(s.pop_due(now), Some(Job::RotateSecrets));
    }
}
