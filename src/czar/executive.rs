//! C10: the czar-side per-query state machine. Grounded in spec.md section
//! 4.9 and `examples/original_source/src/qdisp/UberJob.cc`'s job/uber-job
//! lifecycle, reworked as sealed Rust enums rather than open-ended
//! inheritance (spec.md section 9: "replace scheduler/job-state class
//! hierarchies with sealed enums").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{QservError, Result};
use crate::ids::{JobId, QueryId, UberJobId, WorkerId};
use crate::status::AgeTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Pending,
    Assigned,
    ResponseReady,
    Complete,
    Retry,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UberJobState {
    Assembled,
    Sent,
    Ack,
    ResponseDataReady,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JobQuery {
    pub id: JobId,
    pub chunk_id: i64,
    pub attempt: u32,
    pub state: JobState,
    pub uber_job: Option<UberJobId>,
}

#[derive(Debug, Clone)]
pub struct UberJobTracker {
    pub id: UberJobId,
    pub worker: WorkerId,
    pub state: UberJobState,
    pub jobs: Vec<JobId>,
}

pub struct QueryExecutive {
    pub query_id: QueryId,
    pub max_attempts: u32,
    pub limit: Option<u64>,
    jobs: Mutex<HashMap<JobId, JobQuery>>,
    uber_jobs: Mutex<HashMap<UberJobId, UberJobTracker>>,
    result_rows: AtomicU64,
    data_ignored_count: AtomicU64,
    cancelled: AtomicBool,
    limit_row_complete: AtomicBool,
    flag_failed_uber_job: AtomicBool,
}

impl QueryExecutive {
    pub fn new(query_id: QueryId, max_attempts: u32, limit: Option<u64>) -> Self {
        Self {
            query_id,
            max_attempts,
            limit,
            jobs: Mutex::new(HashMap::new()),
            uber_jobs: Mutex::new(HashMap::new()),
            result_rows: AtomicU64::new(0),
            data_ignored_count: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            limit_row_complete: AtomicBool::new(false),
            flag_failed_uber_job: AtomicBool::new(false),
        }
    }

    pub fn add_job(&self, id: JobId, chunk_id: i64) {
        self.jobs.lock().insert(
            id,
            JobQuery {
                id,
                chunk_id,
                attempt: 1,
                state: JobState::Created,
                uber_job: None,
            },
        );
    }

    pub fn pending_jobs(&self) -> Vec<JobQuery> {
        let mut jobs = self.jobs.lock();
        for j in jobs.values_mut() {
            if j.state == JobState::Created {
                j.state = JobState::Pending;
            }
        }
        jobs.values().filter(|j| j.state == JobState::Pending).cloned().collect()
    }

    /// Registers a freshly-assembled uber-job and transitions its member
    /// jobs to ASSIGNED / the uber-job itself to SENT (spec.md section 4.9
    /// step 1).
    pub fn register_uber_job(&self, id: UberJobId, worker: WorkerId, job_ids: Vec<JobId>) {
        let mut jobs = self.jobs.lock();
        for jid in &job_ids {
            if let Some(j) = jobs.get_mut(jid) {
                j.state = JobState::Assigned;
                j.uber_job = Some(id);
            }
        }
        drop(jobs);
        self.uber_jobs.lock().insert(
            id,
            UberJobTracker {
                id,
                worker,
                state: UberJobState::Sent,
                jobs: job_ids,
            },
        );
    }

    /// `queryjob-ready`: worker finished and wrote a result file.
    pub fn on_uber_job_ready(&self, id: UberJobId, row_count: u64) -> Result<()> {
        let mut uber_jobs = self.uber_jobs.lock();
        let u = uber_jobs
            .get_mut(&id)
            .ok_or_else(|| QservError::NotFound(format!("uber-job {}", id.0)))?;
        u.state = UberJobState::ResponseDataReady;
        let jobs_snapshot = u.jobs.clone();
        drop(uber_jobs);

        let mut jobs = self.jobs.lock();
        for jid in &jobs_snapshot {
            if let Some(j) = jobs.get_mut(jid) {
                j.state = JobState::ResponseReady;
            }
        }
        drop(jobs);

        self.result_rows.fetch_add(row_count, Ordering::Relaxed);
        if let Some(limit) = self.limit {
            if self.result_rows.load(Ordering::Relaxed) >= limit {
                self.limit_row_complete.store(true, Ordering::Relaxed);
            }
        }

        let mut uber_jobs = self.uber_jobs.lock();
        if let Some(u) = uber_jobs.get_mut(&id) {
            u.state = UberJobState::Done;
        }
        drop(uber_jobs);
        let mut jobs = self.jobs.lock();
        for jid in &jobs_snapshot {
            if let Some(j) = jobs.get_mut(jid) {
                j.state = JobState::Complete;
            }
        }
        Ok(())
    }

    /// `queryjob-error`, or the health monitor declaring the worker dead:
    /// `_unassignJobs` -- bump attempt counts, fail the query past
    /// `max_attempts`, else return jobs to PENDING for the next dispatch
    /// round (spec.md section 4.9 "Recovery").
    pub fn unassign_jobs(&self, id: UberJobId) -> Result<()> {
        let mut uber_jobs = self.uber_jobs.lock();
        let u = uber_jobs
            .get_mut(&id)
            .ok_or_else(|| QservError::NotFound(format!("uber-job {}", id.0)))?;
        u.state = UberJobState::Failed;
        let job_ids = u.jobs.clone();
        drop(uber_jobs);

        let mut jobs = self.jobs.lock();
        for jid in &job_ids {
            if let Some(j) = jobs.get_mut(jid) {
                j.attempt += 1;
                if j.attempt > self.max_attempts {
                    j.state = JobState::Failed;
                } else {
                    j.state = JobState::Pending;
                    j.uber_job = None;
                }
            }
        }
        let any_failed = jobs.values().any(|j| j.state == JobState::Failed);
        drop(jobs);

        self.flag_failed_uber_job.store(true, Ordering::Relaxed);
        if any_failed {
            self.squash();
        }
        Ok(())
    }

    pub fn take_flag_failed_uber_job(&self) -> bool {
        self.flag_failed_uber_job.swap(false, Ordering::Relaxed)
    }

    pub fn limit_row_complete(&self) -> bool {
        self.limit_row_complete.load(Ordering::Relaxed)
    }

    pub fn result_rows(&self) -> u64 {
        self.result_rows.load(Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Squash: cancel everything, mark all non-DONE jobs FAILED. Idempotent.
    pub fn squash(&self) -> bool {
        let first = self
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            let mut jobs = self.jobs.lock();
            for j in jobs.values_mut() {
                if j.state != JobState::Complete {
                    j.state = JobState::Failed;
                }
            }
            let mut uber_jobs = self.uber_jobs.lock();
            for u in uber_jobs.values_mut() {
                if u.state != UberJobState::Done {
                    u.state = UberJobState::Failed;
                }
            }
        }
        first
    }

    /// Uber-jobs the next C12 round should report as dead (post LIMIT
    /// short-circuit or squash), so the worker can drop their queued tasks
    /// and partial files.
    pub fn dead_uber_jobs(&self) -> Vec<UberJobId> {
        self.uber_jobs
            .lock()
            .values()
            .filter(|u| u.state == UberJobState::Failed)
            .map(|u| u.id)
            .collect()
    }

    pub fn all_uber_jobs_done_or_failed(&self) -> bool {
        self.uber_jobs
            .lock()
            .values()
            .all(|u| matches!(u.state, UberJobState::Done | UberJobState::Failed))
    }

    /// Uber-jobs still outstanding on `worker` (SENT/ACK, not yet
    /// DONE/FAILED). Used by the health monitor's eviction sweep to find
    /// what needs reassigning when a worker goes dark.
    pub fn uber_jobs_for_worker(&self, worker: &WorkerId) -> Vec<UberJobId> {
        self.uber_jobs
            .lock()
            .values()
            .filter(|u| &u.worker == worker && matches!(u.state, UberJobState::Assembled | UberJobState::Sent | UberJobState::Ack))
            .map(|u| u.id)
            .collect()
    }
}

/// Registry of all in-flight query executives, the czar-wide "arena" the
/// REST layer and C12 round look things up through. Also owns the
/// age-based pruning of queries nobody has touched in a while (a czar
/// crash mid-query, a client that vanished) -- mirrors
/// `ActiveWorker::_removeDeadEntries`'s dead-entry reap.
pub struct ExecutiveRegistry {
    queries: Mutex<HashMap<QueryId, Arc<QueryExecutive>>>,
    ages: Mutex<AgeTracker<QueryId>>,
}

impl Default for ExecutiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutiveRegistry {
    pub fn new() -> Self {
        Self::with_max_lifetime(Duration::from_secs(300))
    }

    pub fn with_max_lifetime(max_lifetime: Duration) -> Self {
        Self {
            queries: Mutex::new(HashMap::new()),
            ages: Mutex::new(AgeTracker::new(max_lifetime)),
        }
    }

    pub fn insert(&self, exec: Arc<QueryExecutive>) {
        self.ages.lock().touch(exec.query_id, Instant::now());
        self.queries.lock().insert(exec.query_id, exec);
    }

    pub fn get(&self, qid: QueryId) -> Option<Arc<QueryExecutive>> {
        let found = self.queries.lock().get(&qid).cloned();
        if found.is_some() {
            self.ages.lock().touch(qid, Instant::now());
        }
        found
    }

    pub fn remove(&self, qid: QueryId) {
        self.queries.lock().remove(&qid);
    }

    pub fn all(&self) -> Vec<Arc<QueryExecutive>> {
        self.queries.lock().values().cloned().collect()
    }

    /// Drops bookkeeping for queries that haven't been referenced (by
    /// `insert`/`get`) within the registry's max lifetime. Intended to run
    /// on a slow periodic tick alongside the C14 health monitor.
    pub fn prune_stale(&self) -> Vec<QueryId> {
        let expired = self.ages.lock().prune(Instant::now());
        if !expired.is_empty() {
            let mut queries = self.queries.lock();
            for qid in &expired {
                queries.remove(qid);
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_completes_all_jobs() {
        let exec = QueryExecutive::new(QueryId(1), 3, None);
        exec.add_job(JobId(1), 6630);
        exec.add_job(JobId(2), 6800);
        let pending = exec.pending_jobs();
        assert_eq!(pending.len(), 2);

        exec.register_uber_job(UberJobId(1), "worker-a".to_string(), vec![JobId(1), JobId(2)]);
        exec.on_uber_job_ready(UberJobId(1), 100).unwrap();
        assert_eq!(exec.result_rows(), 100);
        assert!(exec.all_uber_jobs_done_or_failed());
    }

    #[test]
    fn limit_short_circuit_sets_flag() {
        let exec = QueryExecutive::new(QueryId(1), 3, Some(50));
        exec.add_job(JobId(1), 6630);
        exec.register_uber_job(UberJobId(1), "worker-a".to_string(), vec![JobId(1)]);
        exec.on_uber_job_ready(UberJobId(1), 100).unwrap();
        assert!(exec.limit_row_complete());
    }

    #[test]
    fn unassign_requeues_until_max_attempts_then_fails() {
        let exec = QueryExecutive::new(QueryId(1), 2, None);
        exec.add_job(JobId(1), 6630);
        exec.register_uber_job(UberJobId(1), "worker-a".to_string(), vec![JobId(1)]);
        exec.unassign_jobs(UberJobId(1)).unwrap();
        assert!(exec.take_flag_failed_uber_job());

        exec.register_uber_job(UberJobId(2), "worker-a".to_string(), vec![JobId(1)]);
        exec.unassign_jobs(UberJobId(2)).unwrap();
        // attempt now 3 > max_attempts=2: query should be squashed.
        assert!(exec.is_cancelled());
    }

    #[test]
    fn squash_is_idempotent() {
        let exec = QueryExecutive::new(QueryId(1), 3, None);
        assert!(exec.squash());
        assert!(!exec.squash());
    }

    #[test]
    fn uber_jobs_for_worker_excludes_done_and_failed() {
        let exec = QueryExecutive::new(QueryId(1), 3, None);
        exec.add_job(JobId(1), 6630);
        exec.add_job(JobId(2), 6800);
        exec.register_uber_job(UberJobId(1), "worker-a".to_string(), vec![JobId(1)]);
        exec.register_uber_job(UberJobId(2), "worker-a".to_string(), vec![JobId(2)]);
        exec.on_uber_job_ready(UberJobId(1), 10).unwrap();
        let outstanding = exec.uber_jobs_for_worker(&"worker-a".to_string());
        assert_eq!(outstanding, vec![UberJobId(2)]);
    }

    #[test]
    fn registry_prunes_untouched_queries() {
        let registry = ExecutiveRegistry::with_max_lifetime(Duration::from_millis(5));
        registry.insert(Arc::new(QueryExecutive::new(QueryId(1), 3, None)));
        std::thread::sleep(Duration::from_millis(20));
        let expired = registry.prune_stale();
        assert_eq!(expired, vec![QueryId(1)]);
        assert!(registry.get(QueryId(1)).is_none());
    }
}
