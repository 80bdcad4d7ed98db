//! C14: health/heartbeat monitor. Grounded in spec.md section 4.15 and the
//! teacher's `networking::health` liveness-tracking module.
//!
//! Per worker, two independent `noResponseSeconds` counters -- replication
//! service and query service -- step up by `responseTimeoutSec` on a silent
//! probe and reset to zero on any response. A worker is nominated for
//! eviction only once *both* counters exceed `evictTimeoutSec`, and at most
//! one worker is evicted per round.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::ids::WorkerId;
use crate::status::WorkerLiveness;

#[derive(Debug, Clone, Copy, Default)]
struct WorkerCounters {
    replication_no_response_sec: u64,
    query_no_response_sec: u64,
}

pub struct HealthMonitor {
    response_timeout_sec: u64,
    evict_timeout_sec: u64,
    workers: Mutex<HashMap<WorkerId, WorkerCounters>>,
}

impl HealthMonitor {
    pub fn new(response_timeout_sec: u64, evict_timeout_sec: u64) -> Self {
        Self {
            response_timeout_sec,
            evict_timeout_sec,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn replication_responded(&self, worker: &WorkerId) {
        self.workers.lock().entry(worker.clone()).or_default().replication_no_response_sec = 0;
    }

    pub fn query_responded(&self, worker: &WorkerId) {
        self.workers.lock().entry(worker.clone()).or_default().query_no_response_sec = 0;
    }

    pub fn replication_silent(&self, worker: &WorkerId) {
        let mut w = self.workers.lock();
        w.entry(worker.clone()).or_default().replication_no_response_sec += self.response_timeout_sec;
    }

    pub fn query_silent(&self, worker: &WorkerId) {
        let mut w = self.workers.lock();
        w.entry(worker.clone()).or_default().query_no_response_sec += self.response_timeout_sec;
    }

    fn both_exceeded(&self, c: &WorkerCounters) -> bool {
        c.replication_no_response_sec > self.evict_timeout_sec && c.query_no_response_sec > self.evict_timeout_sec
    }

    /// One round: returns at most one worker to evict, even if several are
    /// silent -- a cluster-wide silence is treated as an operator problem,
    /// not something to act on automatically (spec.md section 4.15).
    pub fn poll_round(&self) -> Option<WorkerId> {
        let workers = self.workers.lock();
        workers
            .iter()
            .find(|(_, c)| self.both_exceeded(c))
            .map(|(id, _)| id.clone())
    }

    pub fn remove(&self, worker: &WorkerId) {
        self.workers.lock().remove(worker);
    }

    /// Classifies a worker's current standing: `Alive` while both services
    /// have responded recently, `Dead` once `poll_round` would nominate it
    /// for eviction, `Questionable` in between (spec.md section 4.15's
    /// `ActiveWorker` state machine).
    pub fn liveness(&self, worker: &WorkerId) -> WorkerLiveness {
        let workers = self.workers.lock();
        match workers.get(worker) {
            None => WorkerLiveness::Alive,
            Some(c) if c.replication_no_response_sec == 0 && c.query_no_response_sec == 0 => {
                WorkerLiveness::Alive
            }
            Some(c) if self.both_exceeded(c) => WorkerLiveness::Dead,
            Some(_) => WorkerLiveness::Questionable,
        }
    }

    /// Marks every worker in `known` silent for one round on both services.
    /// Called by the periodic health-probe task; an actual `/worker-status`
    /// response from a worker resets its counters before this would ever
    /// nominate it, the way a missed heartbeat only counts once nothing else
    /// touched the counter in between.
    pub fn mark_round_silent(&self, known: &[WorkerId]) {
        for w in known {
            self.replication_silent(w);
            self.query_silent(w);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_stays_alive_until_both_services_exceed_timeout() {
        let mon = HealthMonitor::new(10, 20);
        let w = "worker-a".to_string();
        mon.replication_silent(&w);
        mon.replication_silent(&w);
        mon.replication_silent(&w);
        // query service still responsive.
        mon.query_responded(&w);
        assert!(mon.poll_round().is_none());
    }

    #[test]
    fn worker_evicted_once_both_exceed_timeout() {
        let mon = HealthMonitor::new(10, 15);
        let w = "worker-a".to_string();
        for _ in 0..3 {
            mon.replication_silent(&w);
            mon.query_silent(&w);
        }
        assert_eq!(mon.poll_round(), Some(w));
    }

    #[test]
    fn response_resets_counter() {
        let mon = HealthMonitor::new(10, 5);
        let w = "worker-a".to_string();
        mon.replication_silent(&w);
        mon.query_silent(&w);
        mon.replication_responded(&w);
        mon.query_responded(&w);
        assert!(mon.poll_round().is_none());
    }

    #[test]
    fn liveness_reports_questionable_before_dead() {
        let mon = HealthMonitor::new(10, 20);
        let w = "worker-a".to_string();
        assert_eq!(mon.liveness(&w), WorkerLiveness::Alive);
        mon.replication_silent(&w);
        assert_eq!(mon.liveness(&w), WorkerLiveness::Questionable);
        mon.replication_silent(&w);
        mon.replication_silent(&w);
        mon.query_silent(&w);
        mon.query_silent(&w);
        mon.query_silent(&w);
        assert_eq!(mon.liveness(&w), WorkerLiveness::Dead);
    }

    #[test]
    fn only_one_worker_evicted_per_round() {
        let mon = HealthMonitor::new(10, 5);
        for w in ["worker-a", "worker-b"] {
            mon.replication_silent(&w.to_string());
            mon.query_silent(&w.to_string());
        }
        let evicted = mon.poll_round();
        assert!(evicted.is_some());
    }
}
