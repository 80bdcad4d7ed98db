//! C12: czar<->worker liveness and result-file disposition protocol. Shared
//! wire types used by `worker::status_client` and `czar::health`. Grounded in
//! `examples/original_source/src/http/WorkerQueryStatusData.cc`'s
//! reciprocal-ack bookkeeping and `czarrestartcancelqid` handling.
//!
//! Messages are JSON (unlike the binary result-file frames) since this is a
//! low-volume control channel polled on a fixed interval.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::ids::{QueryId, UberJobId, WorkerId};

/// How a worker should dispose of a completed query's result files, decided
/// by the czar once a query is durably merged or complete. See the open-
/// question resolution in the module notes: `KeepFiles` applies while a
/// query is neither durably merged nor LIMIT-complete; `DeleteFiles` once
/// either condition holds, or on any other successful completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultDisposition {
    KeepFiles,
    DeleteFiles,
}

/// Czar's view of worker health, mirroring the `ActiveWorker` state machine:
/// a worker is `Alive` as long as it acknowledges status polls inside
/// `maxLifetime`, `Questionable` once it misses polls but is still within a
/// grace window, and `Dead` past that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerLiveness {
    Alive,
    Questionable,
    Dead,
}

/// Sent by the czar to a worker on each status poll: which queries it should
/// keep vs. delete result files for, which uber-jobs it should consider dead
/// (e.g. because the czar itself restarted and no longer recognizes them),
/// and the czar's own restart epoch so the worker can detect a czar bounce.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CzarContactInfo {
    pub czar_id: i64,
    pub czar_restart_epoch: u64,
    pub qid_done_keep_files: Vec<i64>,
    pub qid_done_delete_files: Vec<i64>,
    pub qid_dead_uberjobs: Vec<i64>,
    /// Set once after a czar restart: every query id at or below this value
    /// predates the restart and is unrecognized by the new czar process, so
    /// the worker must cancel its in-flight tasks and drop its result files
    /// (spec.md boundary scenario "czar restart").
    #[serde(default)]
    pub czar_restart_cancel_qid: Option<i64>,
}

impl CzarContactInfo {
    pub fn new(czar_id: i64, czar_restart_epoch: u64) -> Self {
        Self {
            czar_id,
            czar_restart_epoch,
            ..Default::default()
        }
    }

    pub fn add_query(&mut self, qid: QueryId, disposition: ResultDisposition) {
        match disposition {
            ResultDisposition::KeepFiles => self.qid_done_keep_files.push(qid.0),
            ResultDisposition::DeleteFiles => self.qid_done_delete_files.push(qid.0),
        }
    }

    pub fn add_dead_uberjob(&mut self, uj: UberJobId) {
        self.qid_dead_uberjobs.push(uj.0);
    }
}

/// Sent by a worker back to the czar: its own restart epoch plus whatever
/// uber-jobs it reciprocally considers abandoned (the czar asked about a
/// query the worker has no record of, or vice versa) -- the "reciprocal ack"
/// behavior noted in the module notes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerContactInfo {
    pub worker_id: WorkerId,
    pub worker_restart_epoch: u64,
    pub thread_pool_size: u32,
    pub queue_size: u32,
    pub acknowledged_dead_uberjobs: Vec<i64>,
    /// Query ids the worker cancelled in response to the previous poll's
    /// `czar_restart_cancel_qid`, reported back once so the czar's logs can
    /// confirm the cutover took effect.
    #[serde(default)]
    pub cancelled_qids: Vec<i64>,
}

/// Age-based pruning: the czar drops bookkeeping entries for
/// queries/uberjobs older than `max_lifetime` that have not been
/// reconfirmed, mirroring `ActiveWorker::_removeDeadEntries`.
pub struct AgeTracker<T> {
    max_lifetime: Duration,
    entries: Vec<(T, Instant)>,
}

impl<T: Clone + PartialEq> AgeTracker<T> {
    pub fn new(max_lifetime: Duration) -> Self {
        Self {
            max_lifetime,
            entries: Vec::new(),
        }
    }

    pub fn touch(&mut self, item: T, now: Instant) {
        if let Some(e) = self.entries.iter_mut().find(|(v, _)| *v == item) {
            e.1 = now;
        } else {
            self.entries.push((item, now));
        }
    }

    pub fn prune(&mut self, now: Instant) -> Vec<T> {
        let max_lifetime = self.max_lifetime;
        let (keep, expired): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|(_, t)| now.duration_since(*t) <= max_lifetime);
        self.entries = keep;
        expired.into_iter().map(|(v, _)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_info_buckets_by_disposition() {
        let mut c = CzarContactInfo::new(1, 0);
        c.add_query(QueryId(10), ResultDisposition::KeepFiles);
        c.add_query(QueryId(11), ResultDisposition::DeleteFiles);
        assert_eq!(c.qid_done_keep_files, vec![10]);
        assert_eq!(c.qid_done_delete_files, vec![11]);
    }

    #[test]
    fn age_tracker_prunes_only_stale_entries() {
        let mut tr = AgeTracker::new(Duration::from_millis(10));
        let t0 = Instant::now();
        tr.touch(1i64, t0);
        tr.touch(2i64, t0);
        let later = t0 + Duration::from_millis(50);
        tr.touch(1i64, later);
        let expired = tr.prune(later);
        assert_eq!(expired, vec![2]);
        assert_eq!(tr.len(), 1);
    }
}
