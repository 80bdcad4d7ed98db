//! C12, worker side: polls the czar on a fixed interval, reports this
//! worker's own health/queue depth, and reconciles the czar's
//! keep/delete-files directives against [`ResultFileGc`]. Grounded in
//! `examples/original_source/src/http/WorkerQueryStatusData.cc`'s
//! czar-contact loop and the teacher's `networking::health` heartbeat client.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::ids::WorkerId;
use crate::status::{CzarContactInfo, ResultDisposition, WorkerContactInfo};
use crate::worker::gc::ResultFileGc;

/// Minimal surface the status client needs from the worker's live state,
/// kept as a trait so tests can supply a fake without standing up real
/// schedulers.
pub trait WorkerHealthSource: Send + Sync {
    fn thread_pool_size(&self) -> u32;
    fn queue_size(&self) -> u32;
}

/// Cancels every in-flight task belonging to a query id at or below a
/// threshold, returning the distinct query ids that had something to
/// cancel. Implemented by [`crate::worker::rest::WorkerState`] so a czar
/// restart can claw back work the new czar process no longer recognizes.
pub trait WorkerCancelSink: Send + Sync {
    fn cancel_queries_at_or_below(&self, qid_threshold: i64) -> Vec<i64>;
}

pub struct StatusClient {
    worker_id: WorkerId,
    restart_epoch: u64,
    czar_base_url: String,
    http: reqwest::Client,
    gc: Arc<ResultFileGc>,
    health: Arc<dyn WorkerHealthSource>,
    cancel_sink: Arc<dyn WorkerCancelSink>,
    last_czar_epoch: Mutex<Option<u64>>,
    pending_ack: Mutex<Vec<i64>>,
}

impl StatusClient {
    pub fn new(
        worker_id: WorkerId,
        restart_epoch: u64,
        czar_base_url: impl Into<String>,
        gc: Arc<ResultFileGc>,
        health: Arc<dyn WorkerHealthSource>,
        cancel_sink: Arc<dyn WorkerCancelSink>,
    ) -> Self {
        Self {
            worker_id,
            restart_epoch,
            czar_base_url: czar_base_url.into(),
            http: reqwest::Client::new(),
            gc,
            health,
            cancel_sink,
            last_czar_epoch: Mutex::new(None),
            pending_ack: Mutex::new(Vec::new()),
        }
    }

    fn contact_info(&self) -> WorkerContactInfo {
        WorkerContactInfo {
            worker_id: self.worker_id.clone(),
            worker_restart_epoch: self.restart_epoch,
            thread_pool_size: self.health.thread_pool_size(),
            queue_size: self.health.queue_size(),
            acknowledged_dead_uberjobs: Vec::new(),
            cancelled_qids: std::mem::take(&mut self.pending_ack.lock()),
        }
    }

    /// One poll cycle: POST this worker's contact info, apply the czar's
    /// file-disposition directives locally, return the czar's reply for the
    /// caller to log/inspect.
    pub async fn poll_once(&self) -> Result<CzarContactInfo> {
        let body = self.contact_info();
        let resp = self
            .http
            .post(format!("{}/worker-status", self.czar_base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let czar_info: CzarContactInfo = resp.json().await?;
        self.apply(&czar_info);
        Ok(czar_info)
    }

    /// Applies a received [`CzarContactInfo`] to local disk state without
    /// making a network call, split out so it's directly testable.
    pub fn apply(&self, info: &CzarContactInfo) {
        for qid in &info.qid_done_delete_files {
            let _ = self.gc.delete_query(crate::ids::QueryId(*qid));
        }
        // Queries the czar says to keep need no action here: the GC's
        // age-based sweep (trigger 2) is the only thing that will ever
        // touch them, and only once they're stale.
        let _ = ResultDisposition::KeepFiles;

        let mut last_epoch = self.last_czar_epoch.lock();
        let epoch_changed = *last_epoch != Some(info.czar_restart_epoch);
        *last_epoch = Some(info.czar_restart_epoch);
        drop(last_epoch);

        if epoch_changed {
            if let Some(threshold) = info.czar_restart_cancel_qid {
                let cancelled = self.cancel_sink.cancel_queries_at_or_below(threshold);
                for qid in &cancelled {
                    let _ = self.gc.delete_query(crate::ids::QueryId(*qid));
                }
                if !cancelled.is_empty() {
                    tracing::warn!(threshold, ?cancelled, "cancelled pre-restart queries after czar restart");
                    self.pending_ack.lock().extend(cancelled);
                }
            }
        }
    }

    pub async fn run_forever(&self, interval: Duration) {
        // Stagger the first poll so a fleet of workers restarted together
        // doesn't hit the czar's `/worker-status` endpoint in lockstep.
        use rand::Rng;
        let jitter_ms = rand::rng().random_range(0..interval.as_millis().max(1) as u64);
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                tracing::warn!(worker = %self.worker_id, error = %e, "status poll to czar failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeHealth {
        pool: AtomicU32,
        queue: AtomicU32,
    }

    impl WorkerHealthSource for FakeHealth {
        fn thread_pool_size(&self) -> u32 {
            self.pool.load(Ordering::Relaxed)
        }
        fn queue_size(&self) -> u32 {
            self.queue.load(Ordering::Relaxed)
        }
    }

    struct FakeCancelSink {
        cancelled: Mutex<Vec<i64>>,
    }

    impl WorkerCancelSink for FakeCancelSink {
        fn cancel_queries_at_or_below(&self, qid_threshold: i64) -> Vec<i64> {
            self.cancelled.lock().push(qid_threshold);
            vec![1, 2, 3]
                .into_iter()
                .filter(|q| *q <= qid_threshold)
                .collect()
        }
    }

    fn mk_client(gc: Arc<ResultFileGc>, cancel_sink: Arc<FakeCancelSink>) -> StatusClient {
        let health = Arc::new(FakeHealth {
            pool: AtomicU32::new(8),
            queue: AtomicU32::new(0),
        });
        StatusClient::new("worker1".to_string(), 1, "http://localhost", gc, health, cancel_sink)
    }

    #[test]
    fn apply_deletes_only_delete_files_queries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("QID=1:jobId=1.res"), b"x").unwrap();
        std::fs::write(dir.path().join("QID=2:jobId=1.res"), b"x").unwrap();
        let gc = Arc::new(ResultFileGc::new(dir.path(), Duration::from_secs(3600)));
        let cancel_sink = Arc::new(FakeCancelSink { cancelled: Mutex::new(vec![]) });
        let client = mk_client(gc.clone(), cancel_sink);

        let mut info = CzarContactInfo::new(1, 0);
        info.add_query(crate::ids::QueryId(1), ResultDisposition::DeleteFiles);
        info.add_query(crate::ids::QueryId(2), ResultDisposition::KeepFiles);
        client.apply(&info);

        let remaining = gc.list(dir.path());
        assert!(!remaining.contains("QID=1:jobId=1.res"));
        assert!(remaining.contains("QID=2:jobId=1.res"));
    }

    #[test]
    fn czar_restart_triggers_cancellation_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("QID=2:jobId=1.res"), b"x").unwrap();
        let gc = Arc::new(ResultFileGc::new(dir.path(), Duration::from_secs(3600)));
        let cancel_sink = Arc::new(FakeCancelSink { cancelled: Mutex::new(vec![]) });
        let client = mk_client(gc.clone(), cancel_sink.clone());

        let mut info = CzarContactInfo::new(1, 7);
        info.czar_restart_cancel_qid = Some(2);
        client.apply(&info);
        assert!(!gc.list(dir.path()).contains("QID=2:jobId=1.res"));
        assert_eq!(*cancel_sink.cancelled.lock(), vec![2]);
        assert_eq!(*client.pending_ack.lock(), vec![1, 2]);

        // Same epoch again: must not re-trigger cancellation.
        client.apply(&info);
        assert_eq!(*cancel_sink.cancelled.lock(), vec![2]);
    }
}
