//! Shared `Task` definition used by the chunk queue (C3), the scan/blend
//! schedulers (C4/C5), the worker query runner (C6), and the per-query
//! aggregate that the czar's executive drives cancellation through.
//!
//! Tasks are arena-owned: the chunk queue is the unique owner of the `Task`
//! value, and everything else refers to it by `TaskId`, a cheap-to-copy
//! handle that is safe to pass across threads (spec.md section 9: "Re-
//! architect as arena + integer handle for tasks").

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::ids::{CzarId, JobId, QueryId, UberJobId, WorkerSeq};

/// Opaque handle into the arena owning `Task` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRating {
    Fast = 1,
    Medium = 2,
    Slow = 3,
    Snail = 4,
}

impl ScanRating {
    /// A task inherits the slowest rating among its referenced tables.
    pub fn slowest(tables: impl IntoIterator<Item = ScanRating>) -> Option<ScanRating> {
        tables.into_iter().max_by_key(|r| *r as u8)
    }
}

#[derive(Debug, Clone)]
pub struct ScanTableRef {
    pub db: String,
    pub table: String,
    pub scan_rating: ScanRating,
    pub lock_in_memory: bool,
}

/// Mutable lifecycle state of a `Task`. A task reaches EXECUTING only while
/// holding a memory grant; reaches FINISHED exactly once; once BOOTED it may
/// still complete I/O but its scheduler accounting is frozen (invariants 1
/// and 3 in the testable-properties section).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Queued,
    Started,
    Executing,
    Reading,
    Finished,
    Cancelled,
    Booted,
}

#[derive(Debug, Clone)]
pub struct ChunkCoords {
    pub chunk_id: i64,
    pub subchunk_id: i64,
}

/// The scheduling unit. Immutable fields are set at construction; mutable
/// fields use atomics so tasks can be observed concurrently by the runner,
/// the scheduler, and cancellation without a shared lock (spec.md section 5:
/// "tasks communicate back via lock-free atomics").
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub query_id: QueryId,
    pub job_id: JobId,
    pub uber_job_id: Option<UberJobId>,
    pub attempt: u32,
    pub chunk: ChunkCoords,
    pub fragment_index: usize,
    pub template_id: u32,
    pub subchunk_ids: Vec<i64>,
    pub tables: Vec<(String, String)>,
    pub scan_tables: Vec<ScanTableRef>,
    pub interactive: bool,
    pub max_result_table_bytes: u64,
    pub czar_id: CzarId,
    pub created: Instant,

    queued: AtomicBool,
    started: AtomicBool,
    finished: AtomicBool,
    cancelled: AtomicBool,
    booted: AtomicBool,
    state: parking_lot::Mutex<TaskState>,
    mem_handle: AtomicU64,
    mariadb_thread_id: AtomicI64,
    bytes_written: AtomicU64,
    worker_seq: AtomicU64,
    run_started_at: parking_lot::Mutex<Option<Instant>>,
}

impl Task {
    pub fn new(
        id: TaskId,
        query_id: QueryId,
        job_id: JobId,
        chunk: ChunkCoords,
        template_id: u32,
        tables: Vec<(String, String)>,
        scan_tables: Vec<ScanTableRef>,
        interactive: bool,
        max_result_table_bytes: u64,
        czar_id: CzarId,
    ) -> Self {
        Self {
            id,
            query_id,
            job_id,
            uber_job_id: None,
            attempt: 1,
            chunk,
            fragment_index: 0,
            template_id,
            subchunk_ids: Vec::new(),
            tables,
            scan_tables,
            interactive,
            max_result_table_bytes,
            czar_id,
            created: Instant::now(),
            queued: AtomicBool::new(false),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            booted: AtomicBool::new(false),
            state: parking_lot::Mutex::new(TaskState::Created),
            mem_handle: AtomicU64::new(0),
            mariadb_thread_id: AtomicI64::new(-1),
            bytes_written: AtomicU64::new(0),
            worker_seq: AtomicU64::new(0),
            run_started_at: parking_lot::Mutex::new(None),
        }
    }

    pub fn scan_rating(&self) -> ScanRating {
        ScanRating::slowest(self.scan_tables.iter().map(|t| t.scan_rating))
            .unwrap_or(ScanRating::Fast)
    }

    /// The table name driving this task's booting accounting key: the
    /// table with the slowest scan rating among those it touches (spec.md
    /// section 4.5's `task.slowestTable`).
    pub fn slowest_table(&self) -> Option<&str> {
        self.scan_tables
            .iter()
            .max_by_key(|t| t.scan_rating as u8)
            .map(|t| t.table.as_str())
    }

    pub fn id_str(&self) -> String {
        crate::ids::qid_str(self.query_id, Some(self.job_id), self.uber_job_id)
    }

    /// Physical table names this task's logical `(db, table)` references
    /// resolve to at this task's chunk/sub-chunk (C1).
    pub fn physical_tables(&self) -> Vec<String> {
        self.tables
            .iter()
            .map(|(_db, base)| crate::naming::physical_table(base, self.chunk.chunk_id, self.chunk.subchunk_id))
            .collect()
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub fn set_state(&self, s: TaskState) {
        *self.state.lock() = s;
    }

    pub fn mark_queued(&self) {
        self.queued.store(true, Ordering::Release);
        self.set_state(TaskState::Queued);
    }

    /// Transitions to EXECUTING. Callers must hold a memory grant before
    /// calling this (invariant 3).
    pub fn mark_executing(&self, mem_handle: u64) {
        self.mem_handle.store(mem_handle, Ordering::Release);
        self.started.store(true, Ordering::Release);
        *self.run_started_at.lock() = Some(Instant::now());
        self.set_state(TaskState::Executing);
    }

    pub fn mem_handle(&self) -> u64 {
        self.mem_handle.load(Ordering::Acquire)
    }

    pub fn set_mariadb_thread_id(&self, tid: i64) {
        self.mariadb_thread_id.store(tid, Ordering::Release);
    }

    pub fn mariadb_thread_id(&self) -> Option<i64> {
        let tid = self.mariadb_thread_id.load(Ordering::Acquire);
        if tid < 0 {
            None
        } else {
            Some(tid)
        }
    }

    pub fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn set_worker_seq(&self, seq: WorkerSeq) {
        self.worker_seq.store(seq, Ordering::Relaxed);
    }

    pub fn worker_seq(&self) -> WorkerSeq {
        self.worker_seq.load(Ordering::Relaxed)
    }

    /// A task reaches FINISHED exactly once (invariant in spec.md section 3).
    pub fn mark_finished(&self) -> bool {
        let first = self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.set_state(TaskState::Finished);
        }
        first
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Idempotent boot: once BOOTED, scheduler accounting is frozen but the
    /// task may continue running to completion.
    pub fn mark_booted(&self) -> bool {
        let first = self
            .booted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first && self.state() != TaskState::Finished {
            self.set_state(TaskState::Booted);
        }
        first
    }

    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::Acquire)
    }

    /// Idempotent cancel (spec.md section 5: "Task.cancel() called N times
    /// has the same externally observable effect as called once").
    pub fn cancel(&self) -> bool {
        let first = self
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first && !matches!(self.state(), TaskState::Finished) {
            self.set_state(TaskState::Cancelled);
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn run_duration(&self) -> Duration {
        self.run_started_at
            .lock()
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }
}
