//! C4: scan scheduler -- one instance per priority lane (fast/medium/slow/
//! snail). Owns a [`ChunkTasksQueue`], bounds concurrency, and enforces
//! per-lane active-chunk caps. Grounded in
//! `examples/original_source/core/modules/wsched/ScanScheduler.cc`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::memman::{self, MemMan};
use crate::task::{Task, TaskId};
use crate::worker::chunk_queue::ChunkTasksQueue;
use crate::worker::query_stats::QueriesAndChunks;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub name: String,
    pub max_threads: u32,
    pub max_reserve: u32,
    pub priority: i32,
    pub max_active_chunks: u32,
    pub min_rating: u8,
    pub max_rating: u8,
    pub max_time_minutes: f64,
}

struct Inner {
    queue: ChunkTasksQueue,
    in_flight: u32,
    mem_man_handle_to_unlock: Option<memman::Handle>,
    active_chunks: HashSet<i64>,
    chunk_inflight_local: HashMap<i64, u32>,
    running: HashMap<TaskId, Arc<Task>>,
    threads_adj: i32,
}

pub struct ScanScheduler {
    cfg: SchedulerConfig,
    mem_man: Arc<MemMan>,
    stats: Arc<QueriesAndChunks>,
    inner: Mutex<Inner>,
    cv: Condvar,
    info_changed: AtomicBool,
    reserve_in_use: AtomicU32,
}

impl ScanScheduler {
    pub fn new(cfg: SchedulerConfig, mem_man: Arc<MemMan>, stats: Arc<QueriesAndChunks>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            mem_man: mem_man.clone(),
            stats,
            inner: Mutex::new(Inner {
                queue: ChunkTasksQueue::new(mem_man),
                in_flight: 0,
                mem_man_handle_to_unlock: None,
                active_chunks: HashSet::new(),
                chunk_inflight_local: HashMap::new(),
                running: HashMap::new(),
                threads_adj: 0,
            }),
            cv: Condvar::new(),
            info_changed: AtomicBool::new(true),
            reserve_in_use: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn priority(&self) -> i32 {
        self.cfg.priority
    }

    pub fn min_rating(&self) -> u8 {
        self.cfg.min_rating
    }

    pub fn reserve(&self) -> u32 {
        self.cfg.max_reserve
    }

    pub fn max_time_minutes(&self) -> f64 {
        self.cfg.max_time_minutes
    }

    fn effective_max_threads(&self, inner: &Inner) -> u32 {
        (self.cfg.max_threads as i32 + inner.threads_adj).max(0) as u32
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.lock().in_flight
    }

    pub fn get_size(&self) -> usize {
        self.inner.lock().queue.get_size()
    }

    pub fn queue_task(&self, task: Arc<Task>) {
        task.mark_queued();
        let mut inner = self.inner.lock();
        self.stats.incr_count_for_user_query(task.query_id);
        inner.queue.queue_task(task);
        self.info_changed.store(true, Ordering::Relaxed);
        drop(inner);
        self.cv.notify_all();
    }

    pub fn ready(&self) -> bool {
        let mut inner = self.inner.lock();
        self._ready(&mut inner)
    }

    fn _ready(&self, inner: &mut Inner) -> bool {
        if inner.in_flight >= self.effective_max_threads(inner) {
            return false;
        }
        if inner.queue.next_task_different_chunk_id()
            && inner.active_chunks.len() as u32 >= self.cfg.max_active_chunks
        {
            return false;
        }
        let use_flexible_lock = inner.in_flight == 0;
        let mut rdy = inner.queue.ready(use_flexible_lock);
        if let Some(handle) = inner.mem_man_handle_to_unlock.take() {
            self.mem_man.unlock(handle);
            if !rdy {
                rdy = inner.queue.ready(use_flexible_lock);
            }
        }
        rdy
    }

    /// Blocks (via condvar) when `wait` is true, the way
    /// `util::CommandQueue::_cv.wait` does in the original. Returns the real
    /// memory-manager handle backing the task's chunk alongside it, so the
    /// caller can grant it to the task before running (the handle the task
    /// carries is still unset at this point).
    pub fn get_cmd(&self, wait: bool) -> Option<(Arc<Task>, memman::Handle)> {
        let mut inner = self.inner.lock();
        if wait {
            while !self._ready(&mut inner) {
                self.cv.wait_for(&mut inner, Duration::from_millis(200));
            }
        } else if !self._ready(&mut inner) {
            return None;
        }
        let use_flexible_lock = inner.in_flight == 0;
        let got = inner.queue.get_task(use_flexible_lock);
        if let Some((task, _handle)) = &got {
            inner.in_flight += 1;
            self.info_changed.store(true, Ordering::Relaxed);
            self.stats.decr_count_for_user_query(task.query_id);
            self.stats.incr_chunk_task_count(task.chunk.chunk_id);
            *inner
                .chunk_inflight_local
                .entry(task.chunk.chunk_id)
                .or_insert(0) += 1;
            inner.active_chunks.insert(task.chunk.chunk_id);
            inner.running.insert(task.id, task.clone());
        }
        got
    }

    pub fn command_start(&self, _task: &Arc<Task>) {
        self.info_changed.store(true, Ordering::Relaxed);
    }

    pub fn command_finish(&self, task: &Arc<Task>) {
        let mut inner = self.inner.lock();
        inner.queue.task_complete(task);
        inner.running.remove(&task.id);
        inner.in_flight = inner.in_flight.saturating_sub(1);

        if let Some(old) = inner.mem_man_handle_to_unlock.take() {
            self.mem_man.unlock(old);
        }

        let chunk_id = task.chunk.chunk_id;
        if let Some(count) = inner.chunk_inflight_local.get_mut(&chunk_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.active_chunks.remove(&chunk_id);
            }
        }
        self.stats.decr_chunk_task_count(chunk_id);

        if let Some(table) = task.slowest_table() {
            let minutes = task.run_duration().as_secs_f64() / 60.0;
            self.stats.record_completion(table, chunk_id, minutes);
        }

        let handle = task.mem_handle();
        if !inner.queue.empty() {
            inner.mem_man_handle_to_unlock = Some(handle);
        } else {
            self.mem_man.unlock(handle);
        }
        drop(inner);
        self.cv.notify_all();
    }

    /// Returns true if the task was removed while still queued (not yet
    /// started -- still needs to run). A running task is detached from
    /// in-flight accounting but continues executing to completion.
    pub fn remove_task(&self, task_id: TaskId, remove_running: bool) -> bool {
        let mut inner = self.inner.lock();
        if let Some(removed) = inner.queue.remove_task(task_id) {
            let _ = removed;
            return true;
        }
        if !remove_running {
            return false;
        }
        if let Some(task) = inner.running.remove(&task_id) {
            inner.in_flight = inner.in_flight.saturating_sub(1);
            task.mark_booted();
        }
        false
    }

    pub fn running_tasks(&self) -> Vec<Arc<Task>> {
        self.inner.lock().running.values().cloned().collect()
    }

    pub fn log_mem_man_stats(&self) {
        tracing::debug!(lane = %self.cfg.name, stats = %self.mem_man.statistics().log_string(), "scan lane memman stats");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{CzarId, JobId, QueryId};
    use crate::task::{ChunkCoords, ScanRating, ScanTableRef};

    fn mk_task(id: u64, chunk_id: i64, q: i64) -> Arc<Task> {
        Arc::new(Task::new(
            TaskId(id),
            QueryId(q),
            JobId(id as i64),
            ChunkCoords {
                chunk_id,
                subchunk_id: -1,
            },
            0,
            vec![("LSST".into(), "Object".into())],
            vec![ScanTableRef {
                db: "LSST".into(),
                table: format!("Object_{chunk_id}"),
                scan_rating: ScanRating::Fast,
                lock_in_memory: true,
            }],
            false,
            1 << 20,
            CzarId(1),
        ))
    }

    fn mk_sched(max_threads: u32, max_active_chunks: u32) -> Arc<ScanScheduler> {
        let mem_man = Arc::new(MemMan::new(1 << 30));
        let stats = Arc::new(QueriesAndChunks::new(3));
        ScanScheduler::new(
            SchedulerConfig {
                name: "fast".into(),
                max_threads,
                max_reserve: 1,
                priority: 0,
                max_active_chunks,
                min_rating: 1,
                max_rating: 1,
                max_time_minutes: 5.0,
            },
            mem_man,
            stats,
        )
    }

    #[test]
    fn in_flight_respects_max_threads() {
        let sched = mk_sched(1, 4);
        sched.queue_task(mk_task(1, 6630, 1));
        sched.queue_task(mk_task(2, 6630, 1));
        let (t1, h1) = sched.get_cmd(false).unwrap();
        assert_ne!(h1, 0);
        assert_eq!(sched.in_flight(), 1);
        // Second task can't start: max_threads=1.
        assert!(sched.get_cmd(false).is_none());
        sched.command_finish(&t1);
        assert_eq!(sched.in_flight(), 0);
        let (t2, _h2) = sched.get_cmd(false).unwrap();
        assert_eq!(t2.id, TaskId(2));
    }

    #[test]
    fn remove_queued_task_reports_still_needs_running() {
        let sched = mk_sched(4, 4);
        let t = mk_task(1, 6630, 1);
        sched.queue_task(t.clone());
        assert!(sched.remove_task(t.id, false));
        assert!(sched.get_cmd(false).is_none());
    }

    #[test]
    fn remove_running_task_detaches_without_finishing() {
        let sched = mk_sched(4, 4);
        let t = mk_task(1, 6630, 1);
        sched.queue_task(t.clone());
        let (got, _handle) = sched.get_cmd(false).unwrap();
        assert!(!sched.remove_task(got.id, false));
        assert!(sched.remove_task(got.id, true));
        assert!(got.is_booted());
        assert_eq!(sched.in_flight(), 0);
    }
}
