//! C5: blend scheduler. Multiplexes the priority lanes owned by C4, and owns
//! the booting/demotion governance spec.md section 4.5 describes. Grounded
//! in `examples/original_source/core/modules/wsched/ScanScheduler.cc` (the
//! original's only concrete scan-lane scheduler) and
//! `src/wpublish/QueriesAndChunks.cc`'s percent-of-total-time booting
//! formula.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::memman;
use crate::task::{Task, TaskId};
use crate::worker::query_stats::QueriesAndChunks;
use crate::worker::scheduler::ScanScheduler;

pub struct BlendSchedulerConfig {
    pub max_tasks_booted_per_user_query: u32,
    pub max_concurrent_booted_tasks: u32,
}

/// Lanes are checked in priority order (lowest numeric priority value
/// first), the way `BlendScheduler::ready` walks `_schedulers` in the
/// original -- fast/interactive lanes get first refusal.
pub struct BlendScheduler {
    cfg: BlendSchedulerConfig,
    lanes: Vec<Arc<ScanScheduler>>,
    stats: Arc<QueriesAndChunks>,
    booted_total: AtomicU32,
}

impl BlendScheduler {
    pub fn new(
        cfg: BlendSchedulerConfig,
        mut lanes: Vec<Arc<ScanScheduler>>,
        stats: Arc<QueriesAndChunks>,
    ) -> Self {
        lanes.sort_by_key(|l| l.priority());
        Self {
            cfg,
            lanes,
            stats,
            booted_total: AtomicU32::new(0),
        }
    }

    pub fn lanes(&self) -> &[Arc<ScanScheduler>] {
        &self.lanes
    }

    /// Routes a new task to the lane matching its slowest scan table rating,
    /// per spec.md section 4.3 ("route by worst-case rating among the
    /// task's scan tables").
    pub fn queue_task(&self, task: Arc<Task>) {
        let rating = task.scan_rating() as u8;
        let lane = self
            .lanes
            .iter()
            .find(|l| l.min_rating() == rating)
            .or_else(|| self.lanes.iter().find(|l| rating <= l.min_rating()))
            .unwrap_or_else(|| self.lanes.last().expect("blend scheduler has no lanes"));
        lane.queue_task(task);
    }

    /// Picks the first lane with a ready task, in priority order. Blocking
    /// (`wait = true`) callers park on whichever lane they're assigned to at
    /// the worker's thread-pool layer; this call itself never blocks.
    /// Returns the real memory-manager handle for the task's chunk so the
    /// caller can grant it before running.
    pub fn get_cmd(&self) -> Option<(Arc<ScanScheduler>, Arc<Task>, memman::Handle)> {
        for lane in &self.lanes {
            if let Some((task, handle)) = lane.get_cmd(false) {
                return Some((lane.clone(), task, handle));
            }
        }
        None
    }

    pub fn command_finish(&self, lane: &ScanScheduler, task: &Arc<Task>) {
        lane.command_finish(task);
    }

    /// Called by the thread pool when a task may have overrun its share of
    /// its lane's time budget. Per spec.md section 4.5:
    /// `percent = avgCompletion(task.slowestTable, task.chunk) /
    /// sum(avgCompletion(task.slowestTable, *))`, `maxTimeChunk = percent *
    /// lane.maxTimeMinutes`; boots only once `runMinutes > maxTimeChunk` and
    /// enough samples exist to make `percent` meaningful. Demotes the
    /// worst-offending query's booted count, matching
    /// `SchedulerBase::_incrCountForUserQuery`/booting behavior in the
    /// original.
    pub fn maybe_boot(&self, lane: &ScanScheduler, task: &Arc<Task>) -> bool {
        let running_minutes = task.run_duration().as_secs_f64() / 60.0;
        let Some(table) = task.slowest_table() else {
            return false;
        };
        let Some(percent) = self.stats.percent_share(table, task.chunk.chunk_id) else {
            return false;
        };
        let max_time_chunk = percent * lane.max_time_minutes();
        if running_minutes <= max_time_chunk {
            return false;
        }
        let booted_for_query = self.stats.record_boot(task.query_id);
        self.booted_total.fetch_add(1, Ordering::Relaxed);
        if booted_for_query > self.cfg.max_tasks_booted_per_user_query {
            self.stats.mark_demoted(task.query_id);
        }
        if self.booted_total.load(Ordering::Relaxed) > self.cfg.max_concurrent_booted_tasks {
            if let Some(worst) = self.stats.query_with_most_booted() {
                self.stats.mark_demoted(worst);
            }
        }
        lane.remove_task(task.id, true);
        true
    }

    pub fn total_booted(&self) -> u32 {
        self.booted_total.load(Ordering::Relaxed)
    }

    pub fn remove_task(&self, task_id: TaskId) -> bool {
        self.lanes.iter().any(|l| l.remove_task(task_id, true))
    }

    pub fn log_mem_man_stats(&self) {
        for lane in &self.lanes {
            lane.log_mem_man_stats();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{CzarId, JobId, QueryId};
    use crate::memman::MemMan;
    use crate::task::{ChunkCoords, ScanRating, ScanTableRef, TaskId};
    use crate::worker::scheduler::SchedulerConfig;

    fn mk_lane(name: &str, rating: u8, max_time_minutes: f64) -> Arc<ScanScheduler> {
        let mem_man = Arc::new(MemMan::new(1 << 30));
        let stats = Arc::new(QueriesAndChunks::new(3));
        ScanScheduler::new(
            SchedulerConfig {
                name: name.into(),
                max_threads: 4,
                max_reserve: 1,
                priority: rating as i32,
                max_active_chunks: 4,
                min_rating: rating,
                max_rating: rating,
                max_time_minutes,
            },
            mem_man,
            stats,
        )
    }

    fn mk_task(id: u64, rating: ScanRating) -> Arc<Task> {
        Arc::new(Task::new(
            TaskId(id),
            QueryId(1),
            JobId(id as i64),
            ChunkCoords {
                chunk_id: 6630,
                subchunk_id: -1,
            },
            0,
            vec![("LSST".into(), "Object".into())],
            vec![ScanTableRef {
                db: "LSST".into(),
                table: "Object_6630".into(),
                scan_rating: rating,
                lock_in_memory: true,
            }],
            false,
            1 << 20,
            CzarId(1),
        ))
    }

    #[test]
    fn routes_task_to_matching_lane_by_rating() {
        let fast = mk_lane("fast", ScanRating::Fast as u8, 5.0);
        let slow = mk_lane("slow", ScanRating::Slow as u8, 5.0);
        let stats = Arc::new(QueriesAndChunks::new(3));
        let blend = BlendScheduler::new(
            BlendSchedulerConfig {
                max_tasks_booted_per_user_query: 5,
                max_concurrent_booted_tasks: 10,
            },
            vec![fast.clone(), slow.clone()],
            stats,
        );
        blend.queue_task(mk_task(1, ScanRating::Slow));
        assert_eq!(slow.get_size(), 1);
        assert_eq!(fast.get_size(), 0);
    }

    #[test]
    fn boot_governance_demotes_after_threshold() {
        let fast = mk_lane("fast", ScanRating::Fast as u8, 0.0);
        let stats = Arc::new(QueriesAndChunks::new(3));
        // Seed enough completed samples for percent_share to become valid;
        // max_time_minutes=0.0 then makes any positive run time overrun.
        for _ in 0..3 {
            stats.record_completion("Object_6630", 6630, 1.0);
        }
        let blend = BlendScheduler::new(
            BlendSchedulerConfig {
                max_tasks_booted_per_user_query: 1,
                max_concurrent_booted_tasks: 100,
            },
            vec![fast.clone()],
            stats.clone(),
        );
        let t = mk_task(1, ScanRating::Fast);
        blend.queue_task(t.clone());
        let (lane, got, handle) = blend.get_cmd().unwrap();
        got.mark_executing(handle);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(blend.maybe_boot(&lane, &got));
        assert!(blend.maybe_boot(&lane, &got) || stats.is_demoted(got.query_id));
    }

    #[test]
    fn maybe_boot_skips_without_enough_samples() {
        let fast = mk_lane("fast", ScanRating::Fast as u8, 0.0);
        let stats = Arc::new(QueriesAndChunks::new(3));
        let blend = BlendScheduler::new(
            BlendSchedulerConfig {
                max_tasks_booted_per_user_query: 1,
                max_concurrent_booted_tasks: 100,
            },
            vec![fast.clone()],
            stats,
        );
        let t = mk_task(1, ScanRating::Fast);
        blend.queue_task(t.clone());
        let (lane, got, handle) = blend.get_cmd().unwrap();
        got.mark_executing(handle);
        assert!(!blend.maybe_boot(&lane, &got));
    }
}
