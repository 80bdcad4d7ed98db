//! Per-chunk-per-table scheduler accounting and the per-query aggregate
//! ("user query info") that booting governance (spec.md section 4.5) reads.
//!
//! This is the `QueriesAndChunks` singleton spec.md section 9 calls out:
//! constructed once at worker startup and handed by `Arc` into every
//! scheduler and the runner, rather than reached for as a global.

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::ids::QueryId;

#[derive(Debug, Clone, Default)]
struct ChunkTableStats {
    completed: u32,
    booted: u32,
    rolling_avg_minutes: f64,
}

#[derive(Debug, Clone, Default)]
struct QueryAggregate {
    tasks_booted: u32,
    total_time_minutes: f64,
    demoted: bool,
    in_flight: u32,
}

pub struct QueriesAndChunks {
    required_tasks_completed: u32,
    chunk_table_stats: DashMap<(String, i64), Mutex<ChunkTableStats>>,
    queries: DashMap<QueryId, Mutex<QueryAggregate>>,
    chunk_in_flight: DashMap<i64, u32>,
}

impl QueriesAndChunks {
    pub fn new(required_tasks_completed: u32) -> Self {
        Self {
            required_tasks_completed,
            chunk_table_stats: DashMap::new(),
            queries: DashMap::new(),
            chunk_in_flight: DashMap::new(),
        }
    }

    pub fn incr_count_for_user_query(&self, q: QueryId) -> u32 {
        let entry = self.queries.entry(q).or_default();
        let mut g = entry.lock();
        g.in_flight += 1;
        g.in_flight
    }

    pub fn decr_count_for_user_query(&self, q: QueryId) {
        if let Some(entry) = self.queries.get(&q) {
            let mut g = entry.lock();
            g.in_flight = g.in_flight.saturating_sub(1);
        }
    }

    pub fn incr_chunk_task_count(&self, chunk: i64) {
        *self.chunk_in_flight.entry(chunk).or_insert(0) += 1;
    }

    pub fn decr_chunk_task_count(&self, chunk: i64) {
        if let Some(mut c) = self.chunk_in_flight.get_mut(&chunk) {
            *c = c.saturating_sub(1);
        }
    }

    /// Record a completed task's runtime for a (table, chunk) pair, updating
    /// a simple exponentially-weighted rolling average.
    pub fn record_completion(&self, table: &str, chunk: i64, minutes: f64) {
        let entry = self
            .chunk_table_stats
            .entry((table.to_string(), chunk))
            .or_default();
        let mut g = entry.lock();
        const ALPHA: f64 = 0.3;
        g.rolling_avg_minutes = crate::common::rolling_average(g.rolling_avg_minutes, minutes, g.completed, ALPHA);
        g.completed += 1;
    }

    fn avg_completion(&self, table: &str, chunk: i64) -> Option<(f64, u32)> {
        self.chunk_table_stats
            .get(&(table.to_string(), chunk))
            .map(|e| {
                let g = e.lock();
                (g.rolling_avg_minutes, g.completed)
            })
    }

    /// `percent = avgCompletion(table, chunk) / sum(avgCompletion(table, *))`
    /// (spec.md section 4.5). Returns `None` when fewer than
    /// `requiredTasksCompleted` samples exist for this chunk -- the caller
    /// must treat that as "invalid" and skip booting.
    pub fn percent_share(&self, table: &str, chunk: i64) -> Option<f64> {
        let (this_avg, completed) = self.avg_completion(table, chunk)?;
        if completed < self.required_tasks_completed {
            return None;
        }
        let total: f64 = self
            .chunk_table_stats
            .iter()
            .filter(|e| e.key().0 == table)
            .map(|e| e.value().lock().rolling_avg_minutes)
            .sum();
        if total <= 0.0 {
            return None;
        }
        Some(this_avg / total)
    }

    /// Returns the new booted count for the query.
    pub fn record_boot(&self, q: QueryId) -> u32 {
        let entry = self.queries.entry(q).or_default();
        let mut g = entry.lock();
        g.tasks_booted += 1;
        g.tasks_booted
    }

    pub fn tasks_booted(&self, q: QueryId) -> u32 {
        self.queries
            .get(&q)
            .map(|e| e.lock().tasks_booted)
            .unwrap_or(0)
    }

    pub fn mark_demoted(&self, q: QueryId) {
        if let Some(e) = self.queries.get(&q) {
            e.lock().demoted = true;
        }
    }

    pub fn is_demoted(&self, q: QueryId) -> bool {
        self.queries.get(&q).map(|e| e.lock().demoted).unwrap_or(false)
    }

    /// Total booted-task count across all currently tracked queries.
    pub fn total_booted(&self) -> u32 {
        self.queries.iter().map(|e| e.value().lock().tasks_booted).sum()
    }

    /// The query with the highest booted-task count, used to choose a
    /// demotion candidate once `maxConcurrentBootedTasks` is exceeded.
    pub fn query_with_most_booted(&self) -> Option<QueryId> {
        self.queries
            .iter()
            .max_by_key(|e| e.value().lock().tasks_booted)
            .map(|e| *e.key())
    }

    pub fn remove_query(&self, q: QueryId) {
        self.queries.remove(&q);
    }
}
