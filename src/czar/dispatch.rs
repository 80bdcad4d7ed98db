//! C10's dispatch loop: turns a query's per-chunk sub-query descriptors into
//! worker-bound HTTP POSTs, the step between the executive registering an
//! uber-job and the worker ever seeing a task. Grounded in
//! `examples/original_source/src/qdisp/UberJob.cc`'s `runUberJob`, which
//! POSTs the assembled payload to a worker's `/queryjob` endpoint, and the
//! teacher's `networking::manager` connection-pool-bounded dispatch style.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::czar::chunk_map::{ChunkMap, DispatchRound};
use crate::czar::executive::QueryExecutive;
use crate::czar::uberjob::{self, SubQueryDescriptor, UberJob};
use crate::error::{QservError, Result};
use crate::ids::{QueryId, UberJobId, WorkerId};
use crate::worker::rest::{QueryJobRequest, ScanTableSpec, TaskSpec};

/// Bounds how many `/queryjob` POSTs are in flight at once, per
/// `CzarConfig::dispatch_pool_size`.
pub struct Dispatcher {
    http: reqwest::Client,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(pool_size: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            semaphore: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    /// One dispatch round for a single query: selects a worker per chunk
    /// (C8), assembles the resulting uber-jobs (C9), registers each with
    /// `exec` (C10), and POSTs them to their worker. Returns the uber-job
    /// ids assigned this round.
    pub async fn dispatch_round(
        &self,
        exec: &Arc<QueryExecutive>,
        map: &ChunkMap,
        worker_urls: &HashMap<WorkerId, String>,
        descriptors_by_chunk: Vec<(i64, SubQueryDescriptor)>,
        next_uber_job_id: &mut i64,
    ) -> Result<Vec<UberJobId>> {
        let mut round = DispatchRound::new();
        let mut by_worker = Vec::with_capacity(descriptors_by_chunk.len());
        for (chunk, desc) in descriptors_by_chunk {
            let worker = round.select_worker(map, chunk)?;
            by_worker.push((worker, desc));
        }

        let ubers = uberjob::assemble(by_worker, *next_uber_job_id);
        if let Some(last) = ubers.last() {
            *next_uber_job_id = last.id.0 + 1;
        }

        let mut ids = Vec::with_capacity(ubers.len());
        for uber in &ubers {
            let job_ids = uber.tasks.iter().map(|t| t.job_id).collect();
            exec.register_uber_job(uber.id, uber.worker.clone(), job_ids);
            ids.push(uber.id);

            let url = worker_urls.get(&uber.worker).ok_or_else(|| {
                QservError::Configuration(format!("no base URL known for worker {}", uber.worker))
            })?;
            self.post_uber_job(url, exec.query_id, uber).await?;
        }
        Ok(ids)
    }

    async fn post_uber_job(&self, worker_url: &str, query_id: QueryId, uber: &UberJob) -> Result<()> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| QservError::Internal(e.to_string()))?;

        let tasks = uber
            .tasks
            .iter()
            .map(|t| TaskSpec {
                job_id: t.job_id.0,
                chunk_id: t.chunk_id,
                subchunk_id: t.subchunk_ids.first().copied().unwrap_or(crate::ids::NO_SUBCHUNK),
                template_id: t.template_indices.first().copied().unwrap_or(0) as u32,
                tables: t.table_indices.iter().map(|&i| uber.tables[i].clone()).collect(),
                scan_tables: uber
                    .scan_tables
                    .iter()
                    .map(|(db, table, rating, lock)| ScanTableSpec {
                        db: db.clone(),
                        table: table.clone(),
                        scan_rating: *rating as u8,
                        lock_in_memory: *lock,
                    })
                    .collect(),
                interactive: t.interactive,
                max_result_table_bytes: t.max_result_table_bytes,
            })
            .collect();

        let body = QueryJobRequest {
            query_id: query_id.0,
            uber_job_id: uber.id.0,
            czar_id: 0,
            tasks,
        };

        self.http
            .post(format!("{worker_url}/queryjob"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::JobId;
    use crate::task::ScanRating;
    use std::collections::HashMap as Map;

    fn mk_map() -> ChunkMap {
        let mut layout: Map<WorkerId, Map<String, Map<String, Vec<(i64, u64)>>>> = Map::new();
        let db = Map::from([("Object".to_string(), vec![(6630, 100)])]);
        layout.insert("worker-a".to_string(), Map::from([("LSST".to_string(), db)]));
        ChunkMap::from_layout(&layout)
    }

    fn mk_desc(job: i64, chunk: i64) -> SubQueryDescriptor {
        SubQueryDescriptor {
            job_id: JobId(job),
            chunk_id: chunk,
            subchunk_ids: vec![],
            templates: vec!["SELECT * FROM %T%;".to_string()],
            tables: vec![("LSST".to_string(), "Object".to_string())],
            scan_tables: vec![("LSST".to_string(), "Object".to_string(), ScanRating::Fast, true)],
            interactive: false,
            max_result_table_bytes: 1 << 20,
        }
    }

    #[tokio::test]
    async fn dispatch_round_registers_uber_job_before_posting() {
        let dispatcher = Dispatcher::new(2);
        let map = mk_map();
        let exec = Arc::new(QueryExecutive::new(QueryId(1), 3, None));
        exec.add_job(JobId(1), 6630);

        // No URL known for worker-a: the POST must fail, but registration
        // (C10 bookkeeping) happens first and must still be observable.
        let worker_urls = HashMap::new();
        let err = dispatcher
            .dispatch_round(&exec, &map, &worker_urls, vec![(6630, mk_desc(1, 6630))], &mut 1)
            .await
            .unwrap_err();
        assert!(matches!(err, QservError::Configuration(_)));

        let pending = exec.pending_jobs();
        assert!(pending.is_empty(), "job should have moved past Pending once assigned");
    }
}
