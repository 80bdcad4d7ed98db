//! C9: uber-job assembler. Groups per-chunk sub-query descriptors destined
//! for the same worker into one dispatch payload, deduplicating templates
//! and scan tables (spec.md section 4.8). Grounded in
//! `examples/original_source/src/qdisp/UberJob.cc` and
//! `src/wbase/UberJobData.cc`.

use std::collections::HashMap;

use crate::ids::{JobId, UberJobId, WorkerId};
use crate::task::ScanRating;

#[derive(Debug, Clone)]
pub struct SubQueryDescriptor {
    pub job_id: JobId,
    pub chunk_id: i64,
    pub subchunk_ids: Vec<i64>,
    pub templates: Vec<String>,
    pub tables: Vec<(String, String)>,
    pub scan_tables: Vec<(String, String, ScanRating, bool)>,
    pub interactive: bool,
    pub max_result_table_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct UberJobTask {
    pub job_id: JobId,
    pub chunk_id: i64,
    pub subchunk_ids: Vec<i64>,
    pub template_indices: Vec<usize>,
    pub table_indices: Vec<usize>,
    pub interactive: bool,
    pub max_result_table_bytes: u64,
}

/// One dispatch payload: a worker-bound batch of sub-queries sharing a
/// deduplicated template table and `(db, table)` table.
#[derive(Debug, Clone)]
pub struct UberJob {
    pub id: UberJobId,
    pub worker: WorkerId,
    pub templates: Vec<String>,
    pub tables: Vec<(String, String)>,
    pub scan_tables: Vec<(String, String, ScanRating, bool)>,
    pub tasks: Vec<UberJobTask>,
}

/// Partitions `descriptors` by their already-selected worker and emits one
/// [`UberJob`] per partition, assigning ids from `next_id` onward.
pub fn assemble(
    descriptors: Vec<(WorkerId, SubQueryDescriptor)>,
    mut next_id: i64,
) -> Vec<UberJob> {
    let mut by_worker: HashMap<WorkerId, Vec<SubQueryDescriptor>> = HashMap::new();
    for (worker, desc) in descriptors {
        by_worker.entry(worker).or_default().push(desc);
    }

    let mut out = Vec::with_capacity(by_worker.len());
    for (worker, descs) in by_worker {
        let mut templates: Vec<String> = Vec::new();
        let mut tables: Vec<(String, String)> = Vec::new();
        let mut scan_tables: Vec<(String, String, ScanRating, bool)> = Vec::new();
        let mut tasks = Vec::with_capacity(descs.len());

        for d in &descs {
            let template_indices = d
                .templates
                .iter()
                .map(|t| dedup_index(&mut templates, t.clone()))
                .collect();
            let table_indices = d
                .tables
                .iter()
                .map(|t| dedup_index(&mut tables, t.clone()))
                .collect();
            for (db, table, rating, lock) in &d.scan_tables {
                match scan_tables.iter_mut().find(|(db2, tbl2, ..)| db2 == db && tbl2 == table) {
                    Some((_, _, existing_rating, existing_lock)) => {
                        *existing_rating = crate::common::max_scan_rating(*existing_rating, *rating);
                        *existing_lock = *existing_lock || *lock;
                    }
                    None => scan_tables.push((db.clone(), table.clone(), *rating, *lock)),
                }
            }
            tasks.push(UberJobTask {
                job_id: d.job_id,
                chunk_id: d.chunk_id,
                subchunk_ids: d.subchunk_ids.clone(),
                template_indices,
                table_indices,
                interactive: d.interactive,
                max_result_table_bytes: d.max_result_table_bytes,
            });
        }

        out.push(UberJob {
            id: UberJobId(next_id),
            worker,
            templates,
            tables,
            scan_tables,
            tasks,
        });
        next_id += 1;
    }
    out
}

fn dedup_index<T: PartialEq>(v: &mut Vec<T>, item: T) -> usize {
    if let Some(pos) = v.iter().position(|x| *x == item) {
        pos
    } else {
        v.push(item);
        v.len() - 1
    }
}
