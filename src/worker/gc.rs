//! C13: result-file garbage collection. Three independent triggers, per
//! spec.md section 4.13: (1) explicit delete once the czar reports a query
//! done-and-merged, (2) age-based sweep for files nobody ever collected, (3)
//! startup cleanup when `clean_up_on_start` is set. Grounded in
//! `examples/original_source/src/wpublish/QueriesAndChunks.cc`'s
//! file retention notes and the teacher's own disk-space reclaim pass in its
//! resource manager.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::Result;
use crate::ids::QueryId;

pub struct ResultFileGc {
    results_dir: PathBuf,
    max_age: Duration,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub deleted: Vec<PathBuf>,
    pub errors: Vec<(PathBuf, String)>,
}

impl ResultFileGc {
    pub fn new(results_dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            results_dir: results_dir.into(),
            max_age,
        }
    }

    /// Trigger 1: delete every `.res` file for a specific query once the
    /// czar has confirmed durable merge (or LIMIT-completion) and asked for
    /// `DeleteFiles` disposition.
    pub fn delete_query(&self, qid: QueryId) -> Result<SweepReport> {
        let prefix = format!("QID={}", qid.0);
        self.sweep_matching(|name| name.starts_with(&prefix))
    }

    /// Trigger 2: age-based sweep for anything older than `max_age` that was
    /// never explicitly collected (e.g. the czar crashed before asking).
    pub fn sweep_stale(&self) -> Result<SweepReport> {
        let now = SystemTime::now();
        let max_age = self.max_age;
        self.sweep_matching_with(|_, meta| {
            meta.modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .map(|age| age > max_age)
                .unwrap_or(false)
        })
    }

    /// Trigger 3: unconditional wipe at worker startup when
    /// `clean_up_on_start` is configured.
    pub fn clean_up_on_start(&self) -> Result<SweepReport> {
        self.sweep_matching(|_| true)
    }

    fn sweep_matching(&self, pred: impl Fn(&str) -> bool) -> Result<SweepReport> {
        self.sweep_matching_with(|name, _meta| pred(name))
    }

    fn sweep_matching_with(&self, pred: impl Fn(&str, &fs::Metadata) -> bool) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let entries = match fs::read_dir(&self.results_dir) {
            Ok(e) => e,
            Err(_) => return Ok(report),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    report.errors.push((path, e.to_string()));
                    continue;
                }
            };
            if !meta.is_file() || !pred(name, &meta) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => report.deleted.push(path),
                Err(e) => report.errors.push((path, e.to_string())),
            }
        }
        Ok(report)
    }

    /// Names currently present under the results directory, for tests and
    /// diagnostics.
    pub fn list(&self, dir: &Path) -> HashSet<String> {
        fs::read_dir(dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .collect()
    }
}
