//! C11: infile merger. Streams framed result bytes from a file-collect
//! command into a per-query result table, applying the idempotence and
//! back-pressure rules of spec.md section 4.10. Grounded in
//! `examples/original_source/core/modules/ccontrol/MergingHandler.cc`.
//!
//! There is no real MariaDB result table in this crate's scope; the "insert"
//! step is delegated to a [`RowSink`] so tests and the reference binaries
//! can observe merged rows without a database.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{QservError, Result};
use crate::ids::{JobId, QueryId, UberJobId};
use crate::transport::frame::{frame_hash, ResultMessage, Row, Schema};

pub trait RowSink: Send {
    fn create_table(&mut self, schema: &Schema) -> Result<()>;
    fn insert_batch(&mut self, rows: &[Row]) -> Result<()>;
}

/// Identifies one delivery attempt so duplicate deliveries of the same
/// `(Q, U, J, chunk, attempt)` are discarded rather than double-counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptKey {
    pub query_id: QueryId,
    pub uber_job_id: UberJobId,
    pub job_id: JobId,
    pub chunk_id: i64,
    pub attempt: u32,
}

pub struct InfileMerger {
    seen_attempts: Mutex<HashSet<AttemptKey>>,
    table_created: Mutex<bool>,
    rows_merged: std::sync::atomic::AtomicU64,
    bytes_merged: std::sync::atomic::AtomicU64,
    accepting: std::sync::atomic::AtomicBool,
    batch_threshold: usize,
}

pub struct MergeOutcome {
    pub rows_merged: u64,
    pub duplicate: bool,
}

impl InfileMerger {
    pub fn new(batch_threshold: usize) -> Self {
        Self {
            seen_attempts: Mutex::new(HashSet::new()),
            table_created: Mutex::new(false),
            rows_merged: std::sync::atomic::AtomicU64::new(0),
            bytes_merged: std::sync::atomic::AtomicU64::new(0),
            accepting: std::sync::atomic::AtomicBool::new(true),
            batch_threshold,
        }
    }

    /// Stop accepting further rows -- called once `limitRowComplete` fires,
    /// per spec.md section 4.9.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn rows_merged(&self) -> u64 {
        self.rows_merged.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Merges one already-decoded frame plus its raw payload (for hash
    /// verification). Returns `duplicate: true` without touching the sink
    /// if this attempt key was already merged.
    pub fn merge_frame(
        &self,
        key: AttemptKey,
        msg: ResultMessage,
        payload: &[u8],
        expected_hash: u32,
        sink: &Arc<Mutex<dyn RowSink>>,
    ) -> Result<MergeOutcome> {
        let actual = frame_hash(payload);
        if actual != expected_hash {
            return Err(QservError::Corruption(format!(
                "merge hash mismatch for {key:?}: expected {expected_hash:#010x} got {actual:#010x}"
            )));
        }

        {
            let mut seen = self.seen_attempts.lock();
            if !seen.insert(key) {
                return Ok(MergeOutcome {
                    rows_merged: 0,
                    duplicate: true,
                });
            }
        }

        if !self.is_accepting() {
            return Ok(MergeOutcome {
                rows_merged: 0,
                duplicate: false,
            });
        }

        if let Some(schema) = &msg.schema {
            let mut created = self.table_created.lock();
            if !*created {
                sink.lock().create_table(schema)?;
                *created = true;
            }
        }

        if !msg.rows.is_empty() {
            sink.lock().insert_batch(&msg.rows)?;
            self.rows_merged
                .fetch_add(msg.rows.len() as u64, std::sync::atomic::Ordering::Relaxed);
        }
        self.bytes_merged
            .fetch_add(payload.len() as u64, std::sync::atomic::Ordering::Relaxed);

        Ok(MergeOutcome {
            rows_merged: msg.rows.len() as u64,
            duplicate: false,
        })
    }

    pub fn batch_threshold(&self) -> usize {
        self.batch_threshold
    }
}
