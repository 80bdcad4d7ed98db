//! C6: worker query runner. Executes a [`Task`] and writes its result rows to
//! a framed result file the czar later streams back (spec.md sections 3,
//! 4.6). Grounded in `examples/original_source/src/wbase/Task.cc`.
//!
//! There is no real MariaDB storage engine in this crate's scope, so row
//! production is delegated to a [`RowSource`] the binary wires up; the parts
//! that matter for this spec -- memory-grant lifecycle, framing, cancellation,
//! oversized-row handling -- are real.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{QservError, Result};
use crate::memman::{self, MemMan};
use crate::task::{Task, TaskState};
use crate::transport::frame::{encode_frame, ResultMessage, Row, Schema};

/// Supplies rows for a task. A real implementation queries MariaDB; tests
/// and the reference binaries use an in-memory stand-in.
pub trait RowSource: Send {
    fn schema(&mut self) -> Result<Schema>;
    /// Returns the next batch of rows, or `None` at end of result set.
    fn next_batch(&mut self) -> Result<Option<Vec<Row>>>;
}

/// Stand-in [`RowSource`] for the worker binary's execution loop: there is
/// no MariaDB client in scope (spec.md section 1 Non-goals), so this yields
/// an empty schema and no rows rather than executing anything.
#[derive(Default)]
pub struct EmptyRowSource;

impl RowSource for EmptyRowSource {
    fn schema(&mut self) -> Result<Schema> {
        Ok(Vec::new())
    }

    fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        Ok(None)
    }
}

pub struct RunOutcome {
    pub result_path: PathBuf,
    pub row_count: u64,
    pub byte_count: u64,
}

/// Maximum single-row payload before a result is rejected outright, per the
/// open-question resolution in the module notes: an oversized row fails the
/// task rather than being silently truncated or split.
pub fn check_row_size(row_bytes: usize, max_result_table_bytes: u64) -> Result<()> {
    if row_bytes as u64 > max_result_table_bytes {
        return Err(QservError::ResultTooLarge(format!(
            "row of {row_bytes} bytes exceeds max_result_table_bytes={max_result_table_bytes}"
        )));
    }
    Ok(())
}

/// Runs `task` to completion, writing framed [`ResultMessage`]s to
/// `results_dir/<id_str>.res`. Acquires and releases the task's memory grant
/// around execution (invariant: EXECUTING only while a grant is held).
/// `handle` is the real grant the scheduler's `get_cmd` issued for this
/// task's chunk -- it must be threaded in rather than read back off the
/// task, whose own handle field is unset until `mark_executing` runs.
pub fn run_task(
    task: &Arc<Task>,
    mem_man: &MemMan,
    handle: memman::Handle,
    results_dir: &Path,
    mut source: impl RowSource,
) -> Result<RunOutcome> {
    if task.is_cancelled() {
        return Err(QservError::Cancelled);
    }

    task.mark_executing(handle);
    tracing::debug!(task = %task.id_str(), tables = ?task.physical_tables(), "executing task");

    let result = (|| -> Result<RunOutcome> {
        let schema = source.schema()?;
        let path = results_dir.join(format!("{}.res", sanitize(&task.id_str())));
        let mut file = File::create(&path)?;

        let mut total_rows: u64 = 0;
        let mut total_bytes: u64 = 0;
        let mut first = true;

        loop {
            if task.is_cancelled() {
                return Err(QservError::Cancelled);
            }
            task.set_state(TaskState::Reading);
            match source.next_batch()? {
                None => break,
                Some(rows) => {
                    for row in &rows {
                        let approx = serde_json::to_vec(row).map(|v| v.len()).unwrap_or(0);
                        check_row_size(approx, task.max_result_table_bytes)?;
                    }
                    let msg = ResultMessage::data(
                        rows,
                        if first { Some(schema.clone()) } else { None },
                    );
                    first = false;
                    total_rows += msg.row_count_delta;
                    let frame = encode_frame(&msg)?;
                    total_bytes += frame.len() as u64;
                    file.write_all(&frame)?;
                    task.add_bytes_written(frame.len() as u64);
                }
            }
        }

        let summary = ResultMessage::summary(total_rows, total_bytes);
        let frame = encode_frame(&summary)?;
        file.write_all(&frame)?;
        file.flush()?;

        Ok(RunOutcome {
            result_path: path,
            row_count: total_rows,
            byte_count: total_bytes,
        })
    })();

    mem_man.unlock(handle);
    task.mark_finished();
    result
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{CzarId, JobId, QueryId};
    use crate::memman::{LockType, TableInfo};
    use crate::task::{ChunkCoords, ScanRating, ScanTableRef, TaskId};
    use crate::transport::frame::{ColumnDef, FrameReader};

    fn mk_handle(mm: &MemMan, chunk_id: i64) -> memman::Handle {
        let tables = vec![TableInfo::new("Object_6630".into(), 1 << 20, LockType::Flexible)];
        let h = mm.prepare(&tables, chunk_id).unwrap();
        if h != memman::HANDLE_ISEMPTY {
            let _ = mm.lock(h, true);
        }
        h
    }

    struct FixedSource {
        schema: Schema,
        batches: Vec<Vec<Row>>,
        idx: usize,
    }

    impl RowSource for FixedSource {
        fn schema(&mut self) -> Result<Schema> {
            Ok(self.schema.clone())
        }
        fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
            if self.idx >= self.batches.len() {
                return Ok(None);
            }
            let b = self.batches[self.idx].clone();
            self.idx += 1;
            Ok(Some(b))
        }
    }

    fn mk_task() -> Arc<Task> {
        Arc::new(Task::new(
            TaskId(1),
            QueryId(1),
            JobId(1),
            ChunkCoords {
                chunk_id: 6630,
                subchunk_id: -1,
            },
            0,
            vec![("LSST".into(), "Object".into())],
            vec![ScanTableRef {
                db: "LSST".into(),
                table: "Object_6630".into(),
                scan_rating: ScanRating::Fast,
                lock_in_memory: false,
            }],
            false,
            1 << 20,
            CzarId(1),
        ))
    }

    #[test]
    fn writes_framed_result_file_and_finishes_task() {
        let dir = tempfile::tempdir().unwrap();
        let mm = MemMan::new(1 << 30);
        let task = mk_task();
        let source = FixedSource {
            schema: vec![ColumnDef {
                name: "id".into(),
                sql_type: "BIGINT".into(),
            }],
            batches: vec![vec![vec![serde_json::json!(1)], vec![serde_json::json!(2)]]],
            idx: 0,
        };
        let handle = mk_handle(&mm, task.chunk.chunk_id);
        let outcome = run_task(&task, &mm, handle, dir.path(), source).unwrap();
        assert_eq!(outcome.row_count, 2);
        assert!(task.is_finished());

        let bytes = std::fs::read(&outcome.result_path).unwrap();
        let mut reader = FrameReader::new();
        let msgs = reader.feed(&bytes).unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(msgs[1].0.end_of_stream);
    }

    #[test]
    fn cancelled_task_is_rejected_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let mm = MemMan::new(1 << 30);
        let task = mk_task();
        task.cancel();
        let source = FixedSource {
            schema: vec![],
            batches: vec![],
            idx: 0,
        };
        let handle = mk_handle(&mm, task.chunk.chunk_id);
        let err = run_task(&task, &mm, handle, dir.path(), source).unwrap_err();
        assert!(matches!(err, QservError::Cancelled));
    }

    #[test]
    fn oversized_row_fails_task_with_result_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let mm = MemMan::new(1 << 30);
        let task = Arc::new(Task::new(
            TaskId(2),
            QueryId(1),
            JobId(1),
            ChunkCoords {
                chunk_id: 6630,
                subchunk_id: -1,
            },
            0,
            vec![("LSST".into(), "Object".into())],
            vec![ScanTableRef {
                db: "LSST".into(),
                table: "Object_6630".into(),
                scan_rating: ScanRating::Fast,
                lock_in_memory: false,
            }],
            false,
            1024,
            CzarId(1),
        ));
        let huge = "x".repeat(4096);
        let source = FixedSource {
            schema: vec![ColumnDef {
                name: "blob".into(),
                sql_type: "TEXT".into(),
            }],
            batches: vec![vec![vec![serde_json::json!(huge)]]],
            idx: 0,
        };
        let handle = mk_handle(&mm, task.chunk.chunk_id);
        let err = run_task(&task, &mm, handle, dir.path(), source).unwrap_err();
        assert!(matches!(err, QservError::ResultTooLarge(_)));
        assert!(task.is_finished());
    }
}
