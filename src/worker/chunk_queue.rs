//! C3: chunk task queue.
//!
//! A two-level ordered queue: an outer FIFO of pending chunks, each holding
//! an inner FIFO of tasks waiting on that chunk. At most one chunk is
//! *active* at a time -- the one whose memory has been granted and whose
//! tasks may be issued next (invariant 2 in the testable-properties
//! section). Grounded in `ChunkTasksQueue`/`ChunkDisk` as described by
//! `core/modules/wsched/ScanScheduler.cc`.
//!
//! This type holds no internal lock: the owning scheduler (C4) serializes
//! all access under its own mutex, exactly as the original's `_taskQueue`
//! methods assume `util::CommandQueue::_mx` is held by the caller.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::memman::{self, LockType, MemMan, TableInfo};
use crate::task::Task;

struct ChunkEntry {
    chunk_id: i64,
    tasks: VecDeque<Arc<Task>>,
}

struct ActiveChunk {
    chunk_id: i64,
    handle: memman::Handle,
}

pub struct ChunkTasksQueue {
    mem_man: Arc<MemMan>,
    chunks: VecDeque<ChunkEntry>,
    active: Option<ActiveChunk>,
    /// Handle of the chunk that just exhausted, handed off to the
    /// scheduler for deferred release (spec.md section 4.2).
    pending_unlock: Option<memman::Handle>,
    size: usize,
}

impl ChunkTasksQueue {
    pub fn new(mem_man: Arc<MemMan>) -> Self {
        Self {
            mem_man,
            chunks: VecDeque::new(),
            active: None,
            pending_unlock: None,
            size: 0,
        }
    }

    pub fn queue_task(&mut self, task: Arc<Task>) {
        let chunk_id = task.chunk.chunk_id;
        if let Some(entry) = self.chunks.iter_mut().find(|e| e.chunk_id == chunk_id) {
            entry.tasks.push_back(task);
        } else {
            self.chunks.push_back(ChunkEntry {
                chunk_id,
                tasks: VecDeque::from([task]),
            });
        }
        self.size += 1;
    }

    pub fn get_size(&self) -> usize {
        self.size
    }

    pub fn empty(&self) -> bool {
        self.size == 0
    }

    /// True while the active chunk still has pending tasks -- the scheduler
    /// uses this to know advancing to a new chunk is imminent so it can
    /// enforce `maxActiveChunks`.
    pub fn next_task_different_chunk_id(&self) -> bool {
        match &self.active {
            Some(a) => self
                .chunks
                .front()
                .map(|e| e.chunk_id != a.chunk_id || e.tasks.is_empty())
                .unwrap_or(true),
            None => false,
        }
    }

    pub fn take_pending_unlock(&mut self) -> Option<memman::Handle> {
        self.pending_unlock.take()
    }

    /// Readiness discipline from spec.md section 4.2.
    pub fn ready(&mut self, use_flexible_lock: bool) -> bool {
        if self.active.is_none() {
            let entry = match self.chunks.front() {
                Some(e) => e,
                None => return false,
            };
            if entry.tasks.is_empty() {
                self.chunks.pop_front();
                return false;
            }
            let tables = union_table_infos(entry.tasks.iter());
            let handle = match self.mem_man.prepare(&tables, entry.chunk_id) {
                Ok(h) => h,
                Err(_) => return false,
            };
            if handle == memman::HANDLE_ISEMPTY {
                self.active = Some(ActiveChunk {
                    chunk_id: entry.chunk_id,
                    handle,
                });
                return true;
            }
            // `strict=true` (flexible lock) keeps a partially-granted lock
            // and proceeds; `strict=false` gives up and unlocks if any
            // REQUIRED table didn't lock, so the caller retries later.
            match self.mem_man.lock(handle, use_flexible_lock) {
                Ok(()) => {
                    self.active = Some(ActiveChunk {
                        chunk_id: entry.chunk_id,
                        handle,
                    });
                    true
                }
                Err(_) => {
                    if use_flexible_lock {
                        // Partial grant accepted anyway under flexible lock.
                        self.active = Some(ActiveChunk {
                            chunk_id: entry.chunk_id,
                            handle,
                        });
                        true
                    } else {
                        self.mem_man.unlock(handle);
                        false
                    }
                }
            }
        } else {
            true
        }
    }

    /// Returns the task plus the memory-manager handle backing its active
    /// chunk, so the caller can thread the real grant through to the runner
    /// instead of relying on the task's own (unset at this point) handle.
    pub fn get_task(&mut self, use_flexible_lock: bool) -> Option<(Arc<Task>, memman::Handle)> {
        if !self.ready(use_flexible_lock) {
            return None;
        }
        let active = self.active.as_ref()?;
        let active_id = active.chunk_id;
        let handle = active.handle;
        let entry = self.chunks.front_mut()?;
        debug_assert_eq!(entry.chunk_id, active_id);
        let task = entry.tasks.pop_front();
        if task.is_some() {
            self.size -= 1;
        }
        if entry.tasks.is_empty() {
            self.chunks.pop_front();
            if let Some(a) = self.active.take() {
                self.pending_unlock = Some(a.handle);
            }
        }
        task.map(|t| (t, handle))
    }

    pub fn task_complete(&mut self, _task: &Task) {
        // Completion bookkeeping (in-flight counters, rolling averages) is
        // owned by the scheduler and query-stats registry; the chunk queue
        // itself only orders pending work.
    }

    pub fn remove_task(&mut self, task_id: crate::task::TaskId) -> Option<Arc<Task>> {
        for entry in self.chunks.iter_mut() {
            if let Some(pos) = entry.tasks.iter().position(|t| t.id == task_id) {
                let removed = entry.tasks.remove(pos);
                if removed.is_some() {
                    self.size -= 1;
                }
                return removed;
            }
        }
        None
    }
}

fn union_table_infos<'a>(tasks: impl Iterator<Item = &'a Arc<Task>>) -> Vec<TableInfo> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for t in tasks {
        for st in &t.scan_tables {
            if seen.insert(st.table.clone()) {
                out.push(TableInfo::new(
                    st.table.clone(),
                    // No live size estimate available without a storage
                    // engine; a nominal per-table budget keeps prepare()'s
                    // accounting meaningful without real file sizes.
                    64 * 1024 * 1024,
                    if st.lock_in_memory {
                        LockType::Required
                    } else {
                        LockType::Flexible
                    },
                ));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{CzarId, JobId, QueryId};
    use crate::task::{ChunkCoords, ScanRating, ScanTableRef, TaskId};

    fn mk_task(id: u64, chunk_id: i64) -> Arc<Task> {
        Arc::new(Task::new(
            TaskId(id),
            QueryId(1),
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

    #[test]
    fn single_chunk_drains_in_order() {
        let mm = Arc::new(MemMan::new(1 << 30));
        let mut q = ChunkTasksQueue::new(mm);
        q.queue_task(mk_task(1, 6630));
        q.queue_task(mk_task(2, 6630));
        assert_eq!(q.get_size(), 2);
        assert!(q.ready(true));
        let (t1, h1) = q.get_task(true).unwrap();
        assert_eq!(t1.id, TaskId(1));
        let (t2, h2) = q.get_task(true).unwrap();
        assert_eq!(t2.id, TaskId(2));
        assert_eq!(h1, h2);
        assert!(q.empty());
        assert!(q.take_pending_unlock().is_some());
    }

    #[test]
    fn only_one_chunk_active_at_a_time() {
        let mm = Arc::new(MemMan::new(1 << 30));
        let mut q = ChunkTasksQueue::new(mm);
        q.queue_task(mk_task(1, 6630));
        q.queue_task(mk_task(2, 6800));
        assert!(q.ready(true));
        assert!(!q.next_task_different_chunk_id());
        let (t1, _h1) = q.get_task(true).unwrap();
        assert_eq!(t1.chunk.chunk_id, 6630);
        // chunk 6630 now exhausted; advancing to 6800 next.
        assert!(q.ready(true));
        let (t2, _h2) = q.get_task(true).unwrap();
        assert_eq!(t2.chunk.chunk_id, 6800);
    }

    #[test]
    fn remove_task_takes_it_out_of_queue() {
        let mm = Arc::new(MemMan::new(1 << 30));
        let mut q = ChunkTasksQueue::new(mm);
        let t = mk_task(1, 6630);
        q.queue_task(t.clone());
        assert!(q.remove_task(t.id).is_some());
        assert!(q.empty());
        assert!(q.remove_task(t.id).is_none());
    }
}
