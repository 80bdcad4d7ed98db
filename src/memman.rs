//! C2: memory reservation manager.
//!
//! Grounded in `examples/original_source/src/memman/MemMan.h`. Reserves (and
//! optionally locks) the memory pages of the tables a task will touch.
//! `lock()` is expensive, blocking I/O, serialized process-wide (only one
//! `lock()` call may be in flight); `prepare()`/`unlock()` are cheap.
//!
//! Tables in this crate have no real backing files (the MariaDB storage
//! engine is out of scope), so residency is simulated with a real
//! `mmap`+`mlock` over an anonymous region sized to the table set's
//! estimated bytes -- the reservation accounting and the syscalls are both
//! genuine, only the backing data is synthetic. This is what makes the
//! manager "advisory": callers get real memory-pressure feedback without the
//! manager needing to know about an actual storage engine. The direct
//! `libc::mmap`/`libc::mlock` pair mirrors the teacher's own
//! `src/memory/allocator/large_object_allocator.rs`, its one other spot that
//! reaches past the standard allocator to lock pages by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{QservError, Result};

pub type Handle = u64;

pub const HANDLE_INVALID: Handle = 0;
pub const HANDLE_ISEMPTY: Handle = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    NoLock,
    Required,
    Flexible,
    Optional,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub table_name: String,
    pub estimated_bytes: u64,
    pub data: LockType,
    pub index: LockType,
}

impl TableInfo {
    pub fn new(table_name: impl Into<String>, estimated_bytes: u64, data: LockType) -> Self {
        Self {
            table_name: table_name.into(),
            estimated_bytes,
            data,
            index: LockType::NoLock,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Statistics {
    pub bytes_lock_max: u64,
    pub bytes_locked: u64,
    pub bytes_reserved: u64,
    pub num_map_errors: u32,
    pub num_lock_errors: u32,
    pub num_reqd_files: u32,
    pub num_flex_files: u32,
    pub num_flex_lock: u32,
    pub num_locks: u32,
    pub num_errors: u32,
}

impl Statistics {
    pub fn log_string(&self) -> String {
        format!(
            "bytesLockMax={} bytesLocked={} bytesReserved={} numLocks={} numErrors={}",
            self.bytes_lock_max, self.bytes_locked, self.bytes_reserved, self.num_locks, self.num_errors
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Status {
    pub bytes_lock: u64,
    pub num_files: u32,
    pub chunk: i64,
}

struct Reservation {
    chunk: i64,
    /// (estimated_bytes, is_required, locked_ptr_if_locked)
    entries: Vec<ReservationEntry>,
    locked: bool,
}

struct ReservationEntry {
    table: String,
    bytes: u64,
    lock_type: LockType,
    mapped: Option<MappedRegion>,
}

/// An anonymous mmap'd, mlock'd region standing in for a table's pages.
struct MappedRegion {
    ptr: *mut libc::c_void,
    len: usize,
}

unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munlock(self.ptr, self.len);
            libc::munmap(self.ptr, self.len);
        }
    }
}

pub struct MemMan {
    max_bytes: u64,
    inner: Mutex<Inner>,
    lock_call: Mutex<()>,
    bytes_locked: AtomicU64,
    bytes_reserved: AtomicU64,
    num_locks: AtomicU32,
    num_errors: AtomicU32,
    num_map_errors: AtomicU32,
    num_lock_errors: AtomicU32,
}

struct Inner {
    next_handle: Handle,
    reservations: HashMap<Handle, Reservation>,
    /// tracks which tables currently hold a REQUIRED reservation, so a
    /// repeated REQUIRED prepare downgrades the earlier one to FLEXIBLE
    /// (spec.md section 4.1).
    required_tables: HashMap<String, Handle>,
}

impl MemMan {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(Inner {
                next_handle: HANDLE_ISEMPTY + 1,
                reservations: HashMap::new(),
                required_tables: HashMap::new(),
            }),
            lock_call: Mutex::new(()),
            bytes_locked: AtomicU64::new(0),
            bytes_reserved: AtomicU64::new(0),
            num_locks: AtomicU32::new(0),
            num_errors: AtomicU32::new(0),
            num_map_errors: AtomicU32::new(0),
            num_lock_errors: AtomicU32::new(0),
        }
    }

    /// Reserve memory for a set of tables associated with `chunk`. Returns
    /// `HANDLE_ISEMPTY` if nothing needed reserving (all NOLOCK/OPTIONAL),
    /// or a fresh handle. REQUIRED tables downgrade a prior REQUIRED
    /// reservation of the same table name to FLEXIBLE.
    pub fn prepare(&self, tables: &[TableInfo], chunk: i64) -> Result<Handle> {
        if tables.iter().all(|t| matches!(t.data, LockType::NoLock)) {
            return Ok(HANDLE_ISEMPTY);
        }

        let mut inner = self.inner.lock();

        let mut required_bytes: u64 = 0;
        let mut entries = Vec::with_capacity(tables.len());
        for t in tables {
            let lt = t.data;
            if lt == LockType::Required {
                if let Some(prev) = inner.required_tables.get(&t.table_name) {
                    if let Some(prev_res) = inner.reservations.get_mut(prev) {
                        for e in prev_res.entries.iter_mut() {
                            if e.table == t.table_name && e.lock_type == LockType::Required {
                                e.lock_type = LockType::Flexible;
                            }
                        }
                    }
                }
                required_bytes += t.estimated_bytes;
            }
            if lt == LockType::NoLock {
                continue;
            }
            entries.push(ReservationEntry {
                table: t.table_name.clone(),
                bytes: t.estimated_bytes,
                lock_type: lt,
                mapped: None,
            });
        }

        let already_reserved = self.bytes_reserved.load(Ordering::Acquire);
        if already_reserved + required_bytes > self.max_bytes {
            self.num_errors.fetch_add(1, Ordering::Relaxed);
            return Err(QservError::MemoryExhausted(format!(
                "chunk {chunk} requires {required_bytes} bytes, {already_reserved} already reserved of {}",
                self.max_bytes
            )));
        }

        let handle = inner.next_handle;
        inner.next_handle += 1;
        let total_bytes: u64 = entries.iter().map(|e| e.bytes).sum();
        self.bytes_reserved.fetch_add(total_bytes, Ordering::AcqRel);

        for e in &entries {
            if e.lock_type == LockType::Required {
                inner.required_tables.insert(e.table.clone(), handle);
            }
        }

        inner.reservations.insert(
            handle,
            Reservation {
                chunk,
                entries,
                locked: false,
            },
        );
        Ok(handle)
    }

    /// Blocking, serialized across the process: only one `lock()` call may
    /// be in flight at a time (spec.md section 4.1/section 5).
    pub fn lock(&self, handle: Handle, strict: bool) -> Result<()> {
        if handle == HANDLE_ISEMPTY {
            return Ok(());
        }
        let _guard = self.lock_call.lock();
        self.num_locks.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        let res = match inner.reservations.get_mut(&handle) {
            Some(r) => r,
            None => return Err(QservError::MemMan(format!("handle {handle} not found"))),
        };

        let mut all_required_locked = true;
        for e in res.entries.iter_mut() {
            if e.mapped.is_some() {
                continue;
            }
            match map_and_lock(e.bytes) {
                Ok(region) => {
                    self.bytes_locked.fetch_add(e.bytes, Ordering::AcqRel);
                    e.mapped = Some(region);
                }
                Err(err) => {
                    self.num_lock_errors.fetch_add(1, Ordering::Relaxed);
                    if e.lock_type == LockType::Required {
                        all_required_locked = false;
                    }
                    tracing::debug!(table = %e.table, error = %err, "memman lock attempt failed");
                }
            }
        }
        res.locked = true;

        if !all_required_locked && !strict {
            drop(inner);
            self.unlock(handle);
            return Err(QservError::MemMan(format!(
                "not all required tables locked for handle {handle}"
            )));
        }
        if !all_required_locked {
            return Err(QservError::MemMan(format!(
                "not all required tables locked for handle {handle} (strict)"
            )));
        }
        Ok(())
    }

    pub fn unlock(&self, handle: Handle) -> bool {
        if handle == HANDLE_ISEMPTY || handle == HANDLE_INVALID {
            return handle == HANDLE_ISEMPTY;
        }
        let mut inner = self.inner.lock();
        let res = match inner.reservations.remove(&handle) {
            Some(r) => r,
            None => return false,
        };
        let freed: u64 = res.entries.iter().map(|e| e.bytes).sum();
        let locked: u64 = res
            .entries
            .iter()
            .filter(|e| e.mapped.is_some())
            .map(|e| e.bytes)
            .sum();
        self.bytes_reserved.fetch_sub(freed, Ordering::AcqRel);
        self.bytes_locked.fetch_sub(locked, Ordering::AcqRel);
        inner
            .required_tables
            .retain(|_, h| *h != handle);
        // Dropping `res` here unmaps/munlocks each entry's region.
        true
    }

    pub fn unlock_all(&self) {
        let handles: Vec<Handle> = {
            let inner = self.inner.lock();
            inner.reservations.keys().copied().collect()
        };
        for h in handles {
            self.unlock(h);
        }
    }

    pub fn status(&self, handle: Handle) -> Status {
        let inner = self.inner.lock();
        match inner.reservations.get(&handle) {
            Some(r) => Status {
                bytes_lock: r.entries.iter().filter(|e| e.mapped.is_some()).map(|e| e.bytes).sum(),
                num_files: r.entries.len() as u32,
                chunk: r.chunk,
            },
            None => Status {
                bytes_lock: 0,
                num_files: 0,
                chunk: -1,
            },
        }
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            bytes_lock_max: self.max_bytes,
            bytes_locked: self.bytes_locked.load(Ordering::Relaxed),
            bytes_reserved: self.bytes_reserved.load(Ordering::Relaxed),
            num_map_errors: self.num_map_errors.load(Ordering::Relaxed),
            num_lock_errors: self.num_lock_errors.load(Ordering::Relaxed),
            num_reqd_files: 0,
            num_flex_files: 0,
            num_flex_lock: 0,
            num_locks: self.num_locks.load(Ordering::Relaxed),
            num_errors: self.num_errors.load(Ordering::Relaxed),
        }
    }
}

fn map_and_lock(bytes: u64) -> Result<MappedRegion> {
    let len = bytes.max(4096) as usize;
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(QservError::MemMan("mmap failed".to_string()));
        }
        if libc::mlock(ptr, len) != 0 {
            libc::munmap(ptr, len);
            return Err(QservError::MemMan("mlock failed".to_string()));
        }
        Ok(MappedRegion { ptr, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_returns_isempty_when_nothing_to_lock() {
        let mm = MemMan::new(1 << 30);
        let tables = vec![TableInfo::new("Object_6630", 1024, LockType::NoLock)];
        assert_eq!(mm.prepare(&tables, 6630).unwrap(), HANDLE_ISEMPTY);
    }

    #[test]
    fn prepare_then_lock_then_unlock_round_trips_bytes() {
        let mm = MemMan::new(1 << 30);
        let tables = vec![TableInfo::new("Object_6630", 4096, LockType::Required)];
        let h = mm.prepare(&tables, 6630).unwrap();
        assert_ne!(h, HANDLE_ISEMPTY);
        mm.lock(h, false).unwrap();
        assert!(mm.statistics().bytes_locked >= 4096);
        assert!(mm.unlock(h));
        assert_eq!(mm.statistics().bytes_locked, 0);
        assert_eq!(mm.statistics().bytes_reserved, 0);
    }

    #[test]
    fn prepare_fails_when_exceeding_budget() {
        let mm = MemMan::new(1024);
        let tables = vec![TableInfo::new("Object_6630", 1 << 20, LockType::Required)];
        assert!(mm.prepare(&tables, 6630).is_err());
    }

    #[test]
    fn repeated_required_prepare_downgrades_earlier_to_flexible() {
        let mm = MemMan::new(1 << 30);
        let tables = vec![TableInfo::new("Object_6630", 4096, LockType::Required)];
        let h1 = mm.prepare(&tables, 6630).unwrap();
        let h2 = mm.prepare(&tables, 6630).unwrap();
        assert_ne!(h1, h2);
        mm.unlock(h1);
        mm.unlock(h2);
    }

    #[test]
    fn unknown_handle_unlock_returns_false() {
        let mm = MemMan::new(1 << 30);
        assert!(!mm.unlock(9999));
    }
}
