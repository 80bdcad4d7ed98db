//! C1: chunk/table naming and query template substitution.
//!
//! Replaces `CHUNK_TAG`/`SUBCHUNK_TAG` placeholders in stored query templates
//! and forms the physical table names workers query against. Grounded in
//! the substitution rules of spec.md section 6 ("Template substitution
//! tokens" / "Physical table naming") and `examples/original_source/src/wbase/Task.cc`'s
//! own `CHUNK_TAG`/`SUBCHUNK_TAG` string replacement.

use crate::ids::{DUMMY_CHUNK_ID, NO_SUBCHUNK};

pub const CHUNK_TAG: &str = "CHUNK_TAG";
pub const SUBCHUNK_TAG: &str = "SUBCHUNK_TAG";

/// `<Base>_<chunkId>`
pub fn chunk_table_name(base: &str, chunk_id: i64) -> String {
    format!("{base}_{chunk_id}")
}

/// `Subchunks_<chunkId>.<Base>_<chunkId>_<subchunkId>`
pub fn subchunk_table_name(base: &str, chunk_id: i64, subchunk_id: i64) -> String {
    format!("Subchunks_{chunk_id}.{base}_{chunk_id}_{subchunk_id}")
}

pub fn self_overlap_table_name(base: &str, chunk_id: i64) -> String {
    format!("{base}SelfOverlap_{chunk_id}")
}

pub fn full_overlap_table_name(base: &str, chunk_id: i64) -> String {
    format!("{base}FullOverlap_{chunk_id}")
}

pub fn is_dummy_chunk(chunk_id: i64) -> bool {
    chunk_id == DUMMY_CHUNK_ID
}

/// Replace `CHUNK_TAG`/`SUBCHUNK_TAG` with the literal chunk/sub-chunk id in
/// a stored query template. Exact string replacement, as specified.
pub fn substitute_tags(template: &str, chunk_id: i64, subchunk_id: i64) -> String {
    let with_chunk = template.replace(CHUNK_TAG, &chunk_id.to_string());
    if subchunk_id == NO_SUBCHUNK {
        with_chunk
    } else {
        with_chunk.replace(SUBCHUNK_TAG, &subchunk_id.to_string())
    }
}

/// Expand a bare table reference (`db.base`) into the physical table the
/// worker should query, honoring sub-chunk descent (section 4.6 step 2).
pub fn physical_table(base: &str, chunk_id: i64, subchunk_id: i64) -> String {
    if subchunk_id == NO_SUBCHUNK {
        chunk_table_name(base, chunk_id)
    } else {
        subchunk_table_name(base, chunk_id, subchunk_id)
    }
}
