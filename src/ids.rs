//! Identifier newtypes. spec.md section 3: "Three nested integer ids, always
//! printed together when logging: query-id Q, job-id J, uber-job-id U."

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel chunk id required to be present on every worker so per-chunk
/// task sets stay uniform across directors.
pub const DUMMY_CHUNK_ID: i64 = 1_234_567_890;

/// `subchunkId = -1` means "task does not descend to sub-chunks".
pub const NO_SUBCHUNK: i64 = -1;

macro_rules! id_newtype {
    ($name:ident, $inner:ty) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                $name(v)
            }
        }
    };
}

id_newtype!(QueryId, i64);
id_newtype!(JobId, i64);
id_newtype!(UberJobId, i64);
id_newtype!(CzarId, i64);

/// Per-worker monotonic sequence number used only for ordering within a
/// scheduler; not part of the query/job/uber-job identity triple.
pub type WorkerSeq = u64;

pub type WorkerId = String;

/// Formats the `(Q, J, U?)` triple the way it's always printed in logs.
pub fn qid_str(q: QueryId, j: Option<JobId>, u: Option<UberJobId>) -> String {
    let mut s = format!("QID={}", q.0);
    if let Some(j) = j {
        s.push_str(&format!(":jobId={}", j.0));
    }
    if let Some(u) = u {
        s.push_str(&format!(":ujId={}", u.0));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qid_str_includes_all_present_ids() {
        let s = qid_str(QueryId(7), Some(JobId(3)), Some(UberJobId(1)));
        assert_eq!(s, "QID=7:jobId=3:ujId=1");
    }

    #[test]
    fn qid_str_query_only() {
        assert_eq!(qid_str(QueryId(7), None, None), "QID=7");
    }

    #[test]
    fn dummy_chunk_is_distinct_from_real_chunks() {
        assert_ne!(DUMMY_CHUNK_ID, 0);
        assert_ne!(DUMMY_CHUNK_ID, 6630);
    }
}
