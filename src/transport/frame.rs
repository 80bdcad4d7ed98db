//! Result-file transport: the framed binary format workers write result rows
//! into and the czar streams back out (spec.md sections 3, 4.6, 4.10, 6).
//!
//! Wire shape: a sequence of `uint32 msgSize` (little-endian) followed by
//! `msgSize` bytes of a bincode-serialized [`ResultMessage`]. The first
//! record carries the schema; the last sets `end_of_stream` and the running
//! row/byte counters. Every record carries a crc32c content hash over its
//! payload bytes so the merger (C11) can detect corruption (testable
//! property 4, and the framing state machine modeled after
//! `MergingHandler::flush` in `examples/original_source`).

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{QservError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
}

pub type Schema = Vec<ColumnDef>;

/// A single result row. Kept as opaque JSON-able values so this crate need
/// not depend on a MariaDB wire type (the storage engine is out of scope).
pub type Row = Vec<serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub schema: Option<Schema>,
    pub rows: Vec<Row>,
    /// true if the logical record continues in the next frame (large
    /// results spanning more than one frame).
    pub continues: bool,
    pub end_of_stream: bool,
    pub row_count_delta: u64,
    pub bytes_delta: u64,
}

impl ResultMessage {
    pub fn data(rows: Vec<Row>, schema: Option<Schema>) -> Self {
        let row_count_delta = rows.len() as u64;
        Self {
            schema,
            rows,
            continues: false,
            end_of_stream: false,
            row_count_delta,
            bytes_delta: 0,
        }
    }

    pub fn summary(total_rows: u64, total_bytes: u64) -> Self {
        Self {
            schema: None,
            rows: Vec::new(),
            continues: false,
            end_of_stream: true,
            row_count_delta: 0,
            bytes_delta: total_bytes,
            ..Self::empty_with_counts(total_rows)
        }
    }

    fn empty_with_counts(total_rows: u64) -> Self {
        Self {
            schema: None,
            rows: Vec::new(),
            continues: false,
            end_of_stream: true,
            row_count_delta: total_rows,
            bytes_delta: 0,
        }
    }
}

/// Encode one frame: `[u32 len LE][payload bytes]`. The content hash is not
/// part of the wire bytes returned here -- callers that need per-frame
/// integrity checking use [`frame_hash`] over the returned payload before
/// writing it, matching how the writer in `worker::runner` appends frames.
pub fn encode_frame(msg: &ResultMessage) -> Result<BytesMut> {
    let payload = bincode::serde::encode_to_vec(msg, bincode::config::standard())?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf)
}

pub fn frame_hash(payload: &[u8]) -> u32 {
    crc32c::crc32c(payload)
}

/// Streaming frame reader, modeled as an explicit state machine the way
/// `MergingHandler::flush` reads `HEADER_SIZE_WAIT -> RESULT_WAIT ->
/// RESULT_RECV -> RESULT_EXTRA` in the original source, so a result that
/// spans multiple frames (`continues = true`) is representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    AwaitingLength,
    AwaitingPayload { len: u32 },
    Done,
    Error,
}

pub struct FrameReader {
    state: ReaderState,
    buf: BytesMut,
    pending_len: u32,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            state: ReaderState::AwaitingLength,
            buf: BytesMut::new(),
            pending_len: 0,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Feed newly-arrived bytes (e.g. from a chunked HTTP body). Returns any
    /// complete messages that could be decoded from bytes seen so far.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<(ResultMessage, u32)>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            match self.state {
                ReaderState::AwaitingLength => {
                    if self.buf.len() < 4 {
                        break;
                    }
                    self.pending_len = self.buf.get_u32_le();
                    self.state = ReaderState::AwaitingPayload {
                        len: self.pending_len,
                    };
                }
                ReaderState::AwaitingPayload { len } => {
                    if len == 0 {
                        self.state = ReaderState::Error;
                        return Err(QservError::Corruption("zero-length frame".to_string()));
                    }
                    if (self.buf.len() as u64) < len as u64 {
                        break;
                    }
                    let payload = self.buf.split_to(len as usize);
                    let hash = frame_hash(&payload);
                    let (msg, _): (ResultMessage, usize) =
                        bincode::serde::decode_from_slice(&payload, bincode::config::standard())
                            .map_err(|e| QservError::Corruption(e.to_string()))?;
                    let continues = msg.continues;
                    let end = msg.end_of_stream;
                    out.push((msg, hash));
                    self.state = if end && !continues {
                        ReaderState::Done
                    } else {
                        ReaderState::AwaitingLength
                    };
                }
                ReaderState::Done | ReaderState::Error => break,
            }
        }
        Ok(out)
    }
}

/// Verify a frame's bytes against an expected hash (fatal merge error for
/// the uber-job on mismatch, per spec.md section 4.10 step 5).
pub fn verify_hash(payload: &[u8], expected: u32) -> Result<()> {
    let actual = frame_hash(payload);
    if actual != expected {
        return Err(QservError::Corruption(format!(
            "content hash mismatch: expected {expected:#010x} got {actual:#010x}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_feed_round_trips() {
        let msg = ResultMessage::data(
            vec![vec![serde_json::json!(1), serde_json::json!("abc")]],
            Some(vec![ColumnDef {
                name: "id".into(),
                sql_type: "INT".into(),
            }]),
        );
        let frame = encode_frame(&msg).unwrap();
        let mut reader = FrameReader::new();
        let got = reader.feed(&frame).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0.rows.len(), 1);
    }

    #[test]
    fn feed_handles_split_across_calls() {
        let msg = ResultMessage::summary(3, 128);
        let frame = encode_frame(&msg).unwrap();
        let mut reader = FrameReader::new();
        let (a, b) = frame.split_at(2);
        assert!(reader.feed(a).unwrap().is_empty());
        let got = reader.feed(b).unwrap();
        assert_eq!(got.len(), 1);
        assert!(got[0].0.end_of_stream);
        assert_eq!(reader.state(), ReaderState::Done);
    }

    #[test]
    fn zero_length_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        let mut reader = FrameReader::new();
        assert!(reader.feed(&buf).is_err());
    }

    #[test]
    fn hash_mismatch_detected() {
        let payload = b"hello world";
        let good = frame_hash(payload);
        assert!(verify_hash(payload, good).is_ok());
        assert!(verify_hash(payload, good.wrapping_add(1)).is_err());
    }
}
