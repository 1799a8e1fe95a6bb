//! Substrate log framing
//!
//! Each committed batch is one frame:
//! - Frame length (u32 LE), counting the payload only
//! - Checksum (u32 LE) over the payload
//! - Payload: op count (u32 LE), then per op
//!   kind (u8: 0 = put, 1 = delete), table (u8),
//!   key length (u32 LE), key, and for puts value length (u32 LE), value
//!
//! A frame whose header or body runs past end-of-file is a torn tail: the
//! process died mid-append and the batch was never acknowledged.

use std::io::{self, Cursor, Read};

use super::table::{BatchOp, Table, WriteBatch};
use crate::record::checksum::compute_checksum;

/// Frame header size: length + checksum
pub const FRAME_HEADER_LEN: usize = 8;

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

/// Serialize a batch into a complete frame.
pub fn encode_frame(batch: &WriteBatch) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(&(batch.len() as u32).to_le_bytes());
    for op in batch.ops() {
        match op {
            BatchOp::Put { table, key, value } => {
                payload.push(OP_PUT);
                payload.push(table.as_u8());
                payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
                payload.extend_from_slice(key);
                payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
                payload.extend_from_slice(value);
            }
            BatchOp::Delete { table, key } => {
                payload.push(OP_DELETE);
                payload.push(table.as_u8());
                payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
                payload.extend_from_slice(key);
            }
        }
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&compute_checksum(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Outcome of decoding the frame at the head of a buffer.
#[derive(Debug)]
pub enum FrameRead {
    /// A valid frame and the number of bytes it occupied.
    Complete(WriteBatch, usize),
    /// Not enough bytes for the declared frame.
    Torn,
    /// The frame is complete but its checksum or body is invalid.
    Corrupt(String),
}

/// Decode the frame at the start of `data`.
pub fn decode_frame(data: &[u8]) -> FrameRead {
    if data.len() < FRAME_HEADER_LEN {
        return FrameRead::Torn;
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let total = FRAME_HEADER_LEN + len;
    if data.len() < total {
        return FrameRead::Torn;
    }
    let payload = &data[FRAME_HEADER_LEN..total];
    if compute_checksum(payload) != checksum {
        return FrameRead::Corrupt("frame checksum mismatch".to_string());
    }
    match decode_payload(payload) {
        Ok(batch) => FrameRead::Complete(batch, total),
        Err(e) => FrameRead::Corrupt(e.to_string()),
    }
}

fn decode_payload(payload: &[u8]) -> io::Result<WriteBatch> {
    let mut cursor = Cursor::new(payload);
    let count = read_u32(&mut cursor)?;
    let mut batch = WriteBatch::new();
    for _ in 0..count {
        let kind = read_u8(&mut cursor)?;
        let tag = read_u8(&mut cursor)?;
        let table = Table::from_u8(tag).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("unknown table {}", tag))
        })?;
        let key = read_vec(&mut cursor)?;
        match kind {
            OP_PUT => {
                let value = read_vec(&mut cursor)?;
                batch.put(table, key, value);
            }
            OP_DELETE => batch.delete(table, key),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown op kind {}", other),
                ))
            }
        }
    }
    Ok(batch)
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_vec(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let len = read_u32(cursor)? as usize;
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len as u64 > remaining {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "field longer than frame",
        ));
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}
