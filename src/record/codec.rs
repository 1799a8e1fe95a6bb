//! Binary encoding for history entries and record batches
//!
//! History entry value:
//! - Operation (u8)
//! - Payload tag (u8): 0 = inline, 1 = blob, 2 = none
//! - Inline: length (u32 LE) + bytes; Blob: length (u64 LE)
//!
//! Record batch (layer content):
//! - Magic (u32 LE)
//! - Record count (u32 LE)
//! - Records: key length (u32 LE), key, sequence (u64 LE), entry
//! - Checksum (u32 LE) over everything before it

use std::io::{self, Cursor, Read};

use super::checksum::compute_checksum;
use super::{ChangeRecord, HistoryEntry, Operation, Payload, Sequence};

const BATCH_MAGIC: u32 = 0x5351_4C42; // "SQLB"

const TAG_INLINE: u8 = 0;
const TAG_BLOB: u8 = 1;
const TAG_NONE: u8 = 2;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
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

fn read_u64(cursor: &mut Cursor<&[u8]>) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> io::Result<Vec<u8>> {
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if (len as u64) > remaining {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("length {} exceeds remaining {} bytes", len, remaining),
        ));
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_entry_body(buf: &mut Vec<u8>, operation: Operation, payload: &Payload) {
    buf.push(operation.as_u8());
    match payload {
        Payload::Inline(value) => {
            buf.push(TAG_INLINE);
            buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
            buf.extend_from_slice(value);
        }
        Payload::Blob { len } => {
            buf.push(TAG_BLOB);
            buf.extend_from_slice(&len.to_le_bytes());
        }
        Payload::None => buf.push(TAG_NONE),
    }
}

fn read_entry_body(cursor: &mut Cursor<&[u8]>) -> io::Result<(Operation, Payload)> {
    let op = read_u8(cursor)?;
    let operation =
        Operation::from_u8(op).ok_or_else(|| invalid(format!("unknown operation {}", op)))?;
    let payload = match read_u8(cursor)? {
        TAG_INLINE => {
            let len = read_u32(cursor)? as usize;
            Payload::Inline(read_bytes(cursor, len)?)
        }
        TAG_BLOB => Payload::Blob {
            len: read_u64(cursor)?,
        },
        TAG_NONE => Payload::None,
        other => return Err(invalid(format!("unknown payload tag {}", other))),
    };
    Ok((operation, payload))
}

/// Serialize a history entry value (the sequence lives in the table key).
pub fn encode_entry(operation: Operation, payload: &Payload) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    write_entry_body(&mut buf, operation, payload);
    buf
}

/// Deserialize a history entry value.
pub fn decode_entry(sequence: Sequence, data: &[u8]) -> io::Result<HistoryEntry> {
    let mut cursor = Cursor::new(data);
    let (operation, payload) = read_entry_body(&mut cursor)?;
    Ok(HistoryEntry {
        sequence,
        operation,
        payload,
    })
}

/// Serialize a batch of records with a trailing checksum.
pub fn encode_records(records: &[ChangeRecord]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + records.len() * 32);
    buf.extend_from_slice(&BATCH_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for record in records {
        buf.extend_from_slice(&(record.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&record.key);
        buf.extend_from_slice(&record.sequence.value().to_le_bytes());
        write_entry_body(&mut buf, record.operation, &record.payload);
    }
    let checksum = compute_checksum(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf
}

/// Deserialize a record batch, validating magic and checksum.
pub fn decode_records(data: &[u8]) -> io::Result<Vec<ChangeRecord>> {
    if data.len() < 12 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "record batch too short",
        ));
    }
    let (body, trailer) = data.split_at(data.len() - 4);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if compute_checksum(body) != expected {
        return Err(invalid("record batch checksum mismatch"));
    }

    let mut cursor = Cursor::new(body);
    let magic = read_u32(&mut cursor)?;
    if magic != BATCH_MAGIC {
        return Err(invalid(format!("bad record batch magic {:#x}", magic)));
    }
    let count = read_u32(&mut cursor)? as usize;
    let mut records = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let key_len = read_u32(&mut cursor)? as usize;
        let key = read_bytes(&mut cursor, key_len)?;
        let sequence = Sequence::new(read_u64(&mut cursor)?);
        let (operation, payload) = read_entry_body(&mut cursor)?;
        records.push(ChangeRecord {
            key,
            sequence,
            operation,
            payload,
        });
    }
    if cursor.position() != body.len() as u64 {
        return Err(invalid("trailing bytes after record batch"));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_roundtrip_all_payloads() {
        for payload in [
            Payload::Inline(b"value".to_vec()),
            Payload::Blob { len: 1 << 20 },
            Payload::None,
        ] {
            let bytes = encode_entry(Operation::Put, &payload);
            let entry = decode_entry(Sequence::new(4), &bytes).unwrap();
            assert_eq!(entry.payload, payload);
            assert_eq!(entry.sequence, Sequence::new(4));
        }
    }

    #[test]
    fn test_records_roundtrip() {
        let records = vec![
            ChangeRecord::put("a", 1, "x"),
            ChangeRecord::delete("b", 2),
        ];
        let bytes = encode_records(&records);
        assert_eq!(decode_records(&bytes).unwrap(), records);
    }

    #[test]
    fn test_records_detect_corruption() {
        let mut bytes = encode_records(&[ChangeRecord::put("a", 1, "x")]);
        bytes[10] ^= 0xFF;
        assert!(decode_records(&bytes).is_err());
    }

    #[test]
    fn test_unknown_payload_tag_rejected() {
        let data = [0u8, 9u8];
        assert!(decode_entry(Sequence::new(1), &data).is_err());
    }
}
