//! On-disk record framing for the memory-mapped trunk.
//!
//! ```text
//! [ magic : 4 ][ version : 4 ][ timestamp : 8 ][ payload_len : 4 ]
//! [ id utf-8, NUL-terminated ][ payload : payload_len ]
//! ```
//!
//! All integers are little-endian. A record with `payload_len == 0` is a
//! tombstone: replay removes the id from the index.

/// Sentinel marking a record start; also the corruption detector.
pub const MAGIC: u32 = 0x41434F52;

pub const HEADER_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub version: u32,
    pub timestamp: i64,
    pub id: String,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug)]
pub enum DecodeOutcome {
    /// A full record plus the number of bytes it occupies.
    Record { record: Record, consumed: usize },
    /// Zeroed bytes: the unwritten tail of the mapping.
    Empty,
    /// The buffer ends inside a record.
    Truncated,
    /// Bytes that are neither a record nor zeroes.
    Corrupt(String),
}

pub fn encoded_len(id: &str, payload_len: usize) -> usize {
    HEADER_LEN + id.len() + 1 + payload_len
}

pub fn encode(version: u32, timestamp: i64, id: &str, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(id, payload.len()));
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(id.as_bytes());
    buf.push(0);
    buf.extend_from_slice(payload);
    buf
}

pub fn decode(buf: &[u8]) -> DecodeOutcome {
    if buf.len() < HEADER_LEN {
        return if buf.iter().all(|b| *b == 0) {
            DecodeOutcome::Empty
        } else {
            DecodeOutcome::Truncated
        };
    }
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic == 0 {
        return DecodeOutcome::Empty;
    }
    if magic != MAGIC {
        return DecodeOutcome::Corrupt(format!("bad magic 0x{magic:08X}"));
    }
    let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let timestamp = i64::from_le_bytes([
        buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
    ]);
    let payload_len = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;

    let Some(nul) = buf[HEADER_LEN..].iter().position(|b| *b == 0) else {
        return DecodeOutcome::Truncated;
    };
    let id_end = HEADER_LEN + nul;
    let id = match std::str::from_utf8(&buf[HEADER_LEN..id_end]) {
        Ok(id) => id.to_string(),
        Err(err) => return DecodeOutcome::Corrupt(format!("id is not utf-8: {err}")),
    };
    if id.is_empty() {
        return DecodeOutcome::Corrupt("empty id".to_string());
    }

    let payload_start = id_end + 1;
    let consumed = payload_start + payload_len;
    if buf.len() < consumed {
        return DecodeOutcome::Truncated;
    }
    DecodeOutcome::Record {
        record: Record {
            version,
            timestamp,
            id,
            payload: buf[payload_start..consumed].to_vec(),
        },
        consumed,
    }
}
