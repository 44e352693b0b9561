//! Log frames.
//!
//! Every committed write batch is one frame:
//!
//! ```text
//! | magic (4) | version (2) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload is the CBOR encoding of the batch's operations and the
//! checksum covers header and payload.
//!
//! ## Recovery policy
//!
//! - A truncated header or payload at the end of the log is a write that
//!   never completed. Scanning stops there and the tail is reported so the
//!   adapter can cut it.
//! - A bad magic, an unsupported version or a checksum mismatch is
//!   corruption and aborts the scan.

use crate::batch::WriteOp;
use crate::error::{StorageError, StorageResult};

/// Frame magic.
pub const FRAME_MAGIC: [u8; 4] = *b"HBLF";

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

const HEADER_SIZE: usize = 10;
const CRC_SIZE: usize = 4;

/// Encodes a list of operations as one frame.
pub fn encode_frame(ops: &[WriteOp]) -> StorageResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(ops, &mut payload).map_err(|e| StorageError::codec(e.to_string()))?;

    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::InvalidInput("write batch exceeds 4 GiB".into()))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Result of scanning a log.
#[derive(Debug, Default)]
pub struct Scan {
    /// Decoded frames in log order.
    pub frames: Vec<Vec<WriteOp>>,
    /// Bytes covered by complete frames.
    pub valid_len: u64,
    /// Bytes after the last complete frame.
    pub torn_bytes: u64,
}

/// Scans `bytes` frame by frame.
pub fn scan(bytes: &[u8]) -> StorageResult<Scan> {
    let mut out = Scan::default();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let rest = &bytes[pos..];
        if rest.len() < HEADER_SIZE {
            break;
        }
        if rest[0..4] != FRAME_MAGIC {
            return Err(StorageError::corrupted(format!(
                "invalid frame magic at offset {pos}"
            )));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version > FRAME_VERSION {
            return Err(StorageError::corrupted(format!(
                "unsupported frame version {version} at offset {pos}"
            )));
        }
        let len = u32::from_le_bytes([rest[6], rest[7], rest[8], rest[9]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            break;
        }

        let body_end = HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            rest[body_end],
            rest[body_end + 1],
            rest[body_end + 2],
            rest[body_end + 3],
        ]);
        let computed = compute_crc32(&rest[..body_end]);
        if stored != computed {
            return Err(StorageError::corrupted(format!(
                "checksum mismatch at offset {pos}: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }

        let ops: Vec<WriteOp> = ciborium::from_reader(&rest[HEADER_SIZE..body_end])
            .map_err(|e| StorageError::corrupted(format!("undecodable frame at offset {pos}: {e}")))?;
        out.frames.push(ops);
        pos += total;
    }

    out.valid_len = pos as u64;
    out.torn_bytes = (bytes.len() - pos) as u64;
    Ok(out)
}

/// CRC32 with the IEEE polynomial.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}
