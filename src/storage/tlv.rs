//! Length-prefixed record framing used inside batch files
//!
//! Each record is a 4-byte big-endian length followed by that many payload
//! bytes. There is no file header, so appending never rewrites a file.

use crate::errors::{CoreError, Result};

pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Frames `payload` as one record.
pub fn encode_record(payload: &[u8]) -> Result<Vec<u8>> {
    let length = u32::try_from(payload.len()).map_err(|_| CoreError::ObjectTooLarge {
        size: payload.len() as u64,
        max: u32::MAX as u64,
    })?;

    let mut record = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    record.extend_from_slice(&length.to_be_bytes());
    record.extend_from_slice(payload);
    Ok(record)
}

/// Outcome of decoding one batch file.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DecodedRecords {
    pub payloads: Vec<Vec<u8>>,
    /// Records dropped because they were empty or exceeded the size limit.
    pub skipped: usize,
    /// The file ended in the middle of a record.
    pub truncated: bool,
}

/// Decodes every readable record, skipping malformed ones instead of failing the whole file.
pub fn decode_records(bytes: &[u8], max_object_size: u64) -> DecodedRecords {
    let mut decoded = DecodedRecords::default();
    let mut offset = 0;

    while offset < bytes.len() {
        let Some(prefix) = bytes.get(offset..offset + LENGTH_PREFIX_SIZE) else {
            decoded.truncated = true;
            break;
        };

        let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
        length_bytes.copy_from_slice(prefix);
        let length = u32::from_be_bytes(length_bytes) as usize;
        let start = offset + LENGTH_PREFIX_SIZE;

        let Some(payload) = bytes.get(start..start + length) else {
            decoded.truncated = true;
            break;
        };

        if length == 0 || length as u64 > max_object_size {
            decoded.skipped += 1;
        } else {
            decoded.payloads.push(payload.to_vec());
        }

        offset = start + length;
    }

    decoded
}
