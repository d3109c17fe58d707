// storage/io.rs
// Record framing: [u32 len][u32 crc32][json payload], little-endian

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use tracing::debug;

use super::{Record, StorageEngine};
use crate::error::{BookshelfError, Result};

const FRAME_HEADER_LEN: u64 = 8;
/// Larger length prefixes are treated as garbage
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Outcome of reading one frame
pub(super) enum Frame {
    Record { record: Record, len: u64 },
    /// Clean end of file
    End,
    /// Short frame or checksum mismatch
    Torn,
}

/// Encode one record as a complete frame
pub(super) fn encode(record: &Record) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(record).map_err(|e| BookshelfError::Serialization(e.to_string()))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(BookshelfError::Serialization(format!("record of {} bytes is too large", payload.len())));
    }
    let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER_LEN as usize);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub(super) fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let mut len_bytes = [0u8; 4];
    match read_full(reader, &mut len_bytes)? {
        0 => return Ok(Frame::End),
        4 => {}
        _ => return Ok(Frame::Torn),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Frame::Torn);
    }

    let mut crc_bytes = [0u8; 4];
    if read_full(reader, &mut crc_bytes)? < 4 {
        return Ok(Frame::Torn);
    }

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? < len {
        return Ok(Frame::Torn);
    }
    if crc32fast::hash(&payload) != u32::from_le_bytes(crc_bytes) {
        return Ok(Frame::Torn);
    }

    // A frame with a valid checksum must decode
    let record: Record = serde_json::from_slice(&payload)
        .map_err(|e| BookshelfError::Corruption(format!("undecodable record: {}", e)))?;
    Ok(Frame::Record { record, len: FRAME_HEADER_LEN + len as u64 })
}

/// Like `read_exact`, but reports how many bytes arrived before EOF
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

impl StorageEngine {
    /// Append one record to the end of the log
    pub fn append(&mut self, record: &Record) -> Result<()> {
        self.append_all(std::slice::from_ref(record))
    }

    /// Append records with a single write
    pub fn append_all(&mut self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buffer = Vec::new();
        for record in records {
            buffer.extend_from_slice(&encode(record)?);
        }

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&buffer)?;
        if self.sync_on_write {
            self.file.sync_data()?;
        }
        self.record_count += records.len() as u64;

        debug!(target: "bookshelf::storage", records = records.len(), bytes = buffer.len(), "Appended records");
        Ok(())
    }
}
