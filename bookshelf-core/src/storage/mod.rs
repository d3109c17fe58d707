// storage/mod.rs
// Storage engine module: append-only record log

mod compaction;
mod io;

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::document::{Document, DocumentId};
use crate::error::{BookshelfError, Result};
use crate::index::IndexDefinition;

pub use compaction::CompactionStats;
use io::Frame;

pub const MAGIC: [u8; 8] = *b"BOOKSHLF";
pub const FORMAT_VERSION: u32 = 1;

/// Log file header, bincode-encoded at offset 0
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Header {
    pub magic: [u8; 8],            // "BOOKSHLF"
    pub version: u32,
}

impl Default for Header {
    fn default() -> Self {
        Header { magic: MAGIC, version: FORMAT_VERSION }
    }
}

/// One change to a collection. Replaying the log in order rebuilds every
/// collection's documents and index definitions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Record {
    Insert { collection: String, document: Document },
    Replace { collection: String, document: Document },
    Delete { collection: String, id: DocumentId },
    CreateIndex { collection: String, definition: IndexDefinition },
    DropIndex { collection: String, name: String },
}

impl Record {
    pub fn collection(&self) -> &str {
        match self {
            Record::Insert { collection, .. }
            | Record::Replace { collection, .. }
            | Record::Delete { collection, .. }
            | Record::CreateIndex { collection, .. }
            | Record::DropIndex { collection, .. } => collection,
        }
    }
}

/// Storage engine - file-backed record log
pub struct StorageEngine {
    file: File,
    path: PathBuf,
    sync_on_write: bool,
    /// Records currently in the file
    record_count: u64,
}

impl StorageEngine {
    /// Open or create the log, returning every record it holds.
    ///
    /// A torn tail (short frame or checksum mismatch) is cut off; a foreign
    /// or unsupported header is `Corruption`.
    pub fn open<P: AsRef<Path>>(path: P, sync_on_write: bool) -> Result<(Self, Vec<Record>)> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            Self::write_header(&mut file)?;
            file.sync_all()?;
            info!(target: "bookshelf::storage", path = %path.display(), "Created record log");
            let storage = StorageEngine { file, path, sync_on_write, record_count: 0 };
            return Ok((storage, Vec::new()));
        }

        let (records, valid_len) = Self::read_log(&mut file)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                target: "bookshelf::storage",
                path = %path.display(),
                valid_len,
                dropped_bytes = file_len - valid_len,
                "Truncating torn tail of record log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        info!(
            target: "bookshelf::storage",
            path = %path.display(),
            records = records.len(),
            "Opened record log"
        );

        let storage = StorageEngine {
            file,
            path,
            sync_on_write,
            record_count: records.len() as u64,
        };
        Ok((storage, records))
    }

    /// Read the header and every intact record; returns the records and the
    /// byte length of the intact prefix
    fn read_log(file: &mut File) -> Result<(Vec<Record>, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&*file);

        let header: Header = bincode::deserialize_from(&mut reader)
            .map_err(|e| BookshelfError::Corruption(format!("unreadable header: {}", e)))?;
        if header.magic != MAGIC {
            return Err(BookshelfError::Corruption("not a bookshelf record log".to_string()));
        }
        if header.version > FORMAT_VERSION {
            return Err(BookshelfError::Corruption(format!(
                "unsupported format version {} (newest known: {})",
                header.version, FORMAT_VERSION
            )));
        }

        let mut offset = header_len()?;
        let mut records = Vec::new();
        loop {
            match io::read_frame(&mut reader)? {
                Frame::Record { record, len } => {
                    records.push(record);
                    offset += len;
                }
                Frame::Torn => {
                    debug!(target: "bookshelf::storage", offset, "Incomplete frame at end of log");
                    break;
                }
                Frame::End => break,
            }
        }
        Ok((records, offset))
    }

    fn write_header(file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        bincode::serialize_into(&mut *file, &Header::default())?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Get file length
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Flush file contents to disk
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Encoded size of the header
fn header_len() -> Result<u64> {
    Ok(bincode::serialized_size(&Header::default())?)
}
