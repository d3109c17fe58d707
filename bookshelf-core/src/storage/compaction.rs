// storage/compaction.rs
// Storage compaction: rewrite the log to live state only

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::info;

use super::{io, Header, Record, StorageEngine};
use crate::error::Result;

/// Compaction statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub size_before: u64,
    pub size_after: u64,
    pub records_before: u64,
    pub records_after: u64,
}

impl CompactionStats {
    pub fn space_saved(&self) -> u64 {
        self.size_before.saturating_sub(self.size_after)
    }

    pub fn records_removed(&self) -> u64 {
        self.records_before.saturating_sub(self.records_after)
    }
}

impl StorageEngine {
    /// Replace the log with exactly `live` records.
    ///
    /// The new log is written beside the old one and renamed over it, so a
    /// crash leaves either the old or the new file intact.
    pub fn compact(&mut self, live: &[Record]) -> Result<CompactionStats> {
        let mut stats = CompactionStats {
            size_before: self.file_len()?,
            records_before: self.record_count,
            ..Default::default()
        };

        let temp_path = self.temp_path();
        {
            let temp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            let mut writer = BufWriter::new(temp);
            bincode::serialize_into(&mut writer, &Header::default())?;
            for record in live {
                writer.write_all(&io::encode(record)?)?;
            }
            let temp = writer.into_inner().map_err(|e| e.into_error())?;
            temp.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;
        sync_parent_dir(&self.path);

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        self.file = file;
        self.record_count = live.len() as u64;

        stats.size_after = self.file_len()?;
        stats.records_after = self.record_count;

        info!(
            target: "bookshelf::compaction",
            size_before = stats.size_before,
            size_after = stats.size_after,
            records_removed = stats.records_removed(),
            "Compacted record log"
        );
        Ok(stats)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".compact");
        PathBuf::from(name)
    }
}

/// Make the rename durable where the platform allows opening directories
fn sync_parent_dir(path: &std::path::Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
