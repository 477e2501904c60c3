use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Append-only log file. Records are written in batches by the log manager
/// and read back by offset during recovery.
pub struct LogFile {
    file: File,
    size: u64,
}

impl LogFile {
    /// Creates an empty log file, truncating any previous content.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create log file: {:?}", path))?;

        Ok(Self { file, size: 0 })
    }

    /// Opens an existing log file, creating it when missing.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open log file: {:?}", path))?;
        let size = file.metadata()?.len();

        Ok(Self { file, size })
    }

    /// Appends `data` at the end of the log and syncs it.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        self.file
            .seek(SeekFrom::Start(self.size))
            .context("Failed to seek log")?;
        self.file.write_all(data).context("Failed to write log")?;
        self.file.sync_data().context("Failed to sync log")?;
        self.size += data.len() as u64;

        Ok(())
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read, 0 at end of log.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }

        let readable = ((self.size - offset) as usize).min(buf.len());
        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek log")?;
        self.file
            .read_exact(&mut buf[..readable])
            .context("Failed to read log")?;

        Ok(readable)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Cuts the log back to `len` bytes, dropping a torn record at the end.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        if len >= self.size {
            return Ok(());
        }
        self.file.set_len(len).context("Failed to truncate log")?;
        self.file.sync_all().context("Failed to sync log")?;
        self.size = len;
        Ok(())
    }
}
