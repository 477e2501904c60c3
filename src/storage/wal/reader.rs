//! Sequential and random access over the durable log.

use log::warn;
use thiserror::Error;

use super::manager::LogManager;
use super::record::{LogDecodeError, LogRecord};
use crate::storage::error::StorageError;

/// Bytes fetched from the log file per read.
const READ_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Error, Debug)]
pub enum LogReadError {
    #[error("Corrupt log record at offset {offset}: {source}")]
    Corrupt {
        offset: u64,
        #[source]
        source: LogDecodeError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A decoded record and the file offset it starts at.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub offset: u64,
    pub record: LogRecord,
}

/// Iterates over the log from the start of the file.
///
/// A partial record at the end of the file (a torn write) ends the iteration
/// quietly. Any other undecodable record is reported once and stops the
/// iterator.
pub struct LogReader<'a> {
    log: &'a LogManager,
    buf: Vec<u8>,
    /// Position of the next undecoded byte inside `buf`.
    pos: usize,
    /// File offset of `buf[0]`.
    base_offset: u64,
    done: bool,
}

impl<'a> LogReader<'a> {
    pub fn new(log: &'a LogManager) -> Self {
        LogReader {
            log,
            buf: Vec::new(),
            pos: 0,
            base_offset: 0,
            done: false,
        }
    }

    /// Pulls the next chunk from disk. Returns false at end of file.
    fn fill(&mut self) -> Result<bool, StorageError> {
        self.base_offset += self.pos as u64;
        self.buf.drain(..self.pos);
        self.pos = 0;

        let start = self.buf.len();
        self.buf.resize(start + READ_CHUNK_SIZE, 0);
        let read = self
            .log
            .read_log(self.base_offset + start as u64, &mut self.buf[start..])?;
        self.buf.truncate(start + read);

        Ok(read > 0)
    }
}

impl Iterator for LogReader<'_> {
    type Item = Result<LogEntry, LogReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let offset = self.base_offset + self.pos as u64;
            match LogRecord::deserialize(&self.buf[self.pos..]) {
                Ok(Some((record, size))) => {
                    self.pos += size;
                    return Some(Ok(LogEntry { offset, record }));
                }
                Ok(None) => match self.fill() {
                    Ok(true) => continue,
                    Ok(false) => {
                        if self.pos < self.buf.len() {
                            warn!(
                                "Ignoring {} trailing bytes of a torn log record at offset {}",
                                self.buf.len() - self.pos,
                                offset
                            );
                        }
                        self.done = true;
                        return None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                },
                Err(source) => {
                    self.done = true;
                    return Some(Err(LogReadError::Corrupt { offset, source }));
                }
            }
        }
    }
}

/// Reads the single record starting at `offset`.
pub fn read_record_at(log: &LogManager, offset: u64) -> Result<LogRecord, LogReadError> {
    let mut header = [0u8; LogRecord::HEADER_SIZE];
    let read = log.read_log(offset, &mut header)?;
    let size = if read == header.len() {
        u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize
    } else {
        0
    };

    if size < LogRecord::HEADER_SIZE {
        return Err(LogReadError::Corrupt {
            offset,
            source: LogDecodeError::InvalidSize { size: size as u32 },
        });
    }

    let mut data = vec![0u8; size];
    let read = log.read_log(offset, &mut data)?;
    match LogRecord::deserialize(&data[..read]) {
        Ok(Some((record, _))) => Ok(record),
        Ok(None) => Err(LogReadError::Corrupt {
            offset,
            source: LogDecodeError::InvalidSize { size: size as u32 },
        }),
        Err(source) => Err(LogReadError::Corrupt { offset, source }),
    }
}
