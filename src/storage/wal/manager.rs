//! Log manager implementation.
//!
//! Appended records are serialized into an in-memory buffer and written to the
//! log file in batches. A background thread flushes the buffer every
//! `flush_interval`, or immediately when a caller forces a flush. Callers that
//! force a flush block until the batch containing their records is durable.

use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use log::{debug, error, info};
use parking_lot::Mutex;

use super::record::{LogRecord, Lsn};
use crate::storage::disk::LogFile;
use crate::storage::error::{StorageError, StorageResult};

/// Log manager configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Size of the in-memory log buffer in bytes.
    pub buffer_size: usize,
    /// Maximum time a record may sit in the buffer while the flush thread runs.
    pub flush_interval: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            buffer_size: 32 * 1024,
            flush_interval: Duration::from_secs(1),
        }
    }
}

struct LogBuffer {
    data: Vec<u8>,
    /// LSN of the last record in `data`.
    last_lsn: Lsn,
    next_lsn: Lsn,
}

struct LogInner {
    config: LogConfig,
    buffer: Mutex<LogBuffer>,
    file: Mutex<LogFile>,
    persistent_lsn: AtomicU32,
    /// Set by the first failed write. Records may have been lost or half
    /// written, so the log refuses all further work.
    failure: Mutex<Option<String>>,
}

impl LogInner {
    fn check_healthy(&self) -> StorageResult<()> {
        match self.failure.lock().as_ref() {
            Some(reason) => Err(StorageError::LogFlush(format!(
                "log is unusable after an earlier write failure: {}",
                reason
            ))),
            None => Ok(()),
        }
    }

    /// Writes everything buffered so far to disk.
    ///
    /// The file lock is taken before the buffer lock so concurrent flushes
    /// reach the file in LSN order.
    fn flush(&self) -> StorageResult<()> {
        let mut file = self.file.lock();
        self.check_healthy()?;

        let (data, last_lsn) = {
            let mut buffer = self.buffer.lock();
            if buffer.data.is_empty() {
                return Ok(());
            }
            let capacity = self.config.buffer_size;
            let data = mem::replace(&mut buffer.data, Vec::with_capacity(capacity));
            (data, buffer.last_lsn)
        };

        if let Err(e) = file.append(&data) {
            let reason = format!("{:#}", e);
            error!("Log write failed, refusing further log writes: {}", reason);
            *self.failure.lock() = Some(reason.clone());
            return Err(StorageError::LogFlush(reason));
        }
        self.persistent_lsn.store(last_lsn.0, Ordering::Release);
        debug!("Flushed {} log bytes up to {}", data.len(), last_lsn);

        Ok(())
    }
}

enum FlushRequest {
    /// Flush now and report the outcome on the reply channel.
    Force(Sender<StorageResult<()>>),
    Stop,
}

struct FlushThread {
    sender: Sender<FlushRequest>,
    handle: JoinHandle<()>,
}

/// Log manager for handling write-ahead logging.
pub struct LogManager {
    inner: Arc<LogInner>,
    flusher: Mutex<Option<FlushThread>>,
}

impl LogManager {
    /// Create a log manager over a fresh, empty log file.
    pub fn create(path: &Path, config: LogConfig) -> StorageResult<Self> {
        let file = LogFile::create(path)?;
        Ok(Self::with_file(file, config))
    }

    /// Open an existing log. LSN counters start from scratch until recovery
    /// seeds them from the records on disk.
    pub fn open(path: &Path, config: LogConfig) -> StorageResult<Self> {
        let file = LogFile::open(path)?;
        Ok(Self::with_file(file, config))
    }

    fn with_file(file: LogFile, config: LogConfig) -> Self {
        let buffer = LogBuffer {
            data: Vec::with_capacity(config.buffer_size),
            last_lsn: Lsn::INVALID,
            next_lsn: Lsn::INVALID.next(),
        };

        LogManager {
            inner: Arc::new(LogInner {
                config,
                buffer: Mutex::new(buffer),
                file: Mutex::new(file),
                persistent_lsn: AtomicU32::new(Lsn::INVALID.0),
                failure: Mutex::new(None),
            }),
            flusher: Mutex::new(None),
        }
    }

    /// Assigns the next LSN to `record`, buffers it and returns the LSN.
    ///
    /// Blocks on a forced flush when the buffer cannot take the record. A
    /// record larger than the whole buffer is accepted into an empty buffer.
    pub fn append_log_record(&self, record: &mut LogRecord) -> StorageResult<Lsn> {
        let size = record.size();
        self.inner.check_healthy()?;

        loop {
            let mut buffer = self.inner.buffer.lock();
            if !buffer.data.is_empty() && buffer.data.len() + size > self.inner.config.buffer_size
            {
                drop(buffer);
                self.force_flush()?;
                continue;
            }

            let lsn = buffer.next_lsn;
            buffer.next_lsn = lsn.next();
            buffer.last_lsn = lsn;
            record.lsn = lsn;
            record.serialize_into(&mut buffer.data);

            return Ok(lsn);
        }
    }

    /// Flushes the buffer and waits until it is on disk.
    pub fn force_flush(&self) -> StorageResult<()> {
        let sender = self.flusher.lock().as_ref().map(|f| f.sender.clone());

        if let Some(sender) = sender {
            let (reply_tx, reply_rx) = channel::bounded(1);
            if sender.send(FlushRequest::Force(reply_tx)).is_ok() {
                return reply_rx.recv().map_err(|_| {
                    StorageError::LogFlush("flush thread exited before replying".to_string())
                })?;
            }
        }

        self.inner.flush()
    }

    /// Ensures every record up to and including `lsn` is durable.
    pub fn flush_till(&self, lsn: Lsn) -> StorageResult<()> {
        if lsn <= self.persistent_lsn() {
            return Ok(());
        }
        self.force_flush()
    }

    /// Highest LSN known to be on disk.
    pub fn persistent_lsn(&self) -> Lsn {
        Lsn(self.inner.persistent_lsn.load(Ordering::Acquire))
    }

    pub fn set_persistent_lsn(&self, lsn: Lsn) {
        self.inner.persistent_lsn.store(lsn.0, Ordering::Release);
    }

    /// LSN the next appended record will receive.
    pub fn next_lsn(&self) -> Lsn {
        self.inner.buffer.lock().next_lsn
    }

    pub fn set_next_lsn(&self, lsn: Lsn) {
        self.inner.buffer.lock().next_lsn = lsn;
    }

    /// Starts the background flush thread. No-op when already running.
    pub fn run_flush_thread(&self) -> StorageResult<()> {
        let mut flusher = self.flusher.lock();
        if flusher.is_some() {
            return Ok(());
        }

        let (sender, receiver) = channel::unbounded();
        let inner = Arc::clone(&self.inner);
        let interval = inner.config.flush_interval;

        let handle = thread::Builder::new()
            .name("log-flush".to_string())
            .spawn(move || loop {
                match receiver.recv_timeout(interval) {
                    Ok(FlushRequest::Force(reply)) => {
                        let _ = reply.send(inner.flush());
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = inner.flush() {
                            error!("Periodic log flush failed: {}", e);
                        }
                    }
                    Ok(FlushRequest::Stop) | Err(RecvTimeoutError::Disconnected) => {
                        if let Err(e) = inner.flush() {
                            error!("Final log flush failed: {}", e);
                        }
                        break;
                    }
                }
            })?;

        info!("Log flush thread started (interval {:?})", interval);
        *flusher = Some(FlushThread { sender, handle });
        Ok(())
    }

    /// Stops the flush thread after a final flush. No-op when not running.
    pub fn stop_flush_thread(&self) {
        let flusher = self.flusher.lock().take();

        if let Some(FlushThread { sender, handle }) = flusher {
            let _ = sender.send(FlushRequest::Stop);
            if handle.join().is_err() {
                error!("Log flush thread panicked");
            }
            info!("Log flush thread stopped");
        }
    }

    pub fn is_flush_thread_running(&self) -> bool {
        self.flusher.lock().is_some()
    }

    /// Size of the durable part of the log in bytes.
    pub fn log_size(&self) -> u64 {
        self.inner.file.lock().size()
    }

    /// Drops durable log bytes past `len`. Only meaningful before new records
    /// are appended, e.g. when recovery finds a torn record at the tail.
    pub fn truncate_log(&self, len: u64) -> StorageResult<()> {
        Ok(self.inner.file.lock().truncate(len)?)
    }

    /// Reads durable log bytes starting at `offset`. Returns 0 at end of log.
    pub fn read_log(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        Ok(self.inner.file.lock().read_at(offset, buf)?)
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        self.stop_flush_thread();
        if let Err(e) = self.inner.flush() {
            error!("Log flush on shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::record::LogRecordBody;
    use crate::transaction::TransactionId;
    use std::thread;
    use std::time::Instant;
    use tempfile::tempdir;

    fn begin_record(txn: u32) -> LogRecord {
        LogRecord::new(TransactionId(txn), Lsn::INVALID, LogRecordBody::Begin)
    }

    #[test]
    fn test_lsns_are_sequential() -> StorageResult<()> {
        let dir = tempdir()?;
        let log = LogManager::create(&dir.path().join("test.log"), LogConfig::default())?;

        let mut first = begin_record(1);
        let mut second = begin_record(2);
        assert_eq!(log.append_log_record(&mut first)?, Lsn(1));
        assert_eq!(log.append_log_record(&mut second)?, Lsn(2));
        assert_eq!(first.lsn, Lsn(1));
        assert_eq!(second.lsn, Lsn(2));
        assert_eq!(log.next_lsn(), Lsn(3));

        // Nothing is durable until a flush
        assert_eq!(log.persistent_lsn(), Lsn::INVALID);
        assert_eq!(log.log_size(), 0);

        Ok(())
    }

    #[test]
    fn test_force_flush_without_thread() -> StorageResult<()> {
        let dir = tempdir()?;
        let log = LogManager::create(&dir.path().join("test.log"), LogConfig::default())?;

        let mut record = begin_record(1);
        log.append_log_record(&mut record)?;
        log.force_flush()?;

        assert_eq!(log.persistent_lsn(), Lsn(1));
        assert_eq!(log.log_size(), record.size() as u64);

        let mut buf = vec![0u8; record.size()];
        assert_eq!(log.read_log(0, &mut buf)?, record.size());
        let (decoded, _) = LogRecord::deserialize(&buf).unwrap().unwrap();
        assert_eq!(decoded, record);

        Ok(())
    }

    #[test]
    fn test_force_flush_through_thread() -> StorageResult<()> {
        let dir = tempdir()?;
        let config = LogConfig {
            flush_interval: Duration::from_secs(60),
            ..LogConfig::default()
        };
        let log = LogManager::create(&dir.path().join("test.log"), config)?;
        log.run_flush_thread()?;
        assert!(log.is_flush_thread_running());

        log.append_log_record(&mut begin_record(1))?;
        log.force_flush()?;
        assert_eq!(log.persistent_lsn(), Lsn(1));

        log.stop_flush_thread();
        assert!(!log.is_flush_thread_running());

        Ok(())
    }

    #[test]
    fn test_periodic_flush() -> StorageResult<()> {
        let dir = tempdir()?;
        let config = LogConfig {
            flush_interval: Duration::from_millis(10),
            ..LogConfig::default()
        };
        let log = LogManager::create(&dir.path().join("test.log"), config)?;
        log.run_flush_thread()?;

        log.append_log_record(&mut begin_record(1))?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while log.persistent_lsn() < Lsn(1) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(log.persistent_lsn(), Lsn(1));

        Ok(())
    }

    #[test]
    fn test_full_buffer_forces_flush() -> StorageResult<()> {
        let dir = tempdir()?;
        let config = LogConfig {
            buffer_size: LogRecord::HEADER_SIZE * 2,
            ..LogConfig::default()
        };
        let log = LogManager::create(&dir.path().join("test.log"), config)?;

        log.append_log_record(&mut begin_record(1))?;
        log.append_log_record(&mut begin_record(2))?;
        assert_eq!(log.persistent_lsn(), Lsn::INVALID);

        // Third record does not fit and pushes the first two out
        log.append_log_record(&mut begin_record(3))?;
        assert_eq!(log.persistent_lsn(), Lsn(2));
        assert_eq!(log.log_size(), (LogRecord::HEADER_SIZE * 2) as u64);

        Ok(())
    }

    #[test]
    fn test_flush_till() -> StorageResult<()> {
        let dir = tempdir()?;
        let log = LogManager::create(&dir.path().join("test.log"), LogConfig::default())?;

        log.append_log_record(&mut begin_record(1))?;
        log.flush_till(Lsn::INVALID)?;
        assert_eq!(log.log_size(), 0);

        log.flush_till(Lsn(1))?;
        assert_eq!(log.persistent_lsn(), Lsn(1));

        Ok(())
    }

    #[test]
    fn test_concurrent_appends() -> StorageResult<()> {
        let dir = tempdir()?;
        let config = LogConfig {
            buffer_size: 256,
            flush_interval: Duration::from_millis(5),
        };
        let log = Arc::new(LogManager::create(&dir.path().join("test.log"), config)?);
        log.run_flush_thread()?;

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for _ in 0..50 {
                        log.append_log_record(&mut begin_record(t)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        log.force_flush()?;
        assert_eq!(log.persistent_lsn(), Lsn(200));
        assert_eq!(log.log_size(), (LogRecord::HEADER_SIZE * 200) as u64);

        Ok(())
    }

    #[test]
    fn test_drop_flushes() -> StorageResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");

        {
            let log = LogManager::create(&path, LogConfig::default())?;
            log.run_flush_thread()?;
            log.append_log_record(&mut begin_record(1))?;
        }

        let log = LogManager::open(&path, LogConfig::default())?;
        assert_eq!(log.log_size(), LogRecord::HEADER_SIZE as u64);

        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_write_failure_is_permanent() -> StorageResult<()> {
        // Every write to /dev/full fails with ENOSPC
        let log = LogManager::open(Path::new("/dev/full"), LogConfig::default())?;
        log.append_log_record(&mut begin_record(1))?;

        assert!(matches!(log.force_flush(), Err(StorageError::LogFlush(_))));
        assert_eq!(log.persistent_lsn(), Lsn::INVALID);

        // The lost records are never papered over by a later flush
        assert!(log.append_log_record(&mut begin_record(2)).is_err());
        assert!(log.force_flush().is_err());
        assert!(log.flush_till(Lsn(1)).is_err());
        assert_eq!(log.persistent_lsn(), Lsn::INVALID);
        Ok(())
    }
}
