use crate::access::btree::{BPlusTree, IndexKey};
use crate::access::TableHeap;
use crate::concurrency::LockManager;
use crate::config::DatabaseConfig;
use crate::recovery::{AriesRecovery, RecoveryStats};
use crate::storage::buffer::lru::LruReplacer;
use crate::storage::page::header_page::{HeaderPage, HEADER_PAGE_ID};
use crate::storage::page::PageId;
use crate::storage::wal::LogManager;
use crate::storage::{BufferPoolManager, PageManager};
use crate::transaction::{Transaction, TransactionManager};
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DATA_FILE_NAME: &str = "emberdb.db";
pub const LOG_FILE_NAME: &str = "emberdb.log";

/// High-level database interface that wires the storage engine together.
///
/// A database is a directory holding the data file and the log. Page 0 of
/// the data file is the header page naming every table and index.
pub struct Database {
    dir: PathBuf,
    config: DatabaseConfig,
    buffer_pool: BufferPoolManager,
    log_manager: Option<Arc<LogManager>>,
    txn_manager: TransactionManager,
    recovery_stats: Option<RecoveryStats>,
}

impl Database {
    /// Create a new database in `dir`, which may not hold one already.
    pub fn create(dir: &Path, config: DatabaseConfig) -> Result<Self> {
        let data_path = dir.join(DATA_FILE_NAME);
        if data_path.exists() {
            bail!("Database already exists at {:?}", dir);
        }
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create database directory {:?}", dir))?;

        let page_manager = PageManager::create(&data_path)?;
        let log_manager = if config.enable_logging {
            Some(Arc::new(LogManager::create(
                &dir.join(LOG_FILE_NAME),
                config.log_config(),
            )?))
        } else {
            None
        };

        let db = Self::assemble(dir, config, page_manager, log_manager);
        let (page_id, mut guard) = db.buffer_pool.new_page()?;
        if page_id != HEADER_PAGE_ID {
            bail!("Expected header page {}, got {}", HEADER_PAGE_ID, page_id);
        }
        HeaderPage::new(&mut guard[..]).init();
        drop(guard);
        db.buffer_pool.flush_page(HEADER_PAGE_ID)?;

        db.start()?;
        info!("Created database at {:?}", dir);
        Ok(db)
    }

    /// Open an existing database, recovering from the log first.
    pub fn open(dir: &Path, config: DatabaseConfig) -> Result<Self> {
        let data_path = dir.join(DATA_FILE_NAME);
        if !data_path.exists() {
            bail!("Database does not exist at {:?}", dir);
        }

        let page_manager = PageManager::open(&data_path)?;
        let log_manager = if config.enable_logging {
            Some(Arc::new(LogManager::open(
                &dir.join(LOG_FILE_NAME),
                config.log_config(),
            )?))
        } else {
            None
        };

        let mut db = Self::assemble(dir, config, page_manager, log_manager);
        if let Some(log_manager) = &db.log_manager {
            let stats = AriesRecovery::new(db.buffer_pool.clone(), Arc::clone(log_manager))
                .recover()
                .context("Recovery failed")?;
            if let Some(max_txn_id) = stats.max_txn_id {
                db.txn_manager.advance_id_past(max_txn_id);
            }
            info!(
                "Recovered {:?}: {} records, {} redone, {} undone",
                dir, stats.records_scanned, stats.records_redone, stats.records_undone
            );
            db.recovery_stats = Some(stats);
        }

        db.start()?;
        Ok(db)
    }

    fn assemble(
        dir: &Path,
        config: DatabaseConfig,
        page_manager: PageManager,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        let buffer_pool = BufferPoolManager::with_options(
            page_manager,
            Box::new(LruReplacer::new(config.pool_size)),
            config.pool_size,
            config.page_table_bucket_size,
            log_manager.clone(),
        );
        let txn_manager = TransactionManager::new(Arc::new(LockManager::new()), log_manager.clone());

        Self {
            dir: dir.to_path_buf(),
            config,
            buffer_pool,
            log_manager,
            txn_manager,
            recovery_stats: None,
        }
    }

    fn start(&self) -> Result<()> {
        if let Some(log_manager) = &self.log_manager {
            log_manager.run_flush_thread()?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn buffer_pool(&self) -> &BufferPoolManager {
        &self.buffer_pool
    }

    pub fn log_manager(&self) -> Option<&Arc<LogManager>> {
        self.log_manager.as_ref()
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.txn_manager
    }

    /// What recovery did when this database was opened.
    pub fn recovery_stats(&self) -> Option<&RecoveryStats> {
        self.recovery_stats.as_ref()
    }

    pub fn begin(&self) -> Result<Arc<Transaction>> {
        Ok(self.txn_manager.begin()?)
    }

    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        Ok(self.txn_manager.commit(txn)?)
    }

    pub fn abort(&self, txn: &Transaction) -> Result<()> {
        Ok(self.txn_manager.abort(txn)?)
    }

    fn lookup(&self, name: &str) -> Result<Option<PageId>> {
        let guard = self.buffer_pool.fetch_page_read(HEADER_PAGE_ID)?;
        Ok(HeaderPage::new(&guard[..]).get_root_id(name))
    }

    /// Names `page_id` in the header page and writes the header back.
    fn register(&self, name: &str, page_id: PageId) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
        if !HeaderPage::new(&mut guard[..]).insert_record(name, page_id) {
            bail!("Cannot register '{}': name taken or header page full", name);
        }
        drop(guard);
        self.buffer_pool.flush_page(HEADER_PAGE_ID)?;
        Ok(())
    }

    /// Create a new table. Its first page is logged as part of `txn`.
    pub fn create_table(&self, name: &str, txn: &Transaction) -> Result<TableHeap> {
        if self.lookup(name)?.is_some() {
            bail!("'{}' already exists", name);
        }

        let table = TableHeap::create(
            self.buffer_pool.clone(),
            Arc::clone(self.txn_manager.lock_manager()),
            txn,
        )?;
        self.register(name, table.first_page_id())?;
        info!("Created table '{}' at page {}", name, table.first_page_id());
        Ok(table)
    }

    /// Open a table for reading/writing
    pub fn open_table(&self, name: &str) -> Result<TableHeap> {
        let Some(first_page_id) = self.lookup(name)? else {
            bail!("Table '{}' does not exist", name);
        };
        Ok(TableHeap::open(
            self.buffer_pool.clone(),
            Arc::clone(self.txn_manager.lock_manager()),
            first_page_id,
        ))
    }

    fn index_sizes<K: IndexKey>(&self) -> (usize, usize) {
        (
            self.config
                .leaf_max_size
                .unwrap_or_else(BPlusTree::<K>::leaf_capacity),
            self.config
                .internal_max_size
                .unwrap_or_else(BPlusTree::<K>::internal_capacity),
        )
    }

    /// Create an empty index. Its root is recorded once the first key goes in.
    pub fn create_index<K: IndexKey>(&self, name: &str) -> Result<BPlusTree<K>> {
        if self.lookup(name)?.is_some() {
            bail!("'{}' already exists", name);
        }
        self.register(name, PageId::INVALID)?;

        let (leaf_max_size, internal_max_size) = self.index_sizes::<K>();
        BPlusTree::new(name, self.buffer_pool.clone(), leaf_max_size, internal_max_size)
    }

    /// Open an index by name. The key type must match the one it was
    /// created with.
    pub fn open_index<K: IndexKey>(&self, name: &str) -> Result<BPlusTree<K>> {
        if self.lookup(name)?.is_none() {
            bail!("Index '{}' does not exist", name);
        }
        let (leaf_max_size, internal_max_size) = self.index_sizes::<K>();
        BPlusTree::new(name, self.buffer_pool.clone(), leaf_max_size, internal_max_size)
    }

    /// Every table and index name with its first or root page.
    pub fn catalog(&self) -> Result<Vec<(String, PageId)>> {
        let guard = self.buffer_pool.fetch_page_read(HEADER_PAGE_ID)?;
        Ok(HeaderPage::new(&guard[..]).records())
    }

    /// Make the log durable and write every dirty page back.
    pub fn flush(&self) -> Result<()> {
        if let Some(log_manager) = &self.log_manager {
            log_manager.force_flush()?;
        }
        self.buffer_pool.flush_all()?;
        Ok(())
    }

    /// Shut down cleanly: stop the flush thread and write everything back.
    pub fn close(self) -> Result<()> {
        if let Some(log_manager) = &self.log_manager {
            log_manager.stop_flush_thread();
        }
        self.flush()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // With a log, pages that are not written back are rebuilt by recovery
        if self.log_manager.is_none() {
            if let Err(e) = self.buffer_pool.flush_all() {
                warn!("Flushing database on drop failed: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_config() -> DatabaseConfig {
        DatabaseConfig {
            pool_size: 16,
            ..DatabaseConfig::default()
        }
    }

    #[test]
    fn test_create_database() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::create(dir.path(), small_config())?;
        assert!(dir.path().join(DATA_FILE_NAME).exists());
        assert!(dir.path().join(LOG_FILE_NAME).exists());
        assert!(db.catalog()?.is_empty());
        assert!(db.recovery_stats().is_none());
        Ok(())
    }

    #[test]
    fn test_create_duplicate_database() -> Result<()> {
        let dir = tempdir()?;
        let _db = Database::create(dir.path(), small_config())?;

        let result = Database::create(dir.path(), small_config());
        let err_msg = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err_msg.contains("already exists"));
        Ok(())
    }

    #[test]
    fn test_open_nonexistent_database() -> Result<()> {
        let dir = tempdir()?;
        let result = Database::open(&dir.path().join("missing"), small_config());
        let err_msg = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err_msg.contains("does not exist"));
        Ok(())
    }

    #[test]
    fn test_create_and_open_table() -> Result<()> {
        let dir = tempdir()?;
        let rid = {
            let db = Database::create(dir.path(), small_config())?;
            let txn = db.begin()?;
            let users = db.create_table("users", &txn)?;
            db.create_table("products", &txn)?;
            let rid = users.insert_tuple(b"alice", &txn)?;
            db.commit(&txn)?;
            db.close()?;
            rid
        };

        let db = Database::open(dir.path(), small_config())?;
        let names: Vec<String> = db.catalog()?.into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["users".to_string(), "products".to_string()]);

        let users = db.open_table("users")?;
        let txn = db.begin()?;
        assert_eq!(users.get_tuple(rid, &txn)?.map(|t| t.data), Some(b"alice".to_vec()));
        db.commit(&txn)?;

        let stats = db.recovery_stats().cloned().unwrap_or_default();
        assert!(stats.loser_transactions.is_empty());
        Ok(())
    }

    #[test]
    fn test_duplicate_and_missing_names() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::create(dir.path(), small_config())?;
        let txn = db.begin()?;
        db.create_table("t", &txn)?;
        assert!(db.create_table("t", &txn).is_err());
        assert!(db.create_index::<u32>("t").is_err());
        db.commit(&txn)?;

        let err_msg = db.open_table("nope").err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err_msg.contains("does not exist"));
        assert!(db.open_index::<u32>("nope").is_err());
        Ok(())
    }

    #[test]
    fn test_index_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let config = DatabaseConfig {
            leaf_max_size: Some(4),
            internal_max_size: Some(4),
            ..small_config()
        };
        {
            let db = Database::create(dir.path(), config.clone())?;
            let index = db.create_index::<u32>("by_id")?;
            for key in 0..50u32 {
                assert!(index.insert(&key, crate::access::Rid::new(PageId(1), key))?);
            }
            db.close()?;
        }

        let db = Database::open(dir.path(), config)?;
        let index = db.open_index::<u32>("by_id")?;
        assert_eq!(index.get_value(&42)?, Some(crate::access::Rid::new(PageId(1), 42)));
        index.check_integrity()?;
        Ok(())
    }

    #[test]
    fn test_without_logging() -> Result<()> {
        let dir = tempdir()?;
        let config = DatabaseConfig {
            enable_logging: false,
            ..small_config()
        };
        let rid = {
            let db = Database::create(dir.path(), config.clone())?;
            let txn = db.begin()?;
            let table = db.create_table("plain", &txn)?;
            let rid = table.insert_tuple(b"kept", &txn)?;
            db.commit(&txn)?;
            rid
        };
        assert!(!dir.path().join(LOG_FILE_NAME).exists());

        // Dropping wrote the pages back
        let db = Database::open(dir.path(), config)?;
        let table = db.open_table("plain")?;
        let txn = db.begin()?;
        assert_eq!(table.get_tuple(rid, &txn)?.map(|t| t.data), Some(b"kept".to_vec()));
        Ok(())
    }
}
