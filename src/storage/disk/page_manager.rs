use crate::storage::page::PageId;
use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 4096;

/// Reads and writes fixed-size pages of the data file.
///
/// Page `n` lives at byte offset `n * PAGE_SIZE`. Deallocated page ids are
/// kept in memory and handed out again by [`PageManager::allocate_page`]
/// before the file is extended.
pub struct PageManager {
    file: File,
    free_pages: Vec<PageId>,
}

impl PageManager {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;

        Ok(Self {
            file,
            free_pages: Vec::new(),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open file: {:?}", path))?;

        Ok(Self {
            file,
            free_pages: Vec::new(),
        })
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            bail!(
                "Buffer size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                buf.len()
            );
        }

        if !self.contains(page_id)? {
            bail!("Page {} does not exist", page_id);
        }

        self.file
            .seek(SeekFrom::Start(Self::page_offset(page_id)))
            .context("Failed to seek")?;
        self.file.read_exact(buf).context("Failed to read page")?;

        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            bail!(
                "Data size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                data.len()
            );
        }
        if !page_id.is_valid() {
            bail!("Cannot write the invalid page id");
        }

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();
        if offset >= file_size {
            self.file
                .set_len(offset + PAGE_SIZE as u64)
                .context("Failed to extend file")?;
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.write_all(data).context("Failed to write page")?;

        Ok(())
    }

    /// Flushes written pages to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().context("Failed to sync")
    }

    pub fn num_pages(&self) -> Result<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    /// Returns true if the page lies inside the data file.
    pub fn contains(&self, page_id: PageId) -> Result<bool> {
        Ok(page_id.is_valid() && page_id.0 < self.num_pages()?)
    }

    pub fn allocate_page(&mut self) -> Result<PageId> {
        if let Some(page_id) = self.free_pages.pop() {
            return Ok(page_id);
        }

        let current_pages = self.num_pages()?;
        let new_page_id = PageId(current_pages);

        let new_size = (current_pages as u64 + 1) * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .context("Failed to extend file")?;

        Ok(new_page_id)
    }

    /// Extends the file so that `page_id` exists. Recovery uses this to
    /// replay changes to pages whose allocation never reached the disk.
    pub fn ensure_allocated(&mut self, page_id: PageId) -> Result<()> {
        if !page_id.is_valid() {
            bail!("Cannot allocate the invalid page id");
        }
        if self.contains(page_id)? {
            return Ok(());
        }
        self.file
            .set_len((page_id.0 as u64 + 1) * PAGE_SIZE as u64)
            .context("Failed to extend file")?;
        self.free_pages.retain(|&free| free != page_id);
        Ok(())
    }

    /// Returns a page id to the allocator. The file is never shrunk.
    pub fn deallocate_page(&mut self, page_id: PageId) -> Result<()> {
        if !self.contains(page_id)? {
            bail!("Cannot deallocate page {}: not allocated", page_id);
        }
        if !self.free_pages.contains(&page_id) {
            self.free_pages.push(page_id);
        }
        Ok(())
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let mut pm = PageManager::create(&file_path)?;
            pm.allocate_page()?;
        }

        let pm = PageManager::open(&file_path)?;
        assert_eq!(pm.num_pages()?, 1);

        Ok(())
    }

    #[test]
    fn test_write_and_read_page() -> Result<()> {
        let dir = tempdir()?;
        let mut pm = PageManager::create(&dir.path().join("test.db"))?;

        let mut write_buf = vec![0u8; PAGE_SIZE];
        write_buf[0] = 42;
        write_buf[PAGE_SIZE - 1] = 24;
        pm.write_page(PageId(0), &write_buf)?;

        let mut read_buf = vec![0u8; PAGE_SIZE];
        pm.read_page(PageId(0), &mut read_buf)?;
        assert_eq!(read_buf[0], 42);
        assert_eq!(read_buf[PAGE_SIZE - 1], 24);

        Ok(())
    }

    #[test]
    fn test_ensure_allocated() -> Result<()> {
        let dir = tempdir()?;
        let mut pm = PageManager::create(&dir.path().join("test.db"))?;

        pm.ensure_allocated(PageId(3))?;
        assert_eq!(pm.num_pages()?, 4);
        assert!(pm.contains(PageId(2))?);

        // Already present pages are left alone
        pm.ensure_allocated(PageId(1))?;
        assert_eq!(pm.num_pages()?, 4);
        assert_eq!(pm.allocate_page()?, PageId(4));
        assert!(pm.ensure_allocated(PageId::INVALID).is_err());

        Ok(())
    }

    #[test]
    fn test_read_nonexistent_page() -> Result<()> {
        let dir = tempdir()?;
        let mut pm = PageManager::create(&dir.path().join("test.db"))?;

        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(pm.read_page(PageId(10), &mut buf).is_err());
        assert!(pm.read_page(PageId::INVALID, &mut buf).is_err());

        Ok(())
    }

    #[test]
    fn test_invalid_buffer_size() -> Result<()> {
        let dir = tempdir()?;
        let mut pm = PageManager::create(&dir.path().join("test.db"))?;

        let mut small_buf = vec![0u8; 100];
        assert!(pm.read_page(PageId(0), &mut small_buf).is_err());
        assert!(pm.write_page(PageId(0), &small_buf).is_err());

        Ok(())
    }

    #[test]
    fn test_file_growth() -> Result<()> {
        let dir = tempdir()?;
        let mut pm = PageManager::create(&dir.path().join("test.db"))?;

        let buf = vec![5u8; PAGE_SIZE];
        pm.write_page(PageId(5), &buf)?;
        assert_eq!(pm.num_pages()?, 6);
        assert!(pm.contains(PageId(5))?);
        assert!(!pm.contains(PageId(6))?);

        Ok(())
    }

    #[test]
    fn test_persistence() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let mut pm = PageManager::create(&file_path)?;
            let buf = vec![99u8; PAGE_SIZE];
            pm.write_page(PageId(0), &buf)?;
            pm.sync()?;
        }

        let mut pm = PageManager::open(&file_path)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        pm.read_page(PageId(0), &mut buf)?;
        assert_eq!(buf[0], 99);

        Ok(())
    }

    #[test]
    fn test_allocate_reuses_deallocated_pages() -> Result<()> {
        let dir = tempdir()?;
        let mut pm = PageManager::create(&dir.path().join("test.db"))?;

        assert_eq!(pm.allocate_page()?, PageId(0));
        assert_eq!(pm.allocate_page()?, PageId(1));
        assert_eq!(pm.allocate_page()?, PageId(2));

        pm.deallocate_page(PageId(1))?;
        // Double free is ignored
        pm.deallocate_page(PageId(1))?;
        assert_eq!(pm.allocate_page()?, PageId(1));
        assert_eq!(pm.allocate_page()?, PageId(3));
        assert_eq!(pm.num_pages()?, 4);

        assert!(pm.deallocate_page(PageId(9)).is_err());

        Ok(())
    }
}
