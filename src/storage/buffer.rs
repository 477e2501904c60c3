pub mod lru;
pub mod page_table;
pub mod replacer;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{page_lsn, set_page_id, PageId};
use crate::storage::wal::LogManager;
use crate::storage::{PageManager, PAGE_SIZE};
use log::{debug, error, warn};
use page_table::ExtendibleHashTable;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Default number of entries per page table bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 16;

type PageBuf = Box<[u8; PAGE_SIZE]>;
type ReadLatch = ArcRwLockReadGuard<RawRwLock, PageBuf>;
type WriteLatch = ArcRwLockWriteGuard<RawRwLock, PageBuf>;

#[derive(Debug, Clone, Copy, Default)]
struct FrameMeta {
    page_id: Option<PageId>,
    pin_count: u32,
    is_dirty: bool,
}

/// Bookkeeping guarded by the pool-wide mutex.
struct PoolState {
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: Box<dyn Replacer>,
    free_list: VecDeque<FrameId>,
    frames: Vec<FrameMeta>,
}

impl PoolState {
    /// Picks a frame for a new resident page: a free frame first, else the
    /// replacer's victim. Returns the victim's page and dirty flag, if any.
    fn take_frame(&mut self) -> StorageResult<(FrameId, Option<(PageId, bool)>)> {
        if let Some(frame_id) = self.free_list.pop_front() {
            return Ok((frame_id, None));
        }

        let frame_id = self.replacer.victim().ok_or(StorageError::OutOfFrames)?;
        let meta = std::mem::take(&mut self.frames[frame_id as usize]);
        let victim = meta.page_id.map(|page_id| {
            self.page_table.remove(&page_id);
            (page_id, meta.is_dirty)
        });
        if let Some((page_id, dirty)) = victim {
            debug!("Evicting page {} from frame {} (dirty: {})", page_id, frame_id, dirty);
        }

        Ok((frame_id, victim))
    }

    fn pin(&mut self, frame_id: FrameId) {
        self.frames[frame_id as usize].pin_count += 1;
        self.replacer.pin(frame_id);
    }

    fn unpin(&mut self, frame_id: FrameId, is_dirty: bool) -> bool {
        let meta = &mut self.frames[frame_id as usize];
        if meta.pin_count == 0 {
            return false;
        }

        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;
        if meta.pin_count == 0 {
            self.replacer.unpin(frame_id);
        }
        true
    }

    /// Returns a frame whose page could not be loaded to the free list.
    fn release(&mut self, frame_id: FrameId, page_id: PageId) {
        self.page_table.remove(&page_id);
        self.frames[frame_id as usize] = FrameMeta::default();
        self.replacer.pin(frame_id);
        self.free_list.push_back(frame_id);
    }
}

/// Fixed-size page cache over the data file.
///
/// Each frame's buffer sits behind its own `RwLock`, which doubles as the page
/// latch handed out through [`PageReadGuard`] and [`PageWriteGuard`]. Frame
/// metadata, the page table and the replacer share one mutex; disk I/O never
/// happens while it is held.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    frames: Vec<Arc<RwLock<PageBuf>>>,
    state: Mutex<PoolState>,
    page_manager: Mutex<PageManager>,
    log_manager: Option<Arc<LogManager>>,
}

impl BufferPoolManager {
    pub fn new(page_manager: PageManager, replacer: Box<dyn Replacer>, pool_size: usize) -> Self {
        Self::with_options(page_manager, replacer, pool_size, DEFAULT_BUCKET_SIZE, None)
    }

    /// Creates a pool that honours write-ahead logging: before a dirty page is
    /// written back, the log is flushed up to the page's LSN.
    pub fn with_options(
        page_manager: PageManager,
        replacer: Box<dyn Replacer>,
        pool_size: usize,
        bucket_size: usize,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        let frames = (0..pool_size)
            .map(|_| Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]))))
            .collect();

        Self {
            inner: Arc::new(BufferPoolInner {
                frames,
                state: Mutex::new(PoolState {
                    page_table: ExtendibleHashTable::new(bucket_size),
                    replacer,
                    free_list: (0..pool_size as FrameId).collect(),
                    frames: vec![FrameMeta::default(); pool_size],
                }),
                page_manager: Mutex::new(page_manager),
                log_manager,
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.inner.frames.len()
    }

    /// Fetches a page and takes its read latch.
    pub fn fetch_page_read(&self, page_id: PageId) -> StorageResult<PageReadGuard> {
        let frame_id = self.pin_page(page_id)?;
        let latch = self.inner.frames[frame_id as usize].read_arc();

        Ok(PageReadGuard {
            pool: Arc::clone(&self.inner),
            page_id,
            frame_id,
            latch: ManuallyDrop::new(latch),
        })
    }

    /// Fetches a page and takes its write latch. The page is unpinned dirty.
    pub fn fetch_page_write(&self, page_id: PageId) -> StorageResult<PageWriteGuard> {
        let frame_id = self.pin_page(page_id)?;
        let latch = self.inner.frames[frame_id as usize].write_arc();

        Ok(PageWriteGuard {
            pool: Arc::clone(&self.inner),
            page_id,
            frame_id,
            latch: ManuallyDrop::new(latch),
        })
    }

    /// Makes `page_id` resident and pins it without latching. Every successful
    /// call must be matched by [`BufferPoolManager::unpin_page`].
    pub fn pin_page(&self, page_id: PageId) -> StorageResult<FrameId> {
        let mut state = self.inner.state.lock();

        if let Some(frame_id) = state.page_table.find(&page_id) {
            state.pin(frame_id);
            return Ok(frame_id);
        }

        let mut page_manager = self.inner.page_manager.lock();
        if !page_manager.contains(page_id)? {
            return Err(StorageError::PageNotFound(page_id));
        }

        let (frame_id, victim) = state.take_frame()?;
        state.page_table.insert(page_id, frame_id);
        state.frames[frame_id as usize] = FrameMeta {
            page_id: Some(page_id),
            pin_count: 1,
            is_dirty: false,
        };
        state.replacer.pin(frame_id);

        // Nobody latches an unpinned frame, so this never waits. Readers of
        // `page_id` now block on the latch until the load below completes.
        let mut latch = self.inner.frames[frame_id as usize].write_arc();
        drop(state);

        let loaded = self
            .write_back(&mut page_manager, victim, &latch)
            .and_then(|_| Ok(page_manager.read_page(page_id, &mut latch[..])?));
        drop(page_manager);
        drop(latch);

        if let Err(e) = loaded {
            self.inner.state.lock().release(frame_id, page_id);
            return Err(e);
        }

        Ok(frame_id)
    }

    /// Makes sure `page_id` exists in the data file, extending it with
    /// zeroed pages when needed.
    pub fn ensure_page(&self, page_id: PageId) -> StorageResult<()> {
        Ok(self.inner.page_manager.lock().ensure_allocated(page_id)?)
    }

    /// Allocates a fresh zeroed page, pinned and write-latched.
    pub fn new_page(&self) -> StorageResult<(PageId, PageWriteGuard)> {
        let mut state = self.inner.state.lock();
        let (frame_id, victim) = state.take_frame()?;

        let mut page_manager = self.inner.page_manager.lock();
        let page_id = match page_manager.allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                if let Some((victim_id, dirty)) = victim {
                    // Victim content is still in the frame; keep it resident.
                    state.page_table.insert(victim_id, frame_id);
                    state.frames[frame_id as usize] = FrameMeta {
                        page_id: Some(victim_id),
                        pin_count: 0,
                        is_dirty: dirty,
                    };
                    state.replacer.unpin(frame_id);
                } else {
                    state.free_list.push_front(frame_id);
                }
                return Err(e.into());
            }
        };

        state.page_table.insert(page_id, frame_id);
        state.frames[frame_id as usize] = FrameMeta {
            page_id: Some(page_id),
            pin_count: 1,
            is_dirty: true,
        };
        state.replacer.pin(frame_id);

        let mut latch = self.inner.frames[frame_id as usize].write_arc();
        drop(state);

        let written = self.write_back(&mut page_manager, victim, &latch);
        drop(page_manager);
        if let Err(e) = written {
            drop(latch);
            self.inner.state.lock().release(frame_id, page_id);
            return Err(e);
        }

        latch.fill(0);
        set_page_id(&mut latch[..], page_id);

        Ok((
            page_id,
            PageWriteGuard {
                pool: Arc::clone(&self.inner),
                page_id,
                frame_id,
                latch: ManuallyDrop::new(latch),
            },
        ))
    }

    /// Writes an evicted dirty page, flushing the log up to its LSN first.
    fn write_back(
        &self,
        page_manager: &mut PageManager,
        victim: Option<(PageId, bool)>,
        data: &PageBuf,
    ) -> StorageResult<()> {
        let Some((page_id, true)) = victim else {
            return Ok(());
        };

        if let Some(log_manager) = &self.inner.log_manager {
            log_manager.flush_till(page_lsn(&data[..]))?;
        }
        page_manager.write_page(page_id, &data[..])?;
        Ok(())
    }

    /// Decrements the pin count of a page pinned through
    /// [`BufferPoolManager::pin_page`]. A dirty flag is sticky until the page is
    /// flushed.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> StorageResult<()> {
        let mut state = self.inner.state.lock();
        let frame_id = state
            .page_table
            .find(&page_id)
            .ok_or(StorageError::PageNotFound(page_id))?;

        if state.unpin(frame_id, is_dirty) {
            Ok(())
        } else {
            Err(StorageError::NotPinned(page_id))
        }
    }

    /// Writes a resident page to disk regardless of its pin count. Returns
    /// false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<bool> {
        let frame_id = {
            let mut state = self.inner.state.lock();
            let Some(frame_id) = state.page_table.find(&page_id) else {
                return Ok(false);
            };
            state.pin(frame_id);
            frame_id
        };

        let result = self.flush_frame(page_id, frame_id);
        self.inner.state.lock().unpin(frame_id, false);
        result.map(|_| true)
    }

    fn flush_frame(&self, page_id: PageId, frame_id: FrameId) -> StorageResult<()> {
        let latch = self.inner.frames[frame_id as usize].read();

        if let Some(log_manager) = &self.inner.log_manager {
            log_manager.flush_till(page_lsn(&latch[..]))?;
        }

        // Writers hold the write latch while modifying, so clearing the flag
        // here cannot lose an update made after this copy.
        self.inner.state.lock().frames[frame_id as usize].is_dirty = false;
        self.inner
            .page_manager
            .lock()
            .write_page(page_id, &latch[..])?;

        Ok(())
    }

    /// Writes every resident page and syncs the data file.
    pub fn flush_all(&self) -> StorageResult<()> {
        let resident: Vec<PageId> = {
            let state = self.inner.state.lock();
            state.frames.iter().filter_map(|meta| meta.page_id).collect()
        };

        for page_id in resident {
            self.flush_page(page_id)?;
        }
        self.inner.page_manager.lock().sync()?;

        Ok(())
    }

    /// Drops a page from the pool and returns it to the allocator. Returns
    /// false while the page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> StorageResult<bool> {
        let mut state = self.inner.state.lock();

        if let Some(frame_id) = state.page_table.find(&page_id) {
            if state.frames[frame_id as usize].pin_count > 0 {
                return Ok(false);
            }
            state.release(frame_id, page_id);
        }

        self.inner.page_manager.lock().deallocate_page(page_id)?;
        debug!("Deleted page {}", page_id);
        Ok(true)
    }

    /// Current pin count of a resident page.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.inner.state.lock();
        state
            .page_table
            .find(&page_id)
            .map(|frame_id| state.frames[frame_id as usize].pin_count)
    }

    pub fn is_dirty(&self, page_id: PageId) -> Option<bool> {
        let state = self.inner.state.lock();
        state
            .page_table
            .find(&page_id)
            .map(|frame_id| state.frames[frame_id as usize].is_dirty)
    }

    pub fn log_manager(&self) -> Option<&Arc<LogManager>> {
        self.inner.log_manager.as_ref()
    }
}

impl BufferPoolInner {
    fn unpin_frame(&self, page_id: PageId, frame_id: FrameId, is_dirty: bool) {
        if !self.state.lock().unpin(frame_id, is_dirty) {
            error!("Page {} released with a zero pin count", page_id);
        }
    }
}

pub struct PageReadGuard {
    pool: Arc<BufferPoolInner>,
    page_id: PageId,
    frame_id: FrameId,
    latch: ManuallyDrop<ReadLatch>,
}

impl PageReadGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageReadGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.latch
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        // Release the latch before the frame becomes evictable
        unsafe { ManuallyDrop::drop(&mut self.latch) };
        self.pool.unpin_frame(self.page_id, self.frame_id, false);
    }
}

pub struct PageWriteGuard {
    pool: Arc<BufferPoolInner>,
    page_id: PageId,
    frame_id: FrameId,
    latch: ManuallyDrop<WriteLatch>,
}

impl PageWriteGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.latch
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.latch
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        unsafe { ManuallyDrop::drop(&mut self.latch) };
        self.pool.unpin_frame(self.page_id, self.frame_id, true);
    }
}

impl std::fmt::Debug for PageReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageReadGuard")
            .field("page_id", &self.page_id)
            .finish()
    }
}

impl std::fmt::Debug for PageWriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageWriteGuard")
            .field("page_id", &self.page_id)
            .finish()
    }
}

impl Drop for BufferPoolInner {
    fn drop(&mut self) {
        let pinned = self.state.get_mut().frames.iter().filter(|m| m.pin_count > 0).count();
        if pinned > 0 {
            warn!("Buffer pool dropped with {} pinned frames", pinned);
        }
    }
}
