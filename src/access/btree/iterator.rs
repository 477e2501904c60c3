use crate::access::btree::IndexKey;
use crate::access::Rid;
use crate::storage::page::btree_leaf_page::BTreeLeafPage;
use crate::storage::page::btree_page::BTreePage;
use crate::storage::page::PageId;
use crate::storage::{BufferPoolManager, PageReadGuard};
use anyhow::{bail, Result};
use std::collections::VecDeque;

/// Forward scan over the leaf chain.
///
/// The entries of one leaf are copied out under its read latch, and the latch
/// is released before the next leaf is fetched. A scan therefore never blocks
/// writers for long, but it is not a snapshot: pages split or merged behind
/// it may be seen in their new shape or skipped. Start a fresh scan from the
/// tree to get a consistent view after structural changes.
pub struct BPlusTreeIterator<K: IndexKey> {
    buffer_pool: BufferPoolManager,
    entries: VecDeque<(K, Rid)>,
    next_page_id: PageId,
}

impl<K: IndexKey> BPlusTreeIterator<K> {
    pub(crate) fn new(buffer_pool: BufferPoolManager, leaf: Option<PageReadGuard>, start: Option<&K>) -> Self {
        let mut iter = Self {
            buffer_pool,
            entries: VecDeque::new(),
            next_page_id: PageId::INVALID,
        };
        if let Some(guard) = leaf {
            let page = BTreeLeafPage::<_, K>::new(&guard[..]);
            let first = start.map_or(0, |key| page.key_index(key));
            iter.entries.extend(page.entries_from(first));
            iter.next_page_id = page.next_page_id();
        }
        iter
    }

    /// Copies out the entries of `page_id`. The id came from a latch that is
    /// no longer held, so the page may have been merged away and reused.
    fn load_leaf(&mut self, page_id: PageId) -> Result<()> {
        let guard = self.buffer_pool.fetch_page_read(page_id)?;
        let BTreePage::Leaf(page) = BTreePage::<_, K>::from_data(&guard[..])? else {
            bail!("Page {} is no longer a leaf of this index", page_id);
        };
        self.entries.extend(page.entries());
        self.next_page_id = page.next_page_id();
        Ok(())
    }

    /// True once every entry has been returned.
    pub fn is_end(&self) -> bool {
        self.entries.is_empty() && !self.next_page_id.is_valid()
    }
}

impl<K: IndexKey> Iterator for BPlusTreeIterator<K> {
    type Item = Result<(K, Rid)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.entries.pop_front() {
                return Some(Ok(entry));
            }
            if !self.next_page_id.is_valid() {
                return None;
            }
            let page_id = self.next_page_id;
            if let Err(e) = self.load_leaf(page_id) {
                self.next_page_id = PageId::INVALID;
                return Some(Err(e));
            }
        }
    }
}
