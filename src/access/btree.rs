//! Disk-resident B+ tree index over fixed-width keys.
//!
//! Concurrency follows latch crabbing. Lookups take read latches top-down
//! and release the parent as soon as the child is latched. Inserts and
//! removes take write latches and keep the chain of ancestors until they
//! reach a page that cannot split (insert) or underflow (remove); at that
//! point every latch above it, including the root latch, is dropped.
//!
//! The root page id is guarded by its own latch and mirrored into the
//! header page under the index name, so the tree can be reopened.

pub mod iterator;
pub mod key;

pub use iterator::BPlusTreeIterator;
pub use key::{FixedKey, IndexKey};

use crate::access::Rid;
use crate::storage::page::btree_internal_page::BTreeInternalPage;
use crate::storage::page::btree_leaf_page::BTreeLeafPage;
use crate::storage::page::btree_page::{self, BTreePage};
use crate::storage::page::header_page::{HeaderPage, HEADER_PAGE_ID};
use crate::storage::page::{Page, PageId};
use crate::storage::{BufferPoolManager, PageReadGuard, PageWriteGuard};
use anyhow::{anyhow, bail, Result};
use log::{debug, warn};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::marker::PhantomData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Insert,
    Remove,
}

/// Write latches held by one insert or remove.
///
/// `pages` is the retained path from the topmost unsafe ancestor down to the
/// page currently being modified.
struct WriteContext<'a> {
    root: Option<RwLockWriteGuard<'a, PageId>>,
    pages: Vec<PageWriteGuard>,
}

impl WriteContext<'_> {
    fn release_ancestors(&mut self) {
        self.root = None;
        self.pages.clear();
    }

    fn pop(&mut self) -> Result<PageWriteGuard> {
        self.pages
            .pop()
            .ok_or_else(|| anyhow!("B+ tree latch path is empty"))
    }
}

pub struct BPlusTree<K: IndexKey> {
    index_name: String,
    buffer_pool: BufferPoolManager,
    root_page_id: RwLock<PageId>,
    leaf_max_size: usize,
    internal_max_size: usize,
    _key: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Opens the index called `index_name`, picking up its root from the
    /// header page. An unknown name starts out as an empty tree.
    pub fn new(
        index_name: &str,
        buffer_pool: BufferPoolManager,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        if !(2..=Self::leaf_capacity()).contains(&leaf_max_size) {
            bail!(
                "Leaf max size must be between 2 and {}, got {}",
                Self::leaf_capacity(),
                leaf_max_size
            );
        }
        if !(3..=Self::internal_capacity()).contains(&internal_max_size) {
            bail!(
                "Internal max size must be between 3 and {}, got {}",
                Self::internal_capacity(),
                internal_max_size
            );
        }

        let root_page_id = {
            let guard = buffer_pool.fetch_page_read(HEADER_PAGE_ID)?;
            HeaderPage::new(&guard[..])
                .get_root_id(index_name)
                .unwrap_or(PageId::INVALID)
        };

        Ok(Self {
            index_name: index_name.to_string(),
            buffer_pool,
            root_page_id: RwLock::new(root_page_id),
            leaf_max_size,
            internal_max_size,
            _key: PhantomData,
        })
    }

    /// Largest leaf `max_size` that fits in a page for this key type.
    pub fn leaf_capacity() -> usize {
        BTreeLeafPage::<&[u8], K>::max_capacity()
    }

    /// Largest internal `max_size` that fits in a page for this key type.
    pub fn internal_capacity() -> usize {
        BTreeInternalPage::<&[u8], K>::max_capacity()
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    pub fn get_value(&self, key: &K) -> Result<Option<Rid>> {
        let Some(guard) = self.find_leaf_read(Some(key))? else {
            return Ok(None);
        };
        Ok(BTreeLeafPage::<_, K>::new(&guard[..]).lookup(key))
    }

    /// Inserts `key -> rid`. Returns false, leaving the tree untouched, if the
    /// key is already present.
    pub fn insert(&self, key: &K, rid: Rid) -> Result<bool> {
        let mut root = self.root_page_id.write();
        if !root.is_valid() {
            self.start_new_tree(&mut root, key, rid)?;
            return Ok(true);
        }

        let mut ctx = self.descend_for_write(root, key, Operation::Insert)?;
        let mut leaf_guard = ctx.pop()?;
        if BTreeLeafPage::<_, K>::new(&leaf_guard[..]).lookup(key).is_some() {
            return Ok(false);
        }

        // Every page a split may need is allocated before anything changes,
        // so running out of frames leaves the tree as it was.
        let mut spare = self.reserve_split_pages(&ctx, &leaf_guard)?;
        let mut leaf = BTreeLeafPage::<_, K>::new(&mut leaf_guard[..]);
        leaf.insert(key, rid);
        if leaf.size() <= leaf.max_size() {
            return Ok(true);
        }

        let (sibling_id, mut sibling_guard) = Self::take_spare(&mut spare)?;
        let mut sibling = BTreeLeafPage::<_, K>::new(&mut sibling_guard[..]);
        sibling.init(sibling_id, leaf.parent_page_id(), self.leaf_max_size);
        leaf.move_half_to(&mut sibling);
        let separator = sibling.key_at(0);
        debug!(
            "{}: split leaf {} into {}",
            self.index_name,
            leaf_guard.page_id(),
            sibling_id
        );

        self.insert_into_parent(&mut ctx, &mut spare, leaf_guard, separator, sibling_guard)?;
        self.release_spare(spare);
        Ok(true)
    }

    /// Allocates one page per page on the latch path that will split, plus a
    /// new root when the split reaches the root. On failure every page
    /// allocated so far is given back.
    fn reserve_split_pages(
        &self,
        ctx: &WriteContext,
        leaf: &PageWriteGuard,
    ) -> Result<Vec<(PageId, PageWriteGuard)>> {
        let mut needed = 0;
        let mut reaches_root = false;
        // Full pages form a suffix of the path: the first page above them is
        // insert-safe and absorbs the separator.
        for guard in std::iter::once(leaf).chain(ctx.pages.iter().rev()) {
            let page = BTreePage::<_, K>::from_data(&guard[..])?;
            if page.is_insert_safe() {
                break;
            }
            needed += 1;
            reaches_root = page.is_root();
        }
        if reaches_root {
            needed += 1;
        }

        let mut spare = Vec::with_capacity(needed);
        for _ in 0..needed {
            match self.buffer_pool.new_page() {
                Ok(page) => spare.push(page),
                Err(e) => {
                    self.release_spare(spare);
                    return Err(e.into());
                }
            }
        }
        Ok(spare)
    }

    fn take_spare(spare: &mut Vec<(PageId, PageWriteGuard)>) -> Result<(PageId, PageWriteGuard)> {
        spare
            .pop()
            .ok_or_else(|| anyhow!("B+ tree split ran out of reserved pages"))
    }

    fn release_spare(&self, spare: Vec<(PageId, PageWriteGuard)>) {
        for (page_id, guard) in spare {
            drop(guard);
            if let Err(e) = self.buffer_pool.delete_page(page_id) {
                warn!("{}: cannot free reserved page {}: {}", self.index_name, page_id, e);
            }
        }
    }

    /// Removes `key`. Returns false if it was not present.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let root = self.root_page_id.write();
        if !root.is_valid() {
            return Ok(false);
        }

        let mut ctx = self.descend_for_write(root, key, Operation::Remove)?;
        let removed = {
            let leaf_guard = ctx
                .pages
                .last_mut()
                .ok_or_else(|| anyhow!("B+ tree latch path is empty"))?;
            BTreeLeafPage::<_, K>::new(&mut leaf_guard[..]).remove(key)
        };
        if !removed {
            return Ok(false);
        }

        let mut deleted = Vec::new();
        self.coalesce_or_redistribute(&mut ctx, &mut deleted)?;
        drop(ctx);

        for page_id in deleted {
            if !self.buffer_pool.delete_page(page_id)? {
                debug!("{}: page {} still pinned, not deleted", self.index_name, page_id);
            }
        }
        Ok(true)
    }

    /// Iterates over every entry in key order.
    pub fn iter(&self) -> Result<BPlusTreeIterator<K>> {
        let leaf = self.find_leaf_read(None)?;
        Ok(BPlusTreeIterator::new(self.buffer_pool.clone(), leaf, None))
    }

    /// Iterates in key order starting at the first key `>= key`.
    pub fn iter_from(&self, key: &K) -> Result<BPlusTreeIterator<K>> {
        let leaf = self.find_leaf_read(Some(key))?;
        Ok(BPlusTreeIterator::new(self.buffer_pool.clone(), leaf, Some(key)))
    }

    /// Walks the whole tree and checks ordering, occupancy, parent links and
    /// uniform leaf depth.
    pub fn check_integrity(&self) -> Result<()> {
        let root = self.root_page_id.read();
        if !root.is_valid() {
            return Ok(());
        }
        let mut leaf_depth = None;
        self.check_subtree(*root, PageId::INVALID, None, None, 0, &mut leaf_depth)
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        parent: PageId,
        lower: Option<K>,
        upper: Option<K>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<()> {
        let guard = self.buffer_pool.fetch_page_read(page_id)?;
        let page = BTreePage::<_, K>::from_data(&guard[..])?;
        if page.parent_page_id() != parent {
            bail!(
                "Page {} has parent {}, expected {}",
                page_id,
                page.parent_page_id(),
                parent
            );
        }

        let size = page.size();
        let min = if !parent.is_valid() {
            if page.is_leaf() { 1 } else { 2 }
        } else {
            page.min_size()
        };
        if size < min || size > page.max_size() {
            bail!(
                "Page {} has size {} outside [{}, {}]",
                page_id,
                size,
                min,
                page.max_size()
            );
        }

        let in_range = |k: K| lower.map_or(true, |lo| k >= lo) && upper.map_or(true, |hi| k < hi);

        let children = match page {
            BTreePage::Leaf(leaf) => {
                let keys: Vec<K> = leaf.entries().into_iter().map(|(k, _)| k).collect();
                if keys.windows(2).any(|w| w[0] >= w[1]) {
                    bail!("Leaf {} keys are not strictly increasing", page_id);
                }
                if !keys.iter().all(|&k| in_range(k)) {
                    bail!("Leaf {} holds a key outside its parent range", page_id);
                }
                match *leaf_depth {
                    None => *leaf_depth = Some(depth),
                    Some(d) if d != depth => {
                        bail!("Leaf {} at depth {}, expected {}", page_id, depth, d)
                    }
                    Some(_) => {}
                }
                return Ok(());
            }
            BTreePage::Internal(internal) => {
                let separators: Vec<K> = (1..size).map(|i| internal.key_at(i)).collect();
                if separators.windows(2).any(|w| w[0] >= w[1]) {
                    bail!("Internal page {} separators are not increasing", page_id);
                }
                if !separators.iter().all(|&k| in_range(k)) {
                    bail!("Internal page {} holds a separator outside its range", page_id);
                }
                (0..size)
                    .map(|i| {
                        let lo = if i == 0 { lower } else { Some(internal.key_at(i)) };
                        let hi = if i + 1 < size { Some(internal.key_at(i + 1)) } else { upper };
                        (internal.value_at(i), lo, hi)
                    })
                    .collect::<Vec<_>>()
            }
        };
        drop(guard);

        for (child, lo, hi) in children {
            self.check_subtree(child, page_id, lo, hi, depth + 1, leaf_depth)?;
        }
        Ok(())
    }

    /// Descends with read latches to the leaf that would hold `key`, or to the
    /// leftmost leaf when `key` is None.
    fn find_leaf_read(&self, key: Option<&K>) -> Result<Option<PageReadGuard>> {
        let root = self.root_page_id.read();
        if !root.is_valid() {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(*root)?;
        drop(root);

        loop {
            let child = match BTreePage::<_, K>::from_data(&guard[..])? {
                BTreePage::Leaf(_) => None,
                BTreePage::Internal(page) => Some(match key {
                    Some(key) => page.lookup(key),
                    None => page.value_at(0),
                }),
            };
            match child {
                // The child is latched before the parent guard is released
                Some(child) => guard = self.buffer_pool.fetch_page_read(child)?,
                None => return Ok(Some(guard)),
            }
        }
    }

    fn descend_for_write<'a>(
        &'a self,
        root: RwLockWriteGuard<'a, PageId>,
        key: &K,
        operation: Operation,
    ) -> Result<WriteContext<'a>> {
        let mut page_id = *root;
        let mut ctx = WriteContext {
            root: Some(root),
            pages: Vec::new(),
        };

        loop {
            let guard = self.buffer_pool.fetch_page_write(page_id)?;
            let (safe, child) = {
                let page = BTreePage::<_, K>::from_data(&guard[..])?;
                let safe = match operation {
                    Operation::Insert => page.is_insert_safe(),
                    Operation::Remove => page.is_remove_safe(),
                };
                let child = match &page {
                    BTreePage::Internal(internal) => Some(internal.lookup(key)),
                    BTreePage::Leaf(_) => None,
                };
                (safe, child)
            };

            if safe {
                ctx.release_ancestors();
            }
            ctx.pages.push(guard);

            match child {
                Some(child) => page_id = child,
                None => return Ok(ctx),
            }
        }
    }

    fn start_new_tree(&self, root: &mut PageId, key: &K, rid: Rid) -> Result<()> {
        let (page_id, mut guard) = self.buffer_pool.new_page()?;
        let mut leaf = BTreeLeafPage::<_, K>::new(&mut guard[..]);
        leaf.init(page_id, PageId::INVALID, self.leaf_max_size);
        leaf.insert(key, rid);
        drop(guard);

        *root = page_id;
        self.update_root_record(page_id)?;
        debug!("{}: new tree rooted at {}", self.index_name, page_id);
        Ok(())
    }

    fn set_root(&self, ctx: &mut WriteContext, page_id: PageId) -> Result<()> {
        let root = ctx
            .root
            .as_mut()
            .ok_or_else(|| anyhow!("Root change without holding the root latch"))?;
        **root = page_id;
        self.update_root_record(page_id)?;
        debug!("{}: root is now {}", self.index_name, page_id);
        Ok(())
    }

    fn update_root_record(&self, page_id: PageId) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
        let mut header = HeaderPage::new(&mut guard[..]);
        if !header.update_record(&self.index_name, page_id)
            && !header.insert_record(&self.index_name, page_id)
        {
            bail!("Header page has no room for index {}", self.index_name);
        }
        Ok(())
    }

    fn set_parent(&self, child: PageId, parent: PageId) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(child)?;
        btree_page::set_parent_page_id(&mut guard[..], parent);
        Ok(())
    }

    /// Links the freshly split `right` page next to `left`, splitting
    /// ancestors for as long as they overflow.
    fn insert_into_parent(
        &self,
        ctx: &mut WriteContext,
        spare: &mut Vec<(PageId, PageWriteGuard)>,
        mut left: PageWriteGuard,
        mut key: K,
        mut right: PageWriteGuard,
    ) -> Result<()> {
        loop {
            let parent_id = btree_page::parent_page_id(&left[..]);
            if !parent_id.is_valid() {
                let (root_id, mut root_guard) = Self::take_spare(spare)?;
                let mut root = BTreeInternalPage::<_, K>::new(&mut root_guard[..]);
                root.init(root_id, PageId::INVALID, self.internal_max_size);
                root.populate_new_root(left.page_id(), &key, right.page_id());
                btree_page::set_parent_page_id(&mut left[..], root_id);
                btree_page::set_parent_page_id(&mut right[..], root_id);
                return self.set_root(ctx, root_id);
            }

            let mut parent_guard = ctx.pop()?;
            if parent_guard.page_id() != parent_id {
                bail!(
                    "Expected parent {} on the latch path, found {}",
                    parent_id,
                    parent_guard.page_id()
                );
            }

            let mut parent = BTreeInternalPage::<_, K>::new(&mut parent_guard[..]);
            if parent
                .insert_node_after(left.page_id(), &key, right.page_id())
                .is_none()
            {
                bail!("Page {} is not a child of {}", left.page_id(), parent_id);
            }
            if parent.size() <= parent.max_size() {
                return Ok(());
            }

            let (sibling_id, mut sibling_guard) = Self::take_spare(spare)?;
            let mut sibling = BTreeInternalPage::<_, K>::new(&mut sibling_guard[..]);
            sibling.init(sibling_id, parent.parent_page_id(), self.internal_max_size);
            let moved = parent.move_half_to(&mut sibling);
            let up_key = sibling.key_at(0);
            debug!(
                "{}: split internal page {} into {}",
                self.index_name, parent_id, sibling_id
            );

            for child in moved {
                if child == left.page_id() {
                    btree_page::set_parent_page_id(&mut left[..], sibling_id);
                } else if child == right.page_id() {
                    btree_page::set_parent_page_id(&mut right[..], sibling_id);
                } else {
                    self.set_parent(child, sibling_id)?;
                }
            }

            left = parent_guard;
            right = sibling_guard;
            key = up_key;
        }
    }

    /// Fixes underflow after a leaf removal, climbing one level per merge.
    /// Pages emptied by merges are collected in `deleted`.
    fn coalesce_or_redistribute(&self, ctx: &mut WriteContext, deleted: &mut Vec<PageId>) -> Result<()> {
        loop {
            let node = ctx.pop()?;
            let (is_root, size, min_size) = {
                let page = BTreePage::<_, K>::from_data(&node[..])?;
                (page.is_root(), page.size(), page.min_size())
            };
            if is_root {
                return self.adjust_root(ctx, node, deleted);
            }
            if size >= min_size {
                return Ok(());
            }

            let mut parent_guard = ctx.pop()?;
            let (index, sibling_id) = {
                let parent = BTreeInternalPage::<_, K>::new(&parent_guard[..]);
                let index = parent
                    .value_index(node.page_id())
                    .ok_or_else(|| anyhow!("Page {} is not a child of {}", node.page_id(), parent.page_id()))?;
                let sibling_index = if index == 0 { 1 } else { index - 1 };
                (index, parent.value_at(sibling_index))
            };
            let sibling = self.buffer_pool.fetch_page_write(sibling_id)?;

            // The sibling is to the left unless the node is the first child
            let (left, right, separator_index) = if index == 0 {
                (node, sibling, 1)
            } else {
                (sibling, node, index)
            };
            let node_is_left = index == 0;

            let sibling_size = btree_page::size(if node_is_left { &right[..] } else { &left[..] });
            if sibling_size > min_size {
                return self.redistribute(&mut parent_guard, left, right, separator_index, node_is_left);
            }

            self.merge(&mut parent_guard, left, right, separator_index, deleted)?;
            ctx.pages.push(parent_guard);
        }
    }

    /// Moves one entry from the richer sibling into the underflowing node and
    /// fixes the separator in the parent.
    fn redistribute(
        &self,
        parent_guard: &mut PageWriteGuard,
        mut left: PageWriteGuard,
        mut right: PageWriteGuard,
        separator_index: usize,
        node_is_left: bool,
    ) -> Result<()> {
        let mut parent = BTreeInternalPage::<_, K>::new(&mut parent_guard[..]);
        let left_id = left.page_id();
        let right_id = right.page_id();

        if btree_page::page_type(&left[..]) == Some(btree_page::BTreePageType::Leaf) {
            let mut left_page = BTreeLeafPage::<_, K>::new(&mut left[..]);
            let mut right_page = BTreeLeafPage::<_, K>::new(&mut right[..]);
            let separator = if node_is_left {
                right_page.move_first_to_end_of(&mut left_page)
            } else {
                left_page.move_last_to_front_of(&mut right_page)
            };
            parent.set_key_at(separator_index, &separator);
            return Ok(());
        }

        let middle_key = parent.key_at(separator_index);
        let mut left_page = BTreeInternalPage::<_, K>::new(&mut left[..]);
        let mut right_page = BTreeInternalPage::<_, K>::new(&mut right[..]);
        let (child, separator, new_parent) = if node_is_left {
            let (child, separator) = right_page.move_first_to_end_of(&mut left_page, &middle_key);
            (child, separator, left_id)
        } else {
            let (child, separator) = left_page.move_last_to_front_of(&mut right_page, &middle_key);
            (child, separator, right_id)
        };
        parent.set_key_at(separator_index, &separator);
        drop(left);
        drop(right);
        self.set_parent(child, new_parent)
    }

    /// Folds `right` into `left` and drops their separator from the parent.
    fn merge(
        &self,
        parent_guard: &mut PageWriteGuard,
        mut left: PageWriteGuard,
        mut right: PageWriteGuard,
        separator_index: usize,
        deleted: &mut Vec<PageId>,
    ) -> Result<()> {
        let mut parent = BTreeInternalPage::<_, K>::new(&mut parent_guard[..]);
        let left_id = left.page_id();
        let right_id = right.page_id();

        let moved = if btree_page::page_type(&left[..]) == Some(btree_page::BTreePageType::Leaf) {
            let mut left_page = BTreeLeafPage::<_, K>::new(&mut left[..]);
            BTreeLeafPage::<_, K>::new(&mut right[..]).move_all_to(&mut left_page);
            Vec::new()
        } else {
            let middle_key = parent.key_at(separator_index);
            let mut left_page = BTreeInternalPage::<_, K>::new(&mut left[..]);
            BTreeInternalPage::<_, K>::new(&mut right[..]).move_all_to(&mut left_page, &middle_key)
        };
        parent.remove(separator_index);
        debug!("{}: merged page {} into {}", self.index_name, right_id, left_id);

        drop(left);
        drop(right);
        for child in moved {
            self.set_parent(child, left_id)?;
        }
        deleted.push(right_id);
        Ok(())
    }

    /// Collapses the root after a removal: an empty root leaf empties the
    /// tree, and an internal root with one child hands the root to it.
    fn adjust_root(&self, ctx: &mut WriteContext, mut root_guard: PageWriteGuard, deleted: &mut Vec<PageId>) -> Result<()> {
        let root_id = root_guard.page_id();
        let new_root = match BTreePage::<_, K>::from_data(&mut root_guard[..])? {
            BTreePage::Leaf(leaf) if leaf.size() == 0 => PageId::INVALID,
            BTreePage::Internal(mut internal) if internal.size() == 1 => {
                internal.remove_and_return_only_child()
            }
            _ => return Ok(()),
        };
        drop(root_guard);

        if new_root.is_valid() {
            self.set_parent(new_root, PageId::INVALID)?;
        }
        self.set_root(ctx, new_root)?;
        deleted.push(root_id);
        Ok(())
    }
}
