//! B+ tree internal page.
//!
//! ```text
//! | common B+ tree header (24) | key 0 | child 0 | key 1 | child 1 | ...
//! ```
//!
//! `size` counts children. Key 0 is unused: child `i` covers keys in
//! `[key i, key i+1)`, with child 0 taking everything below key 1.

use crate::access::btree::IndexKey;
use crate::storage::page::btree_page::{self, BTreePageType, BTREE_HEADER_SIZE};
use crate::storage::page::{Page, PageId};
use crate::storage::PAGE_SIZE;
use byteorder::{ByteOrder, LittleEndian};
use std::marker::PhantomData;

const ENTRIES_OFFSET: usize = BTREE_HEADER_SIZE;

pub struct BTreeInternalPage<T, K> {
    data: T,
    _key: PhantomData<K>,
}

impl<T, K: IndexKey> BTreeInternalPage<T, K> {
    const ENTRY_SIZE: usize = K::SIZE + 4;

    /// Largest `max_size` an internal page can be configured with.
    pub fn max_capacity() -> usize {
        (PAGE_SIZE - ENTRIES_OFFSET) / Self::ENTRY_SIZE - 1
    }

    fn entry_offset(index: usize) -> usize {
        ENTRIES_OFFSET + index * Self::ENTRY_SIZE
    }
}

impl<T: AsRef<[u8]>, K: IndexKey> BTreeInternalPage<T, K> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            _key: PhantomData,
        }
    }

    pub fn size(&self) -> usize {
        btree_page::size(self.data.as_ref())
    }

    pub fn max_size(&self) -> usize {
        btree_page::max_size(self.data.as_ref())
    }

    pub fn min_size(&self) -> usize {
        btree_page::min_size(self.max_size())
    }

    pub fn parent_page_id(&self) -> PageId {
        btree_page::parent_page_id(self.data.as_ref())
    }

    pub fn key_at(&self, index: usize) -> K {
        K::decode(&self.data.as_ref()[Self::entry_offset(index)..])
    }

    pub fn value_at(&self, index: usize) -> PageId {
        PageId(LittleEndian::read_u32(
            &self.data.as_ref()[Self::entry_offset(index) + K::SIZE..],
        ))
    }

    pub fn value_index(&self, child: PageId) -> Option<usize> {
        (0..self.size()).find(|&i| self.value_at(i) == child)
    }

    /// Child whose range covers `key`: the one under the largest separator
    /// `<= key`, or child 0 when `key` is below every separator.
    pub fn lookup(&self, key: &K) -> PageId {
        let (mut lo, mut hi) = (1, self.size());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid) <= *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.value_at(lo - 1)
    }

    pub fn children(&self) -> Vec<PageId> {
        (0..self.size()).map(|i| self.value_at(i)).collect()
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>, K: IndexKey> BTreeInternalPage<T, K> {
    pub fn init(&mut self, page_id: PageId, parent_page_id: PageId, max_size: usize) {
        btree_page::init_header(
            self.data.as_mut(),
            BTreePageType::Internal,
            page_id,
            parent_page_id,
            max_size,
        );
    }

    fn set_size(&mut self, size: usize) {
        btree_page::set_size(self.data.as_mut(), size);
    }

    pub fn set_parent_page_id(&mut self, parent: PageId) {
        btree_page::set_parent_page_id(self.data.as_mut(), parent);
    }

    pub fn set_key_at(&mut self, index: usize, key: &K) {
        let offset = Self::entry_offset(index);
        key.encode(&mut self.data.as_mut()[offset..offset + K::SIZE]);
    }

    pub fn set_value_at(&mut self, index: usize, child: PageId) {
        let offset = Self::entry_offset(index) + K::SIZE;
        LittleEndian::write_u32(&mut self.data.as_mut()[offset..], child.0);
    }

    fn shift_right(&mut self, from: usize) {
        let size = self.size();
        let start = Self::entry_offset(from);
        let end = Self::entry_offset(size);
        self.data
            .as_mut()
            .copy_within(start..end, start + Self::ENTRY_SIZE);
        self.set_size(size + 1);
    }

    /// Turns an empty page into a root with two children.
    pub fn populate_new_root(&mut self, left: PageId, key: &K, right: PageId) {
        self.set_value_at(0, left);
        self.set_key_at(1, key);
        self.set_value_at(1, right);
        self.set_size(2);
    }

    /// Inserts `(key, new_child)` right after `old_child`. Returns the new
    /// size, or None if `old_child` is not a child of this page.
    pub fn insert_node_after(&mut self, old_child: PageId, key: &K, new_child: PageId) -> Option<usize> {
        let index = self.value_index(old_child)? + 1;
        self.shift_right(index);
        self.set_key_at(index, key);
        self.set_value_at(index, new_child);
        Some(self.size())
    }

    pub fn remove(&mut self, index: usize) {
        let size = self.size();
        let start = Self::entry_offset(index + 1);
        let end = Self::entry_offset(size);
        self.data
            .as_mut()
            .copy_within(start..end, Self::entry_offset(index));
        self.set_size(size - 1);
    }

    /// Empties a root that is left with a single child and returns that child.
    pub fn remove_and_return_only_child(&mut self) -> PageId {
        let child = self.value_at(0);
        self.set_size(0);
        child
    }

    fn append_from<U: AsRef<[u8]>>(&mut self, src: &BTreeInternalPage<U, K>, from: usize, to: usize) {
        let base = self.size();
        let dst = Self::entry_offset(base);
        let (start, end) = (Self::entry_offset(from), Self::entry_offset(to));
        self.data.as_mut()[dst..dst + (end - start)]
            .copy_from_slice(&src.data.as_ref()[start..end]);
        self.set_size(base + (to - from));
    }

    /// Moves the upper half of the children into the empty `recipient`. The
    /// recipient's key 0 holds the separator that must move up into the
    /// parent. Returns the moved children, whose parent pointer must change.
    pub fn move_half_to<U>(&mut self, recipient: &mut BTreeInternalPage<U, K>) -> Vec<PageId>
    where
        U: AsRef<[u8]> + AsMut<[u8]>,
    {
        let size = self.size();
        let keep = size.div_ceil(2);
        recipient.append_from(self, keep, size);
        self.set_size(keep);
        recipient.children()
    }

    /// Appends every child to the left sibling `recipient`. `middle_key` is
    /// the parent's separator between the two pages; it comes down to sit in
    /// front of this page's first child. Returns the moved children.
    pub fn move_all_to<U>(&mut self, recipient: &mut BTreeInternalPage<U, K>, middle_key: &K) -> Vec<PageId>
    where
        U: AsRef<[u8]> + AsMut<[u8]>,
    {
        self.set_key_at(0, middle_key);
        let moved = self.children();
        recipient.append_from(self, 0, self.size());
        self.set_size(0);
        moved
    }

    /// Moves the first child to the end of the left sibling `recipient`.
    /// Returns the moved child and the new parent separator.
    pub fn move_first_to_end_of<U>(&mut self, recipient: &mut BTreeInternalPage<U, K>, middle_key: &K) -> (PageId, K)
    where
        U: AsRef<[u8]> + AsMut<[u8]>,
    {
        let child = self.value_at(0);
        let new_separator = self.key_at(1);

        let base = recipient.size();
        recipient.set_size(base + 1);
        recipient.set_key_at(base, middle_key);
        recipient.set_value_at(base, child);

        self.remove(0);
        (child, new_separator)
    }

    /// Moves the last child to the front of the right sibling `recipient`.
    /// Returns the moved child and the new parent separator.
    pub fn move_last_to_front_of<U>(&mut self, recipient: &mut BTreeInternalPage<U, K>, middle_key: &K) -> (PageId, K)
    where
        U: AsRef<[u8]> + AsMut<[u8]>,
    {
        let last = self.size() - 1;
        let child = self.value_at(last);
        let new_separator = self.key_at(last);
        self.set_size(last);

        recipient.shift_right(0);
        recipient.set_key_at(1, middle_key);
        recipient.set_value_at(0, child);
        (child, new_separator)
    }
}

impl<T: AsRef<[u8]>, K: IndexKey> Page for BTreeInternalPage<T, K> {
    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }
}
