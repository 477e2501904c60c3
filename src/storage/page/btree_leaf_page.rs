//! B+ tree leaf page.
//!
//! ```text
//! | common B+ tree header (24) | next_page_id (4) | key 0 | rid 0 | key 1 | rid 1 | ...
//! ```
//!
//! Entries are kept sorted by key. A page holds up to `max_size` entries at
//! rest and one more transiently, between an insert and the split it causes.

use crate::access::btree::IndexKey;
use crate::access::Rid;
use crate::storage::page::btree_page::{self, BTreePageType, BTREE_HEADER_SIZE};
use crate::storage::page::{Page, PageId};
use crate::storage::PAGE_SIZE;
use byteorder::{ByteOrder, LittleEndian};
use std::marker::PhantomData;

const NEXT_PAGE_ID_OFFSET: usize = BTREE_HEADER_SIZE;
const ENTRIES_OFFSET: usize = NEXT_PAGE_ID_OFFSET + 4;

pub struct BTreeLeafPage<T, K> {
    data: T,
    _key: PhantomData<K>,
}

impl<T, K: IndexKey> BTreeLeafPage<T, K> {
    const ENTRY_SIZE: usize = K::SIZE + Rid::SIZE;

    /// Largest `max_size` a leaf can be configured with.
    pub fn max_capacity() -> usize {
        (PAGE_SIZE - ENTRIES_OFFSET) / Self::ENTRY_SIZE - 1
    }

    fn entry_offset(index: usize) -> usize {
        ENTRIES_OFFSET + index * Self::ENTRY_SIZE
    }
}

impl<T: AsRef<[u8]>, K: IndexKey> BTreeLeafPage<T, K> {
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

    pub fn next_page_id(&self) -> PageId {
        PageId(LittleEndian::read_u32(
            &self.data.as_ref()[NEXT_PAGE_ID_OFFSET..],
        ))
    }

    pub fn key_at(&self, index: usize) -> K {
        K::decode(&self.data.as_ref()[Self::entry_offset(index)..])
    }

    pub fn value_at(&self, index: usize) -> Rid {
        Rid::from_bytes(&self.data.as_ref()[Self::entry_offset(index) + K::SIZE..])
    }

    /// Index of the first entry whose key is `>= key`.
    pub fn key_index(&self, key: &K) -> usize {
        let (mut lo, mut hi) = (0, self.size());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid) < *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub fn lookup(&self, key: &K) -> Option<Rid> {
        let index = self.key_index(key);
        (index < self.size() && self.key_at(index) == *key).then(|| self.value_at(index))
    }

    pub fn entries(&self) -> Vec<(K, Rid)> {
        (0..self.size())
            .map(|i| (self.key_at(i), self.value_at(i)))
            .collect()
    }

    /// Entries from `start` to the end of the page.
    pub fn entries_from(&self, start: usize) -> Vec<(K, Rid)> {
        (start..self.size())
            .map(|i| (self.key_at(i), self.value_at(i)))
            .collect()
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>, K: IndexKey> BTreeLeafPage<T, K> {
    pub fn init(&mut self, page_id: PageId, parent_page_id: PageId, max_size: usize) {
        btree_page::init_header(
            self.data.as_mut(),
            BTreePageType::Leaf,
            page_id,
            parent_page_id,
            max_size,
        );
        self.set_next_page_id(PageId::INVALID);
    }

    fn set_size(&mut self, size: usize) {
        btree_page::set_size(self.data.as_mut(), size);
    }

    pub fn set_parent_page_id(&mut self, parent: PageId) {
        btree_page::set_parent_page_id(self.data.as_mut(), parent);
    }

    pub fn set_next_page_id(&mut self, next: PageId) {
        LittleEndian::write_u32(&mut self.data.as_mut()[NEXT_PAGE_ID_OFFSET..], next.0);
    }

    fn write_entry(&mut self, index: usize, key: &K, rid: Rid) {
        let offset = Self::entry_offset(index);
        let data = self.data.as_mut();
        key.encode(&mut data[offset..offset + K::SIZE]);
        data[offset + K::SIZE..offset + Self::ENTRY_SIZE].copy_from_slice(&rid.to_bytes());
    }

    /// Inserts in sorted position. Returns false if the key already exists.
    pub fn insert(&mut self, key: &K, rid: Rid) -> bool {
        let size = self.size();
        let index = self.key_index(key);
        if index < size && self.key_at(index) == *key {
            return false;
        }

        let start = Self::entry_offset(index);
        let end = Self::entry_offset(size);
        self.data
            .as_mut()
            .copy_within(start..end, start + Self::ENTRY_SIZE);
        self.write_entry(index, key, rid);
        self.set_size(size + 1);
        true
    }

    fn remove_at(&mut self, index: usize) {
        let size = self.size();
        let start = Self::entry_offset(index + 1);
        let end = Self::entry_offset(size);
        self.data
            .as_mut()
            .copy_within(start..end, Self::entry_offset(index));
        self.set_size(size - 1);
    }

    /// Removes `key`. Returns false if it was not present.
    pub fn remove(&mut self, key: &K) -> bool {
        let index = self.key_index(key);
        if index >= self.size() || self.key_at(index) != *key {
            return false;
        }
        self.remove_at(index);
        true
    }

    /// Moves the upper half of the entries into the empty `recipient`, which
    /// becomes this page's right sibling in the leaf chain.
    pub fn move_half_to<U>(&mut self, recipient: &mut BTreeLeafPage<U, K>)
    where
        U: AsRef<[u8]> + AsMut<[u8]>,
    {
        let size = self.size();
        let keep = size.div_ceil(2);

        let start = Self::entry_offset(keep);
        let end = Self::entry_offset(size);
        let moved = size - keep;
        recipient.data.as_mut()[ENTRIES_OFFSET..ENTRIES_OFFSET + (end - start)]
            .copy_from_slice(&self.data.as_ref()[start..end]);
        recipient.set_size(moved);
        self.set_size(keep);

        recipient.set_next_page_id(self.next_page_id());
        self.set_next_page_id(recipient.page_id());
    }

    /// Appends every entry to the left sibling `recipient` and unlinks this
    /// page from the leaf chain.
    pub fn move_all_to<U>(&mut self, recipient: &mut BTreeLeafPage<U, K>)
    where
        U: AsRef<[u8]> + AsMut<[u8]>,
    {
        let size = self.size();
        let base = recipient.size();
        let dst = Self::entry_offset(base);
        let len = Self::entry_offset(size) - ENTRIES_OFFSET;
        recipient.data.as_mut()[dst..dst + len]
            .copy_from_slice(&self.data.as_ref()[ENTRIES_OFFSET..ENTRIES_OFFSET + len]);
        recipient.set_size(base + size);
        recipient.set_next_page_id(self.next_page_id());
        self.set_size(0);
    }

    /// Moves this page's first entry to the end of its left sibling. Returns
    /// the new first key, which becomes the parent's separator.
    pub fn move_first_to_end_of<U>(&mut self, recipient: &mut BTreeLeafPage<U, K>) -> K
    where
        U: AsRef<[u8]> + AsMut<[u8]>,
    {
        let (key, rid) = (self.key_at(0), self.value_at(0));
        self.remove_at(0);
        let base = recipient.size();
        recipient.write_entry(base, &key, rid);
        recipient.set_size(base + 1);
        self.key_at(0)
    }

    /// Moves this page's last entry to the front of its right sibling. Returns
    /// the moved key, which becomes the parent's separator.
    pub fn move_last_to_front_of<U>(&mut self, recipient: &mut BTreeLeafPage<U, K>) -> K
    where
        U: AsRef<[u8]> + AsMut<[u8]>,
    {
        let last = self.size() - 1;
        let (key, rid) = (self.key_at(last), self.value_at(last));
        self.set_size(last);
        recipient.insert(&key, rid);
        key
    }
}

impl<T: AsRef<[u8]>, K: IndexKey> Page for BTreeLeafPage<T, K> {
    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }
}
