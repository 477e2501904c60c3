//! Slotted table page.
//!
//! ```text
//! | page_id (4) | lsn (4) | prev_page_id (4) | next_page_id (4) |
//! | free_space_ptr (4) | tuple_count (4) | slot 0: offset (4), size (4) | ...
//! |                 ... free space ...                 | tuples (grow down) |
//! ```
//!
//! A slot with size 0 was emptied by a physical delete. A negative size marks
//! a tuple that is delete-marked but still physically present.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{set_page_id, Page, PageId};
use crate::storage::PAGE_SIZE;
use byteorder::{ByteOrder, LittleEndian};

const PREV_PAGE_ID_OFFSET: usize = 8;
const NEXT_PAGE_ID_OFFSET: usize = 12;
const FREE_SPACE_POINTER_OFFSET: usize = 16;
const TUPLE_COUNT_OFFSET: usize = 20;
pub const TABLE_PAGE_HEADER_SIZE: usize = 24;
pub const SLOT_SIZE: usize = 8;

/// Largest tuple that fits into an empty table page.
pub const MAX_TUPLE_SIZE: usize = PAGE_SIZE - TABLE_PAGE_HEADER_SIZE - SLOT_SIZE;

pub struct TablePage<T> {
    data: T,
}

impl<T: AsRef<[u8]>> TablePage<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.data.as_ref()[offset..])
    }

    fn read_i32(&self, offset: usize) -> i32 {
        LittleEndian::read_i32(&self.data.as_ref()[offset..])
    }

    pub fn prev_page_id(&self) -> PageId {
        PageId(self.read_u32(PREV_PAGE_ID_OFFSET))
    }

    pub fn next_page_id(&self) -> PageId {
        PageId(self.read_u32(NEXT_PAGE_ID_OFFSET))
    }

    pub fn free_space_pointer(&self) -> usize {
        self.read_u32(FREE_SPACE_POINTER_OFFSET) as usize
    }

    pub fn tuple_count(&self) -> u32 {
        self.read_u32(TUPLE_COUNT_OFFSET)
    }

    /// Bytes between the end of the slot array and the lowest tuple.
    pub fn free_space(&self) -> usize {
        let slots_end = TABLE_PAGE_HEADER_SIZE + self.tuple_count() as usize * SLOT_SIZE;
        self.free_space_pointer().saturating_sub(slots_end)
    }

    fn slot_offset(slot: u32) -> usize {
        TABLE_PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE
    }

    fn tuple_offset(&self, slot: u32) -> usize {
        self.read_u32(Self::slot_offset(slot)) as usize
    }

    /// Raw stored size: positive for live tuples, negative for delete-marked
    /// ones, 0 for free slots.
    pub fn tuple_size(&self, slot: u32) -> i32 {
        self.read_i32(Self::slot_offset(slot) + 4)
    }

    fn check_slot(&self, slot: u32) -> StorageResult<()> {
        let count = self.tuple_count();
        if slot >= count {
            return Err(StorageError::InvalidSlot { slot, count });
        }
        Ok(())
    }

    pub fn is_deleted(&self, slot: u32) -> bool {
        slot < self.tuple_count() && self.tuple_size(slot) < 0
    }

    /// Returns a live tuple.
    pub fn get_tuple(&self, slot: u32) -> StorageResult<&[u8]> {
        self.check_slot(slot)?;
        let size = self.tuple_size(slot);
        if size <= 0 {
            return Err(StorageError::InvalidSlot {
                slot,
                count: self.tuple_count(),
            });
        }

        let offset = self.tuple_offset(slot);
        Ok(&self.data.as_ref()[offset..offset + size as usize])
    }

    /// Returns the bytes of a live or delete-marked tuple.
    pub fn get_tuple_any(&self, slot: u32) -> StorageResult<&[u8]> {
        self.check_slot(slot)?;
        let size = self.tuple_size(slot).unsigned_abs() as usize;
        let offset = self.tuple_offset(slot);
        Ok(&self.data.as_ref()[offset..offset + size])
    }

    pub fn first_tuple_slot(&self) -> Option<u32> {
        (0..self.tuple_count()).find(|&slot| self.tuple_size(slot) > 0)
    }

    pub fn next_tuple_slot(&self, slot: u32) -> Option<u32> {
        (slot + 1..self.tuple_count()).find(|&s| self.tuple_size(s) > 0)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> TablePage<T> {
    /// Formats an empty page linked after `prev_page_id`.
    pub fn init(&mut self, page_id: PageId, prev_page_id: PageId) {
        set_page_id(self.data.as_mut(), page_id);
        self.set_prev_page_id(prev_page_id);
        self.set_next_page_id(PageId::INVALID);
        self.set_free_space_pointer(PAGE_SIZE);
        self.set_tuple_count(0);
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        LittleEndian::write_u32(&mut self.data.as_mut()[offset..], value);
    }

    pub fn set_prev_page_id(&mut self, page_id: PageId) {
        self.write_u32(PREV_PAGE_ID_OFFSET, page_id.0);
    }

    pub fn set_next_page_id(&mut self, page_id: PageId) {
        self.write_u32(NEXT_PAGE_ID_OFFSET, page_id.0);
    }

    fn set_free_space_pointer(&mut self, pointer: usize) {
        self.write_u32(FREE_SPACE_POINTER_OFFSET, pointer as u32);
    }

    fn set_tuple_count(&mut self, count: u32) {
        self.write_u32(TUPLE_COUNT_OFFSET, count);
    }

    fn set_tuple_offset(&mut self, slot: u32, offset: usize) {
        self.write_u32(Self::slot_offset(slot), offset as u32);
    }

    fn set_tuple_size(&mut self, slot: u32, size: i32) {
        LittleEndian::write_i32(&mut self.data.as_mut()[Self::slot_offset(slot) + 4..], size);
    }

    /// Appends `tuple` in a new slot and returns the slot number.
    ///
    /// Slots freed by [`TablePage::apply_delete`] are not handed out again:
    /// a rid names one tuple for the life of the page, and an undone physical
    /// delete can always return to its slot.
    pub fn insert_tuple(&mut self, tuple: &[u8]) -> StorageResult<u32> {
        debug_assert!(!tuple.is_empty());
        let slot = self.tuple_count();
        self.insert_tuple_at(slot, tuple)?;
        Ok(slot)
    }

    /// Places `tuple` into a specific slot, which must be free or the next
    /// one to be appended. Used to replay inserts and undo physical deletes.
    pub fn insert_tuple_at(&mut self, slot: u32, tuple: &[u8]) -> StorageResult<()> {
        let count = self.tuple_count();
        if slot > count || (slot < count && self.tuple_size(slot) != 0) {
            return Err(StorageError::InvalidSlot { slot, count });
        }

        let required = if slot == count {
            tuple.len() + SLOT_SIZE
        } else {
            tuple.len()
        };
        let available = self.free_space();
        if available < required {
            return Err(StorageError::PageFull {
                required,
                available,
            });
        }

        let offset = self.free_space_pointer() - tuple.len();
        self.data.as_mut()[offset..offset + tuple.len()].copy_from_slice(tuple);
        self.set_free_space_pointer(offset);
        if slot == count {
            self.set_tuple_count(count + 1);
        }
        self.set_tuple_offset(slot, offset);
        self.set_tuple_size(slot, tuple.len() as i32);

        Ok(())
    }

    /// Flags a live tuple as deleted without moving it.
    pub fn mark_delete(&mut self, slot: u32) -> StorageResult<()> {
        self.check_slot(slot)?;
        let size = self.tuple_size(slot);
        if size <= 0 {
            return Err(StorageError::InvalidSlot {
                slot,
                count: self.tuple_count(),
            });
        }
        self.set_tuple_size(slot, -size);
        Ok(())
    }

    /// Clears the delete mark set by [`TablePage::mark_delete`].
    pub fn rollback_delete(&mut self, slot: u32) -> StorageResult<()> {
        self.check_slot(slot)?;
        let size = self.tuple_size(slot);
        if size < 0 {
            self.set_tuple_size(slot, -size);
        }
        Ok(())
    }

    /// Physically removes a tuple (live or delete-marked), compacting the
    /// tuple area. The slot becomes free. Returns the removed bytes.
    pub fn apply_delete(&mut self, slot: u32) -> StorageResult<Vec<u8>> {
        self.check_slot(slot)?;
        let size = self.tuple_size(slot).unsigned_abs() as usize;
        let offset = self.tuple_offset(slot);
        if size == 0 {
            return Err(StorageError::InvalidSlot {
                slot,
                count: self.tuple_count(),
            });
        }

        let removed = self.data.as_ref()[offset..offset + size].to_vec();
        let free_ptr = self.free_space_pointer();
        self.data
            .as_mut()
            .copy_within(free_ptr..offset, free_ptr + size);
        self.set_free_space_pointer(free_ptr + size);
        self.set_tuple_offset(slot, 0);
        self.set_tuple_size(slot, 0);

        for s in 0..self.tuple_count() {
            let o = self.tuple_offset(s);
            if self.tuple_size(s) != 0 && o < offset {
                self.set_tuple_offset(s, o + size);
            }
        }

        Ok(removed)
    }

    /// Replaces a live tuple in place, shifting the tuples stored below it.
    /// Returns the old bytes.
    pub fn update_tuple(&mut self, slot: u32, tuple: &[u8]) -> StorageResult<Vec<u8>> {
        self.check_slot(slot)?;
        let old_size = self.tuple_size(slot);
        if old_size <= 0 {
            return Err(StorageError::InvalidSlot {
                slot,
                count: self.tuple_count(),
            });
        }
        let old_size = old_size as usize;
        let new_size = tuple.len();

        let available = self.free_space();
        if new_size > old_size && available < new_size - old_size {
            return Err(StorageError::PageFull {
                required: new_size - old_size,
                available,
            });
        }

        let offset = self.tuple_offset(slot);
        let old = self.data.as_ref()[offset..offset + old_size].to_vec();

        // Everything between the free space pointer and this tuple moves by
        // the size difference; the new image ends where the old one did.
        let free_ptr = self.free_space_pointer();
        let new_free_ptr = free_ptr + old_size - new_size;
        self.data
            .as_mut()
            .copy_within(free_ptr..offset, new_free_ptr);
        self.set_free_space_pointer(new_free_ptr);

        let new_offset = offset + old_size - new_size;
        self.data.as_mut()[new_offset..new_offset + new_size].copy_from_slice(tuple);
        self.set_tuple_size(slot, new_size as i32);

        for s in 0..self.tuple_count() {
            let o = self.tuple_offset(s);
            if self.tuple_size(s) != 0 && o <= offset {
                self.set_tuple_offset(s, o + old_size - new_size);
            }
        }

        Ok(old)
    }
}

impl<T: AsRef<[u8]>> Page for TablePage<T> {
    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::set_page_lsn;
    use crate::storage::wal::Lsn;

    fn new_page(data: &mut [u8]) -> TablePage<&mut [u8]> {
        let mut page = TablePage::new(data);
        page.init(PageId(3), PageId(2));
        page
    }

    #[test]
    fn test_initialization() {
        let mut data = vec![0u8; PAGE_SIZE];
        set_page_lsn(&mut data, Lsn(9));
        let page = new_page(&mut data);

        assert_eq!(page.page_id(), PageId(3));
        assert_eq!(page.lsn(), Lsn(9));
        assert_eq!(page.prev_page_id(), PageId(2));
        assert_eq!(page.next_page_id(), PageId::INVALID);
        assert_eq!(page.tuple_count(), 0);
        assert_eq!(page.free_space_pointer(), PAGE_SIZE);
        assert_eq!(page.free_space(), PAGE_SIZE - TABLE_PAGE_HEADER_SIZE);
        assert_eq!(page.first_tuple_slot(), None);
    }

    #[test]
    fn test_insert_and_get() -> StorageResult<()> {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = new_page(&mut data);

        assert_eq!(page.insert_tuple(b"Hello, World!")?, 0);
        assert_eq!(page.insert_tuple(b"Second tuple")?, 1);

        assert_eq!(page.get_tuple(0)?, b"Hello, World!");
        assert_eq!(page.get_tuple(1)?, b"Second tuple");
        assert_eq!(page.tuple_count(), 2);
        assert_eq!(page.free_space_pointer(), PAGE_SIZE - 13 - 12);

        // Tuples grow backward from the end of the page
        assert_eq!(&data[PAGE_SIZE - 13..], b"Hello, World!");

        Ok(())
    }

    #[test]
    fn test_mark_and_rollback_delete() -> StorageResult<()> {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = new_page(&mut data);
        page.insert_tuple(b"tuple")?;

        page.mark_delete(0)?;
        assert_eq!(page.tuple_size(0), -5);
        assert!(page.is_deleted(0));
        assert!(page.get_tuple(0).is_err());
        assert_eq!(page.get_tuple_any(0)?, b"tuple");
        assert!(page.mark_delete(0).is_err());

        page.rollback_delete(0)?;
        assert_eq!(page.get_tuple(0)?, b"tuple");

        Ok(())
    }

    #[test]
    fn test_apply_delete_compacts() -> StorageResult<()> {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = new_page(&mut data);
        page.insert_tuple(b"aaaa")?;
        page.insert_tuple(b"bbbbbb")?;
        page.insert_tuple(b"cc")?;
        let free_before = page.free_space();

        page.mark_delete(1)?;
        assert_eq!(page.apply_delete(1)?, b"bbbbbb");
        assert_eq!(page.tuple_size(1), 0);
        assert_eq!(page.free_space(), free_before + 6);

        assert_eq!(page.get_tuple(0)?, b"aaaa");
        assert_eq!(page.get_tuple(2)?, b"cc");
        assert_eq!(page.first_tuple_slot(), Some(0));
        assert_eq!(page.next_tuple_slot(0), Some(2));
        assert_eq!(page.next_tuple_slot(2), None);

        // Freed slots stay empty; inserts append
        assert_eq!(page.insert_tuple(b"dd")?, 3);
        assert_eq!(page.get_tuple(3)?, b"dd");
        assert_eq!(page.tuple_count(), 4);
        assert!(page.get_tuple(1).is_err());

        Ok(())
    }

    #[test]
    fn test_insert_tuple_at() -> StorageResult<()> {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = new_page(&mut data);
        page.insert_tuple(b"first")?;
        page.insert_tuple(b"second")?;

        let removed = page.apply_delete(0)?;
        page.insert_tuple_at(0, &removed)?;
        assert_eq!(page.get_tuple(0)?, b"first");

        // Occupied slots and gaps past the end are rejected
        assert!(page.insert_tuple_at(1, b"x").is_err());
        assert!(page.insert_tuple_at(5, b"x").is_err());

        page.insert_tuple_at(2, b"third")?;
        assert_eq!(page.tuple_count(), 3);

        Ok(())
    }

    #[test]
    fn test_update_grow_and_shrink() -> StorageResult<()> {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = new_page(&mut data);
        page.insert_tuple(b"aaaa")?;
        page.insert_tuple(b"bbbb")?;
        page.insert_tuple(b"cccc")?;

        assert_eq!(page.update_tuple(1, b"BBBBBBBBBB")?, b"bbbb");
        assert_eq!(page.get_tuple(0)?, b"aaaa");
        assert_eq!(page.get_tuple(1)?, b"BBBBBBBBBB");
        assert_eq!(page.get_tuple(2)?, b"cccc");

        assert_eq!(page.update_tuple(0, b"A")?, b"aaaa");
        assert_eq!(page.get_tuple(0)?, b"A");
        assert_eq!(page.get_tuple(1)?, b"BBBBBBBBBB");
        assert_eq!(page.get_tuple(2)?, b"cccc");
        assert_eq!(page.free_space_pointer(), PAGE_SIZE - 1 - 10 - 4);

        Ok(())
    }

    #[test]
    fn test_page_full() -> StorageResult<()> {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = new_page(&mut data);

        let large_tuple = vec![0xAA; 1000];
        let mut count = 0;
        while page.free_space() >= large_tuple.len() + SLOT_SIZE {
            page.insert_tuple(&large_tuple)?;
            count += 1;
        }
        assert_eq!(count, 4);

        assert!(matches!(
            page.insert_tuple(&large_tuple),
            Err(StorageError::PageFull { .. })
        ));
        assert!(matches!(
            page.update_tuple(0, &vec![0xBB; 1100]),
            Err(StorageError::PageFull { .. })
        ));

        Ok(())
    }

    #[test]
    fn test_invalid_slot() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = new_page(&mut data);

        assert!(matches!(
            page.get_tuple(0),
            Err(StorageError::InvalidSlot { slot: 0, count: 0 })
        ));
        assert!(page.mark_delete(3).is_err());
        assert!(page.apply_delete(0).is_err());
    }

    #[test]
    fn test_max_tuple_fits() -> StorageResult<()> {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = new_page(&mut data);
        page.insert_tuple(&vec![1u8; MAX_TUPLE_SIZE])?;
        assert_eq!(page.free_space(), 0);
        Ok(())
    }
}
