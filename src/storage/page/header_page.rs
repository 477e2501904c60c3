//! Header page: the directory of index roots stored in page 0.
//!
//! ```text
//! | page_id (4) | lsn (4) | record_count (4) | name (32) | root_id (4) | ... |
//! ```

use crate::storage::page::{Page, PageId, PAGE_HEADER_SIZE};
use crate::storage::PAGE_SIZE;
use byteorder::{ByteOrder, LittleEndian};

/// Page id the header page always lives at.
pub const HEADER_PAGE_ID: PageId = PageId(0);

const RECORD_COUNT_OFFSET: usize = PAGE_HEADER_SIZE;
const RECORDS_OFFSET: usize = RECORD_COUNT_OFFSET + 4;
pub const MAX_NAME_LEN: usize = 32;
const RECORD_SIZE: usize = MAX_NAME_LEN + 4;

/// Maximum number of named roots the header page can hold.
pub const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

pub struct HeaderPage<T> {
    data: T,
}

impl<T: AsRef<[u8]>> HeaderPage<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }

    pub fn record_count(&self) -> usize {
        LittleEndian::read_u32(&self.data.as_ref()[RECORD_COUNT_OFFSET..]) as usize
    }

    fn record_offset(index: usize) -> usize {
        RECORDS_OFFSET + index * RECORD_SIZE
    }

    fn name_at(&self, index: usize) -> &[u8] {
        let offset = Self::record_offset(index);
        let raw = &self.data.as_ref()[offset..offset + MAX_NAME_LEN];
        let len = raw.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
        &raw[..len]
    }

    fn find(&self, name: &str) -> Option<usize> {
        (0..self.record_count()).find(|&i| self.name_at(i) == name.as_bytes())
    }

    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        let index = self.find(name)?;
        let offset = Self::record_offset(index) + MAX_NAME_LEN;
        Some(PageId(LittleEndian::read_u32(&self.data.as_ref()[offset..])))
    }

    /// All `(name, root_id)` records in insertion order.
    pub fn records(&self) -> Vec<(String, PageId)> {
        (0..self.record_count())
            .map(|i| {
                let name = String::from_utf8_lossy(self.name_at(i)).into_owned();
                let offset = Self::record_offset(i) + MAX_NAME_LEN;
                let root = PageId(LittleEndian::read_u32(&self.data.as_ref()[offset..]));
                (name, root)
            })
            .collect()
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> HeaderPage<T> {
    pub fn init(&mut self) {
        LittleEndian::write_u32(&mut self.data.as_mut()[RECORD_COUNT_OFFSET..], 0);
    }

    fn write_root(&mut self, index: usize, root_id: PageId) {
        let offset = Self::record_offset(index) + MAX_NAME_LEN;
        LittleEndian::write_u32(&mut self.data.as_mut()[offset..], root_id.0);
    }

    /// Adds a record. Returns false if the name exists, is too long, or the
    /// page is full.
    pub fn insert_record(&mut self, name: &str, root_id: PageId) -> bool {
        let count = self.record_count();
        if name.is_empty()
            || name.len() > MAX_NAME_LEN
            || count >= MAX_RECORDS
            || self.find(name).is_some()
        {
            return false;
        }

        let offset = Self::record_offset(count);
        let slot = &mut self.data.as_mut()[offset..offset + MAX_NAME_LEN];
        slot.fill(0);
        slot[..name.len()].copy_from_slice(name.as_bytes());
        self.write_root(count, root_id);
        LittleEndian::write_u32(
            &mut self.data.as_mut()[RECORD_COUNT_OFFSET..],
            (count + 1) as u32,
        );
        true
    }

    /// Changes the root of an existing record. Returns false if absent.
    pub fn update_record(&mut self, name: &str, root_id: PageId) -> bool {
        match self.find(name) {
            Some(index) => {
                self.write_root(index, root_id);
                true
            }
            None => false,
        }
    }

    /// Removes a record, moving the last record into its place.
    pub fn delete_record(&mut self, name: &str) -> bool {
        let Some(index) = self.find(name) else {
            return false;
        };

        let last = self.record_count() - 1;
        if index != last {
            let src = Self::record_offset(last);
            let dst = Self::record_offset(index);
            self.data
                .as_mut()
                .copy_within(src..src + RECORD_SIZE, dst);
        }
        LittleEndian::write_u32(&mut self.data.as_mut()[RECORD_COUNT_OFFSET..], last as u32);
        true
    }
}

impl<T: AsRef<[u8]>> Page for HeaderPage<T> {
    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_update_get() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = HeaderPage::new(&mut data[..]);
        page.init();

        assert!(page.insert_record("orders_pk", PageId(4)));
        assert!(page.insert_record("users_pk", PageId(9)));
        assert!(!page.insert_record("orders_pk", PageId(5)));

        assert_eq!(page.get_root_id("orders_pk"), Some(PageId(4)));
        assert_eq!(page.get_root_id("users_pk"), Some(PageId(9)));
        assert_eq!(page.get_root_id("missing"), None);

        assert!(page.update_record("orders_pk", PageId::INVALID));
        assert_eq!(page.get_root_id("orders_pk"), Some(PageId::INVALID));
        assert!(!page.update_record("missing", PageId(1)));

        assert_eq!(
            page.records(),
            vec![
                ("orders_pk".to_string(), PageId::INVALID),
                ("users_pk".to_string(), PageId(9))
            ]
        );
    }

    #[test]
    fn test_name_limits() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = HeaderPage::new(&mut data[..]);
        page.init();

        let max_name = "x".repeat(MAX_NAME_LEN);
        assert!(page.insert_record(&max_name, PageId(1)));
        assert_eq!(page.get_root_id(&max_name), Some(PageId(1)));
        assert!(!page.insert_record(&"y".repeat(MAX_NAME_LEN + 1), PageId(2)));
        assert!(!page.insert_record("", PageId(2)));
    }

    #[test]
    fn test_delete_record() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = HeaderPage::new(&mut data[..]);
        page.init();

        page.insert_record("a", PageId(1));
        page.insert_record("b", PageId(2));
        page.insert_record("c", PageId(3));

        assert!(page.delete_record("a"));
        assert!(!page.delete_record("a"));
        assert_eq!(page.record_count(), 2);
        assert_eq!(page.get_root_id("c"), Some(PageId(3)));
        assert_eq!(page.get_root_id("b"), Some(PageId(2)));
    }

    #[test]
    fn test_page_fills_up() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = HeaderPage::new(&mut data[..]);
        page.init();

        for i in 0..MAX_RECORDS {
            assert!(page.insert_record(&format!("index_{}", i), PageId(i as u32)));
        }
        assert!(!page.insert_record("one_more", PageId(0)));
    }
}
