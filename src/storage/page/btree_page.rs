//! Header shared by B+ tree leaf and internal pages.
//!
//! ```text
//! | page_id (4) | lsn (4) | page_type (4) | size (4) | max_size (4) | parent_page_id (4) |
//! ```

use crate::access::btree::IndexKey;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::btree_internal_page::BTreeInternalPage;
use crate::storage::page::btree_leaf_page::BTreeLeafPage;
use crate::storage::page::{Page, PageId, PAGE_HEADER_SIZE, PAGE_ID_OFFSET};
use byteorder::{ByteOrder, LittleEndian};

const PAGE_TYPE_OFFSET: usize = PAGE_HEADER_SIZE;
const SIZE_OFFSET: usize = PAGE_TYPE_OFFSET + 4;
const MAX_SIZE_OFFSET: usize = SIZE_OFFSET + 4;
const PARENT_OFFSET: usize = MAX_SIZE_OFFSET + 4;
pub const BTREE_HEADER_SIZE: usize = PARENT_OFFSET + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BTreePageType {
    Leaf = 1,
    Internal = 2,
}

pub fn page_type(data: &[u8]) -> Option<BTreePageType> {
    match LittleEndian::read_u32(&data[PAGE_TYPE_OFFSET..]) {
        1 => Some(BTreePageType::Leaf),
        2 => Some(BTreePageType::Internal),
        _ => None,
    }
}

pub(crate) fn init_header(
    data: &mut [u8],
    page_type: BTreePageType,
    page_id: PageId,
    parent_page_id: PageId,
    max_size: usize,
) {
    LittleEndian::write_u32(&mut data[PAGE_ID_OFFSET..], page_id.0);
    LittleEndian::write_u32(&mut data[PAGE_TYPE_OFFSET..], page_type as u32);
    set_size(data, 0);
    LittleEndian::write_u32(&mut data[MAX_SIZE_OFFSET..], max_size as u32);
    set_parent_page_id(data, parent_page_id);
}

pub fn size(data: &[u8]) -> usize {
    LittleEndian::read_u32(&data[SIZE_OFFSET..]) as usize
}

pub(crate) fn set_size(data: &mut [u8], size: usize) {
    LittleEndian::write_u32(&mut data[SIZE_OFFSET..], size as u32);
}

pub fn max_size(data: &[u8]) -> usize {
    LittleEndian::read_u32(&data[MAX_SIZE_OFFSET..]) as usize
}

pub fn parent_page_id(data: &[u8]) -> PageId {
    PageId(LittleEndian::read_u32(&data[PARENT_OFFSET..]))
}

pub fn set_parent_page_id(data: &mut [u8], parent: PageId) {
    LittleEndian::write_u32(&mut data[PARENT_OFFSET..], parent.0);
}

/// Minimum occupancy of a non-root page: entries for a leaf, children for an
/// internal page. Internal pages use the same bound as leaves, one above the
/// usual `ceil((max + 1) / 2) - 1` for odd `max`.
pub fn min_size(max_size: usize) -> usize {
    max_size.div_ceil(2)
}

/// A B+ tree page of either kind, dispatched on the stored page type.
pub enum BTreePage<T, K> {
    Leaf(BTreeLeafPage<T, K>),
    Internal(BTreeInternalPage<T, K>),
}

impl<T: AsRef<[u8]>, K: IndexKey> BTreePage<T, K> {
    pub fn from_data(data: T) -> StorageResult<Self> {
        match page_type(data.as_ref()) {
            Some(BTreePageType::Leaf) => Ok(Self::Leaf(BTreeLeafPage::new(data))),
            Some(BTreePageType::Internal) => Ok(Self::Internal(BTreeInternalPage::new(data))),
            None => {
                let page_id = PageId(LittleEndian::read_u32(&data.as_ref()[PAGE_ID_OFFSET..]));
                Err(StorageError::CorruptPage {
                    page_id,
                    reason: "not a B+ tree page".to_string(),
                })
            }
        }
    }

    fn raw(&self) -> &[u8] {
        match self {
            Self::Leaf(page) => page.data(),
            Self::Internal(page) => page.data(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    pub fn size(&self) -> usize {
        size(self.raw())
    }

    pub fn max_size(&self) -> usize {
        max_size(self.raw())
    }

    pub fn min_size(&self) -> usize {
        min_size(self.max_size())
    }

    pub fn parent_page_id(&self) -> PageId {
        parent_page_id(self.raw())
    }

    pub fn is_root(&self) -> bool {
        !self.parent_page_id().is_valid()
    }

    /// True when inserting one entry cannot split this page.
    pub fn is_insert_safe(&self) -> bool {
        self.size() < self.max_size()
    }

    /// True when removing one entry cannot underflow this page or, for the
    /// root, change the root.
    pub fn is_remove_safe(&self) -> bool {
        match (self.is_root(), self.is_leaf()) {
            (true, true) => self.size() > 1,
            (true, false) => self.size() > 2,
            (false, _) => self.size() > self.min_size(),
        }
    }
}

impl<T: AsRef<[u8]>, K: IndexKey> Page for BTreePage<T, K> {
    fn data(&self) -> &[u8] {
        self.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PAGE_SIZE;

    #[test]
    fn test_header_layout() {
        let mut data = vec![0u8; PAGE_SIZE];
        init_header(&mut data, BTreePageType::Internal, PageId(5), PageId(1), 4);
        set_size(&mut data, 3);

        assert_eq!(&data[8..12], &2u32.to_le_bytes());
        assert_eq!(&data[12..16], &3u32.to_le_bytes());
        assert_eq!(&data[16..20], &4u32.to_le_bytes());
        assert_eq!(&data[20..24], &1u32.to_le_bytes());

        let page = BTreePage::<_, i64>::from_data(&data[..]).unwrap();
        assert!(!page.is_leaf());
        assert!(!page.is_root());
        assert_eq!(page.page_id(), PageId(5));
        assert_eq!(page.size(), 3);
        assert_eq!(page.min_size(), 2);
        assert!(page.is_insert_safe());
        assert!(page.is_remove_safe());
    }

    #[test]
    fn test_root_safety() {
        let mut data = vec![0u8; PAGE_SIZE];
        init_header(&mut data, BTreePageType::Leaf, PageId(1), PageId::INVALID, 3);
        set_size(&mut data, 1);

        let page = BTreePage::<_, i64>::from_data(&data[..]).unwrap();
        assert!(page.is_root());
        assert!(!page.is_remove_safe());

        set_size(&mut data, 2);
        let page = BTreePage::<_, i64>::from_data(&data[..]).unwrap();
        assert!(page.is_remove_safe());
    }

    #[test]
    fn test_rejects_other_pages() {
        let data = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            BTreePage::<_, i64>::from_data(&data[..]),
            Err(StorageError::CorruptPage { .. })
        ));
    }

    #[test]
    fn test_min_size() {
        assert_eq!(min_size(3), 2);
        assert_eq!(min_size(4), 2);
        assert_eq!(min_size(5), 3);
    }
}
