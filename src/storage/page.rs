//! Page layouts.
//!
//! Every page starts with the same 8-byte header:
//!
//! ```text
//! | page_id (4) | lsn (4) | ... page type specific ... |
//! ```
//!
//! The layouts are views over a borrowed byte buffer (usually a buffer pool
//! guard). Read accessors need `AsRef<[u8]>`, mutators need `AsMut<[u8]>`.

pub mod btree_internal_page;
pub mod btree_leaf_page;
pub mod btree_page;
pub mod header_page;
pub mod table_page;

use crate::storage::wal::Lsn;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PAGE_ID_OFFSET: usize = 0;
pub const PAGE_LSN_OFFSET: usize = 4;
pub const PAGE_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Marks "no page": an empty tree, the end of a page chain, a root's parent.
    pub const INVALID: PageId = PageId(u32::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "INVALID")
        }
    }
}

/// Common accessors shared by every page layout.
pub trait Page {
    fn data(&self) -> &[u8];

    fn page_id(&self) -> PageId {
        PageId(LittleEndian::read_u32(&self.data()[PAGE_ID_OFFSET..]))
    }

    fn lsn(&self) -> Lsn {
        page_lsn(self.data())
    }
}

pub fn page_lsn(data: &[u8]) -> Lsn {
    Lsn(LittleEndian::read_u32(&data[PAGE_LSN_OFFSET..]))
}

pub fn set_page_lsn(data: &mut [u8], lsn: Lsn) {
    LittleEndian::write_u32(&mut data[PAGE_LSN_OFFSET..], lsn.0);
}

pub(crate) fn set_page_id(data: &mut [u8], page_id: PageId) {
    LittleEndian::write_u32(&mut data[PAGE_ID_OFFSET..], page_id.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PAGE_SIZE;

    struct RawPage(Vec<u8>);

    impl Page for RawPage {
        fn data(&self) -> &[u8] {
            &self.0
        }
    }

    #[test]
    fn test_common_header() {
        let mut data = vec![0u8; PAGE_SIZE];
        set_page_id(&mut data, PageId(7));
        set_page_lsn(&mut data, Lsn(42));

        let page = RawPage(data);
        assert_eq!(page.page_id(), PageId(7));
        assert_eq!(page.lsn(), Lsn(42));
    }

    #[test]
    fn test_invalid_page_id() {
        assert!(!PageId::INVALID.is_valid());
        assert!(PageId(0).is_valid());
        assert_eq!(PageId::INVALID.to_string(), "INVALID");
        assert_eq!(PageId(3).to_string(), "3");
    }
}
