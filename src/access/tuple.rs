use crate::storage::page::PageId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Record id: the page a tuple lives in and its slot within that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    /// Encoded size inside index pages and log records.
    pub const SIZE: usize = 8;

    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.page_id.0.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.slot.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let page_id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let slot = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self {
            page_id: PageId(page_id),
            slot,
        }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}

/// Represents a row in the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub rid: Rid,
    pub data: Vec<u8>,
}

impl Tuple {
    pub fn new(rid: Rid, data: Vec<u8>) -> Self {
        Self { rid, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rid_ordering() {
        let rid1 = Rid::new(PageId(1), 5);
        let rid2 = Rid::new(PageId(1), 10);
        let rid3 = Rid::new(PageId(2), 3);

        assert!(rid1 < rid2);
        assert!(rid2 < rid3);
        assert!(rid1 < rid3);
    }

    #[test]
    fn test_rid_bytes() {
        let rid = Rid::new(PageId(0x0102_0304), 77);
        let bytes = rid.to_bytes();
        assert_eq!(&bytes[0..4], &[4, 3, 2, 1]);
        assert_eq!(Rid::from_bytes(&bytes), rid);
    }

    #[test]
    fn test_rid_display() {
        assert_eq!(Rid::new(PageId(3), 1).to_string(), "(3, 1)");
    }
}
