//! Access layer: tables, tuples and indexes.
//!
//! - **TableHeap**: a table spanning a linked chain of table pages
//! - **Tuple** / **Rid**: records and their ids
//! - **BPlusTree**: a unique index from fixed-size keys to record ids

pub mod btree;
pub mod heap;
pub mod tuple;

pub use btree::{BPlusTree, BPlusTreeIterator, FixedKey, IndexKey};
pub use heap::{TableHeap, TableIterator};
pub use tuple::{Rid, Tuple};
