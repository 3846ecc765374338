pub mod btree_index;
pub mod btree_iterator;
pub mod btree_page;
pub mod key_comparator;

pub use btree_index::BPlusTree;
pub use btree_iterator::BPlusTreeIterator;
pub use key_comparator::{BytewiseComparator, KeyComparator, U32Comparator, U64Comparator};
