//! Strata - the core of a disk-oriented storage engine
//!
//! The crate provides a page-cached concurrent B+Tree index built on top of
//! a bounded buffer pool. Pages live on disk, a fixed set of in-memory
//! frames caches them, and RAII guards tie pin and latch lifetimes to
//! scopes.
//!
//! # Architecture
//!
//! - **Storage layer** (`storage`): the page file
//!   - `DiskManager`: reads, writes and allocates fixed-size pages
//!   - `DiskScheduler`: background worker that serializes page I/O
//!
//! - **Buffer pool** (`buffer`): memory management for pages
//!   - `BufferPoolManager`: maps pages onto frames, brokers disk I/O
//!   - `LruKReplacer`: LRU-K eviction policy
//!   - `FrameHeader`: per-frame metadata, page bytes, page latch
//!   - `BasicPageGuard` / `ReadPageGuard` / `WritePageGuard`: scoped
//!     pin-and-latch handles
//!
//! - **Index** (`index`): the B+Tree
//!   - `BPlusTree`: crabbing-latched search, insert (split), delete
//!     (borrow/merge)
//!   - `BPlusTreeIterator`: forward leaf-chain cursor
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata::buffer::BufferPoolManager;
//! use strata::index::{BPlusTree, U32Comparator};
//! use strata::storage::disk::DiskManager;
//! use strata::{PageId, RecordId, SlotId};
//!
//! let disk_manager = Arc::new(DiskManager::new("example.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, 2, disk_manager));
//!
//! // The header page anchors the tree's root.
//! let header_page_id = bpm.new_page().unwrap().page_id();
//!
//! let tree: BPlusTree<4> = BPlusTree::new(
//!     "example",
//!     header_page_id,
//!     Arc::clone(&bpm),
//!     Arc::new(U32Comparator),
//!     128,
//!     128,
//! )
//! .unwrap();
//!
//! let key = 42u32.to_le_bytes();
//! let rid = RecordId::new(PageId::new(7), SlotId::new(0));
//! assert!(tree.insert(&key, rid).unwrap());
//! assert_eq!(tree.get_value(&key).unwrap(), Some(rid));
//! ```

pub mod buffer;
pub mod common;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{PageId, RecordId, Result, SlotId, StrataError};
