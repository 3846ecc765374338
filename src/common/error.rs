use thiserror::Error;

use super::types::{FrameId, PageId};

/// Storage engine error types
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Page {0} not found")]
    PageNotFound(PageId),

    #[error("Buffer pool is full, no evictable frames available")]
    BufferPoolFull,

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("Invalid frame ID: {0}")]
    InvalidFrameId(FrameId),

    #[error("Page {0} is still pinned")]
    PageStillPinned(PageId),

    #[error("Disk scheduler error: {0}")]
    DiskScheduler(String),

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),
}

pub type Result<T> = std::result::Result<T, StrataError>;
