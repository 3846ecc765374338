use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::common::{FrameId, PageId, INVALID_PAGE_ID, PAGE_SIZE};

/// FrameHeader manages a single buffer frame: the metadata of the resident
/// page and the page bytes themselves. The `RwLock` around the bytes is the
/// page latch handed out through the page guards.
pub struct FrameHeader {
    /// The frame ID (index in the buffer pool)
    frame_id: FrameId,
    /// The page ID stored in this frame (INVALID_PAGE_ID if empty)
    page_id: RwLock<PageId>,
    /// Pin count - number of live guards on this frame
    pin_count: AtomicU32,
    /// Whether the page has been modified since being read from disk
    is_dirty: AtomicBool,
    /// The page data; the lock doubles as the page latch
    pub(crate) data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl FrameHeader {
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: RwLock::new(INVALID_PAGE_ID),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn page_id(&self) -> PageId {
        *self.page_id.read()
    }

    pub fn set_page_id(&self, page_id: PageId) {
        *self.page_id.write() = page_id;
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the new value.
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count and returns the new value.
    /// Returns None if the pin count was already 0.
    pub fn unpin(&self) -> Option<u32> {
        loop {
            let current = self.pin_count.load(Ordering::Acquire);
            if current == 0 {
                return None;
            }
            if self
                .pin_count
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(current - 1);
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Copies data from the given slice into the frame.
    pub fn copy_from(&self, data: &[u8]) {
        assert_eq!(data.len(), PAGE_SIZE);
        self.data.write().copy_from_slice(data);
    }

    /// Copies data from the frame into the given slice.
    pub fn copy_to(&self, data: &mut [u8]) {
        assert_eq!(data.len(), PAGE_SIZE);
        let guard = self.data.read();
        data.copy_from_slice(&**guard);
    }

    /// Zeroes the page bytes, leaving metadata untouched.
    pub fn fill_zero(&self) {
        self.data.write().fill(0);
    }

    /// Resets the frame to its initial, unoccupied state.
    pub fn reset(&self) {
        *self.page_id.write() = INVALID_PAGE_ID;
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.data.write().fill(0);
    }
}
