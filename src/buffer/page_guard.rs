use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, PAGE_SIZE};

use super::FrameHeader;

/// Callback invoked when a guard releases its page: (page_id, is_dirty).
pub(crate) type ReleaseCallback = Box<dyn FnOnce(PageId, bool) + Send + Sync>;

/// Shared core of all guard flavors: the pin plus the release bookkeeping.
/// Dropping the core runs the release callback exactly once.
struct GuardCore {
    page_id: PageId,
    frame: Arc<FrameHeader>,
    release_callback: Option<ReleaseCallback>,
    is_dirty: bool,
}

impl GuardCore {
    fn new(page_id: PageId, frame: Arc<FrameHeader>, release_callback: ReleaseCallback) -> Self {
        Self {
            page_id,
            frame,
            release_callback: Some(release_callback),
            is_dirty: false,
        }
    }
}

impl Drop for GuardCore {
    fn drop(&mut self) {
        if let Some(callback) = self.release_callback.take() {
            callback(self.page_id, self.is_dirty);
        }
    }
}

/// Guard that holds only the pin on a page, no latch. Convert with
/// `upgrade_read` / `upgrade_write` to gain access to the page bytes.
pub struct BasicPageGuard {
    core: GuardCore,
}

impl BasicPageGuard {
    pub(crate) fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        Self {
            core: GuardCore::new(page_id, frame, release_callback),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.core.page_id
    }

    /// Marks the page dirty when this guard is released.
    pub fn set_dirty(&mut self) {
        self.core.is_dirty = true;
    }

    /// Consumes this guard and takes the page's read latch.
    pub fn upgrade_read(self) -> ReadPageGuard {
        ReadPageGuard::latch(self.core)
    }

    /// Consumes this guard and takes the page's write latch.
    pub fn upgrade_write(self) -> WritePageGuard {
        WritePageGuard::latch(self.core)
    }

    /// Drops this guard, releasing the pin.
    pub fn drop_guard(self) {
        drop(self);
    }
}

/// RAII guard for read access to a page. Holds the page's read latch and a
/// pin; both are released on drop (latch first).
pub struct ReadPageGuard {
    // Field order matters: the latch guard must drop before the core so the
    // latch is released before the page is unpinned.
    data_guard: RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>>,
    core: GuardCore,
}

impl ReadPageGuard {
    pub(crate) fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        Self::latch(GuardCore::new(page_id, frame, release_callback))
    }

    fn latch(core: GuardCore) -> Self {
        let data_guard = core.frame.data.read();
        // Safety: the guard borrows from the frame, which stays alive for at
        // least as long as this struct via the Arc held in `core`.
        let data_guard: RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>> =
            unsafe { std::mem::transmute(data_guard) };

        Self { data_guard, core }
    }

    pub fn page_id(&self) -> PageId {
        self.core.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data_guard[..]
    }

    /// Drops this guard, releasing the page.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

/// RAII guard for exclusive access to a page. Holds the page's write latch
/// and a pin; mutable access marks the page dirty.
pub struct WritePageGuard {
    data_guard: RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>>,
    core: GuardCore,
}

impl WritePageGuard {
    pub(crate) fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        Self::latch(GuardCore::new(page_id, frame, release_callback))
    }

    fn latch(core: GuardCore) -> Self {
        let data_guard = core.frame.data.write();
        // Safety: as for ReadPageGuard, the Arc in `core` keeps the frame
        // alive for the lifetime of the lock guard.
        let data_guard: RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>> =
            unsafe { std::mem::transmute(data_guard) };

        Self { data_guard, core }
    }

    pub fn page_id(&self) -> PageId {
        self.core.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data_guard[..]
    }

    /// Returns a mutable view of the page bytes and marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.core.is_dirty = true;
        &mut self.data_guard[..]
    }

    /// Drops this guard, releasing the page.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FrameId;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn tracking_callback(released: &Arc<AtomicBool>, dirty: &Arc<AtomicBool>) -> ReleaseCallback {
        let released = Arc::clone(released);
        let dirty = Arc::clone(dirty);
        Box::new(move |_, is_dirty| {
            released.store(true, Ordering::SeqCst);
            dirty.store(is_dirty, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_read_page_guard_releases_on_drop() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        frame.set_page_id(PageId::new(1));

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 42;
        frame.copy_from(&data);

        let released = Arc::new(AtomicBool::new(false));
        let dirty = Arc::new(AtomicBool::new(false));

        let guard = ReadPageGuard::new(
            PageId::new(1),
            frame.clone(),
            tracking_callback(&released, &dirty),
        );

        assert_eq!(guard.page_id(), PageId::new(1));
        assert_eq!(guard.data()[0], 42);
        assert!(!released.load(Ordering::SeqCst));

        drop(guard);
        assert!(released.load(Ordering::SeqCst));
        assert!(!dirty.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_page_guard_reports_dirty() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        frame.set_page_id(PageId::new(1));

        let released = Arc::new(AtomicBool::new(false));
        let dirty = Arc::new(AtomicBool::new(false));

        let mut guard = WritePageGuard::new(
            PageId::new(1),
            frame.clone(),
            tracking_callback(&released, &dirty),
        );

        guard.data_mut()[0] = 42;

        drop(guard);
        assert!(released.load(Ordering::SeqCst));
        assert!(dirty.load(Ordering::SeqCst));

        let mut read_back = [0u8; PAGE_SIZE];
        frame.copy_to(&mut read_back);
        assert_eq!(read_back[0], 42);
    }

    #[test]
    fn test_basic_guard_upgrade_write() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        frame.set_page_id(PageId::new(3));

        let released = Arc::new(AtomicBool::new(false));
        let dirty = Arc::new(AtomicBool::new(false));

        let basic = BasicPageGuard::new(
            PageId::new(3),
            frame.clone(),
            tracking_callback(&released, &dirty),
        );
        assert_eq!(basic.page_id(), PageId::new(3));

        let mut write = basic.upgrade_write();
        // The upgrade hands over the release duty; nothing released yet.
        assert!(!released.load(Ordering::SeqCst));

        write.data_mut()[9] = 9;
        drop(write);
        assert!(released.load(Ordering::SeqCst));
        assert!(dirty.load(Ordering::SeqCst));
    }

    #[test]
    fn test_basic_guard_upgrade_read_releases_once() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        frame.set_page_id(PageId::new(4));

        let released = Arc::new(AtomicBool::new(false));
        let dirty = Arc::new(AtomicBool::new(false));

        let basic = BasicPageGuard::new(
            PageId::new(4),
            frame.clone(),
            tracking_callback(&released, &dirty),
        );
        let read = basic.upgrade_read();
        assert!(!released.load(Ordering::SeqCst));
        drop(read);
        assert!(released.load(Ordering::SeqCst));
    }
}
