use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{FrameId, PageId, Result, StrataError, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::page_guard::ReleaseCallback;
use super::{BasicPageGuard, FrameHeader, LruKReplacer, ReadPageGuard, WritePageGuard};

/// Bookkeeping guarded by the single metadata mutex. The page table and the
/// free list must change together with frame reservations, so they share one
/// lock; the replacer keeps its own and is only called from within these
/// critical sections.
struct Meta {
    /// Page table: maps page IDs to frame IDs
    page_table: HashMap<PageId, FrameId>,
    /// Frames that are not currently in use
    free_list: VecDeque<FrameId>,
}

/// State shared between the manager and the release callbacks of its guards.
struct BufferPoolState {
    /// The buffer pool frames
    frames: Vec<Arc<FrameHeader>>,
    meta: Mutex<Meta>,
    /// LRU-K replacer for eviction decisions
    replacer: LruKReplacer,
}

/// BufferPoolManager maps logical pages onto a fixed set of in-memory
/// frames, brokering disk I/O and choosing eviction victims with an LRU-K
/// policy. Access goes through RAII page guards that hold a pin (and for the
/// read/write flavors, the page latch) until dropped.
pub struct BufferPoolManager {
    /// Number of frames in the buffer pool
    pool_size: usize,
    state: Arc<BufferPoolState>,
    /// Disk scheduler for page I/O
    disk_scheduler: DiskScheduler,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager with the given pool size, k value for
    /// LRU-K, and disk manager.
    pub fn new(pool_size: usize, k: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::new();

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let state = Arc::new(BufferPoolState {
            frames,
            meta: Mutex::new(Meta {
                page_table: HashMap::new(),
                free_list,
            }),
            replacer: LruKReplacer::new(k, pool_size),
        });

        Self {
            pool_size,
            state,
            disk_scheduler: DiskScheduler::new(disk_manager),
        }
    }

    /// Allocates a fresh page and returns a guard pinning it. The page's
    /// buffer is zeroed and clean. Fails with `BufferPoolFull` when every
    /// frame is pinned.
    pub fn new_page(&self) -> Result<BasicPageGuard> {
        let frame_id = self.reserve_victim()?;
        let frame = &self.state.frames[frame_id.as_usize()];

        if let Err(e) = self.write_back_if_dirty(frame) {
            self.unreserve(frame_id);
            return Err(e);
        }

        let page_id = match self.disk_scheduler.disk_manager().allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                self.unreserve(frame_id);
                return Err(e);
            }
        };

        frame.fill_zero();
        frame.set_dirty(false);
        frame.set_page_id(page_id);

        {
            let mut meta = self.state.meta.lock();
            meta.page_table.insert(page_id, frame_id);
            self.state.replacer.record_access(frame_id);
        }

        debug!("allocated new page {} in frame {}", page_id, frame_id);
        Ok(BasicPageGuard::new(
            page_id,
            Arc::clone(frame),
            self.release_callback(),
        ))
    }

    /// Fetches a page for shared access, taking its read latch.
    pub fn checked_read_page(&self, page_id: PageId) -> Result<ReadPageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(StrataError::InvalidPageId(page_id));
        }

        let frame_id = self.fetch_page_frame(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        Ok(ReadPageGuard::new(page_id, frame, self.release_callback()))
    }

    /// Fetches a page for exclusive access, taking its write latch.
    pub fn checked_write_page(&self, page_id: PageId) -> Result<WritePageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(StrataError::InvalidPageId(page_id));
        }

        let frame_id = self.fetch_page_frame(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        Ok(WritePageGuard::new(page_id, frame, self.release_callback()))
    }

    /// Deletes a page from the buffer pool and the disk allocator.
    /// Returns `Ok(true)` when the page is gone (including when it was not
    /// resident at all) and `Ok(false)` while it is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let frame_id = {
            let mut meta = self.state.meta.lock();
            let Some(&frame_id) = meta.page_table.get(&page_id) else {
                return Ok(true);
            };
            if self.state.frames[frame_id.as_usize()].pin_count() > 0 {
                return Ok(false);
            }
            meta.page_table.remove(&page_id);
            self.state.replacer.remove(frame_id);
            frame_id
        };

        let frame = &self.state.frames[frame_id.as_usize()];
        self.write_back_if_dirty(frame)?;
        frame.reset();

        self.state.meta.lock().free_list.push_back(frame_id);
        self.disk_scheduler.disk_manager().deallocate_page(page_id)?;
        Ok(true)
    }

    /// Writes a page to disk unconditionally and clears its dirty bit.
    /// Returns `Ok(false)` if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Err(StrataError::InvalidPageId(page_id));
        }

        // Pin the frame so it cannot be recycled while the write is issued
        // outside the metadata lock.
        let frame_id = {
            let meta = self.state.meta.lock();
            let Some(&frame_id) = meta.page_table.get(&page_id) else {
                return Ok(false);
            };
            self.state.frames[frame_id.as_usize()].pin();
            self.state.replacer.set_evictable(frame_id, false);
            frame_id
        };

        let frame = &self.state.frames[frame_id.as_usize()];
        let mut data = [0u8; PAGE_SIZE];
        frame.copy_to(&mut data);
        let result = self.disk_scheduler.schedule_write_sync(page_id, &data);
        if result.is_ok() {
            frame.set_dirty(false);
        }

        {
            let _meta = self.state.meta.lock();
            if let Some(0) = frame.unpin() {
                self.state.replacer.set_evictable(frame_id, true);
            }
        }

        result.map(|()| true)
    }

    /// Flushes every resident page.
    pub fn flush_all_pages(&self) -> Result<()> {
        let page_ids: Vec<PageId> = {
            let meta = self.state.meta.lock();
            meta.page_table.keys().copied().collect()
        };

        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Returns the pin count for a resident page.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let meta = self.state.meta.lock();
        meta.page_table
            .get(&page_id)
            .map(|&frame_id| self.state.frames[frame_id.as_usize()].pin_count())
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn free_frame_count(&self) -> usize {
        self.state.meta.lock().free_list.len()
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.disk_scheduler.disk_manager()
    }

    /// Brings `page_id` into some frame and returns it pinned.
    fn fetch_page_frame(&self, page_id: PageId) -> Result<FrameId> {
        {
            let meta = self.state.meta.lock();
            if let Some(&frame_id) = meta.page_table.get(&page_id) {
                self.state.frames[frame_id.as_usize()].pin();
                self.state.replacer.record_access(frame_id);
                self.state.replacer.set_evictable(frame_id, false);
                trace!("buffer pool hit for page {}", page_id);
                return Ok(frame_id);
            }
        }

        debug!("buffer pool miss for page {}, loading from disk", page_id);

        // Reserve a victim frame; it is pinned and unmapped, so no other
        // thread can touch it while the I/O below runs unlocked.
        let frame_id = self.reserve_victim()?;
        let frame = &self.state.frames[frame_id.as_usize()];

        let filled = self.write_back_if_dirty(frame).and_then(|()| {
            let mut data = [0u8; PAGE_SIZE];
            self.disk_scheduler.schedule_read_sync(page_id, &mut data)?;
            frame.copy_from(&data);
            frame.set_dirty(false);
            frame.set_page_id(page_id);
            Ok(())
        });
        if let Err(e) = filled {
            self.unreserve(frame_id);
            return Err(e);
        }

        let mut meta = self.state.meta.lock();
        if let Some(&existing) = meta.page_table.get(&page_id) {
            // Another thread loaded the page while we did; yield to it. The
            // winner's frame is pinned before the lock drops so it cannot be
            // evicted underneath us.
            self.state.frames[existing.as_usize()].pin();
            self.state.replacer.record_access(existing);
            self.state.replacer.set_evictable(existing, false);
            drop(meta);

            frame.reset();
            self.state.meta.lock().free_list.push_back(frame_id);
            return Ok(existing);
        }
        meta.page_table.insert(page_id, frame_id);
        self.state.replacer.record_access(frame_id);

        Ok(frame_id)
    }

    /// Claims a frame for reuse: the free list first, else an eviction
    /// victim. The returned frame is pinned and no longer mapped.
    fn reserve_victim(&self) -> Result<FrameId> {
        let mut meta = self.state.meta.lock();

        if let Some(frame_id) = meta.free_list.pop_front() {
            self.state.frames[frame_id.as_usize()].pin();
            return Ok(frame_id);
        }

        if let Some(frame_id) = self.state.replacer.evict() {
            let frame = &self.state.frames[frame_id.as_usize()];
            let old_page_id = frame.page_id();
            debug_assert_eq!(frame.pin_count(), 0);
            if old_page_id != INVALID_PAGE_ID {
                meta.page_table.remove(&old_page_id);
            }
            frame.pin();
            trace!("evicted page {} from frame {}", old_page_id, frame_id);
            return Ok(frame_id);
        }

        Err(StrataError::BufferPoolFull)
    }

    /// Returns a reserved frame unused, e.g. after a failed disk read.
    fn unreserve(&self, frame_id: FrameId) {
        let frame = &self.state.frames[frame_id.as_usize()];
        frame.reset();
        self.state.meta.lock().free_list.push_back(frame_id);
    }

    /// Flushes the frame's previous contents before it is repurposed.
    fn write_back_if_dirty(&self, frame: &FrameHeader) -> Result<()> {
        if frame.is_dirty() {
            let mut data = [0u8; PAGE_SIZE];
            frame.copy_to(&mut data);
            self.disk_scheduler
                .schedule_write_sync(frame.page_id(), &data)?;
            frame.set_dirty(false);
        }
        Ok(())
    }

    /// The unpin closure handed to every guard.
    fn release_callback(&self) -> ReleaseCallback {
        let state = Arc::clone(&self.state);
        Box::new(move |page_id, is_dirty| {
            let meta = state.meta.lock();
            if let Some(&frame_id) = meta.page_table.get(&page_id) {
                let frame = &state.frames[frame_id.as_usize()];
                if is_dirty {
                    frame.set_dirty(true);
                }
                if let Some(0) = frame.unpin() {
                    state.replacer.set_evictable(frame_id, true);
                }
            }
        })
    }
}
