use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::common::{PageId, Result, PAGE_SIZE};

/// DiskManager is responsible for reading and writing pages to/from disk.
/// It manages a single database file and tracks the number of pages
/// allocated. Freed pages are recycled before the file is grown.
pub struct DiskManager {
    /// The database file; the mutex serializes access to the file cursor.
    file: Mutex<File>,
    /// Path of the database file
    db_path: PathBuf,
    /// Total number of pages ever allocated (high-water mark)
    num_pages: AtomicU32,
    /// Pages returned by deallocate_page, reused by allocate_page
    free_pages: Mutex<Vec<PageId>>,
    /// Number of disk reads performed
    num_reads: AtomicU32,
    /// Number of disk writes performed
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Opens the database file at `db_path`, creating it if absent.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&db_path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            file: Mutex::new(file),
            db_path,
            num_pages: AtomicU32::new(num_pages),
            free_pages: Mutex::new(Vec::new()),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        })
    }

    /// Reads a page from disk into the provided buffer.
    /// A read past the end of the file yields a zeroed buffer.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");

        let byte_offset = (page_id.as_u32() as u64) * (PAGE_SIZE as u64);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(byte_offset))?;

        let bytes_read = file.read(data)?;
        if bytes_read < PAGE_SIZE {
            data[bytes_read..].fill(0);
        }

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a page to disk from the provided buffer.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");

        let byte_offset = (page_id.as_u32() as u64) * (PAGE_SIZE as u64);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(byte_offset))?;
        file.write_all(data)?;
        file.flush()?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Allocates a new page on disk and returns its page ID, zeroed on
    /// disk. Reuses a previously deallocated page if one is available.
    pub fn allocate_page(&self) -> Result<PageId> {
        let page_id = match self.free_pages.lock().pop() {
            Some(page_id) => page_id,
            None => PageId::new(self.num_pages.fetch_add(1, Ordering::SeqCst)),
        };

        let zeros = [0u8; PAGE_SIZE];
        self.write_page(page_id, &zeros)?;

        Ok(page_id)
    }

    /// Returns a page to the allocator for reuse.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        self.free_pages.lock().push(page_id);
        Ok(())
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages.load(Ordering::Relaxed)
    }

    pub fn num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    pub fn num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.file.get_mut().sync_all();
    }
}
