use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::common::{PageId, Result, StrataError, PAGE_SIZE};

use super::DiskManager;

/// A disk I/O request processed by the background worker.
/// Buffers are owned by the request so nothing outlives its originator.
enum DiskRequest {
    Read {
        page_id: PageId,
        reply: mpsc::Sender<Result<Box<[u8; PAGE_SIZE]>>>,
    },
    Write {
        page_id: PageId,
        data: Box<[u8; PAGE_SIZE]>,
        reply: mpsc::Sender<Result<()>>,
    },
}

/// DiskScheduler manages a background worker thread that processes disk I/O
/// requests. Callers rendezvous on a reply channel for completion.
pub struct DiskScheduler {
    /// The disk manager for actual I/O operations
    disk_manager: Arc<DiskManager>,
    /// Channel sender for queuing requests
    request_sender: Sender<DiskRequest>,
    /// Flag to signal shutdown
    shutdown: Arc<AtomicBool>,
    /// Handle to the background worker thread
    worker_handle: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    /// Creates a new DiskScheduler and spawns its worker thread.
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        let (sender, receiver) = bounded::<DiskRequest>(128);
        let shutdown = Arc::new(AtomicBool::new(false));

        let dm_clone = Arc::clone(&disk_manager);
        let shutdown_clone = Arc::clone(&shutdown);

        let worker_handle = thread::spawn(move || {
            Self::run_worker(dm_clone, receiver, shutdown_clone);
        });

        Self {
            disk_manager,
            request_sender: sender,
            shutdown,
            worker_handle: Some(worker_handle),
        }
    }

    /// Schedules a read request and waits for completion.
    pub fn schedule_read_sync(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let (tx, rx) = mpsc::channel();
        self.schedule(DiskRequest::Read { page_id, reply: tx })?;

        let buf = rx
            .recv()
            .map_err(|e| StrataError::DiskScheduler(format!("read completion lost: {}", e)))??;
        data.copy_from_slice(&buf[..]);
        Ok(())
    }

    /// Schedules a write request and waits for completion.
    pub fn schedule_write_sync(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let mut buf = Box::new([0u8; PAGE_SIZE]);
        buf.copy_from_slice(data);

        let (tx, rx) = mpsc::channel();
        self.schedule(DiskRequest::Write {
            page_id,
            data: buf,
            reply: tx,
        })?;

        rx.recv()
            .map_err(|e| StrataError::DiskScheduler(format!("write completion lost: {}", e)))?
    }

    /// Returns a reference to the underlying DiskManager.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    fn schedule(&self, request: DiskRequest) -> Result<()> {
        self.request_sender
            .send(request)
            .map_err(|_| StrataError::DiskScheduler("worker queue closed".to_string()))
    }

    /// Worker loop: processes requests until shutdown is signaled, draining
    /// the queue before exit.
    fn run_worker(
        disk_manager: Arc<DiskManager>,
        receiver: Receiver<DiskRequest>,
        shutdown: Arc<AtomicBool>,
    ) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                while let Ok(request) = receiver.try_recv() {
                    Self::process_request(&disk_manager, request);
                }
                break;
            }

            match receiver.recv_timeout(std::time::Duration::from_millis(100)) {
                Ok(request) => {
                    Self::process_request(&disk_manager, request);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn process_request(disk_manager: &DiskManager, request: DiskRequest) {
        match request {
            DiskRequest::Read { page_id, reply } => {
                let mut buf = Box::new([0u8; PAGE_SIZE]);
                let result = disk_manager
                    .read_page(page_id, &mut buf[..])
                    .map(move |()| buf);
                let _ = reply.send(result);
            }
            DiskRequest::Write {
                page_id,
                data,
                reply,
            } => {
                let _ = reply.send(disk_manager.write_page(page_id, &data[..]));
            }
        }
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}
