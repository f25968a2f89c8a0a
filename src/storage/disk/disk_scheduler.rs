use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::common::{PageId, Result, StratumError, PAGE_SIZE};

use super::DiskManager;

/// An owned page-sized buffer handed through the request channel.
pub type PageBuf = Box<[u8; PAGE_SIZE]>;

/// A disk I/O request processed by the scheduler's worker thread.
pub enum DiskRequest {
    Read {
        page_id: PageId,
        reply: std::sync::mpsc::Sender<Result<PageBuf>>,
    },
    Write {
        page_id: PageId,
        data: PageBuf,
        reply: std::sync::mpsc::Sender<Result<()>>,
    },
}

/// DiskScheduler owns a background worker thread that serializes disk I/O
/// requests arriving on a bounded channel. The buffer pool talks to it
/// through the synchronous wrappers, which block on the request's reply.
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
            Self::worker_loop(dm_clone, receiver, shutdown_clone);
        });

        Self {
            disk_manager,
            request_sender: sender,
            shutdown,
            worker_handle: Some(worker_handle),
        }
    }

    /// Queues a disk request for the background worker.
    pub fn schedule(&self, request: DiskRequest) -> Result<()> {
        self.request_sender
            .send(request)
            .map_err(|e| StratumError::DiskScheduler(format!("failed to schedule request: {e}")))
    }

    /// Schedules a read and blocks until the page is in `data`.
    pub fn read_sync(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let (tx, rx) = std::sync::mpsc::channel();
        self.schedule(DiskRequest::Read { page_id, reply: tx })?;

        let buf = rx
            .recv()
            .map_err(|e| StratumError::DiskScheduler(format!("no completion: {e}")))??;
        data.copy_from_slice(&buf[..]);
        Ok(())
    }

    /// Schedules a write and blocks until it is durable.
    pub fn write_sync(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let mut buf: PageBuf = Box::new([0u8; PAGE_SIZE]);
        buf.copy_from_slice(data);

        let (tx, rx) = std::sync::mpsc::channel();
        self.schedule(DiskRequest::Write {
            page_id,
            data: buf,
            reply: tx,
        })?;

        rx.recv()
            .map_err(|e| StratumError::DiskScheduler(format!("no completion: {e}")))?
    }

    /// Worker thread body: process requests until shutdown is signaled,
    /// then drain whatever is left in the channel.
    fn worker_loop(
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
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    // Re-check the shutdown flag
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    break;
                }
            }
        }
    }

    fn process_request(disk_manager: &DiskManager, request: DiskRequest) {
        match request {
            DiskRequest::Read { page_id, reply } => {
                let mut buf: PageBuf = Box::new([0u8; PAGE_SIZE]);
                let result = disk_manager.read_page(page_id, &mut buf[..]).map(|_| buf);
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

    /// Returns a reference to the underlying DiskManager.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_disk_scheduler_read_write() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let scheduler = DiskScheduler::new(dm);

        let page_id = scheduler.disk_manager().allocate_page().unwrap();

        let mut write_data = [0u8; PAGE_SIZE];
        write_data[0] = 42;
        write_data[100] = 255;
        scheduler.write_sync(page_id, &write_data).unwrap();

        let mut read_data = [0u8; PAGE_SIZE];
        scheduler.read_sync(page_id, &mut read_data).unwrap();

        assert_eq!(read_data[0], 42);
        assert_eq!(read_data[100], 255);
    }

    #[test]
    fn test_disk_scheduler_many_requests() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let scheduler = DiskScheduler::new(dm);

        let page_ids: Vec<_> = (0..8)
            .map(|_| scheduler.disk_manager().allocate_page().unwrap())
            .collect();

        for (i, &pid) in page_ids.iter().enumerate() {
            let data = [i as u8 + 1; PAGE_SIZE];
            scheduler.write_sync(pid, &data).unwrap();
        }

        for (i, &pid) in page_ids.iter().enumerate() {
            let mut data = [0u8; PAGE_SIZE];
            scheduler.read_sync(pid, &mut data).unwrap();
            assert_eq!(data[0], i as u8 + 1);
        }
    }
}
