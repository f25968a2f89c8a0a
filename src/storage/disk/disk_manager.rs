use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::common::{PageId, Result, PAGE_SIZE};

/// DiskManager is responsible for reading and writing pages to/from disk.
/// Page `n` lives at byte offset `n * PAGE_SIZE` of a single database file.
/// Page IDs are allocated monotonically; deallocation only records the count
/// so that identifiers are never reissued.
pub struct DiskManager {
    /// Handle to the database file; the mutex also guards the file cursor
    file: Mutex<File>,
    /// Path the file was opened from
    db_path: PathBuf,
    /// Next page ID to hand out
    next_page_id: AtomicU32,
    /// Number of pages handed back via deallocate_page
    num_deallocated: AtomicU32,
    /// Number of disk reads performed
    num_reads: AtomicU32,
    /// Number of disk writes performed
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Opens (or creates) the database file at the given path. An existing
    /// file resumes ID allocation after its last full page.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&db_path)?;

        let existing_pages = (file.metadata()?.len() / PAGE_SIZE as u64) as u32;

        Ok(Self {
            file: Mutex::new(file),
            db_path,
            next_page_id: AtomicU32::new(existing_pages),
            num_deallocated: AtomicU32::new(0),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        })
    }

    /// Reads a page from disk into the provided buffer. Pages that were
    /// allocated but never written read back as zeroes.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "buffer must be PAGE_SIZE bytes");

        let byte_offset = page_id.as_u32() as u64 * PAGE_SIZE as u64;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(byte_offset))?;

        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data[filled..].fill(0);

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a page to disk from the provided buffer. The data is durable
    /// by the time the call returns.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "buffer must be PAGE_SIZE bytes");

        let byte_offset = page_id.as_u32() as u64 * PAGE_SIZE as u64;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(byte_offset))?;
        file.write_all(data)?;
        file.flush()?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Allocates a new page ID.
    pub fn allocate_page(&self) -> Result<PageId> {
        let id = self.next_page_id.fetch_add(1, Ordering::SeqCst);
        Ok(PageId::new(id))
    }

    /// Returns a page ID to the manager. IDs are not reissued.
    pub fn deallocate_page(&self, _page_id: PageId) -> Result<()> {
        self.num_deallocated.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn num_pages(&self) -> u32 {
        self.next_page_id.load(Ordering::Relaxed)
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_disk_manager_allocate() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(temp_file.path()).unwrap();

        assert_eq!(dm.allocate_page().unwrap(), PageId::new(0));
        assert_eq!(dm.allocate_page().unwrap(), PageId::new(1));
        assert_eq!(dm.num_pages(), 2);
    }

    #[test]
    fn test_disk_manager_read_write() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(temp_file.path()).unwrap();

        let page_id = dm.allocate_page().unwrap();

        let mut write_data = [0u8; PAGE_SIZE];
        write_data[0] = 42;
        write_data[100] = 255;
        write_data[PAGE_SIZE - 1] = 128;
        dm.write_page(page_id, &write_data).unwrap();

        let mut read_data = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read_data).unwrap();

        assert_eq!(read_data[0], 42);
        assert_eq!(read_data[100], 255);
        assert_eq!(read_data[PAGE_SIZE - 1], 128);
    }

    #[test]
    fn test_disk_manager_unwritten_page_reads_zeroes() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(temp_file.path()).unwrap();

        let page_id = dm.allocate_page().unwrap();

        let mut data = [7u8; PAGE_SIZE];
        dm.read_page(page_id, &mut data).unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disk_manager_persistence() {
        let temp_file = NamedTempFile::new().unwrap();

        {
            let dm = DiskManager::new(temp_file.path()).unwrap();
            let page_id = dm.allocate_page().unwrap();
            let mut data = [0u8; PAGE_SIZE];
            data[0] = 123;
            dm.write_page(page_id, &data).unwrap();
        }

        {
            let dm = DiskManager::new(temp_file.path()).unwrap();
            assert_eq!(dm.num_pages(), 1);

            let mut data = [0u8; PAGE_SIZE];
            dm.read_page(PageId::new(0), &mut data).unwrap();
            assert_eq!(data[0], 123);
        }
    }
}
