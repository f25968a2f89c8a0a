//! Integration tests for the buffer pool manager

use std::sync::Arc;

use stratum::buffer::BufferPoolManager;
use stratum::common::{PageId, StratumError, PAGE_SIZE};
use stratum::storage::disk::DiskManager;
use tempfile::NamedTempFile;

fn create_bpm(pool_size: usize, k: usize) -> (BufferPoolManager, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    (BufferPoolManager::new(pool_size, k, dm), temp_file)
}

/// Pool of 3 frames, K=2: a dirty page pushed out by later allocations must
/// land on disk before its frame is reused.
#[test]
fn test_eviction_reclaims_dirty_page() {
    let (bpm, _temp) = create_bpm(3, 2);

    let p1 = bpm.new_page().unwrap().page_id();
    {
        let mut guard = bpm.fetch_page_write(p1).unwrap();
        guard.data_mut()[0] = 0xAB;
        guard.data_mut()[PAGE_SIZE - 1] = 0xCD;
    }

    // Same access pattern for the fillers keeps eviction order FIFO, so p1
    // is the first frame reclaimed
    let mut later = Vec::new();
    for _ in 0..3 {
        let pid = bpm.new_page().unwrap().page_id();
        {
            let _guard = bpm.fetch_page_write(pid).unwrap();
        }
        later.push(pid);
    }

    assert_eq!(bpm.get_pin_count(p1), None, "p1 should have been evicted");

    let mut image = [0u8; PAGE_SIZE];
    bpm.disk_manager().read_page(p1, &mut image).unwrap();
    assert_eq!(image[0], 0xAB);
    assert_eq!(image[PAGE_SIZE - 1], 0xCD);

    // Fetching p1 back reads the same bytes
    let guard = bpm.fetch_page_read(p1).unwrap();
    assert_eq!(guard.data()[0], 0xAB);
}

#[test]
fn test_pin_count_tracks_guards() {
    let (bpm, _temp) = create_bpm(4, 2);

    let pid = bpm.new_page().unwrap().page_id();
    assert_eq!(bpm.get_pin_count(pid), Some(0));

    let g1 = bpm.fetch_page_read(pid).unwrap();
    let g2 = bpm.fetch_page_read(pid).unwrap();
    assert_eq!(bpm.get_pin_count(pid), Some(2));

    drop(g1);
    assert_eq!(bpm.get_pin_count(pid), Some(1));
    drop(g2);
    assert_eq!(bpm.get_pin_count(pid), Some(0));
}

#[test]
fn test_pinned_pages_never_evicted() {
    let (bpm, _temp) = create_bpm(2, 2);

    let p1 = bpm.new_page().unwrap().page_id();
    let _held = bpm.fetch_page_read(p1).unwrap();

    let _p2_guard = bpm.new_page().unwrap();

    // Both frames pinned: the pool has nothing to give
    assert!(matches!(bpm.new_page(), Err(StratumError::PoolExhausted)));

    // p1 is still resident and readable
    let guard = bpm.fetch_page_read(p1).unwrap();
    assert_eq!(guard.page_id(), p1);
}

#[test]
fn test_dirty_bit_survives_clean_unpin() {
    let (bpm, _temp) = create_bpm(4, 2);

    let pid = bpm.new_page().unwrap().page_id();
    {
        let mut guard = bpm.fetch_page_write(pid).unwrap();
        guard.data_mut()[10] = 99;
    }

    // A later clean unpin must not clear the dirty bit: push the page out
    // and verify the write reached disk
    {
        let _guard = bpm.fetch_page_read(pid).unwrap();
    }
    for _ in 0..4 {
        let pid2 = bpm.new_page().unwrap().page_id();
        let _g = bpm.fetch_page_write(pid2).unwrap();
    }

    let mut image = [0u8; PAGE_SIZE];
    bpm.disk_manager().read_page(pid, &mut image).unwrap();
    assert_eq!(image[10], 99);
}

#[test]
fn test_flush_page_clears_dirty() {
    let (bpm, _temp) = create_bpm(4, 2);

    let pid = bpm.new_page().unwrap().page_id();
    {
        let mut guard = bpm.fetch_page_write(pid).unwrap();
        guard.data_mut()[0] = 1;
    }

    let writes_before = bpm.disk_manager().num_writes();
    assert!(bpm.flush_page(pid).unwrap());
    assert_eq!(bpm.disk_manager().num_writes(), writes_before + 1);

    // Evicting a flushed (clean) page issues no further write
    for _ in 0..4 {
        let pid2 = bpm.new_page().unwrap().page_id();
        let _g = bpm.fetch_page_write(pid2).unwrap();
    }
    assert_eq!(bpm.get_pin_count(pid), None);
    assert_eq!(bpm.disk_manager().num_writes(), writes_before + 1);
}

#[test]
fn test_flush_unknown_page() {
    let (bpm, _temp) = create_bpm(2, 2);
    assert!(!bpm.flush_page(PageId::new(1234)).unwrap());
}

#[test]
fn test_delete_page_returns_frame() {
    let (bpm, _temp) = create_bpm(2, 2);

    let pid = bpm.new_page().unwrap().page_id();
    assert_eq!(bpm.free_frame_count(), 1);

    assert!(bpm.delete_page(pid).unwrap());
    assert_eq!(bpm.free_frame_count(), 2);
    assert_eq!(bpm.get_pin_count(pid), None);
}

#[test]
fn test_buffer_pool_conservation() {
    let (bpm, _temp) = create_bpm(5, 2);

    let mut pids = Vec::new();
    for _ in 0..5 {
        pids.push(bpm.new_page().unwrap().page_id());
    }
    // resident pages + free frames always add up to the pool size
    assert_eq!(bpm.free_frame_count(), 0);

    bpm.delete_page(pids[0]).unwrap();
    bpm.delete_page(pids[1]).unwrap();
    assert_eq!(bpm.free_frame_count(), 2);
}

#[test]
fn test_concurrent_fetches_share_one_frame() {
    use std::thread;

    let (bpm, _temp) = create_bpm(8, 2);
    let bpm = Arc::new(bpm);

    let pid = bpm.new_page().unwrap().page_id();
    {
        let mut guard = bpm.fetch_page_write(pid).unwrap();
        guard.data_mut()[0] = 7;
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let bpm = Arc::clone(&bpm);
            thread::spawn(move || {
                for _ in 0..100 {
                    let guard = bpm.fetch_page_read(pid).unwrap();
                    assert_eq!(guard.data()[0], 7);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(bpm.get_pin_count(pid), Some(0));
}
