use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::common::{FrameId, PageId, Result, StratumError, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::{BasicPageGuard, FrameHeader, LruKReplacer, ReadPageGuard, WritePageGuard};

/// Mappings guarded by the pool latch.
struct PoolState {
    /// Page table: maps resident page IDs to frame IDs
    page_table: HashMap<PageId, FrameId>,
    /// Frames holding no live page
    free_list: VecDeque<FrameId>,
}

/// State shared between the manager and its page guards.
pub(crate) struct PoolCore {
    frames: Vec<Arc<FrameHeader>>,
    replacer: LruKReplacer,
    disk_scheduler: DiskScheduler,
    state: Mutex<PoolState>,
}

impl PoolCore {
    /// Drops one pin on a frame, folding the caller's dirty flag in and
    /// handing the frame to the replacer when the last pin goes away.
    /// Runs under the pool latch so the evictable flip cannot interleave
    /// with a concurrent fetch of the same page.
    pub(crate) fn unpin_frame(&self, frame_id: FrameId, is_dirty: bool) {
        let _state = self.state.lock();
        let frame = &self.frames[frame_id.as_usize()];
        if is_dirty {
            frame.set_dirty(true);
        }
        if let Some(0) = frame.unpin() {
            self.replacer.set_evictable(frame_id, true);
        }
    }
}

/// BufferPoolManager caches disk pages in a fixed set of in-memory frames.
/// It hands out RAII page guards that pin their frame for their lifetime,
/// tracks dirty pages, and evicts with an LRU-K policy, writing dirty
/// victims back to disk before their frame is reused.
pub struct BufferPoolManager {
    pool_size: usize,
    core: Arc<PoolCore>,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager with `pool_size` frames and an LRU-K
    /// replacer with the given k.
    pub fn new(pool_size: usize, replacer_k: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::new();

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let core = Arc::new(PoolCore {
            frames,
            replacer: LruKReplacer::new(replacer_k, pool_size),
            disk_scheduler: DiskScheduler::new(disk_manager),
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
            }),
        });

        Self { pool_size, core }
    }

    /// Allocates a new page and pins it in a frame. The returned guard keeps
    /// the page resident; latch it with fetch_page_read/fetch_page_write.
    /// Fails with PoolExhausted when every frame is pinned.
    pub fn new_page(&self) -> Result<BasicPageGuard> {
        let page_id = self.core.disk_scheduler.disk_manager().allocate_page()?;

        let mut state = self.core.state.lock();
        let frame_id = self.acquire_frame(&mut state)?;

        let frame = &self.core.frames[frame_id.as_usize()];
        frame.reset();
        frame.set_page_id(page_id);
        frame.pin();

        state.page_table.insert(page_id, frame_id);
        self.core.replacer.record_access(frame_id);
        self.core.replacer.set_evictable(frame_id, false);
        drop(state);

        trace!("new page {page_id} in {frame_id}");
        Ok(BasicPageGuard::new(
            page_id,
            Arc::clone(frame),
            Arc::clone(&self.core),
        ))
    }

    /// Pins a page without latching it.
    pub fn fetch_page_basic(&self, page_id: PageId) -> Result<BasicPageGuard> {
        let frame = self.fetch_frame(page_id)?;
        Ok(BasicPageGuard::new(
            page_id,
            frame,
            Arc::clone(&self.core),
        ))
    }

    /// Pins a page and takes its read latch.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        let frame = self.fetch_frame(page_id)?;
        Ok(ReadPageGuard::new(page_id, frame, Arc::clone(&self.core)))
    }

    /// Pins a page and takes its write latch.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        let frame = self.fetch_frame(page_id)?;
        Ok(WritePageGuard::new(page_id, frame, Arc::clone(&self.core)))
    }

    /// Drops one pin on a page. Returns false if the page is not resident or
    /// was not pinned. The dirty flag only ever ORs in; it is cleared by
    /// flushes and eviction alone.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let state = self.core.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return false;
        };
        let frame = &self.core.frames[frame_id.as_usize()];

        match frame.unpin() {
            None => false,
            Some(remaining) => {
                if is_dirty {
                    frame.set_dirty(true);
                }
                if remaining == 0 {
                    self.core.replacer.set_evictable(frame_id, true);
                }
                true
            }
        }
    }

    /// Writes a page back to disk and clears its dirty flag. The page stays
    /// resident. Returns false for pages not in the pool.
    ///
    /// The frame is pinned under the pool latch, then copied and written
    /// without it, so waiting out a writer's page latch never happens while
    /// the pool latch is held.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Err(StratumError::InvalidPageId(page_id));
        }

        let frame = {
            let state = self.core.state.lock();
            let Some(&frame_id) = state.page_table.get(&page_id) else {
                return Ok(false);
            };
            let frame = &self.core.frames[frame_id.as_usize()];
            frame.pin();
            self.core.replacer.set_evictable(frame_id, false);
            Arc::clone(frame)
        };

        let mut data = [0u8; PAGE_SIZE];
        frame.copy_to(&mut data);
        let result = self.core.disk_scheduler.write_sync(page_id, &data);
        if result.is_ok() {
            frame.set_dirty(false);
        }
        self.core.unpin_frame(frame.frame_id(), false);

        result.map(|_| true)
    }

    /// Flushes every resident page. The (page, frame) snapshot is taken with
    /// the pool latch held and every snapshotted frame is pinned, so no
    /// frame can be evicted out from under its flush; the writes themselves
    /// run without the latch.
    pub fn flush_all_pages(&self) -> Result<()> {
        let snapshot: Vec<(PageId, FrameId)> = {
            let state = self.core.state.lock();
            state
                .page_table
                .iter()
                .map(|(&page_id, &frame_id)| {
                    let frame = &self.core.frames[frame_id.as_usize()];
                    frame.pin();
                    self.core.replacer.set_evictable(frame_id, false);
                    (page_id, frame_id)
                })
                .collect()
        };

        let mut result = Ok(());
        for &(page_id, frame_id) in &snapshot {
            if result.is_ok() {
                let frame = &self.core.frames[frame_id.as_usize()];
                if frame.is_dirty() {
                    let mut data = [0u8; PAGE_SIZE];
                    frame.copy_to(&mut data);
                    result = self.core.disk_scheduler.write_sync(page_id, &data);
                    if result.is_ok() {
                        frame.set_dirty(false);
                    }
                }
            }
            self.core.unpin_frame(frame_id, false);
        }
        result
    }

    /// Removes a page from the pool and deallocates its ID. Refuses pinned
    /// pages; dirty contents are written back first.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut state = self.core.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        let frame = &self.core.frames[frame_id.as_usize()];

        if frame.pin_count() > 0 {
            return Err(StratumError::PageStillPinned(page_id));
        }

        self.core.replacer.remove(frame_id);
        state.page_table.remove(&page_id);

        if frame.is_dirty() {
            let mut data = [0u8; PAGE_SIZE];
            frame.copy_to(&mut data);
            self.core.disk_scheduler.write_sync(page_id, &data)?;
        }

        frame.reset();
        state.free_list.push_back(frame_id);
        self.core
            .disk_scheduler
            .disk_manager()
            .deallocate_page(page_id)?;

        debug!("deleted page {page_id}");
        Ok(true)
    }

    /// Returns the pin count of a resident page.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.core.state.lock();
        state
            .page_table
            .get(&page_id)
            .map(|&frame_id| self.core.frames[frame_id.as_usize()].pin_count())
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn free_frame_count(&self) -> usize {
        self.core.state.lock().free_list.len()
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.core.disk_scheduler.disk_manager()
    }

    /// Looks up (or loads) the page and returns its pinned frame.
    fn fetch_frame(&self, page_id: PageId) -> Result<Arc<FrameHeader>> {
        if page_id == INVALID_PAGE_ID {
            return Err(StratumError::InvalidPageId(page_id));
        }

        let mut state = self.core.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let frame = &self.core.frames[frame_id.as_usize()];
            frame.pin();
            self.core.replacer.record_access(frame_id);
            self.core.replacer.set_evictable(frame_id, false);
            return Ok(Arc::clone(frame));
        }

        let frame_id = self.acquire_frame(&mut state)?;
        let frame = &self.core.frames[frame_id.as_usize()];

        let mut data = [0u8; PAGE_SIZE];
        self.core.disk_scheduler.read_sync(page_id, &mut data)?;
        frame.copy_from(&data);
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.pin();

        state.page_table.insert(page_id, frame_id);
        self.core.replacer.record_access(frame_id);
        self.core.replacer.set_evictable(frame_id, false);

        Ok(Arc::clone(frame))
    }

    /// Takes a frame from the free list, or evicts one. Dirty victims are
    /// written back before the frame is handed out. Runs entirely under the
    /// pool latch, so nobody can re-fetch the victim's page id mid-eviction.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = self.core.replacer.evict() else {
            return Err(StratumError::PoolExhausted);
        };

        let frame = &self.core.frames[frame_id.as_usize()];
        let old_page_id = frame.page_id();
        debug_assert_eq!(frame.pin_count(), 0, "evicted a pinned frame");

        if frame.is_dirty() {
            debug!("evicting dirty page {old_page_id} from {frame_id}");
            let mut data = [0u8; PAGE_SIZE];
            frame.copy_to(&mut data);
            self.core.disk_scheduler.write_sync(old_page_id, &data)?;
        }

        state.page_table.remove(&old_page_id);
        frame.reset();

        Ok(frame_id)
    }
}
