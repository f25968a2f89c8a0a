use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, PAGE_SIZE};

use super::buffer_pool_manager::PoolCore;
use super::FrameHeader;

/// RAII guard holding a pin on a page without latching its data. Useful for
/// keeping a freshly allocated page resident while deciding how to use it.
pub struct BasicPageGuard {
    page_id: PageId,
    frame: Arc<FrameHeader>,
    core: Arc<PoolCore>,
}

impl BasicPageGuard {
    pub(crate) fn new(page_id: PageId, frame: Arc<FrameHeader>, core: Arc<PoolCore>) -> Self {
        Self {
            page_id,
            frame,
            core,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Drop for BasicPageGuard {
    fn drop(&mut self) {
        self.core.unpin_frame(self.frame.frame_id(), false);
    }
}

/// RAII guard for read-only access to a page. Holds the page's read latch
/// and a pin; both are released on drop, latch first.
pub struct ReadPageGuard {
    page_id: PageId,
    frame: Arc<FrameHeader>,
    core: Arc<PoolCore>,
    /// Read latch on the page bytes. The 'static lifetime is a lie the Arc
    /// makes true: the frame lives at least as long as this guard.
    data_guard: Option<RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl ReadPageGuard {
    pub(crate) fn new(page_id: PageId, frame: Arc<FrameHeader>, core: Arc<PoolCore>) -> Self {
        let data_guard = frame.data.read();
        let data_guard: RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>> =
            unsafe { std::mem::transmute(data_guard) };

        Self {
            page_id,
            frame,
            core,
            data_guard: Some(data_guard),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        self.data_guard.take();
        self.core.unpin_frame(self.frame.frame_id(), false);
    }
}

/// RAII guard for exclusive access to a page. Holds the page's write latch
/// and a pin. Writing through the guard marks the page dirty; on drop the
/// latch is released before the pin.
pub struct WritePageGuard {
    page_id: PageId,
    frame: Arc<FrameHeader>,
    core: Arc<PoolCore>,
    data_guard: Option<RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>>>,
    is_dirty: bool,
}

impl WritePageGuard {
    pub(crate) fn new(page_id: PageId, frame: Arc<FrameHeader>, core: Arc<PoolCore>) -> Self {
        let data_guard = frame.data.write();
        let data_guard: RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>> =
            unsafe { std::mem::transmute(data_guard) };

        Self {
            page_id,
            frame,
            core,
            data_guard: Some(data_guard),
            is_dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }

    /// Mutable view of the page bytes; marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.is_dirty = true;
        &mut self.data_guard.as_mut().unwrap()[..]
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

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        // Latch before pin: release the write latch, then give up the pin
        self.data_guard.take();
        self.core.unpin_frame(self.frame.frame_id(), self.is_dirty);
    }
}
