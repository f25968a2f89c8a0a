use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::BufferPoolManager;
use crate::common::{PageId, RecordId, Result, StratumError};
use crate::storage::page::{TablePage, TablePageRef, TupleMeta};

/// A heap of tuples stored in a singly-linked chain of table pages.
///
/// Appends go to the tail page; a full tail grows the chain by one page.
/// Tuples are addressed by RecordId and never move, so the per-tuple
/// deletion flag can be flipped in place by transaction rollback.
pub struct TableHeap {
    bpm: Arc<BufferPoolManager>,
    first_page_id: PageId,
    /// Tail of the page chain; the mutex serializes appends
    last_page_id: Mutex<PageId>,
}

impl TableHeap {
    pub fn new(bpm: Arc<BufferPoolManager>) -> Result<Self> {
        let first_page_id = {
            let basic = bpm.new_page()?;
            let pid = basic.page_id();
            let mut guard = bpm.fetch_page_write(pid)?;
            TablePage::new(guard.data_mut()).init();
            pid
        };

        Ok(Self {
            bpm,
            first_page_id,
            last_page_id: Mutex::new(first_page_id),
        })
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    /// Appends a tuple and returns its address.
    pub fn insert_tuple(&self, tuple: &[u8]) -> Result<RecordId> {
        let mut last = self.last_page_id.lock();

        {
            let mut guard = self.bpm.fetch_page_write(*last)?;
            let mut page = TablePage::new(guard.data_mut());
            if let Some(slot) = page.insert_tuple(tuple) {
                return Ok(RecordId::new(*last, slot));
            }
        }

        // tail is full: chain a fresh page
        let new_pid = {
            let basic = self.bpm.new_page()?;
            let pid = basic.page_id();
            let mut guard = self.bpm.fetch_page_write(pid)?;
            TablePage::new(guard.data_mut()).init();
            pid
        };
        {
            let mut guard = self.bpm.fetch_page_write(*last)?;
            TablePage::new(guard.data_mut()).set_next_page_id(new_pid);
        }
        *last = new_pid;

        let mut guard = self.bpm.fetch_page_write(new_pid)?;
        let mut page = TablePage::new(guard.data_mut());
        let slot = page
            .insert_tuple(tuple)
            .ok_or(StratumError::TupleTooLarge(tuple.len()))?;
        Ok(RecordId::new(new_pid, slot))
    }

    /// Reads a tuple and its metadata.
    pub fn get_tuple(&self, rid: RecordId) -> Result<(TupleMeta, Vec<u8>)> {
        let guard = self.bpm.fetch_page_read(rid.page_id)?;
        let page = TablePageRef::new(guard.data());
        let meta = page
            .tuple_meta(rid.slot_id)
            .ok_or(StratumError::TupleNotFound(rid))?;
        let data = page
            .tuple(rid.slot_id)
            .ok_or(StratumError::TupleNotFound(rid))?
            .to_vec();
        Ok((meta, data))
    }

    pub fn tuple_meta(&self, rid: RecordId) -> Result<TupleMeta> {
        let guard = self.bpm.fetch_page_read(rid.page_id)?;
        TablePageRef::new(guard.data())
            .tuple_meta(rid.slot_id)
            .ok_or(StratumError::TupleNotFound(rid))
    }

    pub fn set_tuple_meta(&self, rid: RecordId, meta: TupleMeta) -> Result<()> {
        let mut guard = self.bpm.fetch_page_write(rid.page_id)?;
        TablePage::new(guard.data_mut()).set_tuple_meta(rid.slot_id, meta)
    }
}
