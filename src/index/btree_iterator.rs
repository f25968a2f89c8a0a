use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{RecordId, Result, INVALID_PAGE_ID};

use super::btree_page::BTreeNodeRef;
use super::key_comparator::IndexKey;

/// Forward iterator over the tree's leaf chain.
///
/// Holds the read latch (and pin) of exactly one leaf at a time. Stepping
/// off the end of a leaf releases it before the next leaf is fetched, so an
/// iterator never waits on a latch while holding one.
pub struct BPlusTreeIterator {
    bpm: Arc<BufferPoolManager>,
    leaf: Option<ReadPageGuard>,
    index: usize,
}

impl BPlusTreeIterator {
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager>,
        leaf: ReadPageGuard,
        index: usize,
    ) -> Result<Self> {
        let mut iter = Self {
            bpm,
            leaf: Some(leaf),
            index,
        };
        iter.skip_exhausted()?;
        Ok(iter)
    }

    /// The end sentinel: no leaf, index zero.
    pub(crate) fn end(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            leaf: None,
            index: 0,
        }
    }

    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }

    /// The entry under the cursor, None at end.
    pub fn current(&self) -> Option<(IndexKey, RecordId)> {
        let guard = self.leaf.as_ref()?;
        let node = BTreeNodeRef::new(guard.data());
        debug_assert!(self.index < node.size());
        Some((node.key_at(self.index), node.value_at(self.index)))
    }

    /// Steps to the next entry, hopping leaves through their next pointers.
    pub fn advance(&mut self) -> Result<()> {
        if self.leaf.is_none() {
            return Ok(());
        }
        self.index += 1;
        self.skip_exhausted()
    }

    /// Moves to the next leaf while the cursor sits past the current leaf's
    /// last entry. Drops the held guard before fetching the next one.
    fn skip_exhausted(&mut self) -> Result<()> {
        loop {
            let Some(guard) = self.leaf.as_ref() else {
                return Ok(());
            };
            let (size, next) = {
                let node = BTreeNodeRef::new(guard.data());
                (node.size(), node.next_page_id())
            };
            if self.index < size {
                return Ok(());
            }
            self.leaf = None;
            self.index = 0;
            if next == INVALID_PAGE_ID {
                return Ok(());
            }
            self.leaf = Some(self.bpm.fetch_page_read(next)?);
        }
    }
}

impl Iterator for BPlusTreeIterator {
    type Item = Result<(IndexKey, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.current()?;
        match self.advance() {
            Ok(()) => Some(Ok(item)),
            Err(e) => {
                self.leaf = None;
                Some(Err(e))
            }
        }
    }
}
