use std::cmp::Ordering;
use std::fmt::Write as _;
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::buffer::{BufferPoolManager, WritePageGuard};
use crate::common::{PageId, RecordId, Result, StratumError, INVALID_PAGE_ID};

use super::btree_iterator::BPlusTreeIterator;
use super::btree_page::{
    read_root_page_id, write_root_page_id, BTreeNode, BTreeNodeRef, INTERNAL_CAPACITY,
    LEAF_CAPACITY,
};
use super::key_comparator::{IndexKey, KeyComparator};

/// Latch context carried down a write descent: the still-held ancestor
/// guards, each with the index of that node in its parent.
type WriteSet = Vec<(WritePageGuard, usize)>;

/// A disk-resident B+ tree mapping u32 keys to record ids.
///
/// All node access goes through buffer-pool page guards. Readers couple read
/// latches hand over hand down the tree; writers hold a stack of write
/// latches that is trimmed as soon as a node is found that cannot split
/// (insert) or underflow (remove). A dedicated header page stores the root
/// page id; the in-memory mirror under the root-id latch serves lookups that
/// do not need the page itself.
pub struct BPlusTree {
    bpm: Arc<BufferPoolManager>,
    header_page_id: PageId,
    /// In-memory mirror of the header page's root pointer
    root_id: RwLock<PageId>,
    comparator: Box<dyn KeyComparator>,
    leaf_max_size: usize,
    internal_max_size: usize,
}

impl BPlusTree {
    /// Creates an empty tree, allocating its header page.
    pub fn new(
        bpm: Arc<BufferPoolManager>,
        comparator: Box<dyn KeyComparator>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        assert!((3..=LEAF_CAPACITY).contains(&leaf_max_size));
        assert!((3..=INTERNAL_CAPACITY).contains(&internal_max_size));

        let header = bpm.new_page()?;
        let header_page_id = header.page_id();
        {
            let mut guard = bpm.fetch_page_write(header_page_id)?;
            write_root_page_id(guard.data_mut(), INVALID_PAGE_ID);
        }
        drop(header);

        Ok(Self {
            bpm,
            header_page_id,
            root_id: RwLock::new(INVALID_PAGE_ID),
            comparator,
            leaf_max_size,
            internal_max_size,
        })
    }

    /// Re-opens a tree whose header page already exists.
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        header_page_id: PageId,
        comparator: Box<dyn KeyComparator>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        let root = {
            let guard = bpm.fetch_page_read(header_page_id)?;
            read_root_page_id(guard.data())
        };
        Ok(Self {
            bpm,
            header_page_id,
            root_id: RwLock::new(root),
            comparator,
            leaf_max_size,
            internal_max_size,
        })
    }

    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_id.read()
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    fn key_eq(&self, a: IndexKey, b: IndexKey) -> bool {
        self.comparator.compare(a, b) == Ordering::Equal
    }

    /// Hands a merged-away or abdicated page back to the pool. A concurrent
    /// scan may still hold a pin on it; the emptied page is then simply left
    /// behind, which is harmless because page ids are never reissued.
    fn discard_page(&self, page_id: PageId) -> Result<()> {
        match self.bpm.delete_page(page_id) {
            Err(StratumError::PageStillPinned(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// A node an insert cannot split: it still has room for one more entry.
    fn insert_safe(&self, node: &BTreeNodeRef<'_>) -> bool {
        if node.is_leaf() {
            node.size() < self.leaf_max_size
        } else {
            node.size() < self.internal_max_size
        }
    }

    /// A node a remove cannot underflow.
    fn delete_safe(&self, node: &BTreeNodeRef<'_>, is_root: bool) -> bool {
        if is_root {
            if node.is_leaf() {
                node.size() > 1
            } else {
                node.size() > 2
            }
        } else {
            node.size() > node.min_size()
        }
    }

    /// Point lookup. Read latches couple parent to child down to the leaf.
    pub fn get(&self, key: IndexKey) -> Result<Option<RecordId>> {
        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        let root = read_root_page_id(header.data());
        if root == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut guard = self.bpm.fetch_page_read(root)?;
        drop(header);

        loop {
            let child = {
                let node = BTreeNodeRef::new(guard.data());
                if node.is_leaf() {
                    let idx = node.lower_bound(key, &*self.comparator);
                    if idx < node.size() && self.key_eq(node.key_at(idx), key) {
                        return Ok(Some(node.value_at(idx)));
                    }
                    return Ok(None);
                }
                node.child_at(node.child_index_for(key, &*self.comparator))
            };
            // acquire the child before the parent guard is released
            guard = self.bpm.fetch_page_read(child)?;
        }
    }

    /// Inserts a key/value pair. Returns false if the key already exists.
    pub fn insert(&self, key: IndexKey, value: RecordId) -> Result<bool> {
        let mut header = Some(self.bpm.fetch_page_write(self.header_page_id)?);
        let root = read_root_page_id(header.as_ref().unwrap().data());

        if root == INVALID_PAGE_ID {
            let root_pid = {
                let basic = self.bpm.new_page()?;
                let root_pid = basic.page_id();
                let mut guard = self.bpm.fetch_page_write(root_pid)?;
                drop(basic);
                let mut node = BTreeNode::new(guard.data_mut());
                node.init_leaf(self.leaf_max_size);
                node.leaf_insert_at(0, key, value);
                root_pid
            };
            write_root_page_id(header.as_mut().unwrap().data_mut(), root_pid);
            *self.root_id.write() = root_pid;
            debug!("started tree at root {root_pid}");
            return Ok(true);
        }

        let mut write_set: WriteSet = Vec::new();
        let guard = self.bpm.fetch_page_write(root)?;
        if self.insert_safe(&BTreeNodeRef::new(guard.data())) {
            header = None;
        }
        write_set.push((guard, 0));

        loop {
            let (child_pid, child_idx) = {
                let (top, _) = write_set.last().unwrap();
                let node = BTreeNodeRef::new(top.data());
                if node.is_leaf() {
                    break;
                }
                let idx = node.child_index_for(key, &*self.comparator);
                (node.child_at(idx), idx)
            };
            let child = self.bpm.fetch_page_write(child_pid)?;
            if self.insert_safe(&BTreeNodeRef::new(child.data())) {
                write_set.clear();
                header = None;
            }
            write_set.push((child, child_idx));
        }

        let (mut leaf_guard, leaf_idx) = write_set.pop().unwrap();
        let insert_at = {
            let node = BTreeNodeRef::new(leaf_guard.data());
            let idx = node.lower_bound(key, &*self.comparator);
            if idx < node.size() && self.key_eq(node.key_at(idx), key) {
                return Ok(false);
            }
            idx
        };

        if BTreeNodeRef::new(leaf_guard.data()).size() < self.leaf_max_size {
            BTreeNode::new(leaf_guard.data_mut()).leaf_insert_at(insert_at, key, value);
            return Ok(true);
        }

        // full leaf: split, then thread the separator up the held ancestors
        let (mut sep, mut right_pid) = self.split_leaf(&mut leaf_guard, insert_at, key, value)?;
        let mut left_pid = leaf_guard.page_id();
        let mut child_idx = leaf_idx;
        drop(leaf_guard);

        loop {
            match write_set.pop() {
                None => {
                    // the split reached the root; grow the tree by one level
                    let new_root_pid = {
                        let basic = self.bpm.new_page()?;
                        let new_root_pid = basic.page_id();
                        let mut guard = self.bpm.fetch_page_write(new_root_pid)?;
                        drop(basic);
                        let mut node = BTreeNode::new(guard.data_mut());
                        node.init_internal(self.internal_max_size);
                        node.init_root(left_pid, sep, right_pid);
                        new_root_pid
                    };
                    let hdr = header
                        .as_mut()
                        .expect("header guard released although the root split");
                    write_root_page_id(hdr.data_mut(), new_root_pid);
                    *self.root_id.write() = new_root_pid;
                    debug!("root split, new root {new_root_pid}");
                    return Ok(true);
                }
                Some((mut parent_guard, parent_idx)) => {
                    if BTreeNodeRef::new(parent_guard.data()).size() < self.internal_max_size {
                        BTreeNode::new(parent_guard.data_mut()).internal_insert_at(
                            child_idx + 1,
                            sep,
                            right_pid,
                        );
                        return Ok(true);
                    }
                    let (new_sep, new_right) =
                        self.split_internal(&mut parent_guard, child_idx + 1, sep, right_pid)?;
                    left_pid = parent_guard.page_id();
                    sep = new_sep;
                    right_pid = new_right;
                    child_idx = parent_idx;
                }
            }
        }
    }

    /// Computes the split point for a full node of `size` entries receiving
    /// an insert at `index`. Returns where the right half starts and whether
    /// the new entry goes left; one branch decides both, so the bound and
    /// the side can never disagree.
    fn split_bound(index: usize, size: usize) -> (usize, bool) {
        if index <= (size - 1) / 2 {
            ((size - 1) / 2, true)
        } else {
            ((size + 1) / 2, false)
        }
    }

    fn split_leaf(
        &self,
        left_guard: &mut WritePageGuard,
        insert_at: usize,
        key: IndexKey,
        value: RecordId,
    ) -> Result<(IndexKey, PageId)> {
        let basic = self.bpm.new_page()?;
        let right_pid = basic.page_id();
        let mut right_guard = self.bpm.fetch_page_write(right_pid)?;
        drop(basic);

        let size = BTreeNodeRef::new(left_guard.data()).size();
        let (bound, insert_left) = Self::split_bound(insert_at, size);

        let mut left = BTreeNode::new(left_guard.data_mut());
        let mut right = BTreeNode::new(right_guard.data_mut());
        right.init_leaf(self.leaf_max_size);
        left.move_tail_to(&mut right, bound);

        if insert_left {
            left.leaf_insert_at(insert_at, key, value);
        } else {
            right.leaf_insert_at(insert_at - bound, key, value);
        }

        let old_next = left.as_ref().next_page_id();
        right.set_next_page_id(old_next);
        left.set_next_page_id(right_pid);

        Ok((right.as_ref().key_at(0), right_pid))
    }

    fn split_internal(
        &self,
        left_guard: &mut WritePageGuard,
        insert_at: usize,
        key: IndexKey,
        child: PageId,
    ) -> Result<(IndexKey, PageId)> {
        let basic = self.bpm.new_page()?;
        let right_pid = basic.page_id();
        let mut right_guard = self.bpm.fetch_page_write(right_pid)?;
        drop(basic);

        let size = BTreeNodeRef::new(left_guard.data()).size();
        let (bound, insert_left) = Self::split_bound(insert_at, size);

        let mut left = BTreeNode::new(left_guard.data_mut());
        let mut right = BTreeNode::new(right_guard.data_mut());
        right.init_internal(self.internal_max_size);
        left.move_tail_to(&mut right, bound);

        if insert_left {
            left.internal_insert_at(insert_at, key, child);
        } else {
            right.internal_insert_at(insert_at - bound, key, child);
        }

        // the right node's slot-0 key is the promoted separator; the slot
        // itself stays behind as the unused key of the leftmost child
        Ok((right.as_ref().key_at(0), right_pid))
    }

    /// Removes a key if present.
    pub fn remove(&self, key: IndexKey) -> Result<()> {
        let mut header = Some(self.bpm.fetch_page_write(self.header_page_id)?);
        let root = read_root_page_id(header.as_ref().unwrap().data());
        if root == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut write_set: WriteSet = Vec::new();
        let guard = self.bpm.fetch_page_write(root)?;
        if self.delete_safe(&BTreeNodeRef::new(guard.data()), true) {
            header = None;
        }
        write_set.push((guard, 0));

        loop {
            let (child_pid, child_idx) = {
                let (top, _) = write_set.last().unwrap();
                let node = BTreeNodeRef::new(top.data());
                if node.is_leaf() {
                    break;
                }
                let idx = node.child_index_for(key, &*self.comparator);
                (node.child_at(idx), idx)
            };
            let child = self.bpm.fetch_page_write(child_pid)?;
            if self.delete_safe(&BTreeNodeRef::new(child.data()), false) {
                write_set.clear();
                header = None;
            }
            write_set.push((child, child_idx));
        }

        let (mut leaf_guard, leaf_idx) = write_set.pop().unwrap();
        let is_root_leaf = leaf_guard.page_id() == root;

        {
            let node = BTreeNodeRef::new(leaf_guard.data());
            let idx = node.lower_bound(key, &*self.comparator);
            if idx >= node.size() || !self.key_eq(node.key_at(idx), key) {
                return Ok(());
            }
            BTreeNode::new(leaf_guard.data_mut()).leaf_remove_at(idx);
        }

        let size = BTreeNodeRef::new(leaf_guard.data()).size();
        if is_root_leaf {
            if size == 0 {
                let hdr = header
                    .as_mut()
                    .expect("header guard released although the root emptied");
                write_root_page_id(hdr.data_mut(), INVALID_PAGE_ID);
                *self.root_id.write() = INVALID_PAGE_ID;
                let pid = leaf_guard.page_id();
                drop(leaf_guard);
                self.discard_page(pid)?;
                debug!("tree emptied, root {pid} removed");
            }
            return Ok(());
        }
        if size >= (self.leaf_max_size + 1) / 2 {
            return Ok(());
        }

        self.fix_leaf_underflow(leaf_guard, leaf_idx, &mut write_set, &mut header, root)
    }

    /// Picks the right sibling (left when the node is the last child), then
    /// merges or redistributes, updating the parent's separator. A merge may
    /// underflow the parent, which continues in fix_internal_underflow.
    fn fix_leaf_underflow(
        &self,
        leaf_guard: WritePageGuard,
        leaf_idx: usize,
        write_set: &mut WriteSet,
        header: &mut Option<WritePageGuard>,
        root_pid: PageId,
    ) -> Result<()> {
        let (parent_guard, _) = write_set.last_mut().unwrap();
        let (sibling_pid, is_last) = {
            let parent = BTreeNodeRef::new(parent_guard.data());
            let is_last = leaf_idx == parent.size() - 1;
            let sibling_idx = if is_last { leaf_idx - 1 } else { leaf_idx + 1 };
            (parent.child_at(sibling_idx), is_last)
        };
        let right_idx = if is_last { leaf_idx } else { leaf_idx + 1 };

        let sibling_guard = self.bpm.fetch_page_write(sibling_pid)?;
        let (mut left_guard, mut right_guard) = if is_last {
            (sibling_guard, leaf_guard)
        } else {
            (leaf_guard, sibling_guard)
        };

        let left_size = BTreeNodeRef::new(left_guard.data()).size();
        let right_size = BTreeNodeRef::new(right_guard.data()).size();
        let total = left_size + right_size;

        if total <= self.leaf_max_size {
            // merge right into left and drop the separator from the parent
            {
                let mut left = BTreeNode::new(left_guard.data_mut());
                let mut right = BTreeNode::new(right_guard.data_mut());
                let next = right.as_ref().next_page_id();
                right.move_head_to_tail_of(&mut left, right_size);
                left.set_next_page_id(next);
            }
            {
                let (parent_guard, _) = write_set.last_mut().unwrap();
                BTreeNode::new(parent_guard.data_mut()).internal_remove_at(right_idx);
            }
            let right_pid = right_guard.page_id();
            drop(right_guard);
            drop(left_guard);
            self.discard_page(right_pid)?;
            self.fix_internal_underflow(write_set, header, root_pid)
        } else {
            let left_target = (total + 1) / 2;
            {
                let mut left = BTreeNode::new(left_guard.data_mut());
                let mut right = BTreeNode::new(right_guard.data_mut());
                if left_size > left_target {
                    left.move_tail_to_head_of(&mut right, left_size - left_target);
                } else {
                    right.move_head_to_tail_of(&mut left, left_target - left_size);
                }
            }
            let new_sep = BTreeNodeRef::new(right_guard.data()).key_at(0);
            let (parent_guard, _) = write_set.last_mut().unwrap();
            BTreeNode::new(parent_guard.data_mut()).set_key_at(right_idx, new_sep);
            Ok(())
        }
    }

    /// Walks merges up the held ancestors. Entered with the top of the write
    /// set having just lost one entry.
    fn fix_internal_underflow(
        &self,
        write_set: &mut WriteSet,
        header: &mut Option<WritePageGuard>,
        root_pid: PageId,
    ) -> Result<()> {
        loop {
            let (cur_guard, cur_idx) = write_set.pop().unwrap();
            let cur_size = BTreeNodeRef::new(cur_guard.data()).size();

            if cur_guard.page_id() == root_pid {
                if cur_size == 1 {
                    // a root with a single child abdicates to it
                    let new_root = BTreeNodeRef::new(cur_guard.data()).child_at(0);
                    let hdr = header
                        .as_mut()
                        .expect("header guard released although the root shrank");
                    write_root_page_id(hdr.data_mut(), new_root);
                    *self.root_id.write() = new_root;
                    let pid = cur_guard.page_id();
                    drop(cur_guard);
                    self.discard_page(pid)?;
                    debug!("root collapsed into {new_root}");
                }
                return Ok(());
            }

            if cur_size >= (self.internal_max_size + 1) / 2 {
                return Ok(());
            }

            let (parent_guard, _) = write_set.last_mut().unwrap();
            let (sibling_pid, is_last) = {
                let parent = BTreeNodeRef::new(parent_guard.data());
                let is_last = cur_idx == parent.size() - 1;
                let sibling_idx = if is_last { cur_idx - 1 } else { cur_idx + 1 };
                (parent.child_at(sibling_idx), is_last)
            };
            let right_idx = if is_last { cur_idx } else { cur_idx + 1 };

            let sibling_guard = self.bpm.fetch_page_write(sibling_pid)?;
            let (mut left_guard, mut right_guard) = if is_last {
                (sibling_guard, cur_guard)
            } else {
                (cur_guard, sibling_guard)
            };

            let left_size = BTreeNodeRef::new(left_guard.data()).size();
            let right_size = BTreeNodeRef::new(right_guard.data()).size();
            let total = left_size + right_size;

            let sep = {
                let (parent_guard, _) = write_set.last_mut().unwrap();
                BTreeNodeRef::new(parent_guard.data()).key_at(right_idx)
            };

            if total <= self.internal_max_size {
                // pull the separator down into the right node's unused
                // slot-0 key, then fold right into left
                {
                    let mut left = BTreeNode::new(left_guard.data_mut());
                    let mut right = BTreeNode::new(right_guard.data_mut());
                    right.set_key_at(0, sep);
                    right.move_head_to_tail_of(&mut left, right_size);
                }
                {
                    let (parent_guard, _) = write_set.last_mut().unwrap();
                    BTreeNode::new(parent_guard.data_mut()).internal_remove_at(right_idx);
                }
                let right_pid = right_guard.page_id();
                drop(right_guard);
                drop(left_guard);
                self.discard_page(right_pid)?;
                // the parent lost an entry; loop to check it
            } else {
                let left_target = (total + 1) / 2;
                {
                    let mut left = BTreeNode::new(left_guard.data_mut());
                    let mut right = BTreeNode::new(right_guard.data_mut());
                    right.set_key_at(0, sep);
                    if left_size > left_target {
                        left.move_tail_to_head_of(&mut right, left_size - left_target);
                    } else {
                        right.move_head_to_tail_of(&mut left, left_target - left_size);
                    }
                }
                let new_sep = BTreeNodeRef::new(right_guard.data()).key_at(0);
                let (parent_guard, _) = write_set.last_mut().unwrap();
                BTreeNode::new(parent_guard.data_mut()).set_key_at(right_idx, new_sep);
                return Ok(());
            }
        }
    }

    /// Iterator positioned at the smallest key.
    pub fn begin(&self) -> Result<BPlusTreeIterator> {
        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        let root = read_root_page_id(header.data());
        if root == INVALID_PAGE_ID {
            return Ok(BPlusTreeIterator::end(Arc::clone(&self.bpm)));
        }

        let mut guard = self.bpm.fetch_page_read(root)?;
        drop(header);

        loop {
            let child = {
                let node = BTreeNodeRef::new(guard.data());
                if node.is_leaf() {
                    None
                } else {
                    Some(node.child_at(0))
                }
            };
            match child {
                None => return BPlusTreeIterator::new(Arc::clone(&self.bpm), guard, 0),
                Some(pid) => guard = self.bpm.fetch_page_read(pid)?,
            }
        }
    }

    /// Iterator positioned at the first entry whose key is >= `key`.
    pub fn begin_at(&self, key: IndexKey) -> Result<BPlusTreeIterator> {
        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        let root = read_root_page_id(header.data());
        if root == INVALID_PAGE_ID {
            return Ok(BPlusTreeIterator::end(Arc::clone(&self.bpm)));
        }

        let mut guard = self.bpm.fetch_page_read(root)?;
        drop(header);

        loop {
            let step = {
                let node = BTreeNodeRef::new(guard.data());
                if node.is_leaf() {
                    None
                } else {
                    Some(node.child_at(node.child_index_for(key, &*self.comparator)))
                }
            };
            match step {
                None => {
                    let index = BTreeNodeRef::new(guard.data()).lower_bound(key, &*self.comparator);
                    return BPlusTreeIterator::new(Arc::clone(&self.bpm), guard, index);
                }
                Some(pid) => guard = self.bpm.fetch_page_read(pid)?,
            }
        }
    }

    /// The end sentinel.
    pub fn end(&self) -> BPlusTreeIterator {
        BPlusTreeIterator::end(Arc::clone(&self.bpm))
    }

    /// Renders the tree as an indented outline, one node per line.
    pub fn draw(&self) -> Result<String> {
        let root = self.root_page_id();
        if root == INVALID_PAGE_ID {
            return Ok("(empty)\n".to_string());
        }
        let mut out = String::new();
        self.draw_node(root, 0, &mut out)?;
        Ok(out)
    }

    fn draw_node(&self, page_id: PageId, depth: usize, out: &mut String) -> Result<()> {
        let (line, children) = {
            let guard = self.bpm.fetch_page_read(page_id)?;
            let node = BTreeNodeRef::new(guard.data());
            let mut line = String::new();
            if node.is_leaf() {
                write!(line, "leaf p{} [", page_id.as_u32()).unwrap();
                for i in 0..node.size() {
                    if i > 0 {
                        line.push(' ');
                    }
                    write!(line, "{}", node.key_at(i)).unwrap();
                }
                write!(line, "] -> p{}", node.next_page_id().as_u32()).unwrap();
                (line, Vec::new())
            } else {
                write!(line, "internal p{} [", page_id.as_u32()).unwrap();
                let mut children = Vec::with_capacity(node.size());
                for i in 0..node.size() {
                    if i > 0 {
                        write!(line, " {} ", node.key_at(i)).unwrap();
                    }
                    write!(line, "p{}", node.child_at(i).as_u32()).unwrap();
                    children.push(node.child_at(i));
                }
                line.push(']');
                (line, children)
            }
        };

        for _ in 0..depth {
            out.push_str("  ");
        }
        out.push_str(&line);
        out.push('\n');
        for child in children {
            self.draw_node(child, depth + 1, out)?;
        }
        Ok(())
    }

    /// Walks the whole tree checking ordering, occupancy, and leaf depth.
    /// Intended for tests and debugging.
    pub fn check_integrity(&self) -> Result<()> {
        let root = self.root_page_id();
        if root == INVALID_PAGE_ID {
            return Ok(());
        }
        self.check_node(root, None, None, true).map(|_| ())
    }

    /// Returns the depth of the subtree's leaves.
    fn check_node(
        &self,
        page_id: PageId,
        lower: Option<IndexKey>,
        upper: Option<IndexKey>,
        is_root: bool,
    ) -> Result<usize> {
        let corrupt = |msg: String| StratumError::IndexCorrupted(msg);

        let (keys, children, is_leaf, size, min_size) = {
            let guard = self.bpm.fetch_page_read(page_id)?;
            let node = BTreeNodeRef::new(guard.data());
            let keys: Vec<IndexKey> = (0..node.size()).map(|i| node.key_at(i)).collect();
            let children: Vec<PageId> = if node.is_leaf() {
                Vec::new()
            } else {
                (0..node.size()).map(|i| node.child_at(i)).collect()
            };
            (keys, children, node.is_leaf(), node.size(), node.min_size())
        };

        if is_root {
            if is_leaf && size == 0 {
                return Err(corrupt(format!("empty root leaf p{}", page_id.as_u32())));
            }
            if !is_leaf && size < 2 {
                return Err(corrupt(format!(
                    "root internal p{} with {size} children",
                    page_id.as_u32()
                )));
            }
        } else if size < min_size {
            return Err(corrupt(format!(
                "p{} below minimum occupancy: {size} < {min_size}",
                page_id.as_u32()
            )));
        }

        // slot 0 of an internal page carries no key
        let first_keyed = if is_leaf { 0 } else { 1 };
        for i in first_keyed..keys.len() {
            if i > first_keyed
                && self.comparator.compare(keys[i - 1], keys[i]) != Ordering::Less
            {
                return Err(corrupt(format!("p{} keys out of order", page_id.as_u32())));
            }
            if let Some(lo) = lower {
                if self.comparator.compare(keys[i], lo) == Ordering::Less {
                    return Err(corrupt(format!("p{} key below bound", page_id.as_u32())));
                }
            }
            if let Some(hi) = upper {
                if self.comparator.compare(keys[i], hi) != Ordering::Less {
                    return Err(corrupt(format!("p{} key above bound", page_id.as_u32())));
                }
            }
        }

        if is_leaf {
            return Ok(0);
        }

        let mut depth = None;
        for (i, &child) in children.iter().enumerate() {
            let child_lower = if i == 0 { lower } else { Some(keys[i]) };
            let child_upper = if i + 1 < keys.len() {
                Some(keys[i + 1])
            } else {
                upper
            };
            let d = self.check_node(child, child_lower, child_upper, false)?;
            match depth {
                None => depth = Some(d),
                Some(prev) if prev != d => {
                    return Err(corrupt(format!(
                        "uneven leaf depth under p{}",
                        page_id.as_u32()
                    )))
                }
                _ => {}
            }
        }
        Ok(depth.unwrap() + 1)
    }
}
