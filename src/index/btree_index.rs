use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::buffer::{BufferPoolManager, ReadPageGuard, WritePageGuard};
use crate::common::{PageId, RecordId, Result, StrataError, INVALID_PAGE_ID};

use super::btree_page::{
    HeaderView, HeaderViewMut, InternalView, InternalViewMut, LeafView, LeafViewMut, NodeView,
};
use super::btree_iterator::BPlusTreeIterator;
use super::KeyComparator;

/// Per-operation scratch state for write crabbing: the guards held from the
/// root (header page included) down to the current node. Clearing the set
/// releases every ancestor latch at once.
struct Context {
    write_set: Vec<WritePageGuard>,
    /// Root page id as of operation start
    root_page_id: PageId,
}

impl Context {
    fn is_root(&self, page_id: PageId) -> bool {
        self.root_page_id == page_id
    }
}

/// A concurrent B+Tree index over fixed-size keys of `K` bytes and
/// `RecordId` values. Nodes are buffer-pool pages; readers couple read
/// latches down the tree, writers crab with write latches, releasing
/// ancestors as soon as a node is safe for the operation.
///
/// Keys are unique; ordering is delegated to the comparator.
pub struct BPlusTree<const K: usize> {
    name: String,
    header_page_id: PageId,
    bpm: Arc<BufferPoolManager>,
    comparator: Arc<dyn KeyComparator>,
    /// Stored leaf capacity: the advertised maximum plus one overflow slot
    leaf_max_size: usize,
    /// Stored internal capacity, same convention
    internal_max_size: usize,
}

impl<const K: usize> BPlusTree<K> {
    /// Creates a tree over the given header page, resetting it to empty.
    /// `leaf_max_size` / `internal_max_size` are the steady-state capacities
    /// a node may hold between operations.
    pub fn new(
        name: impl Into<String>,
        header_page_id: PageId,
        bpm: Arc<BufferPoolManager>,
        comparator: Arc<dyn KeyComparator>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        let tree = Self::open(
            name,
            header_page_id,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
        );

        let mut header_guard = tree.bpm.checked_write_page(header_page_id)?;
        HeaderViewMut::new(header_guard.data_mut()).set_root_page_id(INVALID_PAGE_ID);
        drop(header_guard);

        Ok(tree)
    }

    /// Attaches to an existing tree without touching the header page.
    pub fn open(
        name: impl Into<String>,
        header_page_id: PageId,
        bpm: Arc<BufferPoolManager>,
        comparator: Arc<dyn KeyComparator>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        assert!(leaf_max_size >= 1, "leaf capacity must be at least 1");
        assert!(internal_max_size >= 2, "internal fanout must be at least 2");

        Self {
            name: name.into(),
            header_page_id,
            bpm,
            comparator,
            leaf_max_size: leaf_max_size + 1,
            internal_max_size: internal_max_size + 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.root_page_id()? == INVALID_PAGE_ID)
    }

    pub fn root_page_id(&self) -> Result<PageId> {
        let guard = self.bpm.checked_read_page(self.header_page_id)?;
        Ok(HeaderView::new(guard.data()).root_page_id())
    }

    /// Point lookup. Descends with coupled read latches: each ancestor is
    /// released as soon as its child is latched.
    pub fn get_value(&self, key: &[u8; K]) -> Result<Option<RecordId>> {
        let header_guard = self.bpm.checked_read_page(self.header_page_id)?;
        let mut page_id = HeaderView::new(header_guard.data()).root_page_id();
        let mut prev: ReadPageGuard = header_guard;

        loop {
            if page_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let guard = self.bpm.checked_read_page(page_id)?;
            drop(prev);

            if NodeView::new(guard.data()).is_leaf() {
                let leaf = LeafView::<K>::new(guard.data());
                let pos = leaf.lower_bound(key, &*self.comparator);
                if pos < leaf.size()
                    && self.comparator.compare(leaf.key_at(pos), key) == Ordering::Equal
                {
                    return Ok(Some(leaf.value_at(pos)));
                }
                return Ok(None);
            }

            let internal = InternalView::<K>::new(guard.data());
            let pos = internal.upper_bound(key, &*self.comparator);
            page_id = internal.child_at(pos - 1);
            prev = guard;
        }
    }

    /// Inserts a unique key. Returns false (without modifying the tree) if
    /// the key is already present.
    pub fn insert(&self, key: &[u8; K], value: RecordId) -> Result<bool> {
        let mut header_guard = self.bpm.checked_write_page(self.header_page_id)?;
        let root_page_id = HeaderView::new(header_guard.data()).root_page_id();

        if root_page_id == INVALID_PAGE_ID {
            let root_guard = self.bpm.new_page()?;
            let root_page_id = root_guard.page_id();
            let mut root_guard = root_guard.upgrade_write();

            let mut leaf = LeafViewMut::<K>::new(root_guard.data_mut());
            leaf.init(self.leaf_max_size);
            leaf.insert_at(0, key, value);

            HeaderViewMut::new(header_guard.data_mut()).set_root_page_id(root_page_id);
            debug!(tree = %self.name, root = %root_page_id, "started new tree");
            return Ok(true);
        }

        let mut ctx = Context {
            write_set: vec![header_guard],
            root_page_id,
        };
        self.insert_recursive(root_page_id, &mut ctx, key, value)
    }

    /// Removes a key if present; removing an absent key is a no-op.
    pub fn remove(&self, key: &[u8; K]) -> Result<()> {
        let header_guard = self.bpm.checked_write_page(self.header_page_id)?;
        let root_page_id = HeaderView::new(header_guard.data()).root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut ctx = Context {
            write_set: vec![header_guard],
            root_page_id,
        };
        self.remove_recursive(root_page_id, &mut ctx, key)
    }

    /// Iterator over the whole tree, starting at the smallest key.
    pub fn begin(&self) -> Result<BPlusTreeIterator<K>> {
        let header_guard = self.bpm.checked_read_page(self.header_page_id)?;
        let mut page_id = HeaderView::new(header_guard.data()).root_page_id();
        if page_id == INVALID_PAGE_ID {
            return Ok(BPlusTreeIterator::at_end(Arc::clone(&self.bpm)));
        }

        let mut prev: ReadPageGuard = header_guard;
        loop {
            let guard = self.bpm.checked_read_page(page_id)?;
            drop(prev);

            if NodeView::new(guard.data()).is_leaf() {
                return Ok(BPlusTreeIterator::new(Arc::clone(&self.bpm), guard, 0));
            }
            page_id = InternalView::<K>::new(guard.data()).child_at(0);
            prev = guard;
        }
    }

    /// Iterator positioned at the first entry with key >= `key`.
    pub fn begin_at(&self, key: &[u8; K]) -> Result<BPlusTreeIterator<K>> {
        let header_guard = self.bpm.checked_read_page(self.header_page_id)?;
        let mut page_id = HeaderView::new(header_guard.data()).root_page_id();
        if page_id == INVALID_PAGE_ID {
            return Ok(BPlusTreeIterator::at_end(Arc::clone(&self.bpm)));
        }

        let mut prev: ReadPageGuard = header_guard;
        loop {
            let guard = self.bpm.checked_read_page(page_id)?;
            drop(prev);

            if NodeView::new(guard.data()).is_leaf() {
                let leaf = LeafView::<K>::new(guard.data());
                let pos = leaf.lower_bound(key, &*self.comparator);
                if pos == leaf.size() {
                    if let Some(next) = leaf.next_page_id() {
                        let next_guard = self.bpm.checked_read_page(next)?;
                        drop(guard);
                        return Ok(BPlusTreeIterator::new(
                            Arc::clone(&self.bpm),
                            next_guard,
                            0,
                        ));
                    }
                }
                return Ok(BPlusTreeIterator::new(Arc::clone(&self.bpm), guard, pos));
            }

            let internal = InternalView::<K>::new(guard.data());
            let pos = internal.upper_bound(key, &*self.comparator);
            page_id = internal.child_at(pos - 1);
            prev = guard;
        }
    }

    /// The past-the-end iterator: rightmost leaf, index at its size.
    pub fn end(&self) -> Result<BPlusTreeIterator<K>> {
        let header_guard = self.bpm.checked_read_page(self.header_page_id)?;
        let mut page_id = HeaderView::new(header_guard.data()).root_page_id();
        if page_id == INVALID_PAGE_ID {
            return Ok(BPlusTreeIterator::at_end(Arc::clone(&self.bpm)));
        }

        let mut prev: ReadPageGuard = header_guard;
        loop {
            let guard = self.bpm.checked_read_page(page_id)?;
            drop(prev);

            if NodeView::new(guard.data()).is_leaf() {
                let size = LeafView::<K>::new(guard.data()).size();
                return Ok(BPlusTreeIterator::new(Arc::clone(&self.bpm), guard, size));
            }
            let internal = InternalView::<K>::new(guard.data());
            page_id = internal.child_at(internal.size() - 1);
            prev = guard;
        }
    }

    fn insert_recursive(
        &self,
        page_id: PageId,
        ctx: &mut Context,
        key: &[u8; K],
        value: RecordId,
    ) -> Result<bool> {
        let mut cur = self.bpm.checked_write_page(page_id)?;

        let (is_leaf, size, max_size) = {
            let node = NodeView::new(cur.data());
            (node.is_leaf(), node.size(), node.max_size())
        };
        // Safe node: can absorb the entry without filling the overflow slot,
        // so no split can propagate past it. Release every ancestor.
        if size + 1 < max_size {
            ctx.write_set.clear();
        }

        let inserted = if is_leaf {
            let pos = {
                let leaf = LeafView::<K>::new(cur.data());
                let pos = leaf.upper_bound(key, &*self.comparator);
                if pos > 0
                    && self.comparator.compare(leaf.key_at(pos - 1), key) == Ordering::Equal
                {
                    return Ok(false);
                }
                pos
            };
            LeafViewMut::<K>::new(cur.data_mut()).insert_at(pos, key, value);
            true
        } else {
            let child = {
                let internal = InternalView::<K>::new(cur.data());
                let pos = internal.upper_bound(key, &*self.comparator);
                internal.child_at(pos - 1)
            };
            ctx.write_set.push(cur);
            let inserted = self.insert_recursive(child, ctx, key, value)?;
            cur = match ctx.write_set.pop() {
                Some(guard) => guard,
                // A safe descendant released us; no split reaches this level.
                None => return Ok(inserted),
            };
            inserted
        };

        if !inserted {
            return Ok(false);
        }

        let node = NodeView::new(cur.data());
        if node.size() < node.max_size() {
            return Ok(true);
        }

        self.split_node(page_id, &mut cur, ctx)?;
        Ok(true)
    }

    /// Splits the full node `cur`, wiring the new sibling into the parent
    /// (or a new root). All pages the split needs are allocated before any
    /// existing page is mutated.
    fn split_node(
        &self,
        page_id: PageId,
        cur: &mut WritePageGuard,
        ctx: &mut Context,
    ) -> Result<()> {
        let is_leaf = NodeView::new(cur.data()).is_leaf();

        let sibling_guard = self.bpm.new_page()?;
        let sibling_page_id = sibling_guard.page_id();
        let mut sibling = sibling_guard.upgrade_write();

        let new_root = if ctx.is_root(page_id) {
            let guard = self.bpm.new_page()?;
            let root_page_id = guard.page_id();
            Some((root_page_id, guard.upgrade_write()))
        } else {
            None
        };

        let mut separator = [0u8; K];
        if is_leaf {
            let mut right = LeafViewMut::<K>::new(sibling.data_mut());
            right.init(self.leaf_max_size);
            let mut left = LeafViewMut::<K>::new(cur.data_mut());
            left.split_into(&mut right, sibling_page_id);
            separator.copy_from_slice(right.key_at(0));
        } else {
            let mut right = InternalViewMut::<K>::new(sibling.data_mut());
            right.init(self.internal_max_size);
            let mut left = InternalViewMut::<K>::new(cur.data_mut());
            left.split_into(&mut right);
            separator.copy_from_slice(right.key_at(0));
        }

        debug!(
            tree = %self.name,
            page = %page_id,
            sibling = %sibling_page_id,
            "split node"
        );

        match new_root {
            Some((root_page_id, mut root_guard)) => {
                let mut root = InternalViewMut::<K>::new(root_guard.data_mut());
                root.init(self.internal_max_size);
                root.push_back(&[0u8; K], page_id);
                root.push_back(&separator, sibling_page_id);

                let header = ctx
                    .write_set
                    .last_mut()
                    .expect("header guard held across root split");
                HeaderViewMut::new(header.data_mut()).set_root_page_id(root_page_id);
                debug!(tree = %self.name, root = %root_page_id, "grew new root");
            }
            None => {
                let parent = ctx
                    .write_set
                    .last_mut()
                    .expect("parent guard held across split");
                let pos =
                    InternalView::<K>::new(parent.data()).upper_bound(&separator, &*self.comparator);
                InternalViewMut::<K>::new(parent.data_mut()).insert_at(
                    pos,
                    &separator,
                    sibling_page_id,
                );
            }
        }
        Ok(())
    }

    fn remove_recursive(&self, page_id: PageId, ctx: &mut Context, key: &[u8; K]) -> Result<()> {
        let mut cur = self.bpm.checked_write_page(page_id)?;

        let (is_leaf, size, min_size) = {
            let node = NodeView::new(cur.data());
            (node.is_leaf(), node.size(), node.min_size())
        };
        let is_root = ctx.is_root(page_id);

        // Safe node: losing one entry cannot make it underfull (for the
        // root: cannot force a collapse). Release every ancestor.
        let safe = if is_root {
            if is_leaf {
                size > 1
            } else {
                size > 2
            }
        } else {
            size > min_size
        };
        if safe {
            ctx.write_set.clear();
        }

        if is_leaf {
            let pos = {
                let leaf = LeafView::<K>::new(cur.data());
                let pos = leaf.lower_bound(key, &*self.comparator);
                if pos >= leaf.size()
                    || self.comparator.compare(leaf.key_at(pos), key) != Ordering::Equal
                {
                    return Ok(());
                }
                pos
            };
            LeafViewMut::<K>::new(cur.data_mut()).remove_at(pos);
            let size = size - 1;

            if is_root {
                if size == 0 {
                    let header = ctx
                        .write_set
                        .last_mut()
                        .expect("header guard held while emptying the root");
                    HeaderViewMut::new(header.data_mut()).set_root_page_id(INVALID_PAGE_ID);
                    debug!(tree = %self.name, "tree emptied");
                    drop(cur);
                    self.free_page(page_id)?;
                }
                return Ok(());
            }
            if size >= min_size {
                return Ok(());
            }
            self.rebalance_leaf(page_id, cur, ctx, key)
        } else {
            let child = {
                let internal = InternalView::<K>::new(cur.data());
                let pos = internal.upper_bound(key, &*self.comparator);
                internal.child_at(pos - 1)
            };
            ctx.write_set.push(cur);
            self.remove_recursive(child, ctx, key)?;
            cur = match ctx.write_set.pop() {
                Some(guard) => guard,
                // A safe descendant released us; nothing to fix up here.
                None => return Ok(()),
            };

            let size = NodeView::new(cur.data()).size();
            if is_root {
                if size < 2 {
                    // The root has a single child left; that child is the
                    // new root.
                    let only_child = InternalView::<K>::new(cur.data()).child_at(0);
                    let header = ctx
                        .write_set
                        .last_mut()
                        .expect("header guard held across root collapse");
                    HeaderViewMut::new(header.data_mut()).set_root_page_id(only_child);
                    debug!(tree = %self.name, root = %only_child, "root collapsed");
                    drop(cur);
                    self.free_page(page_id)?;
                }
                return Ok(());
            }
            if size >= min_size {
                return Ok(());
            }
            self.rebalance_internal(page_id, cur, ctx, key)
        }
    }

    /// Fixes up an underfull leaf: borrow from a sibling if one can spare
    /// entries, else merge. Merges always fold the right page into the left
    /// one so the leaf chain never needs a predecessor update.
    fn rebalance_leaf(
        &self,
        page_id: PageId,
        mut cur: WritePageGuard,
        ctx: &mut Context,
        key: &[u8; K],
    ) -> Result<()> {
        let parent = ctx
            .write_set
            .last_mut()
            .expect("parent guard held for leaf rebalance");
        // Route by the search key: the removed key belonged to this child's
        // range, so it finds the same slot even if the leaf is now empty.
        let (child_pos, parent_size) = {
            let view = InternalView::<K>::new(parent.data());
            let pos = view.upper_bound(key, &*self.comparator) - 1;
            debug_assert_eq!(view.child_at(pos), page_id);
            (pos, view.size())
        };

        let (size, min_size) = {
            let node = NodeView::new(cur.data());
            (node.size(), node.min_size())
        };
        let deficit = min_size - size;

        if child_pos > 0 {
            let left_id = InternalView::<K>::new(parent.data()).child_at(child_pos - 1);
            let mut left_guard = self.bpm.checked_write_page(left_id)?;
            let left_size = NodeView::new(left_guard.data()).size();

            if left_size >= min_size + deficit {
                let moved: Vec<([u8; K], RecordId)> = {
                    let left = LeafView::<K>::new(left_guard.data());
                    (left_size - deficit..left_size)
                        .map(|i| (left.key_at(i).try_into().unwrap(), left.value_at(i)))
                        .collect()
                };
                LeafViewMut::<K>::new(left_guard.data_mut()).set_size(left_size - deficit);
                {
                    let mut leaf = LeafViewMut::<K>::new(cur.data_mut());
                    for (i, (k, v)) in moved.iter().enumerate() {
                        leaf.insert_at(i, k, *v);
                    }
                }
                let first: [u8; K] = LeafView::<K>::new(cur.data()).key_at(0).try_into().unwrap();
                InternalViewMut::<K>::new(parent.data_mut()).set_key_at(child_pos, &first);
                return Ok(());
            }
        }

        if child_pos + 1 < parent_size {
            let right_id = InternalView::<K>::new(parent.data()).child_at(child_pos + 1);
            let mut right_guard = self.bpm.checked_write_page(right_id)?;
            let right_size = NodeView::new(right_guard.data()).size();

            if right_size >= min_size + deficit {
                let moved: Vec<([u8; K], RecordId)> = {
                    let right = LeafView::<K>::new(right_guard.data());
                    (0..deficit)
                        .map(|i| (right.key_at(i).try_into().unwrap(), right.value_at(i)))
                        .collect()
                };
                LeafViewMut::<K>::new(right_guard.data_mut()).remove_prefix(deficit);
                {
                    let mut leaf = LeafViewMut::<K>::new(cur.data_mut());
                    for (k, v) in &moved {
                        leaf.push_back(k, *v);
                    }
                }
                let new_separator: [u8; K] = LeafView::<K>::new(right_guard.data())
                    .key_at(0)
                    .try_into()
                    .unwrap();
                InternalViewMut::<K>::new(parent.data_mut())
                    .set_key_at(child_pos + 1, &new_separator);
                return Ok(());
            }
        }

        if child_pos > 0 {
            // Fold this leaf into its left sibling and free it.
            let left_id = InternalView::<K>::new(parent.data()).child_at(child_pos - 1);
            let mut left_guard = self.bpm.checked_write_page(left_id)?;
            {
                let source = LeafView::<K>::new(cur.data());
                let mut left = LeafViewMut::<K>::new(left_guard.data_mut());
                for i in 0..source.size() {
                    left.push_back(source.key_at(i), source.value_at(i));
                }
                left.set_next_page_id(source.next_page_id());
            }
            InternalViewMut::<K>::new(parent.data_mut()).remove_at(child_pos);
            debug!(tree = %self.name, page = %page_id, into = %left_id, "merged leaf left");
            drop(left_guard);
            drop(cur);
            self.free_page(page_id)
        } else {
            // Leftmost child: absorb the right sibling and free it instead,
            // keeping this leaf reachable from its (unknown) predecessor.
            let right_id = InternalView::<K>::new(parent.data()).child_at(child_pos + 1);
            let mut right_guard = self.bpm.checked_write_page(right_id)?;
            {
                let source = LeafView::<K>::new(right_guard.data());
                let mut leaf = LeafViewMut::<K>::new(cur.data_mut());
                for i in 0..source.size() {
                    leaf.push_back(source.key_at(i), source.value_at(i));
                }
                leaf.set_next_page_id(source.next_page_id());
            }
            InternalViewMut::<K>::new(parent.data_mut()).remove_at(child_pos + 1);
            debug!(tree = %self.name, page = %right_id, into = %page_id, "absorbed right leaf");
            drop(right_guard);
            drop(cur);
            self.free_page(right_id)
        }
    }

    /// Internal-node counterpart of `rebalance_leaf`. Separator movement
    /// follows the subtree-bound invariant: whenever a slot-0 entry gains a
    /// predecessor its key is materialized from the parent separator, and
    /// the parent separator is refreshed to the new slot-0 subtree's lower
    /// bound.
    fn rebalance_internal(
        &self,
        page_id: PageId,
        mut cur: WritePageGuard,
        ctx: &mut Context,
        key: &[u8; K],
    ) -> Result<()> {
        let parent = ctx
            .write_set
            .last_mut()
            .expect("parent guard held for internal rebalance");
        let (child_pos, parent_size) = {
            let view = InternalView::<K>::new(parent.data());
            let pos = view.upper_bound(key, &*self.comparator) - 1;
            debug_assert_eq!(view.child_at(pos), page_id);
            (pos, view.size())
        };

        let (size, min_size) = {
            let node = NodeView::new(cur.data());
            (node.size(), node.min_size())
        };
        let deficit = min_size - size;

        if child_pos > 0 {
            let left_id = InternalView::<K>::new(parent.data()).child_at(child_pos - 1);
            let mut left_guard = self.bpm.checked_write_page(left_id)?;
            let left_size = NodeView::new(left_guard.data()).size();

            if left_size >= min_size + deficit {
                let moved: Vec<([u8; K], PageId)> = {
                    let left = InternalView::<K>::new(left_guard.data());
                    (left_size - deficit..left_size)
                        .map(|i| (left.key_at(i).try_into().unwrap(), left.child_at(i)))
                        .collect()
                };
                let old_separator: [u8; K] = InternalView::<K>::new(parent.data())
                    .key_at(child_pos)
                    .try_into()
                    .unwrap();

                InternalViewMut::<K>::new(left_guard.data_mut()).set_size(left_size - deficit);
                {
                    let mut node = InternalViewMut::<K>::new(cur.data_mut());
                    for (i, (k, c)) in moved.iter().enumerate() {
                        node.insert_at(i, k, *c);
                    }
                    // The old sentinel now sits at `deficit`; its subtree's
                    // lower bound is the old parent separator.
                    node.set_key_at(deficit, &old_separator);
                }
                InternalViewMut::<K>::new(parent.data_mut()).set_key_at(child_pos, &moved[0].0);
                return Ok(());
            }
        }

        if child_pos + 1 < parent_size {
            let right_id = InternalView::<K>::new(parent.data()).child_at(child_pos + 1);
            let mut right_guard = self.bpm.checked_write_page(right_id)?;
            let right_size = NodeView::new(right_guard.data()).size();

            if right_size >= min_size + deficit {
                let old_separator: [u8; K] = InternalView::<K>::new(parent.data())
                    .key_at(child_pos + 1)
                    .try_into()
                    .unwrap();
                let (moved, new_separator) = {
                    let right = InternalView::<K>::new(right_guard.data());
                    let moved: Vec<([u8; K], PageId)> = (0..deficit)
                        .map(|i| (right.key_at(i).try_into().unwrap(), right.child_at(i)))
                        .collect();
                    let new_separator: [u8; K] = right.key_at(deficit).try_into().unwrap();
                    (moved, new_separator)
                };
                InternalViewMut::<K>::new(right_guard.data_mut()).remove_prefix(deficit);

                let base = InternalView::<K>::new(cur.data()).size();
                {
                    let mut node = InternalViewMut::<K>::new(cur.data_mut());
                    for (i, (k, c)) in moved.iter().enumerate() {
                        node.insert_at(base + i, k, *c);
                    }
                    // The first appended entry was the sibling's sentinel;
                    // its subtree starts at the old separator.
                    node.set_key_at(base, &old_separator);
                }
                InternalViewMut::<K>::new(parent.data_mut())
                    .set_key_at(child_pos + 1, &new_separator);
                return Ok(());
            }
        }

        if child_pos > 0 {
            // Fold this node into its left sibling and free it.
            let left_id = InternalView::<K>::new(parent.data()).child_at(child_pos - 1);
            let mut left_guard = self.bpm.checked_write_page(left_id)?;
            let separator: [u8; K] = InternalView::<K>::new(parent.data())
                .key_at(child_pos)
                .try_into()
                .unwrap();

            InternalViewMut::<K>::new(cur.data_mut()).set_key_at(0, &separator);
            {
                let source = InternalView::<K>::new(cur.data());
                let mut left = InternalViewMut::<K>::new(left_guard.data_mut());
                for i in 0..source.size() {
                    left.push_back(source.key_at(i), source.child_at(i));
                }
            }
            InternalViewMut::<K>::new(parent.data_mut()).remove_at(child_pos);
            debug!(tree = %self.name, page = %page_id, into = %left_id, "merged internal left");
            drop(left_guard);
            drop(cur);
            self.free_page(page_id)
        } else {
            // Leftmost child: absorb the right sibling.
            let right_id = InternalView::<K>::new(parent.data()).child_at(child_pos + 1);
            let mut right_guard = self.bpm.checked_write_page(right_id)?;
            let separator: [u8; K] = InternalView::<K>::new(parent.data())
                .key_at(child_pos + 1)
                .try_into()
                .unwrap();

            InternalViewMut::<K>::new(right_guard.data_mut()).set_key_at(0, &separator);
            {
                let source = InternalView::<K>::new(right_guard.data());
                let mut node = InternalViewMut::<K>::new(cur.data_mut());
                for i in 0..source.size() {
                    node.push_back(source.key_at(i), source.child_at(i));
                }
            }
            InternalViewMut::<K>::new(parent.data_mut()).remove_at(child_pos + 1);
            debug!(tree = %self.name, page = %right_id, into = %page_id, "absorbed right internal");
            drop(right_guard);
            drop(cur);
            self.free_page(right_id)
        }
    }

    /// Deletes a page that just left the tree, retrying while a racing
    /// iterator still holds a transient pin on it.
    fn free_page(&self, page_id: PageId) -> Result<()> {
        while !self.bpm.delete_page(page_id)? {
            std::hint::spin_loop();
        }
        Ok(())
    }

    /// Walks the whole tree and checks its structural invariants: equal
    /// leaf depth, occupancy bounds, in-node ordering, separator/subtree
    /// agreement, and leaf-chain ordering. Debugging aid for tests.
    pub fn verify_integrity(&self) -> Result<()> {
        let header_guard = self.bpm.checked_read_page(self.header_page_id)?;
        let root_page_id = HeaderView::new(header_guard.data()).root_page_id();
        drop(header_guard);

        if root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut leaf_depth = None;
        self.check_subtree(root_page_id, 0, None, None, &mut leaf_depth, true)?;

        let mut prev_key: Option<[u8; K]> = None;
        for entry in self.begin()? {
            let (key, _) = entry?;
            if let Some(prev) = prev_key {
                if self.comparator.compare(&prev, &key) != Ordering::Less {
                    return Err(StrataError::IndexCorrupted(
                        "leaf chain keys not strictly ascending".to_string(),
                    ));
                }
            }
            prev_key = Some(key);
        }
        Ok(())
    }

    /// Checks one subtree and returns the smallest key it contains.
    fn check_subtree(
        &self,
        page_id: PageId,
        depth: usize,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        leaf_depth: &mut Option<usize>,
        is_root: bool,
    ) -> Result<[u8; K]> {
        let corrupted = |msg: &str| StrataError::IndexCorrupted(format!("{}: {}", page_id, msg));

        let guard = self.bpm.checked_read_page(page_id)?;
        let node = NodeView::new(guard.data());
        let size = node.size();
        let in_bounds = |key: &[u8]| {
            lower.map_or(true, |lo| {
                self.comparator.compare(key, lo) != Ordering::Less
            }) && upper.map_or(true, |hi| {
                self.comparator.compare(key, hi) == Ordering::Less
            })
        };

        if node.is_leaf() {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Err(corrupted("leaves at unequal depth"))
                }
                _ => {}
            }
            if size == 0 {
                return Err(corrupted("empty leaf"));
            }
            if !is_root && (size < node.min_size() || size > node.max_size() - 1) {
                return Err(corrupted("leaf occupancy out of bounds"));
            }

            let leaf = LeafView::<K>::new(guard.data());
            for i in 0..size {
                if i > 0
                    && self.comparator.compare(leaf.key_at(i - 1), leaf.key_at(i))
                        != Ordering::Less
                {
                    return Err(corrupted("leaf keys not strictly ascending"));
                }
                if !in_bounds(leaf.key_at(i)) {
                    return Err(corrupted("leaf key outside subtree bounds"));
                }
            }
            return Ok(leaf.key_at(0).try_into().unwrap());
        }

        if is_root {
            if size < 2 {
                return Err(corrupted("internal root with fewer than 2 children"));
            }
        } else if size < node.min_size() || size > node.max_size() - 1 {
            return Err(corrupted("internal occupancy out of bounds"));
        }

        let internal = InternalView::<K>::new(guard.data());
        for i in 2..size {
            if self
                .comparator
                .compare(internal.key_at(i - 1), internal.key_at(i))
                != Ordering::Less
            {
                return Err(corrupted("internal keys not strictly ascending"));
            }
        }

        let mut smallest: Option<[u8; K]> = None;
        for i in 0..size {
            if i >= 1 && !in_bounds(internal.key_at(i)) {
                return Err(corrupted("separator outside subtree bounds"));
            }
            let child_lower = if i == 0 { lower } else { Some(internal.key_at(i)) };
            let child_upper = if i + 1 < size {
                Some(internal.key_at(i + 1))
            } else {
                upper
            };
            let child_first = self.check_subtree(
                internal.child_at(i),
                depth + 1,
                child_lower,
                child_upper,
                leaf_depth,
                false,
            )?;
            if i >= 1
                && self.comparator.compare(&child_first, internal.key_at(i)) != Ordering::Equal
            {
                return Err(corrupted("separator does not match child subtree's first key"));
            }
            if i == 0 {
                smallest = Some(child_first);
            }
        }
        Ok(smallest.expect("internal node has children"))
    }
}
