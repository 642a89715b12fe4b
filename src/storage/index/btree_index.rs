use log::{debug, trace};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::buffer::{
    AtomicPageId, BufferPoolManager, PageId, PageReadGuard, PageWriteGuard, INVALID_PAGE_ID,
};
use crate::config::BTreeConfig;
use crate::error::{VellumError, VellumResult};
use crate::storage::codec::{BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec};
use crate::storage::index::btree_iterator::TreeIndexIterator;
use crate::storage::index::IndexKey;
use crate::storage::page::{
    BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, BPlusTreePageType, CatalogPersistence,
    RecordId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeOp {
    Insert,
    Delete,
}

/// Per-operation traversal state: the still-latched ancestor chain (root
/// downward), the root mutex when this operation may move the root, and
/// pages to drop once every latch is released.
struct Context<'a> {
    root_guard: Option<MutexGuard<'a, ()>>,
    write_set: VecDeque<PageWriteGuard>,
    deleted_pages: Vec<PageId>,
}

impl<'a> Context<'a> {
    fn new(root_guard: MutexGuard<'a, ()>) -> Self {
        Self {
            root_guard: Some(root_guard),
            write_set: VecDeque::new(),
            deleted_pages: Vec::new(),
        }
    }

    /// The child below is safe; every retained ancestor latch (and the root
    /// mutex) can go. Guards drop front-to-back, i.e. root downward.
    fn release_ancestors(&mut self) {
        self.write_set.clear();
        self.root_guard = None;
    }
}

/// Clustered B+tree index from fixed-width keys to record ids, built on the
/// buffer pool.
///
/// Concurrency follows latch crabbing: every descent latches pages top-down
/// and releases ancestors as soon as the child is safe for the operation.
/// The root mutex additionally serializes operations that may change the
/// root page id; it travels in the operation's [`Context`] and is released
/// together with the ancestor chain.
pub struct BPlusTree<K: IndexKey> {
    index_name: String,
    buffer_pool: Arc<BufferPoolManager>,
    persistence: Arc<dyn CatalogPersistence>,
    leaf_max_size: u32,
    internal_max_size: u32,
    root_page_id: AtomicPageId,
    root_latch: Mutex<()>,
    _marker: std::marker::PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Open (or lazily create) the index named `index_name`. An existing
    /// root is picked up from the persistence layer.
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        persistence: Arc<dyn CatalogPersistence>,
        config: BTreeConfig,
    ) -> VellumResult<Self> {
        let index_name = index_name.into();
        let root_page_id = persistence
            .load_root(&index_name)?
            .unwrap_or(INVALID_PAGE_ID);
        Ok(Self {
            index_name,
            buffer_pool,
            persistence,
            leaf_max_size: config.leaf_max_size,
            internal_max_size: config.internal_max_size,
            root_page_id: AtomicPageId::new(root_page_id),
            root_latch: Mutex::new(()),
            _marker: std::marker::PhantomData,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPoolManager> {
        &self.buffer_pool
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    /// Point lookup. Descends with read latches, releasing each parent as
    /// soon as the child is latched.
    pub fn get_value(&self, key: &K) -> VellumResult<Option<RecordId>> {
        let root_guard = self.root_latch.lock();
        let root_id = self.root_page_id();
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.fetch_read(root_id)?;
        drop(root_guard);

        loop {
            match BPlusTreePageCodec::decode::<K>(guard.data())? {
                BPlusTreePage::Internal(node) => {
                    let child_id = node.lookup(key);
                    // Assigning releases the parent after the child latch is
                    // held, which is the read-crabbing invariant.
                    guard = self.fetch_read(child_id)?;
                }
                BPlusTreePage::Leaf(leaf) => return Ok(leaf.lookup(key)),
            }
        }
    }

    /// Insert a unique key. Returns false (and changes nothing) on a
    /// duplicate.
    pub fn insert(&self, key: &K, rid: RecordId) -> VellumResult<bool> {
        let mut context = Context::new(self.root_latch.lock());
        if self.is_empty() {
            self.start_new_tree(key, rid)?;
            return Ok(true);
        }

        let mut leaf_guard = self.find_leaf_write(key, TreeOp::Insert, &mut context)?;
        let mut leaf: BPlusTreeLeafPage<K> = BPlusTreeLeafPageCodec::decode(leaf_guard.data())?;

        if !leaf.insert(key.clone(), rid) {
            return Ok(false);
        }

        if leaf.is_full() {
            let mut new_leaf_guard = self.new_page()?;
            let new_leaf_id = new_leaf_guard.page_id();
            debug!(
                "split leaf {} into new leaf {}",
                leaf.header.page_id, new_leaf_id
            );

            let mut new_leaf = BPlusTreeLeafPage::<K>::new(
                new_leaf_id,
                leaf.header.parent_page_id,
                self.leaf_max_size,
            );
            let moved = leaf.split_off_upper_half();
            new_leaf.header.current_size = moved.len() as u32;
            new_leaf.array = moved;
            // Splice the new leaf into the chain.
            new_leaf.header.next_page_id = leaf.header.next_page_id;
            leaf.header.next_page_id = new_leaf_id;

            let separator = new_leaf.key_at(0).clone();
            leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf)?);
            new_leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&new_leaf)?);
            self.insert_into_parent(&mut context, leaf_guard, separator, new_leaf_guard)?;
        } else {
            leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf)?);
        }
        Ok(true)
    }

    /// Delete `key` if present; underflow triggers coalesce or
    /// redistribution, possibly collapsing the root.
    pub fn remove(&self, key: &K) -> VellumResult<()> {
        let mut context = Context::new(self.root_latch.lock());
        if self.is_empty() {
            return Ok(());
        }

        let mut leaf_guard = self.find_leaf_write(key, TreeOp::Delete, &mut context)?;
        let mut leaf: BPlusTreeLeafPage<K> = BPlusTreeLeafPageCodec::decode(leaf_guard.data())?;

        if !leaf.remove(key) {
            return Ok(());
        }

        let leaf_is_root = leaf.header.parent_page_id == INVALID_PAGE_ID;
        if leaf_is_root {
            if leaf.size() == 0 {
                // Last entry of the whole tree is gone.
                debug!("tree {} is now empty", self.index_name);
                context.deleted_pages.push(leaf.header.page_id);
                drop(leaf_guard);
                self.set_root(INVALID_PAGE_ID)?;
            } else {
                leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf)?);
            }
        } else if leaf.is_underflow() {
            self.handle_leaf_underflow(leaf_guard, leaf, &mut context)?;
        } else {
            leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf)?);
        }

        self.finish(context)
    }

    /// Iterator over the whole tree in ascending key order.
    pub fn iter(&self) -> VellumResult<TreeIndexIterator<K>> {
        let root_guard = self.root_latch.lock();
        if self.is_empty() {
            return Ok(TreeIndexIterator::exhausted(self.buffer_pool.clone()));
        }
        let guard = {
            let first = self.fetch_read(self.root_page_id())?;
            drop(root_guard);
            self.descend_read(first, |node| node.value_at(0))?
        };
        TreeIndexIterator::at_leaf_start(self.buffer_pool.clone(), guard)
    }

    /// Iterator positioned at the first entry >= `key`.
    pub fn iter_from(&self, key: &K) -> VellumResult<TreeIndexIterator<K>> {
        let root_guard = self.root_latch.lock();
        if self.is_empty() {
            return Ok(TreeIndexIterator::exhausted(self.buffer_pool.clone()));
        }
        let guard = {
            let first = self.fetch_read(self.root_page_id())?;
            drop(root_guard);
            self.descend_read(first, |node| node.lookup(key))?
        };
        TreeIndexIterator::at_key(self.buffer_pool.clone(), guard, key)
    }

    /// The past-the-last position: the terminus of the leaf chain with the
    /// cursor one past its final entry.
    pub fn end(&self) -> VellumResult<TreeIndexIterator<K>> {
        let root_guard = self.root_latch.lock();
        if self.is_empty() {
            return Ok(TreeIndexIterator::exhausted(self.buffer_pool.clone()));
        }
        let guard = {
            let first = self.fetch_read(self.root_page_id())?;
            drop(root_guard);
            self.descend_read(first, |node| node.value_at(0))?
        };
        TreeIndexIterator::at_chain_end(self.buffer_pool.clone(), guard)
    }

    fn start_new_tree(&self, key: &K, rid: RecordId) -> VellumResult<()> {
        let mut guard = self.new_page()?;
        let page_id = guard.page_id();
        let mut leaf = BPlusTreeLeafPage::<K>::new(page_id, INVALID_PAGE_ID, self.leaf_max_size);
        leaf.insert(key.clone(), rid);
        guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf)?);
        drop(guard);
        debug!("start new tree {} at root {}", self.index_name, page_id);
        self.set_root(page_id)
    }

    /// Descend to the leaf covering `key`, write-latching the path. A child
    /// that cannot split (insert) or cannot underflow (delete) is safe: all
    /// latches above it are released. Unsafe parents stay in the context.
    fn find_leaf_write<'a>(
        &self,
        key: &K,
        op: TreeOp,
        context: &mut Context<'a>,
    ) -> VellumResult<PageWriteGuard> {
        let mut guard = self.fetch_write(self.root_page_id())?;
        loop {
            let probe = BPlusTreePageCodec::probe(guard.data())?;
            if probe.page_type == BPlusTreePageType::LeafPage {
                return Ok(guard);
            }
            let node: BPlusTreeInternalPage<K> =
                BPlusTreeInternalPageCodec::decode(guard.data())?;
            let child_id = node.lookup(key);
            let child_guard = self.fetch_write(child_id)?;

            let child_probe = BPlusTreePageCodec::probe(child_guard.data())?;
            let child_safe = match op {
                TreeOp::Insert => child_probe.current_size < child_probe.max_size,
                TreeOp::Delete => child_probe.current_size > child_probe.min_size(),
            };
            if child_safe {
                context.release_ancestors();
            } else {
                context.write_set.push_back(guard);
            }
            guard = child_guard;
        }
    }

    /// Propagate a split upward: link `(separator, right)` into the parent
    /// of `left`, splitting parents as needed, growing a new root at the
    /// top. Consumes the child guards as their subtrees are finished.
    fn insert_into_parent<'a>(
        &self,
        context: &mut Context<'a>,
        mut left_guard: PageWriteGuard,
        mut separator: K,
        mut right_guard: PageWriteGuard,
    ) -> VellumResult<()> {
        loop {
            let left_id = left_guard.page_id();
            let right_id = right_guard.page_id();

            if context.write_set.is_empty() {
                // No retained ancestor: `left` is the root. The root mutex is
                // still held, because an unsafe root is never released early.
                debug_assert!(context.root_guard.is_some());
                let mut root_guard = self.new_page()?;
                let root_id = root_guard.page_id();
                let mut root = BPlusTreeInternalPage::<K>::new(
                    root_id,
                    INVALID_PAGE_ID,
                    self.internal_max_size,
                );
                root.populate_new_root(left_id, separator, right_id);
                root_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&root)?);
                drop(root_guard);

                Self::patch_parent(&mut left_guard, root_id)?;
                Self::patch_parent(&mut right_guard, root_id)?;
                drop(left_guard);
                drop(right_guard);

                debug!("grow new root {} for tree {}", root_id, self.index_name);
                return self.set_root(root_id);
            }

            let mut parent_guard = context
                .write_set
                .pop_back()
                .expect("non-root split must retain its parent");
            let parent_id = parent_guard.page_id();
            let mut parent: BPlusTreeInternalPage<K> =
                BPlusTreeInternalPageCodec::decode(parent_guard.data())?;

            parent.insert_node_after(left_id, separator, right_id);
            Self::patch_parent(&mut right_guard, parent_id)?;
            drop(left_guard);
            drop(right_guard);

            if parent.is_overfull() {
                let mut sibling_guard = self.new_page()?;
                let sibling_id = sibling_guard.page_id();
                debug!(
                    "split internal {} into new sibling {}",
                    parent_id, sibling_id
                );

                let mut sibling = BPlusTreeInternalPage::<K>::new(
                    sibling_id,
                    parent.header.parent_page_id,
                    self.internal_max_size,
                );
                let moved = parent.split_off_upper_half();
                for (_, child_id) in &moved {
                    self.reparent(*child_id, sibling_id)?;
                }
                sibling.header.current_size = moved.len() as u32;
                sibling.array = moved;

                // The moved half's first key travels up as the separator;
                // its slot in the sibling becomes the dummy.
                let next_separator = sibling.key_at(0).clone();
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent)?);
                sibling_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&sibling)?);

                left_guard = parent_guard;
                right_guard = sibling_guard;
                separator = next_separator;
                continue;
            }

            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent)?);
            return Ok(());
        }
    }

    /// Underflowed non-root leaf: either merge with a sibling (preferring
    /// the left) or shift one entry across the boundary.
    fn handle_leaf_underflow<'a>(
        &self,
        node_guard: PageWriteGuard,
        node: BPlusTreeLeafPage<K>,
        context: &mut Context<'a>,
    ) -> VellumResult<()> {
        let mut parent_guard = context
            .write_set
            .pop_back()
            .expect("underflowed non-root must retain its parent");
        let mut parent: BPlusTreeInternalPage<K> =
            BPlusTreeInternalPageCodec::decode(parent_guard.data())?;

        let node_id = node_guard.page_id();
        let node_index = parent.value_index(node_id).ok_or_else(|| {
            VellumError::Internal(format!(
                "leaf {} missing from its parent {}",
                node_id,
                parent_guard.page_id()
            ))
        })?;
        let sibling_index = if node_index == 0 { 1 } else { node_index - 1 };
        let sibling_id = parent.value_at(sibling_index);
        let mut sibling_guard = self.fetch_write(sibling_id)?;
        let mut sibling: BPlusTreeLeafPage<K> =
            BPlusTreeLeafPageCodec::decode(sibling_guard.data())?;

        if sibling.size() + node.size() <= node.header.max_size {
            // Coalesce: the right page of the pair merges into the left.
            let (mut left_guard, mut left, right_guard, right, right_index) = if node_index == 0 {
                (node_guard, node, sibling_guard, sibling, sibling_index)
            } else {
                (sibling_guard, sibling, node_guard, node, node_index)
            };
            debug!(
                "coalesce leaf {} into {}",
                right.header.page_id, left.header.page_id
            );
            context.deleted_pages.push(right.header.page_id);
            left.absorb_right(right);
            parent.remove_at(right_index);
            left_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&left)?);
            drop(left_guard);
            drop(right_guard);

            self.resolve_parent(parent_guard, parent, context)
        } else {
            // Redistribute exactly one entry toward the underfull node.
            if node_index == 0 {
                // Sibling is the right neighbor: its first entry moves over.
                let mut node = node;
                let (key, rid) = sibling.array.remove(0);
                sibling.header.current_size -= 1;
                node.array.push((key, rid));
                node.header.current_size += 1;
                parent.set_key_at(sibling_index, sibling.key_at(0).clone());

                let mut node_guard = node_guard;
                node_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&node)?);
                sibling_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&sibling)?);
            } else {
                // Sibling is the left neighbor: its last entry moves over.
                let mut node = node;
                let (key, rid) = sibling
                    .array
                    .pop()
                    .expect("redistribution source cannot be empty");
                sibling.header.current_size -= 1;
                node.array.insert(0, (key, rid));
                node.header.current_size += 1;
                parent.set_key_at(node_index, node.key_at(0).clone());

                let mut node_guard = node_guard;
                node_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&node)?);
                sibling_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&sibling)?);
            }
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent)?);
            Ok(())
        }
    }

    /// Underflowed non-root internal node; mirrors the leaf path but pulls
    /// the parent separator down and re-parents every moved child.
    fn handle_internal_underflow<'a>(
        &self,
        node_guard: PageWriteGuard,
        node: BPlusTreeInternalPage<K>,
        context: &mut Context<'a>,
    ) -> VellumResult<()> {
        let mut parent_guard = context
            .write_set
            .pop_back()
            .expect("underflowed non-root must retain its parent");
        let mut parent: BPlusTreeInternalPage<K> =
            BPlusTreeInternalPageCodec::decode(parent_guard.data())?;

        let node_id = node_guard.page_id();
        let node_index = parent.value_index(node_id).ok_or_else(|| {
            VellumError::Internal(format!(
                "internal {} missing from its parent {}",
                node_id,
                parent_guard.page_id()
            ))
        })?;
        let sibling_index = if node_index == 0 { 1 } else { node_index - 1 };
        let sibling_id = parent.value_at(sibling_index);
        let mut sibling_guard = self.fetch_write(sibling_id)?;
        let mut sibling: BPlusTreeInternalPage<K> =
            BPlusTreeInternalPageCodec::decode(sibling_guard.data())?;

        if sibling.size() + node.size() <= node.header.max_size {
            let (mut left_guard, mut left, right_guard, right, right_index) = if node_index == 0 {
                (node_guard, node, sibling_guard, sibling, sibling_index)
            } else {
                (sibling_guard, sibling, node_guard, node, node_index)
            };
            debug!(
                "coalesce internal {} into {}",
                right.header.page_id, left.header.page_id
            );
            let left_id = left.header.page_id;
            let middle_key = parent.key_at(right_index).clone();
            for (_, child_id) in &right.array {
                self.reparent(*child_id, left_id)?;
            }
            context.deleted_pages.push(right.header.page_id);
            left.absorb_right(right, middle_key);
            parent.remove_at(right_index);
            left_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&left)?);
            drop(left_guard);
            drop(right_guard);

            self.resolve_parent(parent_guard, parent, context)
        } else {
            let mut node = node;
            if node_index == 0 {
                // Borrow the right sibling's first child; the parent
                // separator comes down as its key and the sibling's next
                // key goes up.
                let (_, moved_child) = sibling.array.remove(0);
                sibling.header.current_size -= 1;
                let middle_key = parent.key_at(sibling_index).clone();
                node.array.push((middle_key, moved_child));
                node.header.current_size += 1;
                parent.set_key_at(sibling_index, sibling.key_at(0).clone());
                self.reparent(moved_child, node_id)?;
            } else {
                // Borrow the left sibling's last child; the parent separator
                // comes down onto the node's dummy slot.
                let (moved_key, moved_child) = sibling
                    .array
                    .pop()
                    .expect("redistribution source cannot be empty");
                sibling.header.current_size -= 1;
                let middle_key = parent.key_at(node_index).clone();
                node.set_key_at(0, middle_key);
                node.array.insert(0, (moved_key.clone(), moved_child));
                node.header.current_size += 1;
                parent.set_key_at(node_index, moved_key);
                self.reparent(moved_child, node_id)?;
            }

            let mut node_guard = node_guard;
            node_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&node)?);
            sibling_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&sibling)?);
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent)?);
            Ok(())
        }
    }

    /// After a child merge removed an entry from `parent`, decide whether
    /// the shrinkage propagates: adjust the root, recurse, or just persist.
    fn resolve_parent<'a>(
        &self,
        mut parent_guard: PageWriteGuard,
        parent: BPlusTreeInternalPage<K>,
        context: &mut Context<'a>,
    ) -> VellumResult<()> {
        if parent.header.parent_page_id == INVALID_PAGE_ID {
            return self.adjust_root(parent_guard, parent, context);
        }
        if parent.is_underflow() {
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent)?);
            return self.handle_internal_underflow(parent_guard, parent, context);
        }
        parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent)?);
        Ok(())
    }

    /// An internal root left with a single child promotes that child.
    fn adjust_root<'a>(
        &self,
        mut root_guard: PageWriteGuard,
        root: BPlusTreeInternalPage<K>,
        context: &mut Context<'a>,
    ) -> VellumResult<()> {
        if root.size() > 1 {
            root_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&root)?);
            return Ok(());
        }
        let new_root_id = root.only_child();
        debug!(
            "collapse root {} of tree {}, promote child {}",
            root.header.page_id, self.index_name, new_root_id
        );
        self.reparent(new_root_id, INVALID_PAGE_ID)?;
        context.deleted_pages.push(root.header.page_id);
        drop(root_guard);
        self.set_root(new_root_id)
    }

    /// Release every remaining latch, then drop the pages queued for
    /// deletion (a pinned page cannot be deleted).
    fn finish(&self, mut context: Context<'_>) -> VellumResult<()> {
        context.write_set.clear();
        context.root_guard = None;
        for page_id in context.deleted_pages.drain(..) {
            // A failed delete means a racing pin (e.g. an iterator mid-hop);
            // the page stays allocated but is unreachable from the tree.
            if !self.buffer_pool.delete_page(page_id)? {
                debug!("merged-away page {} still pinned, left allocated", page_id);
            }
        }
        Ok(())
    }

    /// Update a child's parent pointer through the buffer pool.
    fn reparent(&self, child_id: PageId, parent_id: PageId) -> VellumResult<()> {
        let mut guard = self.fetch_write(child_id)?;
        Self::patch_parent(&mut guard, parent_id)?;
        Ok(())
    }

    fn patch_parent(guard: &mut PageWriteGuard, parent_id: PageId) -> VellumResult<()> {
        BPlusTreePageCodec::write_parent_page_id(guard.data_mut(), parent_id)?;
        guard.mark_dirty();
        Ok(())
    }

    /// Read-crab downward choosing the child with `choose` at each internal
    /// node; returns the reached leaf's guard.
    fn descend_read<F>(&self, mut guard: PageReadGuard, choose: F) -> VellumResult<PageReadGuard>
    where
        F: Fn(&BPlusTreeInternalPage<K>) -> PageId,
    {
        loop {
            let probe = BPlusTreePageCodec::probe(guard.data())?;
            if probe.page_type == BPlusTreePageType::LeafPage {
                return Ok(guard);
            }
            let node: BPlusTreeInternalPage<K> =
                BPlusTreeInternalPageCodec::decode(guard.data())?;
            let child_id = choose(&node);
            guard = self.fetch_read(child_id)?;
        }
    }

    fn set_root(&self, page_id: PageId) -> VellumResult<()> {
        self.root_page_id.store(page_id, Ordering::SeqCst);
        self.persistence.save_root(&self.index_name, page_id)
    }

    fn fetch_read(&self, page_id: PageId) -> VellumResult<PageReadGuard> {
        trace!("tree {} fetch read page {}", self.index_name, page_id);
        self.buffer_pool.fetch_page_read(page_id)?.ok_or_else(|| {
            VellumError::Storage(format!(
                "no evictable frame while fetching page {}",
                page_id
            ))
        })
    }

    fn fetch_write(&self, page_id: PageId) -> VellumResult<PageWriteGuard> {
        trace!("tree {} fetch write page {}", self.index_name, page_id);
        self.buffer_pool.fetch_page_write(page_id)?.ok_or_else(|| {
            VellumError::Storage(format!(
                "no evictable frame while fetching page {}",
                page_id
            ))
        })
    }

    fn new_page(&self) -> VellumResult<PageWriteGuard> {
        self.buffer_pool.new_page()?.ok_or_else(|| {
            VellumError::OutOfMemory(
                "every buffer frame is pinned; cannot allocate a tree page".to_string(),
            )
        })
    }
}

impl<K: IndexKey> std::fmt::Debug for BPlusTree<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTree")
            .field("index_name", &self.index_name)
            .field("root_page_id", &self.root_page_id())
            .field("leaf_max_size", &self.leaf_max_size)
            .field("internal_max_size", &self.internal_max_size)
            .finish()
    }
}
