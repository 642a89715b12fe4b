use std::sync::Arc;

use crate::buffer::{BufferPoolManager, PageId, PageReadGuard, INVALID_PAGE_ID};
use crate::error::{VellumError, VellumResult};
use crate::storage::codec::BPlusTreeLeafPageCodec;
use crate::storage::index::IndexKey;
use crate::storage::page::{BPlusTreeLeafPage, RecordId};

struct IterPosition<K: IndexKey> {
    // The guard keeps the leaf pinned and read-latched between increments.
    guard: PageReadGuard,
    leaf: BPlusTreeLeafPage<K>,
    index: usize,
}

/// Cursor over the ordered leaf chain.
///
/// The end position is the terminal leaf with the index one past its last
/// entry (`next == INVALID && index == size`); dereferencing there is an
/// error. Advancing past a leaf releases it before fetching its successor,
/// so a blocked fetch never holds two leaf latches.
pub struct TreeIndexIterator<K: IndexKey> {
    buffer_pool: Arc<BufferPoolManager>,
    position: Option<IterPosition<K>>,
}

impl<K: IndexKey> TreeIndexIterator<K> {
    pub(crate) fn exhausted(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            position: None,
        }
    }

    pub(crate) fn at_leaf_start(
        buffer_pool: Arc<BufferPoolManager>,
        guard: PageReadGuard,
    ) -> VellumResult<Self> {
        let leaf = BPlusTreeLeafPageCodec::decode(guard.data())?;
        let mut iterator = Self {
            buffer_pool,
            position: Some(IterPosition {
                guard,
                leaf,
                index: 0,
            }),
        };
        iterator.skip_exhausted_leaves()?;
        Ok(iterator)
    }

    pub(crate) fn at_key(
        buffer_pool: Arc<BufferPoolManager>,
        guard: PageReadGuard,
        key: &K,
    ) -> VellumResult<Self> {
        let leaf: BPlusTreeLeafPage<K> = BPlusTreeLeafPageCodec::decode(guard.data())?;
        let index = leaf.key_index(key);
        let mut iterator = Self {
            buffer_pool,
            position: Some(IterPosition { guard, leaf, index }),
        };
        iterator.skip_exhausted_leaves()?;
        Ok(iterator)
    }

    pub(crate) fn at_chain_end(
        buffer_pool: Arc<BufferPoolManager>,
        guard: PageReadGuard,
    ) -> VellumResult<Self> {
        let mut guard = guard;
        let mut leaf: BPlusTreeLeafPage<K> = BPlusTreeLeafPageCodec::decode(guard.data())?;
        while leaf.header.next_page_id != INVALID_PAGE_ID {
            let next_id = leaf.header.next_page_id;
            drop(guard);
            guard = Self::fetch_leaf(&buffer_pool, next_id)?;
            leaf = BPlusTreeLeafPageCodec::decode(guard.data())?;
        }
        let index = leaf.size() as usize;
        Ok(Self {
            buffer_pool,
            position: Some(IterPosition { guard, leaf, index }),
        })
    }

    pub fn is_end(&self) -> bool {
        match &self.position {
            None => true,
            Some(p) => {
                p.leaf.header.next_page_id == INVALID_PAGE_ID && p.index == p.leaf.size() as usize
            }
        }
    }

    /// The entry under the cursor; `OutOfRange` at the end position.
    pub fn current(&self) -> VellumResult<(K, RecordId)> {
        if self.is_end() {
            return Err(VellumError::OutOfRange(
                "iterator dereferenced at end".to_string(),
            ));
        }
        let p = self.position.as_ref().expect("non-end position");
        let (key, rid) = p.leaf.item_at(p.index);
        Ok((key.clone(), *rid))
    }

    /// Yield the current entry and advance, `None` once the end is reached.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> VellumResult<Option<(K, RecordId)>> {
        if self.is_end() {
            return Ok(None);
        }
        let item = self.current()?;
        self.advance()?;
        Ok(Some(item))
    }

    /// Move one entry forward; a no-op at the end position.
    pub fn advance(&mut self) -> VellumResult<()> {
        if self.is_end() {
            return Ok(());
        }
        let p = self.position.as_mut().expect("non-end position");
        p.index += 1;
        self.skip_exhausted_leaves()
    }

    /// The current position as `(leaf page id, index)`, if any.
    pub fn position(&self) -> Option<(PageId, usize)> {
        self.position.as_ref().map(|p| (p.guard.page_id(), p.index))
    }

    /// A cursor parked past a leaf's last entry moves along the chain until
    /// it finds an entry or the terminus. The current leaf is released
    /// before its successor is fetched.
    fn skip_exhausted_leaves(&mut self) -> VellumResult<()> {
        loop {
            let Some(p) = self.position.as_ref() else {
                return Ok(());
            };
            if p.index < p.leaf.size() as usize
                || p.leaf.header.next_page_id == INVALID_PAGE_ID
            {
                return Ok(());
            }
            let next_id = p.leaf.header.next_page_id;
            self.position = None;
            let guard = Self::fetch_leaf(&self.buffer_pool, next_id)?;
            let leaf = BPlusTreeLeafPageCodec::decode(guard.data())?;
            self.position = Some(IterPosition {
                guard,
                leaf,
                index: 0,
            });
        }
    }

    fn fetch_leaf(
        buffer_pool: &Arc<BufferPoolManager>,
        page_id: PageId,
    ) -> VellumResult<PageReadGuard> {
        buffer_pool.fetch_page_read(page_id)?.ok_or_else(|| {
            VellumError::Storage(format!(
                "no evictable frame while fetching leaf {}",
                page_id
            ))
        })
    }
}

impl<K: IndexKey> PartialEq for TreeIndexIterator<K> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.position, &other.position) {
            (None, None) => true,
            (Some(a), Some(b)) => a.guard.page_id() == b.guard.page_id() && a.index == b.index,
            _ => false,
        }
    }
}

impl<K: IndexKey> std::fmt::Debug for TreeIndexIterator<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeIndexIterator")
            .field("position", &self.position())
            .field("is_end", &self.is_end())
            .finish()
    }
}
