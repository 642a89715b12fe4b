use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::buffer::buffer_pool::{release_pin, PoolInner};
use crate::buffer::latch::RwLatch;

pub type PageId = u32;
pub type AtomicPageId = AtomicU32;
pub type FrameId = usize;

/// All-ones sentinel, the unsigned spelling of the on-disk `-1`.
pub const INVALID_PAGE_ID: PageId = PageId::MAX;
/// Page 0 persists the index-name to root-page-id records.
pub const HEADER_PAGE_ID: PageId = 0;
pub const PAGE_SIZE: usize = 4096;

/// One slot of the buffer pool: a 4 KiB buffer plus the metadata that tracks
/// which disk page currently lives in it.
///
/// The pin count witnesses ownership (a frame is evictable iff it reaches
/// zero); the latch arbitrates access to `data`. Metadata is atomic so guards
/// and the pool can read it without the pool mutex.
pub struct PageFrame {
    frame_id: FrameId,
    page_id: AtomicPageId,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
    pub(crate) latch: RwLatch,
    data: UnsafeCell<[u8; PAGE_SIZE]>,
}

// Data accesses go through the latch (guards) or require a pin count of
// zero (pool-internal load and eviction), so sharing frames across threads
// is sound.
unsafe impl Send for PageFrame {}
unsafe impl Sync for PageFrame {}

impl PageFrame {
    pub(crate) fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: AtomicPageId::new(INVALID_PAGE_ID),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            latch: RwLatch::new(),
            data: UnsafeCell::new([0; PAGE_SIZE]),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn page_id(&self) -> PageId {
        self.page_id.load(Ordering::SeqCst)
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id, Ordering::SeqCst);
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::SeqCst);
    }

    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn unpin(&self) -> u32 {
        let previous = self.pin_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "unpin below zero");
        previous - 1
    }

    pub(crate) fn reset_pin_count(&self, value: u32) {
        self.pin_count.store(value, Ordering::SeqCst);
    }

    /// # Safety
    /// The caller must hold the read or write latch, or otherwise guarantee
    /// no concurrent writer (e.g. the frame is unmapped with pin count 0).
    pub(crate) unsafe fn data_unchecked(&self) -> &[u8; PAGE_SIZE] {
        &*self.data.get()
    }

    /// # Safety
    /// The caller must hold the write latch, or the frame must be unmapped
    /// with pin count 0 while the pool mutex is held.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_unchecked_mut(&self) -> &mut [u8; PAGE_SIZE] {
        &mut *self.data.get()
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .finish()
    }
}

/// Shared (read-latched) pinned view of a page. Dropping it releases the
/// latch and then the pin, so forgetting to unpin is impossible. The guard
/// carries the pool bookkeeping it needs to mark the frame evictable.
pub struct PageReadGuard {
    pool: Arc<Mutex<PoolInner>>,
    frame: Arc<PageFrame>,
}

impl PageReadGuard {
    pub(crate) fn new(pool: Arc<Mutex<PoolInner>>, frame: Arc<PageFrame>) -> Self {
        Self { pool, frame }
    }

    pub fn page_id(&self) -> PageId {
        self.frame.page_id()
    }

    pub fn pin_count(&self) -> u32 {
        self.frame.pin_count()
    }

    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        // Invariant: this guard holds the read latch.
        unsafe { self.frame.data_unchecked() }
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        self.frame.latch.runlock();
        release_pin(&self.pool, &self.frame);
    }
}

impl fmt::Debug for PageReadGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageReadGuard")
            .field("page_id", &self.page_id())
            .finish()
    }
}

/// Exclusive (write-latched) pinned view of a page. `mark_dirty` records a
/// modification; the dirty flag is only ever OR'd in, never cleared here.
pub struct PageWriteGuard {
    pool: Arc<Mutex<PoolInner>>,
    frame: Arc<PageFrame>,
}

impl PageWriteGuard {
    pub(crate) fn new(pool: Arc<Mutex<PoolInner>>, frame: Arc<PageFrame>) -> Self {
        Self { pool, frame }
    }

    pub fn page_id(&self) -> PageId {
        self.frame.page_id()
    }

    pub fn pin_count(&self) -> u32 {
        self.frame.pin_count()
    }

    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        unsafe { self.frame.data_unchecked() }
    }

    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        // Invariant: this guard holds the write latch exclusively.
        unsafe { self.frame.data_unchecked_mut() }
    }

    pub fn mark_dirty(&mut self) {
        self.frame.set_dirty(true);
    }

    /// Replace the page image and flag the frame dirty.
    pub fn overwrite(&mut self, image: &[u8]) {
        debug_assert_eq!(image.len(), PAGE_SIZE);
        self.data_mut().copy_from_slice(image);
        self.mark_dirty();
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        self.frame.latch.wunlock();
        release_pin(&self.pool, &self.frame);
    }
}

impl fmt::Debug for PageWriteGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageWriteGuard")
            .field("page_id", &self.page_id())
            .finish()
    }
}
