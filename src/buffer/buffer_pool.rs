use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::buffer::page::{PageFrame, PageReadGuard, PageWriteGuard};
use crate::buffer::replacer::{ClockReplacer, Replacer};
use crate::buffer::{FrameId, PageId, INVALID_PAGE_ID};
use crate::error::VellumResult;
use crate::storage::disk_manager::DiskManager;

/// Bookkeeping shared by every operation: which page lives in which frame,
/// which frames are free, and which are eligible for eviction. A frame is on
/// at most one of {free list, replacer, pinned}. Page guards keep an `Arc`
/// of this so their drop can mark a frame evictable.
#[derive(Debug)]
pub(crate) struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: ClockReplacer,
}

/// Guard-drop path: release one pin; when the count reaches zero the frame
/// becomes evictable again.
pub(crate) fn release_pin(pool: &Mutex<PoolInner>, frame: &Arc<PageFrame>) {
    if frame.unpin() == 0 {
        let mut inner = pool.lock();
        // A racing fetch may have re-pinned between the decrement and the
        // mutex; the page table check also skips deleted frames.
        if frame.pin_count() == 0 {
            if let Some(&frame_id) = inner.page_table.get(&frame.page_id()) {
                if frame_id == frame.frame_id() {
                    inner.replacer.unpin(frame_id);
                }
            }
        }
    }
}

/// Fixed-size page cache over the disk manager.
///
/// One mutex serializes the bookkeeping; page I/O for loads and victim
/// write-back happens while holding it, which keeps fetch/evict transitions
/// atomic. Latches are only acquired after the mutex is released (a fetch
/// pins first, so the frame cannot move while the caller blocks on the
/// latch).
#[derive(Debug)]
pub struct BufferPoolManager {
    frames: Vec<Arc<PageFrame>>,
    inner: Arc<Mutex<PoolInner>>,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(num_frames: usize, disk_manager: Arc<DiskManager>) -> Self {
        let frames = (0..num_frames)
            .map(|frame_id| Arc::new(PageFrame::new(frame_id)))
            .collect();
        let free_list = (0..num_frames).collect();
        Self {
            frames,
            inner: Arc::new(Mutex::new(PoolInner {
                page_table: HashMap::with_capacity(num_frames),
                free_list,
                replacer: ClockReplacer::new(num_frames),
            })),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Pin `page_id` and take its read latch. `Ok(None)` when every frame is
    /// pinned and nothing can be evicted.
    pub fn fetch_page_read(&self, page_id: PageId) -> VellumResult<Option<PageReadGuard>> {
        let Some(frame) = self.pin_page(page_id)? else {
            return Ok(None);
        };
        frame.latch.rlock();
        Ok(Some(PageReadGuard::new(self.inner.clone(), frame)))
    }

    /// Pin `page_id` and take its write latch.
    pub fn fetch_page_write(&self, page_id: PageId) -> VellumResult<Option<PageWriteGuard>> {
        let Some(frame) = self.pin_page(page_id)? else {
            return Ok(None);
        };
        frame.latch.wlock();
        Ok(Some(PageWriteGuard::new(self.inner.clone(), frame)))
    }

    /// Allocate a fresh disk page into a zeroed frame, pinned and
    /// write-latched. `Ok(None)` when every frame is pinned.
    pub fn new_page(&self) -> VellumResult<Option<PageWriteGuard>> {
        let mut inner = self.inner.lock();
        let Some(frame_id) = self.acquire_frame(&mut inner)? else {
            return Ok(None);
        };
        let page_id = self.disk_manager.allocate_page();
        let frame = self.frames[frame_id].clone();

        // The frame is unmapped with pin count 0, so only a transient flush
        // reader could race the zeroing; the latch excludes it. The latch is
        // handed to the returned guard still held.
        frame.latch.wlock();
        unsafe { frame.data_unchecked_mut() }.fill(0);
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.reset_pin_count(1);

        inner.page_table.insert(page_id, frame_id);
        inner.replacer.pin(frame_id);
        trace!("new page {} in frame {}", page_id, frame_id);
        drop(inner);
        Ok(Some(PageWriteGuard::new(self.inner.clone(), frame)))
    }

    /// Write a resident page's current bytes to disk. Returns false for the
    /// invalid id or a non-resident page. The dirty flag is left set; only
    /// eviction and reuse clear it.
    pub fn flush_page(&self, page_id: PageId) -> VellumResult<bool> {
        if page_id == INVALID_PAGE_ID {
            return Ok(false);
        }
        let frame = {
            let inner = self.inner.lock();
            match inner.page_table.get(&page_id) {
                Some(&frame_id) => self.frames[frame_id].clone(),
                None => return Ok(false),
            }
        };

        // Snapshot under the read latch so a concurrent writer cannot tear
        // the copy; re-check ownership in case the frame was reused between
        // dropping the pool mutex and latching.
        frame.latch.rlock();
        let snapshot = if frame.page_id() == page_id {
            Some(*unsafe { frame.data_unchecked() })
        } else {
            None
        };
        frame.latch.runlock();

        match snapshot {
            Some(data) => {
                self.disk_manager.write_page(page_id, &data)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Flush every resident, unpinned, dirty page. Pinned dirty frames are
    /// left alone; their bytes reach disk on eviction or an explicit flush.
    pub fn flush_all_pages(&self) -> VellumResult<()> {
        let targets: Vec<PageId> = {
            let inner = self.inner.lock();
            inner
                .page_table
                .iter()
                .filter(|(_, &frame_id)| {
                    let frame = &self.frames[frame_id];
                    frame.pin_count() == 0 && frame.is_dirty()
                })
                .map(|(&page_id, _)| page_id)
                .collect()
        };
        for page_id in targets {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drop a page from the pool and deallocate it on disk. True when the
    /// page is absent; false when someone still pins it.
    pub fn delete_page(&self, page_id: PageId) -> VellumResult<bool> {
        let mut inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            self.disk_manager.deallocate_page(page_id);
            return Ok(true);
        };
        let frame = &self.frames[frame_id];
        if frame.pin_count() > 0 {
            return Ok(false);
        }
        inner.page_table.remove(&page_id);
        inner.replacer.pin(frame_id);
        frame.set_page_id(INVALID_PAGE_ID);
        frame.set_dirty(false);
        inner.free_list.push_back(frame_id);
        self.disk_manager.deallocate_page(page_id);
        debug!("delete page {} (frame {})", page_id, frame_id);
        Ok(true)
    }

    /// Resident pages, for assertions.
    pub fn resident_page_count(&self) -> usize {
        self.inner.lock().page_table.len()
    }

    pub fn free_frame_count(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    pub fn evictable_frame_count(&self) -> usize {
        self.inner.lock().replacer.size()
    }

    /// Look up or load `page_id`, returning the pinned frame.
    fn pin_page(&self, page_id: PageId) -> VellumResult<Option<Arc<PageFrame>>> {
        let mut inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = self.frames[frame_id].clone();
            frame.pin();
            inner.replacer.pin(frame_id);
            return Ok(Some(frame));
        }

        let Some(frame_id) = self.acquire_frame(&mut inner)? else {
            return Ok(None);
        };
        let frame = self.frames[frame_id].clone();

        frame.latch.wlock();
        let load = self
            .disk_manager
            .read_page(page_id, unsafe { frame.data_unchecked_mut() });
        if let Err(e) = load {
            frame.set_page_id(INVALID_PAGE_ID);
            frame.latch.wunlock();
            inner.free_list.push_back(frame_id);
            return Err(e);
        }
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.reset_pin_count(1);
        frame.latch.wunlock();

        inner.page_table.insert(page_id, frame_id);
        inner.replacer.pin(frame_id);
        trace!("load page {} into frame {}", page_id, frame_id);
        Ok(Some(frame))
    }

    /// Pick a frame for reuse: free list first, then a clock victim whose
    /// dirty contents are written back under its old page id.
    fn acquire_frame(&self, inner: &mut PoolInner) -> VellumResult<Option<FrameId>> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(Some(frame_id));
        }
        let Some(frame_id) = inner.replacer.victim() else {
            return Ok(None);
        };
        let frame = &self.frames[frame_id];
        let old_page_id = frame.page_id();
        if frame.is_dirty() {
            // Pin count is zero, so no writer can hold the latch; the read
            // is a consistent snapshot.
            let write = self
                .disk_manager
                .write_page(old_page_id, unsafe { frame.data_unchecked() });
            if let Err(e) = write {
                inner.replacer.unpin(frame_id);
                return Err(e);
            }
            debug!("write back dirty victim page {}", old_page_id);
        }
        inner.page_table.remove(&old_page_id);
        trace!("evict page {} from frame {}", old_page_id, frame_id);
        Ok(Some(frame_id))
    }
}
