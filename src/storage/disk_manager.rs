use log::{debug, warn};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::buffer::{PageId, HEADER_PAGE_ID, PAGE_SIZE};
use crate::error::VellumResult;

/// Synchronous fixed-size page store over a single database file.
///
/// Page ids map directly to file offsets (`page_id * PAGE_SIZE`). Page 0 is
/// reserved at creation for the header page, so allocation starts at 1.
#[derive(Debug)]
pub struct DiskManager {
    db_path: PathBuf,
    db_file: Mutex<File>,
    next_page_id: AtomicU32,
}

impl DiskManager {
    pub fn try_new(db_path: impl Into<PathBuf>) -> VellumResult<Self> {
        let db_path = db_path.into();
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&db_path)?;

        // A previously written file resumes allocation after its last page.
        let file_len = db_file.metadata()?.len();
        let existing_pages = (file_len as usize).div_ceil(PAGE_SIZE) as PageId;
        let next_page_id = existing_pages.max(HEADER_PAGE_ID + 1);

        debug!(
            "open database file {:?}, {} pages on disk, next page id {}",
            db_path, existing_pages, next_page_id
        );

        Ok(Self {
            db_path,
            db_file: Mutex::new(db_file),
            next_page_id: AtomicU32::new(next_page_id),
        })
    }

    /// Read one page into `buf`. A page that was allocated but never written
    /// reads back as zeroes.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> VellumResult<()> {
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        let mut filled = 0;
        while filled < PAGE_SIZE {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> VellumResult<()> {
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    /// Hand out a fresh page id. The file grows lazily on first write.
    pub fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// The slot is not reclaimed; deallocation only marks intent.
    pub fn deallocate_page(&self, page_id: PageId) {
        if page_id == HEADER_PAGE_ID {
            warn!("refusing to deallocate the header page");
            return;
        }
        debug!("deallocate page {}", page_id);
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let page_id = disk_manager.allocate_page();
        assert_eq!(page_id, 1);

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xCD;
        disk_manager.write_page(page_id, &data).unwrap();

        let mut read_back = [0xFFu8; PAGE_SIZE];
        disk_manager.read_page(page_id, &mut read_back).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn unwritten_page_reads_zeroes() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let page_id = disk_manager.allocate_page();
        let mut buf = [0xFFu8; PAGE_SIZE];
        disk_manager.read_page(page_id, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn reopen_resumes_allocation() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");
        let last = {
            let disk_manager = DiskManager::try_new(&path).unwrap();
            let first = disk_manager.allocate_page();
            let second = disk_manager.allocate_page();
            assert_eq!(second, first + 1);
            disk_manager
                .write_page(second, &[7u8; PAGE_SIZE])
                .unwrap();
            second
        };

        let reopened = DiskManager::try_new(&path).unwrap();
        assert!(reopened.allocate_page() > last);
    }
}
