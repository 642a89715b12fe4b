pub mod buffer_pool;
pub mod latch;
pub mod page;
pub mod replacer;

pub use buffer_pool::BufferPoolManager;
pub use latch::RwLatch;
pub use page::{
    AtomicPageId, FrameId, PageFrame, PageId, PageReadGuard, PageWriteGuard, HEADER_PAGE_ID,
    INVALID_PAGE_ID, PAGE_SIZE,
};
pub use replacer::{ClockReplacer, Replacer};
