use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    pub buffer_pool_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_pool_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BTreeConfig {
    /// Physical slots per leaf page; a leaf keeps at most `leaf_max_size - 1`
    /// entries so a pre-split insert always has room.
    pub leaf_max_size: u32,
    /// Maximum child pointers per internal page.
    pub internal_max_size: u32,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        BTreeConfig {
            leaf_max_size: 64,
            internal_max_size: 64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockManagerConfig {
    /// How often the background detector scans the wait-for graph.
    pub cycle_detection_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        LockManagerConfig {
            cycle_detection_interval: Duration::from_millis(50),
        }
    }
}
