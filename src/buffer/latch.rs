use parking_lot::{Condvar, Mutex};

const MAX_READERS: u32 = u32::MAX;

#[derive(Debug, Default)]
struct LatchState {
    reader_count: u32,
    writer_entered: bool,
}

/// Writer-preferring reader-writer latch for a single page frame.
///
/// A writer first marks itself entered and then waits for the reader count to
/// drain; while it is entered no new reader may slip in, so a stream of
/// readers cannot starve structure modifications. `wunlock` wakes every
/// waiter (readers and the next writer) and lets the scheduler arbitrate.
///
/// Unlike the std `RwLock`, acquisition and release are decoupled from guard
/// lifetimes: the buffer pool's page guards latch on construction and unlatch
/// on drop, which is what lets tree operations hand latched ancestors around
/// in a crabbing context.
#[derive(Debug, Default)]
pub struct RwLatch {
    state: Mutex<LatchState>,
    // Writers queue here while readers drain; everyone else queues on
    // `readers` so wunlock can wake them all at once.
    writer: Condvar,
    readers: Condvar,
}

impl RwLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rlock(&self) {
        let mut state = self.state.lock();
        while state.writer_entered || state.reader_count == MAX_READERS {
            self.readers.wait(&mut state);
        }
        state.reader_count += 1;
    }

    pub fn runlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.reader_count > 0, "runlock without rlock");
        state.reader_count -= 1;
        if state.writer_entered {
            if state.reader_count == 0 {
                self.writer.notify_one();
            }
        } else if state.reader_count == MAX_READERS - 1 {
            self.readers.notify_one();
        }
    }

    pub fn wlock(&self) {
        let mut state = self.state.lock();
        // Later writers park with the readers so that wunlock's single
        // broadcast reaches them; at most one writer waits on `writer`.
        while state.writer_entered {
            self.readers.wait(&mut state);
        }
        state.writer_entered = true;
        while state.reader_count > 0 {
            self.writer.wait(&mut state);
        }
    }

    pub fn wunlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer_entered, "wunlock without wlock");
        state.writer_entered = false;
        self.readers.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share_writers_exclude() {
        let latch = Arc::new(RwLatch::new());
        latch.rlock();
        latch.rlock();
        latch.runlock();

        let entered = Arc::new(AtomicBool::new(false));
        let writer = {
            let latch = latch.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                latch.wlock();
                entered.store(true, Ordering::SeqCst);
                latch.wunlock();
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!entered.load(Ordering::SeqCst));

        latch.runlock();
        writer.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn entered_writer_blocks_new_readers() {
        let latch = Arc::new(RwLatch::new());
        latch.rlock();

        let writer = {
            let latch = latch.clone();
            thread::spawn(move || {
                latch.wlock();
                latch.wunlock();
            })
        };
        // Give the writer time to mark itself entered.
        thread::sleep(Duration::from_millis(20));

        let read_done = Arc::new(AtomicBool::new(false));
        let reader = {
            let latch = latch.clone();
            let read_done = read_done.clone();
            thread::spawn(move || {
                latch.rlock();
                read_done.store(true, Ordering::SeqCst);
                latch.runlock();
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!read_done.load(Ordering::SeqCst));

        latch.runlock();
        writer.join().unwrap();
        reader.join().unwrap();
        assert!(read_done.load(Ordering::SeqCst));
    }

    #[test]
    fn writers_serialize() {
        let latch = Arc::new(RwLatch::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let latch = latch.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    latch.wlock();
                    let seen = counter.load(Ordering::SeqCst);
                    counter.store(seen + 1, Ordering::SeqCst);
                    latch.wunlock();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 800);
    }
}
