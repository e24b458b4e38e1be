//! Cross-process spinlock living in the span header.
//!
//! The lock word is 0 when free and holds the owner's pid otherwise, so a
//! stuck lock can be traced back to a process. Writers acquire with a
//! TTAS loop; after a while they start yielding the thread and log the
//! holder once.
//!
//! Every hash-set mutation runs under [`ShmLockGuard`], which releases the
//! word on drop regardless of how the critical section ends.
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::warn;

/// Spins before falling back to `yield_now`.
const SPINS_BEFORE_YIELD: u32 = 1 << 10;

/// Yields before reporting the holder.
const YIELDS_BEFORE_WARN: u32 = 1 << 16;

/// Handle to a lock word inside a shared mapping.
pub struct ShmSpinLock {
    word: *const AtomicU32,
}

unsafe impl Send for ShmSpinLock {}
unsafe impl Sync for ShmSpinLock {}

impl ShmSpinLock {
    /// Reset the lock word to unlocked.
    ///
    /// # Safety
    /// `word` must point into a live shared mapping and nobody may be
    /// holding the lock.
    pub unsafe fn init(word: *const AtomicU32) -> Self {
        (*word).store(0, Ordering::Release);
        ShmSpinLock { word }
    }

    /// Attach to an already-initialized lock word.
    ///
    /// # Safety
    /// `word` must point into a live shared mapping for as long as the
    /// returned handle (and any guard) is used.
    pub unsafe fn from_existing(word: *const AtomicU32) -> Self {
        ShmSpinLock { word }
    }

    #[inline]
    fn word(&self) -> &AtomicU32 {
        unsafe { &*self.word }
    }

    /// Block (spin) until the lock is ours.
    pub fn lock(&self) -> ShmLockGuard<'_> {
        let me = current_pid();
        let word = self.word();
        let mut spins = 0u32;
        let mut yields = 0u32;
        loop {
            // Test: spin on load (cache-friendly, no bus traffic)
            while word.load(Ordering::Relaxed) != 0 {
                if spins < SPINS_BEFORE_YIELD {
                    spins += 1;
                    std::hint::spin_loop();
                    continue;
                }
                yields += 1;
                if yields == YIELDS_BEFORE_WARN {
                    warn!(
                        holder = ?self.holder(),
                        waiter = me,
                        "shared metrics lock held for a long time"
                    );
                }
                std::thread::yield_now();
            }
            // Test-and-Set
            if word
                .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return ShmLockGuard { lock: self };
            }
        }
    }

    /// Pid of the current holder, if any.
    pub fn holder(&self) -> Option<u32> {
        match self.word().load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }
}

/// Holds the lock until dropped.
pub struct ShmLockGuard<'a> {
    lock: &'a ShmSpinLock,
}

impl Drop for ShmLockGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.word().store(0, Ordering::Release);
    }
}

fn current_pid() -> u32 {
    // pids are positive, so the word never reads as "free" while held
    (unsafe { libc::getpid() } as u32).max(1)
}
