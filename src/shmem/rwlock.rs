//! Inter-process reader/writer lock.
//!
//! `ShmRwLock` packs its entire state into one `AtomicU32` so it can live in
//! plain shared memory and be operated on by any process mapping it. There
//! is no waiter queue and no handshake with the kernel; acquisition spins
//! with escalating backoff (spin → yield → sleep). Critical sections in the
//! store are short (a hash probe, a cell copy), so contention windows are
//! tiny; the long-held locks (the write-only session lock) are acquired with
//! bounded waits and surface `Busy` kinds instead of spinning forever.
//!
//! ## State Word
//!
//! ```text
//! bit 31      WRITER   exclusive holder present
//! bit 30      UPGRADE  a shared holder has claimed the right to promote
//! bits 0..30  reader count
//! ```
//!
//! The all-zero word is "unlocked". That is what makes the shared-mutex
//! region's bootstrap and crash recovery trivial: zero-filling the region
//! initializes (or re-initializes) every lock in it.
//!
//! ## Promotion
//!
//! `try_promote_shared_for` claims the UPGRADE bit (only one claimant at a
//! time), waits for the other readers to drain, then swaps its own reader
//! slot for the WRITER bit. The write-only open flow uses this to turn its
//! shared session hold into the exclusive one, failing with a timeout when
//! other openers keep the lock shared.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const WRITER: u32 = 1 << 31;
const UPGRADE: u32 = 1 << 30;
const READERS: u32 = UPGRADE - 1;

/// Escalating wait: busy spin first, then yield the CPU, then sleep.
struct Backoff {
    spins: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { spins: 0 }
    }

    fn snooze(&mut self) {
        if self.spins < 100 {
            std::hint::spin_loop();
        } else if self.spins < 200 {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(100));
        }
        self.spins = self.spins.saturating_add(1);
    }
}

/// A reader/writer lock whose single word of state lives wherever the
/// struct is placed — for the store, inside the shared-mutex region.
#[repr(transparent)]
#[derive(Debug)]
pub struct ShmRwLock {
    state: AtomicU32,
}

impl ShmRwLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    fn try_acquire_shared(&self) -> bool {
        let s = self.state.load(Ordering::Relaxed);
        if s & WRITER != 0 || s & READERS == READERS {
            return false;
        }
        self.state
            .compare_exchange_weak(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Blocking shared acquisition (point reads, point writes' global hold).
    pub fn acquire_shared(&self) {
        let mut backoff = Backoff::new();
        while !self.try_acquire_shared() {
            backoff.snooze();
        }
    }

    /// Bounded shared acquisition; false on timeout.
    pub fn acquire_shared_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        while !self.try_acquire_shared() {
            if Instant::now() >= deadline {
                return false;
            }
            backoff.snooze();
        }
        true
    }

    pub fn release_shared(&self) {
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            if s & READERS == 0 {
                // The region was re-initialized under us; the hold is gone.
                return;
            }
            match self.state.compare_exchange_weak(
                s,
                s - 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(cur) => s = cur,
            }
        }
    }

    fn try_acquire_exclusive(&self) -> bool {
        self.state
            .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Blocking exclusive acquisition (enumerate, write transactions).
    pub fn acquire_exclusive(&self) {
        let mut backoff = Backoff::new();
        while !self.try_acquire_exclusive() {
            backoff.snooze();
        }
    }

    /// Bounded exclusive acquisition; false on timeout. The bootstrap trial
    /// lock uses this to detect an abandoned holder.
    pub fn acquire_exclusive_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        while !self.try_acquire_exclusive() {
            if Instant::now() >= deadline {
                return false;
            }
            backoff.snooze();
        }
        true
    }

    pub fn release_exclusive(&self) {
        // With WRITER set no reader or upgrader can join, so the whole word
        // belongs to the holder.
        self.state.store(0, Ordering::Release);
    }

    /// Turns a shared hold into the exclusive one.
    ///
    /// Claims the UPGRADE bit (one claimant at a time), waits for other
    /// readers to drain, then swaps reader-plus-claim for WRITER. On timeout
    /// the claim is withdrawn and the shared hold remains. Returns false on
    /// timeout or when another claimant already holds the UPGRADE bit.
    pub fn try_promote_shared_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();

        // Claim the promotion slot.
        loop {
            let s = self.state.load(Ordering::Relaxed);
            debug_assert!(s & READERS >= 1, "promote without a shared hold");
            if s & (WRITER | UPGRADE) != 0 {
                if Instant::now() >= deadline {
                    return false;
                }
                backoff.snooze();
                continue;
            }
            if self
                .state
                .compare_exchange_weak(s, s | UPGRADE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        // Wait for the other readers to drain, then take the writer bit,
        // giving up our own reader slot and the claim in one swap.
        let mut backoff = Backoff::new();
        loop {
            if self
                .state
                .compare_exchange_weak(UPGRADE | 1, WRITER, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            if Instant::now() >= deadline {
                self.state.fetch_and(!UPGRADE, Ordering::Release);
                return false;
            }
            backoff.snooze();
        }
    }

    /// RAII shared hold for a point operation.
    pub fn lock_shared(&self) -> SharedGuard<'_> {
        self.acquire_shared();
        SharedGuard { lock: self }
    }

    /// RAII exclusive hold for enumerate-style operations.
    pub fn lock_exclusive(&self) -> ExclusiveGuard<'_> {
        self.acquire_exclusive();
        ExclusiveGuard { lock: self }
    }
}

/// Releases a shared hold on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SharedGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

/// Releases an exclusive hold on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}
