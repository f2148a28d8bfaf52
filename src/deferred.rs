// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Deferred reader/writer synchronization.
//!
//! These locks allow concurrency between operations that would normally
//! require strict serialization, e.g. traversal of a linked structure vs.
//! removal of an element. Readers get in and out with one atomic operation
//! each on the fast path; writers perform only non-destructive edits under
//! their mutex and queue up the destructive part (freeing memory). The
//! queued cleanup runs at the next *quiescent point*: the moment a thread
//! observes the reader count return to zero while edits are pending. That
//! thread - whichever one it happens to be - inherits the obligation to
//! apply the cleanup and then call [`SyncGuard::finished`].
//!
//! This resembles RCU-style synchronization but needs no global tracking of
//! thread states, at the cost of giving writers no fairness or
//! obstruction-freedom guarantees.
//!
//! [`DeferredRwLock`] supports only deferred writes; [`DeferrableRwLock`]
//! additionally lets a writer block until quiescence
//! ([`DeferrableRwLock::write_lock_sync`]), which containers use to force a
//! defined synchronization point in their destructors.
//!
//! The usage pattern on the read side:
//!
//! ```ignore
//! loop {
//!     match lock.read_lock() {
//!         None => break,
//!         // a previous writer queued edits and this thread witnessed
//!         // quiescence: apply cleanup, then retry
//!         Some(sync) => container.synchronize(sync),
//!     }
//! }
//! /* ... traverse ... */
//! if let Some(sync) = lock.read_unlock() {
//!     container.synchronize(sync);
//! }
//! ```
//!
//! and on the write side:
//!
//! ```ignore
//! let w = lock.write_lock_async();
//! /* ... non-destructive edits, queue destructive ones ... */
//! match w {
//!     WriteLock::Sync(sync) => container.synchronize(sync),
//!     WriteLock::Deferred(guard) => drop(guard),
//! }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct State {
    /// true iff a writer has queued edits not yet reconciled
    queued: bool,
    /// true iff a synchronous writer is blocked on the condvar
    /// (only ever set through [`DeferrableRwLock`])
    waiting: bool,
}

/// The counter starts at 1: that extra count is the logical writer slot.
/// A writer electing to synchronize subtracts it; the counter reaching
/// zero then means "no readers left and an edit is pending", and the
/// thread that observes the transition owns the cleanup.
#[derive(Debug)]
struct Core {
    readers: AtomicUsize,
    writers: Mutex<State>,
    waiting_writers: Condvar,
}

impl Core {
    fn new() -> Self {
        Core {
            readers: AtomicUsize::new(1),
            writers: Mutex::new(State::default()),
            waiting_writers: Condvar::new(),
        }
    }

    fn read_acquire(&self) -> bool {
        let mut expected = self.readers.load(Ordering::Relaxed);
        loop {
            if expected == 0 {
                return false;
            }
            match self.readers.compare_exchange(
                expected,
                expected + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(v) => expected = v,
            }
        }
    }

    /// Returns true while other readers remain.
    fn read_release(&self) -> bool {
        self.readers.fetch_sub(1, Ordering::Release) != 1
    }

    fn wake_waiting_writers<'a>(&'a self, mut state: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        while state.waiting {
            state.waiting = false;
            drop(state);
            self.waiting_writers.notify_all();
            state = self.writers.lock().unwrap();
        }
        state
    }

    fn finish(&self, mut state: MutexGuard<'_, State>) {
        state.queued = false;
        state.waiting = false;
        self.readers.fetch_add(1, Ordering::Release);
        drop(state);
        self.waiting_writers.notify_all();
    }
}

/// Exclusive rights to apply queued cleanup.
///
/// Handed out when a lock operation witnesses the quiescent point. The
/// holder is the only thread that may touch deferred state; it must apply
/// all queued edits and then call [`finished`](SyncGuard::finished). The
/// writer mutex stays held for the guard's whole lifetime, so structural
/// fields guarded by it may be accessed as well.
///
/// Dropping the guard without calling `finished` leaves the lock drained
/// and will wedge all subsequent readers; the guard is deliberately not
/// self-restoring because cleanup must not be silently skipped.
#[must_use]
#[derive(Debug)]
pub struct SyncGuard<'a> {
    core: &'a Core,
    state: MutexGuard<'a, State>,
}

impl<'a> SyncGuard<'a> {
    /// Declares the queued cleanup applied: restores the reader counter,
    /// wakes any synchronous writer and releases the writer mutex.
    pub fn finished(self) {
        self.core.finish(self.state);
    }
}

/// Witness that the writer mutex is held for a deferred (queued) edit.
/// Dropping it releases the mutex.
#[derive(Debug)]
pub struct WriteGuard<'a> {
    #[allow(dead_code)]
    state: MutexGuard<'a, State>,
}

/// Outcome of [`DeferredRwLock::write_lock_async`] /
/// [`DeferrableRwLock::write_lock_async`].
#[must_use]
#[derive(Debug)]
pub enum WriteLock<'a> {
    /// No readers were active: the caller holds exclusive rights, must
    /// apply its edits together with all queued cleanup and then call
    /// [`SyncGuard::finished`].
    Sync(SyncGuard<'a>),
    /// Readers (or an earlier queued edit) are in the way: the caller must
    /// queue its destructive edits and release the guard. Some subsequent
    /// lock operation is then guaranteed to report the quiescent point.
    Deferred(WriteGuard<'a>),
}

/// Deferred reader-/writer synchronization: readers and writers proceed
/// (almost) unimpeded, and destructive updates are queued up while readers
/// are active. See the [module docs](self) for the protocol.
///
/// Lock nesting is deadlock-free for arbitrarily many read locks in any
/// order plus one asynchronous write lock held over them.
#[derive(Debug)]
pub struct DeferredRwLock {
    core: Core,
}

impl Default for DeferredRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredRwLock {
    /// Creates the lock with no readers and no queued edits.
    pub fn new() -> Self {
        DeferredRwLock { core: Core::new() }
    }

    /// Tries to acquire a shared lock. `None` means the lock is held and
    /// the caller may proceed; `Some` means the quiescent point was
    /// witnessed instead - apply cleanup, call [`SyncGuard::finished`] and
    /// retry.
    pub fn read_lock(&self) -> Option<SyncGuard<'_>> {
        if self.core.read_acquire() {
            return None;
        }
        self.read_lock_slow()
    }

    fn read_lock_slow(&self) -> Option<SyncGuard<'_>> {
        let state = self.core.writers.lock().unwrap();
        if self.core.read_acquire() {
            return None;
        }
        Some(SyncGuard {
            core: &self.core,
            state,
        })
    }

    /// Releases a shared lock. `Some` means this thread was the last
    /// reader out while an edit was pending and now owns the cleanup.
    pub fn read_unlock(&self) -> Option<SyncGuard<'_>> {
        if self.core.read_release() {
            return None;
        }
        self.read_unlock_slow()
    }

    fn read_unlock_slow(&self) -> Option<SyncGuard<'_>> {
        let state = self.core.writers.lock().unwrap();
        /* If another thread observed the 1->0 transition it will take the
        mutex afterwards and thereby serialize with us; a 0->1 transition
        can only happen with the mutex held, so the mutex ordering is
        sufficient here. */
        if self.core.readers.load(Ordering::Relaxed) != 0 {
            return None;
        }
        Some(SyncGuard {
            core: &self.core,
            state,
        })
    }

    /// Acquires the writer mutex for an exclusive edit. See [`WriteLock`]
    /// for the two possible outcomes. In either case the guard also
    /// witnesses the writer mutex for access to structural state.
    pub fn write_lock_async(&self) -> WriteLock<'_> {
        let mut state = self.core.writers.lock().unwrap();
        if !state.queued {
            state.queued = true;
            if self.core.readers.fetch_sub(1, Ordering::Acquire) == 1 {
                return WriteLock::Sync(SyncGuard {
                    core: &self.core,
                    state,
                });
            }
        }
        WriteLock::Deferred(WriteGuard { state })
    }
}

/// [`DeferredRwLock`] plus the ability to *block* until quiescence:
/// [`write_lock_sync`](DeferrableRwLock::write_lock_sync) waits until no
/// reader or writer is active instead of queueing. Containers use this to
/// force a defined synchronization point (typically on teardown), since
/// the fully asynchronous protocol alone can starve cleanup indefinitely.
#[derive(Debug)]
pub struct DeferrableRwLock {
    core: Core,
}

impl Default for DeferrableRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferrableRwLock {
    /// Creates the lock with no readers and no queued edits.
    pub fn new() -> Self {
        DeferrableRwLock { core: Core::new() }
    }

    /// See [`DeferredRwLock::read_lock`].
    pub fn read_lock(&self) -> Option<SyncGuard<'_>> {
        if self.core.read_acquire() {
            return None;
        }
        self.read_lock_slow()
    }

    fn read_lock_slow(&self) -> Option<SyncGuard<'_>> {
        let state = self.core.writers.lock().unwrap();
        let state = self.core.wake_waiting_writers(state);
        if self.core.read_acquire() {
            return None;
        }
        Some(SyncGuard {
            core: &self.core,
            state,
        })
    }

    /// See [`DeferredRwLock::read_unlock`].
    pub fn read_unlock(&self) -> Option<SyncGuard<'_>> {
        if self.core.read_release() {
            return None;
        }
        self.read_unlock_slow()
    }

    fn read_unlock_slow(&self) -> Option<SyncGuard<'_>> {
        let state = self.core.writers.lock().unwrap();
        let state = self.core.wake_waiting_writers(state);
        if self.core.readers.load(Ordering::Relaxed) != 0 {
            return None;
        }
        Some(SyncGuard {
            core: &self.core,
            state,
        })
    }

    /// See [`DeferredRwLock::write_lock_async`]. A pending synchronous
    /// writer also forces the deferred outcome.
    pub fn write_lock_async(&self) -> WriteLock<'_> {
        let mut state = self.core.writers.lock().unwrap();
        let sync = if !state.queued && !state.waiting {
            self.core.readers.fetch_sub(1, Ordering::Acquire) == 1
        } else {
            false
        };
        state.queued = true;
        if sync {
            WriteLock::Sync(SyncGuard {
                core: &self.core,
                state,
            })
        } else {
            WriteLock::Deferred(WriteGuard { state })
        }
    }

    /// Synchronously acquires exclusive rights, blocking until no reader
    /// or writer is active. The returned guard carries the same obligation
    /// as every [`SyncGuard`]: apply queued cleanup, then call
    /// [`finished`](SyncGuard::finished).
    pub fn write_lock_sync(&self) -> SyncGuard<'_> {
        let mut state = self.core.writers.lock().unwrap();
        loop {
            if !state.queued && !state.waiting
                && self.core.readers.fetch_sub(1, Ordering::Acquire) == 1
            {
                return SyncGuard {
                    core: &self.core,
                    state,
                };
            }
            state.waiting = true;
            state = self.core.waiting_writers.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn synchronize(count: &AtomicUsize, guard: SyncGuard<'_>) {
        count.fetch_add(1, Ordering::Relaxed);
        guard.finished();
    }

    #[test]
    fn uncontended_read_is_trivial() {
        let lock = DeferredRwLock::new();
        assert!(lock.read_lock().is_none());
        assert!(lock.read_unlock().is_none());
    }

    #[test]
    fn writer_without_readers_synchronizes_immediately() {
        let lock = DeferredRwLock::new();
        let syncs = AtomicUsize::new(0);
        match lock.write_lock_async() {
            WriteLock::Sync(g) => synchronize(&syncs, g),
            WriteLock::Deferred(_) => panic!("expected synchronous write lock"),
        }
        assert_eq!(syncs.load(Ordering::Relaxed), 1);
        // lock must be usable again
        assert!(lock.read_lock().is_none());
        assert!(lock.read_unlock().is_none());
    }

    #[test]
    fn queued_edit_is_reconciled_by_last_reader() {
        let lock = DeferredRwLock::new();
        let syncs = AtomicUsize::new(0);

        assert!(lock.read_lock().is_none());
        // reader active: the writer must defer
        match lock.write_lock_async() {
            WriteLock::Sync(_) => panic!("reader was active"),
            WriteLock::Deferred(g) => drop(g),
        }
        // the reader leaving observes the quiescent point
        match lock.read_unlock() {
            Some(g) => synchronize(&syncs, g),
            None => panic!("expected to inherit cleanup"),
        }
        assert_eq!(syncs.load(Ordering::Relaxed), 1);
        assert!(lock.read_lock().is_none());
        assert!(lock.read_unlock().is_none());
    }

    #[test]
    fn second_writer_piggybacks_on_queued_edit() {
        let lock = DeferredRwLock::new();
        assert!(lock.read_lock().is_none());
        match lock.write_lock_async() {
            WriteLock::Sync(_) => panic!(),
            WriteLock::Deferred(g) => drop(g),
        }
        // an edit is already queued: no second drain happens
        match lock.write_lock_async() {
            WriteLock::Sync(_) => panic!(),
            WriteLock::Deferred(g) => drop(g),
        }
        match lock.read_unlock() {
            Some(g) => g.finished(),
            None => panic!(),
        };
    }

    #[test]
    fn write_lock_sync_waits_for_reader() {
        let lock = Arc::new(DeferrableRwLock::new());
        assert!(lock.read_lock().is_none());

        let l2 = lock.clone();
        let writer = thread::spawn(move || {
            let g = l2.write_lock_sync();
            g.finished();
        });

        // give the writer time to block
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        assert!(lock.read_unlock().is_none());
        writer.join().unwrap();

        assert!(lock.read_lock().is_none());
        assert!(lock.read_unlock().is_none());
    }

    // At most one thread at a time may own the quiescent point, and the
    // obligation is always discharged exactly once per drain.
    #[test]
    fn single_synchronizer_across_threads() {
        let lock = Arc::new(DeferrableRwLock::new());
        let syncs = Arc::new(AtomicUsize::new(0));
        let in_sync = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let syncs = syncs.clone();
            let in_sync = in_sync.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    loop {
                        match lock.read_lock() {
                            None => break,
                            Some(g) => {
                                assert_eq!(in_sync.fetch_add(1, Ordering::SeqCst), 0);
                                in_sync.fetch_sub(1, Ordering::SeqCst);
                                syncs.fetch_add(1, Ordering::Relaxed);
                                g.finished();
                            }
                        }
                    }
                    if let Some(g) = lock.read_unlock() {
                        assert_eq!(in_sync.fetch_add(1, Ordering::SeqCst), 0);
                        in_sync.fetch_sub(1, Ordering::SeqCst);
                        syncs.fetch_add(1, Ordering::Relaxed);
                        g.finished();
                    }
                }
            }));
        }
        let writer = {
            let lock = lock.clone();
            let syncs = syncs.clone();
            let in_sync = in_sync.clone();
            thread::spawn(move || {
                for _ in 0..1_000 {
                    match lock.write_lock_async() {
                        WriteLock::Sync(g) => {
                            assert_eq!(in_sync.fetch_add(1, Ordering::SeqCst), 0);
                            in_sync.fetch_sub(1, Ordering::SeqCst);
                            syncs.fetch_add(1, Ordering::Relaxed);
                            g.finished();
                        }
                        WriteLock::Deferred(g) => drop(g),
                    }
                }
            })
        };
        for h in handles {
            h.join().unwrap();
        }
        writer.join().unwrap();

        // discharge whatever the writer queued last, then verify the lock
        // ends up fully restored: a write lock with no readers active is
        // synchronous again
        loop {
            match lock.read_lock() {
                None => break,
                Some(g) => {
                    syncs.fetch_add(1, Ordering::Relaxed);
                    g.finished();
                }
            }
        }
        if let Some(g) = lock.read_unlock() {
            g.finished();
        }
        assert_eq!(in_sync.load(Ordering::SeqCst), 0);
        match lock.write_lock_async() {
            WriteLock::Sync(g) => g.finished(),
            WriteLock::Deferred(_) => panic!("drain was never reconciled"),
        };
    }
}
