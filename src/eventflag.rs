// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Cross-thread wake-up primitives.
//!
//! An event trigger is a boolean that any thread can raise; an event flag
//! additionally lets a thread block until it is raised and reset it. The
//! pipe-backed variant keeps `set` async-signal-safe and owns a descriptor
//! a kernel multiplexer can watch, which is how a dispatcher sleeping in
//! `epoll_wait` gets interrupted. The condvar variant serves purely
//! in-process hand-offs.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

use crate::error::Result;
use crate::sys;

/// A wake-up trigger. `set` may be called from any thread; for
/// [`PipeEventFlag`] it may also be called from a posix signal handler.
pub trait EventTrigger: Send + Sync {
    /// Raises the trigger, releasing one round of waiters.
    fn set(&self);
}

/// An [`EventTrigger`] that can also be waited on and reset.
pub trait EventFlag: EventTrigger {
    /// Blocks until the flag is set. Does not consume the flag.
    fn wait(&self);
    /// Resets the flag to unset.
    fn clear(&self);
}

/// flagged_ state machine: 0 = clear, 1 = set with no wakeup byte
/// pending, 2 = set with a wakeup byte written (or about to be written)
/// that `clear` must drain.
const CLEAR: u32 = 0;
const SET: u32 = 1;
const SET_WITH_WAKEUP: u32 = 2;

/// Event flag backed by a self-pipe.
///
/// The common case - setting a flag nobody currently waits on, or
/// clearing a flag that never needed a wakeup - costs one atomic
/// operation and no system call. Only when a waiter has announced itself
/// does `set` write the single wakeup byte.
///
/// The read end of the pipe is what an IO dispatcher registers with the
/// kernel so that raising the flag interrupts a sleeping `epoll_wait`.
#[derive(Debug)]
pub struct PipeEventFlag {
    read_fd: RawFd,
    write_fd: RawFd,
    flagged: AtomicU32,
    waiting: AtomicU32,
}

impl PipeEventFlag {
    /// Creates the flag together with its control pipe.
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = sys::create_wake_pipe()?;
        Ok(PipeEventFlag {
            read_fd,
            write_fd,
            flagged: AtomicU32::new(CLEAR),
            waiting: AtomicU32::new(0),
        })
    }

    /// Read end of the control pipe, for registration with a kernel
    /// multiplexer.
    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Announces a waiter. Dispatchers call this before entering the
    /// kernel wait so that a concurrent `set` posts the wakeup byte.
    pub(crate) fn start_waiting(&self) {
        self.waiting.fetch_add(1, Ordering::Relaxed);
    }

    /// Retracts the announcement made by [`start_waiting`](Self::start_waiting).
    pub(crate) fn stop_waiting(&self) {
        self.waiting.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flagged.load(Ordering::Relaxed) != CLEAR
    }
}

impl EventTrigger for PipeEventFlag {
    fn set(&self) {
        /* fast path to avoid the atomic rmw if the flag is already set */
        if self.flagged.load(Ordering::Relaxed) != CLEAR {
            return;
        }

        /* only one setter may observe the 0->1 transition, otherwise
        there could be spurious wakeup bytes */
        if self
            .flagged
            .compare_exchange(CLEAR, SET, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        /* no announced waiter: nothing to post */
        if self.waiting.load(Ordering::Relaxed) == 0 {
            return;
        }

        /* at least one thread was waiting when the flag went up; the
        transition 1->2 elects the thread that posts the byte, and
        obliges the clearing side to drain it */
        if self
            .flagged
            .compare_exchange(SET, SET_WITH_WAKEUP, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        sys::write_wake_byte(self.write_fd);
    }
}

impl EventFlag for PipeEventFlag {
    fn wait(&self) {
        if self.flagged.load(Ordering::Acquire) != CLEAR {
            return;
        }

        self.start_waiting();
        if self.flagged.load(Ordering::Acquire) == CLEAR {
            sys::wait_readable(self.read_fd);
        }
        self.stop_waiting();
    }

    fn clear(&self) {
        let mut oldval = self.flagged.load(Ordering::Relaxed);
        loop {
            if oldval == CLEAR {
                return;
            }
            /* the caller will test some condition in a data structure
            right after clearing; acquire keeps that test from being
            reordered before the reset */
            match self.flagged.compare_exchange(
                oldval,
                CLEAR,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => oldval = v,
            }
        }
        if oldval == SET {
            return;
        }

        /* a wakeup byte was posted the last time the flag was raised */
        sys::drain_wake_byte(self.read_fd);
    }
}

impl Drop for PipeEventFlag {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.read_fd);
        let _ = nix::unistd::close(self.write_fd);
    }
}

/// Event flag built from a mutex, a condition variable and a bool. Not
/// async-signal-safe and not connectable to a kernel multiplexer, but
/// free of file descriptors.
#[derive(Debug, Default)]
pub struct CondvarEventFlag {
    flagged: Mutex<bool>,
    cond: Condvar,
}

impl CondvarEventFlag {
    /// Creates the flag in unset state.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventTrigger for CondvarEventFlag {
    fn set(&self) {
        let mut flagged = self.flagged.lock().unwrap();
        *flagged = true;
        self.cond.notify_all();
    }
}

impl EventFlag for CondvarEventFlag {
    fn wait(&self) {
        let mut flagged = self.flagged.lock().unwrap();
        while !*flagged {
            flagged = self.cond.wait(flagged).unwrap();
        }
    }

    fn clear(&self) {
        *self.flagged.lock().unwrap() = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_then_wait_does_not_block() {
        let flag = PipeEventFlag::new().unwrap();
        flag.set();
        flag.wait();
        flag.clear();
        assert!(!flag.is_set());
    }

    #[test]
    fn set_is_idempotent() {
        let flag = PipeEventFlag::new().unwrap();
        flag.set();
        flag.set();
        flag.set();
        flag.wait();
        flag.clear();
        // a second clear must not block on draining a byte that was
        // never written
        flag.clear();
    }

    #[test]
    fn wakes_sleeping_waiter() {
        let flag = Arc::new(PipeEventFlag::new().unwrap());
        let f2 = flag.clone();
        let waiter = thread::spawn(move || {
            f2.wait();
            f2.clear();
        });
        thread::sleep(Duration::from_millis(20));
        flag.set();
        waiter.join().unwrap();
        assert!(!flag.is_set());
    }

    #[test]
    fn set_wait_clear_cycles_with_waiter_announced() {
        let flag = PipeEventFlag::new().unwrap();
        for _ in 0..100 {
            flag.start_waiting();
            flag.set();
            flag.wait();
            flag.stop_waiting();
            flag.clear();
        }
    }

    #[test]
    fn condvar_flag_round_trip() {
        let flag = Arc::new(CondvarEventFlag::new());
        let f2 = flag.clone();
        let waiter = thread::spawn(move || {
            f2.wait();
        });
        thread::sleep(Duration::from_millis(20));
        flag.set();
        waiter.join().unwrap();
        flag.clear();
    }
}
