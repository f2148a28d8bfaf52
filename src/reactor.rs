// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Compound event dispatching.
//!
//! A [`Reactor`] composes the four event sources - timers, fd readiness,
//! async-safe procedures and a deferred workqueue - around the IO
//! dispatcher's wake-up trigger. One dispatch step:
//!
//! 1. runs every expired timer, computing the next deadline;
//! 2. waits for fd events up to that deadline (interrupted early by the
//!    shared trigger);
//! 3. services async-safe procedures marked during the wait;
//! 4. drains the deferred workqueue.
//!
//! A driving thread calls [`dispatch`](Reactor::dispatch) in an endless
//! loop and suspends automatically whenever there is nothing to do. Any
//! other thread (or a signal handler, via the async-safe interface) can
//! hand it work at any time.

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::debug;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::async_work::{AsyncSafeConnection, AsyncSafeWorkDispatcher};
use crate::error::Result;
use crate::eventflag::{EventFlag, EventTrigger};
use crate::ioready::{
    create_ioready_dispatcher, IoReadyConnection, IoReadyDispatcher, IoReadyEvents,
    IoReadyService,
};
use crate::timer::{TimerConnection, TimerDispatcher};

type WorkItem = Box<dyn FnOnce() + Send>;

/// Configures and creates a [`Reactor`].
#[derive(Default)]
pub struct ReactorBuilder {
    io: Option<Box<dyn IoReadyDispatcher>>,
}

impl ReactorBuilder {
    /// Starts from the default configuration: a freshly created IO
    /// dispatcher suitable for the current platform.
    pub fn new() -> ReactorBuilder {
        ReactorBuilder::default()
    }

    /// Uses `io` instead of auto-selecting an IO dispatcher.
    pub fn io_dispatcher(mut self, io: Box<dyn IoReadyDispatcher>) -> ReactorBuilder {
        self.io = Some(io);
        self
    }

    /// Creates the reactor.
    pub fn build(self) -> Result<Reactor> {
        let io = match self.io {
            Some(io) => io,
            None => create_ioready_dispatcher()?,
        };
        let trigger = io.eventtrigger()?;
        let (work_tx, work_rx) = unbounded();
        debug!("reactor created");
        Ok(Reactor {
            io,
            timer: TimerDispatcher::new(trigger.clone()),
            async_work: AsyncSafeWorkDispatcher::new(trigger.clone()),
            trigger,
            work_tx,
            work_rx,
        })
    }
}

impl fmt::Debug for ReactorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("ReactorBuilder { .. }")
    }
}

/// Posix reactor: timers, fd readiness, async-safe procedures and posted
/// work behind a single dispatch loop.
///
/// ```no_run
/// use reflex::Reactor;
///
/// # fn run() -> reflex::Result<()> {
/// let reactor = Reactor::new()?;
/// reactor.post(|| println!("ran on the dispatching thread"));
/// loop {
///     reactor.dispatch()?;
/// }
/// # }
/// ```
pub struct Reactor {
    io: Box<dyn IoReadyDispatcher>,
    timer: TimerDispatcher,
    async_work: AsyncSafeWorkDispatcher,
    trigger: Arc<dyn EventFlag>,
    work_tx: Sender<WorkItem>,
    work_rx: Receiver<WorkItem>,
}

impl Reactor {
    /// Creates a reactor with the default configuration.
    pub fn new() -> Result<Reactor> {
        ReactorBuilder::new().build()
    }

    /// Submits `function` for execution on a dispatching thread and
    /// wakes one up.
    pub fn post(&self, function: impl FnOnce() + Send + 'static) {
        /* send only fails once the receiver is gone, i.e. during
        teardown; the work is then dropped with everything else */
        let _ = self.work_tx.send(Box::new(function));
        self.trigger.set();
    }

    /// Registers a readiness callback; see
    /// [`IoReadyService::watch`](crate::IoReadyService::watch).
    pub fn watch(
        &self,
        function: impl Fn(IoReadyEvents) + Send + Sync + 'static,
        fd: RawFd,
        event_mask: IoReadyEvents,
    ) -> Result<IoReadyConnection> {
        self.io.watch(Box::new(function), fd, event_mask)
    }

    /// Registers a timer; see [`TimerDispatcher::timer`].
    pub fn timer(
        &self,
        when: Instant,
        function: impl FnMut(&mut Instant) -> bool + Send + 'static,
    ) -> TimerConnection {
        self.timer.timer(when, function)
    }

    /// Registers a one-shot timer; see
    /// [`TimerDispatcher::one_shot_timer`].
    pub fn one_shot_timer(
        &self,
        when: Instant,
        function: impl FnOnce(Instant) + Send + 'static,
    ) -> TimerConnection {
        self.timer.one_shot_timer(when, function)
    }

    /// Registers an async-safe procedure; see
    /// [`AsyncSafeWorkDispatcher::async_procedure`].
    pub fn async_procedure(
        &self,
        function: impl Fn() + Send + Sync + 'static,
    ) -> AsyncSafeConnection {
        self.async_work.async_procedure(function)
    }

    /// The trigger shared by every source of this reactor. Raising it
    /// interrupts a dispatch call sleeping in the kernel.
    pub fn eventtrigger(&self) -> Arc<dyn EventFlag> {
        self.trigger.clone()
    }

    /// Performs one dispatch step, sleeping until the next timer
    /// deadline (or indefinitely) if no event is pending.
    pub fn dispatch(&self) -> Result<()> {
        let timeout = self.run_due_timers();
        self.io.dispatch(timeout, usize::MAX)?;
        self.async_work.dispatch();
        self.drain_workqueue();
        Ok(())
    }

    /// Services whatever is pending right now across all sources without
    /// ever sleeping. Returns whether anything was processed; callers
    /// that want a full drain iterate until it reports idle (or use
    /// [`dispatch_pending_all`](Reactor::dispatch_pending_all)).
    pub fn dispatch_pending(&self) -> Result<bool> {
        let mut processed = false;

        if let Some(deadline) = self.timer.next_timer() {
            let now = Instant::now();
            if deadline <= now {
                let mut t = now;
                self.timer.run_queue(&mut t);
                processed = true;
            }
        }

        if self.io.dispatch_pending(usize::MAX)? > 0 {
            processed = true;
        }

        if self.async_work.dispatch() > 0 {
            processed = true;
        }

        if self.drain_workqueue() > 0 {
            processed = true;
        }

        Ok(processed)
    }

    /// Runs [`dispatch_pending`](Reactor::dispatch_pending) until no
    /// source has anything left.
    pub fn dispatch_pending_all(&self) -> Result<()> {
        while self.dispatch_pending()? {}
        Ok(())
    }

    /// Runs expired timers and converts the earliest remaining deadline
    /// into the timeout for the kernel wait.
    fn run_due_timers(&self) -> Option<Duration> {
        loop {
            let mut next = Instant::now();
            if !self.timer.run_queue(&mut next) {
                return None;
            }
            let now = Instant::now();
            if next > now {
                return Some(next - now);
            }
            /* running the queue took long enough that the next timer is
            already due */
        }
    }

    /// Moves the posted work into a local list, then runs it with no
    /// locks held.
    fn drain_workqueue(&self) -> usize {
        let items: Vec<WorkItem> = self.work_rx.try_iter().collect();
        let count = items.len();
        for item in items {
            item();
        }
        count
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Reactor { .. }")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sys;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn posted_work_runs_on_dispatch() {
        let reactor = Reactor::new().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let r = runs.clone();
        reactor.post(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });
        reactor.dispatch_pending_all().unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn post_wakes_a_blocked_dispatcher() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let runs = Arc::new(AtomicUsize::new(0));

        let r2 = reactor.clone();
        let driver = thread::spawn(move || {
            /* no timers pending: this would sleep forever without the
            wakeup from post */
            r2.dispatch().unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        let r = runs.clone();
        reactor.post(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });
        driver.join().unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn expired_timer_fires_through_dispatch() {
        let reactor = Reactor::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let start = Instant::now();
        let f = fired.clone();
        reactor.one_shot_timer(start + Duration::from_millis(30), move |_| {
            f.fetch_add(1, Ordering::Relaxed);
        });

        while fired.load(Ordering::Relaxed) == 0 {
            reactor.dispatch().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn fd_readiness_flows_through_reactor() {
        let reactor = Reactor::new().unwrap();
        let (read_fd, write_fd) = sys::create_wake_pipe().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));

        let s = seen.clone();
        let _conn = reactor
            .watch(
                move |events| {
                    assert!(events.contains(IoReadyEvents::INPUT));
                    s.fetch_add(1, Ordering::Relaxed);
                },
                read_fd,
                IoReadyEvents::INPUT,
            )
            .unwrap();

        sys::write_wake_byte(write_fd);
        while seen.load(Ordering::Relaxed) == 0 {
            reactor.dispatch().unwrap();
        }
        assert_eq!(seen.load(Ordering::Relaxed), 1);

        sys::drain_wake_byte(read_fd);
        let _ = nix::unistd::close(read_fd);
        let _ = nix::unistd::close(write_fd);
    }

    #[test]
    fn async_procedure_marked_from_second_thread() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let runs = Arc::new(AtomicUsize::new(0));

        let r = runs.clone();
        let conn = reactor.async_procedure(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });

        let marker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            conn.set();
        });

        while runs.load(Ordering::Relaxed) == 0 {
            reactor.dispatch().unwrap();
        }
        marker.join().unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn builder_accepts_existing_io_dispatcher() {
        let io = create_ioready_dispatcher().unwrap();
        let reactor = ReactorBuilder::new().io_dispatcher(io).build().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        reactor.post(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });
        reactor.dispatch_pending_all().unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }
}
