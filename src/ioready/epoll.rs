// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! I/O readiness dispatching through the `epoll_*` family of system
//! calls.
//!
//! All relevant operations are O(1) in the number of watched
//! descriptors, and [`dispatch`](crate::IoReadyDispatcher::dispatch) can
//! usefully be called from multiple threads.
//!
//! Registrations and the dispatch path synchronize through a
//! [`DeferrableRwLock`]: dispatching threads are readers, registration
//! changes are (mostly deferred) writers, and the physical release of
//! cancelled callbacks happens at the quiescent point between them.

use log::debug;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::fd_table::{FdHandlerTable, IoReadyLink};
use super::{IoReadyConnection, IoReadyDispatcher, IoReadyEvents, IoReadyFn, IoReadyService};
use crate::deferred::{DeferrableRwLock, SyncGuard, WriteLock};
use crate::error::{errno_to_io, ReflexError, Result};
use crate::eventflag::{EventFlag, PipeEventFlag};
use crate::sys;

/// Events are drained from the kernel in fixed-size batches; a `dispatch`
/// call processes at most this many before returning.
const MAX_EVENTS: usize = 16;

const INITIAL_TABLE_CAPACITY: usize = 32;

fn translate_os_to_reflex(ev: EpollFlags) -> IoReadyEvents {
    let mut events = IoReadyEvents::NONE;
    if ev.contains(EpollFlags::EPOLLIN) {
        events |= IoReadyEvents::INPUT;
    }
    if ev.contains(EpollFlags::EPOLLOUT) {
        events |= IoReadyEvents::OUTPUT;
    }
    /* hangup and error conditions concern input and output handlers
    alike */
    if ev.contains(EpollFlags::EPOLLHUP) {
        events |= IoReadyEvents::INPUT
            | IoReadyEvents::OUTPUT
            | IoReadyEvents::HANGUP
            | IoReadyEvents::ERROR;
    }
    if ev.contains(EpollFlags::EPOLLERR) {
        events |= IoReadyEvents::INPUT | IoReadyEvents::OUTPUT | IoReadyEvents::ERROR;
    }
    events
}

fn translate_reflex_to_os(events: IoReadyEvents) -> EpollFlags {
    let mut ev = EpollFlags::empty();
    if events.contains(IoReadyEvents::INPUT) {
        ev |= EpollFlags::EPOLLIN;
    }
    if events.contains(IoReadyEvents::OUTPUT) {
        ev |= EpollFlags::EPOLLOUT;
    }
    ev
}

struct WakeupState {
    flag: Arc<PipeEventFlag>,
    /* watches the pipe's read end; torn down with everything else by
    disconnect_all on drop */
    _conn: IoReadyConnection,
}

pub(crate) struct EpollInner {
    epoll_fd: RawFd,
    fdtab: FdHandlerTable,
    lock: DeferrableRwLock,
    wakeup: Mutex<Option<WakeupState>>,
    /// Fast-path alias of the flag inside `wakeup`, so the dispatch loop
    /// can test it without the mutex. Kept alive by the `Arc` in
    /// `wakeup` for the dispatcher's whole lifetime.
    wakeup_ptr: AtomicPtr<PipeEventFlag>,
}

impl EpollInner {
    fn synchronize(&self, guard: SyncGuard<'_>) {
        let release = unsafe { self.fdtab.synchronize() };
        guard.finished();
        /* dropping `release` clears the cancelled handlers outside the
        lock */
        drop(release);
    }

    fn finish_write(&self, wl: WriteLock<'_>) {
        match wl {
            WriteLock::Sync(g) => self.synchronize(g),
            WriteLock::Deferred(g) => drop(g),
        }
    }

    /// Reconciles the kernel subscription for `fd` from `old_mask` to
    /// `new_mask`.
    fn update_kernel(&self, fd: RawFd, old_mask: IoReadyEvents, new_mask: IoReadyEvents) -> nix::Result<()> {
        if old_mask == new_mask {
            return Ok(());
        }
        if !new_mask.is_empty() {
            let mut event = EpollEvent::new(translate_reflex_to_os(new_mask), fd as u64);
            let op = if old_mask.is_empty() {
                EpollOp::EpollCtlAdd
            } else {
                EpollOp::EpollCtlMod
            };
            epoll_ctl(self.epoll_fd, op, fd, &mut event)
        } else if !old_mask.is_empty() {
            epoll_ctl(
                self.epoll_fd,
                EpollOp::EpollCtlDel,
                fd,
                None as Option<&mut EpollEvent>,
            )
        } else {
            Ok(())
        }
    }

    fn register(
        &self,
        function: Box<IoReadyFn>,
        fd: RawFd,
        event_mask: IoReadyEvents,
    ) -> Result<IoReadyConnection> {
        if fd < 0 {
            return Err(ReflexError::KernelRegistration {
                fd,
                source: errno_to_io(nix::errno::Errno::EBADF),
            });
        }
        let event_mask = event_mask.widen();
        let link = Arc::new(IoReadyLink::new(function, fd, event_mask));

        let reg = link.registration_mutex().lock().unwrap();
        let wl = self.lock.write_lock_async();

        let ptr = Arc::into_raw(link.clone());
        let (old_mask, new_mask) = unsafe { self.fdtab.insert(ptr) };

        let mut rollback = None;
        if let Err(errno) = self.update_kernel(fd, old_mask, new_mask) {
            /* the kernel refused: undo the insert so no chain invariant
            is left dangling, and let the quiescent cleanup release the
            reference the insert consumed */
            debug!("epoll registration for fd {} failed ({}), rolling back", fd, errno);
            unsafe {
                self.fdtab.remove(&link);
            }
            rollback = Some(errno);
        } else {
            link.attach(self);
        }

        drop(reg);
        self.finish_write(wl);

        match rollback {
            Some(errno) => Err(ReflexError::KernelRegistration {
                fd,
                source: errno_to_io(errno),
            }),
            None => Ok(IoReadyConnection::new(link)),
        }
    }

    /// Called by a link's disconnect with its registration mutex held.
    pub(crate) fn unregister_link(&self, link: &IoReadyLink, reg: MutexGuard<'_, ()>) {
        let wl = self.lock.write_lock_async();
        if link.attached_to(self) {
            let fd = link.fd();
            let (old_mask, new_mask) = unsafe { self.fdtab.remove(link) };
            if let Err(errno) = self.update_kernel(fd, old_mask, new_mask) {
                /* the descriptor may already have been closed by the
                receiver; the registration is gone either way */
                debug!("epoll deregistration for fd {} failed ({})", fd, errno);
            }
            link.detach();
        }
        drop(reg);
        self.finish_write(wl);
    }

    /// Called by a link's `modify` with its registration mutex held.
    pub(crate) fn modify_link(&self, link: &IoReadyLink, event_mask: IoReadyEvents) {
        let wl = self.lock.write_lock_async();
        let fd = link.fd();
        let (old_mask, new_mask) = unsafe { self.fdtab.modify(link, event_mask) };
        if let Err(errno) = self.update_kernel(fd, old_mask, new_mask) {
            debug!("epoll mask change for fd {} failed ({})", fd, errno);
        }
        self.finish_write(wl);
    }

    fn process_events(&self, events: &[EpollEvent], call_cookie: u32) {
        for event in events {
            loop {
                match self.lock.read_lock() {
                    None => break,
                    Some(g) => self.synchronize(g),
                }
            }
            let fd = event.data() as RawFd;
            self.fdtab
                .notify(fd, translate_os_to_reflex(event.events()), call_cookie);
            if let Some(g) = self.lock.read_unlock() {
                self.synchronize(g);
            }
        }
    }

    fn wait_for_events(
        &self,
        events: &mut [EpollEvent],
        timeout_ms: isize,
    ) -> Result<usize> {
        match epoll_wait(self.epoll_fd, events, timeout_ms) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EINTR) => Ok(0),
            Err(errno) => Err(ReflexError::IoError(errno_to_io(errno))),
        }
    }

    fn dispatch(&self, timeout: Option<Duration>, limit: usize) -> Result<usize> {
        /* the snapshot must precede the kernel wait: any chain recreated
        for a reused descriptor after this point will carry a newer
        cookie and reject our events */
        let call_cookie = self.fdtab.cookie();
        let mut timeout_ms = sys::timeout_to_epoll_ms(timeout);
        let max = limit.min(MAX_EVENTS).max(1);
        let mut events = [EpollEvent::empty(); MAX_EVENTS];

        let flag_ptr = self.wakeup_ptr.load(Ordering::Acquire);
        let result = if flag_ptr.is_null() {
            self.wait_for_events(&mut events[..max], timeout_ms)
        } else {
            let flag = unsafe { &*flag_ptr };
            flag.start_waiting();
            if flag.is_set() {
                timeout_ms = 0;
            }
            let result = self.wait_for_events(&mut events[..max], timeout_ms);
            flag.stop_waiting();
            result
        };

        let clear_flag = || {
            if !flag_ptr.is_null() {
                unsafe { &*flag_ptr }.clear();
            }
        };
        match result {
            Ok(n) => {
                self.process_events(&events[..n], call_cookie);
                clear_flag();
                Ok(n)
            }
            Err(e) => {
                clear_flag();
                Err(e)
            }
        }
    }

    fn dispatch_pending(&self, limit: usize) -> Result<usize> {
        let call_cookie = self.fdtab.cookie();
        let max = limit.min(MAX_EVENTS).max(1);
        let mut events = [EpollEvent::empty(); MAX_EVENTS];

        let result = self.wait_for_events(&mut events[..max], 0);
        let flag_ptr = self.wakeup_ptr.load(Ordering::Acquire);
        let clear_flag = || {
            if !flag_ptr.is_null() {
                unsafe { &*flag_ptr }.clear();
            }
        };
        match result {
            Ok(n) => {
                self.process_events(&events[..n], call_cookie);
                clear_flag();
                Ok(n)
            }
            Err(e) => {
                clear_flag();
                Err(e)
            }
        }
    }

    fn eventtrigger(&self) -> Result<Arc<PipeEventFlag>> {
        let mut state = self.wakeup.lock().unwrap();
        if let Some(wakeup) = &*state {
            return Ok(wakeup.flag.clone());
        }

        let flag = Arc::new(PipeEventFlag::new()?);
        /* the byte a wakeup posts has to land somewhere: watch the read
        end as an ordinary input source. The handler has nothing to do
        (the flag's own clear() consumes the byte), but the registration
        makes the kernel wait return. */
        let conn = self.register(Box::new(|_| {}), flag.read_fd(), IoReadyEvents::INPUT)?;

        self.wakeup_ptr
            .store(Arc::as_ptr(&flag) as *mut _, Ordering::Release);
        *state = Some(WakeupState {
            flag: flag.clone(),
            _conn: conn,
        });
        Ok(flag)
    }
}

/// I/O readiness dispatcher for Linux, backed by `epoll`.
///
/// ```no_run
/// use reflex::{EpollDispatcher, IoReadyDispatcher, IoReadyEvents, IoReadyService};
/// use std::time::Duration;
///
/// # fn watch(fd: std::os::unix::io::RawFd) -> reflex::Result<()> {
/// let dispatcher = EpollDispatcher::new()?;
/// let conn = dispatcher.watch(
///     Box::new(|events| println!("ready: {:?}", events)),
///     fd,
///     IoReadyEvents::INPUT,
/// )?;
/// dispatcher.dispatch(Some(Duration::from_secs(1)), 16)?;
/// # Ok(())
/// # }
/// ```
pub struct EpollDispatcher {
    /* boxed so registered links can carry a stable back-pointer */
    inner: Box<EpollInner>,
}

impl EpollDispatcher {
    /// Creates the dispatcher, including its kernel epoll instance.
    pub fn new() -> Result<EpollDispatcher> {
        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|errno| ReflexError::DispatcherCreate(errno_to_io(errno)))?;
        Ok(EpollDispatcher {
            inner: Box::new(EpollInner {
                epoll_fd,
                fdtab: FdHandlerTable::new(INITIAL_TABLE_CAPACITY),
                lock: DeferrableRwLock::new(),
                wakeup: Mutex::new(None),
                wakeup_ptr: AtomicPtr::new(ptr::null_mut()),
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn fdtab(&self) -> &FdHandlerTable {
        &self.inner.fdtab
    }
}

impl IoReadyService for EpollDispatcher {
    fn watch(
        &self,
        function: Box<IoReadyFn>,
        fd: RawFd,
        event_mask: IoReadyEvents,
    ) -> Result<IoReadyConnection> {
        self.inner.register(function, fd, event_mask)
    }
}

impl IoReadyDispatcher for EpollDispatcher {
    fn dispatch(&self, timeout: Option<Duration>, limit: usize) -> Result<usize> {
        self.inner.dispatch(timeout, limit)
    }

    fn dispatch_pending(&self, limit: usize) -> Result<usize> {
        self.inner.dispatch_pending(limit)
    }

    fn eventtrigger(&self) -> Result<Arc<dyn EventFlag>> {
        Ok(self.inner.eventtrigger()?)
    }
}

impl Drop for EpollDispatcher {
    fn drop(&mut self) {
        /* Teardown assumes no thread is still dispatching or registering
        on this object; connections disconnecting concurrently from
        other threads are handled below via the forced synchronization
        point. */
        let inner = &*self.inner;
        loop {
            match inner.lock.read_lock() {
                None => break,
                Some(g) => inner.synchronize(g),
            }
        }
        inner.fdtab.disconnect_all();
        if let Some(g) = inner.lock.read_unlock() {
            inner.synchronize(g);
        } else {
            /* a callback was cancelled concurrently; suspend until its
            cleanup has run */
            let g = inner.lock.write_lock_sync();
            inner.synchronize(g);
        }
        let _ = nix::unistd::close(inner.epoll_fd);
    }
}

impl std::fmt::Debug for EpollDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("EpollDispatcher { .. }")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::eventflag::EventTrigger;
    use crate::sys;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Pipe {
        read_fd: RawFd,
        write_fd: RawFd,
    }

    impl Pipe {
        fn new() -> Pipe {
            let (read_fd, write_fd) = sys::create_wake_pipe().unwrap();
            Pipe { read_fd, write_fd }
        }

        fn poke(&self) {
            sys::write_wake_byte(self.write_fd);
        }
    }

    impl Drop for Pipe {
        fn drop(&mut self) {
            let _ = nix::unistd::close(self.read_fd);
            let _ = nix::unistd::close(self.write_fd);
        }
    }

    #[test]
    fn readiness_is_delivered_and_mask_change_suppresses_it() {
        let dispatcher = EpollDispatcher::new().unwrap();
        let pipe = Pipe::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let conn = dispatcher
            .watch(
                Box::new(move |ev| s.lock().unwrap().push(ev)),
                pipe.read_fd,
                IoReadyEvents::INPUT,
            )
            .unwrap();

        pipe.poke();
        let n = dispatcher
            .dispatch(Some(Duration::from_secs(1)), 16)
            .unwrap();
        assert_eq!(n, 1);
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert!(seen[0].contains(IoReadyEvents::INPUT));
        }

        /* an empty mask keeps the connection but suppresses delivery */
        conn.modify(IoReadyEvents::NONE);
        assert!(conn.is_connected());
        pipe.poke();
        let n = dispatcher
            .dispatch(Some(Duration::from_millis(10)), 16)
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn invalid_fd_registration_is_rolled_back() {
        let dispatcher = EpollDispatcher::new().unwrap();
        let err = dispatcher
            .watch(Box::new(|_| {}), -1, IoReadyEvents::INPUT)
            .unwrap_err();
        match err {
            ReflexError::KernelRegistration { fd, .. } => assert_eq!(fd, -1),
            other => panic!("unexpected error: {:?}", other),
        }

        /* a closed descriptor is rejected by the kernel itself */
        let pipe = Pipe::new();
        let stale_fd = pipe.read_fd;
        drop(pipe);
        let err = dispatcher
            .watch(Box::new(|_| {}), stale_fd, IoReadyEvents::INPUT)
            .unwrap_err();
        match err {
            ReflexError::KernelRegistration { fd, .. } => assert_eq!(fd, stale_fd),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn trigger_wakes_a_sleeping_dispatch() {
        let dispatcher = Arc::new(EpollDispatcher::new().unwrap());
        let trigger = dispatcher.eventtrigger().unwrap();

        let d2 = dispatcher.clone();
        let sleeper = thread::spawn(move || d2.dispatch(Some(Duration::from_secs(30)), 16));

        thread::sleep(Duration::from_millis(50));
        trigger.set();
        /* the wakeup byte surfaces as one (internal) processed event;
        what matters is that the 30s sleep ends promptly */
        sleeper.join().unwrap().unwrap();
    }

    #[test]
    fn trigger_set_before_dispatch_prevents_sleeping() {
        let dispatcher = EpollDispatcher::new().unwrap();
        let trigger = dispatcher.eventtrigger().unwrap();
        trigger.set();
        let start = std::time::Instant::now();
        dispatcher.dispatch(Some(Duration::from_secs(30)), 16).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn disconnected_callback_is_not_invoked_again() {
        let dispatcher = EpollDispatcher::new().unwrap();
        let pipe = Pipe::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let mut conn = dispatcher
            .watch(
                Box::new(move |_| {
                    h.fetch_add(1, Ordering::Relaxed);
                }),
                pipe.read_fd,
                IoReadyEvents::INPUT,
            )
            .unwrap();

        pipe.poke();
        dispatcher
            .dispatch(Some(Duration::from_secs(1)), 16)
            .unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        conn.disconnect();
        assert!(!conn.is_connected());
        pipe.poke();
        dispatcher
            .dispatch(Some(Duration::from_millis(10)), 16)
            .unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn fd_table_grows_under_traffic_and_frees_old_tables() {
        let dispatcher = EpollDispatcher::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        /* enough pipes to push descriptors past the initial table
        capacity several times over */
        let pipes: Vec<Pipe> = (0..48).map(|_| Pipe::new()).collect();
        let mut conns = Vec::new();
        for pipe in &pipes {
            let h = hits.clone();
            conns.push(
                dispatcher
                    .watch(
                        Box::new(move |_| {
                            h.fetch_add(1, Ordering::Relaxed);
                        }),
                        pipe.read_fd,
                        IoReadyEvents::INPUT,
                    )
                    .unwrap(),
            );
        }

        for pipe in &pipes {
            pipe.poke();
        }
        let mut processed = 0;
        while processed < pipes.len() {
            processed += dispatcher
                .dispatch(Some(Duration::from_secs(1)), 16)
                .unwrap();
        }
        assert_eq!(hits.load(Ordering::Relaxed), pipes.len());

        /* the dispatch loop passed several quiescent points, which must
        have reclaimed the superseded tables */
        assert_eq!(dispatcher.fdtab().old_table_count(), 0);

        for conn in &mut conns {
            conn.disconnect();
        }
    }
}
