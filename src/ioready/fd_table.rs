// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Handler table mapping file descriptors to their callback chains.
//!
//! The table maintains one chain per descriptor, using the same dual-list
//! protocol as [`Signal`](crate::Signal): an atomic active list that a
//! notifier traverses lock-free, a writer-guarded full list, and physical
//! reclamation deferred to the quiescent point. The table itself grows
//! monotonically - a resize publishes a larger copy and parks the old
//! allocation on a chain that is freed at the next quiescent point, since
//! a concurrent notifier may still be walking it.
//!
//! Concurrency contract (synchronization itself is the caller's - i.e.
//! the dispatcher's - job, via its deferred lock):
//!
//! - `notify` and `disconnect_all` may run concurrently with any single
//!   mutating function (`insert`, `remove`, `modify`);
//! - mutating functions must be serialized against each other;
//! - `synchronize` must be exclusive against everything.
//!
//! # Descriptor reuse and cookies
//!
//! When the last callback for a descriptor goes away the process will
//! often close and promptly reuse that descriptor. A kernel event fetched
//! before the reuse could then be delivered into the chain of the *new*
//! registration. Every chain therefore carries a generation cookie that
//! advances when a chain empties; a notifier snapshots the global cookie
//! before fetching events and [`notify`](FdHandlerTable::notify) drops
//! deliveries whose chain has advanced past the snapshot.

use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::epoll::EpollInner;
use super::{IoReadyEvents, IoReadyFn};
use crate::connection::ErasedLink;

/// Full-list and deferred-release linkage; writer-lock guarded.
struct IoListPtrs {
    prev: *const IoReadyLink,
    next: *const IoReadyLink,
    inactive_next: *const IoReadyLink,
}

pub(crate) struct IoReadyLink {
    /// Cleared at the quiescent point, outside all locks.
    function: UnsafeCell<Option<Box<IoReadyFn>>>,
    fd: RawFd,
    /// Watched conditions; mutated only under the dispatcher's writer
    /// lock, loaded relaxed by observers.
    event_mask: AtomicU32,
    active_next: AtomicPtr<IoReadyLink>,
    list: UnsafeCell<IoListPtrs>,
    /// Owning dispatcher; null once disconnected. Dereferenced only
    /// under `registration_mutex`, and the dispatcher disconnects every
    /// link before its own teardown completes.
    service: AtomicPtr<EpollInner>,
    registration_mutex: Mutex<()>,
}

unsafe impl Send for IoReadyLink {}
unsafe impl Sync for IoReadyLink {}

impl IoReadyLink {
    pub(crate) fn new(function: Box<IoReadyFn>, fd: RawFd, event_mask: IoReadyEvents) -> Self {
        IoReadyLink {
            function: UnsafeCell::new(Some(function)),
            fd,
            event_mask: AtomicU32::new(event_mask.bits()),
            active_next: AtomicPtr::new(ptr::null_mut()),
            list: UnsafeCell::new(IoListPtrs {
                prev: ptr::null(),
                next: ptr::null(),
                inactive_next: ptr::null(),
            }),
            service: AtomicPtr::new(ptr::null_mut()),
            registration_mutex: Mutex::new(()),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn registration_mutex(&self) -> &Mutex<()> {
        &self.registration_mutex
    }

    pub(crate) fn event_mask(&self) -> IoReadyEvents {
        IoReadyEvents::from_bits(self.event_mask.load(Ordering::Relaxed))
    }

    pub(crate) fn set_event_mask(&self, mask: IoReadyEvents) {
        self.event_mask.store(mask.bits(), Ordering::Relaxed);
    }

    pub(crate) fn attach(&self, service: *const EpollInner) {
        self.service.store(service as *mut _, Ordering::Relaxed);
    }

    pub(crate) fn detach(&self) {
        self.service.store(ptr::null_mut(), Ordering::Relaxed);
    }

    pub(crate) fn attached_to(&self, service: *const EpollInner) -> bool {
        self.service.load(Ordering::Relaxed) == service as *mut _
    }

    pub(crate) fn modify(&self, event_mask: IoReadyEvents) {
        let event_mask = event_mask.widen();
        let guard = self.registration_mutex.lock().unwrap();
        let service = self.service.load(Ordering::Relaxed);
        if !service.is_null() {
            unsafe { (*service).modify_link(self, event_mask) };
        }
        drop(guard);
    }
}

impl ErasedLink for IoReadyLink {
    fn disconnect(&self) {
        let guard = self.registration_mutex.lock().unwrap();
        let service = self.service.load(Ordering::Relaxed);
        if service.is_null() {
            return;
        }
        unsafe { (*service).unregister_link(self, guard) };
    }

    fn is_connected(&self) -> bool {
        !self.service.load(Ordering::Relaxed).is_null()
    }
}

/// Ends of a per-fd full list; writer-lock guarded.
struct ChainEnds {
    first: *const IoReadyLink,
    last: *const IoReadyLink,
}

struct FdChain {
    active: AtomicPtr<IoReadyLink>,
    ends: UnsafeCell<ChainEnds>,
    cookie: AtomicU32,
}

unsafe impl Send for FdChain {}
unsafe impl Sync for FdChain {}

impl FdChain {
    fn new() -> Self {
        FdChain {
            active: AtomicPtr::new(ptr::null_mut()),
            ends: UnsafeCell::new(ChainEnds {
                first: ptr::null(),
                last: ptr::null(),
            }),
            cookie: AtomicU32::new(0),
        }
    }

    fn compute_event_mask(&self) -> IoReadyEvents {
        let mut mask = IoReadyEvents::NONE;
        let mut link = self.active.load(Ordering::Relaxed) as *const IoReadyLink;
        while !link.is_null() {
            unsafe {
                mask |= (*link).event_mask();
                link = (*link).active_next.load(Ordering::Relaxed);
            }
        }
        mask
    }
}

struct Table {
    capacity: usize,
    entries: Box<[AtomicPtr<FdChain>]>,
    old: UnsafeCell<*mut Table>,
}

unsafe impl Send for Table {}
unsafe impl Sync for Table {}

impl Table {
    fn new(capacity: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Table {
            capacity,
            entries,
            old: UnsafeCell::new(ptr::null_mut()),
        }
    }
}

/// Links whose physical release was deferred past the quiescent point.
/// Dropping this clears each link's stored function and releases the
/// chain's reference; the dispatcher drops it outside all locks.
pub(crate) struct DelayedHandlerRelease {
    head: *const IoReadyLink,
}

unsafe impl Send for DelayedHandlerRelease {}

impl Drop for DelayedHandlerRelease {
    fn drop(&mut self) {
        let mut current = self.head;
        unsafe {
            while !current.is_null() {
                let next = (*(*current).list.get()).inactive_next;
                *(*current).function.get() = None;
                drop(Arc::from_raw(current));
                current = next;
            }
        }
    }
}

pub(crate) struct FdHandlerTable {
    table: AtomicPtr<Table>,
    /// Stack of removed links awaiting release; writer-lock guarded.
    inactive: UnsafeCell<*const IoReadyLink>,
    cookie: AtomicU32,
    /// Set when the per-chain cookie counter crossed a 2^16 boundary;
    /// `synchronize` then re-stamps every chain so that the wrapped
    /// comparison in `notify` stays well-ordered.
    need_cookie_sync: UnsafeCell<bool>,
}

unsafe impl Send for FdHandlerTable {}
unsafe impl Sync for FdHandlerTable {}

impl FdHandlerTable {
    pub(crate) fn new(initial: usize) -> Self {
        FdHandlerTable {
            table: AtomicPtr::new(Box::into_raw(Box::new(Table::new(initial.max(1))))),
            inactive: UnsafeCell::new(ptr::null()),
            cookie: AtomicU32::new(0),
            need_cookie_sync: UnsafeCell::new(false),
        }
    }

    /// Snapshot of the global generation cookie; taken before fetching
    /// events from the kernel and passed back into `notify`.
    pub(crate) fn cookie(&self) -> u32 {
        self.cookie.load(Ordering::Relaxed)
    }

    /// Registers the link (consuming the chain's strong reference, which
    /// `ptr` carries) and returns the old and new effective event masks
    /// for its descriptor. Must run under the writer lock.
    pub(crate) unsafe fn insert(&self, ptr: *const IoReadyLink) -> (IoReadyEvents, IoReadyEvents) {
        let chain = self.get_create_chain((*ptr).fd);

        let old_mask = (*chain).compute_event_mask();
        let new_mask = old_mask | (*ptr).event_mask();

        let ends = &mut *(*chain).ends.get();
        {
            let ptrs = &mut *(*ptr).list.get();
            ptrs.prev = ends.last;
            ptrs.next = ptr::null();
        }
        (*ptr).active_next.store(ptr::null_mut(), Ordering::Relaxed);

        /* several pointers to the link get published below; one fence
        covers them all */
        fence(Ordering::Release);

        /* splice onto the active list across the ragged tail, exactly as
        the signal chain does */
        let mut tmp = ends.last;
        loop {
            if tmp.is_null() {
                if (*chain).active.load(Ordering::Relaxed).is_null() {
                    (*chain).active.store(ptr as *mut _, Ordering::Release);
                }
                break;
            }
            if !(*tmp).active_next.load(Ordering::Relaxed).is_null() {
                break;
            }
            (*tmp).active_next.store(ptr as *mut _, Ordering::Release);
            tmp = (*(*tmp).list.get()).prev;
        }

        if ends.last.is_null() {
            ends.first = ptr;
        } else {
            (*(*ends.last).list.get()).next = ptr;
        }
        ends.last = ptr;

        (old_mask, new_mask)
    }

    /// Unlinks the link from the active list and queues it for release
    /// at the quiescent point. Returns the old and new effective masks.
    /// Must run under the writer lock.
    pub(crate) unsafe fn remove(&self, link: &IoReadyLink) -> (IoReadyEvents, IoReadyEvents) {
        let chain = self.get_chain(link.fd);
        debug_assert!(!chain.is_null());
        let link_ptr = link as *const IoReadyLink;

        let next = link.active_next.load(Ordering::Relaxed);
        let mut tmp = (*link.list.get()).prev;
        loop {
            if tmp.is_null() {
                if (*chain).active.load(Ordering::Relaxed) == link_ptr as *mut _ {
                    (*chain).active.store(next, Ordering::Release);
                }
                break;
            }
            if (*tmp).active_next.load(Ordering::Relaxed) != link_ptr as *mut _ {
                break;
            }
            (*tmp).active_next.store(next, Ordering::Release);
            tmp = (*(*tmp).list.get()).prev;
        }

        let new_mask = (*chain).compute_event_mask();
        let old_mask = new_mask | link.event_mask();

        /* chain emptied: the program may close and reuse the descriptor
        immediately, so advance the generation to invalidate events that
        were fetched against the old registration */
        if (*chain).active.load(Ordering::Relaxed).is_null() {
            let old_cookie = self.cookie.fetch_add(1, Ordering::Relaxed);
            let new_cookie = old_cookie.wrapping_add(1);
            (*chain).cookie.store(new_cookie, Ordering::Relaxed);
            if ((old_cookie ^ new_cookie) & (1 << 16)) != 0 {
                *self.need_cookie_sync.get() = true;
            }
        }

        {
            let inactive = &mut *self.inactive.get();
            (*link.list.get()).inactive_next = *inactive;
            *inactive = link_ptr;
        }

        (old_mask, new_mask)
    }

    /// Changes the link's watched conditions, returning the old and new
    /// effective masks for its descriptor. Must run under the writer
    /// lock.
    pub(crate) unsafe fn modify(
        &self,
        link: &IoReadyLink,
        event_mask: IoReadyEvents,
    ) -> (IoReadyEvents, IoReadyEvents) {
        let chain = self.get_chain(link.fd);
        debug_assert!(!chain.is_null());
        let old_mask = (*chain).compute_event_mask();
        link.set_event_mask(event_mask);
        let new_mask = (*chain).compute_event_mask();
        (old_mask, new_mask)
    }

    /// Delivers `events` to every active callback registered for `fd`
    /// whose mask matches, unless the chain's generation has advanced
    /// past `call_cookie` (the snapshot is then stale and the whole
    /// delivery is dropped). Read-side: runs under the read lock.
    pub(crate) fn notify(&self, fd: RawFd, events: IoReadyEvents, call_cookie: u32) {
        if fd < 0 {
            return;
        }
        let index = fd as usize;
        unsafe {
            let table = self.table.load(Ordering::Acquire);
            if index >= (*table).capacity {
                return;
            }
            let chain = (*table).entries[index].load(Ordering::Acquire);
            if chain.is_null() {
                return;
            }

            let delta = (*chain).cookie.load(Ordering::Relaxed).wrapping_sub(call_cookie) as i32;
            if delta > 0 {
                return;
            }

            let mut link = (*chain).active.load(Ordering::Acquire) as *const IoReadyLink;
            while !link.is_null() {
                let mask = (*link).event_mask();
                if events.intersects(mask) {
                    if let Some(f) = (*(*link).function.get()).as_ref() {
                        f(events & mask);
                    }
                }
                link = (*link).active_next.load(Ordering::Acquire);
            }
        }
    }

    /// Disconnects every registered link. Read-side; each disconnect
    /// re-enters the dispatcher's writer path, which the deferred lock
    /// permits.
    pub(crate) fn disconnect_all(&self) -> bool {
        let mut any_disconnected = false;
        unsafe {
            let table = self.table.load(Ordering::Acquire);
            for n in 0..(*table).capacity {
                let chain = (*table).entries[n].load(Ordering::Acquire);
                if chain.is_null() {
                    continue;
                }
                loop {
                    let link = (*chain).active.load(Ordering::Acquire);
                    if link.is_null() {
                        break;
                    }
                    any_disconnected = true;
                    (*link).disconnect();
                }
            }
        }
        any_disconnected
    }

    /// Applies all deferred structural cleanup: frees superseded tables,
    /// detaches removed links from their full lists and re-stamps chain
    /// cookies after a counter wrap. Must run with exclusive rights; the
    /// returned value performs the final (lock-free) release when
    /// dropped.
    pub(crate) unsafe fn synchronize(&self) -> DelayedHandlerRelease {
        self.deallocate_old_tables();
        let table = self.table.load(Ordering::Relaxed);

        let mut link = *self.inactive.get();
        while !link.is_null() {
            let chain = (*table).entries[(*link).fd as usize].load(Ordering::Relaxed);
            let ends = &mut *(*chain).ends.get();
            let ptrs = &*(*link).list.get();
            if ptrs.prev.is_null() {
                ends.first = ptrs.next;
            } else {
                (*(*ptrs.prev).list.get()).next = ptrs.next;
            }
            if ptrs.next.is_null() {
                ends.last = ptrs.prev;
            } else {
                (*(*ptrs.next).list.get()).prev = ptrs.prev;
            }
            link = ptrs.inactive_next;
        }

        let need_cookie_sync = &mut *self.need_cookie_sync.get();
        if *need_cookie_sync {
            *need_cookie_sync = false;
            let current = self.cookie.load(Ordering::Relaxed);
            for n in 0..(*table).capacity {
                let chain = (*table).entries[n].load(Ordering::Relaxed);
                if !chain.is_null() {
                    (*chain).cookie.store(current, Ordering::Relaxed);
                }
            }
        }

        let head = *self.inactive.get();
        *self.inactive.get() = ptr::null();
        DelayedHandlerRelease { head }
    }

    unsafe fn deallocate_old_tables(&self) {
        let table = self.table.load(Ordering::Relaxed);
        let mut old = *(*table).old.get();
        *(*table).old.get() = ptr::null_mut();
        while !old.is_null() {
            let next = *(*old).old.get();
            drop(Box::from_raw(old));
            old = next;
        }
    }

    unsafe fn get_create_chain(&self, fd: RawFd) -> *const FdChain {
        debug_assert!(fd >= 0);
        let index = fd as usize;

        let mut table = self.table.load(Ordering::Relaxed);
        if index >= (*table).capacity {
            table = self.extend_table(table, index + 1);
        }

        let mut chain = (*table).entries[index].load(Ordering::Relaxed);
        if chain.is_null() {
            chain = Box::into_raw(Box::new(FdChain::new()));
            (*table).entries[index].store(chain, Ordering::Release);
        }
        chain
    }

    fn get_chain(&self, fd: RawFd) -> *const FdChain {
        if fd < 0 {
            return ptr::null();
        }
        let index = fd as usize;
        unsafe {
            let table = self.table.load(Ordering::Relaxed);
            if index < (*table).capacity {
                (*table).entries[index].load(Ordering::Relaxed)
            } else {
                ptr::null()
            }
        }
    }

    unsafe fn extend_table(&self, table: *mut Table, required: usize) -> *mut Table {
        let new_capacity = ((*table).capacity * 2).max(required);
        let new_table = Box::into_raw(Box::new(Table::new(new_capacity)));
        for n in 0..(*table).capacity {
            (*new_table).entries[n].store(
                (*table).entries[n].load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
        }
        /* readers may still traverse the superseded table through an
        earlier load; park it until the quiescent point */
        *(*new_table).old.get() = table;
        self.table.store(new_table, Ordering::Release);
        new_table
    }

    #[cfg(test)]
    pub(crate) fn old_table_count(&self) -> usize {
        unsafe {
            let table = self.table.load(Ordering::Relaxed);
            let mut count = 0;
            let mut old = *(*table).old.get();
            while !old.is_null() {
                count += 1;
                old = *(*old).old.get();
            }
            count
        }
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        unsafe { (*self.table.load(Ordering::Relaxed)).capacity }
    }
}

impl Drop for FdHandlerTable {
    fn drop(&mut self) {
        unsafe {
            let table = self.table.load(Ordering::Relaxed);
            /* chains are shared between a table and its superseded
            copies; free them through the current table only */
            for n in 0..(*table).capacity {
                let chain = (*table).entries[n].load(Ordering::Relaxed);
                if !chain.is_null() {
                    drop(Box::from_raw(chain));
                }
            }
            let mut current = table;
            while !current.is_null() {
                let next = *(*current).old.get();
                drop(Box::from_raw(current));
                current = next;
            }
        }
    }
}
