// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Async-signal-safe triggered work.
//!
//! A procedure is registered once and from then on can be *marked for
//! execution* from contexts where almost nothing is allowed - posix
//! signal handlers in particular. Marking
//! ([`AsyncSafeConnection::set`]) performs one atomic test-and-set, at
//! most one lock-free push onto the pending stack and one pipe write
//! through the shared trigger; no allocation, no mutex, no non-reentrant
//! call. Multiple `set` calls before the next dispatch coalesce into one
//! invocation.
//!
//! A dispatching thread drains the pending stack with
//! [`AsyncSafeWorkDispatcher::dispatch`], invoking the marked procedures
//! in the order they were first marked.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::connection::{Connection, ErasedLink, LinkKind};
use crate::eventflag::{EventFlag, EventTrigger};

type AsyncWorkFn = dyn Fn() + Send + Sync;

/// Registry linkage; guarded by the dispatcher's registry mutex.
struct RegistryPtrs {
    prev: *const AsyncWorkLink,
    next: *const AsyncWorkLink,
}

pub(crate) struct AsyncWorkLink {
    function: Box<AsyncWorkFn>,
    /// Set between the first `set()` and the dispatch that services it;
    /// deduplicates triggering.
    activation: AtomicBool,
    /// Next link in the pending stack. Written only by the thread that
    /// won the activation test-and-set (or by the dispatcher that owns
    /// the popped stack), so it needs no further synchronization.
    pending_next: UnsafeCell<*const AsyncWorkLink>,
    links: UnsafeCell<RegistryPtrs>,
    /// Owning dispatcher; set at registration, constant afterwards. The
    /// dispatcher outlives every use: its teardown disconnects all
    /// registered procedures and drains the pending stack.
    service: *const AsyncInner,
    disconnected: AtomicBool,
    registration_mutex: Mutex<()>,
}

unsafe impl Send for AsyncWorkLink {}
unsafe impl Sync for AsyncWorkLink {}

impl AsyncWorkLink {
    fn new(function: Box<AsyncWorkFn>, service: *const AsyncInner) -> Self {
        AsyncWorkLink {
            function,
            activation: AtomicBool::new(false),
            pending_next: UnsafeCell::new(ptr::null()),
            links: UnsafeCell::new(RegistryPtrs {
                prev: ptr::null(),
                next: ptr::null(),
            }),
            service,
            disconnected: AtomicBool::new(false),
            registration_mutex: Mutex::new(()),
        }
    }

    /// Async-signal-safe request for eventual invocation.
    pub(crate) fn trigger(&self) {
        /* already marked: nothing to do */
        if self.activation.swap(true, Ordering::Acquire) {
            return;
        }
        self.trigger_bottom();
    }

    fn trigger_bottom(&self) {
        let inner = unsafe { &*self.service };
        let self_ptr = self as *const AsyncWorkLink;
        let mut head = inner.pending.load(Ordering::Relaxed);
        loop {
            unsafe { *self.pending_next.get() = head };
            match inner.pending.compare_exchange_weak(
                head,
                self_ptr as *mut _,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }
        inner.trigger.set();
    }

    fn disconnect_link(&self) {
        let reg = self.registration_mutex.lock().unwrap();
        if self.disconnected.load(Ordering::Relaxed) {
            return;
        }
        let inner = unsafe { &*self.service };
        let mut registry = inner.registry.lock().unwrap();

        self.disconnected.store(true, Ordering::Relaxed);
        unsafe {
            let ptrs = &*self.links.get();
            if ptrs.prev.is_null() {
                registry.first = ptrs.next;
            } else {
                (*(*ptrs.prev).links.get()).next = ptrs.next;
            }
            if ptrs.next.is_null() {
                registry.last = ptrs.prev;
            } else {
                (*(*ptrs.next).links.get()).prev = ptrs.prev;
            }
        }

        if self.activation.swap(true, Ordering::Release) {
            /* marked already: the link is (or is about to be) on the
            pending stack - this may race with trigger(). The next
            dispatch drops the dispatcher's reference. */
            inner.async_cancel_count.fetch_add(1, Ordering::Relaxed);
            drop(registry);
            drop(reg);
        } else {
            drop(registry);
            drop(reg);
            unsafe { drop(Arc::from_raw(self as *const AsyncWorkLink)) };
        }
    }
}

impl ErasedLink for AsyncWorkLink {
    fn disconnect(&self) {
        self.disconnect_link();
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Relaxed)
    }
}

struct Registry {
    first: *const AsyncWorkLink,
    last: *const AsyncWorkLink,
}

unsafe impl Send for Registry {}

struct AsyncInner {
    /// Lock-free stack of procedures awaiting invocation.
    pending: AtomicPtr<AsyncWorkLink>,
    /// Procedures disconnected while pending; their references are
    /// dropped by the next dispatch (or the destructor).
    async_cancel_count: AtomicUsize,
    registry: Mutex<Registry>,
    trigger: Arc<dyn EventFlag>,
}

/// Re-queues the undrained tail if a procedure panics mid-dispatch, so
/// no marked procedure is lost; also re-raises the trigger in that case.
struct DrainGuard<'a> {
    inner: &'a AsyncInner,
    head: *const AsyncWorkLink,
}

impl DrainGuard<'_> {
    fn dequeue(&mut self) -> *const AsyncWorkLink {
        let current = self.head;
        unsafe { self.head = *(*current).pending_next.get() };
        current
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.head.is_null() {
            return;
        }
        unsafe {
            let mut last = self.head;
            while !(*(*last).pending_next.get()).is_null() {
                last = *(*last).pending_next.get();
            }
            let mut head = self.inner.pending.load(Ordering::Relaxed);
            loop {
                *(*last).pending_next.get() = head;
                match self.inner.pending.compare_exchange_weak(
                    head,
                    self.head as *mut _,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(h) => head = h,
                }
            }
        }
        self.inner.trigger.set();
    }
}

/// Handle to a registered async-safe procedure.
#[derive(Clone, Default)]
pub struct AsyncSafeConnection {
    link: Option<Arc<AsyncWorkLink>>,
}

impl AsyncSafeConnection {
    /// Marks the procedure for invocation by the next dispatch. Safe to
    /// call from any thread and from posix signal handler context;
    /// multiple calls before the dispatch coalesce.
    pub fn set(&self) {
        if let Some(link) = &self.link {
            link.trigger();
        }
    }

    /// See [`Connection::disconnect`]. A procedure marked but not yet
    /// dispatched is not invoked anymore.
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.disconnect_link();
        }
    }

    /// See [`Connection::is_connected`].
    pub fn is_connected(&self) -> bool {
        match &self.link {
            Some(link) => link.is_connected(),
            None => false,
        }
    }
}

impl From<AsyncSafeConnection> for Connection {
    fn from(conn: AsyncSafeConnection) -> Connection {
        match conn.link {
            Some(link) => Connection::new(LinkKind::AsyncWork(link)),
            None => Connection::default(),
        }
    }
}

impl fmt::Debug for AsyncSafeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("AsyncSafeConnection { .. }")
    }
}

/// Stand-alone dispatcher for async-safe triggered procedures.
///
/// ```
/// use reflex::{AsyncSafeWorkDispatcher, CondvarEventFlag, EventFlag};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let flag = Arc::new(CondvarEventFlag::new());
/// let dispatcher = AsyncSafeWorkDispatcher::new(flag.clone());
///
/// let runs = Arc::new(AtomicUsize::new(0));
/// let r = runs.clone();
/// let conn = dispatcher.async_procedure(move || {
///     r.fetch_add(1, Ordering::Relaxed);
/// });
///
/// conn.set(); // e.g. from a signal handler
/// flag.wait();
/// flag.clear();
/// assert_eq!(dispatcher.dispatch(), 1);
/// assert_eq!(runs.load(Ordering::Relaxed), 1);
/// ```
pub struct AsyncSafeWorkDispatcher {
    /* boxed so registered links can carry a stable back-pointer */
    inner: Box<AsyncInner>,
}

impl AsyncSafeWorkDispatcher {
    /// Creates the dispatcher. `trigger` is raised whenever a procedure
    /// is marked, waking whoever services this dispatcher.
    pub fn new(trigger: Arc<dyn EventFlag>) -> AsyncSafeWorkDispatcher {
        AsyncSafeWorkDispatcher {
            inner: Box::new(AsyncInner {
                pending: AtomicPtr::new(ptr::null_mut()),
                async_cancel_count: AtomicUsize::new(0),
                registry: Mutex::new(Registry {
                    first: ptr::null(),
                    last: ptr::null(),
                }),
                trigger,
            }),
        }
    }

    /// Registers a procedure and returns the handle used to mark it.
    pub fn async_procedure(
        &self,
        function: impl Fn() + Send + Sync + 'static,
    ) -> AsyncSafeConnection {
        let link = Arc::new(AsyncWorkLink::new(Box::new(function), &*self.inner));
        let ptr = Arc::into_raw(link.clone());

        let mut registry = self.inner.registry.lock().unwrap();
        unsafe {
            (*(*ptr).links.get()).prev = registry.last;
            (*(*ptr).links.get()).next = ptr::null();
            if registry.last.is_null() {
                registry.first = ptr;
            } else {
                (*(*registry.last).links.get()).next = ptr;
            }
            registry.last = ptr;
        }
        drop(registry);

        AsyncSafeConnection { link: Some(link) }
    }

    /// True iff at least one marked procedure awaits dispatch.
    pub fn pending(&self) -> bool {
        !self.inner.pending.load(Ordering::Relaxed).is_null()
    }

    /// Invokes every marked procedure once, in marking order, and
    /// returns how many ran. If a procedure panics, the remaining marked
    /// procedures are re-queued, the trigger is re-raised and the panic
    /// propagates.
    pub fn dispatch(&self) -> usize {
        let inner = &*self.inner;
        if inner.pending.load(Ordering::Relaxed).is_null() {
            return 0;
        }

        let head = inner.pending.swap(ptr::null_mut(), Ordering::Acquire);

        /* the stack pops in reverse marking order; flip it. The nodes
        are exclusively ours while their activation flags are set. */
        let mut reversed: *const AsyncWorkLink = ptr::null();
        let mut current = head as *const AsyncWorkLink;
        unsafe {
            while !current.is_null() {
                let next = *(*current).pending_next.get();
                *(*current).pending_next.get() = reversed;
                reversed = current;
                current = next;
            }
        }

        let mut guard = DrainGuard {
            inner,
            head: reversed,
        };
        let mut handled = 0;
        while !guard.head.is_null() {
            let proc = guard.dequeue();
            unsafe {
                let registry = inner.registry.lock().unwrap();
                (*proc).activation.store(false, Ordering::Release);
                let disconnected = (*proc).disconnected.load(Ordering::Relaxed);
                drop(registry);

                if !disconnected {
                    /* a panic counts this procedure as processed; the
                    guard re-queues only what comes after it */
                    ((*proc).function)();
                    handled += 1;
                } else {
                    drop(Arc::from_raw(proc));
                    inner.async_cancel_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
        handled
    }
}

impl Drop for AsyncSafeWorkDispatcher {
    fn drop(&mut self) {
        let inner = &*self.inner;
        loop {
            let first = {
                let registry = inner.registry.lock().unwrap();
                registry.first
            };
            if first.is_null() {
                break;
            }
            /* borrow the link past the registry lock so its disconnect
            can take the locks in the regular order */
            let link = unsafe {
                Arc::increment_strong_count(first);
                Arc::from_raw(first)
            };
            link.disconnect_link();
        }

        /* procedures disconnected while marked still sit on the pending
        stack holding the dispatcher's reference */
        while inner.async_cancel_count.load(Ordering::Relaxed) != 0 {
            let mut proc =
                inner.pending.swap(ptr::null_mut(), Ordering::Acquire) as *const AsyncWorkLink;
            while !proc.is_null() {
                unsafe {
                    let next = *(*proc).pending_next.get();
                    drop(Arc::from_raw(proc));
                    proc = next;
                }
                inner.async_cancel_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

impl fmt::Debug for AsyncSafeWorkDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("AsyncSafeWorkDispatcher { .. }")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::eventflag::PipeEventFlag;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn dispatcher() -> (AsyncSafeWorkDispatcher, Arc<PipeEventFlag>) {
        let flag = Arc::new(PipeEventFlag::new().unwrap());
        (AsyncSafeWorkDispatcher::new(flag.clone()), flag)
    }

    #[test]
    fn marked_procedure_runs_exactly_once() {
        let (dispatcher, flag) = dispatcher();
        let runs = Arc::new(AtomicUsize::new(0));

        let r = runs.clone();
        let conn = dispatcher.async_procedure(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });

        assert!(!dispatcher.pending());
        assert_eq!(dispatcher.dispatch(), 0);

        conn.set();
        assert!(dispatcher.pending());
        assert!(flag.is_set());
        assert_eq!(dispatcher.dispatch(), 1);
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        /* not marked again: nothing left to run */
        assert_eq!(dispatcher.dispatch(), 0);
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        /* the activation flag was cleared, so marking works again */
        conn.set();
        assert_eq!(dispatcher.dispatch(), 1);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn multiple_sets_coalesce() {
        let (dispatcher, _flag) = dispatcher();
        let runs = Arc::new(AtomicUsize::new(0));

        let r = runs.clone();
        let conn = dispatcher.async_procedure(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });

        conn.set();
        conn.set();
        conn.set();
        assert_eq!(dispatcher.dispatch(), 1);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn procedures_run_in_marking_order() {
        let (dispatcher, _flag) = dispatcher();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut conns = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            conns.push(dispatcher.async_procedure(move || {
                order.lock().unwrap().push(i);
            }));
        }
        for conn in &conns {
            conn.set();
        }
        assert_eq!(dispatcher.dispatch(), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn set_from_other_thread() {
        let (dispatcher, flag) = dispatcher();
        let runs = Arc::new(AtomicUsize::new(0));

        let r = runs.clone();
        let conn = dispatcher.async_procedure(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });

        let setter = thread::spawn(move || {
            conn.set();
            conn
        });
        let conn = setter.join().unwrap();

        flag.wait();
        flag.clear();
        assert_eq!(dispatcher.dispatch(), 1);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert!(conn.is_connected());
    }

    #[test]
    fn disconnect_while_marked_suppresses_invocation() {
        let (dispatcher, _flag) = dispatcher();
        let runs = Arc::new(AtomicUsize::new(0));

        let r = runs.clone();
        let mut conn = dispatcher.async_procedure(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });

        conn.set();
        conn.disconnect();
        assert_eq!(dispatcher.dispatch(), 0);
        assert_eq!(runs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn panicking_procedure_requeues_the_rest() {
        let (dispatcher, flag) = dispatcher();
        let runs = Arc::new(AtomicUsize::new(0));

        let boom = dispatcher.async_procedure(|| panic!("proc exploded"));
        let r = runs.clone();
        let steady = dispatcher.async_procedure(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });

        boom.set();
        steady.set();
        flag.clear();

        let result = catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch()));
        assert!(result.is_err());
        /* the tail was re-queued and the trigger re-raised */
        assert!(dispatcher.pending());
        assert!(flag.is_set());

        assert_eq!(dispatcher.dispatch(), 1);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn drop_with_marked_procedures_releases_everything() {
        let conn;
        {
            let (dispatcher, _flag) = dispatcher();
            conn = dispatcher.async_procedure(|| {});
            conn.set();
        }
        assert!(!conn.is_connected());
    }
}
