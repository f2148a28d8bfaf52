// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Thread-safe multi-observer notification.
//!
//! A [`Signal`] lets any number of receivers register callbacks and lets
//! any thread deliver a payload to all of them. Registration, delivery and
//! disconnection may all happen concurrently from arbitrary threads; an
//! emitting thread never takes more than the deferred lock's two atomic
//! operations on its way in and out.
//!
//! # The chain protocol
//!
//! Every registration becomes a link on two overlaid lists:
//!
//! - the *full list* (`prev`/`next`, doubly linked, writer-mutex guarded)
//!   holds every link that has not been physically reclaimed yet, in
//!   insertion order;
//! - the *active list* (`active_next`, singly linked from an atomic head)
//!   holds the subset an emitter may call.
//!
//! A new link joins both lists. A disconnected link leaves the active list
//! immediately - under the writer mutex, with release stores so that
//! concurrent traversals always see a terminated chain - but stays on the
//! full list, with its `active_next` still pointing into the surviving
//! chain. An emitter that picked the link up just before the removal can
//! therefore finish its traversal unharmed; it merely delivers one final
//! time to the link it already held. The link is physically reclaimed at
//! the next quiescent point, when no emitter can possibly hold it anymore.
//!
//! Because removed links keep a valid `active_next`, the end of the full
//! list can become "ragged": a trailing run of removed links all pointing
//! past the tail. Insertion repairs this by walking backwards from the
//! tail and pointing every trailing null `active_next` at the new link.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::connection::{Connection, ErasedLink, LinkKind};
use crate::deferred::{DeferrableRwLock, SyncGuard, WriteLock};

type SignalFn<T> = dyn Fn(&T) + Send + Sync;

/// Pointers guarded by the chain's writer mutex. Readers never touch
/// these; in particular `prev` is only meaningful to writers.
struct FullListPtrs<T: 'static> {
    prev: *const SignalLink<T>,
    next: *const SignalLink<T>,
    deferred_cancel_next: *const SignalLink<T>,
}

pub(crate) struct SignalLink<T: 'static> {
    /// Cleared at the quiescent point, outside any lock, so that
    /// receiver state owned by the closure is freed without lock nesting.
    function: UnsafeCell<Option<Box<SignalFn<T>>>>,
    active_next: AtomicPtr<SignalLink<T>>,
    list: UnsafeCell<FullListPtrs<T>>,
    /// Owning chain; null once disconnected. The pointee is kept alive
    /// during use by the disconnect protocol: dereferencing happens only
    /// under `registration_mutex`, and the chain disconnects every link
    /// (serializing on that mutex) before it is itself dropped.
    chain: AtomicPtr<SignalInner<T>>,
    /// Serializes cancellation against concurrent cancellation and
    /// against the chain's own teardown.
    registration_mutex: Mutex<()>,
}

unsafe impl<T: 'static> Send for SignalLink<T> {}
unsafe impl<T: 'static> Sync for SignalLink<T> {}

impl<T: 'static> SignalLink<T> {
    fn new(function: Box<SignalFn<T>>) -> Self {
        SignalLink {
            function: UnsafeCell::new(Some(function)),
            active_next: AtomicPtr::new(ptr::null_mut()),
            list: UnsafeCell::new(FullListPtrs {
                prev: ptr::null(),
                next: ptr::null(),
                deferred_cancel_next: ptr::null(),
            }),
            chain: AtomicPtr::new(ptr::null_mut()),
            registration_mutex: Mutex::new(()),
        }
    }

    fn disconnect_link(&self) {
        let guard = self.registration_mutex.lock().unwrap();
        let chain = self.chain.load(Ordering::Relaxed);
        if chain.is_null() {
            return;
        }
        unsafe { (*chain).remove(self, guard) };
    }
}

impl<T: 'static> ErasedLink for SignalLink<T> {
    fn disconnect(&self) {
        self.disconnect_link();
    }

    fn is_connected(&self) -> bool {
        !self.chain.load(Ordering::Relaxed).is_null()
    }
}

/// Head pointers of the full list plus the stack of links awaiting
/// physical removal. Writer-mutex guarded.
struct ChainHead<T: 'static> {
    first: *const SignalLink<T>,
    last: *const SignalLink<T>,
    deferred_cancel: *const SignalLink<T>,
}

pub(crate) struct SignalInner<T: 'static> {
    /// Head of the active list; the only entry point emitters use.
    active: AtomicPtr<SignalLink<T>>,
    lock: DeferrableRwLock,
    chain: UnsafeCell<ChainHead<T>>,
}

unsafe impl<T: 'static> Send for SignalInner<T> {}
unsafe impl<T: 'static> Sync for SignalInner<T> {}

impl<T: 'static> SignalInner<T> {
    /// Appends the link to both lists. Consumes one strong reference: the
    /// chain's. Caller-independent publication safety comes from the
    /// release fence before the splice stores.
    fn push_back(&self, link: Arc<SignalLink<T>>) {
        let l = Arc::into_raw(link);
        unsafe {
            let reg = (*l).registration_mutex.lock().unwrap();
            let wl = self.lock.write_lock_async();

            {
                let head = &mut *self.chain.get();
                let ptrs = &mut *(*l).list.get();
                ptrs.prev = head.last;
                ptrs.next = ptr::null();
            }
            (*l).active_next.store(ptr::null_mut(), Ordering::Relaxed);

            /* the fields above must be visible before any pointer to the
            link is; one fence covers all the splice stores below */
            fence(Ordering::Release);

            /* walk back over the ragged tail: every trailing link whose
            active_next is null terminates the active list and must now
            point at the new element */
            let head = &mut *self.chain.get();
            let mut tmp = head.last;
            loop {
                if tmp.is_null() {
                    if self.active.load(Ordering::Relaxed).is_null() {
                        self.active.store(l as *mut _, Ordering::Release);
                    }
                    break;
                }
                if !(*tmp).active_next.load(Ordering::Relaxed).is_null() {
                    break;
                }
                (*tmp).active_next.store(l as *mut _, Ordering::Release);
                tmp = (*(*tmp).list.get()).prev;
            }

            if head.last.is_null() {
                head.first = l;
            } else {
                (*(*head.last).list.get()).next = l;
            }
            head.last = l;

            (*l).chain
                .store(self as *const _ as *mut _, Ordering::Relaxed);

            drop(reg);
            match wl {
                WriteLock::Sync(g) => self.synchronize(g),
                WriteLock::Deferred(g) => drop(g),
            }
        }
    }

    /// Removes the link from the active list and queues it for physical
    /// removal at the next quiescent point. Called with the link's
    /// registration mutex held; releases it before reconciling the lock.
    unsafe fn remove(&self, link: &SignalLink<T>, reg: MutexGuard<'_, ()>) {
        let wl = self.lock.write_lock_async();
        if link.chain.load(Ordering::Relaxed) == self as *const _ as *mut _ {
            let link_ptr = link as *const SignalLink<T>;
            let next = link.active_next.load(Ordering::Relaxed);

            /* every element pointing at the removed link within the
            active chain must now point past it */
            let mut tmp = (*link.list.get()).prev;
            loop {
                if tmp.is_null() {
                    if self.active.load(Ordering::Relaxed) == link_ptr as *mut _ {
                        self.active.store(next, Ordering::Release);
                    }
                    break;
                }
                if (*tmp).active_next.load(Ordering::Relaxed) != link_ptr as *mut _ {
                    break;
                }
                (*tmp).active_next.store(next, Ordering::Release);
                tmp = (*(*tmp).list.get()).prev;
            }

            let head = &mut *self.chain.get();
            (*link.list.get()).deferred_cancel_next = head.deferred_cancel;
            head.deferred_cancel = link_ptr;

            /* a second disconnect will now find no chain and do nothing */
            link.chain.store(ptr::null_mut(), Ordering::Relaxed);
        }

        drop(reg);
        match wl {
            WriteLock::Sync(g) => self.synchronize(g),
            WriteLock::Deferred(g) => drop(g),
        }
    }

    /// Detaches every deferred-cancelled link from the full list. Must
    /// run with exclusive rights (the guard witnesses them); returns the
    /// stack of detached links for finalization outside the lock.
    fn synchronize_top(&self, _guard: &SyncGuard<'_>) -> *const SignalLink<T> {
        unsafe {
            let head = &mut *self.chain.get();
            let mut cur = head.deferred_cancel;
            while !cur.is_null() {
                let ptrs = &*(*cur).list.get();
                if ptrs.prev.is_null() {
                    head.first = ptrs.next;
                } else {
                    (*(*ptrs.prev).list.get()).next = ptrs.next;
                }
                if ptrs.next.is_null() {
                    head.last = ptrs.prev;
                } else {
                    (*(*ptrs.next).list.get()).prev = ptrs.prev;
                }
                cur = ptrs.deferred_cancel_next;
            }

            let detached = head.deferred_cancel;
            head.deferred_cancel = ptr::null();
            detached
        }
    }

    /// Clears each detached link's stored function and releases the
    /// chain's reference. Runs outside every lock so that receiver state
    /// dropped here can re-enter the chain freely.
    fn synchronize_bottom(mut detached: *const SignalLink<T>) {
        unsafe {
            while !detached.is_null() {
                let next = (*(*detached).list.get()).deferred_cancel_next;
                *(*detached).function.get() = None;
                drop(Arc::from_raw(detached));
                detached = next;
            }
        }
    }

    fn synchronize(&self, guard: SyncGuard<'_>) {
        let detached = self.synchronize_top(&guard);
        guard.finished();
        Self::synchronize_bottom(detached);
    }

    fn emit(&self, arg: &T) {
        loop {
            match self.lock.read_lock() {
                None => break,
                Some(g) => self.synchronize(g),
            }
        }

        unsafe {
            let mut l = self.active.load(Ordering::Acquire) as *const SignalLink<T>;
            while !l.is_null() {
                if let Some(f) = (*(*l).function.get()).as_ref() {
                    f(arg);
                }
                l = (*l).active_next.load(Ordering::Acquire);
            }
        }

        if let Some(g) = self.lock.read_unlock() {
            self.synchronize(g);
        }
    }

    fn disconnect_all(&self) -> bool {
        loop {
            match self.lock.read_lock() {
                None => break,
                Some(g) => self.synchronize(g),
            }
        }

        let mut any_disconnected = false;
        unsafe {
            let mut l = self.active.load(Ordering::Acquire) as *const SignalLink<T>;
            while !l.is_null() {
                any_disconnected = true;
                (*l).disconnect_link();
                /* removed links keep a valid active_next, so this
                terminates even though we just disconnected l */
                l = (*l).active_next.load(Ordering::Acquire);
            }
        }

        if let Some(g) = self.lock.read_unlock() {
            self.synchronize(g);
        }
        any_disconnected
    }
}

/// A thread-safe notifier chain.
///
/// Receivers register with [`connect`](Signal::connect); the owner (or
/// anyone holding a reference) delivers with [`emit`](Signal::emit).
/// All operations are safe to call concurrently from multiple threads.
///
/// ```
/// use reflex::Signal;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let signal: Signal<u32> = Signal::new();
/// let seen = Arc::new(AtomicUsize::new(0));
/// let s = seen.clone();
/// let mut conn = signal.connect(move |v| {
///     s.fetch_add(*v as usize, Ordering::Relaxed);
/// });
/// signal.emit(&3);
/// conn.disconnect();
/// signal.emit(&4);
/// assert_eq!(seen.load(Ordering::Relaxed), 3);
/// ```
pub struct Signal<T: 'static> {
    inner: Box<SignalInner<T>>,
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Signal<T> {
    /// Creates an empty signal.
    pub fn new() -> Self {
        Signal {
            inner: Box::new(SignalInner {
                active: AtomicPtr::new(ptr::null_mut()),
                lock: DeferrableRwLock::new(),
                chain: UnsafeCell::new(ChainHead {
                    first: ptr::null(),
                    last: ptr::null(),
                    deferred_cancel: ptr::null(),
                }),
            }),
        }
    }

    /// Registers a callback to be invoked on every
    /// [`emit`](Signal::emit). The callback stays registered until the
    /// returned connection (or any clone of it) is disconnected or the
    /// signal is dropped.
    pub fn connect(&self, function: impl Fn(&T) + Send + Sync + 'static) -> Connection {
        let link = Arc::new(SignalLink::new(Box::new(function)));
        self.inner.push_back(link.clone());
        let erased: Arc<dyn ErasedLink> = link;
        Connection::new(LinkKind::Signal(erased))
    }

    /// Calls every connected callback with the given payload, in
    /// registration order.
    pub fn emit(&self, arg: &T) {
        self.inner.emit(arg);
    }

    /// Disconnects every registered callback, as if
    /// [`Connection::disconnect`] had been called on each. Returns
    /// whether anything was disconnected.
    pub fn disconnect_all(&self) -> bool {
        self.inner.disconnect_all()
    }
}

impl<T: 'static> Drop for Signal<T> {
    fn drop(&mut self) {
        let inner = &*self.inner;
        loop {
            match inner.lock.read_lock() {
                None => break,
                Some(g) => inner.synchronize(g),
            }
        }
        let mut any_cancelled = false;
        loop {
            let l = inner.active.load(Ordering::Relaxed);
            if l.is_null() {
                break;
            }
            any_cancelled = true;
            unsafe { (*l).disconnect_link() };
        }
        if let Some(g) = inner.lock.read_unlock() {
            /* the disconnects above queued their cleanup; with no
            concurrent disconnector, the quiescent point is now */
            inner.synchronize(g);
        } else if any_cancelled {
            /* some link is being disconnected concurrently; suspend
            until its cleanup has demonstrably run */
            let g = inner.lock.write_lock_sync();
            inner.synchronize(g);
        }
    }
}

impl<T: 'static> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Signal { .. }")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// Sets its flag when the closure that captured it is finally
    /// dropped, i.e. when the link's stored function was cleared.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn emit_calls_in_registration_order() {
        let signal: Signal<()> = Signal::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            signal.connect(move |_| order.lock().unwrap().push(i));
        }
        signal.emit(&());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn disconnect_during_emit() {
        let signal: Signal<()> = Signal::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::new(AtomicBool::new(false));

        let o1 = order.clone();
        signal.connect(move |_| o1.lock().unwrap().push(1));

        let o2 = order.clone();
        let self_conn: Arc<Mutex<Option<Connection>>> = Arc::new(Mutex::new(None));
        let sc = self_conn.clone();
        let flag = DropFlag(released.clone());
        let conn2 = signal.connect(move |_| {
            let _keepalive = &flag;
            o2.lock().unwrap().push(2);
            if let Some(conn) = sc.lock().unwrap().as_mut() {
                conn.disconnect();
            }
        });
        *self_conn.lock().unwrap() = Some(conn2);

        let o3 = order.clone();
        signal.connect(move |_| o3.lock().unwrap().push(3));

        signal.emit(&());
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);

        /* the emit that carried the disconnect also reached the
        quiescent point on its way out, so the closure is gone */
        assert!(released.load(Ordering::SeqCst));

        signal.emit(&());
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 1, 3]);
    }

    #[test]
    fn insert_after_tail_removals_repairs_active_list() {
        let signal: Signal<()> = Signal::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let _a = signal.connect(move |_| o.lock().unwrap().push('a'));
        let o = order.clone();
        let mut b = signal.connect(move |_| o.lock().unwrap().push('b'));
        let o = order.clone();
        let mut c = signal.connect(move |_| o.lock().unwrap().push('c'));

        /* leave a ragged tail of removed links behind the live head */
        b.disconnect();
        c.disconnect();

        let o = order.clone();
        let _d = signal.connect(move |_| o.lock().unwrap().push('d'));

        signal.emit(&());
        assert_eq!(*order.lock().unwrap(), vec!['a', 'd']);
    }

    #[test]
    fn disconnect_is_idempotent_and_observable() {
        let signal: Signal<u32> = Signal::new();
        let mut conn = signal.connect(|_| {});
        assert!(conn.is_connected());
        let mut clone = conn.clone();
        conn.disconnect();
        assert!(!clone.is_connected());
        clone.disconnect();
    }

    #[test]
    fn disconnect_all_empties_the_chain() {
        let signal: Signal<()> = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let hits = hits.clone();
            signal.connect(move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert!(signal.disconnect_all());
        assert!(!signal.disconnect_all());
        signal.emit(&());
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn drop_with_live_connections_releases_functions() {
        let released = Arc::new(AtomicBool::new(false));
        let conn;
        {
            let signal: Signal<()> = Signal::new();
            let flag = DropFlag(released.clone());
            conn = signal.connect(move |_| {
                let _keepalive = &flag;
            });
        }
        assert!(released.load(Ordering::SeqCst));
        assert!(!conn.is_connected());
    }

    #[test]
    fn concurrent_emit_insert_disconnect() {
        let signal: Arc<Signal<()>> = Arc::new(Signal::new());
        let stop = Arc::new(AtomicBool::new(false));

        let mut emitters = Vec::new();
        for _ in 0..4 {
            let signal = signal.clone();
            let stop = stop.clone();
            emitters.push(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    signal.emit(&());
                }
            }));
        }

        let counters: Vec<Arc<AtomicUsize>> =
            (0..1000).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let mut conns = Vec::new();
        for counter in &counters {
            let counter = counter.clone();
            conns.push(signal.connect(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }
        for conn in &mut conns {
            conn.disconnect();
        }

        stop.store(true, Ordering::Relaxed);
        for t in emitters {
            t.join().unwrap();
        }

        /* all disconnected: one more emit must not invoke anything */
        let before: Vec<usize> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        signal.emit(&());
        let after: Vec<usize> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(before, after);
    }
}
