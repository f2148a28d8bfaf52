// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Timer callbacks.
//!
//! A [`TimerDispatcher`] stores pending timers in a min-heap keyed by
//! their deadline and runs the due ones whenever a driving thread calls
//! [`run_queue`](TimerDispatcher::run_queue). A timer function decides
//! its own fate on every expiry: it receives the current time by mutable
//! reference and either returns `false` (done, disconnect) or stores its
//! next deadline and returns `true` (rearm). Rearming an existing timer
//! is cheaper than cancelling and re-registering, and keeping track of
//! the originally requested deadline lets periodic timers avoid
//! accumulating dispatch latency.
//!
//! The dispatcher cooperates with an [`EventFlag`]: whenever a
//! registration or cancellation changes the earliest deadline while no
//! queue run is in progress, the flag is raised so a thread sleeping on
//! the flag (typically inside an IO dispatch) recomputes its timeout.
//!
//! Cancellation always wins: if a timer expires at the same moment its
//! owner disconnects it, the rearm request is discarded, and the
//! callback runs at most one final time on the dispatching thread (never
//! again on the disconnecting thread).

use scopeguard::ScopeGuard;
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::connection::{Connection, ErasedLink, LinkKind};
use crate::eventflag::{EventFlag, EventTrigger};

type TimerFn = dyn FnMut(&mut Instant) -> bool + Send;

pub(crate) struct TimerLink {
    /// Invoked exclusively by the queue run that extracted the link;
    /// cleared by whichever side finalizes the timer.
    function: UnsafeCell<Option<Box<TimerFn>>>,
    /// Deadline; queue-mutex guarded.
    when: UnsafeCell<Instant>,
    /// Position in the heap, `None` while not queued (being executed or
    /// already finished). Queue-mutex guarded.
    heap_slot: UnsafeCell<Option<usize>>,
    /// Owning dispatcher; null once disconnected. Dereferenced only
    /// under `registration_mutex`; the dispatcher detaches every link on
    /// teardown.
    service: AtomicPtr<TimerInner>,
    registration_mutex: Mutex<()>,
}

unsafe impl Send for TimerLink {}
unsafe impl Sync for TimerLink {}

impl TimerLink {
    fn new(function: Box<TimerFn>, when: Instant) -> Self {
        TimerLink {
            function: UnsafeCell::new(Some(function)),
            when: UnsafeCell::new(when),
            heap_slot: UnsafeCell::new(None),
            service: AtomicPtr::new(ptr::null_mut()),
            registration_mutex: Mutex::new(()),
        }
    }

    /// Clears the stored function and releases the queue's reference.
    /// Caller must hold exclusive use of the link (extracted from the
    /// heap, or detached under the queue mutex).
    unsafe fn finalize(ptr: *const TimerLink) {
        *(*ptr).function.get() = None;
        drop(Arc::from_raw(ptr));
    }

    fn disconnect_link(&self) {
        let reg = self.registration_mutex.lock().unwrap();
        let service = self.service.load(Ordering::Relaxed);
        if service.is_null() {
            return;
        }
        let inner = unsafe { &*service };

        let was_queued;
        let was_min;
        {
            let mut queue = inner.queue.lock().unwrap();
            /* teardown may have detached the link while this thread
            waited for the mutex */
            if self.service.load(Ordering::Relaxed) != service {
                return;
            }
            self.service.store(ptr::null_mut(), Ordering::Relaxed);
            match unsafe { *self.heap_slot.get() } {
                Some(slot) => {
                    was_min = slot == 0;
                    unsafe { queue.remove_at(slot) };
                    was_queued = true;
                }
                None => {
                    /* currently executing (or already finished): the
                    queue run owns the link and will observe the cleared
                    service pointer */
                    was_queued = false;
                    was_min = false;
                }
            }
        }
        drop(reg);

        if was_queued {
            unsafe { TimerLink::finalize(self as *const TimerLink) };
        }
        if was_min {
            /* the earliest deadline changed; a sleeping dispatcher must
            recompute its timeout */
            inner.trigger.set();
        }
    }
}

impl ErasedLink for TimerLink {
    fn disconnect(&self) {
        self.disconnect_link();
    }

    fn is_connected(&self) -> bool {
        !self.service.load(Ordering::Relaxed).is_null()
    }
}

/// Index-tracking binary min-heap over the queued links. Every operation
/// runs under the queue mutex and keeps each link's `heap_slot` in step,
/// so a disconnect can remove an arbitrary timer in O(log n).
struct TimerQueue {
    heap: Vec<*const TimerLink>,
    running: bool,
}

impl TimerQueue {
    unsafe fn when_of(&self, ptr: *const TimerLink) -> Instant {
        *(*ptr).when.get()
    }

    unsafe fn set_slot(&mut self, index: usize) {
        let ptr = self.heap[index];
        *(*ptr).heap_slot.get() = Some(index);
    }

    unsafe fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.when_of(self.heap[parent]) <= self.when_of(self.heap[index]) {
                break;
            }
            self.heap.swap(parent, index);
            self.set_slot(index);
            index = parent;
        }
        self.set_slot(index);
    }

    unsafe fn sift_down(&mut self, mut index: usize) {
        loop {
            let mut smallest = index;
            for child in [2 * index + 1, 2 * index + 2] {
                if child < self.heap.len()
                    && self.when_of(self.heap[child]) < self.when_of(self.heap[smallest])
                {
                    smallest = child;
                }
            }
            if smallest == index {
                break;
            }
            self.heap.swap(index, smallest);
            self.set_slot(index);
            index = smallest;
        }
        self.set_slot(index);
    }

    unsafe fn insert(&mut self, ptr: *const TimerLink) {
        self.heap.push(ptr);
        self.sift_up(self.heap.len() - 1);
    }

    fn peek_min(&self) -> Option<*const TimerLink> {
        self.heap.first().copied()
    }

    /// Extracts the root if it is due at `now`, marking it unqueued.
    unsafe fn extract_due(&mut self, now: Instant) -> Option<*const TimerLink> {
        let root = *self.heap.first()?;
        if self.when_of(root) > now {
            return None;
        }
        self.remove_at(0);
        Some(root)
    }

    unsafe fn extract_min(&mut self) -> Option<*const TimerLink> {
        let root = *self.heap.first()?;
        self.remove_at(0);
        Some(root)
    }

    unsafe fn remove_at(&mut self, index: usize) {
        let removed = self.heap[index];
        *(*removed).heap_slot.get() = None;
        let last = self.heap.len() - 1;
        if index == last {
            self.heap.pop();
            return;
        }
        self.heap.swap(index, last);
        self.heap.pop();
        /* the element moved into the hole may violate either direction */
        self.sift_down(index);
        self.sift_up(index);
    }
}

struct TimerInner {
    queue: Mutex<TimerQueue>,
    trigger: Arc<dyn EventFlag>,
}

unsafe impl Send for TimerInner {}
unsafe impl Sync for TimerInner {}

/// Handle to a registered timer.
#[derive(Clone, Default)]
pub struct TimerConnection {
    link: Option<Arc<TimerLink>>,
}

impl TimerConnection {
    /// Cancels the timer. See [`Connection::disconnect`] for the exact
    /// guarantee; cancellation always takes precedence over a concurrent
    /// rearm.
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

impl From<TimerConnection> for Connection {
    fn from(conn: TimerConnection) -> Connection {
        match conn.link {
            Some(link) => Connection::new(LinkKind::Timer(link)),
            None => Connection::default(),
        }
    }
}

impl fmt::Debug for TimerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("TimerConnection { .. }")
    }
}

/// Queue of timers sharing one wake-up flag.
///
/// ```
/// use reflex::{CondvarEventFlag, TimerDispatcher};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::time::{Duration, Instant};
///
/// let flag = Arc::new(CondvarEventFlag::new());
/// let timers = TimerDispatcher::new(flag);
/// let fired = Arc::new(AtomicUsize::new(0));
///
/// let f = fired.clone();
/// timers.timer(Instant::now(), move |_now| {
///     f.fetch_add(1, Ordering::Relaxed);
///     false // do not rearm
/// });
///
/// let mut now = Instant::now();
/// timers.run_queue(&mut now);
/// assert_eq!(fired.load(Ordering::Relaxed), 1);
/// ```
pub struct TimerDispatcher {
    /* boxed so registered links can carry a stable back-pointer */
    inner: Box<TimerInner>,
}

impl TimerDispatcher {
    /// Creates an empty queue. `trigger` is raised whenever the earliest
    /// deadline changes outside a queue run - the signal for a thread
    /// blocked with a stale timeout to start over.
    pub fn new(trigger: Arc<dyn EventFlag>) -> TimerDispatcher {
        TimerDispatcher {
            inner: Box::new(TimerInner {
                queue: Mutex::new(TimerQueue {
                    heap: Vec::new(),
                    running: false,
                }),
                trigger,
            }),
        }
    }

    /// Registers `function` to run at `when`. On each expiry the
    /// function may store its next deadline through the `&mut Instant`
    /// and return `true` to rearm, or return `false` to disconnect.
    pub fn timer(
        &self,
        when: Instant,
        function: impl FnMut(&mut Instant) -> bool + Send + 'static,
    ) -> TimerConnection {
        let link = Arc::new(TimerLink::new(Box::new(function), when));
        let need_wakeup;
        {
            let mut queue = self.inner.queue.lock().unwrap();
            link.service
                .store(&*self.inner as *const TimerInner as *mut _, Ordering::Relaxed);
            let ptr = Arc::into_raw(link.clone());
            unsafe { queue.insert(ptr) };
            need_wakeup = !queue.running && queue.peek_min() == Some(ptr as *const _);
        }
        if need_wakeup {
            self.inner.trigger.set();
        }
        TimerConnection { link: Some(link) }
    }

    /// Registers a timer that fires once and never rearms.
    pub fn one_shot_timer(
        &self,
        when: Instant,
        function: impl FnOnce(Instant) + Send + 'static,
    ) -> TimerConnection {
        let mut function = Some(function);
        self.timer(when, move |now: &mut Instant| {
            if let Some(f) = function.take() {
                f(*now);
            }
            false
        })
    }

    /// Deadline of the earliest pending timer, if any. The result can
    /// race with concurrent registration; callers avoid missing timers
    /// by clearing the shared flag first, then checking, then waiting on
    /// flag-or-timeout atomically.
    pub fn next_timer(&self) -> Option<Instant> {
        let queue = self.inner.queue.lock().unwrap();
        queue.peek_min().map(|ptr| unsafe { queue.when_of(ptr) })
    }

    /// Runs every timer due at `*now`, in deadline order.
    ///
    /// On return, `*now` holds the earliest remaining deadline and the
    /// result says whether any timer remains queued (`false` leaves
    /// `*now` untouched). Timers that rearm to a deadline at or before
    /// `*now` run again within the same call.
    ///
    /// If a timer function panics, the queue is left consistent, the
    /// erroring timer is dropped (not rearmed) and the panic propagates
    /// to the caller.
    pub fn run_queue(&self, now: &mut Instant) -> bool {
        let inner = &*self.inner;
        let mut queue = inner.queue.lock().unwrap();
        if queue.heap.is_empty() {
            return false;
        }
        queue.running = true;

        loop {
            let ptr = match unsafe { queue.extract_due(*now) } {
                Some(ptr) => ptr,
                None => break,
            };
            drop(queue);

            let mut next_when = *now;
            /* on panic: drop the erroring timer and restore `running`
            before the unwind leaves the loop */
            let panic_guard = scopeguard::guard((), |_| {
                unsafe {
                    (*ptr).service.store(ptr::null_mut(), Ordering::Relaxed);
                    TimerLink::finalize(ptr);
                }
                inner.queue.lock().unwrap().running = false;
            });
            let rearm = unsafe {
                match (*(*ptr).function.get()).as_mut() {
                    Some(f) => f(&mut next_when),
                    None => false,
                }
            };
            ScopeGuard::into_inner(panic_guard);

            if !rearm {
                /* the timer asked to be disconnected */
                unsafe {
                    let reg = (*ptr).registration_mutex.lock().unwrap();
                    (*ptr).service.store(ptr::null_mut(), Ordering::Relaxed);
                    drop(reg);
                    TimerLink::finalize(ptr);
                }
                queue = inner.queue.lock().unwrap();
                continue;
            }

            /* fast path: a disconnect that already went through wins */
            if unsafe { (*ptr).service.load(Ordering::Relaxed) }.is_null() {
                unsafe { TimerLink::finalize(ptr) };
                queue = inner.queue.lock().unwrap();
                continue;
            }

            queue = inner.queue.lock().unwrap();
            /* recheck under the mutex: this closes the window against a
            disconnect racing the rearm */
            if !unsafe { (*ptr).service.load(Ordering::Relaxed) }.is_null() {
                unsafe {
                    *(*ptr).when.get() = next_when;
                    queue.insert(ptr);
                }
            } else {
                drop(queue);
                unsafe { TimerLink::finalize(ptr) };
                queue = inner.queue.lock().unwrap();
            }
        }

        queue.running = false;
        match queue.peek_min() {
            Some(min) => {
                *now = unsafe { queue.when_of(min) };
                true
            }
            None => false,
        }
    }
}

impl Drop for TimerDispatcher {
    fn drop(&mut self) {
        /* Teardown assumes no thread is inside run_queue anymore;
        concurrent disconnects serialize on the queue mutex and observe
        the detached service pointer. */
        loop {
            let ptr = {
                let mut queue = self.inner.queue.lock().unwrap();
                match unsafe { queue.extract_min() } {
                    Some(ptr) => {
                        unsafe { (*ptr).service.store(ptr::null_mut(), Ordering::Relaxed) };
                        ptr
                    }
                    None => break,
                }
            };
            unsafe { TimerLink::finalize(ptr) };
        }
    }
}

impl fmt::Debug for TimerDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("TimerDispatcher { .. }")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::eventflag::PipeEventFlag;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn dispatcher() -> (TimerDispatcher, Arc<PipeEventFlag>) {
        let flag = Arc::new(PipeEventFlag::new().unwrap());
        (TimerDispatcher::new(flag.clone()), flag)
    }

    #[test]
    fn due_timers_run_in_deadline_order() {
        let (timers, _flag) = dispatcher();
        let base = Instant::now();
        let order = Arc::new(Mutex::new(Vec::new()));

        /* shuffled registration order */
        for offset_ms in [40u64, 10, 30, 20, 50] {
            let order = order.clone();
            timers.timer(base + Duration::from_millis(offset_ms), move |_| {
                order.lock().unwrap().push(offset_ms);
                false
            });
        }
        assert_eq!(timers.next_timer(), Some(base + Duration::from_millis(10)));

        let mut now = base + Duration::from_millis(60);
        let remaining = timers.run_queue(&mut now);
        assert!(!remaining);
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn rearm_then_cancel_race() {
        let (timers, _flag) = dispatcher();
        let base = Instant::now();
        let fired = Arc::new(AtomicUsize::new(0));

        /* rearms itself 50ms after its original deadline */
        let f = fired.clone();
        let due = Arc::new(Mutex::new(base + Duration::from_millis(100)));
        let d = due.clone();
        let mut conn = timers.timer(base + Duration::from_millis(100), move |now| {
            f.fetch_add(1, Ordering::Relaxed);
            let mut due = d.lock().unwrap();
            *due += Duration::from_millis(50);
            *now = *due;
            true
        });

        let mut t = base + Duration::from_millis(120);
        let pending = timers.run_queue(&mut t);
        assert!(pending);
        assert_eq!(t, base + Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        /* owner cancels before the rearmed deadline */
        conn.disconnect();
        assert!(!conn.is_connected());

        let mut t = base + Duration::from_millis(200);
        let pending = timers.run_queue(&mut t);
        assert!(!pending);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn disconnect_of_queued_timer_removes_it() {
        let (timers, _flag) = dispatcher();
        let base = Instant::now();
        let fired = Arc::new(AtomicUsize::new(0));

        let mut conns = Vec::new();
        for i in 0..5u64 {
            let fired = fired.clone();
            conns.push(timers.timer(base + Duration::from_millis(10 * i), move |_| {
                fired.fetch_add(1, Ordering::Relaxed);
                false
            }));
        }
        conns[1].disconnect();
        conns[3].disconnect();

        let mut now = base + Duration::from_secs(1);
        timers.run_queue(&mut now);
        assert_eq!(fired.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn one_shot_fires_exactly_once() {
        let (timers, _flag) = dispatcher();
        let base = Instant::now();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        let conn = timers.one_shot_timer(base, move |_| {
            f.fetch_add(1, Ordering::Relaxed);
        });

        let mut now = base + Duration::from_millis(1);
        assert!(!timers.run_queue(&mut now));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(!conn.is_connected());

        let mut now = base + Duration::from_secs(1);
        assert!(!timers.run_queue(&mut now));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn registering_new_minimum_raises_trigger() {
        let (timers, flag) = dispatcher();
        let base = Instant::now();

        let _c1 = timers.timer(base + Duration::from_secs(10), |_| false);
        assert!(flag.is_set());
        flag.clear();

        /* not the new minimum: no wakeup needed */
        let _c2 = timers.timer(base + Duration::from_secs(20), |_| false);
        assert!(!flag.is_set());

        /* earlier than everything else: wakeup */
        let _c3 = timers.timer(base + Duration::from_secs(5), |_| false);
        assert!(flag.is_set());
    }

    #[test]
    fn cancelling_the_minimum_raises_trigger() {
        let (timers, flag) = dispatcher();
        let base = Instant::now();

        let mut c1 = timers.timer(base + Duration::from_secs(5), |_| false);
        let _c2 = timers.timer(base + Duration::from_secs(10), |_| false);
        flag.clear();

        c1.disconnect();
        assert!(flag.is_set());
        assert_eq!(timers.next_timer(), Some(base + Duration::from_secs(10)));
    }

    #[test]
    fn panicking_timer_is_dropped_and_queue_stays_usable() {
        let (timers, _flag) = dispatcher();
        let base = Instant::now();
        let fired = Arc::new(AtomicUsize::new(0));

        timers.timer(base, |_| panic!("timer exploded"));
        let f = fired.clone();
        timers.timer(base + Duration::from_millis(1), move |_| {
            f.fetch_add(1, Ordering::Relaxed);
            false
        });

        let mut now = base + Duration::from_millis(10);
        let result = catch_unwind(AssertUnwindSafe(|| timers.run_queue(&mut now)));
        assert!(result.is_err());

        /* the panicking timer is gone, the queue keeps working */
        let mut now = base + Duration::from_millis(10);
        assert!(!timers.run_queue(&mut now));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn drop_releases_pending_timers() {
        let fired = Arc::new(AtomicUsize::new(0));
        let conn;
        {
            let (timers, _flag) = dispatcher();
            let f = fired.clone();
            conn = timers.timer(Instant::now() + Duration::from_secs(60), move |_| {
                f.fetch_add(1, Ordering::Relaxed);
                false
            });
        }
        assert!(!conn.is_connected());
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }
}
