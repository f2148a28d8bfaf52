// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! # Reflex - thread-safe callbacks and a reactor for event-driven Linux applications.
//!
//! ## What is Reflex
//!
//! Reflex is a library for event-driven applications on Linux: callbacks
//! can be registered for broadcast notifications ([`Signal`]), file
//! descriptor readiness, timer expiry and async-signal-safe triggers,
//! and one or more threads drive a [`Reactor`] loop that delivers them.
//!
//! What sets it apart is the concurrency contract. Registration,
//! modification, cancellation, delivery and teardown are all safe from
//! arbitrary threads, and the delivery fast path never blocks: a thread
//! emitting a signal or dispatching events gets in and out with two
//! atomic operations, while structural cleanup is deferred to the next
//! moment no deliveries are in flight. Cancellation is synchronous on
//! the cancelling thread - once [`Connection::disconnect`] returns, that
//! thread will never see the callback again - and bounded everywhere
//! else: another thread already dispatching may deliver at most one
//! final invocation, for an event that occurred before the
//! cancellation.
//!
//! ## Example
//!
//! ```no_run
//! use reflex::{IoReadyEvents, Reactor};
//! use std::time::{Duration, Instant};
//!
//! # fn run(socket_fd: std::os::unix::io::RawFd) -> reflex::Result<()> {
//! let reactor = Reactor::new()?;
//!
//! let io = reactor.watch(
//!     |events| {
//!         if events.contains(IoReadyEvents::INPUT) {
//!             /* read from the socket */
//!         }
//!     },
//!     socket_fd,
//!     IoReadyEvents::INPUT,
//! )?;
//!
//! reactor.timer(Instant::now() + Duration::from_secs(1), |now| {
//!     /* periodic housekeeping; rearm one second out */
//!     *now += Duration::from_secs(1);
//!     true
//! });
//!
//! loop {
//!     reactor.dispatch()?;
//! }
//! # }
//! ```
//!
//! ## The pieces
//!
//! The dispatch engines are built from two primitives that can also be
//! used on their own:
//!
//! * [`DeferredRwLock`] / [`DeferrableRwLock`] provide reader/writer
//!   synchronization where writers queue destructive updates instead of
//!   blocking readers, and whichever thread witnesses the reader count
//!   reach zero applies them.
//! * [`PipeEventFlag`] / [`CondvarEventFlag`] are wake-up flags; the
//!   pipe-backed one is async-signal-safe on the raising side and is
//!   what lets other threads (or signal handlers) interrupt a dispatcher
//!   sleeping in `epoll_wait`.
//!
//! On top of those, [`Signal`] implements the observer pattern,
//! [`EpollDispatcher`] delivers fd readiness, [`TimerDispatcher`] runs a
//! deadline-ordered timer queue and [`AsyncSafeWorkDispatcher`] runs
//! procedures marked from signal-handler context. A [`Reactor`] wires
//! the four together around one shared trigger; applications that only
//! need a subset can compose the dispatchers by hand the same way.
//!
//! ## Delivery guarantees
//!
//! * A callback registered while deliveries are running becomes eligible
//!   starting with the next delivery that observes it; chains preserve
//!   registration order.
//! * `disconnect` is idempotent, infallible and deadlock-free; it may be
//!   called from inside the affected callback.
//! * When several threads dispatch the same IO dispatcher, each kernel
//!   event is processed by one of them, but the kernel may report the
//!   same level-triggered condition to more than one waiter - callbacks
//!   must tolerate duplicate delivery in that configuration.
//! * User callbacks run with no library lock held, so they may freely
//!   register, emit and disconnect.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod async_work;
mod connection;
mod deferred;
mod error;
mod eventflag;
mod ioready;
mod reactor;
mod signal;
mod sys;
mod timer;

pub use crate::async_work::{AsyncSafeConnection, AsyncSafeWorkDispatcher};
pub use crate::connection::{Connection, ScopedConnection};
pub use crate::deferred::{DeferrableRwLock, DeferredRwLock, SyncGuard, WriteGuard, WriteLock};
pub use crate::error::{ReflexError, Result};
pub use crate::eventflag::{CondvarEventFlag, EventFlag, EventTrigger, PipeEventFlag};
pub use crate::ioready::epoll::EpollDispatcher;
pub use crate::ioready::{
    create_ioready_dispatcher, IoReadyConnection, IoReadyDispatcher, IoReadyEvents, IoReadyFn,
    IoReadyService, ScopedIoReadyConnection,
};
pub use crate::reactor::{Reactor, ReactorBuilder};
pub use crate::signal::Signal;
pub use crate::timer::{TimerConnection, TimerDispatcher};

/// Provides common imports that almost all Reflex applications will need.
pub mod prelude {
    pub use crate::{
        Connection, EventFlag, EventTrigger, IoReadyDispatcher, IoReadyEvents, IoReadyService,
        Reactor, ReactorBuilder, Signal,
    };
}
