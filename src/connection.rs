// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Connection handles.
//!
//! Every registration - on a [`Signal`](crate::Signal), an IO dispatcher,
//! a timer queue or an async-safe work dispatcher - hands back a handle
//! through which the registration can later be broken. The kind-specific
//! handles ([`IoReadyConnection`](crate::IoReadyConnection),
//! [`TimerConnection`](crate::TimerConnection), ...) carry their extra
//! operations; all of them convert into the kind-erased [`Connection`],
//! which only knows how to disconnect and to report liveness.
//!
//! # Disconnect semantics
//!
//! `disconnect` is idempotent and infallible. The guarantee it makes is
//! deliberately weak enough to allow high concurrency:
//!
//! - no invocation of the callback will start in the calling thread after
//!   `disconnect` returns (within one thread, disconnection is
//!   synchronous);
//! - other threads may deliver the callback after `disconnect` has
//!   returned, but only for events that occurred before the disconnect
//!   became visible to them - at most one extra invocation per
//!   dispatching thread.
//!
//! Because of this, `disconnect` may be called from anywhere: from inside
//! the callback being disconnected, from other threads, from other
//! callbacks. It never deadlocks.

use std::fmt;
use std::sync::Arc;

use crate::async_work::AsyncWorkLink;
use crate::ioready::fd_table::IoReadyLink;
use crate::timer::TimerLink;

/// Object-safe view of a signal chain link; the chain itself is generic
/// over its payload, so the erased handle goes through a vtable.
pub(crate) trait ErasedLink: Send + Sync {
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
}

/// A connection forgets which service it came from, but the small, closed
/// set of link kinds makes a tagged union cheaper and more transparent
/// than another layer of virtual dispatch.
pub(crate) enum LinkKind {
    Signal(Arc<dyn ErasedLink>),
    IoReady(Arc<IoReadyLink>),
    Timer(Arc<TimerLink>),
    AsyncWork(Arc<AsyncWorkLink>),
}

impl LinkKind {
    fn disconnect(&self) {
        match self {
            LinkKind::Signal(l) => l.disconnect(),
            LinkKind::IoReady(l) => l.disconnect(),
            LinkKind::Timer(l) => l.disconnect(),
            LinkKind::AsyncWork(l) => l.disconnect(),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            LinkKind::Signal(l) => l.is_connected(),
            LinkKind::IoReady(l) => l.is_connected(),
            LinkKind::Timer(l) => l.is_connected(),
            LinkKind::AsyncWork(l) => l.is_connected(),
        }
    }
}

impl Clone for LinkKind {
    fn clone(&self) -> Self {
        match self {
            LinkKind::Signal(l) => LinkKind::Signal(l.clone()),
            LinkKind::IoReady(l) => LinkKind::IoReady(l.clone()),
            LinkKind::Timer(l) => LinkKind::Timer(l.clone()),
            LinkKind::AsyncWork(l) => LinkKind::AsyncWork(l.clone()),
        }
    }
}

/// Handle to a registered callback of any kind.
///
/// See the [module docs](self) for the exact disconnect guarantee. An
/// empty (default-constructed or already-disconnected) connection is
/// valid; its operations do nothing.
#[derive(Clone, Default)]
pub struct Connection {
    link: Option<LinkKind>,
}

impl Connection {
    pub(crate) fn new(link: LinkKind) -> Self {
        Connection { link: Some(link) }
    }

    /// Breaks the connection and releases this handle's reference to it.
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.disconnect();
        }
    }

    /// Returns false once the link has been logically removed, whether
    /// through this handle or any other.
    pub fn is_connected(&self) -> bool {
        match &self.link {
            Some(link) => link.is_connected(),
            None => false,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Connection { .. }")
    }
}

/// Connection variant that disconnects automatically when dropped.
///
/// An object can use this to track registrations pointing at itself and
/// have them broken on destruction. Only do this when all callback
/// invocations run in the same thread as the destruction; otherwise a
/// delivery may race the teardown of the receiver.
#[derive(Default)]
pub struct ScopedConnection {
    connection: Connection,
}

impl ScopedConnection {
    /// See [`Connection::disconnect`].
    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    /// See [`Connection::is_connected`].
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }
}

impl From<Connection> for ScopedConnection {
    fn from(connection: Connection) -> Self {
        ScopedConnection { connection }
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}

impl fmt::Debug for ScopedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("ScopedConnection { .. }")
    }
}
