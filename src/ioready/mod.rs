// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! I/O readiness dispatching.
//!
//! Receivers register callbacks for readiness events on file descriptors
//! through the [`IoReadyService`] interface; an [`IoReadyDispatcher`]
//! additionally drives the kernel multiplexer and delivers the events.
//! [`EpollDispatcher`](crate::EpollDispatcher) is the shipped
//! implementation; [`create_ioready_dispatcher`] instantiates it.
//!
//! Callbacks receive the subset of [`IoReadyEvents`] that both occurred
//! and were requested. Requesting [`INPUT`](IoReadyEvents::INPUT) or
//! [`OUTPUT`](IoReadyEvents::OUTPUT) implicitly also requests
//! [`ERROR`](IoReadyEvents::ERROR) and [`HANGUP`](IoReadyEvents::HANGUP):
//! error conditions are always delivered to anyone watching the
//! descriptor for anything.

use std::fmt;
use std::ops;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{Connection, ErasedLink, LinkKind};
use crate::error::Result;
use crate::eventflag::EventFlag;

pub(crate) mod epoll;
pub(crate) mod fd_table;

use fd_table::IoReadyLink;

/// Set of readiness conditions on a file descriptor.
///
/// Masks are built with the bitwise operators:
///
/// ```
/// use reflex::IoReadyEvents;
/// let mask = IoReadyEvents::INPUT | IoReadyEvents::OUTPUT;
/// assert!(mask.contains(IoReadyEvents::INPUT));
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct IoReadyEvents(u32);

impl IoReadyEvents {
    /// Empty mask; a registration with this mask stays connected but
    /// receives nothing.
    pub const NONE: IoReadyEvents = IoReadyEvents(0);
    /// Descriptor ready for reading.
    pub const INPUT: IoReadyEvents = IoReadyEvents(0x0001);
    /// Descriptor ready for writing.
    pub const OUTPUT: IoReadyEvents = IoReadyEvents(0x0002);
    /// Error condition on the descriptor. Delivered without being
    /// requested whenever any other bit is set.
    pub const ERROR: IoReadyEvents = IoReadyEvents(0x0100);
    /// Peer hangup on the descriptor. Delivered without being requested
    /// whenever any other bit is set.
    pub const HANGUP: IoReadyEvents = IoReadyEvents(0x0200);

    /// True iff no condition is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True iff every condition in `other` is also set in `self`.
    pub fn contains(self, other: IoReadyEvents) -> bool {
        self.0 & other.0 == other.0
    }

    /// True iff `self` and `other` share at least one condition.
    pub fn intersects(self, other: IoReadyEvents) -> bool {
        self.0 & other.0 != 0
    }

    pub(crate) fn bits(self) -> u32 {
        self.0
    }

    pub(crate) fn from_bits(bits: u32) -> IoReadyEvents {
        IoReadyEvents(bits)
    }

    /// Input and output never travel alone: any interest in a descriptor
    /// implies interest in its failure modes.
    pub(crate) fn widen(self) -> IoReadyEvents {
        if self.is_empty() {
            self
        } else {
            self | IoReadyEvents::ERROR | IoReadyEvents::HANGUP
        }
    }
}

impl ops::BitOr for IoReadyEvents {
    type Output = IoReadyEvents;
    fn bitor(self, rhs: IoReadyEvents) -> IoReadyEvents {
        IoReadyEvents(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for IoReadyEvents {
    fn bitor_assign(&mut self, rhs: IoReadyEvents) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for IoReadyEvents {
    type Output = IoReadyEvents;
    fn bitand(self, rhs: IoReadyEvents) -> IoReadyEvents {
        IoReadyEvents(self.0 & rhs.0)
    }
}

impl ops::BitAndAssign for IoReadyEvents {
    fn bitand_assign(&mut self, rhs: IoReadyEvents) {
        self.0 &= rhs.0;
    }
}

impl ops::Not for IoReadyEvents {
    type Output = IoReadyEvents;
    fn not(self) -> IoReadyEvents {
        IoReadyEvents(!self.0)
    }
}

impl fmt::Debug for IoReadyEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(IoReadyEvents::INPUT) {
            parts.push("INPUT");
        }
        if self.contains(IoReadyEvents::OUTPUT) {
            parts.push("OUTPUT");
        }
        if self.contains(IoReadyEvents::ERROR) {
            parts.push("ERROR");
        }
        if self.contains(IoReadyEvents::HANGUP) {
            parts.push("HANGUP");
        }
        if parts.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&parts.join("|"))
        }
    }
}

/// Callback invoked with the events that fired on a watched descriptor.
pub type IoReadyFn = dyn Fn(IoReadyEvents) + Send + Sync;

/// Handle to a file-descriptor readiness registration.
///
/// Beyond the base [`disconnect`](IoReadyConnection::disconnect), the
/// watched event mask can be changed on the fly with
/// [`modify`](IoReadyConnection::modify) - much cheaper than cancelling
/// and re-registering.
#[derive(Clone, Default)]
pub struct IoReadyConnection {
    link: Option<Arc<IoReadyLink>>,
}

impl IoReadyConnection {
    pub(crate) fn new(link: Arc<IoReadyLink>) -> Self {
        IoReadyConnection { link: Some(link) }
    }

    /// See [`Connection::disconnect`]. The caller remains responsible for
    /// keeping the file descriptor open until disconnection has
    /// completed.
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.disconnect();
        }
    }

    /// See [`Connection::is_connected`].
    pub fn is_connected(&self) -> bool {
        match &self.link {
            Some(link) => link.is_connected(),
            None => false,
        }
    }

    /// Changes the set of watched conditions. [`IoReadyEvents::NONE`]
    /// suspends delivery without disconnecting (error notifications may
    /// still be generated by the kernel).
    pub fn modify(&self, event_mask: IoReadyEvents) {
        if let Some(link) = &self.link {
            link.modify(event_mask);
        }
    }

    /// The currently watched conditions, including the implicit
    /// error/hangup widening.
    pub fn event_mask(&self) -> IoReadyEvents {
        match &self.link {
            Some(link) => link.event_mask(),
            None => IoReadyEvents::NONE,
        }
    }
}

impl From<IoReadyConnection> for Connection {
    fn from(conn: IoReadyConnection) -> Connection {
        match conn.link {
            Some(link) => Connection::new(LinkKind::IoReady(link)),
            None => Connection::default(),
        }
    }
}

impl fmt::Debug for IoReadyConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("IoReadyConnection { .. }")
    }
}

/// [`IoReadyConnection`] variant that disconnects when dropped. The same
/// caveat as [`ScopedConnection`](crate::ScopedConnection) applies.
#[derive(Default)]
pub struct ScopedIoReadyConnection {
    connection: IoReadyConnection,
}

impl ScopedIoReadyConnection {
    /// See [`IoReadyConnection::disconnect`].
    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    /// See [`IoReadyConnection::is_connected`].
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// See [`IoReadyConnection::modify`].
    pub fn modify(&self, event_mask: IoReadyEvents) {
        self.connection.modify(event_mask);
    }

    /// See [`IoReadyConnection::event_mask`].
    pub fn event_mask(&self) -> IoReadyEvents {
        self.connection.event_mask()
    }
}

impl From<IoReadyConnection> for ScopedIoReadyConnection {
    fn from(connection: IoReadyConnection) -> Self {
        ScopedIoReadyConnection { connection }
    }
}

impl Drop for ScopedIoReadyConnection {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}

impl fmt::Debug for ScopedIoReadyConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("ScopedIoReadyConnection { .. }")
    }
}

/// Registration interface for I/O readiness callbacks.
pub trait IoReadyService {
    /// Registers `function` to be called whenever one of the conditions
    /// in `event_mask` holds for `fd`. Fails if the kernel rejects the
    /// subscription (e.g. invalid descriptor); in that case the partial
    /// registration is fully rolled back.
    fn watch(
        &self,
        function: Box<IoReadyFn>,
        fd: RawFd,
        event_mask: IoReadyEvents,
    ) -> Result<IoReadyConnection>;
}

/// A free-standing dispatcher for I/O readiness events.
///
/// Several threads may call [`dispatch`](IoReadyDispatcher::dispatch)
/// concurrently; every kernel-level event is then delivered to one of
/// them, though the kernel may report the same level-triggered condition
/// to more than one waiter. Callers running multi-threaded dispatch must
/// tolerate a callback being invoked twice for one event.
pub trait IoReadyDispatcher: IoReadyService + Send + Sync {
    /// Waits up to `timeout` (`None` = indefinitely) for events and
    /// processes at most `limit` of them, returning the number
    /// processed. Returns early - possibly with 0 - when the associated
    /// event trigger is raised.
    fn dispatch(&self, timeout: Option<Duration>, limit: usize) -> Result<usize>;

    /// Processes up to `limit` already-pending events without ever
    /// sleeping.
    fn dispatch_pending(&self, limit: usize) -> Result<usize>;

    /// The trigger associated with this dispatcher. Raising it wakes a
    /// dispatch call sleeping in the kernel; the wake-up is consumed by
    /// the dispatch call that observes it. The first call lazily sets up
    /// the trigger's pipe and registers it as an internal input source.
    fn eventtrigger(&self) -> Result<Arc<dyn EventFlag>>;
}

/// Instantiates the best dispatcher available on the current platform.
/// On Linux that is [`EpollDispatcher`](crate::EpollDispatcher), which is
/// also the only supported platform.
pub fn create_ioready_dispatcher() -> Result<Box<dyn IoReadyDispatcher>> {
    Ok(Box::new(epoll::EpollDispatcher::new()?))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mask_operations() {
        let mask = IoReadyEvents::INPUT | IoReadyEvents::OUTPUT;
        assert!(mask.contains(IoReadyEvents::INPUT));
        assert!(mask.contains(IoReadyEvents::OUTPUT));
        assert!(!mask.contains(IoReadyEvents::ERROR));
        assert!(mask.intersects(IoReadyEvents::INPUT | IoReadyEvents::ERROR));
        assert!((mask & IoReadyEvents::INPUT) == IoReadyEvents::INPUT);
        assert!((mask & !IoReadyEvents::INPUT) == IoReadyEvents::OUTPUT);
        assert!(IoReadyEvents::NONE.is_empty());
    }

    #[test]
    fn widening_requests_failure_modes() {
        assert_eq!(IoReadyEvents::NONE.widen(), IoReadyEvents::NONE);
        let widened = IoReadyEvents::INPUT.widen();
        assert!(widened.contains(IoReadyEvents::ERROR));
        assert!(widened.contains(IoReadyEvents::HANGUP));
    }

    #[test]
    fn mask_debug_format() {
        let mask = IoReadyEvents::INPUT | IoReadyEvents::HANGUP;
        assert_eq!(format!("{:?}", mask), "INPUT|HANGUP");
        assert_eq!(format!("{:?}", IoReadyEvents::NONE), "NONE");
    }
}
