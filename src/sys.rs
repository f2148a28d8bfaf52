// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Thin wrappers over the handful of OS objects the crate needs: the
//! self-pipe used by [`PipeEventFlag`](crate::eventflag::PipeEventFlag) and
//! the timeout conversion for `epoll_wait`.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::errno_to_io;

/// Creates the control pipe for an event flag. Only `O_CLOEXEC` is
/// applied; reads and writes stay blocking so that a drain is
/// guaranteed to consume the wakeup byte once it lands.
pub(crate) fn create_wake_pipe() -> io::Result<(RawFd, RawFd)> {
    unistd::pipe2(OFlag::O_CLOEXEC).map_err(errno_to_io)
}

/// Writes the single wakeup byte. Must stay async-signal-safe: one atomic
/// `write(2)`, retried on `EINTR` only.
pub(crate) fn write_wake_byte(fd: RawFd) {
    let buf = [0u8; 1];
    loop {
        match unistd::write(fd, &buf) {
            Ok(1) => return,
            Ok(_) | Err(Errno::EINTR) => continue,
            // Nothing sensible can be done here; the waiter will still be
            // released by a later write or by its timeout.
            Err(_) => return,
        }
    }
}

/// Consumes one wakeup byte from the read end.
pub(crate) fn drain_wake_byte(fd: RawFd) {
    let mut buf = [0u8; 1];
    loop {
        match unistd::read(fd, &mut buf) {
            Ok(1) => return,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => return,
        }
    }
}

/// Blocks until the read end of the pipe is readable.
pub(crate) fn wait_readable(fd: RawFd) {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, -1) {
            Ok(_) => {
                if let Some(revents) = fds[0].revents() {
                    if revents.intersects(
                        PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP,
                    ) {
                        return;
                    }
                }
            }
            Err(Errno::EINTR) => continue,
            Err(_) => return,
        }
    }
}

/// Converts an optional timeout into the millisecond argument `epoll_wait`
/// expects. `None` waits indefinitely; finite timeouts are rounded up so a
/// sleep never returns early, and clamped so huge durations do not wrap the
/// kernel's `int`.
pub(crate) fn timeout_to_epoll_ms(timeout: Option<Duration>) -> isize {
    match timeout {
        None => -1,
        Some(d) => {
            let millis = d.as_micros().saturating_add(999) / 1000;
            millis.min(libc::INT_MAX as u128) as isize
        }
    }
}
