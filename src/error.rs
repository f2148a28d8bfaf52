// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::os::unix::io::RawFd;
use std::{fmt, io};
use thiserror::Error;

/// Result type alias that all reflex public API functions can use.
pub type Result<T> = std::result::Result<T, ReflexError>;

/// Composite error type to encompass all error types reflex produces.
///
/// Registration and dispatching surface the underlying OS error where one
/// exists. `disconnect` itself is infallible and therefore never appears
/// here.
#[derive(Error)]
pub enum ReflexError {
    /// IO error from standard library functions
    #[error("IO error occurred: {0}")]
    IoError(#[from] io::Error),

    /// No kernel event multiplexer could be instantiated.
    #[error("unable to create dispatcher: {0}")]
    DispatcherCreate(#[source] io::Error),

    /// The kernel rejected a subscription change for a file descriptor,
    /// e.g. because the descriptor is invalid. The partial registration has
    /// been rolled back when this is returned.
    #[error("kernel rejected subscription for fd {fd}: {source}")]
    KernelRegistration {
        /// descriptor whose subscription change was rejected
        fd: RawFd,
        /// error reported by the kernel
        #[source]
        source: io::Error,
    },
}

#[doc(hidden)]
/// Keeps the embedded `io::Error` readable without pulling its full
/// `Debug` representation through every layer.
impl fmt::Debug for ReflexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReflexError::IoError(err) => f.write_fmt(format_args!("{:?}", err)),
            ReflexError::DispatcherCreate(err) => {
                f.write_fmt(format_args!("DispatcherCreate {{ {:?} }}", err))
            }
            ReflexError::KernelRegistration { fd, source } => f.write_fmt(format_args!(
                "KernelRegistration {{ fd: {}, {:?} }}",
                fd, source
            )),
        }
    }
}

impl From<ReflexError> for io::Error {
    fn from(err: ReflexError) -> Self {
        match err {
            ReflexError::IoError(io_err) => io_err,
            ReflexError::DispatcherCreate(io_err) => io_err,
            ReflexError::KernelRegistration { fd, source } => io::Error::new(
                source.kind(),
                format!("kernel rejected subscription for fd {}: {}", fd, source),
            ),
        }
    }
}

pub(crate) fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io;

    #[test]
    #[should_panic(expected = "kernel rejected subscription for fd 7")]
    fn kernel_registration_err_msg() {
        let err: Result<()> = Err(ReflexError::KernelRegistration {
            fd: 7,
            source: io::Error::from_raw_os_error(9),
        });
        panic!("{}", err.unwrap_err().to_string());
    }

    #[test]
    #[should_panic(expected = "unable to create dispatcher")]
    fn dispatcher_create_err_msg() {
        let err: Result<()> = Err(ReflexError::DispatcherCreate(io::Error::from_raw_os_error(
            24,
        )));
        panic!("{}", err.unwrap_err().to_string());
    }

    #[test]
    fn composite_error_from_into() {
        let err: ReflexError = io::Error::new(io::ErrorKind::Other, "test other io-error").into();
        let _: io::Error = err.into();

        let err = ReflexError::KernelRegistration {
            fd: 3,
            source: io::Error::from_raw_os_error(9),
        };
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::Other);
    }
}
