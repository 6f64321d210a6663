use std::borrow::Cow;
use std::error;
use std::fmt;
use std::io;

/// A specialized `Result` type for poller and transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by pollers, transports and factories.
///
/// Failures of setup operations (attach, interest changes, the poll call
/// itself) are returned to the caller. Failures observed on an individual
/// transport while draining events are delivered to that transport's
/// listener instead, and the transport is detached automatically.
#[derive(Debug)]
pub enum Error {
    /// An internal allocation failed.
    OutOfMemory,
    /// The operating system reported an error.
    Platform {
        /// The raw OS error code (`errno` / `GetLastError`).
        code: i32,
        message: String,
    },
    /// The operation itself was invalid, e.g. attaching a transport that
    /// is already attached, or a descriptor the backend cannot handle.
    Logical(Cow<'static, str>),
}

impl Error {
    /// Returns an `Error` for the last OS error on the calling thread.
    pub fn last_os_error() -> Error {
        Error::from(io::Error::last_os_error())
    }

    pub(crate) fn logical(message: &'static str) -> Error {
        Error::Logical(Cow::Borrowed(message))
    }

    pub(crate) fn platform(code: i32) -> Error {
        Error::Platform {
            code,
            message: io::Error::from_raw_os_error(code).to_string(),
        }
    }

    /// The raw OS error code, if this is a platform error.
    pub fn raw_os_error(&self) -> Option<i32> {
        match *self {
            Error::Platform { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::Platform { code, ref message } => {
                write!(f, "{} (os error {})", message, code)
            }
            Error::Logical(ref message) => f.write_str(message),
        }
    }
}

impl error::Error for Error {}

#[cfg(unix)]
const OUT_OF_MEMORY: i32 = libc::ENOMEM;
#[cfg(windows)]
const OUT_OF_MEMORY: i32 = windows_sys::Win32::Foundation::ERROR_NOT_ENOUGH_MEMORY as i32;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(OUT_OF_MEMORY) => Error::OutOfMemory,
            Some(code) => Error::Platform {
                code,
                message: err.to_string(),
            },
            // Synthetic errors (e.g. invalid input detected before any
            // syscall) carry no OS code.
            None => Error::Logical(Cow::Owned(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trip() {
        let err = Error::from(io::Error::from_raw_os_error(OUT_OF_MEMORY));
        assert!(matches!(err, Error::OutOfMemory));

        #[cfg(unix)]
        {
            let err = Error::from(io::Error::from_raw_os_error(libc::EBADF));
            assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        }
    }

    #[test]
    fn logical_from_synthetic() {
        let err = Error::from(io::Error::new(io::ErrorKind::InvalidInput, "nope"));
        assert!(matches!(err, Error::Logical(_)));
        assert_eq!(err.raw_os_error(), None);
    }
}
