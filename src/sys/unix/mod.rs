/// Helper macro to execute a system call that returns an `io::Result`.
//
// Macro must be defined before any modules that uses them.
#[allow(unused_macros)]
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) mod selector;
pub(crate) mod waker;

pub(crate) use self::waker::Waker;

use std::io;

pub(crate) type RawIo = std::os::unix::io::RawFd;

pub(crate) fn close_io(io: RawIo) -> io::Result<()> {
    syscall!(close(io)).map(|_| ())
}

pub(crate) fn set_nonblocking(io: RawIo) -> io::Result<()> {
    let flags = syscall!(fcntl(io, libc::F_GETFL))?;
    if flags & libc::O_NONBLOCK == 0 {
        syscall!(fcntl(io, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

/// Fetches and clears the pending error on a socket.
///
/// Returns `None` when `io` is not a socket (poll and select report error
/// conditions for pipes too, but those have no queryable error code).
pub(crate) fn socket_error(io: RawIo) -> Option<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        io,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ))
    .ok()
    .map(|_| err)
}

/// Creates a non-blocking, close-on-exec pipe pair.
#[allow(dead_code)] // Only the non-eventfd targets build this.
pub(crate) fn pipe_pair() -> io::Result<(RawIo, RawIo)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    #[cfg(not(any(target_os = "ios", target_os = "macos")))]
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    {
        // `pipe2(2)` is not available on Apple platforms.
        syscall!(pipe(fds.as_mut_ptr()))?;
        for fd in &fds {
            if let Err(err) = syscall!(fcntl(*fd, libc::F_SETFL, libc::O_NONBLOCK))
                .and_then(|_| syscall!(fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC)))
            {
                let _ = syscall!(close(fds[0]));
                let _ = syscall!(close(fds[1]));
                return Err(err);
            }
        }
    }
    Ok((fds[0], fds[1]))
}

/// Parses the running kernel's "major.minor.release" version from
/// `uname(2)`. An empty release component counts as 0; anything that does
/// not parse yields `None` so callers can fall back conservatively.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn kernel_version() -> Option<(u32, u32, u32)> {
    let mut info: libc::utsname = unsafe { std::mem::zeroed() };
    syscall!(uname(&mut info)).ok()?;
    let release = unsafe { std::ffi::CStr::from_ptr(info.release.as_ptr()) };
    parse_kernel_release(release.to_str().ok()?)
}

/// Parses "5.15.0-91-generic" style release strings. Major and minor are
/// required; the release component is the leading run of digits after the
/// second dot and may be empty.
#[allow(dead_code)]
fn parse_kernel_release(release: &str) -> Option<(u32, u32, u32)> {
    let mut parts = release.splitn(3, '.');
    let major = leading_number(parts.next()?)?;
    let minor = leading_number(parts.next()?)?;
    let release = leading_number(parts.next()?).unwrap_or(0);
    Some((major, minor, release))
}

#[allow(dead_code)] // With parse_kernel_release, test-only off Linux.
fn leading_number(s: &str) -> Option<u32> {
    let digits: &str = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(0) => return None,
        Some(end) => &s[..end],
        None if s.is_empty() => return None,
        None => s,
    };
    digits.parse().ok()
}

/// Returns true if the running kernel is at least `major.minor.release`.
///
/// Probing failures degrade to `false`, the conservative choice.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn is_at_least_kernel(major: u32, minor: u32, release: u32) -> bool {
    match kernel_version() {
        Some(version) => version >= (major, minor, release),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_release_strings() {
        assert_eq!(parse_kernel_release("5.15.0-91-generic"), Some((5, 15, 0)));
        assert_eq!(parse_kernel_release("6.1.12"), Some((6, 1, 12)));
        assert_eq!(parse_kernel_release("2.5"), None);
        assert_eq!(parse_kernel_release("2.5.44"), Some((2, 5, 44)));
        assert_eq!(parse_kernel_release("4.4.0-1100-aws"), Some((4, 4, 0)));
        assert_eq!(parse_kernel_release("banana"), None);
        assert_eq!(parse_kernel_release(""), None);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn kernel_version_probe() {
        // Every kernel this crate can run its tests on postdates epoll.
        let (major, minor, release) = kernel_version().expect("uname failed");
        assert!((major, minor, release) >= (2, 5, 44));
        assert!(is_at_least_kernel(2, 5, 44));
        assert!(!is_at_least_kernel(major + 1, 0, 0));
    }
}
