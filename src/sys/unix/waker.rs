//! Wake a blocked `poll` from another thread.
//!
//! On Linux and Android an `eventfd(2)` is registered with the backend
//! under the reserved waker slot. Other platforms use a non-blocking
//! self-pipe. The kqueue backend on Apple and FreeBSD targets does not use
//! this module at all; it posts an `EVFILT_USER` event instead.

use std::io;

use super::RawIo;

#[derive(Debug)]
pub(crate) enum Waker {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Eventfd { fd: RawIo },
    #[allow(dead_code)] // Not constructed on eventfd-only targets.
    Pipe { read: RawIo, write: RawIo },
    /// kqueue user-event wakers carry no descriptor; triggering and
    /// resetting both go through the kqueue itself.
    #[cfg(any(
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos"
    ))]
    Kevent { kq: RawIo },
}

impl Waker {
    /// Creates the waker used by the epoll, poll and select backends. The
    /// returned descriptor must be registered under the waker slot.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(crate) fn new_fd_based() -> io::Result<(Waker, RawIo)> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok((Waker::Eventfd { fd }, fd))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(crate) fn new_fd_based() -> io::Result<(Waker, RawIo)> {
        let (read, write) = super::pipe_pair()?;
        Ok((Waker::Pipe { read, write }, read))
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        match *self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Waker::Eventfd { fd } => {
                let buf: [u8; 8] = 1u64.to_ne_bytes();
                match syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())) {
                    Ok(_) => Ok(()),
                    // The counter hit its maximum; a wake-up is pending
                    // anyway.
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Waker::Pipe { write, .. } => {
                let buf = [1u8];
                match syscall!(write(write, buf.as_ptr() as *const libc::c_void, 1)) {
                    Ok(_) => Ok(()),
                    // The pipe is full; a wake-up is pending anyway.
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
                    Err(err) => Err(err),
                }
            }
            #[cfg(any(target_os = "freebsd", target_os = "ios", target_os = "macos"))]
            Waker::Kevent { kq } => super::selector::kqueue::trigger_user_event(kq),
        }
    }

    /// Drains the wake-up signal after its event was collected.
    pub(crate) fn reset(&self) -> io::Result<()> {
        match *self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Waker::Eventfd { fd } => {
                let mut buf = [0u8; 8];
                // A single read clears the counter.
                let _ = syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()));
                Ok(())
            }
            Waker::Pipe { read, .. } => {
                let mut buf = [0u8; 64];
                while syscall!(read(read, buf.as_mut_ptr() as *mut libc::c_void, buf.len()))
                    .map(|n| n as usize == buf.len())
                    .unwrap_or(false)
                {}
                Ok(())
            }
            // EV_CLEAR resets the user event when it is collected.
            #[cfg(any(target_os = "freebsd", target_os = "ios", target_os = "macos"))]
            Waker::Kevent { .. } => Ok(()),
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        match *self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Waker::Eventfd { fd } => {
                let _ = syscall!(close(fd));
            }
            Waker::Pipe { read, write } => {
                let _ = syscall!(close(read));
                let _ = syscall!(close(write));
            }
            // The kqueue descriptor is owned by the selector.
            #[cfg(any(target_os = "freebsd", target_os = "ios", target_os = "macos"))]
            Waker::Kevent { .. } => {}
        }
    }
}
