/// Helper macro to execute a Windows API call that returns an
/// `io::Result`. The first argument names the failure convention of the
/// call: `BOOL` (zero is failure), `SOCKET` (`SOCKET_ERROR` is failure)
/// or `HANDLE` (`INVALID_HANDLE_VALUE` is failure).
//
// Macro must be defined before any modules that uses them.
#[allow(unused_macros)]
macro_rules! syscall {
    (BOOL, $e: expr) => {{
        let res = unsafe { $e };
        if res == 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
    (SOCKET, $e: expr) => {{
        let res = unsafe { $e };
        if res == windows_sys::Win32::Networking::WinSock::SOCKET_ERROR {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
    (HANDLE, $e: expr) => {{
        let res = unsafe { $e };
        if res == windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
    (PTR, $e: expr) => {{
        let res = unsafe { $e };
        if res.is_null() {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) mod cp;
pub(crate) mod selector;

use std::io;

use windows_sys::Win32::Networking::WinSock::{
    closesocket, getsockopt, ioctlsocket, FIONBIO, INVALID_SOCKET, SOL_SOCKET, SO_ERROR,
};

/// The readiness family multiplexes sockets on Windows.
pub(crate) type RawIo = std::os::windows::io::RawSocket;

pub(crate) const INVALID_IO: RawIo = INVALID_SOCKET as RawIo;

pub(crate) fn close_io(io: RawIo) -> io::Result<()> {
    syscall!(SOCKET, closesocket(io as usize)).map(|_| ())
}

pub(crate) fn set_nonblocking(io: RawIo) -> io::Result<()> {
    let mut nonblocking: u32 = 1;
    syscall!(SOCKET, ioctlsocket(io as usize, FIONBIO, &mut nonblocking)).map(|_| ())
}

/// Fetches and clears the pending error on a socket.
pub(crate) fn socket_error(io: RawIo) -> Option<i32> {
    let mut err: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as i32;
    syscall!(
        SOCKET,
        getsockopt(
            io as usize,
            SOL_SOCKET as i32,
            SO_ERROR as i32,
            &mut err as *mut _ as *mut u8,
            &mut len,
        )
    )
    .ok()
    .map(|_| err)
}

/// The socket pollers have no interrupt mechanism; `WSAPoll` and `select`
/// cannot wait on anything but sockets. `Poller::interrupt` reports this
/// as a logical error.
#[derive(Debug)]
pub(crate) struct Waker;

impl Waker {
    pub(crate) fn wake(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interrupt is not supported by the socket pollers",
        ))
    }

    pub(crate) fn reset(&self) -> io::Result<()> {
        Ok(())
    }
}
