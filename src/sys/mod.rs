//! Platform-specific backends.
//!
//! Each backend exposes the same small surface to the portable poller
//! core: register / reregister / deregister a raw descriptor under a slot
//! index, and a `select` that translates one batch of kernel events into
//! [`Event`] records. The poller core owns the slot table, the locking
//! discipline and the dispatch rules; backends only talk to the kernel.

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
pub(crate) use self::unix::{
    close_io, selector, set_nonblocking, socket_error, RawIo, Waker,
};

#[cfg(windows)]
pub(crate) mod windows;
#[cfg(windows)]
pub(crate) use self::windows::{
    close_io, selector, set_nonblocking, socket_error, RawIo, Waker, INVALID_IO,
};

/// Reserved slot index for the poller's interrupt waker. Events carrying
/// it drain the wake-up signal and are never dispatched to user code.
pub(crate) const WAKER_SLOT: usize = usize::MAX;

/// One kernel event, translated out of the backend's native record.
///
/// `slot` is the index the descriptor was registered under. `errno`
/// carries the error code when the backend reports one directly (kqueue
/// puts it in `kevent.data`); for backends that only flag the condition
/// the poller core resolves the code itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub(crate) slot: usize,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) hangup: bool,
    pub(crate) error: bool,
    pub(crate) errno: Option<i32>,
}

impl Event {
    pub(crate) fn new(slot: usize) -> Event {
        Event {
            slot,
            readable: false,
            writable: false,
            hangup: false,
            error: false,
            errno: None,
        }
    }
}
