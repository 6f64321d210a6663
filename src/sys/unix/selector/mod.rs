#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod epoll;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) mod kqueue;

pub(crate) mod poll;
pub(crate) mod select;

/// Starting capacity of a growable kernel event buffer.
#[allow(dead_code)] // Only the epoll/kqueue backends grow buffers.
pub(crate) const DEFAULT_EVENT_CAPACITY: usize = 32;

/// Growable buffers double until this bound.
#[allow(dead_code)]
pub(crate) const MAX_EVENT_CAPACITY: usize = (i32::MAX / 2) as usize;
