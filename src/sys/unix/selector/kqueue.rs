use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;
use std::time::Duration;
use std::{cmp, io, ptr, slice};

use super::{DEFAULT_EVENT_CAPACITY, MAX_EVENT_CAPACITY};
use crate::sys::unix::waker::Waker;
use crate::sys::unix::RawIo;
use crate::sys::{Event, WAKER_SLOT};
use crate::TransportFlags;

// Type of the `nchanges` and `nevents` parameters in the `kevent` function.
#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

// Type of the `data` field in the `kevent` structure.
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos"
))]
type Data = libc::intptr_t;
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
type Data = i64;

// Type of the `udata` field in the `kevent` structure.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $data: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: $data as UData,
        }
    };
}

/// Readiness backend over `kqueue(2)`. Read and write interest are
/// separate kernel filters; interest changes are computed per filter.
#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
    // See the epoll backend for why this mutex is uncontended.
    buffer: Mutex<Vec<libc::kevent>>,
    grow: bool,
}

impl Selector {
    pub(crate) fn new(capacity: Option<usize>) -> io::Result<Selector> {
        let kq = syscall!(kqueue())
            .and_then(|kq| syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC)).map(|_| kq))?;
        // SAFETY: `kqueue(2)` ensures the fd is valid.
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };
        Ok(Selector {
            kq,
            buffer: Mutex::new(Vec::with_capacity(
                capacity.unwrap_or(DEFAULT_EVENT_CAPACITY).max(1),
            )),
            grow: capacity.is_none(),
        })
    }

    pub(crate) fn register(
        &self,
        io: RawIo,
        slot: usize,
        flags: TransportFlags,
    ) -> io::Result<()> {
        self.update_filters(io, slot, TransportFlags::NONE, flags)
    }

    pub(crate) fn reregister(
        &self,
        io: RawIo,
        slot: usize,
        old: TransportFlags,
        new: TransportFlags,
    ) -> io::Result<()> {
        // Toggling the edge-trigger bit rewrites both subscriptions.
        if old.is_edge_triggered() != new.is_edge_triggered() {
            self.update_filters(io, slot, old, TransportFlags::NONE)?;
            return self.update_filters(io, slot, TransportFlags::NONE, new);
        }
        self.update_filters(io, slot, old, new)
    }

    pub(crate) fn deregister(&self, io: RawIo, old: TransportFlags) -> io::Result<()> {
        self.update_filters(io, 0, old, TransportFlags::NONE)
    }

    /// Issues the minimum set of filter changes turning `old` into `new`.
    fn update_filters(
        &self,
        io: RawIo,
        slot: usize,
        old: TransportFlags,
        new: TransportFlags,
    ) -> io::Result<()> {
        let extra = if new.is_edge_triggered() {
            libc::EV_CLEAR
        } else {
            0
        };
        let add = libc::EV_ADD | libc::EV_ENABLE | libc::EV_RECEIPT | extra;
        let del = libc::EV_DELETE | libc::EV_RECEIPT;

        // At most we need two changes, but maybe we only need 1.
        let mut changes: [MaybeUninit<libc::kevent>; 2] =
            [MaybeUninit::uninit(), MaybeUninit::uninit()];
        let mut n_changes = 0;

        if old.is_reading() != new.is_reading() {
            let flags = if new.is_reading() { add } else { del };
            changes[n_changes] = MaybeUninit::new(kevent!(io, libc::EVFILT_READ, flags, slot));
            n_changes += 1;
        }
        if old.is_writing() != new.is_writing() {
            let flags = if new.is_writing() { add } else { del };
            changes[n_changes] = MaybeUninit::new(kevent!(io, libc::EVFILT_WRITE, flags, slot));
            n_changes += 1;
        }
        if n_changes == 0 {
            return Ok(());
        }

        // SAFETY: the first `n_changes` elements are initialized above.
        let changes = unsafe { slice::from_raw_parts_mut(changes[0].as_mut_ptr(), n_changes) };

        // ENOENT: deleting a filter that was already removed (for example
        // after the kernel dropped it on EOF) is not a failure. EPIPE:
        // older macOS versions report it when registering a pipe whose
        // peer is gone, yet still deliver the EOF event afterwards.
        kevent_register(
            self.kq.as_raw_fd(),
            changes,
            &[libc::ENOENT as Data, libc::EPIPE as Data],
        )
    }

    pub(crate) fn select(
        &self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let timeout = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            // `Duration::subsec_nanos` is guaranteed to be less than one
            // billion, making the cast to i32 safe. The cast itself is
            // needed for platforms where C's long is only 32 bits.
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timeout = timeout
            .as_ref()
            .map(|s| s as *const _)
            .unwrap_or(ptr::null());

        let mut buffer = self.buffer.lock().unwrap();
        buffer.clear();
        let n_events = match syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            buffer.as_mut_ptr(),
            buffer.capacity() as Count,
            timeout,
        )) {
            Ok(n) => n as usize,
            // A signal landed while waiting; report an empty batch.
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        };
        // SAFETY: `kevent` ensures that `n_events` are assigned.
        unsafe { buffer.set_len(n_events) };

        for ev in buffer.iter() {
            events.push(translate(ev));
        }

        if self.grow && n_events == buffer.capacity() && buffer.capacity() < MAX_EVENT_CAPACITY {
            let new_capacity = buffer.capacity() * 2;
            buffer.clear();
            buffer.reserve_exact(new_capacity);
        }
        Ok(())
    }

    #[cfg(any(target_os = "freebsd", target_os = "ios", target_os = "macos"))]
    pub(crate) fn make_waker(&self) -> io::Result<Waker> {
        // Accept user space notifications under the waker slot.
        let mut kevent = kevent!(
            0,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT,
            WAKER_SLOT
        );
        syscall!(kevent(
            self.kq.as_raw_fd(),
            &kevent,
            1,
            &mut kevent,
            1,
            ptr::null()
        ))
        .and_then(|_| {
            if (kevent.flags & libc::EV_ERROR) != 0 && kevent.data != 0 {
                Err(io::Error::from_raw_os_error(kevent.data as i32))
            } else {
                Ok(())
            }
        })?;
        Ok(Waker::Kevent {
            kq: self.kq.as_raw_fd(),
        })
    }

    #[cfg(not(any(target_os = "freebsd", target_os = "ios", target_os = "macos")))]
    pub(crate) fn make_waker(&self) -> io::Result<Waker> {
        // No EVFILT_USER; fall back to a self-pipe in the slot table.
        let (waker, fd) = Waker::new_fd_based()?;
        self.register(fd, WAKER_SLOT, TransportFlags::READING)?;
        Ok(waker)
    }
}

/// Posts the user event registered by `make_waker`.
#[cfg(any(target_os = "freebsd", target_os = "ios", target_os = "macos"))]
pub(crate) fn trigger_user_event(kq: RawIo) -> io::Result<()> {
    let mut kevent = kevent!(
        0,
        libc::EVFILT_USER,
        libc::EV_ADD | libc::EV_RECEIPT,
        WAKER_SLOT
    );
    kevent.fflags = libc::NOTE_TRIGGER;

    syscall!(kevent(kq, &kevent, 1, &mut kevent, 1, ptr::null())).and_then(|_| {
        if (kevent.flags & libc::EV_ERROR) != 0 && kevent.data != 0 {
            Err(io::Error::from_raw_os_error(kevent.data as i32))
        } else {
            Ok(())
        }
    })
}

/// Register `changes` with `kq`ueue.
fn kevent_register(
    kq: RawIo,
    changes: &mut [libc::kevent],
    ignored_errors: &[Data],
) -> io::Result<()> {
    syscall!(kevent(
        kq,
        changes.as_ptr(),
        changes.len() as Count,
        changes.as_mut_ptr(),
        changes.len() as Count,
        ptr::null(),
    ))
    .map(|_| ())
    .or_else(|err| {
        // According to the manual page of FreeBSD: "When kevent() call
        // fails with EINTR error, all changes in the changelist have been
        // applied", so we can safely ignore it.
        if err.raw_os_error() == Some(libc::EINTR) {
            Ok(())
        } else {
            Err(err)
        }
    })
    .and_then(|()| check_errors(changes, ignored_errors))
}

/// Check all events for possible errors, it returns the first error found.
fn check_errors(events: &[libc::kevent], ignored_errors: &[Data]) -> io::Result<()> {
    for event in events {
        // We can't use references to packed structures (in checking the
        // ignored errors), so we need copy the data out before use.
        let data = event.data;
        // Check for the error flag, the actual error will be in the `data`
        // field.
        if (event.flags & libc::EV_ERROR != 0) && data != 0 && !ignored_errors.contains(&data) {
            return Err(io::Error::from_raw_os_error(data as i32));
        }
    }
    Ok(())
}

fn translate(ev: &libc::kevent) -> Event {
    let mut event = Event::new(ev.udata as usize);
    if ev.flags & libc::EV_ERROR != 0 {
        event.error = true;
        event.errno = Some(ev.data as i32);
        return event;
    }
    if ev.flags & libc::EV_EOF != 0 {
        event.hangup = true;
        // When the peer closed, `fflags` carries the socket error if any.
        if ev.fflags != 0 {
            event.error = true;
            event.errno = Some(ev.fflags as i32);
        }
        return event;
    }
    match ev.filter {
        libc::EVFILT_READ => event.readable = true,
        libc::EVFILT_WRITE => event.writable = true,
        #[cfg(any(target_os = "freebsd", target_os = "ios", target_os = "macos"))]
        libc::EVFILT_USER => event.readable = true,
        _ => {}
    }
    event
}
