use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;
use std::time::Duration;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use super::{DEFAULT_EVENT_CAPACITY, MAX_EVENT_CAPACITY};
use crate::sys::unix::waker::Waker;
use crate::sys::unix::RawIo;
use crate::sys::{Event, WAKER_SLOT};
use crate::TransportFlags;

/// Readiness backend over `epoll(7)`. The slot index travels through the
/// kernel in `epoll_data.u64`.
#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
    /// Kernel event buffer. `select` is single-flight (the poller's poll
    /// lock), so this mutex is never contended; it only provides interior
    /// mutability for the buffer swap when the batch saturates.
    buffer: Mutex<Vec<libc::epoll_event>>,
    grow: bool,
}

impl Selector {
    pub(crate) fn new(capacity: Option<usize>) -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector {
            ep,
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
        let mut event = libc::epoll_event {
            events: flags_to_epoll(flags),
            u64: slot as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            io,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn reregister(
        &self,
        io: RawIo,
        slot: usize,
        _old: TransportFlags,
        new: TransportFlags,
    ) -> io::Result<()> {
        // A single MOD rewrites the whole subscription, including the
        // edge-trigger bit.
        let mut event = libc::epoll_event {
            events: flags_to_epoll(new),
            u64: slot as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            io,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn deregister(&self, io: RawIo, _old: TransportFlags) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            io,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }

    pub(crate) fn select(
        &self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout,
                // unless the caller explicitly requests that by specifying
                // a zero timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        let mut buffer = self.buffer.lock().unwrap();
        buffer.clear();
        let n_events = match syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            buffer.as_mut_ptr(),
            buffer.capacity() as i32,
            timeout,
        )) {
            Ok(n) => n as usize,
            // A signal landed while waiting; report an empty batch.
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        };
        // SAFETY: `epoll_wait` ensures that `n_events` are assigned.
        unsafe { buffer.set_len(n_events) };

        for ev in buffer.iter() {
            events.push(translate(ev));
        }

        // A full batch means there may be more events waiting; give the
        // next drain a larger buffer.
        if self.grow && n_events == buffer.capacity() && buffer.capacity() < MAX_EVENT_CAPACITY {
            let new_capacity = buffer.capacity() * 2;
            buffer.clear();
            buffer.reserve_exact(new_capacity);
        }
        Ok(())
    }

    pub(crate) fn make_waker(&self) -> io::Result<Waker> {
        let (waker, fd) = Waker::new_fd_based()?;
        self.register(fd, WAKER_SLOT, TransportFlags::READING)?;
        Ok(waker)
    }
}

fn flags_to_epoll(flags: TransportFlags) -> u32 {
    let mut kind = 0;

    if flags.is_edge_triggered() {
        kind |= EPOLLET;
    }

    if flags.is_reading() {
        kind |= EPOLLIN | EPOLLRDHUP;
    }

    if flags.is_writing() {
        kind |= EPOLLOUT;
    }

    kind as u32
}

fn translate(ev: &libc::epoll_event) -> Event {
    let bits = ev.events as libc::c_int;
    let mut event = Event::new(ev.u64 as usize);
    event.readable = bits & EPOLLIN != 0;
    event.writable = bits & EPOLLOUT != 0;
    event.hangup = bits & (EPOLLHUP | EPOLLRDHUP) != 0;
    event.error = bits & EPOLLERR != 0;
    event
}
