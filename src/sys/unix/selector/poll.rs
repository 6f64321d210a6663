use std::io;
use std::sync::Mutex;
use std::time::Duration;

use crate::sys::unix::waker::Waker;
use crate::sys::unix::RawIo;
use crate::sys::{Event, WAKER_SLOT};
use crate::TransportFlags;

/// Readiness backend over `poll(2)`.
///
/// The kernel keeps no registration state for this backend, so the
/// descriptor table is mirrored into a `pollfd` array on every call.
/// Registrations and interest changes are staged and applied at the top of
/// `select`; there is no ordering guarantee between a registration and the
/// next poll beyond that.
#[derive(Debug)]
pub(crate) struct Selector {
    entries: Mutex<Vec<PollEntry>>,
    staged: Mutex<Vec<Change>>,
}

#[derive(Debug, Clone, Copy)]
struct PollEntry {
    io: RawIo,
    slot: usize,
    flags: TransportFlags,
}

#[derive(Debug)]
enum Change {
    Add {
        io: RawIo,
        slot: usize,
        flags: TransportFlags,
    },
    Update {
        io: RawIo,
        flags: TransportFlags,
    },
    Remove {
        io: RawIo,
    },
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        Ok(Selector {
            entries: Mutex::new(Vec::new()),
            staged: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn register(
        &self,
        io: RawIo,
        slot: usize,
        flags: TransportFlags,
    ) -> io::Result<()> {
        self.staged
            .lock()
            .unwrap()
            .push(Change::Add { io, slot, flags });
        Ok(())
    }

    pub(crate) fn reregister(
        &self,
        io: RawIo,
        _slot: usize,
        _old: TransportFlags,
        new: TransportFlags,
    ) -> io::Result<()> {
        self.staged
            .lock()
            .unwrap()
            .push(Change::Update { io, flags: new });
        Ok(())
    }

    pub(crate) fn deregister(&self, io: RawIo, _old: TransportFlags) -> io::Result<()> {
        self.staged.lock().unwrap().push(Change::Remove { io });
        Ok(())
    }

    pub(crate) fn select(
        &self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        self.apply_staged(&mut entries);

        let mut pollfds: Vec<libc::pollfd> = entries
            .iter()
            .map(|entry| libc::pollfd {
                fd: entry.io,
                events: flags_to_poll(entry.flags),
                revents: 0,
            })
            .collect();

        let timeout = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        let n_events = match syscall!(poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout,
        )) {
            Ok(n) => n as usize,
            // A signal landed while waiting; report an empty batch.
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        };
        if n_events == 0 {
            return Ok(());
        }

        for (pollfd, entry) in pollfds.iter().zip(entries.iter()) {
            if pollfd.revents != 0 {
                events.push(translate(pollfd.revents, entry.slot));
            }
        }
        Ok(())
    }

    fn apply_staged(&self, entries: &mut Vec<PollEntry>) {
        let mut staged = self.staged.lock().unwrap();
        for change in staged.drain(..) {
            match change {
                Change::Add { io, slot, flags } => {
                    entries.push(PollEntry { io, slot, flags });
                }
                Change::Update { io, flags } => {
                    if let Some(entry) = entries.iter_mut().find(|entry| entry.io == io) {
                        entry.flags = flags;
                    }
                }
                Change::Remove { io } => {
                    if let Some(index) = entries.iter().position(|entry| entry.io == io) {
                        entries.swap_remove(index);
                    }
                }
            }
        }
    }

    pub(crate) fn make_waker(&self) -> io::Result<Waker> {
        let (waker, fd) = Waker::new_fd_based()?;
        self.register(fd, WAKER_SLOT, TransportFlags::READING)?;
        Ok(waker)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLRDHUP;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const READ_EVENTS: libc::c_short = libc::POLLIN;

fn flags_to_poll(flags: TransportFlags) -> libc::c_short {
    let mut kind = 0;
    if flags.is_reading() {
        kind |= READ_EVENTS;
    }
    if flags.is_writing() {
        kind |= libc::POLLOUT;
    }
    kind
}

fn translate(revents: libc::c_short, slot: usize) -> Event {
    let mut event = Event::new(slot);
    event.readable = revents & (libc::POLLIN | libc::POLLPRI) != 0;
    event.writable = revents & libc::POLLOUT != 0;
    event.hangup = revents & libc::POLLHUP != 0;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        event.hangup |= revents & libc::POLLRDHUP != 0;
    }
    if revents & libc::POLLERR != 0 {
        event.error = true;
    }
    // The descriptor was closed behind our back; report it like an error.
    if revents & libc::POLLNVAL != 0 {
        event.error = true;
        event.errno = Some(libc::EBADF);
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_changes_apply_in_order() {
        let selector = Selector::new().unwrap();
        selector.register(7, 0, TransportFlags::READING).unwrap();
        selector
            .reregister(7, 0, TransportFlags::READING, TransportFlags::WRITING)
            .unwrap();
        selector.deregister(7, TransportFlags::WRITING).unwrap();
        selector.register(9, 1, TransportFlags::READING).unwrap();

        let mut entries = selector.entries.lock().unwrap();
        selector.apply_staged(&mut entries);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].io, 9);
        assert_eq!(entries[0].slot, 1);
    }
}
