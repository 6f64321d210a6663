use std::io;
use std::sync::Mutex;
use std::time::Duration;

use windows_sys::Win32::Networking::WinSock::{
    WSAPoll, POLLERR, POLLHUP, POLLNVAL, POLLRDBAND, POLLRDNORM, POLLWRNORM, WSAPOLLFD,
};

use crate::sys::windows::{RawIo, Waker};
use crate::sys::Event;
use crate::TransportFlags;

/// Socket readiness backend over `WSAPoll`.
///
/// Works like the Unix poll backend: the socket table is mirrored into a
/// `WSAPOLLFD` array on every call, with changes staged in between.
/// `WSAPoll` only accepts sockets, so this backend cannot watch pipes or
/// arbitrary handles, and there is no interrupt mechanism.
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
        if entries.is_empty() {
            // WSAPoll rejects an empty array; nothing can become ready
            // anyway.
            return Ok(());
        }

        let mut pollfds: Vec<WSAPOLLFD> = entries
            .iter()
            .map(|entry| WSAPOLLFD {
                fd: entry.io as usize,
                events: flags_to_poll(entry.flags),
                revents: 0,
            })
            .collect();

        let timeout = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as i32
            })
            .unwrap_or(-1);

        let n_events = syscall!(
            SOCKET,
            WSAPoll(pollfds.as_mut_ptr(), pollfds.len() as u32, timeout)
        )? as usize;
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
        Ok(Waker)
    }
}

fn flags_to_poll(flags: TransportFlags) -> i16 {
    let mut kind = 0;
    if flags.is_reading() {
        kind |= POLLRDNORM | POLLRDBAND;
    }
    if flags.is_writing() {
        kind |= POLLWRNORM;
    }
    kind
}

fn translate(revents: i16, slot: usize) -> Event {
    let mut event = Event::new(slot);
    event.readable = revents & (POLLRDNORM | POLLRDBAND) != 0;
    event.writable = revents & POLLWRNORM != 0;
    event.hangup = revents & POLLHUP != 0;
    if revents & (POLLERR | POLLNVAL) != 0 {
        event.error = true;
    }
    event
}
