use std::io;
use std::sync::Mutex;
use std::time::Duration;

use windows_sys::Win32::Networking::WinSock::{select, FD_SET, FD_SETSIZE, TIMEVAL};

use crate::sys::windows::{RawIo, Waker};
use crate::sys::Event;
use crate::TransportFlags;

/// Socket readiness backend over winsock `select`.
///
/// Winsock's `fd_set` is a counted array of `FD_SETSIZE` (64) sockets, not
/// a bitmap; registering more sockets than fit fails up front. Like the
/// other stateless backends, changes are staged and applied at the top of
/// every call. Hangup is not observable: a peer shutdown surfaces as
/// readability with a zero-byte read.
#[derive(Debug)]
pub(crate) struct Selector {
    entries: Mutex<Vec<SelectEntry>>,
    staged: Mutex<Vec<Change>>,
}

#[derive(Debug, Clone, Copy)]
struct SelectEntry {
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
        let entries_len = self.entries.lock().unwrap().len();
        let mut staged = self.staged.lock().unwrap();
        let pending_adds = staged
            .iter()
            .filter(|change| matches!(change, Change::Add { .. }))
            .count();
        // Conservative: staged removals are not credited back.
        if entries_len + pending_adds >= FD_SETSIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket does not fit in an fd_set",
            ));
        }
        staged.push(Change::Add { io, slot, flags });
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
            return Ok(());
        }

        let mut read_set = empty_fd_set();
        let mut write_set = empty_fd_set();
        for entry in entries.iter() {
            if entry.flags.is_reading() {
                fd_set_insert(&mut read_set, entry.io);
            }
            if entry.flags.is_writing() {
                fd_set_insert(&mut write_set, entry.io);
            }
        }

        let timeval = timeout.map(|to| TIMEVAL {
            tv_sec: to.as_secs() as i32,
            tv_usec: to.subsec_micros() as i32,
        });
        let timeval_ptr = timeval
            .as_ref()
            .map(|tv| tv as *const TIMEVAL)
            .unwrap_or(std::ptr::null());

        let n_events = syscall!(
            SOCKET,
            select(
                0, // nfds is ignored by winsock
                &mut read_set,
                &mut write_set,
                std::ptr::null_mut(),
                timeval_ptr,
            )
        )? as usize;
        if n_events == 0 {
            return Ok(());
        }

        for entry in entries.iter() {
            let readable = fd_set_contains(&read_set, entry.io);
            let writable = fd_set_contains(&write_set, entry.io);
            if readable || writable {
                let mut event = Event::new(entry.slot);
                event.readable = readable;
                event.writable = writable;
                events.push(event);
            }
        }
        Ok(())
    }

    fn apply_staged(&self, entries: &mut Vec<SelectEntry>) {
        let mut staged = self.staged.lock().unwrap();
        for change in staged.drain(..) {
            match change {
                Change::Add { io, slot, flags } => {
                    entries.push(SelectEntry { io, slot, flags });
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

fn empty_fd_set() -> FD_SET {
    FD_SET {
        fd_count: 0,
        fd_array: [0; FD_SETSIZE as usize],
    }
}

fn fd_set_insert(set: &mut FD_SET, io: RawIo) {
    if (set.fd_count as usize) < set.fd_array.len() {
        set.fd_array[set.fd_count as usize] = io as usize;
        set.fd_count += 1;
    }
}

fn fd_set_contains(set: &FD_SET, io: RawIo) -> bool {
    set.fd_array[..set.fd_count as usize]
        .iter()
        .any(|fd| *fd == io as usize)
}
