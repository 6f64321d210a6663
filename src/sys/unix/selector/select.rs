use std::io;
use std::mem::MaybeUninit;
use std::sync::Mutex;
use std::time::Duration;

use crate::sys::unix::waker::Waker;
use crate::sys::unix::RawIo;
use crate::sys::{Event, WAKER_SLOT};
use crate::TransportFlags;

/// Readiness backend over `select(2)`.
///
/// Like the poll backend the descriptor table is stateless in the kernel
/// and rebuilt on every call, with changes staged in between. `select`
/// cannot watch descriptors at or above `FD_SETSIZE`; registering one
/// fails up front.
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
        if io as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "descriptor does not fit in an fd_set",
            ));
        }
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

        let mut read_set = empty_fd_set();
        let mut write_set = empty_fd_set();
        let mut max_fd: RawIo = -1;
        for entry in entries.iter() {
            if entry.flags.is_reading() {
                unsafe { libc::FD_SET(entry.io, &mut read_set) };
                max_fd = max_fd.max(entry.io);
            }
            if entry.flags.is_writing() {
                unsafe { libc::FD_SET(entry.io, &mut write_set) };
                max_fd = max_fd.max(entry.io);
            }
        }

        let mut timeval = timeout.map(|to| {
            let to = to
                .checked_add(Duration::from_nanos(999))
                .unwrap_or(to);
            libc::timeval {
                tv_sec: to.as_secs() as libc::time_t,
                tv_usec: to.subsec_micros() as libc::suseconds_t,
            }
        });
        let timeval_ptr = timeval
            .as_mut()
            .map(|tv| tv as *mut _)
            .unwrap_or(std::ptr::null_mut());

        let n_events = match syscall!(select(
            max_fd + 1,
            &mut read_set,
            &mut write_set,
            std::ptr::null_mut(),
            timeval_ptr,
        )) {
            Ok(n) => n as usize,
            // A signal landed while waiting; report an empty batch.
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        };
        if n_events == 0 {
            return Ok(());
        }

        for entry in entries.iter() {
            let readable = unsafe { libc::FD_ISSET(entry.io, &read_set) };
            let writable = unsafe { libc::FD_ISSET(entry.io, &write_set) };
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
        let (waker, fd) = Waker::new_fd_based()?;
        self.register(fd, WAKER_SLOT, TransportFlags::READING)?;
        Ok(waker)
    }
}

fn empty_fd_set() -> libc::fd_set {
    let mut set = MaybeUninit::<libc::fd_set>::uninit();
    unsafe {
        libc::FD_ZERO(set.as_mut_ptr());
        set.assume_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_descriptors_beyond_fd_setsize() {
        let selector = Selector::new().unwrap();
        let err = selector
            .register(libc::FD_SETSIZE as RawIo, 0, TransportFlags::READING)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        // One below the limit is staged without complaint.
        selector
            .register(libc::FD_SETSIZE as RawIo - 1, 0, TransportFlags::READING)
            .unwrap();
    }
}
