use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use log::error;

use crate::poller::Poller;
use crate::sys::{self, RawIo};
use crate::{Error, Result, SocketFlags, TransportFlags};

/// A descriptor or socket wrapped for use with a readiness [`Poller`].
///
/// A transport is created from an existing, already-opened resource by
/// [`TransportFactory`], attached to at most one poller during its
/// lifetime, and detached automatically when it is closed, when the peer
/// hangs up, or when the kernel reports an error for it.
///
/// Closing is idempotent. Unless the transport was created with
/// `NO_AUTO_CLOSE`, closing it also closes the underlying resource.
pub struct Transport {
    auto_close: bool,
    state: Mutex<State>,
}

enum State {
    Unattached { io: RawIo },
    Attached(Attachment),
    Detached { io: RawIo },
    Closed,
}

struct Attachment {
    io: RawIo,
    poller: Weak<Poller>,
    slot: usize,
}

impl Transport {
    pub(crate) fn new(io: RawIo, auto_close: bool) -> Arc<Transport> {
        Arc::new(Transport {
            auto_close,
            state: Mutex::new(State::Unattached { io }),
        })
    }

    /// The underlying descriptor or socket, or `None` once closed.
    ///
    /// I/O performed on the raw value must not outlive the transport.
    pub fn raw(&self) -> Option<RawIo> {
        match *self.state.lock().unwrap() {
            State::Unattached { io } | State::Detached { io } => Some(io),
            State::Attached(Attachment { io, .. }) => Some(io),
            State::Closed => None,
        }
    }

    /// Returns true if the transport has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Closed)
    }

    /// Returns true if the transport is currently attached to a poller.
    pub fn is_attached(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Attached(_))
    }

    /// Closes the transport.
    ///
    /// If the transport is attached it is detached from its poller first.
    /// The underlying resource is closed unless the transport was created
    /// with `NO_AUTO_CLOSE`. Closing an already-closed transport does
    /// nothing.
    pub fn close(&self) {
        // Step out of the poller first. The attachment is read and
        // released before `detach` runs so the poller's registration lock
        // is never acquired while this transport's lock is held.
        let attachment = {
            let mut state = self.state.lock().unwrap();
            match *state {
                State::Attached(Attachment { io, ref poller, slot }) => {
                    let poller = poller.clone();
                    *state = State::Detached { io };
                    Some((poller, slot))
                }
                _ => None,
            }
        };
        if let Some((poller, slot)) = attachment {
            if let Some(poller) = poller.upgrade() {
                poller.release_slot(slot, self);
            }
        }

        let io = {
            let mut state = self.state.lock().unwrap();
            match *state {
                State::Unattached { io } | State::Detached { io } => {
                    *state = State::Closed;
                    Some(io)
                }
                // `release_slot` above moved us to `Detached`; anything
                // still `Attached` here was re-keyed concurrently and its
                // owner will observe `Closed` on the next transition.
                State::Attached(_) | State::Closed => None,
            }
        };
        if let Some(io) = io {
            if self.auto_close {
                if let Err(err) = sys::close_io(io) {
                    error!("error closing transport: {}", err);
                }
            }
        }
    }

    /// Moves `Unattached` to `Attached`, enforcing one attach per
    /// lifetime. Returns the raw descriptor for kernel registration.
    pub(crate) fn begin_attach(&self, poller: Weak<Poller>, slot: usize) -> Result<RawIo> {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Unattached { io } => {
                *state = State::Attached(Attachment { io, poller, slot });
                Ok(io)
            }
            State::Attached(_) => Err(Error::logical("transport is already attached")),
            State::Detached { .. } => {
                Err(Error::logical("transport was already attached to a poller"))
            }
            State::Closed => Err(Error::logical("cannot attach a closed transport")),
        }
    }

    /// Undoes `begin_attach` after a failed kernel registration.
    pub(crate) fn abort_attach(&self) {
        let mut state = self.state.lock().unwrap();
        if let State::Attached(Attachment { io, .. }) = *state {
            *state = State::Unattached { io };
        }
    }

    /// Clears the poller back-reference; called by the poller while it
    /// releases the transport's slot.
    pub(crate) fn mark_detached(&self) {
        let mut state = self.state.lock().unwrap();
        if let State::Attached(Attachment { io, .. }) = *state {
            *state = State::Detached { io };
        }
    }

    /// The owning poller and slot, if attached.
    pub(crate) fn attachment(&self) -> Option<(Weak<Poller>, usize)> {
        match *self.state.lock().unwrap() {
            State::Attached(Attachment { ref poller, slot, .. }) => {
                Some((poller.clone(), slot))
            }
            _ => None,
        }
    }

    /// Returns true if the transport was never attached to a poller.
    pub(crate) fn is_unattached(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Unattached { .. })
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        let (name, io): (&str, Option<RawIo>) = match *state {
            State::Unattached { io } => ("unattached", Some(io)),
            State::Attached(Attachment { io, .. }) => ("attached", Some(io)),
            State::Detached { io } => ("detached", Some(io)),
            State::Closed => ("closed", None),
        };
        f.debug_struct("Transport")
            .field("state", &name)
            .field("io", &io)
            .finish()
    }
}

/// Creates [`Transport`]s from existing descriptors and sockets.
///
/// The wrapped resource is put into non-blocking mode; readiness pollers
/// only report when I/O can be attempted, they never perform it.
#[derive(Debug)]
pub struct TransportFactory;

impl TransportFactory {
    /// Wraps an existing file descriptor (pipe, socket, character device).
    ///
    /// Fails with a logical error if `fd` is negative.
    #[cfg(unix)]
    pub fn from_descriptor(fd: RawIo, flags: TransportFlags) -> Result<Arc<Transport>> {
        if fd < 0 {
            return Err(Error::logical("descriptor is not open"));
        }
        sys::set_nonblocking(fd)?;
        Ok(Transport::new(fd, !flags.is_no_auto_close()))
    }

    /// Wraps an existing socket.
    pub fn from_socket(socket: RawIo, flags: SocketFlags) -> Result<Arc<Transport>> {
        #[cfg(unix)]
        if socket < 0 {
            return Err(Error::logical("socket is not open"));
        }
        #[cfg(windows)]
        if socket == sys::INVALID_IO {
            return Err(Error::logical("socket is not open"));
        }
        sys::set_nonblocking(socket)?;
        Ok(Transport::new(socket, !flags.is_no_auto_close()))
    }
}
