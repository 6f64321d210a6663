use std::fmt;
use std::io;
use std::ptr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{trace, warn};

use crate::listener::Listener;
use crate::sys::{self, Event, RawIo, WAKER_SLOT};
use crate::transport::Transport;
use crate::{Error, Result, TransportFlags};

/// A readiness event demultiplexer.
///
/// A poller owns one kernel multiplexing object (an epoll or kqueue
/// descriptor, or nothing for the stateless poll and select backends) and
/// a table of attached [`Transport`]s. [`Poller::poll`] drains one batch
/// of kernel events and invokes the attached [`Listener`]s.
///
/// All operations are thread-safe. At most one thread at a time performs
/// the kernel wait; `attach`, `change_events` and `detach` may run
/// concurrently with it and with each other. Listener callbacks run with
/// the registration lock released, so a callback may freely mutate the
/// poller, including closing the transport it was called for.
///
/// Instances are created through [`PollerFactory`].
pub struct Poller {
    backend: Backend,
    waker: sys::Waker,
    /// Main lock: slot table, free list, per-transport interest flags and
    /// kernel registration calls.
    slots: Mutex<SlotTable>,
    /// Poll lock: serializes `poll` and owns the translated event buffer.
    poll_lock: Mutex<Vec<Event>>,
    weak: Weak<Poller>,
}

struct SlotTable {
    entries: Vec<SlotEntry>,
    free: Vec<usize>,
    /// Incremented at the start of every drain. Slots stamped with the
    /// current value were re-keyed mid-drain and their residual events
    /// must be dropped.
    generation: u64,
}

struct SlotEntry {
    io: RawIo,
    transport: Option<Arc<Transport>>,
    listener: Option<Arc<dyn Listener>>,
    flags: TransportFlags,
    modified: u64,
}

impl SlotEntry {
    fn vacant() -> SlotEntry {
        SlotEntry {
            io: -1 as _,
            transport: None,
            listener: None,
            flags: TransportFlags::NONE,
            modified: 0,
        }
    }
}

enum Backend {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(sys::selector::epoll::Selector),
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    Kqueue(sys::selector::kqueue::Selector),
    #[cfg(unix)]
    Poll(sys::selector::poll::Selector),
    #[cfg(unix)]
    Select(sys::selector::select::Selector),
    #[cfg(windows)]
    SocketPoll(sys::selector::wsapoll::Selector),
    #[cfg(windows)]
    SocketSelect(sys::selector::select::Selector),
}

macro_rules! each_backend {
    ($self: expr, $inner: ident => $body: expr) => {
        match *$self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(ref $inner) => $body,
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(ref $inner) => $body,
            #[cfg(unix)]
            Backend::Poll(ref $inner) => $body,
            #[cfg(unix)]
            Backend::Select(ref $inner) => $body,
            #[cfg(windows)]
            Backend::SocketPoll(ref $inner) => $body,
            #[cfg(windows)]
            Backend::SocketSelect(ref $inner) => $body,
        }
    };
}

impl Backend {
    fn name(&self) -> &'static str {
        match *self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(_) => "epoll",
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(_) => "kqueue",
            #[cfg(unix)]
            Backend::Poll(_) => "poll",
            #[cfg(unix)]
            Backend::Select(_) => "select",
            #[cfg(windows)]
            Backend::SocketPoll(_) => "wsapoll",
            #[cfg(windows)]
            Backend::SocketSelect(_) => "select",
        }
    }

    /// Only the stateful backends can ask the kernel for edge-triggered
    /// delivery.
    fn supports_edge(&self) -> bool {
        match *self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(_) => true,
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(_) => true,
            _ => false,
        }
    }

    fn register(&self, io: RawIo, slot: usize, flags: TransportFlags) -> io::Result<()> {
        each_backend!(self, s => s.register(io, slot, flags))
    }

    fn reregister(
        &self,
        io: RawIo,
        slot: usize,
        old: TransportFlags,
        new: TransportFlags,
    ) -> io::Result<()> {
        each_backend!(self, s => s.reregister(io, slot, old, new))
    }

    fn deregister(&self, io: RawIo, old: TransportFlags) -> io::Result<()> {
        each_backend!(self, s => s.deregister(io, old))
    }

    fn select(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        each_backend!(self, s => s.select(events, timeout))
    }

    fn make_waker(&self) -> io::Result<sys::Waker> {
        each_backend!(self, s => s.make_waker())
    }
}

impl Poller {
    fn from_backend(backend: Backend) -> Result<Arc<Poller>> {
        let waker = backend.make_waker()?;
        Ok(Arc::new_cyclic(|weak| Poller {
            backend,
            waker,
            slots: Mutex::new(SlotTable {
                entries: Vec::new(),
                free: Vec::new(),
                generation: 0,
            }),
            poll_lock: Mutex::new(Vec::new()),
            weak: weak.clone(),
        }))
    }

    /// The name of the kernel facility backing this poller.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Attaches `transport`, monitoring the interests in `flags` and
    /// delivering notifications to `listener`.
    ///
    /// A transport can be attached once during its lifetime; attaching an
    /// already-attached or closed transport fails with a logical error, as
    /// does requesting `EDGE_TRIGGERED` on a backend without kernel
    /// support for it. If the kernel refuses the registration the slot is
    /// released and the platform error is returned.
    pub fn attach(
        &self,
        transport: &Arc<Transport>,
        listener: Arc<dyn Listener>,
        flags: TransportFlags,
    ) -> Result<()> {
        if flags.is_edge_triggered() && !self.backend.supports_edge() {
            return Err(Error::logical(
                "edge-triggered notifications are not supported by this poller",
            ));
        }

        let mut slots = self.slots.lock().unwrap();
        let slot = match slots.free.pop() {
            Some(slot) => slot,
            None => {
                slots.entries.push(SlotEntry::vacant());
                slots.entries.len() - 1
            }
        };

        let io = match transport.begin_attach(self.weak.clone(), slot) {
            Ok(io) => io,
            Err(err) => {
                slots.free.push(slot);
                return Err(err);
            }
        };
        if let Err(err) = self.backend.register(io, slot, flags.events()) {
            transport.abort_attach();
            slots.free.push(slot);
            return Err(err.into());
        }

        let generation = slots.generation;
        let entry = &mut slots.entries[slot];
        entry.io = io;
        entry.transport = Some(Arc::clone(transport));
        entry.listener = Some(listener);
        entry.flags = flags.events();
        entry.modified = generation;
        trace!("{}: attached {:?} in slot {}", self.backend.name(), io, slot);
        Ok(())
    }

    /// Replaces the transport's interest flags.
    ///
    /// Only the minimum set of kernel changes is issued; on failure the
    /// previous subscription is restored and the error returned. Changing
    /// events on a transport that was detached (explicitly or
    /// automatically) is a no-op; a transport that was never attached is a
    /// logical error.
    pub fn change_events(&self, transport: &Transport, flags: TransportFlags) -> Result<()> {
        if flags.is_edge_triggered() && !self.backend.supports_edge() {
            return Err(Error::logical(
                "edge-triggered notifications are not supported by this poller",
            ));
        }
        if transport.is_unattached() {
            return Err(Error::logical("transport is not attached"));
        }
        let (poller, slot) = match transport.attachment() {
            Some(attachment) => attachment,
            // Already detached; nothing left to change.
            None => return Ok(()),
        };
        if !ptr::eq(poller.as_ptr(), self as *const Poller) {
            return Err(Error::logical("transport is attached to a different poller"));
        }

        let new = flags.events();
        let mut slots = self.slots.lock().unwrap();
        let entry = match slots.entries.get_mut(slot) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        if !entry
            .transport
            .as_deref()
            .map_or(false, |t| ptr::eq(t, transport))
        {
            // The slot was re-keyed since we read the attachment.
            return Ok(());
        }
        let old = entry.flags;
        if old == new {
            return Ok(());
        }
        if let Err(err) = self.backend.reregister(entry.io, slot, old, new) {
            // Restore the previous subscription; the backends tolerate
            // removing filters that were never applied.
            if let Err(rollback_err) = self.backend.reregister(entry.io, slot, new, old) {
                warn!(
                    "{}: could not roll back interest change: {}",
                    self.backend.name(),
                    rollback_err
                );
            }
            return Err(err.into());
        }
        entry.flags = new;
        Ok(())
    }

    /// Detaches `transport` from this poller.
    ///
    /// The kernel registration is released and no further callbacks are
    /// delivered, including events already collected by a concurrent
    /// `poll`. Detaching a transport that is not attached here does
    /// nothing.
    pub fn detach(&self, transport: &Transport) {
        if let Some((poller, slot)) = transport.attachment() {
            if ptr::eq(poller.as_ptr(), self as *const Poller) {
                self.release_slot(slot, transport);
            }
        }
    }

    /// Drains one batch of kernel events and dispatches callbacks.
    ///
    /// `None` blocks until an event arrives or [`Poller::interrupt`] is
    /// called; `Some(Duration::ZERO)` never blocks. Returns an error only
    /// when the kernel wait itself fails; conditions on individual
    /// transports are delivered to their listeners.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        let mut events = self.poll_lock.lock().unwrap();
        events.clear();
        self.backend.select(&mut events, timeout)?;
        trace!("{}: drained {} events", self.backend.name(), events.len());

        let mut slots = self.slots.lock().unwrap();
        slots.generation = slots.generation.wrapping_add(1);
        let generation = slots.generation;

        for i in 0..events.len() {
            let ev = events[i];

            if ev.slot == WAKER_SLOT {
                if let Err(err) = self.waker.reset() {
                    trace!("error resetting waker: {}", err);
                }
                continue;
            }

            if ev.hangup || ev.error {
                // Skip events for slots re-keyed in this drain, then
                // auto-detach before the callback runs.
                let valid = slots
                    .entries
                    .get(ev.slot)
                    .map_or(false, |entry| entry.modified != generation);
                let released = if valid {
                    self.release_locked(&mut slots, ev.slot, generation)
                } else {
                    None
                };
                if let Some((transport, listener)) = released {
                    if ev.hangup {
                        drop(slots);
                        listener.on_hangup(&transport);
                    } else {
                        let code = ev
                            .errno
                            .or_else(|| transport.raw().and_then(sys::socket_error))
                            .unwrap_or(0);
                        drop(slots);
                        listener.on_error(&transport, Error::platform(code));
                    }
                    slots = self.slots.lock().unwrap();
                }
                continue;
            }

            if ev.readable {
                if let Some((transport, listener)) =
                    clone_for_dispatch(&slots, ev.slot, generation, TransportFlags::is_reading)
                {
                    drop(slots);
                    listener.on_read_ready(&transport);
                    slots = self.slots.lock().unwrap();
                }
            }
            if ev.writable {
                // Re-validated: the readable callback may have re-keyed
                // the slot or dropped write interest.
                if let Some((transport, listener)) =
                    clone_for_dispatch(&slots, ev.slot, generation, TransportFlags::is_writing)
                {
                    drop(slots);
                    listener.on_write_ready(&transport);
                    slots = self.slots.lock().unwrap();
                }
            }
        }
        Ok(())
    }

    /// Wakes one thread blocked in [`Poller::poll`].
    ///
    /// Wake-ups do not accumulate: interrupting an idle poller wakes the
    /// next `poll` once. Supported by every Unix backend; the
    /// Windows socket pollers return a logical error.
    pub fn interrupt(&self) -> Result<()> {
        self.waker.wake().map_err(Error::from)
    }

    /// Clears a slot, stamps the current generation into it and returns
    /// the evicted transport and listener. Caller holds the main lock.
    fn release_locked(
        &self,
        slots: &mut SlotTable,
        slot: usize,
        generation: u64,
    ) -> Option<(Arc<Transport>, Arc<dyn Listener>)> {
        let (io, flags, transport, listener) = {
            let entry = slots.entries.get_mut(slot)?;
            let transport = entry.transport.take()?;
            let listener = entry.listener.take();
            let io = entry.io;
            let flags = entry.flags;
            entry.flags = TransportFlags::NONE;
            entry.modified = generation;
            (io, flags, transport, listener)
        };
        slots.free.push(slot);
        if let Err(err) = self.backend.deregister(io, flags) {
            // The kernel may already have dropped the registration, e.g.
            // when the descriptor was closed.
            trace!("{}: deregister failed: {}", self.backend.name(), err);
        }
        transport.mark_detached();
        Some((transport, listener?))
    }

    /// Releases `slot` if it is still occupied by `transport`.
    pub(crate) fn release_slot(&self, slot: usize, transport: &Transport) {
        let mut slots = self.slots.lock().unwrap();
        let occupied = slots
            .entries
            .get(slot)
            .and_then(|entry| entry.transport.as_deref())
            .map_or(false, |t| ptr::eq(t, transport));
        if occupied {
            let generation = slots.generation;
            let _ = self.release_locked(&mut slots, slot, generation);
        }
    }
}

/// Clones the slot's transport and listener for a callback, skipping slots
/// re-keyed in this drain and interests dropped since the kernel wait.
fn clone_for_dispatch(
    slots: &SlotTable,
    slot: usize,
    generation: u64,
    wanted: impl Fn(TransportFlags) -> bool,
) -> Option<(Arc<Transport>, Arc<dyn Listener>)> {
    let entry = slots.entries.get(slot)?;
    if entry.modified == generation || !wanted(entry.flags) {
        return None;
    }
    Some((entry.transport.clone()?, entry.listener.clone()?))
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Clear the back-references of every transport that is still
        // attached; their kernel registrations die with the backend.
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for entry in slots.entries.iter_mut() {
            entry.listener = None;
            if let Some(transport) = entry.transport.take() {
                transport.mark_detached();
            }
        }
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// Creates [`Poller`]s, picking the best backend the platform offers.
#[derive(Debug)]
pub struct PollerFactory;

impl PollerFactory {
    /// Creates a poller backed by the best available facility: epoll on
    /// Linux kernels that have it (2.5.44 and later), kqueue on the BSDs
    /// and macOS, poll elsewhere.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn create() -> Result<Arc<Poller>> {
        if sys::unix::is_at_least_kernel(2, 5, 44) {
            Self::create_epoll()
        } else {
            Self::create_poll()
        }
    }

    /// Creates a poller backed by the best available facility.
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    pub fn create() -> Result<Arc<Poller>> {
        Self::create_kqueue()
    }

    /// Creates an epoll-backed poller with a growable event buffer.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn create_epoll() -> Result<Arc<Poller>> {
        let selector = sys::selector::epoll::Selector::new(None)?;
        Poller::from_backend(Backend::Epoll(selector))
    }

    /// Creates an epoll-backed poller collecting at most
    /// `max_events_per_poll` events per drain; the buffer never grows.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn create_epoll_with_capacity(max_events_per_poll: usize) -> Result<Arc<Poller>> {
        let selector = sys::selector::epoll::Selector::new(Some(max_events_per_poll))?;
        Poller::from_backend(Backend::Epoll(selector))
    }

    /// Creates a kqueue-backed poller with a growable event buffer.
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    pub fn create_kqueue() -> Result<Arc<Poller>> {
        let selector = sys::selector::kqueue::Selector::new(None)?;
        Poller::from_backend(Backend::Kqueue(selector))
    }

    /// Creates a kqueue-backed poller collecting at most
    /// `max_events_per_poll` events per drain; the buffer never grows.
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    pub fn create_kqueue_with_capacity(max_events_per_poll: usize) -> Result<Arc<Poller>> {
        let selector = sys::selector::kqueue::Selector::new(Some(max_events_per_poll))?;
        Poller::from_backend(Backend::Kqueue(selector))
    }

    /// Creates a poll-backed poller. Works with any descriptor kind but
    /// does not support edge-triggered notifications.
    #[cfg(unix)]
    pub fn create_poll() -> Result<Arc<Poller>> {
        let selector = sys::selector::poll::Selector::new()?;
        Poller::from_backend(Backend::Poll(selector))
    }

    /// Creates a select-backed poller. Limited to descriptors below
    /// `FD_SETSIZE`; no edge-triggered notifications.
    #[cfg(unix)]
    pub fn create_select() -> Result<Arc<Poller>> {
        let selector = sys::selector::select::Selector::new()?;
        Poller::from_backend(Backend::Select(selector))
    }

    /// Creates a completion poller over an I/O completion port.
    #[cfg(windows)]
    pub fn create() -> Result<Arc<crate::completion::Poller>> {
        crate::completion::Poller::new()
    }

    /// Creates a readiness poller for sockets over `WSAPoll`.
    #[cfg(windows)]
    pub fn create_socket_poll() -> Result<Arc<Poller>> {
        let selector = sys::selector::wsapoll::Selector::new()?;
        Poller::from_backend(Backend::SocketPoll(selector))
    }

    /// Creates a readiness poller for sockets over `select`.
    #[cfg(windows)]
    pub fn create_socket_select() -> Result<Arc<Poller>> {
        let selector = sys::selector::select::Selector::new()?;
        Poller::from_backend(Backend::SocketSelect(selector))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::TransportFactory;

    struct Noop;

    impl Listener for Noop {}

    fn pipe_fds() -> (RawIo, RawIo) {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        assert_ne!(unsafe { libc::pipe(fds.as_mut_ptr()) }, -1);
        (fds[0], fds[1])
    }

    #[test]
    fn slot_round_trip_and_reuse() {
        let poller = PollerFactory::create().unwrap();
        let (read1, write1) = pipe_fds();
        let (read2, write2) = pipe_fds();

        let first = TransportFactory::from_descriptor(read1, TransportFlags::NONE).unwrap();
        poller
            .attach(&first, Arc::new(Noop), TransportFlags::READING)
            .unwrap();
        {
            let slots = poller.slots.lock().unwrap();
            assert_eq!(slots.entries.len(), 1);
            assert!(slots.free.is_empty());
        }

        first.close();
        {
            let slots = poller.slots.lock().unwrap();
            assert_eq!(slots.entries.len(), 1);
            assert_eq!(slots.free, vec![0]);
            assert!(slots.entries[0].transport.is_none());
        }

        // The freed slot is preferred over extending the table.
        let second = TransportFactory::from_descriptor(read2, TransportFlags::NONE).unwrap();
        poller
            .attach(&second, Arc::new(Noop), TransportFlags::READING)
            .unwrap();
        {
            let slots = poller.slots.lock().unwrap();
            assert_eq!(slots.entries.len(), 1);
            assert!(slots.free.is_empty());
        }

        second.close();
        unsafe {
            libc::close(write1);
            libc::close(write2);
        }
    }

    #[test]
    fn attach_twice_is_rejected() {
        let poller = PollerFactory::create().unwrap();
        let (read, write) = pipe_fds();
        let transport = TransportFactory::from_descriptor(read, TransportFlags::NONE).unwrap();
        poller
            .attach(&transport, Arc::new(Noop), TransportFlags::READING)
            .unwrap();
        let err = poller
            .attach(&transport, Arc::new(Noop), TransportFlags::READING)
            .unwrap_err();
        assert!(matches!(err, Error::Logical(_)));

        // Attach after close is rejected as well, and the failed attempts
        // did not leak slots: every entry ends up back on the free list.
        transport.close();
        let err = poller
            .attach(&transport, Arc::new(Noop), TransportFlags::READING)
            .unwrap_err();
        assert!(matches!(err, Error::Logical(_)));
        let slots = poller.slots.lock().unwrap();
        assert_eq!(slots.free.len(), slots.entries.len());
        assert!(slots.entries.iter().all(|entry| entry.transport.is_none()));
        drop(slots);
        unsafe {
            libc::close(write);
        }
    }

    #[test]
    fn edge_triggered_rejected_on_level_only_backend() {
        let poller = PollerFactory::create_poll().unwrap();
        let (read, write) = pipe_fds();
        let transport = TransportFactory::from_descriptor(read, TransportFlags::NONE).unwrap();
        let err = poller
            .attach(
                &transport,
                Arc::new(Noop),
                TransportFlags::READING | TransportFlags::EDGE_TRIGGERED,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Logical(_)));
        transport.close();
        unsafe {
            libc::close(write);
        }
    }
}
