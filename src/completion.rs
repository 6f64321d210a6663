//! Completion-based I/O multiplexing over I/O completion ports.
//!
//! Windows' native multiplexing model reports *completions*, not
//! readiness: an operation is submitted together with an [`IoContext`]
//! and the kernel later reports how it finished. The types here mirror
//! the readiness family — [`Transport`], [`Poller`], a listener trait —
//! but operations are initiated through the transport itself and results
//! arrive as [`IoResult`]s.
//!
//! # Context ownership
//!
//! Every operation borrows its context for the duration of the kernel's
//! involvement: initiating an operation *links* the context (and its
//! transport) into the poller, and the link is only released when the
//! result surfaces back to the caller — either immediately, through
//! [`IoResult::context`], or through a listener callback during
//! [`Poller::poll`]. A linked context cannot start a second operation and
//! its memory is kept alive even if the caller drops every other
//! reference, so a completion sitting in a kernel queue never dangles.
//!
//! # Immediate delivery
//!
//! By default an operation that completes synchronously *still* posts a
//! completion to the port, and the context stays linked until that
//! notification is drained. [`Poller::enable_immediate_delivery`] puts
//! attached handles into a mode where synchronous completions skip the
//! port; the context is handed back in `IoResult::context` right away.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::os::windows::io::{RawHandle, RawSocket};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use log::trace;

use windows_sys::Win32::Foundation::{
    GetLastError, RtlNtStatusToDosError, ERROR_HANDLE_EOF, ERROR_IO_PENDING, ERROR_MORE_DATA,
    INVALID_HANDLE_VALUE, STATUS_SUCCESS,
};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::IO::{OVERLAPPED, OVERLAPPED_ENTRY};

use crate::sys::windows::cp::CompletionPort;
use crate::{Error, Result, TransportFlags};

/// Per-operation state for the completion family.
///
/// A context wraps the kernel's `OVERLAPPED` header plus one word of user
/// data. At most one operation may be in flight per context; it becomes
/// reusable when it surfaces back in an [`IoResult`].
pub struct IoContext {
    overlapped: UnsafeCell<OVERLAPPED>,
    user_data: AtomicUsize,
}

// SAFETY: the overlapped header is only written by the kernel while the
// context is linked, and the link table serializes hand-off.
unsafe impl Send for IoContext {}
unsafe impl Sync for IoContext {}

impl IoContext {
    /// Allocates a context carrying `user_data`.
    pub fn new(user_data: usize) -> Arc<IoContext> {
        Arc::new(IoContext {
            overlapped: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            user_data: AtomicUsize::new(user_data),
        })
    }

    /// Returns the user data word.
    ///
    /// Must not be called while the context is in flight.
    pub fn user_data(&self) -> usize {
        self.user_data.load(Ordering::Relaxed)
    }

    /// Replaces the user data word, returning the previous value.
    ///
    /// Must not be called while the context is in flight.
    pub fn set_user_data(&self, user_data: usize) -> usize {
        self.user_data.swap(user_data, Ordering::Relaxed)
    }

    fn overlapped_ptr(&self) -> *mut OVERLAPPED {
        self.overlapped.get()
    }
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("user_data", &self.user_data())
            .finish()
    }
}

/// The outcome of a read or write operation.
#[derive(Debug)]
pub struct IoResult {
    /// Set if the operation failed.
    pub error: Option<Error>,
    /// The peer performed an orderly shutdown (or end-of-file was
    /// reached). The transport's pending completions are discarded.
    pub ended: bool,
    /// The buffer was too small for a message-based read; the remainder
    /// can still be read.
    pub more_data: bool,
    /// The buffer was too small and the remainder was lost.
    pub truncated: bool,
    /// The operation finished synchronously; `bytes` is valid and the
    /// buffer may be reused. When false the operation is still pending.
    pub completed: bool,
    /// Number of bytes transferred.
    pub bytes: usize,
    /// The context used to start the operation, present exactly when no
    /// event for it will be delivered through the poller.
    pub context: Option<Arc<IoContext>>,
}

impl IoResult {
    fn new() -> IoResult {
        IoResult {
            error: None,
            ended: false,
            more_data: false,
            truncated: false,
            completed: false,
            bytes: 0,
            context: None,
        }
    }

    fn failed(error: Error, context: Arc<IoContext>) -> IoResult {
        let mut result = IoResult::new();
        result.error = Some(error);
        result.context = Some(context);
        result
    }

    /// Returns true if the operation neither failed nor is still pending.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Receives completion notifications for an attached [`Transport`].
pub trait IoListener: Send + Sync {
    /// A read operation completed.
    fn on_read(&self, _transport: &Arc<Transport>, _result: IoResult) {}

    /// A write operation completed.
    fn on_write(&self, _transport: &Arc<Transport>, _result: IoResult) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Read,
    Write,
}

struct Attachment {
    poller: Weak<Poller>,
    listener: Arc<dyn IoListener>,
}

/// A handle or socket wrapped for completion-based I/O.
///
/// All posted operations are resolved in the order they are posted, but
/// notification of completed operations is not guaranteed to arrive
/// in order; the application is responsible for sequencing. Once
/// attached, all I/O on the underlying handle must go through this API;
/// overlapped operations initiated elsewhere would complete through the
/// poller with contexts it does not know.
pub struct Transport {
    handle: AtomicIsize,
    auto_close: bool,
    immediate: AtomicBool,
    attachment: OnceLock<Attachment>,
    weak: Weak<Transport>,
}

impl Transport {
    fn new(handle: RawHandle, flags: TransportFlags) -> Arc<Transport> {
        Arc::new_cyclic(|weak| Transport {
            handle: AtomicIsize::new(handle as isize),
            auto_close: !flags.is_no_auto_close(),
            immediate: AtomicBool::new(false),
            attachment: OnceLock::new(),
            weak: weak.clone(),
        })
    }

    /// The underlying handle, or `INVALID_HANDLE_VALUE` once closed.
    pub fn handle(&self) -> RawHandle {
        self.handle.load(Ordering::Acquire) as RawHandle
    }

    /// Returns true if the transport has been closed.
    pub fn closed(&self) -> bool {
        self.handle() == INVALID_HANDLE_VALUE
    }

    /// Closes the transport.
    ///
    /// Pending operations are *not* cancelled: their completions may
    /// still be posted, and the poller discards them. Unless created with
    /// `NO_AUTO_CLOSE` the underlying handle is closed.
    pub fn close(&self) {
        let handle = self
            .handle
            .swap(INVALID_HANDLE_VALUE as isize, Ordering::AcqRel) as RawHandle;
        if handle != INVALID_HANDLE_VALUE && self.auto_close {
            let closed = unsafe {
                windows_sys::Win32::Foundation::CloseHandle(handle)
            };
            if closed == 0 {
                trace!("error closing transport handle: {}", io::Error::last_os_error());
            }
        }
    }

    /// Puts this transport's handle into immediate-delivery mode.
    ///
    /// After this succeeds, operations that complete synchronously hand
    /// their context back in [`IoResult::context`] instead of posting a
    /// completion.
    pub fn enable_immediate_delivery(&self) -> Result<()> {
        let poller = self.poller().ok_or_else(|| {
            Error::logical("transport is not attached to a completion poller")
        })?;
        poller.port.skip_on_success(self.handle())?;
        self.immediate.store(true, Ordering::Release);
        Ok(())
    }

    /// Returns true if immediate delivery is active for this handle.
    pub fn immediate_delivery(&self) -> bool {
        self.immediate.load(Ordering::Acquire)
    }

    /// Initiates a read into `buffer`.
    ///
    /// If the result's `completed` flag is false the operation is
    /// pending: the context must not be reused and `buffer` must stay
    /// valid and untouched until the context surfaces back through the
    /// listener. On failure the error and the context are both in the
    /// returned result.
    ///
    /// # Safety
    ///
    /// `buffer` must point to `length` writable bytes that outlive the
    /// operation, not just this call.
    pub unsafe fn read(
        &self,
        context: &Arc<IoContext>,
        buffer: *mut u8,
        length: usize,
    ) -> IoResult {
        self.start_io(context, OpKind::Read, buffer as *mut _, length)
    }

    /// Initiates a write from `buffer`. See [`Transport::read`] for the
    /// pending-operation contract.
    ///
    /// # Safety
    ///
    /// `buffer` must point to `length` readable bytes that outlive the
    /// operation, not just this call.
    pub unsafe fn write(
        &self,
        context: &Arc<IoContext>,
        buffer: *const u8,
        length: usize,
    ) -> IoResult {
        self.start_io(context, OpKind::Write, buffer as *mut _, length)
    }

    /// Like [`Transport::read`] with a freshly allocated context carrying
    /// `user_data`.
    ///
    /// # Safety
    ///
    /// See [`Transport::read`].
    pub unsafe fn read_with_data(
        &self,
        buffer: *mut u8,
        length: usize,
        user_data: usize,
    ) -> IoResult {
        let context = IoContext::new(user_data);
        self.read(&context, buffer, length)
    }

    /// Like [`Transport::write`] with a freshly allocated context
    /// carrying `user_data`.
    ///
    /// # Safety
    ///
    /// See [`Transport::write`].
    pub unsafe fn write_with_data(
        &self,
        buffer: *const u8,
        length: usize,
        user_data: usize,
    ) -> IoResult {
        let context = IoContext::new(user_data);
        self.write(&context, buffer, length)
    }

    fn poller(&self) -> Option<Arc<Poller>> {
        self.attachment.get().and_then(|a| a.poller.upgrade())
    }

    fn listener(&self) -> Option<Arc<dyn IoListener>> {
        self.attachment.get().map(|a| a.listener.clone())
    }

    unsafe fn start_io(
        &self,
        context: &Arc<IoContext>,
        kind: OpKind,
        buffer: *mut std::ffi::c_void,
        length: usize,
    ) -> IoResult {
        let poller = match self.poller() {
            Some(poller) => poller,
            None => {
                return IoResult::failed(
                    Error::logical("transport is not attached to a completion poller"),
                    context.clone(),
                )
            }
        };
        if self.closed() {
            return IoResult::failed(Error::logical("transport is closed"), context.clone());
        }

        // The context has to be linked before the syscall. A fast
        // completion could otherwise be dequeued on another thread and
        // the context destroyed before this path finishes with it.
        let this = match self.weak.upgrade() {
            Some(this) => this,
            None => {
                return IoResult::failed(
                    Error::logical("transport is being destroyed"),
                    context.clone(),
                )
            }
        };
        if let Err(err) = poller.link(this, context, kind) {
            return IoResult::failed(err, context.clone());
        }

        let mut bytes: u32 = 0;
        let ok = match kind {
            OpKind::Read => ReadFile(
                self.handle(),
                buffer.cast(),
                length as u32,
                &mut bytes,
                context.overlapped_ptr(),
            ),
            OpKind::Write => WriteFile(
                self.handle(),
                buffer.cast(),
                length as u32,
                &mut bytes,
                context.overlapped_ptr(),
            ),
        };
        let error = if ok != 0 { 0 } else { GetLastError() };

        let immediate_errors = match kind {
            // The docs are vague on whether MORE_DATA and HANDLE_EOF
            // enqueue a completion; they behave like synchronous results.
            OpKind::Read => [ERROR_IO_PENDING, ERROR_MORE_DATA, ERROR_HANDLE_EOF],
            OpKind::Write => [ERROR_IO_PENDING, 0, 0],
        };
        if ok == 0 && !immediate_errors.contains(&error) {
            // Nothing was queued; take the link back and fail.
            poller.unlink(context);
            return IoResult::failed(Error::platform(error as i32), context.clone());
        }

        let mut result = IoResult::new();
        if error == ERROR_IO_PENDING {
            // The context stays linked until the completion arrives.
            return result;
        }

        result.completed = true;
        result.bytes = bytes as usize;
        match error {
            ERROR_HANDLE_EOF => result.ended = true,
            ERROR_MORE_DATA => result.more_data = true,
            _ => {}
        }
        if kind == OpKind::Read && length > 0 && bytes == 0 {
            // A zero-byte read is the peer's orderly shutdown.
            result.ended = true;
        }

        if self.immediate_delivery() {
            // No event will be posted to the port; steal the link back.
            poller.unlink(context);
            result.context = Some(context.clone());
        }
        result
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("closed", &self.closed())
            .field("immediate_delivery", &self.immediate_delivery())
            .finish()
    }
}

/// Creates completion [`Transport`]s from existing handles and sockets.
#[derive(Debug)]
pub struct TransportFactory;

impl TransportFactory {
    /// Wraps an existing handle. It must be compatible with
    /// `ReadFile`/`WriteFile` and I/O completion ports (opened with
    /// `FILE_FLAG_OVERLAPPED`).
    pub fn from_file(handle: RawHandle, flags: TransportFlags) -> Result<Arc<Transport>> {
        if handle == INVALID_HANDLE_VALUE || handle.is_null() {
            return Err(Error::logical("handle is not open"));
        }
        if flags.is_immediate_delivery() {
            // The mode is negotiated with the poller's port at attach
            // time, not at creation.
            return Err(Error::logical(
                "immediate delivery cannot be requested for existing handles",
            ));
        }
        Ok(Transport::new(handle, flags))
    }

    /// Wraps an existing socket.
    pub fn from_socket(socket: RawSocket, flags: TransportFlags) -> Result<Arc<Transport>> {
        Self::from_file(socket as RawHandle, flags)
    }
}

struct InFlight {
    context: Arc<IoContext>,
    transport: Arc<Transport>,
    kind: OpKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryMode {
    Disabled,
    Enabled,
    Required,
}

/// A completion poller backed by an I/O completion port.
///
/// Unlike the readiness family, transports cannot be detached: once
/// attached, all I/O on the handle is associated with this port until the
/// transport is closed. Dropping a poller does not free contexts whose
/// completions are still queued in the kernel; call
/// [`Poller::wait_and_discard_pending_events`] first.
pub struct Poller {
    port: CompletionPort,
    /// In-flight operations keyed by the address of their overlapped
    /// header. Holds the strong references that keep context and
    /// transport alive while the kernel owns them.
    links: Mutex<HashMap<usize, InFlight>>,
    delivery: Mutex<DeliveryMode>,
    weak: Weak<Poller>,
}

/// Batch size for one dequeue.
const ENTRIES_PER_WAIT: usize = 64;

impl Poller {
    /// Creates a poller whose port allows the default level of
    /// concurrency (one running thread per processor).
    pub fn new() -> Result<Arc<Poller>> {
        Self::with_concurrency(0)
    }

    /// Creates a poller allowing at most `concurrent_threads` threads to
    /// run completions concurrently.
    pub fn with_concurrency(concurrent_threads: u32) -> Result<Arc<Poller>> {
        let port = CompletionPort::new(concurrent_threads)?;
        Ok(Arc::new_cyclic(|weak| Poller {
            port,
            links: Mutex::new(HashMap::new()),
            delivery: Mutex::new(DeliveryMode::Disabled),
            weak: weak.clone(),
        }))
    }

    /// Attaches `transport`, associating its handle with the completion
    /// port and delivering completions to `listener`.
    ///
    /// A transport attaches once; a second attach fails. If
    /// [`Poller::require_immediate_delivery`] is active and the handle
    /// cannot enter immediate-delivery mode, the attach fails.
    pub fn attach(&self, transport: &Arc<Transport>, listener: Arc<dyn IoListener>) -> Result<()> {
        if transport.closed() {
            return Err(Error::logical("cannot attach a closed transport"));
        }
        let attachment = Attachment {
            poller: self.weak.clone(),
            listener,
        };
        if transport.attachment.set(attachment).is_err() {
            return Err(Error::logical("transport is already attached"));
        }
        self.port.associate(transport.handle(), 0)?;

        let mode = *self.delivery.lock().unwrap();
        match mode {
            DeliveryMode::Disabled => {}
            DeliveryMode::Enabled => {
                if self.port.skip_on_success(transport.handle()).is_ok() {
                    transport.immediate.store(true, Ordering::Release);
                }
            }
            DeliveryMode::Required => {
                self.port.skip_on_success(transport.handle())?;
                transport.immediate.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Dequeues one batch of completions and dispatches listener
    /// callbacks. Completions for closed transports are discarded.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        let mut entries = entry_buffer();
        let n_entries = self.port.wait(&mut entries, timeout)?;
        trace!("iocp: dequeued {} completions", n_entries);

        for entry in entries[..n_entries].iter() {
            // SAFETY: the port initialized the first `n_entries` entries.
            let entry = unsafe { entry.assume_init_ref() };
            if entry.lpOverlapped.is_null() {
                // A wake-up posted by `interrupt`.
                continue;
            }
            let record = match self.take_link(entry.lpOverlapped as usize) {
                Some(record) => record,
                // Not ours (or already failed over); nothing to deliver.
                None => continue,
            };
            if record.transport.closed() {
                // Dropping the record releases the context and transport.
                continue;
            }

            let mut result = IoResult::new();
            result.completed = true;
            result.bytes = entry.dwNumberOfBytesTransferred as usize;
            // The overlapped header holds the operation's NTSTATUS.
            let status = unsafe { (*entry.lpOverlapped).Internal } as i32;
            if status != STATUS_SUCCESS {
                let code = unsafe { RtlNtStatusToDosError(status) };
                match code {
                    ERROR_HANDLE_EOF => result.ended = true,
                    ERROR_MORE_DATA => result.more_data = true,
                    _ => result.error = Some(Error::platform(code as i32)),
                }
            }
            if record.kind == OpKind::Read
                && result.bytes == 0
                && result.error.is_none()
                && !result.more_data
            {
                result.ended = true;
            }
            result.context = Some(record.context.clone());

            if let Some(listener) = record.transport.listener() {
                match record.kind {
                    OpKind::Read => listener.on_read(&record.transport, result),
                    OpKind::Write => listener.on_write(&record.transport, result),
                }
            }
        }
        Ok(())
    }

    /// Blocks until every linked context has surfaced, discarding the
    /// completions. Call before dropping the poller to avoid leaking
    /// contexts whose completions still sit in kernel queues. All other
    /// polling threads must have stopped.
    pub fn wait_and_discard_pending_events(&self) {
        let mut entries = entry_buffer();
        loop {
            if self.links.lock().unwrap().is_empty() {
                return;
            }
            let n_entries = match self.port.wait(&mut entries, None) {
                Ok(n) => n,
                Err(_) => return,
            };
            for entry in entries[..n_entries].iter() {
                // SAFETY: the port initialized the first `n_entries`.
                let entry = unsafe { entry.assume_init_ref() };
                if !entry.lpOverlapped.is_null() {
                    drop(self.take_link(entry.lpOverlapped as usize));
                }
            }
        }
    }

    /// Asks that synchronous completions skip the port for transports
    /// attached from now on. Returns false if the platform cannot do
    /// this; already-attached transports are unaffected.
    pub fn enable_immediate_delivery(&self) -> bool {
        *self.delivery.lock().unwrap() = DeliveryMode::Enabled;
        true
    }

    /// Like [`Poller::enable_immediate_delivery`], but subsequent
    /// attaches fail outright when the mode cannot be enabled for their
    /// handle, so callers never need the deferred-notification path.
    pub fn require_immediate_delivery(&self) -> bool {
        *self.delivery.lock().unwrap() = DeliveryMode::Required;
        true
    }

    /// Wakes one thread blocked in [`Poller::poll`].
    pub fn interrupt(&self) -> Result<()> {
        self.port.post_wakeup().map_err(Error::from)
    }

    /// Number of operations currently owned by kernel queues.
    pub fn pending_operations(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    fn link(&self, transport: Arc<Transport>, context: &Arc<IoContext>, kind: OpKind) -> Result<()> {
        let key = context.overlapped_ptr() as usize;
        let mut links = self.links.lock().unwrap();
        if links.contains_key(&key) {
            return Err(Error::logical("context already has an operation in flight"));
        }
        links.insert(
            key,
            InFlight {
                context: context.clone(),
                transport,
                kind,
            },
        );
        Ok(())
    }

    fn unlink(&self, context: &IoContext) {
        let key = context.overlapped.get() as usize;
        drop(self.links.lock().unwrap().remove(&key));
    }

    fn take_link(&self, key: usize) -> Option<InFlight> {
        self.links.lock().unwrap().remove(&key)
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("backend", &"iocp")
            .field("pending_operations", &self.pending_operations())
            .finish()
    }
}

fn entry_buffer() -> [MaybeUninit<OVERLAPPED_ENTRY>; ENTRIES_PER_WAIT] {
    // SAFETY: an array of MaybeUninit does not require initialization.
    unsafe { MaybeUninit::uninit().assume_init() }
}
