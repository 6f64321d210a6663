use std::io;
use std::mem::MaybeUninit;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::time::Duration;

use windows_sys::Win32::Foundation::{ERROR_ABANDONED_WAIT_0, WAIT_TIMEOUT};
use windows_sys::Win32::Storage::FileSystem::SetFileCompletionNotificationModes;
use windows_sys::Win32::System::Threading::INFINITE;
use windows_sys::Win32::System::WindowsProgramming::{
    FILE_SKIP_COMPLETION_PORT_ON_SUCCESS, FILE_SKIP_SET_EVENT_ON_HANDLE,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, PostQueuedCompletionStatus,
    OVERLAPPED_ENTRY,
};

/// Thin owner of an I/O completion port handle.
#[derive(Debug)]
pub(crate) struct CompletionPort {
    handle: OwnedHandle,
}

impl CompletionPort {
    pub(crate) fn new(concurrent_threads: u32) -> io::Result<CompletionPort> {
        let handle = syscall!(
            PTR,
            CreateIoCompletionPort(
                windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE,
                std::ptr::null_mut(),
                0,
                concurrent_threads,
            )
        )?;
        // SAFETY: `CreateIoCompletionPort` returned a valid handle.
        let handle = unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) };
        Ok(CompletionPort { handle })
    }

    /// Associates `handle` with the port. All subsequent overlapped I/O on
    /// it completes through this port.
    pub(crate) fn associate(&self, handle: RawHandle, key: usize) -> io::Result<()> {
        syscall!(
            PTR,
            CreateIoCompletionPort(handle, self.handle.as_raw_handle(), key, 0)
        )
        .map(|_| ())
    }

    /// Puts `handle` into immediate-delivery mode: operations that
    /// complete synchronously do not post a completion.
    pub(crate) fn skip_on_success(&self, handle: RawHandle) -> io::Result<()> {
        syscall!(
            BOOL,
            SetFileCompletionNotificationModes(
                handle,
                (FILE_SKIP_COMPLETION_PORT_ON_SUCCESS | FILE_SKIP_SET_EVENT_ON_HANDLE) as u8,
            )
        )
        .map(|_| ())
    }

    /// Posts a wake-up with a null overlapped pointer.
    pub(crate) fn post_wakeup(&self) -> io::Result<()> {
        syscall!(
            BOOL,
            PostQueuedCompletionStatus(
                self.handle.as_raw_handle(),
                0,
                0,
                std::ptr::null_mut()
            )
        )
        .map(|_| ())
    }

    /// Dequeues up to `entries.len()` completions in one batch. A timeout
    /// yields `Ok(0)`; `None` waits forever.
    pub(crate) fn wait(
        &self,
        entries: &mut [MaybeUninit<OVERLAPPED_ENTRY>],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| {
                // Round up so sub-millisecond waits do not spin, unless a
                // zero timeout was requested explicitly.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis()
                    .min(u128::from(INFINITE - 1)) as u32
            })
            .unwrap_or(INFINITE);

        let mut removed: u32 = 0;
        let result = syscall!(
            BOOL,
            GetQueuedCompletionStatusEx(
                self.handle.as_raw_handle(),
                entries.as_mut_ptr().cast(),
                entries.len() as u32,
                &mut removed,
                timeout,
                0,
            )
        );
        match result {
            Ok(_) => Ok(removed as usize),
            Err(ref err) if err.raw_os_error() == Some(WAIT_TIMEOUT as i32) => Ok(0),
            Err(ref err) if err.raw_os_error() == Some(ERROR_ABANDONED_WAIT_0 as i32) => Ok(0),
            Err(err) => Err(err),
        }
    }
}
