// Not all functions are used by all tests.
#![allow(dead_code)]
#![cfg(unix)]

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use iomux::{Error, Listener, Transport};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

pub fn assert_sync<T: Sync>() {}
pub fn assert_send<T: Send>() {}

pub const SHORT: Duration = Duration::from_millis(100);
pub const LONG: Duration = Duration::from_secs(1);

/// What a listener callback reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Happened {
    ReadReady,
    WriteReady,
    Hangup,
    Error(i32),
}

/// A listener that records every callback it receives.
#[derive(Debug, Default)]
pub struct Recorder {
    happened: Mutex<Vec<Happened>>,
}

impl Recorder {
    pub fn new() -> Arc<Recorder> {
        Arc::new(Recorder::default())
    }

    /// Returns and clears the recorded callbacks.
    pub fn take(&self) -> Vec<Happened> {
        std::mem::take(&mut *self.happened.lock().unwrap())
    }

    pub fn total(&self) -> usize {
        self.happened.lock().unwrap().len()
    }

    fn push(&self, happened: Happened) {
        self.happened.lock().unwrap().push(happened);
    }
}

impl Listener for Recorder {
    fn on_read_ready(&self, _transport: &Arc<Transport>) {
        self.push(Happened::ReadReady);
    }

    fn on_write_ready(&self, _transport: &Arc<Transport>) {
        self.push(Happened::WriteReady);
    }

    fn on_hangup(&self, _transport: &Arc<Transport>) {
        self.push(Happened::Hangup);
    }

    fn on_error(&self, _transport: &Arc<Transport>, error: Error) {
        self.push(Happened::Error(error.raw_os_error().unwrap_or(0)));
    }
}

/// A pipe whose descriptors are closed on drop unless handed off.
pub struct Pipe {
    pub read: RawFd,
    pub write: RawFd,
}

impl Pipe {
    pub fn new() -> Pipe {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        assert_ne!(
            unsafe { libc::pipe(fds.as_mut_ptr()) },
            -1,
            "pipe(2) failed"
        );
        Pipe {
            read: fds[0],
            write: fds[1],
        }
    }

    /// Hands the read end off to a transport; only the write end is
    /// closed on drop.
    pub fn take_read(&mut self) -> RawFd {
        std::mem::replace(&mut self.read, -1)
    }

    pub fn write_all(&self, data: &[u8]) {
        let n = unsafe {
            libc::write(
                self.write,
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )
        };
        assert_eq!(n, data.len() as isize, "short write on test pipe");
    }

    pub fn close_write(&mut self) {
        if self.write != -1 {
            unsafe { libc::close(self.write) };
            self.write = -1;
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        for fd in [self.read, self.write] {
            if fd != -1 {
                unsafe { libc::close(fd) };
            }
        }
    }
}

/// Reads up to `max` bytes from a raw descriptor.
pub fn read_some(fd: RawFd, max: usize) -> Vec<u8> {
    let mut buf = vec![0u8; max];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    assert!(n >= 0, "read failed: {}", std::io::Error::last_os_error());
    buf.truncate(n as usize);
    buf
}
