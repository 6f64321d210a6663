//! Cross-platform event-driven I/O multiplexing.
//!
//! `iomux` is a portable abstraction over the operating system's readiness
//! and completion facilities. A [`Transport`] wraps an existing descriptor
//! or socket, a [`Poller`] demultiplexes kernel events for many transports,
//! and a [`Listener`] receives the resulting callbacks. The caller performs
//! the actual I/O; the poller only reports when it can be performed.
//!
//! # Readiness and completion
//!
//! On POSIX systems the kernel reports *readiness*: "this descriptor can
//! now be read or written". [`PollerFactory::create`] picks the best
//! readiness backend available — epoll on modern Linux kernels, kqueue on
//! the BSDs and macOS, with poll and select as fallbacks.
//!
//! On Windows the native model is *completion*: an operation is submitted
//! together with an [I/O context] and the kernel reports "this operation
//! finished, N bytes". The completion family lives in the [`completion`]
//! module and is backed by an I/O completion port. A socket-only readiness
//! poller (WSAPoll or select) is also available for code that prefers the
//! Unix-like model.
//!
//! [I/O context]: completion::IoContext
//!
//! # Example
//!
//! Waiting for a pipe to become readable:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use iomux::{Listener, PollerFactory, Transport, TransportFactory, TransportFlags};
//!
//! struct Echo;
//!
//! impl Listener for Echo {
//!     fn on_read_ready(&self, transport: &Arc<Transport>) {
//!         // Read from `transport.raw()` until it would block.
//!     }
//! }
//!
//! # fn main() -> iomux::Result<()> {
//! # let fd = 0;
//! let poller = PollerFactory::create()?;
//! let transport = TransportFactory::from_descriptor(fd, TransportFlags::NONE)?;
//! poller.attach(&transport, Arc::new(Echo), TransportFlags::READING)?;
//! poller.poll(Some(Duration::from_secs(1)))?;
//! # Ok(())
//! # }
//! ```
//!
//! # Callbacks and locking
//!
//! All poller operations are thread-safe. Listener callbacks are invoked
//! with the poller's internal registration lock released, so a callback may
//! close its own transport, change interest flags, or attach other
//! transports. At most one thread at a time drains a given poller;
//! [`Poller::interrupt`] wakes a blocked [`Poller::poll`] from another
//! thread.

#![deny(missing_debug_implementations)]

mod error;
mod flags;
mod listener;
mod poller;
mod sys;
mod transport;

pub use crate::error::{Error, Result};
pub use crate::flags::{SocketFlags, TransportFlags};
pub use crate::listener::Listener;
pub use crate::poller::{Poller, PollerFactory};
pub use crate::transport::{Transport, TransportFactory};

#[cfg(windows)]
pub mod completion;
