use std::sync::Arc;

use crate::{Error, Transport};

/// Receives readiness notifications for an attached [`Transport`].
///
/// Callbacks are invoked from inside [`Poller::poll`] with the poller's
/// registration lock released, so an implementation may close the
/// transport, change its interest flags, or attach and detach other
/// transports. Callbacks for a single `poll` call run sequentially, in the
/// order the kernel reported the events.
///
/// Hangup and error notifications detach the transport automatically
/// before the callback runs; no further events are delivered for it.
///
/// [`Poller::poll`]: crate::Poller::poll
pub trait Listener: Send + Sync {
    /// The transport can be read without blocking.
    fn on_read_ready(&self, _transport: &Arc<Transport>) {}

    /// The transport can be written without blocking.
    fn on_write_ready(&self, _transport: &Arc<Transport>) {}

    /// The peer performed an orderly shutdown. The transport has already
    /// been detached.
    fn on_hangup(&self, _transport: &Arc<Transport>) {}

    /// An error condition was reported for the transport. The transport
    /// has already been detached.
    fn on_error(&self, _transport: &Arc<Transport>, _error: Error) {}
}
