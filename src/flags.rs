use std::{fmt, ops};

/// Interest and behavior flags for a [`Transport`].
///
/// `READING`, `WRITING` and `EDGE_TRIGGERED` describe what the poller should
/// monitor and how notifications are delivered; they may be changed after
/// attaching with [`Poller::change_events`]. `NO_AUTO_CLOSE` and
/// `IMMEDIATE_DELIVERY` affect the transport itself and are fixed at
/// creation (the latter is only meaningful for the completion family).
///
/// Unlike a readiness interest set, the empty set is a valid value: passing
/// `TransportFlags::NONE` to [`Poller::change_events`] stops all
/// notifications without detaching.
///
/// [`Transport`]: crate::Transport
/// [`Poller::change_events`]: crate::Poller::change_events
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TransportFlags(u8);

// These must be unique.
const READING: u8 = 0b0_0001;
const WRITING: u8 = 0b0_0010;
const EDGE_TRIGGERED: u8 = 0b0_0100;
const NO_AUTO_CLOSE: u8 = 0b0_1000;
const IMMEDIATE_DELIVERY: u8 = 0b1_0000;

const EVENT_MASK: u8 = READING | WRITING | EDGE_TRIGGERED;

impl TransportFlags {
    /// The empty flag set.
    pub const NONE: TransportFlags = TransportFlags(0);

    /// Monitor the transport for readability.
    pub const READING: TransportFlags = TransportFlags(READING);

    /// Monitor the transport for writability.
    pub const WRITING: TransportFlags = TransportFlags(WRITING);

    /// Deliver one notification per readiness transition instead of
    /// continuous notifications while the condition holds. The listener is
    /// responsible for draining the transport until it would block.
    ///
    /// Only the epoll and kqueue backends support this flag.
    pub const EDGE_TRIGGERED: TransportFlags = TransportFlags(EDGE_TRIGGERED);

    /// Do not close the underlying descriptor or handle when the transport
    /// is closed.
    pub const NO_AUTO_CLOSE: TransportFlags = TransportFlags(NO_AUTO_CLOSE);

    /// Suppress the completion-port notification when an operation
    /// completes synchronously (completion family only).
    pub const IMMEDIATE_DELIVERY: TransportFlags = TransportFlags(IMMEDIATE_DELIVERY);

    /// Add together two flag sets.
    ///
    /// This does the same thing as the `BitOr` implementation, but is a
    /// constant function.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: TransportFlags) -> TransportFlags {
        TransportFlags(self.0 | other.0)
    }

    /// Remove `other` from `self`.
    pub const fn remove(self, other: TransportFlags) -> TransportFlags {
        TransportFlags(self.0 & !other.0)
    }

    /// Only the interest bits (`READING`, `WRITING`, `EDGE_TRIGGERED`).
    pub(crate) const fn events(self) -> TransportFlags {
        TransportFlags(self.0 & EVENT_MASK)
    }

    /// Returns true if the set is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the set includes read interest.
    pub const fn is_reading(self) -> bool {
        (self.0 & READING) != 0
    }

    /// Returns true if the set includes write interest.
    pub const fn is_writing(self) -> bool {
        (self.0 & WRITING) != 0
    }

    /// Returns true if notifications are edge-triggered.
    pub const fn is_edge_triggered(self) -> bool {
        (self.0 & EDGE_TRIGGERED) != 0
    }

    /// Returns true if the underlying resource is not closed with the
    /// transport.
    pub const fn is_no_auto_close(self) -> bool {
        (self.0 & NO_AUTO_CLOSE) != 0
    }

    /// Returns true if synchronous completions skip the completion port.
    pub const fn is_immediate_delivery(self) -> bool {
        (self.0 & IMMEDIATE_DELIVERY) != 0
    }
}

impl ops::BitOr for TransportFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        TransportFlags(self.0 | other.0)
    }
}

impl ops::BitOrAssign for TransportFlags {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for TransportFlags {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(fmt, "NONE");
        }
        let mut one = false;
        let mut flag = |set: bool, name: &str| -> fmt::Result {
            if set {
                if one {
                    write!(fmt, " | ")?;
                }
                fmt.write_str(name)?;
                one = true;
            }
            Ok(())
        };
        flag(self.is_reading(), "READING")?;
        flag(self.is_writing(), "WRITING")?;
        flag(self.is_edge_triggered(), "EDGE_TRIGGERED")?;
        flag(self.is_no_auto_close(), "NO_AUTO_CLOSE")?;
        flag(self.is_immediate_delivery(), "IMMEDIATE_DELIVERY")?;
        Ok(())
    }
}

/// Behavior flags for sockets wrapped by [`TransportFactory::from_socket`].
///
/// [`TransportFactory::from_socket`]: crate::TransportFactory::from_socket
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SocketFlags(u8);

impl SocketFlags {
    /// The default flag set.
    pub const NONE: SocketFlags = SocketFlags(0);

    /// Do not close the underlying socket when the transport is closed.
    pub const NO_AUTO_CLOSE: SocketFlags = SocketFlags(NO_AUTO_CLOSE);

    /// Returns true if the underlying socket is not closed with the
    /// transport.
    pub const fn is_no_auto_close(self) -> bool {
        (self.0 & NO_AUTO_CLOSE) != 0
    }
}

impl ops::BitOr for SocketFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        SocketFlags(self.0 | other.0)
    }
}

impl fmt::Debug for SocketFlags {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_auto_close() {
            write!(fmt, "NO_AUTO_CLOSE")
        } else {
            write!(fmt, "NONE")
        }
    }
}
