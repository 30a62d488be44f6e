//! Timer capability.
//!
//! The engine never sleeps. When it needs to be woken later it asks its [`Clock`] to
//! schedule a [`Timer`] and keeps the returned [`TimerHandle`]. The owner of the
//! connection passes the handle back through [`Connection::on_timer`] once the delay
//! has elapsed. Handles the connection no longer tracks (cancelled, superseded or
//! already fired) are ignored, so a late wake-up is harmless.
//!
//! [`Connection::on_timer`]: crate::Connection::on_timer
use std::time::Duration;

/// Why a timer was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// The peer did not answer our close frame in time.
    CloseHandshake,
    /// The server did not drop the TCP connection after the closing handshake.
    ServerConnectionDrop,
    /// Time to send the next automatic ping.
    AutoPing,
    /// The peer did not answer the automatic ping in time.
    AutoPingTimeout,
}

/// Opaque identifier of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    #[inline]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Schedules one-shot timers on behalf of a connection.
pub trait Clock {
    /// Schedules `timer` to fire after `delay`. Every call returns a fresh handle.
    fn schedule(&mut self, delay: Duration, timer: Timer) -> TimerHandle;

    /// Cancels a pending timer. Cancelling an unknown handle does nothing.
    fn cancel(&mut self, handle: TimerHandle);
}

impl<C: Clock + ?Sized> Clock for &mut C {
    fn schedule(&mut self, delay: Duration, timer: Timer) -> TimerHandle {
        (**self).schedule(delay, timer)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        (**self).cancel(handle)
    }
}

impl<C: Clock + ?Sized> Clock for Box<C> {
    fn schedule(&mut self, delay: Duration, timer: Timer) -> TimerHandle {
        (**self).schedule(delay, timer)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        (**self).cancel(handle)
    }
}
