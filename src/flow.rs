//! Backpressure for streaming producers.
//!
//! A producer that feeds a message through the streaming API
//! ([`Connection::begin_message`] and friends) registers itself as a [`Flow`]. When the
//! transport's write buffer fills up, the transport owner calls
//! [`Connection::pause_producing`] and the connection forwards the pause to the
//! producer, which must stop emitting frame data until it is resumed.
//!
//! Notifications are forwarded only on state changes, so a pause arriving while the
//! producer is already paused (for example in the middle of a batch) is a no-op.
//!
//! [`Connection::begin_message`]: crate::Connection::begin_message
//! [`Connection::pause_producing`]: crate::Connection::pause_producing

/// The producer side of the flow control contract.
pub trait Flow {
    /// The transport is saturated. Stop producing until resumed.
    fn pause_producing(&mut self);

    /// The transport drained. Producing may continue.
    fn resume_producing(&mut self);

    /// The connection is going away. No more data will be accepted.
    fn stop_producing(&mut self);
}

/// Flow state of a connection, forwarding transitions to an optional producer.
#[derive(Default)]
pub(crate) struct FlowControl {
    producer: Option<Box<dyn Flow>>,
    paused: bool,
    stopped: bool,
}

impl FlowControl {
    pub(crate) fn register(&mut self, mut producer: Box<dyn Flow>) {
        if self.stopped {
            producer.stop_producing();
        } else if self.paused {
            producer.pause_producing();
        }
        self.producer = Some(producer);
    }

    pub(crate) fn unregister(&mut self) -> Option<Box<dyn Flow>> {
        self.producer.take()
    }

    #[inline]
    pub(crate) fn is_paused(&self) -> bool {
        self.paused
    }

    pub(crate) fn pause(&mut self) {
        if self.paused || self.stopped {
            return;
        }
        self.paused = true;
        if let Some(producer) = self.producer.as_mut() {
            producer.pause_producing();
        }
    }

    pub(crate) fn resume(&mut self) {
        if !self.paused || self.stopped {
            return;
        }
        self.paused = false;
        if let Some(producer) = self.producer.as_mut() {
            producer.resume_producing();
        }
    }

    pub(crate) fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(producer) = self.producer.as_mut() {
            producer.stop_producing();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FlowEvent, ManualFlow};

    #[test]
    fn test_forwards_transitions_once() {
        let flow = ManualFlow::default();
        let mut control = FlowControl::default();
        control.register(Box::new(flow.clone()));

        control.pause();
        control.pause();
        assert!(control.is_paused());
        control.resume();
        control.resume();
        control.stop();
        control.pause();

        assert_eq!(
            flow.events(),
            vec![FlowEvent::Pause, FlowEvent::Resume, FlowEvent::Stop]
        );
    }

    #[test]
    fn test_late_registration_sees_state() {
        let mut control = FlowControl::default();
        control.pause();

        let flow = ManualFlow::default();
        control.register(Box::new(flow.clone()));
        assert_eq!(flow.events(), vec![FlowEvent::Pause]);
        assert!(flow.is_paused());

        assert!(control.unregister().is_some());
        control.resume();
        assert_eq!(flow.events(), vec![FlowEvent::Pause]);
    }
}
