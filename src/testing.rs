//! Deterministic doubles for driving a [`Connection`] without sockets or real time,
//! plus the close-behavior check used by conformance runs.
//!
//! ```rust
//! use std::time::Duration;
//! use wsengine::{
//!     testing::{MemoryTransport, RecordingHandler, VirtualClock},
//!     CloseCode, Connection, Options, Role,
//! };
//!
//! let mut conn = Connection::new(
//!     Role::Client,
//!     Options::default(),
//!     MemoryTransport::default(),
//!     VirtualClock::default(),
//! );
//! let mut handler = RecordingHandler::default();
//! conn.open(None, &mut handler).unwrap();
//! conn.send_close(Some(CloseCode::Normal), None).unwrap();
//!
//! // the server never answers
//! for (handle, _) in conn.clock_mut().advance(Duration::from_secs(1)) {
//!     conn.on_timer(handle).unwrap();
//! }
//! assert!(conn.transport().is_closed());
//! assert!(conn.state().was_close_handshake_timeout);
//! ```
use std::{cell::RefCell, collections::BTreeMap, io, rc::Rc, time::Duration};

use bytes::{Buf, Bytes};

use crate::{
    clock::{Clock, Timer, TimerHandle},
    close::CloseCode,
    codec::{decode_header, HeaderRules},
    connection::{Connection, ConnectionState, Handler, HandlerResult, Transport},
    flow::Flow,
    frame::{Frame, OpCode},
    mask::apply_mask,
    Role,
};

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: Duration,
    next_id: u64,
    pending: BTreeMap<TimerHandle, (Duration, Timer)>,
}

impl VirtualClock {
    /// Time elapsed since the clock was created.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Number of scheduled timers that have not fired or been cancelled.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if a timer of this kind is scheduled.
    pub fn is_scheduled(&self, timer: Timer) -> bool {
        self.pending.values().any(|(_, t)| *t == timer)
    }

    /// Moves time forward and returns the timers that fired, earliest first.
    pub fn advance(&mut self, by: Duration) -> Vec<(TimerHandle, Timer)> {
        self.now += by;

        let mut fired: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= self.now)
            .map(|(handle, (deadline, timer))| (*deadline, *handle, *timer))
            .collect();
        fired.sort_by_key(|(deadline, handle, _)| (*deadline, *handle));

        fired
            .into_iter()
            .map(|(_, handle, timer)| {
                self.pending.remove(&handle);
                (handle, timer)
            })
            .collect()
    }
}

impl Clock for VirtualClock {
    fn schedule(&mut self, delay: Duration, timer: Timer) -> TimerHandle {
        self.next_id += 1;
        let handle = TimerHandle::new(self.next_id);
        self.pending.insert(handle, (self.now + delay, timer));
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.pending.remove(&handle);
    }
}

/// A transport writing into memory.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    written: Vec<u8>,
    closed: Option<bool>,
}

impl MemoryTransport {
    /// Takes everything written so far.
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }

    /// Takes everything written so far, parsed back into frames with clear payloads.
    ///
    /// Parsing stops at the first incomplete or malformed frame.
    pub fn take_frames(&mut self) -> Vec<Frame> {
        let mut buf = Bytes::from(self.take_written());
        let mut frames = Vec::new();
        let mut rules = HeaderRules {
            rsv1_allowed: true,
            require_masked_client_frames: false,
            accept_masked_server_frames: true,
            ..HeaderRules::new(Role::Client)
        };

        while let Ok((header, size)) = decode_header(&buf, &rules) {
            let Ok(len) = usize::try_from(header.payload_len) else {
                break;
            };
            if buf.len() < size + len {
                break;
            }
            buf.advance(size);
            let mut payload = buf.split_to(len).to_vec();
            if let Some(mask) = header.mask {
                apply_mask(&mut payload, mask);
            }

            if header.opcode.is_data() {
                rules.inside_message = !header.fin;
            }
            let mut frame = Frame::new(header.fin, header.opcode, header.mask, &payload[..]);
            frame.rsv = header.rsv;
            frames.push(frame);
        }
        frames
    }

    /// `Some(abort)` once the connection closed the transport.
    pub fn closed(&self) -> Option<bool> {
        self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }
}

impl Transport for MemoryTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed.is_some() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        self.written.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self, abort: bool) {
        self.closed.get_or_insert(abort);
    }
}

/// Flow notification received by a [`ManualFlow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Default)]
struct FlowLog {
    events: Vec<FlowEvent>,
    paused: bool,
}

/// A producer that records the flow notifications it receives.
///
/// Clones share the same record, so one clone can be registered with a connection
/// while the test keeps another.
#[derive(Debug, Clone, Default)]
pub struct ManualFlow {
    log: Rc<RefCell<FlowLog>>,
}

impl ManualFlow {
    pub fn events(&self) -> Vec<FlowEvent> {
        self.log.borrow().events.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.log.borrow().paused
    }
}

impl Flow for ManualFlow {
    fn pause_producing(&mut self) {
        let mut log = self.log.borrow_mut();
        log.events.push(FlowEvent::Pause);
        log.paused = true;
    }

    fn resume_producing(&mut self) {
        let mut log = self.log.borrow_mut();
        log.events.push(FlowEvent::Resume);
        log.paused = false;
    }

    fn stop_producing(&mut self) {
        self.log.borrow_mut().events.push(FlowEvent::Stop);
    }
}

/// A callback seen by a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open,
    Message { payload: Bytes, is_binary: bool },
    Ping(Bytes),
    Pong(Bytes),
    Close {
        was_clean: bool,
        code: Option<CloseCode>,
        reason: Option<String>,
    },
}

/// A handler that records every callback.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    pub events: Vec<Event>,
    /// Return an error from `on_message`.
    pub fail_on_message: bool,
}

impl RecordingHandler {
    /// Payloads of the messages received so far.
    pub fn messages(&self) -> Vec<Bytes> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Message { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// The close event, if the connection is gone.
    pub fn close(&self) -> Option<&Event> {
        self.events
            .iter()
            .find(|event| matches!(event, Event::Close { .. }))
    }
}

impl<T, C> Handler<T, C> for RecordingHandler {
    fn on_open(&mut self, _conn: &mut Connection<T, C>) -> HandlerResult {
        self.events.push(Event::Open);
        Ok(())
    }

    fn on_message(
        &mut self,
        _conn: &mut Connection<T, C>,
        payload: Bytes,
        is_binary: bool,
    ) -> HandlerResult {
        self.events.push(Event::Message { payload, is_binary });
        if self.fail_on_message {
            return Err("message rejected".into());
        }
        Ok(())
    }

    fn on_ping(&mut self, _conn: &mut Connection<T, C>, payload: Bytes) -> HandlerResult {
        self.events.push(Event::Ping(payload));
        Ok(())
    }

    fn on_pong(&mut self, _conn: &mut Connection<T, C>, payload: Bytes) -> HandlerResult {
        self.events.push(Event::Pong(payload));
        Ok(())
    }

    fn on_close(
        &mut self,
        _conn: &mut Connection<T, C>,
        was_clean: bool,
        code: Option<CloseCode>,
        reason: Option<&str>,
    ) -> HandlerResult {
        self.events.push(Event::Close {
            was_clean,
            code,
            reason: reason.map(str::to_owned),
        });
        Ok(())
    }
}

/// Verdict on how a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    Ok,
    /// The wrong endpoint started the close.
    Failed,
    /// A clean close was required.
    Unclean,
    /// The peer's close code was not one of the expected ones.
    WrongCode,
    /// The client dropped the TCP connection instead of the server.
    FailedByClient,
}

impl CloseBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Failed => "FAILED",
            Self::Unclean => "UNCLEAN",
            Self::WrongCode => "WRONG CODE",
            Self::FailedByClient => "FAILED BY CLIENT",
        }
    }
}

/// How a test case expects the connection to close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseExpectation {
    pub closed_by_me: bool,
    pub require_clean: bool,
    /// Acceptable close codes from the peer. A peer sending no code is always fine.
    pub codes: Vec<CloseCode>,
}

impl CloseExpectation {
    pub fn new(closed_by_me: bool, require_clean: bool, codes: &[CloseCode]) -> Self {
        Self {
            closed_by_me,
            require_clean,
            codes: codes.to_vec(),
        }
    }

    /// Judges a finished connection. The first failing check wins.
    pub fn evaluate(&self, state: &ConnectionState, role: Role) -> CloseBehavior {
        if self.closed_by_me != state.closed_by_me {
            CloseBehavior::Failed
        } else if self.require_clean && !state.was_clean {
            CloseBehavior::Unclean
        } else if state
            .remote_close_code
            .is_some_and(|code| !self.codes.contains(&code))
        {
            CloseBehavior::WrongCode
        } else if !role.is_server() && state.dropped_by_me {
            CloseBehavior::FailedByClient
        } else {
            CloseBehavior::Ok
        }
    }
}

/// Encodes a client frame (masked with a fixed key) for feeding to a server.
pub fn client_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let frame = Frame::new(fin, opcode, Some([0x37, 0xfa, 0x21, 0x3d]), payload);
    let mut buf = bytes::BytesMut::new();
    crate::codec::encode(&frame, &mut buf);
    buf.to_vec()
}
