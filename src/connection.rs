//! The connection state machine.
//!
//! A [`Connection`] turns incoming bytes into [`Handler`] callbacks and `send_*` calls
//! into bytes written to its [`Transport`]. It moves through four phases:
//!
//! ```text
//! Connecting --open()--> Open --close sent or received--> Closing --drop/lost--> Closed
//! ```
//!
//! The phase only moves forward. While `Closing`, frames are still parsed so the
//! peer's close reply is seen, but no new data messages are delivered.
//!
//! # Failing the connection
//! A protocol violation, invalid payload or oversized message fails the connection:
//! the engine sends a close frame with 1002, 1007 or 1009 (or drops the transport when
//! [`Options::fail_by_drop`] is set) and reports the error from the driving call.
//! Errors found in a frame's payload skip the rest of that message so the peer's close
//! reply can still be read. Errors found in a frame header stop reading altogether,
//! since the framing can no longer be trusted.
//!
//! # Timers
//! The closing handshake, the server's TCP drop and automatic pings are bounded by
//! timers scheduled on the injected [`Clock`]. The owner feeds fired handles back
//! through [`Connection::on_timer`].
use std::{io, time::Duration};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::{distributions::Alphanumeric, Rng};

use crate::{
    clock::{Clock, Timer, TimerHandle},
    close::{truncate_reason, CloseCode},
    codec::{self, DecodeError, HeaderRules},
    extensions::PerMessageCompress,
    flow::{Flow, FlowControl},
    frame::{Frame, FrameHeader, OpCode, Rsv, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask::apply_mask_offset,
    options::Options,
    reassembler::Reassembler,
    stats::TrafficStats,
    utf8::{self, Utf8Validator},
    BoxError, Result, Role, WebSocketError,
};

/// The byte sink of a connection.
pub trait Transport {
    /// Writes serialized frames.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Tears down the underlying connection. `abort` skips any graceful shutdown.
    ///
    /// The owner reports the end of the connection back through
    /// [`Connection::connection_lost`].
    fn close(&mut self, abort: bool);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write(data)
    }

    fn close(&mut self, abort: bool) {
        (**self).close(abort)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write(data)
    }

    fn close(&mut self, abort: bool) {
        (**self).close(abort)
    }
}

/// Result of an application callback.
pub type HandlerResult = std::result::Result<(), BoxError>;

/// Application callbacks.
///
/// Every method has a no-op default. Callbacks receive the connection so they can
/// answer right away, e.g. echo a message with [`Connection::send_message`]. An error
/// returned from a callback does not affect the connection; it is surfaced as
/// [`WebSocketError::Handler`] from the call that triggered it.
pub trait Handler<T, C> {
    /// The connection is open.
    fn on_open(&mut self, _conn: &mut Connection<T, C>) -> HandlerResult {
        Ok(())
    }

    /// A complete data message arrived.
    fn on_message(
        &mut self,
        _conn: &mut Connection<T, C>,
        _payload: Bytes,
        _is_binary: bool,
    ) -> HandlerResult {
        Ok(())
    }

    /// A ping arrived. The pong has already been sent.
    fn on_ping(&mut self, _conn: &mut Connection<T, C>, _payload: Bytes) -> HandlerResult {
        Ok(())
    }

    /// A pong arrived.
    fn on_pong(&mut self, _conn: &mut Connection<T, C>, _payload: Bytes) -> HandlerResult {
        Ok(())
    }

    /// The connection is gone. Called exactly once.
    ///
    /// A clean close reports the peer's code and reason. An unclean one reports
    /// [`CloseCode::Abnormal`] (1006) and why the close was unclean.
    fn on_close(
        &mut self,
        _conn: &mut Connection<T, C>,
        _was_clean: bool,
        _code: Option<CloseCode>,
        _reason: Option<&str>,
    ) -> HandlerResult {
        Ok(())
    }
}

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// Observable bookkeeping of a connection, mostly about how it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: Phase,
    pub role: Role,
    /// We sent the first close frame.
    pub closed_by_me: bool,
    /// We failed the connection because of something the peer sent.
    pub failed_by_me: bool,
    /// We closed the transport.
    pub dropped_by_me: bool,
    /// The closing handshake completed.
    pub was_clean: bool,
    pub was_not_clean_reason: Option<String>,
    pub was_close_handshake_timeout: bool,
    pub was_server_connection_drop_timeout: bool,
    pub was_auto_ping_timeout: bool,
    pub local_close_code: Option<CloseCode>,
    pub local_close_reason: Option<String>,
    pub remote_close_code: Option<CloseCode>,
    pub remote_close_reason: Option<String>,
}

impl ConnectionState {
    fn new(role: Role) -> Self {
        Self {
            phase: Phase::Connecting,
            role,
            closed_by_me: false,
            failed_by_me: false,
            dropped_by_me: false,
            was_clean: false,
            was_not_clean_reason: None,
            was_close_handshake_timeout: false,
            was_server_connection_drop_timeout: false,
            was_auto_ping_timeout: false,
            local_close_code: None,
            local_close_reason: None,
            remote_close_code: None,
            remote_close_reason: None,
        }
    }
}

/// Frame whose payload is being received.
struct Incoming {
    header: FrameHeader,
    received: u64,
    /// Payload of a control frame, collected until complete.
    control: BytesMut,
    /// The payload is read but ignored.
    skip: bool,
}

#[derive(Default)]
struct Timers {
    close_handshake: Option<TimerHandle>,
    server_connection_drop: Option<TimerHandle>,
    auto_ping: Option<TimerHandle>,
    auto_ping_timeout: Option<TimerHandle>,
}

impl Timers {
    fn slot(&mut self, timer: Timer) -> &mut Option<TimerHandle> {
        match timer {
            Timer::CloseHandshake => &mut self.close_handshake,
            Timer::ServerConnectionDrop => &mut self.server_connection_drop,
            Timer::AutoPing => &mut self.auto_ping,
            Timer::AutoPingTimeout => &mut self.auto_ping_timeout,
        }
    }

    /// Forgets `handle` and returns what it was scheduled for.
    fn fired(&mut self, handle: TimerHandle) -> Option<Timer> {
        [
            Timer::CloseHandshake,
            Timer::ServerConnectionDrop,
            Timer::AutoPing,
            Timer::AutoPingTimeout,
        ]
        .into_iter()
        .find(|timer| {
            let slot = self.slot(*timer);
            if *slot == Some(handle) {
                *slot = None;
                true
            } else {
                false
            }
        })
    }
}

/// Progress of a message sent through the streaming API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Ground,
    MessageBegin,
    InsideMessage,
    InsideMessageFrame {
        length: u64,
        sent: u64,
        mask: Option<[u8; 4]>,
    },
}

/// A WebSocket connection driven by events.
///
/// See the [crate documentation](crate) for an example.
pub struct Connection<T, C> {
    state: ConnectionState,
    options: Options,
    transport: T,
    clock: C,
    rules: HeaderRules,
    read_buf: BytesMut,
    write_buf: BytesMut,
    incoming: Option<Incoming>,
    reassembler: Reassembler,
    /// Continuations of a failed message are read and ignored.
    discarding: bool,
    /// A header could not be decoded, nothing more is read.
    read_stopped: bool,
    pmce: Option<PerMessageCompress>,
    timers: Timers,
    auto_ping_pending: Option<Bytes>,
    flow: FlowControl,
    send_state: SendState,
    send_opcode: OpCode,
    send_compressed: bool,
    lost: bool,
    failure: Option<WebSocketError>,
    stats: TrafficStats,
    handler_error: Option<BoxError>,
}

impl<T: Transport, C: Clock> Connection<T, C> {
    /// Creates a connection in the `Connecting` phase. The opening handshake happens
    /// elsewhere; call [`Connection::open`] once it succeeded.
    pub fn new(role: Role, options: Options, transport: T, clock: C) -> Self {
        let rules = HeaderRules {
            require_masked_client_frames: options.require_masked_client_frames,
            accept_masked_server_frames: options.accept_masked_server_frames,
            ..HeaderRules::new(role)
        };
        let reassembler = Reassembler::new(
            options.utf8_validate_incoming,
            options.max_frame_payload_size,
            options.max_message_payload_size,
        );

        Self {
            state: ConnectionState::new(role),
            options,
            transport,
            clock,
            rules,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(1024),
            incoming: None,
            reassembler,
            discarding: false,
            read_stopped: false,
            pmce: None,
            timers: Timers::default(),
            auto_ping_pending: None,
            flow: FlowControl::default(),
            send_state: SendState::Ground,
            send_opcode: OpCode::Text,
            send_compressed: false,
            lost: false,
            failure: None,
            stats: TrafficStats::default(),
            handler_error: None,
        }
    }

    /// Completes the opening handshake with the negotiated compression, if any.
    pub fn open<H>(&mut self, compression: Option<PerMessageCompress>, handler: &mut H) -> Result<()>
    where
        H: Handler<T, C> + ?Sized,
    {
        if self.state.phase != Phase::Connecting {
            return Err(WebSocketError::InvalidState(self.state.phase.as_str()));
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "{} connection open (compression: {})",
            self.state.role,
            compression.as_ref().map_or("none", |pmce| pmce.name())
        );

        self.rules.rsv1_allowed = compression.is_some();
        self.pmce = compression;
        if let Some(pmce) = self.pmce.as_mut() {
            if self.options.max_message_payload_size > 0 {
                pmce.limit_message_size(self.options.max_message_payload_size);
            }
        }
        self.state.phase = Phase::Open;
        if let Some(interval) = self.options.auto_ping_interval {
            self.schedule(Timer::AutoPing, interval);
        }

        let result = handler.on_open(self);
        self.record(result);
        self.finish()
    }

    /// Feeds bytes received from the transport.
    ///
    /// Returns the error the connection was failed with, if the data caused a failure,
    /// or the first error returned by a callback.
    pub fn on_data<H>(&mut self, data: &[u8], handler: &mut H) -> Result<()>
    where
        H: Handler<T, C> + ?Sized,
    {
        match self.state.phase {
            Phase::Connecting => return Err(WebSocketError::InvalidState("connecting")),
            Phase::Closed => return Ok(()),
            Phase::Open | Phase::Closing => {}
        }
        if self.read_stopped {
            return Ok(());
        }

        if self.timers.auto_ping.is_some() {
            if let Some(interval) = self.options.auto_ping_interval {
                self.schedule(Timer::AutoPing, interval);
            }
        }

        if self.state.phase == Phase::Open {
            self.stats.incoming_octets_wire += data.len() as u64;
        }
        self.read_buf.extend_from_slice(data);
        let processed = self.process(handler);
        let finished = self.finish();
        processed.and(finished)
    }

    /// Handles a timer scheduled on the clock. Unknown handles are ignored.
    pub fn on_timer(&mut self, handle: TimerHandle) -> Result<()> {
        let Some(timer) = self.timers.fired(handle) else {
            #[cfg(feature = "logging")]
            log::trace!("ignoring stale timer {}", handle.id());
            return Ok(());
        };
        if self.state.phase == Phase::Closed {
            return Ok(());
        }

        match timer {
            Timer::CloseHandshake => {
                #[cfg(feature = "logging")]
                log::debug!("closing handshake timed out");
                self.state.was_clean = false;
                self.state.was_not_clean_reason =
                    Some("peer did not respond (in time) in closing handshake".into());
                self.state.was_close_handshake_timeout = true;
                self.drop_connection(true);
            }
            Timer::ServerConnectionDrop => {
                #[cfg(feature = "logging")]
                log::debug!("server did not drop the connection in time");
                self.state.was_clean = false;
                self.state.was_not_clean_reason =
                    Some("server did not drop TCP connection (in time)".into());
                self.state.was_server_connection_drop_timeout = true;
                self.drop_connection(true);
            }
            Timer::AutoPing => self.send_auto_ping()?,
            Timer::AutoPingTimeout => {
                #[cfg(feature = "logging")]
                log::debug!("auto-ping timed out");
                self.state.was_clean = false;
                self.state.was_not_clean_reason = Some(
                    "WebSocket ping timeout (peer did not respond with pong in time)".into(),
                );
                self.state.was_auto_ping_timeout = true;
                self.drop_connection(true);
            }
        }
        Ok(())
    }

    /// The transport is gone. Calls [`Handler::on_close`] once.
    ///
    /// `reason` describes why the transport went away and is only logged; the close
    /// reported to the handler comes from the connection's own bookkeeping.
    pub fn connection_lost<H>(&mut self, reason: Option<&str>, handler: &mut H) -> Result<()>
    where
        H: Handler<T, C> + ?Sized,
    {
        if self.lost {
            return Ok(());
        }
        self.lost = true;

        #[cfg(feature = "logging")]
        log::debug!("connection lost ({})", reason.unwrap_or("no reason given"));
        #[cfg(not(feature = "logging"))]
        let _ = reason;

        for timer in [
            Timer::CloseHandshake,
            Timer::ServerConnectionDrop,
            Timer::AutoPing,
            Timer::AutoPingTimeout,
        ] {
            self.cancel(timer);
        }
        self.state.phase = Phase::Closed;
        self.flow.stop();

        let result = if self.state.was_clean {
            let code = self.state.remote_close_code;
            let reason = self.state.remote_close_reason.clone();
            handler.on_close(self, true, code, reason.as_deref())
        } else {
            if !self.state.dropped_by_me && self.state.was_not_clean_reason.is_none() {
                self.state.was_not_clean_reason = Some(
                    "peer dropped the TCP connection without previous WebSocket closing handshake"
                        .into(),
                );
            }
            let reason = format!(
                "connection was closed uncleanly ({})",
                self.state.was_not_clean_reason.as_deref().unwrap_or_default()
            );
            handler.on_close(self, false, Some(CloseCode::Abnormal), Some(&reason))
        };
        self.record(result);
        self.finish()
    }

    /// Sends a complete message, compressed when an extension was negotiated.
    pub fn send_message(&mut self, payload: &[u8], is_binary: bool) -> Result<()> {
        self.send_message_with(payload, is_binary, 0, false)
    }

    /// Sends a complete message.
    ///
    /// A non-zero `fragment_size` splits the (compressed) payload into frames of at
    /// most that size, overriding [`Options::auto_fragment_size`].
    pub fn send_message_with(
        &mut self,
        payload: &[u8],
        is_binary: bool,
        fragment_size: usize,
        do_not_compress: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        if self.send_state != SendState::Ground {
            return Err(WebSocketError::InvalidStreamingState(
                "a streamed message is in progress",
            ));
        }

        let opcode = if is_binary {
            OpCode::Binary
        } else {
            OpCode::Text
        };

        self.stats.outgoing_messages += 1;
        self.stats.outgoing_octets_app += payload.len() as u64;
        let (payload, compressed) = match self.pmce.as_mut() {
            Some(pmce) if !do_not_compress => {
                pmce.start_compress_message()?;
                let mut out = BytesMut::new();
                out.extend_from_slice(&pmce.compress_message_data(payload)?);
                out.extend_from_slice(&pmce.end_compress_message()?);
                (out.freeze(), true)
            }
            _ => (Bytes::copy_from_slice(payload), false),
        };

        self.stats.outgoing_octets_websocket += payload.len() as u64;

        let fragment_size = if fragment_size > 0 {
            fragment_size
        } else {
            self.options.auto_fragment_size
        };

        if fragment_size == 0 || payload.len() <= fragment_size {
            let frame = self.data_frame(true, opcode, compressed, &payload);
            return self.write_frame(&frame);
        }

        let count = payload.len().div_ceil(fragment_size);
        for (i, chunk) in payload.chunks(fragment_size).enumerate() {
            let frame = if i == 0 {
                self.data_frame(false, opcode, compressed, chunk)
            } else {
                self.data_frame(i + 1 == count, OpCode::Continuation, false, chunk)
            };
            self.write_frame(&frame)?;
        }
        Ok(())
    }

    /// Sends a ping with up to 125 bytes of payload.
    pub fn send_ping(&mut self, payload: &[u8]) -> Result<()> {
        self.send_control(OpCode::Ping, payload)
    }

    /// Sends an unsolicited pong with up to 125 bytes of payload.
    pub fn send_pong(&mut self, payload: &[u8]) -> Result<()> {
        self.send_control(OpCode::Pong, payload)
    }

    /// Starts the closing handshake.
    ///
    /// Only `1000` and `3000-4999` may be sent, and a reason needs a code. The reason
    /// is truncated to 123 bytes. Does nothing once the handshake is under way.
    pub fn send_close(&mut self, code: Option<CloseCode>, reason: Option<&str>) -> Result<()> {
        if let Some(code) = code {
            if !code.is_sendable() {
                return Err(WebSocketError::InvalidSendCloseCode(code.into()));
            }
        } else if reason.is_some() {
            return Err(WebSocketError::CloseReasonWithoutCode);
        }
        self.send_close_frame(code, reason, false)
    }

    /// Starts a message sent frame by frame.
    pub fn begin_message(&mut self, is_binary: bool, do_not_compress: bool) -> Result<()> {
        self.ensure_open()?;
        if self.send_state != SendState::Ground {
            return Err(WebSocketError::InvalidStreamingState(
                "a message is already in progress",
            ));
        }

        self.send_opcode = if is_binary {
            OpCode::Binary
        } else {
            OpCode::Text
        };
        self.send_compressed = false;
        if let Some(pmce) = self.pmce.as_mut() {
            if !do_not_compress {
                pmce.start_compress_message()?;
                self.send_compressed = true;
            }
        }
        self.send_state = SendState::MessageBegin;
        self.stats.outgoing_messages += 1;
        Ok(())
    }

    /// Starts a frame of `length` payload bytes within the current message. The header
    /// is written right away; the payload follows through
    /// [`Connection::send_message_frame_data`].
    pub fn begin_message_frame(&mut self, length: u64) -> Result<()> {
        self.ensure_open()?;
        let first = match self.send_state {
            SendState::MessageBegin => true,
            SendState::InsideMessage => false,
            SendState::Ground => {
                return Err(WebSocketError::InvalidStreamingState("no message in progress"))
            }
            SendState::InsideMessageFrame { .. } => {
                return Err(WebSocketError::InvalidStreamingState(
                    "the current frame is not complete",
                ))
            }
        };
        if length >> 63 != 0 {
            return Err(WebSocketError::InvalidPayloadLength(length));
        }

        let header = FrameHeader {
            fin: false,
            rsv: if first && self.send_compressed {
                Rsv::COMPRESSED
            } else {
                Rsv::default()
            },
            opcode: if first {
                self.send_opcode
            } else {
                OpCode::Continuation
            },
            mask: self.outgoing_mask(),
            payload_len: length,
        };
        let mut head = [0; MAX_HEAD_SIZE];
        let size = header.fmt_head(&mut head);
        self.transport.write(&head[..size])?;
        self.stats.outgoing_octets_wire += size as u64;
        self.stats.outgoing_frames += 1;

        self.send_state = if length == 0 {
            SendState::InsideMessage
        } else {
            SendState::InsideMessageFrame {
                length,
                sent: 0,
                mask: header.mask,
            }
        };
        Ok(())
    }

    /// Sends payload of the frame started with [`Connection::begin_message_frame`].
    ///
    /// Returns how many bytes the frame still needs: `0` when `data` completed it
    /// exactly, a positive count when more is owed, or the negated number of surplus
    /// bytes that did not fit and were dropped.
    pub fn send_message_frame_data(&mut self, data: &[u8]) -> Result<i64> {
        self.ensure_open()?;
        let SendState::InsideMessageFrame { length, sent, mask } = self.send_state else {
            return Err(WebSocketError::InvalidStreamingState("no frame in progress"));
        };

        let remaining = length - sent;
        let take = remaining.min(data.len() as u64) as usize;

        self.write_buf.clear();
        self.write_buf.extend_from_slice(&data[..take]);
        if let Some(mask) = mask {
            if self.options.apply_mask {
                apply_mask_offset(&mut self.write_buf, mask, sent);
            }
        }
        self.transport.write(&self.write_buf)?;
        self.stats.outgoing_octets_wire += take as u64;
        self.stats.outgoing_octets_websocket += take as u64;
        if !self.send_compressed {
            self.stats.outgoing_octets_app += take as u64;
        }

        let sent = sent + take as u64;
        self.send_state = if sent == length {
            SendState::InsideMessage
        } else {
            SendState::InsideMessageFrame { length, sent, mask }
        };

        let owed = (length - sent) as i64;
        let surplus = (data.len() - take) as i64;
        Ok(if surplus > 0 { -surplus } else { owed })
    }

    /// Finishes the streamed message with a final frame.
    pub fn end_message(&mut self) -> Result<()> {
        self.ensure_open()?;
        let first = match self.send_state {
            SendState::MessageBegin => true,
            SendState::InsideMessage => false,
            SendState::Ground => {
                return Err(WebSocketError::InvalidStreamingState("no message in progress"))
            }
            SendState::InsideMessageFrame { .. } => {
                return Err(WebSocketError::InvalidStreamingState(
                    "the current frame is not complete",
                ))
            }
        };

        let payload = match self.pmce.as_mut() {
            Some(pmce) if self.send_compressed => pmce.end_compress_message()?,
            _ => Bytes::new(),
        };
        self.stats.outgoing_octets_websocket += payload.len() as u64;

        // a message without any frame so far still needs its opcode
        let frame = if first {
            self.data_frame(true, self.send_opcode, self.send_compressed, &payload)
        } else {
            self.data_frame(true, OpCode::Continuation, false, &payload)
        };
        self.send_state = SendState::Ground;
        self.write_frame(&frame)
    }

    /// Sends a whole frame of the streamed message, compressing it first if the message
    /// is compressed.
    pub fn send_message_frame(&mut self, payload: &[u8]) -> Result<()> {
        let payload = match self.pmce.as_mut() {
            Some(pmce) if self.send_compressed => {
                self.stats.outgoing_octets_app += payload.len() as u64;
                pmce.compress_message_data(payload)?
            }
            _ => Bytes::copy_from_slice(payload),
        };
        self.begin_message_frame(payload.len() as u64)?;
        if !payload.is_empty() {
            self.send_message_frame_data(&payload)?;
        }
        Ok(())
    }

    /// Registers the producer that feeds the streaming API.
    pub fn register_producer(&mut self, producer: Box<dyn Flow>) {
        self.flow.register(producer);
    }

    pub fn unregister_producer(&mut self) -> Option<Box<dyn Flow>> {
        self.flow.unregister()
    }

    /// The transport's buffer is full.
    pub fn pause_producing(&mut self) {
        self.flow.pause();
    }

    /// The transport's buffer drained.
    pub fn resume_producing(&mut self) {
        self.flow.resume();
    }

    /// The transport will not accept more data.
    pub fn stop_producing(&mut self) {
        self.flow.stop();
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.flow.is_paused()
    }

    #[inline]
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.state.role
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Octets, frames and messages exchanged since open or the last reset.
    pub fn traffic_stats(&self) -> &TrafficStats {
        &self.stats
    }

    pub fn reset_traffic_stats(&mut self) {
        self.stats.reset();
    }

    /// The negotiated compression extension.
    pub fn compression(&self) -> Option<&PerMessageCompress> {
        self.pmce.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    fn process<H>(&mut self, handler: &mut H) -> Result<()>
    where
        H: Handler<T, C> + ?Sized,
    {
        loop {
            if self.state.phase == Phase::Closed || self.read_stopped {
                self.read_buf.clear();
                return Ok(());
            }

            let Some(mut frame) = self.incoming.take() else {
                self.rules.inside_message = self.reassembler.inside_message() || self.discarding;
                match codec::decode_header(&self.read_buf, &self.rules) {
                    Ok((header, size)) => {
                        self.read_buf.advance(size);
                        self.begin_frame(header);
                    }
                    Err(DecodeError::NeedMoreBytes(_)) => return Ok(()),
                    Err(DecodeError::Protocol(err)) => {
                        self.read_stopped = true;
                        self.fail(err);
                    }
                }
                continue;
            };

            let remaining = frame.header.payload_len - frame.received;
            if remaining > 0 && self.read_buf.is_empty() {
                self.incoming = Some(frame);
                return Ok(());
            }

            let take = remaining.min(self.read_buf.len() as u64) as usize;
            let mut chunk = self.read_buf.split_to(take);
            if let Some(mask) = frame.header.mask {
                if self.options.apply_mask {
                    apply_mask_offset(&mut chunk, mask, frame.received);
                }
            }
            frame.received += take as u64;

            if !frame.skip {
                if frame.header.opcode.is_control() {
                    frame.control.extend_from_slice(&chunk);
                } else {
                    let before = self.reassembler.buffered();
                    match self.reassembler.frame_data(&chunk, self.pmce.as_mut()) {
                        Ok(()) if self.state.phase == Phase::Open => {
                            self.stats.incoming_octets_websocket += chunk.len() as u64;
                            self.stats.incoming_octets_app +=
                                (self.reassembler.buffered() - before) as u64;
                        }
                        Ok(()) => {}
                        Err(err) => {
                            self.skip_message(&mut frame);
                            self.fail(err);
                        }
                    }
                }
            }

            if frame.received == frame.header.payload_len {
                self.end_frame(frame, handler)?;
            } else {
                self.incoming = Some(frame);
            }
        }
    }

    fn begin_frame(&mut self, header: FrameHeader) {
        let mut frame = Incoming {
            header,
            received: 0,
            control: BytesMut::new(),
            skip: false,
        };

        if header.opcode.is_data() {
            if self.discarding {
                frame.skip = true;
                self.discarding = !header.fin;
            } else if let Err(err) = self.reassembler.begin_frame(&header, self.pmce.as_mut()) {
                self.skip_message(&mut frame);
                self.fail(err);
            }
        }

        self.incoming = Some(frame);
    }

    /// Drops the message `frame` belongs to, ignoring the rest of it.
    fn skip_message(&mut self, frame: &mut Incoming) {
        frame.skip = true;
        self.discarding = !frame.header.fin;
        self.reassembler.reset();
    }

    fn end_frame<H>(&mut self, frame: Incoming, handler: &mut H) -> Result<()>
    where
        H: Handler<T, C> + ?Sized,
    {
        if frame.skip {
            return Ok(());
        }

        match frame.header.opcode {
            OpCode::Close => self.on_close_frame(frame.control.freeze())?,
            OpCode::Ping => {
                let payload = frame.control.freeze();
                if self.state.phase == Phase::Open {
                    self.send_control(OpCode::Pong, &payload)?;
                }
                let result = handler.on_ping(self, payload);
                self.record(result);
            }
            OpCode::Pong => {
                let payload = frame.control.freeze();
                if self.auto_ping_pending.as_ref() == Some(&payload) {
                    #[cfg(feature = "logging")]
                    log::trace!("auto-ping answered");
                    self.auto_ping_pending = None;
                    self.cancel(Timer::AutoPingTimeout);
                    if let Some(interval) = self.options.auto_ping_interval {
                        self.schedule(Timer::AutoPing, interval);
                    }
                }
                let result = handler.on_pong(self, payload);
                self.record(result);
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                let open = self.state.phase == Phase::Open;
                if open {
                    self.stats.incoming_frames += 1;
                }
                let before = self.reassembler.buffered();
                match self.reassembler.end_frame(self.pmce.as_mut()) {
                    Ok(Some(message)) if open => {
                        self.stats.incoming_octets_app += (message.payload.len() - before) as u64;
                        self.stats.incoming_messages += 1;
                        let result =
                            handler.on_message(self, message.payload, message.kind.is_binary());
                        self.record(result);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        self.reassembler.reset();
                        self.fail(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn on_close_frame(&mut self, payload: Bytes) -> Result<()> {
        let mut code = None;
        let mut reason = None;

        if payload.len() >= 2 {
            let raw = u16::from_be_bytes([payload[0], payload[1]]);
            code = Some(if CloseCode::from(raw).is_allowed() {
                CloseCode::from(raw)
            } else {
                // the frame still answers the handshake, as a normal close
                self.fail(WebSocketError::InvalidCloseCode(raw));
                CloseCode::Normal
            });

            let text = &payload[2..];
            if !text.is_empty() {
                if utf8::is_utf8(text) {
                    reason = Some(String::from_utf8_lossy(text).into_owned());
                } else {
                    let status = Utf8Validator::new().feed(text);
                    let offset = status.error_offset.unwrap_or(status.total_index);
                    self.fail(WebSocketError::InvalidUTF8 { offset });
                }
            }
        }

        if self.state.phase == Phase::Closed {
            return Ok(());
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "received close frame (code: {:?}, reason: {:?}) while {}",
            code,
            reason,
            self.state.phase.as_str()
        );

        self.state.remote_close_code = code;
        self.state.remote_close_reason = reason.clone();

        match self.state.phase {
            Phase::Open => {
                self.state.was_clean = true;
                if self.options.echo_close_code_reason {
                    self.send_close_frame(code, reason.as_deref(), true)?;
                } else {
                    self.send_close_frame(code.map(|_| CloseCode::Normal), None, true)?;
                }
                self.after_closing_handshake(false);
            }
            Phase::Closing => {
                self.cancel(Timer::CloseHandshake);
                self.state.was_clean = true;
                self.after_closing_handshake(true);
            }
            Phase::Connecting | Phase::Closed => {}
        }
        Ok(())
    }

    /// The server drops the TCP connection, the client waits for it to do so.
    fn after_closing_handshake(&mut self, abort: bool) {
        if self.state.role.is_server() {
            self.drop_connection(abort);
        } else if let Some(timeout) = self.options.server_connection_drop_timeout {
            self.schedule(Timer::ServerConnectionDrop, timeout);
        }
    }

    fn send_close_frame(
        &mut self,
        code: Option<CloseCode>,
        reason: Option<&str>,
        is_reply: bool,
    ) -> Result<()> {
        match self.state.phase {
            Phase::Connecting => return Err(WebSocketError::InvalidState("connecting")),
            Phase::Closing | Phase::Closed => {
                #[cfg(feature = "logging")]
                log::trace!("ignoring close, handshake already under way");
                return Ok(());
            }
            Phase::Open => {}
        }

        let reason = reason.map(truncate_reason);
        let mut payload = BytesMut::with_capacity(MAX_CONTROL_PAYLOAD);
        if let Some(code) = code {
            payload.put_u16(code.into());
            if let Some(reason) = reason {
                payload.extend_from_slice(reason.as_bytes());
            }
        }

        self.state.phase = Phase::Closing;
        self.state.closed_by_me = !is_reply;
        self.state.local_close_code = code;
        self.state.local_close_reason = reason.map(str::to_owned);
        if !is_reply {
            if let Some(timeout) = self.options.close_handshake_timeout {
                self.schedule(Timer::CloseHandshake, timeout);
            }
        }

        #[cfg(feature = "logging")]
        log::debug!("sending close frame (code: {:?}, reply: {})", code, is_reply);

        let frame = Frame::new(true, OpCode::Close, self.outgoing_mask(), payload);
        self.write_frame(&frame)
    }

    /// Fails the connection because of `err` and remembers the first error.
    fn fail(&mut self, err: WebSocketError) {
        #[cfg(feature = "logging")]
        log::warn!("failing {} connection: {}", self.state.role, err);

        if self.state.phase != Phase::Closed {
            self.state.failed_by_me = true;
            if self.options.fail_by_drop {
                self.state.was_clean = false;
                self.state.was_not_clean_reason = Some(
                    "I failed the WebSocket connection by dropping the TCP connection".into(),
                );
                self.drop_connection(true);
            } else if self.state.phase == Phase::Closing {
                self.drop_connection(false);
            } else {
                let code = err.close_code().unwrap_or(CloseCode::Protocol);
                let reason = err.to_string();
                if let Err(write_err) = self.send_close_frame(Some(code), Some(&reason), false) {
                    self.failure.get_or_insert(write_err);
                    self.drop_connection(true);
                }
            }
        }

        self.failure.get_or_insert(err);
    }

    fn drop_connection(&mut self, abort: bool) {
        if self.state.phase == Phase::Closed {
            return;
        }
        #[cfg(feature = "logging")]
        log::debug!("dropping connection (abort: {})", abort);

        self.state.dropped_by_me = true;
        self.state.phase = Phase::Closed;
        self.flow.stop();
        self.transport.close(abort);
    }

    fn send_auto_ping(&mut self) -> Result<()> {
        if self.state.phase != Phase::Open {
            return Ok(());
        }

        let payload: Vec<u8> = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.options.auto_ping_size)
            .collect();
        let payload = Bytes::from(payload);

        #[cfg(feature = "logging")]
        log::trace!("sending auto-ping");

        self.send_control(OpCode::Ping, &payload)?;
        self.auto_ping_pending = Some(payload);
        if let Some(timeout) = self.options.auto_ping_timeout {
            self.schedule(Timer::AutoPingTimeout, timeout);
        }
        Ok(())
    }

    fn send_control(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge(payload.len() as u64));
        }
        let frame = Frame::new(true, opcode, self.outgoing_mask(), payload);
        self.write_frame(&frame)
    }

    fn data_frame(&self, fin: bool, opcode: OpCode, compressed: bool, payload: &[u8]) -> Frame {
        let mask = self.outgoing_mask();
        if compressed {
            Frame::compress(fin, opcode, mask, payload)
        } else {
            Frame::new(fin, opcode, mask, payload)
        }
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.write_buf.clear();
        if self.options.apply_mask {
            codec::encode(frame, &mut self.write_buf);
        } else {
            let mut head = [0; MAX_HEAD_SIZE];
            let size = frame.header().fmt_head(&mut head);
            self.write_buf.extend_from_slice(&head[..size]);
            self.write_buf.extend_from_slice(&frame.payload);
        }
        self.transport.write(&self.write_buf)?;
        if self.state.phase == Phase::Open {
            self.stats.outgoing_octets_wire += self.write_buf.len() as u64;
            if frame.opcode.is_data() {
                self.stats.outgoing_frames += 1;
            }
        }
        Ok(())
    }

    fn outgoing_mask(&self) -> Option<[u8; 4]> {
        if !self.state.role.is_server() || self.options.mask_server_frames {
            Some(rand::random())
        } else {
            None
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state.phase {
            Phase::Open => Ok(()),
            Phase::Closing | Phase::Closed => Err(WebSocketError::ConnectionClosed),
            Phase::Connecting => Err(WebSocketError::InvalidState("connecting")),
        }
    }

    fn schedule(&mut self, timer: Timer, delay: Duration) {
        let handle = self.clock.schedule(delay, timer);
        if let Some(previous) = self.timers.slot(timer).replace(handle) {
            self.clock.cancel(previous);
        }
    }

    fn cancel(&mut self, timer: Timer) {
        if let Some(handle) = self.timers.slot(timer).take() {
            self.clock.cancel(handle);
        }
    }

    fn record(&mut self, result: HandlerResult) {
        if let Err(err) = result {
            #[cfg(feature = "logging")]
            log::warn!("handler error: {}", err);
            self.handler_error.get_or_insert(err);
        }
    }

    /// Reports what went wrong during the last call.
    fn finish(&mut self) -> Result<()> {
        let handler_error = self.handler_error.take();
        if let Some(err) = self.failure.take() {
            return Err(err);
        }
        match handler_error {
            Some(err) => Err(WebSocketError::Handler(err)),
            None => Ok(()),
        }
    }
}

impl<T, C> std::fmt::Debug for Connection<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("compression", &self.pmce.as_ref().map(|pmce| pmce.name()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        extensions::{accept_first, negotiate_offers, negotiate_response, Offer},
        testing::{
            client_frame, CloseBehavior, CloseExpectation, Event, FlowEvent, ManualFlow,
            MemoryTransport, RecordingHandler, VirtualClock,
        },
    };

    type Conn = Connection<MemoryTransport, VirtualClock>;

    fn open(role: Role, options: Options) -> (Conn, RecordingHandler) {
        open_with(role, options, None)
    }

    fn open_with(
        role: Role,
        options: Options,
        compression: Option<PerMessageCompress>,
    ) -> (Conn, RecordingHandler) {
        // RUST_LOG=debug shows the engine's decisions when built with `logging`
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Off)
            .env()
            .init();

        let mut conn = Connection::new(
            role,
            options,
            MemoryTransport::default(),
            VirtualClock::default(),
        );
        let mut handler = RecordingHandler::default();
        conn.open(compression, &mut handler).unwrap();
        (conn, handler)
    }

    fn server_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::encode(&Frame::new(fin, opcode, None, payload), &mut buf);
        buf.to_vec()
    }

    fn close_payload(code: u16, reason: &str) -> Vec<u8> {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        payload
    }

    fn fire_timers(conn: &mut Conn, by: Duration) {
        for (handle, _) in conn.clock_mut().advance(by) {
            conn.on_timer(handle).unwrap();
        }
    }

    #[test]
    fn test_receive_message() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        conn.on_data(&client_frame(true, OpCode::Text, b"Hello"), &mut handler)
            .unwrap();
        conn.on_data(&client_frame(true, OpCode::Binary, b"\x00\xff"), &mut handler)
            .unwrap();

        assert_eq!(
            handler.events,
            vec![
                Event::Open,
                Event::Message {
                    payload: Bytes::from_static(b"Hello"),
                    is_binary: false
                },
                Event::Message {
                    payload: Bytes::from_static(b"\x00\xff"),
                    is_binary: true
                },
            ]
        );
        assert!(conn.transport_mut().take_written().is_empty());
    }

    #[test]
    fn test_fragments_with_interleaved_ping_byte_by_byte() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());

        let mut wire = client_frame(false, OpCode::Text, b"Hel");
        wire.extend(client_frame(true, OpCode::Ping, b"p"));
        wire.extend(client_frame(true, OpCode::Continuation, b"lo"));
        for byte in wire {
            conn.on_data(&[byte], &mut handler).unwrap();
        }

        assert_eq!(handler.messages(), vec![Bytes::from_static(b"Hello")]);
        assert!(handler.events.contains(&Event::Ping(Bytes::from_static(b"p"))));

        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Pong);
        assert_eq!(&frames[0].payload[..], b"p");
        assert!(!frames[0].is_masked());
    }

    #[test]
    fn test_extended_length_split_across_reads() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        let payload = vec![7u8; 300];
        let wire = client_frame(true, OpCode::Binary, &payload);
        assert_eq!(wire[1] & 0x7f, 126);

        conn.on_data(&wire[..3], &mut handler).unwrap();
        conn.on_data(&wire[3..100], &mut handler).unwrap();
        assert!(handler.messages().is_empty());
        conn.on_data(&wire[100..], &mut handler).unwrap();
        assert_eq!(handler.messages(), vec![Bytes::from(payload)]);
    }

    #[test]
    fn test_close_initiated_locally() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        conn.send_close(Some(CloseCode::Normal), Some("bye")).unwrap();

        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames[0].close_code(), Some(CloseCode::Normal));
        assert_eq!(frames[0].close_reason(), Some("bye"));
        assert_eq!(conn.phase(), Phase::Closing);
        assert!(conn.state().closed_by_me);
        assert_eq!(conn.state().local_close_reason.as_deref(), Some("bye"));
        assert!(conn.clock().is_scheduled(Timer::CloseHandshake));

        // closing twice is a no-op
        conn.send_close(Some(CloseCode::Normal), None).unwrap();
        assert!(conn.transport_mut().take_written().is_empty());

        conn.on_data(
            &client_frame(true, OpCode::Close, &close_payload(1000, "")),
            &mut handler,
        )
        .unwrap();
        assert!(!conn.clock().is_scheduled(Timer::CloseHandshake));
        assert!(conn.state().was_clean);
        assert_eq!(conn.transport().closed(), Some(true));
        assert_eq!(conn.phase(), Phase::Closed);

        conn.connection_lost(None, &mut handler).unwrap();
        assert_eq!(
            handler.close(),
            Some(&Event::Close {
                was_clean: true,
                code: Some(CloseCode::Normal),
                reason: None,
            })
        );

        let expect = CloseExpectation::new(true, true, &[CloseCode::Normal]);
        assert_eq!(expect.evaluate(conn.state(), Role::Server), CloseBehavior::Ok);
    }

    #[test]
    fn test_close_initiated_by_peer() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        conn.on_data(
            &client_frame(true, OpCode::Close, &close_payload(4000, "done")),
            &mut handler,
        )
        .unwrap();

        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], &[0x03, 0xe8]);
        assert!(!conn.state().closed_by_me);
        assert!(conn.state().was_clean);
        assert_eq!(conn.transport().closed(), Some(false));

        conn.connection_lost(Some("eof"), &mut handler).unwrap();
        assert_eq!(
            handler.close(),
            Some(&Event::Close {
                was_clean: true,
                code: Some(CloseCode::Library(4000)),
                reason: Some("done".into()),
            })
        );
    }

    #[test]
    fn test_close_echoes_code_and_reason() {
        let options = Options::default().with_echo_close_code_reason();
        let (mut conn, mut handler) = open(Role::Server, options);
        conn.on_data(
            &client_frame(true, OpCode::Close, &close_payload(4000, "done")),
            &mut handler,
        )
        .unwrap();

        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames[0].close_code(), Some(CloseCode::Library(4000)));
        assert_eq!(frames[0].close_reason(), Some("done"));
    }

    #[test]
    fn test_empty_close_gets_empty_reply() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        conn.on_data(&client_frame(true, OpCode::Close, b""), &mut handler)
            .unwrap();
        let frames = conn.transport_mut().take_frames();
        assert!(frames[0].payload.is_empty());
        assert_eq!(conn.state().remote_close_code, None);
    }

    #[test]
    fn test_client_waits_for_server_drop() {
        let (mut conn, mut handler) = open(Role::Client, Options::default());
        conn.on_data(
            &server_frame(true, OpCode::Close, &close_payload(1000, "")),
            &mut handler,
        )
        .unwrap();

        let frames = conn.transport_mut().take_frames();
        assert!(frames[0].is_masked());
        assert_eq!(frames[0].close_code(), Some(CloseCode::Normal));
        assert!(!conn.transport().is_closed());
        assert!(conn.clock().is_scheduled(Timer::ServerConnectionDrop));

        fire_timers(&mut conn, Duration::from_secs(1));
        assert!(conn.state().was_server_connection_drop_timeout);
        assert!(!conn.state().was_clean);
        assert_eq!(conn.transport().closed(), Some(true));

        let expect = CloseExpectation::new(false, false, &[CloseCode::Normal]);
        assert_eq!(
            expect.evaluate(conn.state(), Role::Client),
            CloseBehavior::FailedByClient
        );
    }

    #[test]
    fn test_client_close_completed_by_server_drop() {
        let (mut conn, mut handler) = open(Role::Client, Options::default());
        conn.send_close(Some(CloseCode::Normal), None).unwrap();
        conn.on_data(
            &server_frame(true, OpCode::Close, &close_payload(1000, "")),
            &mut handler,
        )
        .unwrap();
        assert!(conn.clock().is_scheduled(Timer::ServerConnectionDrop));

        conn.connection_lost(None, &mut handler).unwrap();
        assert_eq!(conn.clock().pending(), 0);

        let expect = CloseExpectation::new(true, true, &[CloseCode::Normal]);
        assert_eq!(expect.evaluate(conn.state(), Role::Client), CloseBehavior::Ok);
    }

    #[test]
    fn test_close_handshake_timeout() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        conn.send_close(Some(CloseCode::Normal), None).unwrap();

        fire_timers(&mut conn, Duration::from_millis(999));
        assert!(!conn.transport().is_closed());
        fire_timers(&mut conn, Duration::from_millis(1));
        assert!(conn.state().was_close_handshake_timeout);
        assert_eq!(conn.transport().closed(), Some(true));

        conn.connection_lost(None, &mut handler).unwrap();
        assert_eq!(
            handler.close(),
            Some(&Event::Close {
                was_clean: false,
                code: Some(CloseCode::Abnormal),
                reason: Some(
                    "connection was closed uncleanly \
                     (peer did not respond (in time) in closing handshake)"
                        .into()
                ),
            })
        );
    }

    #[test]
    fn test_peer_drops_without_close() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        conn.connection_lost(Some("reset by peer"), &mut handler).unwrap();
        conn.connection_lost(None, &mut handler).unwrap();

        let closes: Vec<_> = handler
            .events
            .iter()
            .filter(|event| matches!(event, Event::Close { .. }))
            .collect();
        assert_eq!(closes.len(), 1);
        assert_eq!(
            conn.state().was_not_clean_reason.as_deref(),
            Some("peer dropped the TCP connection without previous WebSocket closing handshake")
        );
        assert!(!conn.state().dropped_by_me);
        assert!(matches!(
            conn.send_message(b"late", false),
            Err(WebSocketError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_protocol_violation_fails_with_1002() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        let mut wire = client_frame(true, OpCode::Text, b"x");
        wire[0] |= 0x20;
        wire.extend(client_frame(true, OpCode::Close, &close_payload(1000, "")));

        let err = conn.on_data(&wire, &mut handler).unwrap_err();
        assert!(matches!(err, WebSocketError::ReservedBitsNotZero(0b010)));

        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].close_code(), Some(CloseCode::Protocol));
        assert!(conn.state().failed_by_me);
        assert!(conn.state().closed_by_me);
        assert_eq!(conn.phase(), Phase::Closing);

        // the framing is lost, nothing after the bad header is read
        assert!(!conn.state().was_clean);
        conn.on_data(
            &client_frame(true, OpCode::Close, &close_payload(1000, "")),
            &mut handler,
        )
        .unwrap();
        assert!(!conn.state().was_clean);
    }

    #[test]
    fn test_unmasked_client_frame() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        let err = conn
            .on_data(&server_frame(true, OpCode::Text, b"x"), &mut handler)
            .unwrap_err();
        assert!(matches!(err, WebSocketError::UnmaskedFrame));

        let options = Options::default().with_unmasked_client_frames();
        let (mut conn, mut handler) = open(Role::Server, options);
        conn.on_data(&server_frame(true, OpCode::Text, b"x"), &mut handler)
            .unwrap();
        assert_eq!(handler.messages(), vec![Bytes::from_static(b"x")]);
    }

    #[test]
    fn test_invalid_utf8_fails_with_1007_and_closes_cleanly() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        let mut wire = client_frame(true, OpCode::Text, b"\x65\x64\xed\xa0\x80");
        wire.extend(client_frame(true, OpCode::Close, &close_payload(1000, "")));

        let err = conn.on_data(&wire, &mut handler).unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidUTF8 { offset: 2 }));
        assert!(handler.messages().is_empty());

        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames[0].close_code(), Some(CloseCode::Invalid));

        // the peer's reply in the same read completes the handshake
        assert!(conn.state().was_clean);
        assert_eq!(conn.transport().closed(), Some(true));

        let expect = CloseExpectation::new(true, false, &[CloseCode::Normal]);
        assert_eq!(expect.evaluate(conn.state(), Role::Server), CloseBehavior::Ok);
    }

    #[test]
    fn test_rest_of_failed_message_is_skipped() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        let mut wire = client_frame(false, OpCode::Text, b"\x65\x64");
        wire.extend(client_frame(false, OpCode::Continuation, b"\xed\xa0\x80"));
        wire.extend(client_frame(true, OpCode::Continuation, b"tail"));
        wire.extend(client_frame(true, OpCode::Close, &close_payload(1000, "")));

        let err = conn.on_data(&wire, &mut handler).unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidUTF8 { offset: 2 }));
        assert!(conn.state().was_clean);
        assert!(handler.messages().is_empty());
    }

    #[test]
    fn test_message_too_big_fails_with_1009() {
        let options = Options::default().with_max_message_payload_size(4);
        let (mut conn, mut handler) = open(Role::Server, options);
        let err = conn
            .on_data(&client_frame(true, OpCode::Binary, b"Hello"), &mut handler)
            .unwrap_err();
        assert!(matches!(err, WebSocketError::MessageTooBig(5)));

        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames[0].close_code(), Some(CloseCode::Size));
    }

    #[test]
    fn test_fail_by_drop() {
        let options = Options::default().with_fail_by_drop();
        let (mut conn, mut handler) = open(Role::Server, options);
        let err = conn
            .on_data(&client_frame(true, OpCode::Continuation, b"x"), &mut handler)
            .unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidContinuationFrame));

        assert!(conn.transport_mut().take_written().is_empty());
        assert_eq!(conn.transport().closed(), Some(true));
        assert_eq!(
            conn.state().was_not_clean_reason.as_deref(),
            Some("I failed the WebSocket connection by dropping the TCP connection")
        );

        conn.connection_lost(None, &mut handler).unwrap();
        assert!(matches!(
            handler.close(),
            Some(Event::Close {
                was_clean: false,
                code: Some(CloseCode::Abnormal),
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_close_code_from_peer() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        let err = conn
            .on_data(
                &client_frame(true, OpCode::Close, &close_payload(1005, "")),
                &mut handler,
            )
            .unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidCloseCode(1005)));

        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames[0].close_code(), Some(CloseCode::Protocol));
        assert!(conn.state().failed_by_me);
        assert_eq!(conn.transport().closed(), Some(true));
        assert_eq!(conn.state().remote_close_code, Some(CloseCode::Normal));
        assert_eq!(conn.state().remote_close_reason, None);
    }

    #[test]
    fn test_invalid_close_reason_from_peer() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        let err = conn
            .on_data(
                &client_frame(true, OpCode::Close, b"\x03\xe8ok\xff"),
                &mut handler,
            )
            .unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidUTF8 { offset: 2 }));

        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames[0].close_code(), Some(CloseCode::Invalid));
        assert_eq!(conn.state().remote_close_code, Some(CloseCode::Normal));
        assert_eq!(conn.state().remote_close_reason, None);
    }

    #[test]
    fn test_data_while_closing_is_not_delivered() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        conn.send_close(Some(CloseCode::Normal), None).unwrap();
        conn.on_data(&client_frame(true, OpCode::Text, b"late"), &mut handler)
            .unwrap();
        assert!(handler.messages().is_empty());
    }

    #[test]
    fn test_auto_ping() {
        let options = Options::default()
            .with_auto_ping(Duration::from_secs(10), Duration::from_secs(5))
            .with_auto_ping_size(8);
        let (mut conn, mut handler) = open(Role::Server, options);
        assert!(conn.clock().is_scheduled(Timer::AutoPing));

        fire_timers(&mut conn, Duration::from_secs(10));
        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames[0].opcode, OpCode::Ping);
        assert_eq!(frames[0].payload.len(), 8);
        assert!(conn.clock().is_scheduled(Timer::AutoPingTimeout));

        conn.on_data(&client_frame(true, OpCode::Pong, &frames[0].payload), &mut handler)
            .unwrap();
        assert!(!conn.clock().is_scheduled(Timer::AutoPingTimeout));
        assert!(conn.clock().is_scheduled(Timer::AutoPing));

        // a pong that does not match keeps the timeout running
        fire_timers(&mut conn, Duration::from_secs(10));
        conn.on_data(&client_frame(true, OpCode::Pong, b"other"), &mut handler)
            .unwrap();
        assert!(conn.clock().is_scheduled(Timer::AutoPingTimeout));

        fire_timers(&mut conn, Duration::from_secs(5));
        assert!(conn.state().was_auto_ping_timeout);
        assert_eq!(conn.transport().closed(), Some(true));
    }

    #[test]
    fn test_stale_timer_is_ignored() {
        let (mut conn, _) = open(Role::Server, Options::default());
        conn.on_timer(TimerHandle::new(999)).unwrap();
        assert_eq!(conn.phase(), Phase::Open);
    }

    #[test]
    fn test_send_fragmented() {
        let options = Options::default().with_auto_fragment_size(2);
        let (mut conn, _) = open(Role::Server, options);
        conn.send_message(b"Hello", false).unwrap();

        let frames = conn.transport_mut().take_frames();
        let shape: Vec<_> = frames
            .iter()
            .map(|f| (f.fin, f.opcode, f.payload.to_vec()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (false, OpCode::Text, b"He".to_vec()),
                (false, OpCode::Continuation, b"ll".to_vec()),
                (true, OpCode::Continuation, b"o".to_vec()),
            ]
        );

        conn.send_message_with(b"Hello", true, 8, false).unwrap();
        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].fin);
        assert_eq!(frames[0].opcode, OpCode::Binary);
    }

    #[test]
    fn test_client_masks_frames() {
        let (mut conn, _) = open(Role::Client, Options::default());
        conn.send_message(b"hi", false).unwrap();
        conn.send_ping(b"p").unwrap();

        let frames = conn.transport_mut().take_frames();
        assert!(frames.iter().all(|f| f.is_masked()));
        assert_eq!(&frames[0].payload[..], b"hi");

        let options = Options::default().without_apply_mask();
        let (mut conn, _) = open(Role::Client, options);
        conn.send_message(b"hi", false).unwrap();
        let wire = conn.transport_mut().take_written();
        assert_eq!(wire[1], 0x82);
        assert_eq!(&wire[6..], b"hi");
    }

    #[test]
    fn test_send_errors() {
        let mut conn = Connection::new(
            Role::Server,
            Options::default(),
            MemoryTransport::default(),
            VirtualClock::default(),
        );
        assert!(matches!(
            conn.send_message(b"x", false),
            Err(WebSocketError::InvalidState(_))
        ));

        conn.open(None, &mut RecordingHandler::default()).unwrap();
        assert!(matches!(
            conn.send_close(Some(CloseCode::Protocol), None),
            Err(WebSocketError::InvalidSendCloseCode(1002))
        ));
        assert!(matches!(
            conn.send_close(None, Some("why")),
            Err(WebSocketError::CloseReasonWithoutCode)
        ));
        assert!(matches!(
            conn.send_ping(&[0; 126]),
            Err(WebSocketError::ControlFrameTooLarge(126))
        ));
    }

    #[test]
    fn test_close_reason_is_truncated() {
        let (mut conn, _) = open(Role::Server, Options::default());
        let reason = "é".repeat(100);
        conn.send_close(Some(CloseCode::Iana(3000)), Some(&reason))
            .unwrap();

        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames[0].payload.len(), 2 + 122);
        assert_eq!(frames[0].close_reason().map(str::len), Some(122));
    }

    #[test]
    fn test_streaming_send() {
        let (mut conn, _) = open(Role::Server, Options::default());
        conn.begin_message(false, false).unwrap();
        assert!(matches!(
            conn.begin_message(false, false),
            Err(WebSocketError::InvalidStreamingState(_))
        ));
        assert!(matches!(
            conn.send_message_frame_data(b"x"),
            Err(WebSocketError::InvalidStreamingState(_))
        ));

        conn.begin_message_frame(5).unwrap();
        assert_eq!(conn.send_message_frame_data(b"He").unwrap(), 3);
        assert!(matches!(
            conn.end_message(),
            Err(WebSocketError::InvalidStreamingState(_))
        ));
        assert_eq!(conn.send_message_frame_data(b"llo!!").unwrap(), -2);
        conn.send_message_frame(b" world").unwrap();
        conn.end_message().unwrap();

        let frames = conn.transport_mut().take_frames();
        let shape: Vec<_> = frames
            .iter()
            .map(|f| (f.fin, f.opcode, f.payload.to_vec()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (false, OpCode::Text, b"Hello".to_vec()),
                (false, OpCode::Continuation, b" world".to_vec()),
                (true, OpCode::Continuation, Vec::new()),
            ]
        );
    }

    #[test]
    fn test_streaming_send_masked_across_calls() {
        let (mut conn, _) = open(Role::Client, Options::default());
        conn.begin_message(true, false).unwrap();
        conn.begin_message_frame(6).unwrap();
        assert_eq!(conn.send_message_frame_data(b"abc").unwrap(), 3);
        assert_eq!(conn.send_message_frame_data(b"def").unwrap(), 0);
        conn.end_message().unwrap();

        // an empty streamed message still carries its opcode
        conn.begin_message(false, false).unwrap();
        conn.end_message().unwrap();

        let frames = conn.transport_mut().take_frames();
        assert_eq!(&frames[0].payload[..], b"abcdef");
        assert_eq!(frames[0].opcode, OpCode::Binary);
        assert_eq!(frames[2].opcode, OpCode::Text);
        assert!(frames[2].fin);
    }

    /// Negotiates `offer` and returns the server and client codecs.
    fn pmce_pair(offer: Offer) -> (PerMessageCompress, PerMessageCompress) {
        let offers = [offer];
        let (accept, server) = negotiate_offers(&offers[0].to_string(), accept_first)
            .unwrap()
            .unwrap();
        let client = negotiate_response(&accept.to_string(), &offers)
            .unwrap()
            .unwrap();
        (server, client)
    }

    #[test]
    fn test_compressed_round_trip() {
        let (server_pmce, client_pmce) = pmce_pair(Offer::Deflate(Default::default()));
        let mut server = Connection::new(
            Role::Server,
            Options::default(),
            MemoryTransport::default(),
            VirtualClock::default(),
        );
        let mut client = Connection::new(
            Role::Client,
            Options::default(),
            MemoryTransport::default(),
            VirtualClock::default(),
        );
        let mut server_handler = RecordingHandler::default();
        let mut client_handler = RecordingHandler::default();
        server.open(Some(server_pmce), &mut server_handler).unwrap();
        client.open(Some(client_pmce), &mut client_handler).unwrap();

        let text = "compress me ".repeat(50);
        client.send_message(text.as_bytes(), false).unwrap();
        client
            .send_message_with(b"raw", true, 0, true)
            .unwrap();
        let wire = client.transport_mut().take_written();
        assert!(wire.len() < text.len());
        server.on_data(&wire, &mut server_handler).unwrap();

        server.begin_message(false, false).unwrap();
        server.send_message_frame(b"streamed ").unwrap();
        server.send_message_frame(b"and compressed").unwrap();
        server.end_message().unwrap();
        let frames = server.transport_mut().take_frames();
        assert!(frames[0].is_compressed());
        assert!(!frames[1].is_compressed());

        let mut wire = BytesMut::new();
        for frame in &frames {
            codec::encode(frame, &mut wire);
        }
        client.on_data(&wire, &mut client_handler).unwrap();

        assert_eq!(
            server_handler.messages(),
            vec![Bytes::from(text), Bytes::from_static(b"raw")]
        );
        assert_eq!(
            client_handler.messages(),
            vec![Bytes::from_static(b"streamed and compressed")]
        );
    }

    fn compress_all(pmce: &mut PerMessageCompress, payload: &[u8]) -> Vec<u8> {
        pmce.start_compress_message().unwrap();
        let mut wire = pmce.compress_message_data(payload).unwrap().to_vec();
        wire.extend_from_slice(&pmce.end_compress_message().unwrap());
        wire
    }

    #[test]
    fn test_compressed_message_too_big_fails_with_1009() {
        let offers = [
            Offer::Deflate(Default::default()),
            Offer::Bzip2(Default::default()),
            Offer::Brotli(Default::default()),
        ];
        for offer in offers {
            let name = offer.name();
            let (server_pmce, mut client_pmce) = pmce_pair(offer);
            let options = Options::default().with_max_message_payload_size(4096);
            let (mut conn, mut handler) = open_with(Role::Server, options, Some(server_pmce));

            let wire = compress_all(&mut client_pmce, &vec![0u8; 1 << 20]);
            assert!(wire.len() < 4096, "{name}: {} bytes on the wire", wire.len());

            let mut frame = client_frame(true, OpCode::Binary, &wire);
            frame[0] |= 0x40;
            let err = conn.on_data(&frame, &mut handler).unwrap_err();
            match err {
                WebSocketError::MessageTooBig(size) => {
                    assert!(size > 4096 && size < 64 << 10, "{name}: stopped at {size}");
                }
                other => panic!("{name}: unexpected {other:?}"),
            }

            let frames = conn.transport_mut().take_frames();
            assert_eq!(frames[0].close_code(), Some(CloseCode::Size), "{name}");
            assert!(handler.messages().is_empty());
        }
    }

    #[test]
    fn test_invalid_utf8_in_compressed_fragment_fails_before_final_frame() {
        let (server_pmce, mut client_pmce) = pmce_pair(Offer::Brotli(Default::default()));
        let (mut conn, mut handler) = open_with(Role::Server, Options::default(), Some(server_pmce));

        let mut text = b"valid prefix ".repeat(100);
        text.extend_from_slice(b"\xff\xfe");
        text.extend_from_slice(&b"never seen ".repeat(100));
        let wire = compress_all(&mut client_pmce, &text);

        let mut first = client_frame(false, OpCode::Text, &wire);
        first[0] |= 0x40;
        let err = conn.on_data(&first, &mut handler).unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidUTF8 { offset: 1300 }));

        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames[0].close_code(), Some(CloseCode::Invalid));
        assert!(handler.messages().is_empty());
    }

    #[test]
    fn test_traffic_stats_after_compressed_round_trip() {
        let (server_pmce, client_pmce) = pmce_pair(Offer::Deflate(Default::default()));
        let (mut server, mut server_handler) =
            open_with(Role::Server, Options::default(), Some(server_pmce));
        let (mut client, _) = open_with(Role::Client, Options::default(), Some(client_pmce));

        let text = "count me ".repeat(60);
        client.send_message(text.as_bytes(), false).unwrap();
        client.send_message_with(b"raw", true, 0, true).unwrap();
        client.send_ping(b"p").unwrap();
        let wire = client.transport_mut().take_written();

        // three masked frames with short headers
        let compressed = wire.len() - 3 * 6 - 3 - 1;
        assert!(compressed < text.len());

        let sent = *client.traffic_stats();
        assert_eq!(sent.outgoing_messages, 2);
        assert_eq!(sent.outgoing_frames, 2);
        assert_eq!(sent.outgoing_octets_app, text.len() as u64 + 3);
        assert_eq!(sent.outgoing_octets_websocket, compressed as u64 + 3);
        assert_eq!(sent.outgoing_octets_wire, wire.len() as u64);
        assert!(sent.outgoing_compression_ratio().is_some_and(|ratio| ratio < 1.0));

        server.on_data(&wire, &mut server_handler).unwrap();
        let received = *server.traffic_stats();
        assert_eq!(received.incoming_messages, 2);
        assert_eq!(received.incoming_frames, 2);
        assert_eq!(received.incoming_octets_app, text.len() as u64 + 3);
        assert_eq!(received.incoming_octets_websocket, compressed as u64 + 3);
        assert_eq!(received.incoming_octets_wire, wire.len() as u64);
        // the pong answering the ping
        assert_eq!(received.outgoing_octets_wire, 3);
        assert_eq!(received.outgoing_frames, 0);

        client.send_close(Some(CloseCode::Normal), None).unwrap();
        assert_eq!(client.traffic_stats().outgoing_octets_wire, wire.len() as u64);

        server.reset_traffic_stats();
        assert_eq!(*server.traffic_stats(), TrafficStats::default());
    }

    #[test]
    fn test_streaming_traffic_stats() {
        let (mut conn, _) = open(Role::Server, Options::default());
        conn.begin_message(true, false).unwrap();
        conn.begin_message_frame(4).unwrap();
        assert_eq!(conn.send_message_frame_data(b"abcdef").unwrap(), -2);
        conn.end_message().unwrap();

        let stats = conn.traffic_stats();
        assert_eq!(stats.outgoing_messages, 1);
        assert_eq!(stats.outgoing_frames, 2);
        assert_eq!(stats.outgoing_octets_app, 4);
        assert_eq!(stats.outgoing_octets_websocket, 4);
        assert_eq!(stats.outgoing_octets_wire, 2 + 4 + 2);
    }

    #[test]
    fn test_send_pong() {
        let (mut conn, _) = open(Role::Client, Options::default());
        conn.send_pong(b"unsolicited").unwrap();

        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Pong);
        assert!(frames[0].fin);
        assert!(frames[0].is_masked());
        assert_eq!(&frames[0].payload[..], b"unsolicited");

        assert!(matches!(
            conn.send_pong(&[0; 126]),
            Err(WebSocketError::ControlFrameTooLarge(126))
        ));
        conn.send_close(None, None).unwrap();
        assert!(matches!(
            conn.send_pong(b"late"),
            Err(WebSocketError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_compressed_frame_without_extension() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        let mut wire = client_frame(true, OpCode::Text, b"x");
        wire[0] |= 0x40;
        let err = conn.on_data(&wire, &mut handler).unwrap_err();
        assert!(matches!(err, WebSocketError::ReservedBitsNotZero(0b100)));
    }

    #[test]
    fn test_handler_error_is_reported() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        handler.fail_on_message = true;

        let mut wire = client_frame(true, OpCode::Text, b"one");
        wire.extend(client_frame(true, OpCode::Text, b"two"));
        let err = conn.on_data(&wire, &mut handler).unwrap_err();
        assert!(matches!(err, WebSocketError::Handler(_)));
        assert_eq!(handler.messages().len(), 2);
        assert_eq!(conn.phase(), Phase::Open);

        handler.fail_on_message = false;
        conn.on_data(&client_frame(true, OpCode::Text, b"three"), &mut handler)
            .unwrap();
    }

    struct Echo;

    impl Handler<MemoryTransport, VirtualClock> for Echo {
        fn on_message(&mut self, conn: &mut Conn, payload: Bytes, is_binary: bool) -> HandlerResult {
            if &payload[..] == b"close" {
                conn.send_close(Some(CloseCode::Normal), Some("asked to"))?;
            } else {
                conn.send_message(&payload, is_binary)?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_handler_answers_from_callback() {
        let mut conn = Connection::new(
            Role::Server,
            Options::default(),
            MemoryTransport::default(),
            VirtualClock::default(),
        );
        conn.open(None, &mut Echo).unwrap();

        let mut wire = client_frame(true, OpCode::Text, b"echo");
        wire.extend(client_frame(true, OpCode::Text, b"close"));
        wire.extend(client_frame(true, OpCode::Text, b"ignored"));
        conn.on_data(&wire, &mut Echo).unwrap();

        let frames = conn.transport_mut().take_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].payload[..], b"echo");
        assert_eq!(frames[1].close_reason(), Some("asked to"));
    }

    #[test]
    fn test_flow_control() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        let flow = ManualFlow::default();
        conn.register_producer(Box::new(flow.clone()));

        conn.pause_producing();
        conn.pause_producing();
        assert!(conn.is_paused());
        assert!(flow.is_paused());
        conn.resume_producing();
        assert!(!conn.is_paused());

        conn.connection_lost(None, &mut handler).unwrap();
        assert_eq!(
            flow.events(),
            vec![FlowEvent::Pause, FlowEvent::Resume, FlowEvent::Stop]
        );
        assert!(conn.unregister_producer().is_some());
    }

    #[test]
    fn test_open_twice() {
        let (mut conn, mut handler) = open(Role::Server, Options::default());
        assert!(matches!(
            conn.open(None, &mut handler),
            Err(WebSocketError::InvalidState("open"))
        ));
    }
}
