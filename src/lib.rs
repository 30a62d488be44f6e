//! # wsengine
//! A sans-I/O implementation of the WebSocket protocol (RFC 6455) together with the
//! per-message compression extensions permessage-deflate (RFC 7692), permessage-bzip2
//! and permessage-brotli.
//!
//! The engine never touches a socket. It is driven by two events, "bytes arrived"
//! ([`Connection::on_data`]) and "timer fired" ([`Connection::on_timer`]), and talks
//! back to the outside world through three injected capabilities:
//!
//! - [`Transport`]: writes serialized frames and tears down the underlying connection.
//! - [`Clock`]: schedules and cancels one-shot timers (closing handshake, auto-ping).
//! - [`Flow`]: pauses and resumes a streaming producer when the transport is saturated.
//!
//! Application code implements [`Handler`] and receives `on_open`, `on_message`,
//! `on_ping`, `on_pong` and `on_close` callbacks. Every callback gets a mutable
//! reference to the connection so it can answer with `send_*` calls.
//!
//! # Features
//!
//! - `zlib` (default): uses the zlib-rs backend of flate2, which enables
//!   `client_max_window_bits` / `server_max_window_bits` control for permessage-deflate.
//!
//! - `logging`: enables debug logging for negotiation, connection failures and the
//!   closing handshake through the `log` crate.
//!
//! - `simd`: accelerates one-shot UTF-8 checks (close reasons) using `simdutf8`.
//!
//! # Example
//! ```rust
//! use wsengine::{
//!     testing::{MemoryTransport, VirtualClock},
//!     Connection, Handler, HandlerResult, Options, Role,
//! };
//!
//! struct Echo;
//!
//! impl Handler<MemoryTransport, VirtualClock> for Echo {
//!     fn on_message(
//!         &mut self,
//!         conn: &mut Connection<MemoryTransport, VirtualClock>,
//!         payload: bytes::Bytes,
//!         is_binary: bool,
//!     ) -> HandlerResult {
//!         conn.send_message(&payload, is_binary)?;
//!         Ok(())
//!     }
//! }
//!
//! let mut conn = Connection::new(
//!     Role::Server,
//!     Options::default(),
//!     MemoryTransport::default(),
//!     VirtualClock::default(),
//! );
//! let mut handler = Echo;
//! conn.open(None, &mut handler).unwrap();
//!
//! // masked text frame "Hi" from a client
//! conn.on_data(&[0x81, 0x82, 0, 0, 0, 0, b'H', b'i'], &mut handler).unwrap();
//! assert_eq!(conn.transport_mut().take_written(), vec![0x81, 0x02, b'H', b'i']);
//! ```
//!
//! # Memory Safety
//! - Optional frame and message size limits, checked against the announced frame
//!   length before any payload is buffered. Decompression stops as soon as a
//!   message grows past the limit.
//! - Text payloads are validated incrementally so invalid UTF-8 fails the connection
//!   at the offending byte, not at the end of the message.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod close;
pub mod clock;
pub mod codec;
pub mod connection;
pub mod extensions;
pub mod flow;
pub mod frame;
mod mask;
pub mod options;
pub mod reassembler;
pub mod stats;
pub mod testing;
pub mod utf8;

use thiserror::Error;

pub use clock::{Clock, Timer, TimerHandle};
pub use close::CloseCode;
pub use connection::{Connection, ConnectionState, Handler, HandlerResult, Phase, Transport};
pub use flow::Flow;
pub use frame::{Frame, FrameHeader, OpCode, Rsv};
pub use mask::{apply_mask, apply_mask_offset};
pub use options::Options;
pub use stats::TrafficStats;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Boxed error returned by application callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The role the engine is taking.
///
/// A client masks every frame it sends and expects unmasked frames back. A server does
/// the opposite and is responsible for dropping the TCP connection once the closing
/// handshake completes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// Returns `true` for [`Role::Server`].
    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, Role::Server)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Represents errors that can occur while driving the protocol engine.
///
/// The errors are broadly categorized into:
///
/// - Protocol violations (malformed headers, illegal reserved bits, bad fragmentation,
///   disallowed close codes), failing the connection with close code 1002
/// - Invalid payload data (invalid UTF-8 in text messages or close reasons), failing with 1007
/// - Size policy violations (frame or message larger than configured), failing with 1009
/// - Extension negotiation errors, which prevent the connection from opening
/// - Misuse of the API, like sending on a connection that is not open
///
/// [`WebSocketError::close_code`] maps each variant to the close code used when the
/// engine fails the connection because of it.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Receiving a new text or binary frame while a fragmented message is still in progress.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Invalid UTF-8 in a text message or close reason. `offset` is the position in the
    /// payload where the offending code point sequence starts.
    #[error("Invalid UTF-8 at payload octet {offset}")]
    InvalidUTF8 { offset: usize },

    /// A text message ended in the middle of a multi-byte code point.
    #[error("Text message ended within a code point at payload octet {offset}")]
    IncompleteUTF8 { offset: usize },

    /// A continuation frame arrived without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Continuation frames must not carry the compression bit.
    #[error("Continuation frame with compression bit set")]
    CompressedContinuationFrame,

    /// Returned when attempting to operate on a closed connection.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The operation is not valid in the connection's current phase.
    #[error("Operation not permitted while connection is {0}")]
    InvalidState(&'static str),

    /// A close frame with a payload of exactly one byte.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carrying a status code outside the allowed set.
    #[error("Invalid close code {0}")]
    InvalidCloseCode(u16),

    /// The application tried to send a close code other than 1000 or 3000-4999.
    #[error("Close code {0} may not be sent by an application")]
    InvalidSendCloseCode(u16),

    /// The application supplied a close reason without a close code.
    #[error("Close reason requires a close code")]
    CloseReasonWithoutCode,

    /// Reserved bits set without a negotiated extension defining them.
    #[error("Reserved bits are not zero (rsv={0:#05b})")]
    ReservedBitsNotZero(u8),

    /// A control frame with the FIN bit cleared.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame with a payload larger than 125 bytes.
    #[error("Control frame payload too large ({0} bytes)")]
    ControlFrameTooLarge(u64),

    /// A control frame with the compression bit set.
    #[error("Control frame must not be compressed")]
    CompressedControlFrame,

    /// An extended payload length that could have been encoded in fewer bytes.
    #[error("Payload length {0} not using minimal length encoding")]
    NonMinimalLength(u64),

    /// A 64-bit payload length with the most significant bit set.
    #[error("Invalid payload length {0:#x}")]
    InvalidPayloadLength(u64),

    /// A frame's payload length exceeds the configured limit.
    #[error("Frame too large ({0} bytes)")]
    FrameTooLarge(u64),

    /// A message's total payload exceeds the configured limit.
    #[error("Message too large ({0} bytes)")]
    MessageTooBig(u64),

    /// A server received an unmasked frame from a client.
    #[error("Unmasked client-to-server frame")]
    UnmaskedFrame,

    /// A client received a masked frame from a server.
    #[error("Masked server-to-client frame")]
    MaskedFrame,

    /// A frame with a reserved opcode.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A compressed frame on a connection where no compression was negotiated.
    #[error("Received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// A compressed payload failed to decompress, or compression itself failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Malformed or incompatible `Sec-WebSocket-Extensions` parameters.
    #[error("Extension negotiation failed: {0}")]
    ExtensionNegotiation(String),

    /// A streaming send call that does not fit the current streaming state.
    #[error("Invalid streaming state: {0}")]
    InvalidStreamingState(&'static str),

    /// An error returned by an application callback.
    #[error("Handler error: {0}")]
    Handler(#[source] BoxError),

    /// Wraps standard I/O errors.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl WebSocketError {
    /// The close code the engine sends when failing a connection because of this error.
    ///
    /// Returns `None` for errors that do not originate from the peer.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::InvalidUTF8 { .. } | Self::IncompleteUTF8 { .. } | Self::Compression(_) => {
                Some(CloseCode::Invalid)
            }
            Self::FrameTooLarge(_) | Self::MessageTooBig(_) => Some(CloseCode::Size),
            Self::InvalidFragment
            | Self::InvalidContinuationFrame
            | Self::CompressedContinuationFrame
            | Self::InvalidCloseFrame
            | Self::InvalidCloseCode(_)
            | Self::ReservedBitsNotZero(_)
            | Self::ControlFrameFragmented
            | Self::ControlFrameTooLarge(_)
            | Self::CompressedControlFrame
            | Self::NonMinimalLength(_)
            | Self::InvalidPayloadLength(_)
            | Self::UnmaskedFrame
            | Self::MaskedFrame
            | Self::InvalidOpCode(_)
            | Self::CompressionNotSupported => Some(CloseCode::Protocol),
            Self::ConnectionClosed
            | Self::InvalidState(_)
            | Self::InvalidSendCloseCode(_)
            | Self::CloseReasonWithoutCode
            | Self::ExtensionNegotiation(_)
            | Self::InvalidStreamingState(_)
            | Self::Handler(_)
            | Self::IoError(_) => None,
        }
    }
}
