use std::time::Duration;

/// Configuration of a [`Connection`](crate::Connection).
///
/// All limits use `0` for "unlimited". Options are plain data, set them directly or
/// through the `with_*` builders:
///
/// ```rust
/// use std::time::Duration;
/// use wsengine::Options;
///
/// let options = Options::default()
///     .with_max_message_payload_size(1 << 20)
///     .with_auto_ping(Duration::from_secs(30), Duration::from_secs(10))
///     .with_echo_close_code_reason();
/// assert_eq!(options.auto_ping_size, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Validate incoming text messages and close reasons as UTF-8.
    ///
    /// Default: `true`
    pub utf8_validate_incoming: bool,

    /// A server fails the connection when a client frame arrives unmasked.
    ///
    /// Default: `true`
    pub require_masked_client_frames: bool,

    /// A client tolerates masked frames from a server instead of failing.
    ///
    /// Default: `false`
    pub accept_masked_server_frames: bool,

    /// A server masks the frames it sends. Only useful for testing peers.
    ///
    /// Default: `false`
    pub mask_server_frames: bool,

    /// Apply masking keys to payloads. Turning this off sends the masking key but leaves
    /// the payload in the clear, which only a testing peer would want.
    ///
    /// Default: `true`
    pub apply_mask: bool,

    /// Maximum payload of a single incoming frame.
    ///
    /// Default: `0`
    pub max_frame_payload_size: usize,

    /// Maximum payload of a complete incoming message, after decompression.
    ///
    /// Default: `0`
    pub max_message_payload_size: usize,

    /// Outgoing messages larger than this are split into frames of this size.
    ///
    /// Default: `0`
    pub auto_fragment_size: usize,

    /// Fail the connection by dropping the transport instead of sending a close frame.
    ///
    /// Default: `false`
    pub fail_by_drop: bool,

    /// Echo the peer's close code and reason instead of answering with a plain 1000.
    ///
    /// Default: `false`
    pub echo_close_code_reason: bool,

    /// How long to wait for the peer's close frame after sending ours. `None` waits
    /// forever.
    ///
    /// Default: 1 second
    pub close_handshake_timeout: Option<Duration>,

    /// How long a client waits for the server to drop the TCP connection after the
    /// closing handshake. `None` waits forever.
    ///
    /// Default: 1 second
    pub server_connection_drop_timeout: Option<Duration>,

    /// Interval between automatic pings. `None` disables them.
    ///
    /// Default: `None`
    pub auto_ping_interval: Option<Duration>,

    /// How long to wait for the pong answering an automatic ping. `None` never times out.
    ///
    /// Default: `None`
    pub auto_ping_timeout: Option<Duration>,

    /// Payload size of automatic pings, 4 to 125 bytes.
    ///
    /// Default: `4`
    pub auto_ping_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            utf8_validate_incoming: true,
            require_masked_client_frames: true,
            accept_masked_server_frames: false,
            mask_server_frames: false,
            apply_mask: true,
            max_frame_payload_size: 0,
            max_message_payload_size: 0,
            auto_fragment_size: 0,
            fail_by_drop: false,
            echo_close_code_reason: false,
            close_handshake_timeout: Some(Duration::from_secs(1)),
            server_connection_drop_timeout: Some(Duration::from_secs(1)),
            auto_ping_interval: None,
            auto_ping_timeout: None,
            auto_ping_size: 4,
        }
    }
}

impl Options {
    /// Disables UTF-8 validation of incoming text.
    pub fn without_utf8(self) -> Self {
        Self {
            utf8_validate_incoming: false,
            ..self
        }
    }

    /// Lets a server accept unmasked frames.
    pub fn with_unmasked_client_frames(self) -> Self {
        Self {
            require_masked_client_frames: false,
            ..self
        }
    }

    /// Lets a client accept masked frames.
    pub fn with_masked_server_frames(self) -> Self {
        Self {
            accept_masked_server_frames: true,
            ..self
        }
    }

    /// Makes a server mask what it sends.
    pub fn with_mask_server_frames(self) -> Self {
        Self {
            mask_server_frames: true,
            ..self
        }
    }

    /// Sends masking keys without applying them.
    pub fn without_apply_mask(self) -> Self {
        Self {
            apply_mask: false,
            ..self
        }
    }

    pub fn with_max_frame_payload_size(self, size: usize) -> Self {
        Self {
            max_frame_payload_size: size,
            ..self
        }
    }

    pub fn with_max_message_payload_size(self, size: usize) -> Self {
        Self {
            max_message_payload_size: size,
            ..self
        }
    }

    pub fn with_auto_fragment_size(self, size: usize) -> Self {
        Self {
            auto_fragment_size: size,
            ..self
        }
    }

    pub fn with_fail_by_drop(self) -> Self {
        Self {
            fail_by_drop: true,
            ..self
        }
    }

    pub fn with_echo_close_code_reason(self) -> Self {
        Self {
            echo_close_code_reason: true,
            ..self
        }
    }

    pub fn with_close_handshake_timeout(self, timeout: Option<Duration>) -> Self {
        Self {
            close_handshake_timeout: timeout,
            ..self
        }
    }

    pub fn with_server_connection_drop_timeout(self, timeout: Option<Duration>) -> Self {
        Self {
            server_connection_drop_timeout: timeout,
            ..self
        }
    }

    /// Enables automatic pings every `interval`, failing the connection if a pong does
    /// not arrive within `timeout`.
    pub fn with_auto_ping(self, interval: Duration, timeout: Duration) -> Self {
        Self {
            auto_ping_interval: Some(interval),
            auto_ping_timeout: Some(timeout),
            ..self
        }
    }

    /// Sets the automatic ping payload size, clamped to 4..=125.
    pub fn with_auto_ping_size(self, size: usize) -> Self {
        Self {
            auto_ping_size: size.clamp(4, crate::frame::MAX_CONTROL_PAYLOAD),
            ..self
        }
    }
}
