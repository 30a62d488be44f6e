//! Traffic accounting of a connection.
//!
//! Octets are counted on three levels:
//! - **wire**: everything written to or read from the transport while open, headers
//!   and control frames included
//! - **websocket**: data frame payloads as they travel, compressed when an
//!   extension is active
//! - **app**: data frame payloads as the application sees them
//!
//! Comparing the levels gives the compression ratio and the framing overhead.
use std::fmt;

/// Counters kept by [`Connection`](crate::Connection) while it is open.
///
/// Only data frames count at the websocket and app levels. Nothing is counted before
/// [`Connection::open`](crate::Connection::open) or once the closing handshake started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub outgoing_octets_wire: u64,
    pub outgoing_octets_websocket: u64,
    pub outgoing_octets_app: u64,
    pub outgoing_frames: u64,
    pub outgoing_messages: u64,

    pub incoming_octets_wire: u64,
    pub incoming_octets_websocket: u64,
    pub incoming_octets_app: u64,
    pub incoming_frames: u64,
    pub incoming_messages: u64,
}

impl TrafficStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Compressed size over uncompressed size of everything sent.
    pub fn outgoing_compression_ratio(&self) -> Option<f64> {
        ratio(self.outgoing_octets_websocket, self.outgoing_octets_app)
    }

    /// Compressed size over uncompressed size of everything received.
    pub fn incoming_compression_ratio(&self) -> Option<f64> {
        ratio(self.incoming_octets_websocket, self.incoming_octets_app)
    }

    /// Non-payload octets per payload octet sent.
    pub fn outgoing_overhead(&self) -> Option<f64> {
        ratio(
            self.outgoing_octets_wire
                .saturating_sub(self.outgoing_octets_websocket),
            self.outgoing_octets_websocket,
        )
    }

    /// Non-payload octets per payload octet received.
    pub fn incoming_overhead(&self) -> Option<f64> {
        ratio(
            self.incoming_octets_wire
                .saturating_sub(self.incoming_octets_websocket),
            self.incoming_octets_websocket,
        )
    }
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

impl fmt::Display for TrafficStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "out: {} wire / {} websocket / {} app octets, {} frames, {} messages; \
             in: {} wire / {} websocket / {} app octets, {} frames, {} messages",
            self.outgoing_octets_wire,
            self.outgoing_octets_websocket,
            self.outgoing_octets_app,
            self.outgoing_frames,
            self.outgoing_messages,
            self.incoming_octets_wire,
            self.incoming_octets_websocket,
            self.incoming_octets_app,
            self.incoming_frames,
            self.incoming_messages,
        )
    }
}
