//! `permessage-deflate` as defined in [RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692).
//!
//! Negotiable parameters:
//!
//! - `server_no_context_takeover` / `client_no_context_takeover`: the named side starts
//!   every message with an empty LZ77 window.
//! - `server_max_window_bits` / `client_max_window_bits`: the named side's LZ77 window
//!   size, 8 to 15 bits. In an offer, `client_max_window_bits` may be a bare flag meaning
//!   the client supports the parameter.
//!
//! Window sizes are only honoured when the `zlib` feature is enabled. Raw deflate does
//! not support an 8 bit window, so 8 is raised to 9.
use std::{fmt, ops::RangeInclusive};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::{FlushCompress, FlushDecompress, Status};

use super::{check_unique, illegal_param, negotiation_error, parse_flag, parse_int, ExtensionParams};
use crate::{Result, WebSocketError};

pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Type alias for the compression level used by the deflate compressor.
pub type CompressionLevel = flate2::Compression;

const WINDOW_BITS: RangeInclusive<u8> = 8..=15;
const MEM_LEVEL: RangeInclusive<u8> = 1..=9;
const DEFAULT_WINDOW_BITS: u8 = 15;
const DEFAULT_MEM_LEVEL: u8 = 8;

/// Empty stored block emitted by a sync flush, stripped from every compressed message.
const TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

fn check_window_bits(what: &str, bits: u8) -> Result<()> {
    if bits != 0 && !WINDOW_BITS.contains(&bits) {
        return Err(negotiation_error(format!(
            "invalid value {bits} for {what} - permissible values 8-15"
        )));
    }
    Ok(())
}

/// A `permessage-deflate` offer, sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateOffer {
    /// The client supports `client_no_context_takeover`.
    pub accept_no_context_takeover: bool,
    /// The client supports `client_max_window_bits`.
    pub accept_max_window_bits: bool,
    /// The client asks the server not to take over context.
    pub request_no_context_takeover: bool,
    /// The client asks the server to use at most this window, 0 for no request.
    pub request_max_window_bits: u8,
}

impl Default for DeflateOffer {
    fn default() -> Self {
        Self {
            accept_no_context_takeover: true,
            accept_max_window_bits: true,
            request_no_context_takeover: false,
            request_max_window_bits: 0,
        }
    }
}

impl DeflateOffer {
    /// Creates an offer, validating `request_max_window_bits`.
    pub fn new(
        accept_no_context_takeover: bool,
        accept_max_window_bits: bool,
        request_no_context_takeover: bool,
        request_max_window_bits: u8,
    ) -> Result<Self> {
        check_window_bits("request_max_window_bits", request_max_window_bits)?;
        Ok(Self {
            accept_no_context_takeover,
            accept_max_window_bits,
            request_no_context_takeover,
            request_max_window_bits,
        })
    }

    /// Parses the offer parameters received by a server.
    pub fn parse(params: &ExtensionParams) -> Result<Self> {
        check_unique(EXTENSION_NAME, params)?;

        let mut offer = Self {
            accept_no_context_takeover: false,
            accept_max_window_bits: false,
            request_no_context_takeover: false,
            request_max_window_bits: 0,
        };

        for (key, value) in params {
            let value = value.as_deref();
            match key.as_str() {
                "client_max_window_bits" => {
                    // a value is only a hint from the client
                    if value.is_some() {
                        parse_int(EXTENSION_NAME, key, value, WINDOW_BITS)?;
                    }
                    offer.accept_max_window_bits = true;
                }
                "client_no_context_takeover" => {
                    parse_flag(EXTENSION_NAME, key, value)?;
                    offer.accept_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    offer.request_max_window_bits =
                        parse_int(EXTENSION_NAME, key, value, WINDOW_BITS)?;
                }
                "server_no_context_takeover" => {
                    parse_flag(EXTENSION_NAME, key, value)?;
                    offer.request_no_context_takeover = true;
                }
                _ => return Err(illegal_param(EXTENSION_NAME, key)),
            }
        }

        Ok(offer)
    }
}

impl fmt::Display for DeflateOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{EXTENSION_NAME}")?;
        if self.accept_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        if self.accept_max_window_bits {
            write!(f, "; client_max_window_bits")?;
        }
        if self.request_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.request_max_window_bits != 0 {
            write!(f, "; server_max_window_bits={}", self.request_max_window_bits)?;
        }
        Ok(())
    }
}

/// Server-side settings used to accept a [`DeflateOffer`].
///
/// ```rust
/// use wsengine::extensions::{DeflateAcceptOptions, DeflateOffer, DeflateOfferAccept};
///
/// let options = DeflateAcceptOptions {
///     request_no_context_takeover: true,
///     ..Default::default()
/// };
/// let accept = DeflateOfferAccept::new(DeflateOffer::default(), options).unwrap();
/// assert_eq!(accept.to_string(), "permessage-deflate; client_no_context_takeover");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeflateAcceptOptions {
    /// Ask the client not to take over context. Requires client support.
    pub request_no_context_takeover: bool,
    /// Ask the client to use at most this window, 0 for no request. Requires client support.
    pub request_max_window_bits: u8,
    /// Override the server's own context takeover. Cannot undo a client request.
    pub no_context_takeover: Option<bool>,
    /// Override the server's own window. Cannot exceed what the client requested.
    pub window_bits: Option<u8>,
    /// zlib memory level for the server's compressor, 1 to 9.
    pub mem_level: Option<u8>,
    /// Upper bound on the decompressed size of a single message.
    pub max_message_size: Option<usize>,
    /// Compression level of the server's compressor.
    pub level: CompressionLevel,
}

/// A server's acceptance of a [`DeflateOffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateOfferAccept {
    pub offer: DeflateOffer,
    pub options: DeflateAcceptOptions,
}

impl DeflateOfferAccept {
    /// Validates `options` against `offer`.
    pub fn new(offer: DeflateOffer, options: DeflateAcceptOptions) -> Result<Self> {
        if options.request_no_context_takeover && !offer.accept_no_context_takeover {
            return Err(negotiation_error(
                "invalid value true for request_no_context_takeover - feature unsupported by client",
            ));
        }

        check_window_bits("request_max_window_bits", options.request_max_window_bits)?;
        if options.request_max_window_bits != 0 && !offer.accept_max_window_bits {
            return Err(negotiation_error(format!(
                "invalid value {} for request_max_window_bits - feature unsupported by client",
                options.request_max_window_bits
            )));
        }

        if options.no_context_takeover == Some(false) && offer.request_no_context_takeover {
            return Err(negotiation_error(
                "invalid value false for no_context_takeover - client requested feature",
            ));
        }

        if let Some(bits) = options.window_bits {
            if !WINDOW_BITS.contains(&bits) {
                return Err(negotiation_error(format!(
                    "invalid value {bits} for window_bits - permissible values 8-15"
                )));
            }
            if offer.request_max_window_bits != 0 && bits > offer.request_max_window_bits {
                return Err(negotiation_error(format!(
                    "invalid value {bits} for window_bits - client requested lower maximum value"
                )));
            }
        }

        if let Some(level) = options.mem_level {
            if !MEM_LEVEL.contains(&level) {
                return Err(negotiation_error(format!(
                    "invalid value {level} for mem_level - permissible values 1-9"
                )));
            }
        }

        Ok(Self { offer, options })
    }
}

impl fmt::Display for DeflateOfferAccept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{EXTENSION_NAME}")?;
        if self.offer.request_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.offer.request_max_window_bits != 0 {
            write!(f, "; server_max_window_bits={}", self.offer.request_max_window_bits)?;
        }
        if self.options.request_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        if self.options.request_max_window_bits != 0 {
            write!(f, "; client_max_window_bits={}", self.options.request_max_window_bits)?;
        }
        Ok(())
    }
}

/// A `permessage-deflate` response, sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeflateResponse {
    pub client_max_window_bits: u8,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: u8,
    pub server_no_context_takeover: bool,
}

impl DeflateResponse {
    /// Parses the response parameters received by a client.
    pub fn parse(params: &ExtensionParams) -> Result<Self> {
        check_unique(EXTENSION_NAME, params)?;

        let mut response = Self::default();
        for (key, value) in params {
            let value = value.as_deref();
            match key.as_str() {
                "client_max_window_bits" => {
                    response.client_max_window_bits =
                        parse_int(EXTENSION_NAME, key, value, WINDOW_BITS)?;
                }
                "client_no_context_takeover" => {
                    parse_flag(EXTENSION_NAME, key, value)?;
                    response.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    response.server_max_window_bits =
                        parse_int(EXTENSION_NAME, key, value, WINDOW_BITS)?;
                }
                "server_no_context_takeover" => {
                    parse_flag(EXTENSION_NAME, key, value)?;
                    response.server_no_context_takeover = true;
                }
                _ => return Err(illegal_param(EXTENSION_NAME, key)),
            }
        }

        Ok(response)
    }
}

impl fmt::Display for DeflateResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{EXTENSION_NAME}")?;
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.server_max_window_bits != 0 {
            write!(f, "; server_max_window_bits={}", self.server_max_window_bits)?;
        }
        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        if self.client_max_window_bits != 0 {
            write!(f, "; client_max_window_bits={}", self.client_max_window_bits)?;
        }
        Ok(())
    }
}

/// A client's acceptance of a [`DeflateResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateResponseAccept {
    pub response: DeflateResponse,
    /// Override the client's own context takeover. Cannot undo a server request.
    pub no_context_takeover: Option<bool>,
    /// Override the client's own window. Cannot exceed what the server requested.
    pub window_bits: Option<u8>,
    pub mem_level: Option<u8>,
    pub max_message_size: Option<usize>,
    pub level: CompressionLevel,
}

impl DeflateResponseAccept {
    /// Validates the overrides against `response`.
    pub fn new(
        response: DeflateResponse,
        no_context_takeover: Option<bool>,
        window_bits: Option<u8>,
        mem_level: Option<u8>,
    ) -> Result<Self> {
        if no_context_takeover == Some(false) && response.client_no_context_takeover {
            return Err(negotiation_error(
                "invalid value false for no_context_takeover - server requested feature",
            ));
        }

        if let Some(bits) = window_bits {
            if !WINDOW_BITS.contains(&bits) {
                return Err(negotiation_error(format!(
                    "invalid value {bits} for window_bits - permissible values 8-15"
                )));
            }
            if response.client_max_window_bits != 0 && bits > response.client_max_window_bits {
                return Err(negotiation_error(format!(
                    "invalid value {bits} for window_bits - server requested lower maximum value"
                )));
            }
        }

        if let Some(level) = mem_level {
            if !MEM_LEVEL.contains(&level) {
                return Err(negotiation_error(format!(
                    "invalid value {level} for mem_level - permissible values 1-9"
                )));
            }
        }

        Ok(Self {
            response,
            no_context_takeover,
            window_bits,
            mem_level,
            max_message_size: None,
            level: CompressionLevel::default(),
        })
    }

    /// Limits the decompressed size of a single message.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = Some(max);
        self
    }
}

impl fmt::Display for DeflateResponseAccept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.response, f)
    }
}

/// The `permessage-deflate` codec of one connection.
pub struct PerMessageDeflate {
    is_server: bool,
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    server_max_window_bits: u8,
    client_max_window_bits: u8,
    mem_level: u8,
    level: CompressionLevel,
    max_message_size: Option<usize>,
    compressor: Option<Deflate>,
    decompressor: Option<Inflate>,
    /// Decompressed bytes of the current message.
    decompressed: usize,
}

impl fmt::Debug for PerMessageDeflate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerMessageDeflate")
            .field("is_server", &self.is_server)
            .field("server_no_context_takeover", &self.server_no_context_takeover)
            .field("client_no_context_takeover", &self.client_no_context_takeover)
            .field("server_max_window_bits", &self.server_max_window_bits)
            .field("client_max_window_bits", &self.client_max_window_bits)
            .field("mem_level", &self.mem_level)
            .finish()
    }
}

impl PerMessageDeflate {
    #[allow(clippy::too_many_arguments)]
    fn new(
        is_server: bool,
        server_no_context_takeover: bool,
        client_no_context_takeover: bool,
        server_max_window_bits: u8,
        client_max_window_bits: u8,
        mem_level: Option<u8>,
        level: CompressionLevel,
        max_message_size: Option<usize>,
    ) -> Self {
        let window = |bits: u8| if bits == 0 { DEFAULT_WINDOW_BITS } else { bits };
        Self {
            is_server,
            server_no_context_takeover,
            client_no_context_takeover,
            server_max_window_bits: window(server_max_window_bits),
            client_max_window_bits: window(client_max_window_bits),
            mem_level: mem_level.unwrap_or(DEFAULT_MEM_LEVEL),
            level,
            max_message_size,
            compressor: None,
            decompressor: None,
            decompressed: 0,
        }
    }

    pub fn create_from_offer_accept(is_server: bool, accept: &DeflateOfferAccept) -> Self {
        let options = &accept.options;
        Self::new(
            is_server,
            options
                .no_context_takeover
                .unwrap_or(accept.offer.request_no_context_takeover),
            options.request_no_context_takeover,
            options
                .window_bits
                .unwrap_or(accept.offer.request_max_window_bits),
            options.request_max_window_bits,
            options.mem_level,
            options.level,
            options.max_message_size,
        )
    }

    pub fn create_from_response_accept(is_server: bool, accept: &DeflateResponseAccept) -> Self {
        Self::new(
            is_server,
            accept.response.server_no_context_takeover,
            accept
                .no_context_takeover
                .unwrap_or(accept.response.client_no_context_takeover),
            accept.response.server_max_window_bits,
            accept
                .window_bits
                .unwrap_or(accept.response.client_max_window_bits),
            accept.mem_level,
            accept.level,
            accept.max_message_size,
        )
    }

    /// Caps the decompressed size of a message, keeping a smaller existing limit.
    pub fn limit_message_size(&mut self, max: usize) {
        self.max_message_size = Some(self.max_message_size.map_or(max, |limit| limit.min(max)));
    }

    /// Context takeover flag and window of the compressing direction.
    fn outgoing(&self) -> (bool, u8) {
        if self.is_server {
            (self.server_no_context_takeover, self.server_max_window_bits)
        } else {
            (self.client_no_context_takeover, self.client_max_window_bits)
        }
    }

    /// Context takeover flag and window of the decompressing direction.
    fn incoming(&self) -> (bool, u8) {
        if self.is_server {
            (self.client_no_context_takeover, self.client_max_window_bits)
        } else {
            (self.server_no_context_takeover, self.server_max_window_bits)
        }
    }

    pub fn start_compress_message(&mut self) -> Result<()> {
        let (no_context_takeover, window_bits) = self.outgoing();
        if self.compressor.is_none() || no_context_takeover {
            self.compressor = Some(Deflate::new(self.level, window_bits));
        }
        Ok(())
    }

    pub fn compress_message_data(&mut self, data: &[u8]) -> Result<Bytes> {
        let compressor = self
            .compressor
            .as_mut()
            .ok_or_else(|| compression_error("no message is being compressed"))?;
        compressor.write(data)?;
        Ok(compressor.output.split().freeze())
    }

    pub fn end_compress_message(&mut self) -> Result<Bytes> {
        let compressor = self
            .compressor
            .as_mut()
            .ok_or_else(|| compression_error("no message is being compressed"))?;
        compressor.flush(None)
    }

    pub fn start_decompress_message(&mut self) -> Result<()> {
        let (no_context_takeover, window_bits) = self.incoming();
        match &mut self.decompressor {
            Some(decompressor) if !no_context_takeover => decompressor.fed = false,
            _ => self.decompressor = Some(Inflate::new(window_bits)),
        }
        self.decompressed = 0;
        Ok(())
    }

    pub fn decompress_message_data(&mut self, data: &[u8]) -> Result<Bytes> {
        let budget = self.budget();
        let decompressor = self
            .decompressor
            .as_mut()
            .ok_or_else(|| compression_error("no message is being decompressed"))?;
        decompressor.write(data, budget)?;
        let output = decompressor.output.split().freeze();
        self.account(output.len())?;
        Ok(output)
    }

    pub fn end_decompress_message(&mut self) -> Result<Bytes> {
        let budget = self.budget();
        let decompressor = self
            .decompressor
            .as_mut()
            .ok_or_else(|| compression_error("no message is being decompressed"))?;
        if decompressor.fed {
            // RFC 7692, Section 7.2.2
            decompressor.write(&TRAILER, budget)?;
        }
        let output = decompressor.flush(budget)?;
        self.account(output.len())?;
        Ok(output)
    }

    /// Output the current message may still produce before it is too big.
    fn budget(&self) -> Option<usize> {
        self.max_message_size
            .map(|max| max.saturating_sub(self.decompressed))
    }

    fn account(&mut self, produced: usize) -> Result<()> {
        self.decompressed += produced;
        match self.max_message_size {
            Some(max) if self.decompressed > max => {
                Err(WebSocketError::MessageTooBig(self.decompressed as u64))
            }
            _ => Ok(()),
        }
    }
}

fn compression_error(msg: impl fmt::Display) -> WebSocketError {
    WebSocketError::Compression(msg.to_string())
}

/// Streaming raw deflate compressor.
struct Deflate {
    output: BytesMut,
    compress: flate2::Compress,
}

impl Deflate {
    fn new(level: CompressionLevel, window_bits: u8) -> Self {
        #[cfg(feature = "zlib")]
        let compress = flate2::Compress::new_with_window_bits(level, false, window_bits.max(9));
        #[cfg(not(feature = "zlib"))]
        let compress = {
            let _ = window_bits;
            flate2::Compress::new(level, false)
        };

        Self {
            output: BytesMut::with_capacity(1024),
            compress,
        }
    }

    /// Feeds `input` to the compressor without flushing.
    fn write(&mut self, mut input: &[u8]) -> Result<()> {
        while !input.is_empty() {
            let dst = chunk(&mut self.output);

            let before_out = self.compress.total_out();
            let before_in = self.compress.total_in();

            let status = self.compress.compress(input, dst, FlushCompress::None);

            let written = (self.compress.total_out() - before_out) as usize;
            let consumed = (self.compress.total_in() - before_in) as usize;

            // SAFETY: the compressor initialized `written` bytes of the spare capacity.
            unsafe { self.output.advance_mut(written) };

            match status {
                Ok(Status::Ok) => {}
                Ok(Status::StreamEnd | Status::BufError) => {
                    return Err(compression_error("corrupt deflate stream"))
                }
                Err(err) => return Err(compression_error(err)),
            }

            input = &input[consumed..];
        }
        Ok(())
    }

    /// Sync-flushes the message and returns everything produced since the last call,
    /// without the trailing `00 00 ff ff`.
    fn flush(&mut self, budget: Option<usize>) -> Result<Bytes> {
        loop {
            if budget.is_some_and(|budget| self.output.len() > budget) {
                return Ok(self.output.split().freeze());
            }
            let dst = chunk(&mut self.output);
            let available = dst.len();

            let before_out = self.compress.total_out();
            self.compress
                .compress(&[], dst, FlushCompress::Sync)
                .map_err(compression_error)?;

            let written = (self.compress.total_out() - before_out) as usize;
            // SAFETY: the compressor initialized `written` bytes of the spare capacity.
            unsafe { self.output.advance_mut(written) };

            if written < available {
                break;
            }
        }

        if self.output.ends_with(&TRAILER) {
            self.output.truncate(self.output.len() - TRAILER.len());
        }
        if self.output.is_empty() {
            // nothing was pending, RFC 7692 Section 7.2.3.6
            self.output.put_u8(0x00);
        }

        Ok(self.output.split().freeze())
    }
}

/// Streaming raw deflate decompressor.
struct Inflate {
    output: BytesMut,
    decompress: flate2::Decompress,
    /// Whether the current message carried any compressed bytes.
    fed: bool,
}

impl Inflate {
    fn new(window_bits: u8) -> Self {
        #[cfg(feature = "zlib")]
        let decompress = flate2::Decompress::new_with_window_bits(false, window_bits.max(9));
        #[cfg(not(feature = "zlib"))]
        let decompress = {
            let _ = window_bits;
            flate2::Decompress::new(false)
        };

        Self {
            output: BytesMut::with_capacity(1024),
            decompress,
            fed: false,
        }
    }

    /// Inflates `input`, stopping early once the output grows past `budget`.
    fn write(&mut self, mut input: &[u8], budget: Option<usize>) -> Result<()> {
        self.fed |= !input.is_empty();
        while !input.is_empty() {
            if budget.is_some_and(|budget| self.output.len() > budget) {
                return Ok(());
            }
            let dst = chunk(&mut self.output);

            let before_out = self.decompress.total_out();
            let before_in = self.decompress.total_in();

            let status = self
                .decompress
                .decompress(input, dst, FlushDecompress::None);

            let written = (self.decompress.total_out() - before_out) as usize;
            let consumed = (self.decompress.total_in() - before_in) as usize;

            // SAFETY: the decompressor initialized `written` bytes of the spare capacity.
            unsafe { self.output.advance_mut(written) };

            match status {
                Ok(Status::Ok | Status::BufError | Status::StreamEnd) => {}
                Err(err) => return Err(compression_error(err)),
            }

            if written == 0 && consumed == 0 {
                return Err(compression_error("corrupt deflate stream"));
            }

            input = &input[consumed..];
        }
        Ok(())
    }

    /// Drains output still buffered inside the decompressor.
    fn flush(&mut self, budget: Option<usize>) -> Result<Bytes> {
        loop {
            if budget.is_some_and(|budget| self.output.len() > budget) {
                break Ok(self.output.split().freeze());
            }
            let dst = chunk(&mut self.output);
            let available = dst.len();

            let before_out = self.decompress.total_out();
            self.decompress
                .decompress(&[], dst, FlushDecompress::Sync)
                .map_err(compression_error)?;

            let written = (self.decompress.total_out() - before_out) as usize;
            // SAFETY: the decompressor initialized `written` bytes of the spare capacity.
            unsafe { self.output.advance_mut(written) };

            if written < available {
                self.fed = false;
                break Ok(self.output.split().freeze());
            }
        }
    }
}

/// Returns the spare capacity of `output` as a writable slice, growing it when full.
fn chunk(output: &mut BytesMut) -> &mut [u8] {
    if output.len() == output.capacity() {
        // allocate capacity ourselves since chunk_mut reserves only 64 bytes
        output.reserve(1024);
    }

    let uninitbuf = output.spare_capacity_mut();
    // SAFETY: the slice is only written to by flate2 and only the written prefix is
    // exposed through `advance_mut`.
    unsafe { &mut *(uninitbuf as *mut [std::mem::MaybeUninit<u8>] as *mut [u8]) }
}
