//! `permessage-brotli`, a non-standard PMCE carrying every message as a complete
//! brotli stream.
//!
//! The `client_no_context_takeover` and `server_no_context_takeover` flags are
//! negotiated and recorded. Since no state survives a message they do not change the
//! wire format.
use std::{
    fmt,
    io::{self, Write},
};

use bytes::Bytes;

use super::{check_unique, illegal_param, negotiation_error, parse_flag, ExtensionParams};
use crate::{Result, WebSocketError};

pub const EXTENSION_NAME: &str = "permessage-brotli";

const BUFFER_SIZE: usize = 4096;
const QUALITY: u32 = 11;
const WINDOW_BITS: u32 = 22;

fn compression_error(msg: impl fmt::Display) -> WebSocketError {
    WebSocketError::Compression(msg.to_string())
}

/// A `permessage-brotli` offer, sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrotliOffer {
    pub accept_no_context_takeover: bool,
    pub request_no_context_takeover: bool,
}

impl Default for BrotliOffer {
    fn default() -> Self {
        Self {
            accept_no_context_takeover: true,
            request_no_context_takeover: false,
        }
    }
}

impl BrotliOffer {
    pub fn new(accept_no_context_takeover: bool, request_no_context_takeover: bool) -> Self {
        Self {
            accept_no_context_takeover,
            request_no_context_takeover,
        }
    }

    pub fn parse(params: &ExtensionParams) -> Result<Self> {
        check_unique(EXTENSION_NAME, params)?;

        let mut offer = Self::new(false, false);
        for (key, value) in params {
            let value = value.as_deref();
            match key.as_str() {
                "client_no_context_takeover" => {
                    parse_flag(EXTENSION_NAME, key, value)?;
                    offer.accept_no_context_takeover = true;
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

impl fmt::Display for BrotliOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{EXTENSION_NAME}")?;
        if self.accept_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        if self.request_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        Ok(())
    }
}

/// A server's acceptance of a [`BrotliOffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrotliOfferAccept {
    pub offer: BrotliOffer,
    pub request_no_context_takeover: bool,
    pub no_context_takeover: Option<bool>,
}

impl BrotliOfferAccept {
    pub fn new(
        offer: BrotliOffer,
        request_no_context_takeover: bool,
        no_context_takeover: Option<bool>,
    ) -> Result<Self> {
        if request_no_context_takeover && !offer.accept_no_context_takeover {
            return Err(negotiation_error(
                "invalid value true for request_no_context_takeover - feature unsupported by client",
            ));
        }
        if no_context_takeover == Some(false) && offer.request_no_context_takeover {
            return Err(negotiation_error(
                "invalid value false for no_context_takeover - client requested feature",
            ));
        }
        Ok(Self {
            offer,
            request_no_context_takeover,
            no_context_takeover,
        })
    }
}

impl fmt::Display for BrotliOfferAccept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{EXTENSION_NAME}")?;
        if self.offer.request_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.request_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        Ok(())
    }
}

/// A `permessage-brotli` response, sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrotliResponse {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
}

impl BrotliResponse {
    pub fn parse(params: &ExtensionParams) -> Result<Self> {
        check_unique(EXTENSION_NAME, params)?;

        let mut response = Self::default();
        for (key, value) in params {
            let value = value.as_deref();
            match key.as_str() {
                "client_no_context_takeover" => {
                    parse_flag(EXTENSION_NAME, key, value)?;
                    response.client_no_context_takeover = true;
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

impl fmt::Display for BrotliResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{EXTENSION_NAME}")?;
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        Ok(())
    }
}

/// A client's acceptance of a [`BrotliResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrotliResponseAccept {
    pub response: BrotliResponse,
    pub no_context_takeover: Option<bool>,
}

impl BrotliResponseAccept {
    pub fn new(response: BrotliResponse, no_context_takeover: Option<bool>) -> Result<Self> {
        if no_context_takeover == Some(false) && response.client_no_context_takeover {
            return Err(negotiation_error(
                "invalid value false for no_context_takeover - server requested feature",
            ));
        }
        Ok(Self {
            response,
            no_context_takeover,
        })
    }
}

impl fmt::Display for BrotliResponseAccept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.response, f)
    }
}

/// The `permessage-brotli` codec of one connection.
pub struct PerMessageBrotli {
    is_server: bool,
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    compressor: Option<::brotli::CompressorWriter<Vec<u8>>>,
    decompressor: Option<Decoder>,
    max_message_size: Option<usize>,
}

/// Streaming decoder of the message being received.
struct Decoder {
    writer: ::brotli::DecompressorWriter<Sink>,
    fed: bool,
}

/// Collects decoded output and refuses to grow past the message size limit.
struct Sink {
    output: Vec<u8>,
    total: usize,
    max: Option<usize>,
}

impl Sink {
    fn exceeded(&self) -> bool {
        self.max.is_some_and(|max| self.total > max)
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.total += buf.len();
        if self.exceeded() {
            return Err(io::Error::other("message too big"));
        }
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for PerMessageBrotli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerMessageBrotli")
            .field("is_server", &self.is_server)
            .field("server_no_context_takeover", &self.server_no_context_takeover)
            .field("client_no_context_takeover", &self.client_no_context_takeover)
            .finish()
    }
}

impl PerMessageBrotli {
    fn new(is_server: bool, server_no_context_takeover: bool, client_no_context_takeover: bool) -> Self {
        Self {
            is_server,
            server_no_context_takeover,
            client_no_context_takeover,
            compressor: None,
            decompressor: None,
            max_message_size: None,
        }
    }

    pub fn create_from_offer_accept(is_server: bool, accept: &BrotliOfferAccept) -> Self {
        Self::new(
            is_server,
            accept
                .no_context_takeover
                .unwrap_or(accept.offer.request_no_context_takeover),
            accept.request_no_context_takeover,
        )
    }

    pub fn create_from_response_accept(is_server: bool, accept: &BrotliResponseAccept) -> Self {
        Self::new(
            is_server,
            accept.response.server_no_context_takeover,
            accept
                .no_context_takeover
                .unwrap_or(accept.response.client_no_context_takeover),
        )
    }

    /// Caps the decompressed size of a message, keeping a smaller existing limit.
    pub fn limit_message_size(&mut self, max: usize) {
        self.max_message_size = Some(self.max_message_size.map_or(max, |limit| limit.min(max)));
    }

    pub fn start_compress_message(&mut self) -> Result<()> {
        self.compressor = Some(::brotli::CompressorWriter::new(
            Vec::new(),
            BUFFER_SIZE,
            QUALITY,
            WINDOW_BITS,
        ));
        Ok(())
    }

    /// Buffers `data`. The stream is emitted by [`Self::end_compress_message`].
    pub fn compress_message_data(&mut self, data: &[u8]) -> Result<Bytes> {
        let compressor = self
            .compressor
            .as_mut()
            .ok_or_else(|| compression_error("no message is being compressed"))?;
        compressor.write_all(data).map_err(compression_error)?;
        Ok(Bytes::new())
    }

    pub fn end_compress_message(&mut self) -> Result<Bytes> {
        let compressor = self
            .compressor
            .take()
            .ok_or_else(|| compression_error("no message is being compressed"))?;
        Ok(compressor.into_inner().into())
    }

    pub fn start_decompress_message(&mut self) -> Result<()> {
        let sink = Sink {
            output: Vec::new(),
            total: 0,
            max: self.max_message_size,
        };
        self.decompressor = Some(Decoder {
            writer: ::brotli::DecompressorWriter::new(sink, BUFFER_SIZE),
            fed: false,
        });
        Ok(())
    }

    /// Decodes `data` and returns the output it completed.
    pub fn decompress_message_data(&mut self, data: &[u8]) -> Result<Bytes> {
        let decoder = self
            .decompressor
            .as_mut()
            .ok_or_else(|| compression_error("no message is being decompressed"))?;
        if data.is_empty() {
            return Ok(Bytes::new());
        }
        decoder.fed = true;

        let written = decoder.writer.write_all(data);
        let sink = decoder.writer.get_mut();
        if sink.exceeded() {
            return Err(WebSocketError::MessageTooBig(sink.total as u64));
        }
        written.map_err(compression_error)?;
        Ok(std::mem::take(&mut sink.output).into())
    }

    pub fn end_decompress_message(&mut self) -> Result<Bytes> {
        let mut decoder = self
            .decompressor
            .take()
            .ok_or_else(|| compression_error("no message is being decompressed"))?;
        if !decoder.fed {
            return Ok(Bytes::new());
        }

        let closed = decoder.writer.close();
        let sink = decoder.writer.get_mut();
        if sink.exceeded() {
            return Err(WebSocketError::MessageTooBig(sink.total as u64));
        }
        closed.map_err(compression_error)?;
        Ok(std::mem::take(&mut sink.output).into())
    }
}
