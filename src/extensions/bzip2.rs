//! `permessage-bzip2`, a non-standard PMCE carrying every message as a complete bzip2
//! stream.
//!
//! Negotiable parameters:
//!
//! - `client_max_compress_level`: bare flag in an offer (the client supports the
//!   parameter), a level 1 to 9 in a response.
//! - `server_max_compress_level`: a level 1 to 9.
use std::{fmt, ops::RangeInclusive};

use bytes::Bytes;

use super::{check_unique, illegal_param, negotiation_error, parse_flag, parse_int, ExtensionParams};
use crate::{Result, WebSocketError};

pub const EXTENSION_NAME: &str = "permessage-bzip2";

const COMPRESS_LEVEL: RangeInclusive<u8> = 1..=9;
const DEFAULT_COMPRESS_LEVEL: u8 = 9;
const WORK_FACTOR: u32 = 30;

fn compression_error(msg: impl fmt::Display) -> WebSocketError {
    WebSocketError::Compression(msg.to_string())
}

fn check_level(what: &str, level: u8) -> Result<()> {
    if level != 0 && !COMPRESS_LEVEL.contains(&level) {
        return Err(negotiation_error(format!(
            "invalid value {level} for {what} - permissible values 1-9"
        )));
    }
    Ok(())
}

/// A `permessage-bzip2` offer, sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bzip2Offer {
    pub accept_max_compress_level: bool,
    /// 0 for no request.
    pub request_max_compress_level: u8,
}

impl Default for Bzip2Offer {
    fn default() -> Self {
        Self {
            accept_max_compress_level: true,
            request_max_compress_level: 0,
        }
    }
}

impl Bzip2Offer {
    pub fn new(accept_max_compress_level: bool, request_max_compress_level: u8) -> Result<Self> {
        check_level("request_max_compress_level", request_max_compress_level)?;
        Ok(Self {
            accept_max_compress_level,
            request_max_compress_level,
        })
    }

    pub fn parse(params: &ExtensionParams) -> Result<Self> {
        check_unique(EXTENSION_NAME, params)?;

        let mut offer = Self {
            accept_max_compress_level: false,
            request_max_compress_level: 0,
        };
        for (key, value) in params {
            let value = value.as_deref();
            match key.as_str() {
                "client_max_compress_level" => {
                    parse_flag(EXTENSION_NAME, key, value)?;
                    offer.accept_max_compress_level = true;
                }
                "server_max_compress_level" => {
                    offer.request_max_compress_level =
                        parse_int(EXTENSION_NAME, key, value, COMPRESS_LEVEL)?;
                }
                _ => return Err(illegal_param(EXTENSION_NAME, key)),
            }
        }
        Ok(offer)
    }
}

impl fmt::Display for Bzip2Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{EXTENSION_NAME}")?;
        if self.accept_max_compress_level {
            write!(f, "; client_max_compress_level")?;
        }
        if self.request_max_compress_level != 0 {
            write!(f, "; server_max_compress_level={}", self.request_max_compress_level)?;
        }
        Ok(())
    }
}

/// A server's acceptance of a [`Bzip2Offer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bzip2OfferAccept {
    pub offer: Bzip2Offer,
    /// Level the client is asked to stay under, 0 for no request.
    pub request_max_compress_level: u8,
    /// Override of the server's own level.
    pub compress_level: Option<u8>,
}

impl Bzip2OfferAccept {
    pub fn new(
        offer: Bzip2Offer,
        request_max_compress_level: u8,
        compress_level: Option<u8>,
    ) -> Result<Self> {
        check_level("request_max_compress_level", request_max_compress_level)?;
        if request_max_compress_level != 0 && !offer.accept_max_compress_level {
            return Err(negotiation_error(format!(
                "invalid value {request_max_compress_level} for request_max_compress_level - feature unsupported by client"
            )));
        }

        if let Some(level) = compress_level {
            if !COMPRESS_LEVEL.contains(&level) {
                return Err(negotiation_error(format!(
                    "invalid value {level} for compress_level - permissible values 1-9"
                )));
            }
            if offer.request_max_compress_level != 0 && level > offer.request_max_compress_level {
                return Err(negotiation_error(format!(
                    "invalid value {level} for compress_level - client requested lower maximum value"
                )));
            }
        }

        Ok(Self {
            offer,
            request_max_compress_level,
            compress_level,
        })
    }
}

impl fmt::Display for Bzip2OfferAccept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{EXTENSION_NAME}")?;
        if self.offer.request_max_compress_level != 0 {
            write!(f, "; server_max_compress_level={}", self.offer.request_max_compress_level)?;
        }
        if self.request_max_compress_level != 0 {
            write!(f, "; client_max_compress_level={}", self.request_max_compress_level)?;
        }
        Ok(())
    }
}

/// A `permessage-bzip2` response, sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bzip2Response {
    pub client_max_compress_level: u8,
    pub server_max_compress_level: u8,
}

impl Bzip2Response {
    pub fn parse(params: &ExtensionParams) -> Result<Self> {
        check_unique(EXTENSION_NAME, params)?;

        let mut response = Self::default();
        for (key, value) in params {
            let value = value.as_deref();
            match key.as_str() {
                "client_max_compress_level" => {
                    response.client_max_compress_level =
                        parse_int(EXTENSION_NAME, key, value, COMPRESS_LEVEL)?;
                }
                "server_max_compress_level" => {
                    response.server_max_compress_level =
                        parse_int(EXTENSION_NAME, key, value, COMPRESS_LEVEL)?;
                }
                _ => return Err(illegal_param(EXTENSION_NAME, key)),
            }
        }
        Ok(response)
    }
}

impl fmt::Display for Bzip2Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{EXTENSION_NAME}")?;
        if self.server_max_compress_level != 0 {
            write!(f, "; server_max_compress_level={}", self.server_max_compress_level)?;
        }
        if self.client_max_compress_level != 0 {
            write!(f, "; client_max_compress_level={}", self.client_max_compress_level)?;
        }
        Ok(())
    }
}

/// A client's acceptance of a [`Bzip2Response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bzip2ResponseAccept {
    pub response: Bzip2Response,
    pub compress_level: Option<u8>,
}

impl Bzip2ResponseAccept {
    pub fn new(response: Bzip2Response, compress_level: Option<u8>) -> Result<Self> {
        if let Some(level) = compress_level {
            if !COMPRESS_LEVEL.contains(&level) {
                return Err(negotiation_error(format!(
                    "invalid value {level} for compress_level - permissible values 1-9"
                )));
            }
            if response.client_max_compress_level != 0 && level > response.client_max_compress_level
            {
                return Err(negotiation_error(format!(
                    "invalid value {level} for compress_level - server requested lower maximum value"
                )));
            }
        }
        Ok(Self {
            response,
            compress_level,
        })
    }
}

impl fmt::Display for Bzip2ResponseAccept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.response, f)
    }
}

/// The `permessage-bzip2` codec of one connection.
pub struct PerMessageBzip2 {
    is_server: bool,
    server_max_compress_level: u8,
    client_max_compress_level: u8,
    compressor: Option<::bzip2::Compress>,
    decompressor: Option<Decoder>,
    max_message_size: Option<usize>,
}

struct Decoder {
    decompress: ::bzip2::Decompress,
    fed: bool,
    finished: bool,
}

impl fmt::Debug for PerMessageBzip2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerMessageBzip2")
            .field("is_server", &self.is_server)
            .field("server_max_compress_level", &self.server_max_compress_level)
            .field("client_max_compress_level", &self.client_max_compress_level)
            .finish()
    }
}

impl PerMessageBzip2 {
    fn new(is_server: bool, server_max_compress_level: u8, client_max_compress_level: u8) -> Self {
        let level = |l: u8| if l == 0 { DEFAULT_COMPRESS_LEVEL } else { l };
        Self {
            is_server,
            server_max_compress_level: level(server_max_compress_level),
            client_max_compress_level: level(client_max_compress_level),
            compressor: None,
            decompressor: None,
            max_message_size: None,
        }
    }

    pub fn create_from_offer_accept(is_server: bool, accept: &Bzip2OfferAccept) -> Self {
        Self::new(
            is_server,
            accept
                .compress_level
                .unwrap_or(accept.offer.request_max_compress_level),
            accept.request_max_compress_level,
        )
    }

    pub fn create_from_response_accept(is_server: bool, accept: &Bzip2ResponseAccept) -> Self {
        Self::new(
            is_server,
            accept.response.server_max_compress_level,
            accept
                .compress_level
                .unwrap_or(accept.response.client_max_compress_level),
        )
    }

    /// Caps the decompressed size of a message, keeping a smaller existing limit.
    pub fn limit_message_size(&mut self, max: usize) {
        self.max_message_size = Some(self.max_message_size.map_or(max, |limit| limit.min(max)));
    }

    pub fn start_compress_message(&mut self) -> Result<()> {
        if self.compressor.is_none() {
            let level = if self.is_server {
                self.server_max_compress_level
            } else {
                self.client_max_compress_level
            };
            self.compressor = Some(::bzip2::Compress::new(
                ::bzip2::Compression::new(level as u32),
                WORK_FACTOR,
            ));
        }
        Ok(())
    }

    pub fn compress_message_data(&mut self, mut data: &[u8]) -> Result<Bytes> {
        let compress = self
            .compressor
            .as_mut()
            .ok_or_else(|| compression_error("no message is being compressed"))?;

        let mut output = Vec::new();
        while !data.is_empty() {
            output.reserve(data.len().max(1024));
            let before = compress.total_in();
            compress
                .compress_vec(data, &mut output, ::bzip2::Action::Run)
                .map_err(compression_error)?;
            data = &data[(compress.total_in() - before) as usize..];
        }
        Ok(output.into())
    }

    pub fn end_compress_message(&mut self) -> Result<Bytes> {
        let mut compress = self
            .compressor
            .take()
            .ok_or_else(|| compression_error("no message is being compressed"))?;

        let mut output = Vec::with_capacity(1024);
        loop {
            if output.len() == output.capacity() {
                output.reserve(1024);
            }
            let status = compress
                .compress_vec(&[], &mut output, ::bzip2::Action::Finish)
                .map_err(compression_error)?;
            if matches!(status, ::bzip2::Status::StreamEnd) {
                break;
            }
        }
        Ok(output.into())
    }

    pub fn start_decompress_message(&mut self) -> Result<()> {
        self.decompressor = Some(Decoder {
            decompress: ::bzip2::Decompress::new(false),
            fed: false,
            finished: false,
        });
        Ok(())
    }

    pub fn decompress_message_data(&mut self, mut data: &[u8]) -> Result<Bytes> {
        let decoder = self
            .decompressor
            .as_mut()
            .ok_or_else(|| compression_error("no message is being decompressed"))?;

        if data.is_empty() {
            return Ok(Bytes::new());
        }
        if decoder.finished {
            return Err(compression_error("data after end of bzip2 stream"));
        }
        decoder.fed = true;

        let max = self.max_message_size;
        // never hold more than one byte past the limit
        let room = |decoder: &Decoder| {
            max.map_or(usize::MAX, |max| {
                (max as u64 + 1).saturating_sub(decoder.decompress.total_out()) as usize
            })
        };

        let initial = data.len().saturating_mul(4).max(1024);
        let mut output = Vec::with_capacity(initial.min(room(decoder)));
        loop {
            if output.len() == output.capacity() {
                output.reserve_exact(output.capacity().min(room(decoder)).max(1));
            }

            let before_in = decoder.decompress.total_in();
            let before_out = decoder.decompress.total_out();
            let status = decoder
                .decompress
                .decompress_vec(data, &mut output)
                .map_err(compression_error)?;
            let consumed = (decoder.decompress.total_in() - before_in) as usize;
            let written = (decoder.decompress.total_out() - before_out) as usize;
            data = &data[consumed..];

            if let Some(max) = max {
                let total = decoder.decompress.total_out();
                if total > max as u64 {
                    return Err(WebSocketError::MessageTooBig(total));
                }
            }

            if matches!(status, ::bzip2::Status::StreamEnd) {
                decoder.finished = true;
                if !data.is_empty() {
                    return Err(compression_error("data after end of bzip2 stream"));
                }
                break;
            }
            if data.is_empty() && output.len() < output.capacity() {
                break;
            }
            if consumed == 0 && written == 0 {
                return Err(compression_error("corrupt bzip2 stream"));
            }
        }
        Ok(output.into())
    }

    pub fn end_decompress_message(&mut self) -> Result<Bytes> {
        match self.decompressor.take() {
            Some(decoder) if decoder.fed && !decoder.finished => {
                Err(compression_error("truncated bzip2 stream"))
            }
            _ => Ok(Bytes::new()),
        }
    }
}
