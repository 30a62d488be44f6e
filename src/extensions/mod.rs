//! Per-message compression extensions.
//!
//! Three schemes are supported, each negotiated through `Sec-WebSocket-Extensions`:
//!
//! - `permessage-deflate` ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692))
//! - `permessage-bzip2`
//! - `permessage-brotli`
//!
//! Every scheme follows the same shape. A client sends an [`Offer`], the server parses it
//! and answers with an [`OfferAccept`]; the client parses the answer as a [`Response`] and
//! confirms it with a [`ResponseAccept`]. Each side then builds a [`PerMessageCompress`]
//! from the accepted parameters and drives it message by message:
//!
//! ```text
//! start_compress_message -> compress_message_data* -> end_compress_message
//! start_decompress_message -> decompress_message_data* -> end_decompress_message
//! ```
//!
//! Only one extension is active per connection. A compressed message is flagged with
//! the rsv1 bit on its first frame.
use std::fmt;

use bytes::Bytes;
use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, multispace0},
    combinator::{all_consuming, opt},
    multi::{many0, separated_list1},
    sequence::{delimited, preceded, terminated},
    IResult, Parser,
};

use crate::{Result, WebSocketError};

pub mod brotli;
pub mod bzip2;
pub mod deflate;

pub use self::brotli::{
    BrotliOffer, BrotliOfferAccept, BrotliResponse, BrotliResponseAccept, PerMessageBrotli,
};
pub use self::bzip2::{
    Bzip2Offer, Bzip2OfferAccept, Bzip2Response, Bzip2ResponseAccept, PerMessageBzip2,
};
pub use self::deflate::{
    DeflateAcceptOptions, DeflateOffer, DeflateOfferAccept, DeflateResponse,
    DeflateResponseAccept, PerMessageDeflate,
};

/// Parameters of one extension in header order. A `None` value is a bare flag.
///
/// Repeated keys are kept so the per-scheme parsers can reject them.
pub type ExtensionParams = Vec<(String, Option<String>)>;

/// Parses a `Sec-WebSocket-Extensions` header value.
///
/// Extensions are comma-separated, parameters `;`-separated, each parameter is
/// `key` or `key=value` where the value may be quoted. Names and keys are lowercased.
///
/// ```rust
/// use wsengine::extensions::parse_extensions_header;
///
/// let parsed = parse_extensions_header(
///     "permessage-deflate; client_max_window_bits, permessage-bzip2; server_max_compress_level=\"5\"",
/// )
/// .unwrap();
///
/// assert_eq!(parsed[0].0, "permessage-deflate");
/// assert_eq!(parsed[0].1, vec![("client_max_window_bits".to_string(), None)]);
/// assert_eq!(parsed[1].1[0].1.as_deref(), Some("5"));
/// ```
pub fn parse_extensions_header(input: &str) -> Result<Vec<(String, ExtensionParams)>> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }

    let (_, extensions) = all_consuming(terminated(
        separated_list1((multispace0, char(','), multispace0), extension),
        multispace0,
    ))
    .parse(input)
    .map_err(|err| negotiation_error(format!("malformed extensions header: {err}")))?;

    Ok(extensions
        .into_iter()
        .map(|(name, params)| {
            let params = params
                .into_iter()
                .map(|(key, value)| (key.to_ascii_lowercase(), value.map(str::to_string)))
                .collect();
            (name.to_ascii_lowercase(), params)
        })
        .collect())
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(is_token_char).parse(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while(|c: char| c != '"'), char('"')).parse(input)
}

/// `; key[=value]`
fn param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        (multispace0, char(';'), multispace0),
        (
            token,
            opt(preceded(
                (multispace0, char('='), multispace0),
                alt((quoted, token)),
            )),
        ),
    )
    .parse(input)
}

fn extension(input: &str) -> IResult<&str, (&str, Vec<(&str, Option<&str>)>)> {
    preceded(multispace0, (token, many0(param))).parse(input)
}

pub(crate) fn negotiation_error(msg: impl Into<String>) -> WebSocketError {
    WebSocketError::ExtensionNegotiation(msg.into())
}

/// Rejects a parameter that occurs more than once.
pub(crate) fn check_unique(extension: &str, params: &ExtensionParams) -> Result<()> {
    for (i, (key, _)) in params.iter().enumerate() {
        if params[..i].iter().any(|(other, _)| other == key) {
            return Err(negotiation_error(format!(
                "multiple occurrence of extension parameter '{key}' for extension '{extension}'"
            )));
        }
    }
    Ok(())
}

pub(crate) fn illegal_value(extension: &str, key: &str, value: Option<&str>) -> WebSocketError {
    negotiation_error(format!(
        "illegal extension parameter value '{}' for parameter '{key}' of extension '{extension}'",
        value.unwrap_or("true")
    ))
}

pub(crate) fn illegal_param(extension: &str, key: &str) -> WebSocketError {
    negotiation_error(format!(
        "illegal extension parameter '{key}' for extension '{extension}'"
    ))
}

/// A flag parameter must not carry a value.
pub(crate) fn parse_flag(extension: &str, key: &str, value: Option<&str>) -> Result<()> {
    match value {
        None => Ok(()),
        Some(_) => Err(illegal_value(extension, key, value)),
    }
}

/// An integer parameter within `range`.
pub(crate) fn parse_int(
    extension: &str,
    key: &str,
    value: Option<&str>,
    range: std::ops::RangeInclusive<u8>,
) -> Result<u8> {
    value
        .and_then(|v| v.parse::<u8>().ok())
        .filter(|v| range.contains(v))
        .ok_or_else(|| illegal_value(extension, key, value))
}

macro_rules! dispatch {
    ($value:expr, $inner:ident => $body:expr) => {
        match $value {
            Self::Deflate($inner) => $body,
            Self::Bzip2($inner) => $body,
            Self::Brotli($inner) => $body,
        }
    };
}

/// An extension offer sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer {
    Deflate(DeflateOffer),
    Bzip2(Bzip2Offer),
    Brotli(BrotliOffer),
}

impl Offer {
    /// Parses the parameters of extension `name`.
    ///
    /// Returns `Ok(None)` for extensions this crate does not implement.
    pub fn parse(name: &str, params: &ExtensionParams) -> Result<Option<Self>> {
        Ok(match name {
            deflate::EXTENSION_NAME => Some(Self::Deflate(DeflateOffer::parse(params)?)),
            bzip2::EXTENSION_NAME => Some(Self::Bzip2(Bzip2Offer::parse(params)?)),
            brotli::EXTENSION_NAME => Some(Self::Brotli(BrotliOffer::parse(params)?)),
            _ => None,
        })
    }

    /// Extension name as it appears in the header.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Deflate(_) => deflate::EXTENSION_NAME,
            Self::Bzip2(_) => bzip2::EXTENSION_NAME,
            Self::Brotli(_) => brotli::EXTENSION_NAME,
        }
    }
}

impl fmt::Display for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, offer => fmt::Display::fmt(offer, f))
    }
}

/// The server's acceptance of an [`Offer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferAccept {
    Deflate(DeflateOfferAccept),
    Bzip2(Bzip2OfferAccept),
    Brotli(BrotliOfferAccept),
}

impl OfferAccept {
    /// Accepts `offer` without requesting anything from the client.
    pub fn new(offer: &Offer) -> Result<Self> {
        Ok(match offer {
            Offer::Deflate(offer) => {
                Self::Deflate(DeflateOfferAccept::new(offer.clone(), Default::default())?)
            }
            Offer::Bzip2(offer) => Self::Bzip2(Bzip2OfferAccept::new(offer.clone(), 0, None)?),
            Offer::Brotli(offer) => Self::Brotli(BrotliOfferAccept::new(offer.clone(), false, None)?),
        })
    }
}

impl fmt::Display for OfferAccept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, accept => fmt::Display::fmt(accept, f))
    }
}

/// An extension response sent by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Deflate(DeflateResponse),
    Bzip2(Bzip2Response),
    Brotli(BrotliResponse),
}

impl Response {
    /// Parses the parameters of extension `name`.
    ///
    /// Returns `Ok(None)` for extensions this crate does not implement.
    pub fn parse(name: &str, params: &ExtensionParams) -> Result<Option<Self>> {
        Ok(match name {
            deflate::EXTENSION_NAME => Some(Self::Deflate(DeflateResponse::parse(params)?)),
            bzip2::EXTENSION_NAME => Some(Self::Bzip2(Bzip2Response::parse(params)?)),
            brotli::EXTENSION_NAME => Some(Self::Brotli(BrotliResponse::parse(params)?)),
            _ => None,
        })
    }

    /// Extension name as it appears in the header.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Deflate(_) => deflate::EXTENSION_NAME,
            Self::Bzip2(_) => bzip2::EXTENSION_NAME,
            Self::Brotli(_) => brotli::EXTENSION_NAME,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, response => fmt::Display::fmt(response, f))
    }
}

/// The client's acceptance of a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAccept {
    Deflate(DeflateResponseAccept),
    Bzip2(Bzip2ResponseAccept),
    Brotli(BrotliResponseAccept),
}

impl ResponseAccept {
    /// Accepts `response` as is.
    pub fn new(response: &Response) -> Result<Self> {
        Ok(match response {
            Response::Deflate(response) => {
                Self::Deflate(DeflateResponseAccept::new(response.clone(), None, None, None)?)
            }
            Response::Bzip2(response) => {
                Self::Bzip2(Bzip2ResponseAccept::new(response.clone(), None)?)
            }
            Response::Brotli(response) => {
                Self::Brotli(BrotliResponseAccept::new(response.clone(), None)?)
            }
        })
    }
}

impl fmt::Display for ResponseAccept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, accept => fmt::Display::fmt(accept, f))
    }
}

/// The negotiated compression codec of a connection.
pub enum PerMessageCompress {
    Deflate(PerMessageDeflate),
    Bzip2(PerMessageBzip2),
    Brotli(PerMessageBrotli),
}

impl fmt::Debug for PerMessageCompress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, pmce => fmt::Debug::fmt(pmce, f))
    }
}

impl PerMessageCompress {
    /// Builds the server-side (or client-side when `is_server` is false) codec from an
    /// accepted offer.
    pub fn create_from_offer_accept(is_server: bool, accept: &OfferAccept) -> Self {
        match accept {
            OfferAccept::Deflate(a) => {
                Self::Deflate(PerMessageDeflate::create_from_offer_accept(is_server, a))
            }
            OfferAccept::Bzip2(a) => {
                Self::Bzip2(PerMessageBzip2::create_from_offer_accept(is_server, a))
            }
            OfferAccept::Brotli(a) => {
                Self::Brotli(PerMessageBrotli::create_from_offer_accept(is_server, a))
            }
        }
    }

    /// Builds the codec from an accepted response.
    pub fn create_from_response_accept(is_server: bool, accept: &ResponseAccept) -> Self {
        match accept {
            ResponseAccept::Deflate(a) => {
                Self::Deflate(PerMessageDeflate::create_from_response_accept(is_server, a))
            }
            ResponseAccept::Bzip2(a) => {
                Self::Bzip2(PerMessageBzip2::create_from_response_accept(is_server, a))
            }
            ResponseAccept::Brotli(a) => {
                Self::Brotli(PerMessageBrotli::create_from_response_accept(is_server, a))
            }
        }
    }

    /// Extension name as it appears in the header.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Deflate(_) => deflate::EXTENSION_NAME,
            Self::Bzip2(_) => bzip2::EXTENSION_NAME,
            Self::Brotli(_) => brotli::EXTENSION_NAME,
        }
    }

    /// Caps the decompressed size of every incoming message at `max` bytes. A smaller
    /// limit negotiated earlier is kept.
    pub fn limit_message_size(&mut self, max: usize) {
        dispatch!(self, pmce => pmce.limit_message_size(max))
    }

    pub fn start_compress_message(&mut self) -> Result<()> {
        dispatch!(self, pmce => pmce.start_compress_message())
    }

    pub fn compress_message_data(&mut self, data: &[u8]) -> Result<Bytes> {
        dispatch!(self, pmce => pmce.compress_message_data(data))
    }

    pub fn end_compress_message(&mut self) -> Result<Bytes> {
        dispatch!(self, pmce => pmce.end_compress_message())
    }

    pub fn start_decompress_message(&mut self) -> Result<()> {
        dispatch!(self, pmce => pmce.start_decompress_message())
    }

    pub fn decompress_message_data(&mut self, data: &[u8]) -> Result<Bytes> {
        dispatch!(self, pmce => pmce.decompress_message_data(data))
    }

    pub fn end_decompress_message(&mut self) -> Result<Bytes> {
        dispatch!(self, pmce => pmce.end_decompress_message())
    }
}

/// Server side negotiation.
///
/// Parses the client's extension header, hands every supported offer (in the client's
/// order of preference) to `accept_policy` and builds the codec for the accept it
/// returns. The accept's `Display` output is the value for the response header.
///
/// Malformed parameters of a supported extension fail the handshake. Unknown
/// extensions are skipped.
pub fn negotiate_offers<F>(
    header: &str,
    accept_policy: F,
) -> Result<Option<(OfferAccept, PerMessageCompress)>>
where
    F: FnOnce(&[Offer]) -> Option<OfferAccept>,
{
    let mut offers = Vec::new();
    for (name, params) in parse_extensions_header(header)? {
        if let Some(offer) = Offer::parse(&name, &params)? {
            offers.push(offer);
        }
    }

    #[cfg(feature = "logging")]
    log::debug!("received {} compression offer(s): {:?}", offers.len(), offers);

    if offers.is_empty() {
        return Ok(None);
    }

    Ok(accept_policy(&offers).map(|accept| {
        let pmce = PerMessageCompress::create_from_offer_accept(true, &accept);
        #[cfg(feature = "logging")]
        log::debug!("accepted {accept}");
        (accept, pmce)
    }))
}

/// Accept policy that takes the first offer the server can satisfy.
pub fn accept_first(offers: &[Offer]) -> Option<OfferAccept> {
    offers.iter().find_map(|offer| OfferAccept::new(offer).ok())
}

/// Client side negotiation.
///
/// Validates the server's extension header against what the client `offered` and
/// builds the codec. At most one compression extension may be returned and it must be
/// one the client offered; anything else fails the handshake.
pub fn negotiate_response(header: &str, offered: &[Offer]) -> Result<Option<PerMessageCompress>> {
    let mut pmce: Option<PerMessageCompress> = None;

    for (name, params) in parse_extensions_header(header)? {
        let Some(response) = Response::parse(&name, &params)? else {
            return Err(negotiation_error(format!(
                "server wants to use extension '{name}' we did not request"
            )));
        };

        if !offered.iter().any(|offer| offer.name() == response.name()) {
            return Err(negotiation_error(format!(
                "server accepted extension '{name}' that was not offered"
            )));
        }

        if pmce.is_some() {
            return Err(negotiation_error(
                "multiple compression extensions in response".to_string(),
            ));
        }

        let accept = ResponseAccept::new(&response)?;

        #[cfg(feature = "logging")]
        log::debug!("negotiated {name} with {response:?}");

        pmce = Some(PerMessageCompress::create_from_response_accept(false, &accept));
    }

    Ok(pmce)
}
