//! Wire encoding and decoding of single frames.
//!
//! [`decode_header`] is the incremental entry point used by the connection: it looks at
//! whatever bytes are buffered and either returns a validated [`FrameHeader`], asks for
//! more bytes, or reports the protocol violation. Payload bytes are handled by the caller
//! so they can be processed as they arrive.
//!
//! [`Codec`] wraps the same logic in `tokio_util`'s `Decoder`/`Encoder` traits for users
//! that want whole frames out of a byte stream.
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec;

use crate::{
    frame::{Frame, FrameHeader, OpCode, Rsv, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask::apply_mask,
    Role, WebSocketError,
};

/// Context needed to validate an incoming header.
#[derive(Debug, Clone, Copy)]
pub struct HeaderRules {
    /// Role of the local endpoint. Frames being decoded come from the opposite role.
    pub role: Role,
    /// A negotiated extension gives meaning to rsv1.
    pub rsv1_allowed: bool,
    /// A server fails the connection on unmasked client frames.
    pub require_masked_client_frames: bool,
    /// A client tolerates masked server frames.
    pub accept_masked_server_frames: bool,
    /// A fragmented data message is in progress.
    pub inside_message: bool,
}

impl HeaderRules {
    /// Strict rules for `role`: masking enforced, no extension, no message in progress.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            rsv1_allowed: false,
            require_masked_client_frames: true,
            accept_masked_server_frames: false,
            inside_message: false,
        }
    }
}

/// Outcome of a header that could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The buffer ends before the header does. Holds the number of missing bytes.
    #[error("need {0} more bytes")]
    NeedMoreBytes(usize),
    /// The header violates the protocol.
    #[error(transparent)]
    Protocol(#[from] WebSocketError),
}

/// Decodes and validates the frame header at the start of `buf`.
///
/// On success returns the header and the number of bytes it occupies; the payload
/// starts right after. Violations that are visible in the first two bytes are
/// reported before the extended length or mask key has arrived.
pub fn decode_header(buf: &[u8], rules: &HeaderRules) -> Result<(FrameHeader, usize), DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::NeedMoreBytes(2 - buf.len()));
    }

    let fin = buf[0] & 0b1000_0000 != 0;
    let rsv = Rsv::from_bits((buf[0] >> 4) & 0b111);
    let masked = buf[1] & 0b1000_0000 != 0;
    let length_code = buf[1] & 0x7F;

    let allowed = if rules.rsv1_allowed { 0b100 } else { 0 };
    if rsv.bits() & !allowed != 0 {
        return Err(WebSocketError::ReservedBitsNotZero(rsv.bits()).into());
    }

    match rules.role {
        Role::Server if rules.require_masked_client_frames && !masked => {
            return Err(WebSocketError::UnmaskedFrame.into());
        }
        Role::Client if masked && !rules.accept_masked_server_frames => {
            return Err(WebSocketError::MaskedFrame.into());
        }
        _ => {}
    }

    let opcode = OpCode::try_from(buf[0] & 0b0000_1111)?;
    if opcode.is_control() {
        if !fin {
            return Err(WebSocketError::ControlFrameFragmented.into());
        }
        if usize::from(length_code) > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge(u64::from(length_code)).into());
        }
        if opcode == OpCode::Close && length_code == 1 {
            return Err(WebSocketError::InvalidCloseFrame.into());
        }
        if rsv.rsv1 {
            return Err(WebSocketError::CompressedControlFrame.into());
        }
    } else if opcode == OpCode::Continuation {
        if !rules.inside_message {
            return Err(WebSocketError::InvalidContinuationFrame.into());
        }
        if rsv.rsv1 {
            return Err(WebSocketError::CompressedContinuationFrame.into());
        }
    } else if rules.inside_message {
        return Err(WebSocketError::InvalidFragment.into());
    }

    let extra = match length_code {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let header_len = 2 + extra + if masked { 4 } else { 0 };
    if buf.len() < header_len {
        return Err(DecodeError::NeedMoreBytes(header_len - buf.len()));
    }

    let mut cursor = &buf[2..header_len];
    let payload_len = match extra {
        2 => {
            let len = u64::from(cursor.get_u16());
            if len < 126 {
                return Err(WebSocketError::NonMinimalLength(len).into());
            }
            len
        }
        8 => {
            let len = cursor.get_u64();
            if len >> 63 != 0 {
                return Err(WebSocketError::InvalidPayloadLength(len).into());
            }
            if len < 65536 {
                return Err(WebSocketError::NonMinimalLength(len).into());
            }
            len
        }
        _ => u64::from(length_code),
    };

    let mask = masked.then(|| cursor.get_u32().to_be_bytes());

    Ok((
        FrameHeader {
            fin,
            rsv,
            opcode,
            mask,
            payload_len,
        },
        header_len,
    ))
}

/// Serializes `frame` into `dst`, masking the payload on the way if the frame carries a key.
pub fn encode(frame: &Frame, dst: &mut BytesMut) {
    let mut head = [0; MAX_HEAD_SIZE];
    let size = frame.header().fmt_head(&mut head);

    dst.reserve(size + frame.payload.len());
    dst.extend_from_slice(&head[..size]);

    let start = dst.len();
    dst.extend_from_slice(&frame.payload);
    if let Some(mask) = frame.mask {
        apply_mask(&mut dst[start..], mask);
    }
}

/// A combined codec that provides both encoding and decoding functionality for WebSocket frames.
///
/// This codec can be used with Tokio's framed streams to handle WebSocket protocol
/// frame encoding and decoding.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec for an endpoint playing `role`.
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self::from((Decoder::new(role, max_payload_size), Encoder))
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for whole WebSocket frames.
///
/// `Decoder` keeps the header of a frame whose payload has not fully arrived and tracks
/// whether a fragmented message is in progress, so continuation rules are enforced
/// across frames.
pub struct Decoder {
    /// Header waiting for its payload, with the payload length as `usize`.
    state: Option<(FrameHeader, usize)>,
    rules: HeaderRules,
    /// Maximum allowed size for a frame payload, 0 means unlimited.
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a new `Decoder` with a specified maximum payload size.
    ///
    /// # Parameters
    /// - `role`: Role of the local endpoint.
    /// - `max_payload_size`: The maximum allowed payload size in bytes, 0 for no limit.
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self {
            state: None,
            rules: HeaderRules::new(role),
            max_payload_size,
        }
    }

    /// Allows rsv1 on data frames once a compression extension is negotiated.
    pub fn with_rsv1(mut self, allowed: bool) -> Self {
        self.rules.rsv1_allowed = allowed;
        self
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes WebSocket frames from a `BytesMut` buffer.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a fully decoded frame with its payload unmasked.
    /// - `Ok(None)`: more data is needed to complete the frame.
    /// - `Err(WebSocketError)`: a protocol violation or a frame above the size limit.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    let (header, header_len) = match decode_header(src, &self.rules) {
                        Ok(decoded) => decoded,
                        Err(DecodeError::NeedMoreBytes(missing)) => {
                            src.reserve(missing);
                            return Ok(None);
                        }
                        Err(DecodeError::Protocol(err)) => return Err(err),
                    };

                    let payload_len = usize::try_from(header.payload_len)
                        .map_err(|_| WebSocketError::FrameTooLarge(header.payload_len))?;
                    if self.max_payload_size > 0 && payload_len > self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge(header.payload_len));
                    }

                    src.advance(header_len);
                    self.state = Some((header, payload_len));
                }
                Some((header, payload_len)) => {
                    if src.remaining() < payload_len {
                        src.reserve(payload_len - src.remaining());
                        self.state = Some((header, payload_len));
                        return Ok(None);
                    }

                    let mut payload = src.split_to(payload_len);
                    if let Some(mask) = header.mask {
                        apply_mask(&mut payload, mask);
                    }

                    if header.opcode.is_data() {
                        self.rules.inside_message = !header.fin;
                    }

                    break Ok(Some(Frame {
                        fin: header.fin,
                        rsv: header.rsv,
                        opcode: header.opcode,
                        mask: header.mask,
                        payload,
                    }));
                }
            }
        }
    }
}

/// WebSocket frame encoder for serializing `Frame` instances into a buffer.
pub struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode(&frame, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    fn server_rules() -> HeaderRules {
        HeaderRules::new(Role::Server)
    }

    fn client_rules() -> HeaderRules {
        HeaderRules::new(Role::Client)
    }

    fn protocol_error(buf: &[u8], rules: &HeaderRules) -> WebSocketError {
        match decode_header(buf, rules) {
            Err(DecodeError::Protocol(err)) => err,
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_small_unmasked_header() {
        let (header, len) = decode_header(&[0x81, 0x05, b'H'], &client_rules()).unwrap();
        assert_eq!(len, 2);
        assert!(header.fin);
        assert_eq!(header.opcode, OpCode::Text);
        assert_eq!(header.payload_len, 5);
        assert_eq!(header.mask, None);
    }

    #[test]
    fn test_decode_masked_header() {
        let buf = [0x82, 0x83, 1, 2, 3, 4];
        let (header, len) = decode_header(&buf, &server_rules()).unwrap();
        assert_eq!(len, 6);
        assert_eq!(header.mask, Some([1, 2, 3, 4]));
        assert_eq!(header.payload_len, 3);
    }

    #[test]
    fn test_need_more_bytes() {
        assert!(matches!(
            decode_header(&[], &client_rules()),
            Err(DecodeError::NeedMoreBytes(2))
        ));
        assert!(matches!(
            decode_header(&[0x82], &client_rules()),
            Err(DecodeError::NeedMoreBytes(1))
        ));
        assert!(matches!(
            decode_header(&[0x82, 0x7E, 0x01], &client_rules()),
            Err(DecodeError::NeedMoreBytes(1))
        ));
        assert!(matches!(
            decode_header(&[0x82, 0xFF, 0, 0, 0, 0, 0, 1, 0, 0, 1, 2], &server_rules()),
            Err(DecodeError::NeedMoreBytes(2))
        ));
    }

    #[test]
    fn test_extended_lengths() {
        let (header, len) = decode_header(&[0x82, 0x7E, 0x01, 0x00], &client_rules()).unwrap();
        assert_eq!((header.payload_len, len), (256, 4));

        let mut buf = vec![0x82, 0x7F];
        buf.extend_from_slice(&65536u64.to_be_bytes());
        let (header, len) = decode_header(&buf, &client_rules()).unwrap();
        assert_eq!((header.payload_len, len), (65536, 10));
    }

    #[test]
    fn test_non_minimal_lengths() {
        let err = protocol_error(&[0x82, 0x7E, 0x00, 0x7D], &client_rules());
        assert!(matches!(err, WebSocketError::NonMinimalLength(125)));

        let mut buf = vec![0x82, 0x7F];
        buf.extend_from_slice(&65535u64.to_be_bytes());
        let err = protocol_error(&buf, &client_rules());
        assert!(matches!(err, WebSocketError::NonMinimalLength(65535)));
    }

    #[test]
    fn test_length_with_top_bit_set() {
        let mut buf = vec![0x82, 0x7F];
        buf.extend_from_slice(&(1u64 << 63).to_be_bytes());
        let err = protocol_error(&buf, &client_rules());
        assert!(matches!(err, WebSocketError::InvalidPayloadLength(_)));
        assert_eq!(err.close_code(), Some(crate::CloseCode::Protocol));
    }

    #[test]
    fn test_reserved_bits() {
        let err = protocol_error(&[0xC1, 0x00], &client_rules());
        assert!(matches!(err, WebSocketError::ReservedBitsNotZero(0b100)));

        let mut rules = client_rules();
        rules.rsv1_allowed = true;
        let (header, _) = decode_header(&[0xC1, 0x00], &rules).unwrap();
        assert!(header.is_compressed());

        let err = protocol_error(&[0xA1, 0x00], &rules);
        assert!(matches!(err, WebSocketError::ReservedBitsNotZero(0b010)));
        let err = protocol_error(&[0x91, 0x00], &rules);
        assert!(matches!(err, WebSocketError::ReservedBitsNotZero(0b001)));
    }

    #[test]
    fn test_control_frame_rules() {
        let rules = client_rules();
        assert!(matches!(
            protocol_error(&[0x09, 0x00], &rules),
            WebSocketError::ControlFrameFragmented
        ));
        assert!(matches!(
            protocol_error(&[0x89, 0x7E, 0x00, 0x7E], &rules),
            WebSocketError::ControlFrameTooLarge(126)
        ));
        assert!(matches!(
            protocol_error(&[0x88, 0x01, 0x03], &rules),
            WebSocketError::InvalidCloseFrame
        ));

        let mut compressed = rules;
        compressed.rsv1_allowed = true;
        assert!(matches!(
            protocol_error(&[0xC9, 0x00], &compressed),
            WebSocketError::CompressedControlFrame
        ));

        let (header, _) = decode_header(&[0x89, 0x7D], &rules).unwrap();
        assert_eq!(header.payload_len, 125);
    }

    #[test]
    fn test_reserved_opcodes() {
        for opcode in [0x3u8, 0x7, 0xB, 0xF] {
            let err = protocol_error(&[0x80 | opcode, 0x00], &client_rules());
            assert!(matches!(err, WebSocketError::InvalidOpCode(op) if op == opcode));
        }
    }

    #[test]
    fn test_fragmentation_rules() {
        let mut rules = client_rules();
        assert!(matches!(
            protocol_error(&[0x80, 0x00], &rules),
            WebSocketError::InvalidContinuationFrame
        ));

        rules.inside_message = true;
        assert!(matches!(
            protocol_error(&[0x81, 0x00], &rules),
            WebSocketError::InvalidFragment
        ));
        // control frames may interleave
        assert!(decode_header(&[0x89, 0x00], &rules).is_ok());

        rules.rsv1_allowed = true;
        assert!(matches!(
            protocol_error(&[0xC0, 0x00], &rules),
            WebSocketError::CompressedContinuationFrame
        ));
    }

    #[test]
    fn test_masking_rules() {
        assert!(matches!(
            protocol_error(&[0x81, 0x00], &server_rules()),
            WebSocketError::UnmaskedFrame
        ));
        assert!(matches!(
            protocol_error(&[0x81, 0x80, 0, 0, 0, 0], &client_rules()),
            WebSocketError::MaskedFrame
        ));

        let mut lenient = server_rules();
        lenient.require_masked_client_frames = false;
        assert!(decode_header(&[0x81, 0x00], &lenient).is_ok());

        let mut lenient = client_rules();
        lenient.accept_masked_server_frames = true;
        assert!(decode_header(&[0x81, 0x80, 0, 0, 0, 0], &lenient).is_ok());
    }

    #[test]
    fn test_encode_masks_payload() {
        let frame = Frame::text("Hi").with_mask([0x01, 0x02, 0x03, 0x04]);
        let mut dst = BytesMut::new();
        encode(&frame, &mut dst);
        assert_eq!(
            &dst[..],
            &[0x81, 0x82, 0x01, 0x02, 0x03, 0x04, b'H' ^ 0x01, b'i' ^ 0x02]
        );
        // the frame itself keeps the clear payload
        assert_eq!(&frame.payload[..], b"Hi");
    }

    #[test]
    fn test_codec_round_trip() -> anyhow::Result<()> {
        let frames = [
            Frame::text("hello").with_mask([9, 8, 7, 6]),
            Frame::binary(vec![0xAB; 300]).with_mask([1, 1, 1, 1]),
            Frame::ping("p").with_mask([0, 0, 0, 0]),
            Frame::close(crate::CloseCode::Normal, "bye").with_mask([5, 6, 7, 8]),
        ];

        let mut buf = BytesMut::new();
        let mut encoder = Encoder;
        for frame in frames.iter().cloned() {
            encoder.encode(frame, &mut buf)?;
        }

        let mut decoder = Decoder::new(Role::Server, 0);
        for expected in &frames {
            let decoded = decoder.decode(&mut buf)?.expect("complete frame");
            assert_eq!(&decoded, expected);
        }
        assert!(decoder.decode(&mut buf)?.is_none());
        Ok(())
    }

    #[test]
    fn test_decoder_consumes_exact_64bit_length() -> anyhow::Result<()> {
        let len = 70_000usize;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x82, 0x7F]);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
        buf.extend_from_slice(&vec![0x5A; len]);
        // next frame follows immediately
        buf.extend_from_slice(&[0x81, 0x01, b'x']);

        let mut decoder = Decoder::new(Role::Client, 0);

        // feed in two halves to exercise the partial payload path
        let mut first = buf.split_to(5000);
        assert!(decoder.decode(&mut first)?.is_none());
        first.unsplit(buf);
        let mut buf = first;

        let frame = decoder.decode(&mut buf)?.expect("binary frame");
        assert_eq!(frame.payload.len(), len);
        assert!(frame.payload.iter().all(|&b| b == 0x5A));

        let frame = decoder.decode(&mut buf)?.expect("text frame");
        assert_eq!(&frame.payload[..], b"x");
        assert!(buf.is_empty());
        Ok(())
    }

    #[test]
    fn test_decoder_tracks_fragments() -> anyhow::Result<()> {
        let mut buf = BytesMut::from(
            &[
                0x01, 0x03, b'f', b'o', b'o', // text, fin=0
                0x89, 0x00, // interleaved ping
                0x80, 0x03, b'b', b'a', b'r', // continuation, fin=1
                0x80, 0x00, // stray continuation
            ][..],
        );
        let mut decoder = Decoder::new(Role::Client, 0);

        assert_eq!(decoder.decode(&mut buf)?.map(|f| f.opcode), Some(OpCode::Text));
        assert_eq!(decoder.decode(&mut buf)?.map(|f| f.opcode), Some(OpCode::Ping));
        assert_eq!(
            decoder.decode(&mut buf)?.map(|f| f.opcode),
            Some(OpCode::Continuation)
        );
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WebSocketError::InvalidContinuationFrame)
        ));
        Ok(())
    }

    #[test]
    fn test_decoder_max_payload() {
        let mut buf = BytesMut::from(&[0x82, 0x7E, 0x01, 0x00][..]);
        let mut decoder = Decoder::new(Role::Client, 255);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, WebSocketError::FrameTooLarge(256)));
        assert_eq!(err.close_code(), Some(crate::CloseCode::Size));
    }

    #[test]
    fn test_codec_with_rsv1() -> anyhow::Result<()> {
        let mut codec = Codec::from((Decoder::new(Role::Client, 0).with_rsv1(true), Encoder));
        let mut buf = BytesMut::new();
        codec.encode(
            Frame::compress(true, OpCode::Binary, None, BytesMut::from(&b"zz"[..])),
            &mut buf,
        )?;
        let frame = codec.decode(&mut buf)?.expect("frame");
        assert!(frame.is_compressed());
        Ok(())
    }
}
