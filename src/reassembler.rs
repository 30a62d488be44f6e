//! Reassembly of fragmented data messages.
//!
//! The connection hands every data frame to the [`Reassembler`] in three steps: the
//! header ([`Reassembler::begin_frame`]), payload chunks as they arrive
//! ([`Reassembler::frame_data`]) and the end of the frame ([`Reassembler::end_frame`]).
//! Payload chunks are already unmasked. Compressed messages are decompressed chunk by
//! chunk and text is validated as it is produced, so an invalid byte fails the
//! connection before the rest of the message arrives.
//!
//! Control frames never reach the reassembler; they may be interleaved with the
//! fragments of a message.
use bytes::{Bytes, BytesMut};

use crate::{
    extensions::PerMessageCompress,
    frame::{FrameHeader, OpCode},
    utf8::Utf8Validator,
    Result, WebSocketError,
};

/// Type of a complete data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

impl MessageKind {
    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary)
    }
}

/// A complete, decompressed and validated data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Bytes,
}

/// Message being accumulated.
struct Fragment {
    kind: MessageKind,
    is_compressed: bool,
    /// Payload length of all frames seen so far, as announced on the wire.
    wire_len: u64,
    /// Whether the frame currently being received is the last one.
    fin: bool,
}

/// Reassembles data frames into messages.
pub struct Reassembler {
    fragment: Option<Fragment>,
    accumulated: BytesMut,
    validator: Utf8Validator,
    utf8_validate: bool,
    max_frame_payload_size: u64,
    max_message_payload_size: u64,
}

impl Reassembler {
    /// Creates a reassembler. A limit of 0 disables the respective check.
    pub fn new(
        utf8_validate: bool,
        max_frame_payload_size: usize,
        max_message_payload_size: usize,
    ) -> Self {
        Self {
            fragment: None,
            accumulated: BytesMut::with_capacity(1024),
            validator: Utf8Validator::new(),
            utf8_validate,
            max_frame_payload_size: max_frame_payload_size as u64,
            max_message_payload_size: max_message_payload_size as u64,
        }
    }

    /// Returns `true` while a message is being accumulated.
    pub fn inside_message(&self) -> bool {
        self.fragment.is_some()
    }

    /// Payload of the current message accumulated so far, after decompression.
    pub fn buffered(&self) -> usize {
        self.accumulated.len()
    }

    /// Starts a data frame.
    ///
    /// The first frame of a message must be Text or Binary, every later one a
    /// Continuation. Size limits are checked against the announced length so oversized
    /// frames are rejected before their payload is buffered.
    pub fn begin_frame(
        &mut self,
        header: &FrameHeader,
        pmce: Option<&mut PerMessageCompress>,
    ) -> Result<()> {
        if self.max_frame_payload_size > 0 && header.payload_len > self.max_frame_payload_size {
            return Err(WebSocketError::FrameTooLarge(header.payload_len));
        }

        match header.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }

                let kind = if header.opcode == OpCode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                };

                if header.is_compressed() {
                    pmce.ok_or(WebSocketError::CompressionNotSupported)?
                        .start_decompress_message()?;
                }
                if kind == MessageKind::Text {
                    self.validator.reset();
                }

                self.accumulated.clear();
                self.fragment = Some(Fragment {
                    kind,
                    is_compressed: header.is_compressed(),
                    wire_len: 0,
                    fin: header.fin,
                });
            }
            OpCode::Continuation => {
                if header.is_compressed() {
                    return Err(WebSocketError::CompressedContinuationFrame);
                }
                let fragment = self
                    .fragment
                    .as_mut()
                    .ok_or(WebSocketError::InvalidContinuationFrame)?;
                fragment.fin = header.fin;
            }
            _ => return Err(WebSocketError::InvalidState("control frame in reassembler")),
        }

        let fragment = self
            .fragment
            .as_mut()
            .ok_or(WebSocketError::InvalidContinuationFrame)?;
        fragment.wire_len = fragment.wire_len.saturating_add(header.payload_len);
        if self.max_message_payload_size > 0 && fragment.wire_len > self.max_message_payload_size
        {
            return Err(WebSocketError::MessageTooBig(fragment.wire_len));
        }

        Ok(())
    }

    /// Appends an unmasked payload chunk of the current frame.
    pub fn frame_data(
        &mut self,
        data: &[u8],
        pmce: Option<&mut PerMessageCompress>,
    ) -> Result<()> {
        let fragment = self
            .fragment
            .as_ref()
            .ok_or(WebSocketError::InvalidState("no message in progress"))?;

        if fragment.is_compressed {
            let pmce = pmce.ok_or(WebSocketError::CompressionNotSupported)?;
            let output = pmce.decompress_message_data(data)?;
            self.append(&output)
        } else {
            self.append(data)
        }
    }

    /// Ends the current frame. Returns the message when the frame was the last one.
    pub fn end_frame(&mut self, pmce: Option<&mut PerMessageCompress>) -> Result<Option<Message>> {
        let fragment = self
            .fragment
            .as_ref()
            .ok_or(WebSocketError::InvalidState("no message in progress"))?;
        if !fragment.fin {
            return Ok(None);
        }

        if fragment.is_compressed {
            let pmce = pmce.ok_or(WebSocketError::CompressionNotSupported)?;
            let tail = pmce.end_decompress_message()?;
            self.append(&tail)?;
        }

        let Some(fragment) = self.fragment.take() else {
            return Ok(None);
        };

        if fragment.kind == MessageKind::Text
            && self.utf8_validate
            && !self.validator.feed(&[]).ends_on_codepoint
        {
            return Err(WebSocketError::IncompleteUTF8 {
                offset: self.validator.total_index(),
            });
        }

        // hand out the buffer and start over with a small one
        let payload = std::mem::replace(&mut self.accumulated, BytesMut::with_capacity(1024));
        Ok(Some(Message {
            kind: fragment.kind,
            payload: payload.freeze(),
        }))
    }

    /// Drops any partial message.
    pub fn reset(&mut self) {
        self.fragment = None;
        self.accumulated.clear();
        self.validator.reset();
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let size = (self.accumulated.len() + data.len()) as u64;
        if self.max_message_payload_size > 0 && size > self.max_message_payload_size {
            return Err(WebSocketError::MessageTooBig(size));
        }

        let is_text = matches!(
            self.fragment,
            Some(Fragment {
                kind: MessageKind::Text,
                ..
            })
        );
        if is_text && self.utf8_validate {
            let status = self.validator.feed(data);
            if !status.valid {
                return Err(WebSocketError::InvalidUTF8 {
                    offset: status.error_offset.unwrap_or(status.total_index),
                });
            }
        }

        self.accumulated.extend_from_slice(data);
        Ok(())
    }
}
