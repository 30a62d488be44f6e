//! Incremental UTF-8 validation.
//!
//! Text messages arrive in pieces: split across frames, and frames split across reads.
//! [`Utf8Validator`] consumes those pieces one after the other and fails on the very
//! first byte that cannot be part of a well-formed UTF-8 sequence, without waiting for
//! the end of the message.
//!
//! The validator is Bjoern Hoehrmann's table-driven DFA
//! (<http://bjoern.hoehrmann.de/utf-8/decoder/dfa/>). It rejects overlong encodings,
//! UTF-16 surrogates and code points above U+10FFFF.
//!
//! ```rust
//! use wsengine::utf8::Utf8Validator;
//!
//! let mut validator = Utf8Validator::new();
//! // 'κ' split across two reads
//! let status = validator.feed(&[0xCE]);
//! assert!(status.valid && !status.ends_on_codepoint);
//! let status = validator.feed(&[0xBA]);
//! assert!(status.valid && status.ends_on_codepoint);
//! ```

const UTF8_ACCEPT: u8 = 0;
const UTF8_REJECT: u8 = 1;

#[rustfmt::skip]
static UTF8_DFA: [u8; 400] = [
    // byte classes
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 00..0f
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 10..1f
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 20..2f
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 30..3f
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 40..4f
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 50..5f
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 60..6f
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 70..7f
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 80..8f
    9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, // 90..9f
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, // a0..af
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, // b0..bf
    8, 8, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, // c0..cf
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, // d0..df
    10, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 4, 3, 3, // e0..ef
    11, 6, 6, 6, 5, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, // f0..ff
    // state transitions
    0, 1, 2, 3, 5, 8, 7, 1, 1, 1, 4, 6, 1, 1, 1, 1, // s0
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // s1
    1, 0, 1, 1, 1, 1, 1, 0, 1, 0, 1, 1, 1, 1, 1, 1, // s2
    1, 2, 1, 1, 1, 1, 1, 2, 1, 2, 1, 1, 1, 1, 1, 1, // s3
    1, 1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 1, // s4
    1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, // s5
    1, 1, 1, 1, 1, 1, 1, 3, 1, 3, 1, 1, 1, 1, 1, 1, // s6
    1, 3, 1, 1, 1, 1, 1, 3, 1, 3, 1, 1, 1, 1, 1, 1, // s7
    1, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // s8
];

/// Outcome of a single [`Utf8Validator::feed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utf8Status {
    /// `false` once any byte so far could not be part of valid UTF-8.
    pub valid: bool,
    /// `true` if the bytes seen so far end exactly on a code point boundary.
    pub ends_on_codepoint: bool,
    /// Bytes of this chunk consumed before stopping (the index of the rejected byte on failure).
    pub current_index: usize,
    /// Bytes consumed over the validator's lifetime, counting the current chunk up to `current_index`.
    pub total_index: usize,
    /// Absolute offset of the first byte of the sequence that made the stream invalid.
    pub error_offset: Option<usize>,
}

impl From<Utf8Status> for (bool, bool, usize, usize) {
    fn from(status: Utf8Status) -> Self {
        (
            status.valid,
            status.ends_on_codepoint,
            status.current_index,
            status.total_index,
        )
    }
}

/// Streaming UTF-8 validator.
///
/// Feeding the same bytes in one call or split across many calls yields the same
/// verdict, the same `total_index` and the same `error_offset`.
#[derive(Debug, Clone)]
pub struct Utf8Validator {
    state: u8,
    total_index: usize,
    sequence_start: usize,
}

impl Default for Utf8Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Utf8Validator {
    /// Creates a validator at the start of a stream.
    pub fn new() -> Self {
        Self {
            state: UTF8_ACCEPT,
            total_index: 0,
            sequence_start: 0,
        }
    }

    /// Resets the validator so it can be reused for a new message.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Returns `true` if no invalid byte has been seen.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.state != UTF8_REJECT
    }

    /// Total number of bytes consumed so far.
    #[inline]
    pub fn total_index(&self) -> usize {
        self.total_index
    }

    /// Consumes the next chunk of the stream.
    ///
    /// Validation stops at the first rejected byte. Once rejected, the validator stays
    /// rejected until [`reset`](Self::reset) and consumes nothing further.
    pub fn feed(&mut self, bytes: &[u8]) -> Utf8Status {
        if self.state == UTF8_REJECT {
            return self.rejected(0);
        }

        for (i, &byte) in bytes.iter().enumerate() {
            if self.state == UTF8_ACCEPT {
                self.sequence_start = self.total_index + i;
            }

            let class = UTF8_DFA[byte as usize] as usize;
            self.state = UTF8_DFA[256 + ((self.state as usize) << 4) + class];

            if self.state == UTF8_REJECT {
                self.total_index += i;
                return self.rejected(i);
            }
        }

        self.total_index += bytes.len();

        Utf8Status {
            valid: true,
            ends_on_codepoint: self.state == UTF8_ACCEPT,
            current_index: bytes.len(),
            total_index: self.total_index,
            error_offset: None,
        }
    }

    fn rejected(&self, current_index: usize) -> Utf8Status {
        Utf8Status {
            valid: false,
            ends_on_codepoint: false,
            current_index,
            total_index: self.total_index,
            error_offset: Some(self.sequence_start),
        }
    }
}

/// One-shot check that `bytes` is complete, valid UTF-8.
#[inline]
pub fn is_utf8(bytes: &[u8]) -> bool {
    #[cfg(feature = "simd")]
    {
        simdutf8::basic::from_utf8(bytes).is_ok()
    }
    #[cfg(not(feature = "simd"))]
    {
        std::str::from_utf8(bytes).is_ok()
    }
}
