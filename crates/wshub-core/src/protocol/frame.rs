//! RFC 6455 frame codec.
//!
//! Wire format:
//! ```text
//! byte 0      [FIN:1][RSV:3][opcode:4]
//! byte 1      [MASK:1][len7:7]
//! len7 = 126  -> 2-byte big-endian length follows
//! len7 = 127  -> 8-byte big-endian length follows (MSB must be 0)
//! MASK = 1    -> 4-byte masking key follows the length
//! payload     len bytes, XORed with key[i % 4] when masked
//! ```
//!
//! The codec is stateless.  Decoding works on whatever the caller has
//! buffered so far and reports [`DecodeStatus::Incomplete`] until the whole
//! frame is present, because a transport read may return an arbitrarily
//! short chunk.
//!
//! Fragmentation is not modelled: the FIN bit is always set on encode and
//! ignored on decode.

use thiserror::Error;

/// FIN bit of the first header byte.
const FIN: u8 = 0x80;

/// MASK bit of the second header byte.
const MASK_BIT: u8 = 0x80;

/// Largest payload length stored directly in the 7-bit length field.
pub const MAX_INLINE_LEN: usize = 125;

/// Marker in the 7-bit length field for a 16-bit extended length.
const LEN_16: u8 = 126;

/// Marker in the 7-bit length field for a 64-bit extended length.
const LEN_64: u8 = 127;

/// Largest payload length representable on the wire (bit 63 must be clear).
pub const MAX_PAYLOAD_LEN: u64 = i64::MAX as u64;

/// Errors that can occur while decoding a frame header.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    /// The opcode nibble is not one of text, binary, close, ping or pong.
    #[error("unknown opcode: 0x{0:X}")]
    UnknownOpcode(u8),

    /// The 64-bit extended length has its most significant bit set.
    #[error("invalid 64-bit payload length: 0x{0:016X}")]
    LengthOverflow(u64),

    /// The declared payload length exceeds the caller's limit.
    #[error("payload of {declared} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { declared: u64, limit: u64 },
}

/// Frame type discriminator carried in the low nibble of byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// One decoded frame.  Payload bytes are always stored unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    /// Whether the frame arrived with a masking key.
    pub masked: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates an unmasked frame.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            masked: false,
            payload: payload.into(),
        }
    }

    /// Encodes this frame, generating a fresh masking key when `masked` is set.
    pub fn encode(&self, masked: bool) -> Vec<u8> {
        encode_frame(&self.payload, self.opcode, masked)
    }
}

/// Result of a decode attempt over a partially filled buffer.
#[derive(Debug, PartialEq)]
pub enum DecodeStatus {
    /// A full frame was decoded from the front of the buffer.
    Complete {
        frame: Frame,
        /// Bytes the frame occupied, so the caller can drain them.
        consumed: usize,
    },
    /// The buffer holds only part of a frame.  `required` is the total number
    /// of bytes needed as far as the header read so far reveals.
    Incomplete { required: u64 },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `payload` as a single final frame of type `opcode`.
///
/// When `masked` is true a random 4-byte key is generated with `rand` and
/// the payload is XORed with it, as a client must do.  Servers send frames
/// unmasked.
///
/// # Examples
///
/// ```rust
/// use wshub_core::protocol::frame::{encode_frame, Opcode};
///
/// let bytes = encode_frame(b"hi", Opcode::Text, false);
/// assert_eq!(bytes, vec![0x81, 0x02, b'h', b'i']);
/// ```
pub fn encode_frame(payload: &[u8], opcode: Opcode, masked: bool) -> Vec<u8> {
    let key = masked.then(rand::random::<[u8; 4]>);
    encode_frame_with_key(payload, opcode, key)
}

/// Encodes a frame with an explicit masking key (or none).
///
/// Slice lengths never exceed `isize::MAX`, so the 64-bit length written
/// here always has its most significant bit clear.
pub fn encode_frame_with_key(payload: &[u8], opcode: Opcode, key: Option<[u8; 4]>) -> Vec<u8> {
    let len = payload.len();
    let mask_flag = if key.is_some() { MASK_BIT } else { 0 };

    let mut buf = Vec::with_capacity(14 + len);
    buf.push(FIN | opcode as u8);

    if len <= MAX_INLINE_LEN {
        buf.push(mask_flag | len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(mask_flag | LEN_16);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(mask_flag | LEN_64);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match key {
        Some(key) => {
            buf.extend_from_slice(&key);
            let start = buf.len();
            buf.extend_from_slice(payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.extend_from_slice(payload),
    }
    buf
}

/// XORs every byte with `key[i % 4]`.  Applying it twice restores the input.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Decodes one frame from the front of `buffer` with no payload limit other
/// than the wire maximum.
///
/// # Errors
///
/// Returns [`FrameError`] for an unknown opcode or an invalid 64-bit length.
pub fn decode_frame(buffer: &[u8]) -> Result<DecodeStatus, FrameError> {
    decode_frame_limited(buffer, MAX_PAYLOAD_LEN)
}

/// Decodes one frame from the front of `buffer`, rejecting any declared
/// payload longer than `max_payload` as soon as the header is readable.
///
/// # Errors
///
/// Returns [`FrameError::UnknownOpcode`], [`FrameError::LengthOverflow`] or
/// [`FrameError::PayloadTooLarge`].
pub fn decode_frame_limited(buffer: &[u8], max_payload: u64) -> Result<DecodeStatus, FrameError> {
    if buffer.len() < 2 {
        return Ok(DecodeStatus::Incomplete { required: 2 });
    }

    let opcode = Opcode::try_from(buffer[0] & 0x0F)?;
    let masked = buffer[1] & MASK_BIT != 0;

    let (payload_len, header_len) = match buffer[1] & 0x7F {
        LEN_16 => {
            if buffer.len() < 4 {
                return Ok(DecodeStatus::Incomplete { required: 4 });
            }
            (u16::from_be_bytes([buffer[2], buffer[3]]) as u64, 4)
        }
        LEN_64 => {
            if buffer.len() < 10 {
                return Ok(DecodeStatus::Incomplete { required: 10 });
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buffer[2..10]);
            let len = u64::from_be_bytes(raw);
            if len > MAX_PAYLOAD_LEN {
                return Err(FrameError::LengthOverflow(len));
            }
            (len, 10)
        }
        short => (short as u64, 2),
    };

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            declared: payload_len,
            limit: max_payload,
        });
    }

    let key_len = if masked { 4 } else { 0 };
    let required = header_len as u64 + key_len as u64 + payload_len;
    if (buffer.len() as u64) < required {
        return Ok(DecodeStatus::Incomplete { required });
    }

    // `required` fits in the buffer, so it also fits in usize.
    let payload_start = header_len + key_len;
    let consumed = required as usize;
    let mut payload = buffer[payload_start..consumed].to_vec();

    if masked {
        let key = [
            buffer[header_len],
            buffer[header_len + 1],
            buffer[header_len + 2],
            buffer[header_len + 3],
        ];
        apply_mask(&mut payload, key);
    }

    Ok(DecodeStatus::Complete {
        frame: Frame {
            opcode,
            masked,
            payload,
        },
        consumed,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
