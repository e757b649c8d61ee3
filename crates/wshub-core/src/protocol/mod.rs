//! Protocol module containing the frame codec, close codes and handshake.

pub mod close;
pub mod frame;
pub mod handshake;

pub use close::{parse_close_payload, CloseCode};
pub use frame::{apply_mask, decode_frame, encode_frame, DecodeStatus, Frame, FrameError, Opcode};
pub use handshake::{
    compute_accept_key, find_request_end, negotiate, normalize_origin, HandshakeError,
    HandshakePolicy, HttpStatus, Negotiated,
};
