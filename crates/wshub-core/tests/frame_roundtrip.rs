//! Integration tests for the wshub-core frame codec and handshake.
//!
//! These tests drive the public API the way a client and the server would:
//! a masked client frame is encoded, possibly split across reads, and decoded
//! back into the original payload.

use wshub_core::protocol::frame::{
    apply_mask, decode_frame, encode_frame, encode_frame_with_key, DecodeStatus, Frame, Opcode,
};
use wshub_core::protocol::handshake::compute_accept_key;

/// Deterministic, non-repeating payload so length-boundary bugs show up as
/// mismatched bytes rather than equal zeros.
fn payload_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn decode_complete(bytes: &[u8]) -> (Frame, usize) {
    match decode_frame(bytes).expect("decode must succeed") {
        DecodeStatus::Complete { frame, consumed } => (frame, consumed),
        DecodeStatus::Incomplete { required } => {
            panic!("frame incomplete: have {}, need {required}", bytes.len())
        }
    }
}

#[test]
fn test_masked_text_roundtrip_at_length_boundaries() {
    for len in [0usize, 1, 125, 126, 65535, 65536, 131072] {
        // Arrange
        let payload = payload_of(len);

        // Act
        let wire = encode_frame(&payload, Opcode::Text, true);
        let (frame, consumed) = decode_complete(&wire);

        // Assert
        assert_eq!(consumed, wire.len(), "length {len}: all bytes consumed");
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(frame.masked);
        assert_eq!(frame.payload, payload, "length {len}: payload mismatch");
    }
}

#[test]
fn test_masking_is_an_involution() {
    let original = payload_of(1000);
    let key = [0xDE, 0xAD, 0xBE, 0xEF];

    let mut data = original.clone();
    apply_mask(&mut data, key);
    assert_ne!(data, original);
    apply_mask(&mut data, key);

    assert_eq!(data, original);
}

#[test]
fn test_split_frame_is_incomplete_until_second_chunk() {
    // Arrange
    let wire = encode_frame_with_key(b"hello world", Opcode::Text, Some([1, 2, 3, 4]));
    let (first, second) = wire.split_at(5);

    // Act
    let partial = decode_frame(first).unwrap();
    let mut buffered = first.to_vec();
    buffered.extend_from_slice(second);
    let (frame, _) = decode_complete(&buffered);

    // Assert
    assert!(matches!(partial, DecodeStatus::Incomplete { .. }));
    assert_eq!(frame.payload, b"hello world");
}

#[test]
fn test_every_split_point_of_a_medium_frame_is_incomplete() {
    let wire = encode_frame(&payload_of(300), Opcode::Text, true);

    for split in 0..wire.len() {
        let status = decode_frame(&wire[..split]).unwrap();
        assert!(
            matches!(status, DecodeStatus::Incomplete { .. }),
            "split at {split} must not decode"
        );
    }
}

#[test]
fn test_control_frames_roundtrip_unmasked() {
    for opcode in [Opcode::Ping, Opcode::Pong, Opcode::Close] {
        let wire = encode_frame(b"ctl", opcode, false);
        let (frame, _) = decode_complete(&wire);
        assert_eq!(frame.opcode, opcode);
        assert!(!frame.masked);
        assert_eq!(frame.payload, b"ctl");
    }
}

#[test]
fn test_rfc6455_accept_key() {
    assert_eq!(
        compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
        "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
}
