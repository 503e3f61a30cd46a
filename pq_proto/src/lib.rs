//! Minimal PostgreSQL wire protocol framing primitives.
//!
//! This crate does not attempt to model the whole frontend/backend message
//! set (there is no walkable AST of messages here). It owns exactly the
//! byte-level primitives the proxy needs to hand-assemble and inspect
//! packets: the 4-byte big-endian length prefix, the all-zero
//! authentication-success sentinel, `ErrorResponse` body parsing/building,
//! and `ReadyForQuery`/`AuthenticationOk` framing.

use bytes::{BufMut, BytesMut};

/// Message type tag for an `ErrorResponse`/`NoticeResponse` body.
pub const ERROR_RESPONSE_TAG: u8 = b'E';
/// Message type tag for `ReadyForQuery`.
pub const READY_FOR_QUERY_TAG: u8 = b'Z';
/// Message type tag for an `Authentication*` message.
pub const AUTHENTICATION_TAG: u8 = b'R';
/// Message type tag for a simple `Query`.
pub const QUERY_TAG: u8 = b'Q';
/// Message type tag for an extended-protocol `Parse`.
pub const PARSE_TAG: u8 = b'P';

/// `ReadyForQuery` transaction status: idle.
pub const STATUS_IDLE: u8 = b'I';
/// `ReadyForQuery` transaction status: in a failed transaction block.
pub const STATUS_ERROR: u8 = b'E';
/// `ReadyForQuery` transaction status: in an open transaction block.
pub const STATUS_TRANSACTION: u8 = b'T';

/// SQLSTATE used for handshake/protocol errors before authentication.
pub const SQLSTATE_PROTOCOL_VIOLATION: &str = "08000";
/// SQLSTATE used for authentication and authorization failures.
pub const SQLSTATE_INVALID_AUTH: &str = "28000";

/// Encode a packet length (inclusive of the 4 length bytes themselves) as
/// big-endian bytes.
#[inline]
pub fn encode_length(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Decode a big-endian 4-byte packet length.
#[inline]
pub fn decode_length(bytes: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*bytes)
}

/// The exact 4-byte payload PostgreSQL sends for a successful
/// `AuthenticationOk`/post-challenge success message: four zero bytes.
pub const AUTH_SUCCESS_PAYLOAD: [u8; 4] = [0, 0, 0, 0];

/// Whether a 4-byte authentication payload indicates success.
#[inline]
pub fn is_auth_success(payload: &[u8]) -> bool {
    payload == AUTH_SUCCESS_PAYLOAD
}

/// Extract the human-readable message field (`M`) from a NUL-separated
/// `ErrorResponse` body. Returns `"unknown error"` if no `M` field is
/// present.
pub fn extract_error_message(body: &[u8]) -> String {
    for field in body.split(|&b| b == 0) {
        if let Some((b'M', rest)) = field.split_first() {
            return String::from_utf8_lossy(rest).into_owned();
        }
    }
    "unknown error".to_string()
}

/// Build a complete `ErrorResponse` packet (tag + length + body) for the
/// given SQLSTATE and human-readable message.
pub fn error_response(sqlstate: &str, message: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(b'S');
    body.put_slice(b"ERROR\0");
    body.put_u8(b'V');
    body.put_slice(b"ERROR\0");
    body.put_u8(b'C');
    body.put_slice(sqlstate.as_bytes());
    body.put_u8(0);
    body.put_u8(b'M');
    body.put_slice(message.as_bytes());
    body.put_u8(0);
    body.put_u8(0);

    let mut packet = BytesMut::with_capacity(1 + 4 + body.len());
    packet.put_u8(ERROR_RESPONSE_TAG);
    packet.put_u32((body.len() + 4) as u32);
    packet.extend_from_slice(&body);
    packet
}

/// Build a `ReadyForQuery` packet with the given transaction status byte.
pub fn ready_for_query(status: u8) -> BytesMut {
    let mut packet = BytesMut::with_capacity(6);
    packet.put_u8(READY_FOR_QUERY_TAG);
    packet.put_u32(5);
    packet.put_u8(status);
    packet
}

/// Build the `AuthenticationOk` packet `{R,0,0,0,8,0,0,0,0}`.
pub fn authentication_ok() -> BytesMut {
    let mut packet = BytesMut::with_capacity(9);
    packet.put_u8(AUTHENTICATION_TAG);
    packet.put_u32(8);
    packet.put_u32(0);
    packet
}

/// Wrap a raw SQL string as a simple-query (`Q`) message, including a
/// fresh length header.
pub fn simple_query_message(sql: &str) -> BytesMut {
    framed_string_message(QUERY_TAG, sql)
}

/// Wrap a raw SQL string as an extended-protocol `Parse` (`P`) message
/// body. Note this only re-frames the statement text; the original
/// `Parse` message's statement-name and parameter-type-count fields must
/// be preserved by the caller and prepended/appended around this helper
/// when the original message carried them.
pub fn framed_string_message(tag: u8, payload: &str) -> BytesMut {
    let mut packet = BytesMut::with_capacity(1 + 4 + payload.len() + 1);
    packet.put_u8(tag);
    packet.put_u32((4 + payload.len() + 1) as u32);
    packet.put_slice(payload.as_bytes());
    packet.put_u8(0);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_roundtrip_boundaries() {
        assert_eq!(encode_length(0), [0, 0, 0, 0]);
        assert_eq!(encode_length(1), [0, 0, 0, 1]);
        assert_eq!(encode_length(256), [0, 0, 1, 0]);
        assert_eq!(encode_length(65536), [0, 1, 0, 0]);
        assert_eq!(encode_length(16777216), [1, 0, 0, 0]);
    }

    #[test]
    fn length_roundtrip_exhaustive_sample() {
        for n in [0u32, 1, 7, 8, 255, 256, 65535, 65536, u32::MAX] {
            let encoded = encode_length(n);
            assert_eq!(decode_length(&encoded), n);
        }
    }

    #[test]
    fn auth_success_exact_match_only() {
        assert!(is_auth_success(&[0, 0, 0, 0]));
        assert!(!is_auth_success(&[0, 0, 0, 1]));
        assert!(!is_auth_success(&[1, 0, 0, 0]));
        assert!(!is_auth_success(&[0, 0, 0]));
    }

    #[test]
    fn error_message_extracts_m_field() {
        let body = b"SERROR\0C28000\0Mbad password\0\0";
        assert_eq!(extract_error_message(body), "bad password");
    }

    #[test]
    fn error_message_missing_m_field_is_unknown() {
        let body = b"SERROR\0C28000\0\0";
        assert_eq!(extract_error_message(body), "unknown error");
    }

    #[test]
    fn error_response_packet_shape() {
        let packet = error_response("28000", "bad password");
        assert_eq!(packet[0], b'E');
        let len = decode_length(&[packet[1], packet[2], packet[3], packet[4]]);
        assert_eq!(len as usize, packet.len() - 1);
        assert_eq!(extract_error_message(&packet[5..]), "bad password");
    }

    #[test]
    fn authentication_ok_is_eight_zero_payload() {
        let packet = authentication_ok();
        assert_eq!(&packet[..], &[b'R', 0, 0, 0, 8, 0, 0, 0, 0]);
    }
}
