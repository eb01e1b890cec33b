//! Framing codec for the PostgreSQL wire protocol
//!
//! Decodes accumulated bytes into exactly one [`Frame`] plus the number of
//! bytes consumed, or signals "need more bytes" by returning `Ok(None)`.
//! The very first message on a connection has no leading type byte; all
//! subsequent client messages are `[1-byte tag][4-byte length including
//! the length field][payload]`. Decoding is chunk-boundary independent:
//! arbitrary splits of the input byte stream produce the same message
//! sequence.

use crate::error::{GatewayError, Result};
use crate::protocol::buffer::{write_cstring, write_message, BufferReader};
use crate::protocol::message::{
    frontend_code, AuthenticationRequest, BackendMessage, Frame, FrontendMessage,
};
use bytes::{BufMut, BytesMut};
use pgbridge_core::BackendError;
use std::collections::HashMap;
use tokio_util::codec::{Decoder, Encoder};

/// Magic "protocol version" identifying an SSLRequest
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Magic "protocol version" identifying a CancelRequest
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Upper bound on a single message, to stop a malformed length prefix
/// from ballooning the read buffer
const MAX_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;

/// Startup packets are tiny; PostgreSQL caps them far below regular
/// messages
const MAX_STARTUP_LENGTH: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecodeState {
    /// Awaiting the untagged first message (SSLRequest, CancelRequest, or
    /// StartupMessage)
    Startup,

    /// Awaiting tagged `[tag][len][payload]` messages
    Regular,
}

/// Stateful codec mapping raw frames to typed protocol messages
#[derive(Debug)]
pub struct MessageCodec {
    state: DecodeState,
}

impl MessageCodec {
    /// Create a codec expecting the connection's first (untagged) message
    pub fn new() -> Self {
        Self {
            state: DecodeState::Startup,
        }
    }

    fn decode_startup(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = i32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if !(8..=MAX_STARTUP_LENGTH).contains(&length) {
            return Err(GatewayError::Protocol(format!(
                "Invalid startup message length: {}",
                length
            )));
        }
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let raw = src.split_to(length).freeze();
        let mut reader = BufferReader::new(&raw);
        let _length = reader.read_i32().map_err(malformed)?;
        let code = reader.read_i32().map_err(malformed)?;

        let message = match code {
            SSL_REQUEST_CODE if length == 8 => FrontendMessage::SslRequest,
            CANCEL_REQUEST_CODE if length == 16 => {
                let process_id = reader.read_i32().map_err(malformed)?;
                let secret_key = reader.read_i32().map_err(malformed)?;
                FrontendMessage::CancelRequest {
                    process_id,
                    secret_key,
                }
            }
            _ => {
                let version_major = ((code >> 16) & 0xFFFF) as i16;
                let version_minor = (code & 0xFFFF) as i16;

                // Parameters are only parseable for the protocol we speak;
                // version errors are reported by the connection, not here
                let mut parameters = HashMap::new();
                if version_major == 3 {
                    while reader.remaining() > 0 {
                        let key = reader.read_cstring().map_err(malformed)?;
                        if key.is_empty() {
                            break;
                        }
                        let value = reader.read_cstring().map_err(malformed)?;
                        parameters.insert(key, value);
                    }
                }

                // All subsequent messages carry a tag byte
                self.state = DecodeState::Regular;

                FrontendMessage::Startup {
                    version_major,
                    version_minor,
                    parameters,
                }
            }
        };

        Ok(Some(Frame { raw, message }))
    }

    fn decode_regular(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 5 {
            return Ok(None);
        }

        let tag = src[0];
        let length = i32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if !(4..=MAX_MESSAGE_LENGTH).contains(&length) {
            return Err(GatewayError::Protocol(format!(
                "Invalid message length {} for tag '{}'",
                length, tag as char
            )));
        }

        let frame_length = length + 1;
        if src.len() < frame_length {
            src.reserve(frame_length - src.len());
            return Ok(None);
        }

        let raw = src.split_to(frame_length).freeze();
        let payload = raw.slice(5..);

        let message = match tag {
            frontend_code::PASSWORD => FrontendMessage::Password { payload },
            frontend_code::QUERY => {
                let mut reader = BufferReader::new(&payload);
                let query = reader.read_cstring().map_err(malformed)?;
                FrontendMessage::Query(query)
            }
            frontend_code::TERMINATE => FrontendMessage::Terminate,
            _ => FrontendMessage::Unknown { tag, body: payload },
        };

        Ok(Some(Frame { raw, message }))
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.state {
            DecodeState::Startup => self.decode_startup(src),
            DecodeState::Regular => self.decode_regular(src),
        }
    }
}

impl Encoder<BackendMessage> for MessageCodec {
    type Error = GatewayError;

    fn encode(&mut self, message: BackendMessage, dst: &mut BytesMut) -> Result<()> {
        match message {
            BackendMessage::Authentication(request) => {
                write_message(dst, b'R', |buf| match request {
                    AuthenticationRequest::Ok => buf.put_i32(0),
                    AuthenticationRequest::CleartextPassword => buf.put_i32(3),
                    AuthenticationRequest::Md5Password { salt } => {
                        buf.put_i32(5);
                        buf.put_slice(&salt);
                    }
                    AuthenticationRequest::Sasl { mechanisms } => {
                        buf.put_i32(10);
                        for mechanism in &mechanisms {
                            write_cstring(buf, mechanism);
                        }
                        buf.put_u8(0); // Null terminator for the list
                    }
                    AuthenticationRequest::SaslContinue { data } => {
                        buf.put_i32(11);
                        buf.put_slice(&data);
                    }
                    AuthenticationRequest::SaslFinal { data } => {
                        buf.put_i32(12);
                        buf.put_slice(&data);
                    }
                });
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                write_message(dst, b'K', |buf| {
                    buf.put_i32(process_id);
                    buf.put_i32(secret_key);
                });
            }
            BackendMessage::ParameterStatus { name, value } => {
                write_message(dst, b'S', |buf| {
                    write_cstring(buf, &name);
                    write_cstring(buf, &value);
                });
            }
            BackendMessage::ReadyForQuery(status) => {
                write_message(dst, b'Z', |buf| {
                    buf.put_u8(status.to_byte());
                });
            }
            BackendMessage::ErrorResponse(error) => {
                write_error_or_notice(dst, b'E', &error);
            }
            BackendMessage::NoticeResponse(error) => {
                write_error_or_notice(dst, b'N', &error);
            }
            BackendMessage::SslResponse(accepted) => {
                dst.put_u8(if accepted { b'S' } else { b'N' });
            }
            BackendMessage::Raw(data) => {
                dst.extend_from_slice(&data);
            }
        }

        Ok(())
    }
}

fn write_error_or_notice(dst: &mut BytesMut, tag: u8, error: &BackendError) {
    write_message(dst, tag, |buf| {
        buf.put_u8(b'S');
        write_cstring(buf, error.severity.as_str());

        buf.put_u8(b'V');
        write_cstring(buf, error.severity.as_str());

        buf.put_u8(b'C');
        write_cstring(buf, &error.code);

        buf.put_u8(b'M');
        write_cstring(buf, &error.message);

        if let Some(detail) = &error.detail {
            buf.put_u8(b'D');
            write_cstring(buf, detail);
        }

        if let Some(hint) = &error.hint {
            buf.put_u8(b'H');
            write_cstring(buf, hint);
        }

        if let Some(position) = error.position {
            buf.put_u8(b'P');
            write_cstring(buf, &position.to_string());
        }

        // Field list terminator
        buf.put_u8(0);
    });
}

/// A short read inside a complete frame means the frame itself is
/// malformed, not that more input is needed
fn malformed(err: GatewayError) -> GatewayError {
    match err {
        GatewayError::Incomplete => GatewayError::Protocol("Truncated message body".to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::buffer::write_startup_message;
    use crate::protocol::message::TransactionStatus;
    use proptest::prelude::*;

    fn startup_bytes(parameters: &[(&str, &str)]) -> BytesMut {
        let mut buf = BytesMut::new();
        write_startup_message(&mut buf, |body| {
            body.put_i32(196608); // 3.0
            for (key, value) in parameters {
                write_cstring(body, key);
                write_cstring(body, value);
            }
            body.put_u8(0);
        });
        buf
    }

    fn query_bytes(sql: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        write_message(&mut buf, b'Q', |body| {
            write_cstring(body, sql);
        });
        buf
    }

    #[test]
    fn test_decode_startup_message() {
        let mut codec = MessageCodec::new();
        let mut buf = startup_bytes(&[("user", "postgres"), ("database", "mydb")]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        match frame.message {
            FrontendMessage::Startup {
                version_major,
                version_minor,
                parameters,
            } => {
                assert_eq!(version_major, 3);
                assert_eq!(version_minor, 0);
                assert_eq!(parameters.get("user"), Some(&"postgres".to_string()));
                assert_eq!(parameters.get("database"), Some(&"mydb".to_string()));
            }
            other => panic!("Expected Startup message, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_ssl_request() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.message, FrontendMessage::SslRequest);

        // An SSLRequest does not leave startup: the real startup message
        // may still follow on the same stream
        let mut buf = startup_bytes(&[("user", "demo")]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(frame.message, FrontendMessage::Startup { .. }));
    }

    #[test]
    fn test_decode_cancel_request() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(42);
        buf.put_i32(1234);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame.message,
            FrontendMessage::CancelRequest {
                process_id: 42,
                secret_key: 1234,
            }
        );
    }

    #[test]
    fn test_decode_query_after_startup() {
        let mut codec = MessageCodec::new();
        let mut buf = startup_bytes(&[("user", "demo")]);
        codec.decode(&mut buf).unwrap().unwrap();

        let mut buf = query_bytes("SELECT 1");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.message, FrontendMessage::Query("SELECT 1".into()));
    }

    #[test]
    fn test_decode_terminate_and_unknown() {
        let mut codec = MessageCodec::new();
        let mut buf = startup_bytes(&[("user", "demo")]);
        codec.decode(&mut buf).unwrap().unwrap();

        let mut buf = BytesMut::new();
        write_message(&mut buf, b'X', |_| {});
        write_message(&mut buf, b'P', |body| {
            write_cstring(body, "stmt");
            write_cstring(body, "SELECT 1");
            body.put_i16(0);
        });

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.message, FrontendMessage::Terminate);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        match frame.message {
            FrontendMessage::Unknown { tag, .. } => assert_eq!(tag, b'P'),
            other => panic!("Expected Unknown message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_preserves_raw_bytes() {
        let mut codec = MessageCodec::new();
        let mut buf = startup_bytes(&[("user", "demo")]);
        codec.decode(&mut buf).unwrap().unwrap();

        let original = query_bytes("SELECT version()");
        let mut buf = original.clone();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.raw, original.freeze());
    }

    #[test]
    fn test_incomplete_input_needs_more_bytes() {
        let mut codec = MessageCodec::new();
        let full = startup_bytes(&[("user", "demo")]);

        let mut buf = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[3..full.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 1..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_bad_length_is_protocol_error() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        buf.put_i32(2); // Shorter than the length field itself
        buf.put_i32(196608);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(GatewayError::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_ready_for_query() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                BackendMessage::ReadyForQuery(TransactionStatus::Idle),
                &mut buf,
            )
            .unwrap();

        assert_eq!(buf[0], b'Z');
        assert_eq!(buf[1..5], 5_i32.to_be_bytes());
        assert_eq!(buf[5], b'I');
    }

    #[test]
    fn test_encode_md5_challenge() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                BackendMessage::Authentication(AuthenticationRequest::Md5Password {
                    salt: [1, 2, 3, 4],
                }),
                &mut buf,
            )
            .unwrap();

        assert_eq!(buf[0], b'R');
        assert_eq!(buf[1..5], 12_i32.to_be_bytes());
        assert_eq!(buf[5..9], 5_i32.to_be_bytes());
        assert_eq!(&buf[9..13], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_encode_error_response_fields() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                BackendMessage::ErrorResponse(BackendError::error("42601", "syntax error")),
                &mut buf,
            )
            .unwrap();

        assert_eq!(buf[0], b'E');
        let body = &buf[5..];
        assert!(body.windows(6).any(|w| w == b"C42601"));
        assert!(body.windows(6).any(|w| w == b"SERROR"));
        assert_eq!(body[body.len() - 1], 0);
    }

    #[test]
    fn test_encode_ssl_response_is_single_byte() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(BackendMessage::SslResponse(false), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"N");
    }

    #[test]
    fn test_encode_raw_passthrough() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        let raw = bytes::Bytes::from_static(b"D\x00\x00\x00\x0b\x00\x01\x00\x00\x00\x011");
        codec
            .encode(BackendMessage::Raw(raw.clone()), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &raw[..]);
    }

    fn sample_stream() -> BytesMut {
        let mut stream = startup_bytes(&[("user", "demo"), ("database", "test")]);
        stream.extend_from_slice(&query_bytes("SELECT 1"));
        let mut other = BytesMut::new();
        write_message(&mut other, b'P', |body| {
            write_cstring(body, "");
            write_cstring(body, "SELECT $1");
            body.put_i16(0);
        });
        write_message(&mut other, b'X', |_| {});
        stream.extend_from_slice(&other);
        stream
    }

    fn decode_all(chunks: &[&[u8]]) -> Vec<Frame> {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }
        assert!(buf.is_empty());
        frames
    }

    proptest! {
        // Decoding a stream split at arbitrary chunk boundaries must
        // produce the same message sequence as decoding it whole
        #[test]
        fn prop_chunk_boundary_independence(split in prop::collection::vec(0usize..1000, 0..8)) {
            let stream = sample_stream();
            let whole = decode_all(&[&stream[..]]);

            let mut boundaries: Vec<usize> =
                split.into_iter().map(|s| s % (stream.len() + 1)).collect();
            boundaries.sort_unstable();

            let mut chunks: Vec<&[u8]> = Vec::new();
            let mut start = 0;
            for boundary in boundaries {
                chunks.push(&stream[start..boundary]);
                start = boundary;
            }
            chunks.push(&stream[start..]);

            let chunked = decode_all(&chunks);
            prop_assert_eq!(whole, chunked);
        }
    }
}
