//! Length-prefixed wire framing shared by both connection directions.
//!
//! A frame is a little-endian `u32` body length followed by the body:
//! `u64` call id, a one-byte kind tag, then kind-specific bytes. Requests
//! carry a length-prefixed method name and an opaque payload; responses carry
//! either the payload or a UTF-8 error message. Everything richer than this
//! (schemas, compression, sidecars) belongs to the layers above the reactor.

use strand_common::error::{RpcError, RpcResult};
use strand_common::ids::CallId;

/// Upper bound on a frame body; larger announcements poison the connection.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const LEN_PREFIX_BYTES: usize = 4;
const BODY_FIXED_BYTES: usize = 8 + 1;

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE_OK: u8 = 1;
const KIND_RESPONSE_ERROR: u8 = 2;

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request {
        call_id: CallId,
        method: String,
        payload: Vec<u8>,
    },
    ResponseOk {
        call_id: CallId,
        payload: Vec<u8>,
    },
    ResponseError {
        call_id: CallId,
        message: String,
    },
}

/// Appends a request frame to `buf`.
///
/// # Errors
///
/// Returns `RpcError::Network` when the method name does not fit the u16
/// length prefix.
pub fn encode_request(
    buf: &mut Vec<u8>,
    call_id: CallId,
    method: &str,
    payload: &[u8],
) -> RpcResult<()> {
    let Ok(method_len) = u16::try_from(method.len()) else {
        return Err(RpcError::Network(format!(
            "method name of {} bytes exceeds frame limit",
            method.len()
        )));
    };
    let body_len = BODY_FIXED_BYTES + 2 + method.len() + payload.len();
    push_header(buf, body_len, call_id, KIND_REQUEST)?;
    buf.extend_from_slice(&method_len.to_le_bytes());
    buf.extend_from_slice(method.as_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

/// Appends a successful response frame to `buf`.
///
/// # Errors
///
/// Returns `RpcError::Network` when the payload exceeds [`MAX_FRAME_BYTES`].
pub fn encode_response_ok(buf: &mut Vec<u8>, call_id: CallId, payload: &[u8]) -> RpcResult<()> {
    push_header(buf, BODY_FIXED_BYTES + payload.len(), call_id, KIND_RESPONSE_OK)?;
    buf.extend_from_slice(payload);
    Ok(())
}

/// Appends an error response frame to `buf`.
///
/// # Errors
///
/// Returns `RpcError::Network` when the message exceeds [`MAX_FRAME_BYTES`].
pub fn encode_response_error(buf: &mut Vec<u8>, call_id: CallId, message: &str) -> RpcResult<()> {
    push_header(
        buf,
        BODY_FIXED_BYTES + message.len(),
        call_id,
        KIND_RESPONSE_ERROR,
    )?;
    buf.extend_from_slice(message.as_bytes());
    Ok(())
}

fn push_header(buf: &mut Vec<u8>, body_len: usize, call_id: CallId, kind: u8) -> RpcResult<()> {
    if body_len > MAX_FRAME_BYTES {
        return Err(RpcError::Network(format!(
            "frame body of {body_len} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
        )));
    }
    let Ok(body_len) = u32::try_from(body_len) else {
        return Err(RpcError::Network("frame body length overflows u32".to_owned()));
    };
    buf.extend_from_slice(&body_len.to_le_bytes());
    buf.extend_from_slice(&call_id.to_le_bytes());
    buf.push(kind);
    Ok(())
}

/// Removes and decodes one complete frame from the front of `buffer`.
///
/// Returns `Ok(None)` while the buffer holds only a partial frame.
///
/// # Errors
///
/// Returns `RpcError::Network` on oversized announcements, unknown kind tags,
/// truncated bodies, or non-UTF-8 text fields. The buffer is left untouched on
/// error so the caller can tear the connection down.
pub fn decode_frame(buffer: &mut Vec<u8>) -> RpcResult<Option<Frame>> {
    if buffer.len() < LEN_PREFIX_BYTES {
        return Ok(None);
    }
    let mut len_bytes = [0_u8; LEN_PREFIX_BYTES];
    len_bytes.copy_from_slice(&buffer[..LEN_PREFIX_BYTES]);
    let body_len = u32::from_le_bytes(len_bytes) as usize;
    if body_len > MAX_FRAME_BYTES {
        return Err(RpcError::Network(format!(
            "peer announced a frame body of {body_len} bytes, limit is {MAX_FRAME_BYTES}"
        )));
    }
    if body_len < BODY_FIXED_BYTES {
        return Err(RpcError::Network(format!(
            "peer announced a frame body of {body_len} bytes, below the fixed header"
        )));
    }
    if buffer.len() < LEN_PREFIX_BYTES + body_len {
        return Ok(None);
    }

    let body = &buffer[LEN_PREFIX_BYTES..LEN_PREFIX_BYTES + body_len];
    let mut call_id_bytes = [0_u8; 8];
    call_id_bytes.copy_from_slice(&body[..8]);
    let call_id = CallId::from_le_bytes(call_id_bytes);
    let kind = body[8];
    let rest = &body[BODY_FIXED_BYTES..];

    let frame = match kind {
        KIND_REQUEST => decode_request_body(call_id, rest)?,
        KIND_RESPONSE_OK => Frame::ResponseOk {
            call_id,
            payload: rest.to_vec(),
        },
        KIND_RESPONSE_ERROR => Frame::ResponseError {
            call_id,
            message: decode_text(rest, "response error message")?,
        },
        other => {
            return Err(RpcError::Network(format!(
                "unknown frame kind {other} from peer"
            )));
        }
    };
    let _ = buffer.drain(..LEN_PREFIX_BYTES + body_len);
    Ok(Some(frame))
}

fn decode_request_body(call_id: CallId, rest: &[u8]) -> RpcResult<Frame> {
    if rest.len() < 2 {
        return Err(RpcError::Network(
            "request frame is missing its method length".to_owned(),
        ));
    }
    let method_len = usize::from(u16::from_le_bytes([rest[0], rest[1]]));
    if rest.len() < 2 + method_len {
        return Err(RpcError::Network(
            "request frame method is truncated".to_owned(),
        ));
    }
    let method = decode_text(&rest[2..2 + method_len], "request method")?;
    Ok(Frame::Request {
        call_id,
        method,
        payload: rest[2 + method_len..].to_vec(),
    })
}

fn decode_text(bytes: &[u8], what: &str) -> RpcResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| RpcError::Network(format!("{what} is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::{decode_frame, encode_request, encode_response_error, Frame, MAX_FRAME_BYTES};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn partial_delivery_decodes_once_complete() {
        let mut wire = Vec::new();
        encode_request(&mut wire, 7, "Echo", b"hello").expect("request must encode");

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&wire[..5]);
        assert_that!(decode_frame(&mut buffer).expect("partial frame is not an error"), none());

        buffer.extend_from_slice(&wire[5..]);
        let frame = decode_frame(&mut buffer)
            .expect("complete frame must decode")
            .expect("complete frame must be present");
        assert_that!(
            &frame,
            eq(&Frame::Request {
                call_id: 7,
                method: "Echo".to_owned(),
                payload: b"hello".to_vec(),
            })
        );
        assert_that!(buffer.is_empty(), eq(true));
    }

    #[rstest]
    fn oversized_announcement_is_rejected_without_consuming() {
        let mut buffer = Vec::new();
        let body_len = u32::try_from(MAX_FRAME_BYTES + 1).expect("limit fits u32");
        buffer.extend_from_slice(&body_len.to_le_bytes());
        buffer.extend_from_slice(&[0_u8; 16]);

        let error = decode_frame(&mut buffer).expect_err("oversized frame must fail");
        assert_that!(format!("{error}").contains("exceeds"), eq(true));
        assert_that!(buffer.len(), eq(20_usize));
    }

    #[rstest]
    fn unknown_kind_is_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&9_u32.to_le_bytes());
        buffer.extend_from_slice(&1_u64.to_le_bytes());
        buffer.push(9);

        let error = decode_frame(&mut buffer).expect_err("unknown kind must fail");
        assert_that!(format!("{error}").contains("unknown frame kind"), eq(true));
    }

    #[rstest]
    fn error_responses_round_trip_their_message() {
        let mut buffer = Vec::new();
        encode_response_error(&mut buffer, 3, "service queue is full")
            .expect("error response must encode");
        let frame = decode_frame(&mut buffer)
            .expect("frame must decode")
            .expect("frame must be present");
        assert_that!(
            &frame,
            eq(&Frame::ResponseError {
                call_id: 3,
                message: "service queue is full".to_owned(),
            })
        );
    }
}
