//! Wire message format.
//!
//! Every frame on the wire is `[1-byte type tag][bincode body]`. The tag
//! values are stable and must never be reassigned; frames without a
//! recognized tag fall back to heuristic decoding for compatibility with
//! senders that predate the tag.

use crate::serializer::Serializer;
use serde::{Deserialize, Serialize};

/// Tag byte for a [`Request`] frame.
pub const TAG_REQUEST: u8 = 0x01;
/// Tag byte for a [`Response`] frame.
pub const TAG_RESPONSE: u8 = 0x02;

/// An outbound method invocation.
///
/// `id` is unique within the sending engine instance (monotonic, starts at 1)
/// and is echoed back unchanged in the matching [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    /// Wire-level service identifier, independent of any implementing type.
    pub service: String,
    pub method: String,
    /// Encoded parameter list; `None` when the call carries no parameters.
    pub parameters: Option<Vec<u8>>,
}

/// The reply to a [`Request`], correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub success: bool,
    /// Present only on success, and only when the method returned a value.
    pub result: Option<Vec<u8>>,
    /// Present only on failure.
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: Option<Vec<u8>>) -> Self {
        Self {
            id,
            success: true,
            result,
            error: None,
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Message shape detected from the leading tag byte, before any body decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Unknown,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(Request),
    Response(Response),
}

/// Error decoding or encoding a wire frame.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,
    #[error("unrecognized frame ({len} bytes, leading byte {tag:#04x})")]
    Unrecognized { tag: u8, len: usize },
    #[error(transparent)]
    Serialize(#[from] crate::serializer::SerializeError),
}

/// Inspect the leading tag byte without decoding the body.
pub fn detect_kind(frame: &[u8]) -> MessageKind {
    match frame.first() {
        Some(&TAG_REQUEST) => MessageKind::Request,
        Some(&TAG_RESPONSE) => MessageKind::Response,
        _ => MessageKind::Unknown,
    }
}

/// Encode a [`Request`] with its tag byte.
pub fn encode_request(
    serializer: &Serializer,
    request: &Request,
) -> Result<Vec<u8>, crate::serializer::SerializeError> {
    let body = serializer.serialize(request)?;
    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(TAG_REQUEST);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encode a [`Response`] with its tag byte.
pub fn encode_response(
    serializer: &Serializer,
    response: &Response,
) -> Result<Vec<u8>, crate::serializer::SerializeError> {
    let body = serializer.serialize(response)?;
    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(TAG_RESPONSE);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode an inbound frame, routing by tag.
///
/// Frames with no recognized tag are tried as a whole-buffer Response first,
/// then as a Request (untagged-sender compatibility).
pub fn decode(serializer: &Serializer, frame: &[u8]) -> Result<Inbound, CodecError> {
    if frame.is_empty() {
        return Err(CodecError::Empty);
    }
    match detect_kind(frame) {
        MessageKind::Request => Ok(Inbound::Request(serializer.deserialize(&frame[1..])?)),
        MessageKind::Response => Ok(Inbound::Response(serializer.deserialize(&frame[1..])?)),
        MessageKind::Unknown => {
            if let Ok(response) = serializer.deserialize::<Response>(frame) {
                return Ok(Inbound::Response(response));
            }
            if let Ok(request) = serializer.deserialize::<Request>(frame) {
                return Ok(Inbound::Request(request));
            }
            Err(CodecError::Unrecognized {
                tag: frame[0],
                len: frame.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryBuilder;

    fn serializer() -> Serializer {
        Serializer::new(RegistryBuilder::new().build().unwrap())
    }

    #[test]
    fn tag_values_are_stable() {
        assert_eq!(TAG_REQUEST, 0x01);
        assert_eq!(TAG_RESPONSE, 0x02);
    }

    #[test]
    fn request_roundtrip() {
        let s = serializer();
        let req = Request {
            id: 7,
            service: "Inventory".into(),
            method: "AddItem".into(),
            parameters: Some(vec![1, 2, 3]),
        };
        let frame = encode_request(&s, &req).unwrap();
        assert_eq!(detect_kind(&frame), MessageKind::Request);
        assert_eq!(decode(&s, &frame).unwrap(), Inbound::Request(req));
    }

    #[test]
    fn response_roundtrip_with_null_fields() {
        let s = serializer();
        let resp = Response::ok(9, None);
        let frame = encode_response(&s, &resp).unwrap();
        assert_eq!(detect_kind(&frame), MessageKind::Response);
        assert_eq!(decode(&s, &frame).unwrap(), Inbound::Response(resp));
    }

    #[test]
    fn untagged_response_falls_back() {
        let s = serializer();
        let resp = Response::failure(3, "boom");
        // Body without the tag byte, as an untagged sender would emit it.
        let body = s.serialize(&resp).unwrap();
        assert_eq!(decode(&s, &body).unwrap(), Inbound::Response(resp));
    }

    #[test]
    fn empty_frame_is_an_error() {
        let s = serializer();
        assert!(matches!(decode(&s, &[]), Err(CodecError::Empty)));
    }
}
