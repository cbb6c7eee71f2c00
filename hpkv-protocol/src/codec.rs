//! JSON text codec for WebSocket messages.
//!
//! Each WebSocket text frame carries exactly one JSON object, so no framing
//! is needed beyond the transport's own message boundaries.

use crate::error::ProtocolError;
use crate::message::{Notification, Request, Response};
use crate::MAX_MESSAGE_SIZE;
use serde_json::Value;

/// An inbound message, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Answer to a request, correlated by `messageId`.
    Response(Response),
    /// Server push for a subscribed key.
    Notification(Notification),
}

/// Encodes messages into text frames.
pub struct Encoder;

impl Encoder {
    pub fn encode_request(request: &Request) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(request)?)
    }

    pub fn encode_response(response: &Response) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(response)?)
    }

    pub fn encode_notification(notification: &Notification) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(notification)?)
    }
}

/// Decodes text frames into messages.
pub struct Decoder;

impl Decoder {
    /// Decodes and classifies a message received by a client.
    pub fn decode_inbound(text: &str) -> Result<Inbound, ProtocolError> {
        check_size(text)?;

        let msg: Value = serde_json::from_str(text)?;
        if msg.get("type").and_then(Value::as_str) == Some(Notification::TYPE) {
            return Ok(Inbound::Notification(serde_json::from_value(msg)?));
        }

        match msg.get("messageId") {
            Some(id) if !id.is_null() => Ok(Inbound::Response(serde_json::from_value(msg)?)),
            _ => Err(ProtocolError::MissingField("messageId")),
        }
    }

    /// Decodes a request (server side).
    pub fn decode_request(text: &str) -> Result<Request, ProtocolError> {
        check_size(text)?;
        Ok(serde_json::from_str(text)?)
    }

    /// Decodes a binary frame, which must hold UTF-8 JSON.
    pub fn decode_inbound_bytes(data: &[u8]) -> Result<Inbound, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::decode_inbound(text)
    }
}

fn check_size(text: &str) -> Result<(), ProtocolError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Operation;
    use proptest::prelude::*;

    #[test]
    fn test_request_encoding_is_wire_shape() {
        let request = Request::new(42, Operation::Get, "user:1");
        let encoded = Encoder::encode_request(&request).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["messageId"], 42);
        assert_eq!(value["op"], 1);
        assert_eq!(value["key"], "user:1");

        let decoded = Decoder::decode_request(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_decode_inbound_response() {
        let inbound = Decoder::decode_inbound(r#"{"messageId":5,"value":"hello"}"#).unwrap();
        match inbound {
            Inbound::Response(resp) => {
                assert_eq!(resp.message_id, 5);
                assert_eq!(resp.value.as_deref(), Some("hello"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_inbound_notification() {
        let inbound = Decoder::decode_inbound(
            r#"{"type":"notification","key":"stock:AAPL","value":"190.1","timestamp":1}"#,
        )
        .unwrap();
        assert!(matches!(inbound, Inbound::Notification(n) if n.key.as_deref() == Some("stock:AAPL")));
    }

    #[test]
    fn test_decode_inbound_without_id() {
        let err = Decoder::decode_inbound(r#"{"error":"unauthorized"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("messageId")));
    }

    #[test]
    fn test_decode_inbound_malformed() {
        assert!(matches!(
            Decoder::decode_inbound("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            Decoder::decode_inbound_bytes(&[0xff, 0xfe]),
            Err(ProtocolError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let big = format!(r#"{{"messageId":1,"value":"{}"}}"#, "x".repeat(MAX_MESSAGE_SIZE));
        assert!(matches!(
            Decoder::decode_inbound(&big),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    proptest! {
        #[test]
        fn decode_inbound_never_panics(text in ".{0,256}") {
            let _ = Decoder::decode_inbound(&text);
        }

        #[test]
        fn response_id_is_preserved(id in 1u64.., value in proptest::option::of(".{0,64}")) {
            let mut response = Response::ok(id);
            response.value = value.clone();
            let encoded = Encoder::encode_response(&response).unwrap();
            match Decoder::decode_inbound(&encoded).unwrap() {
                Inbound::Response(decoded) => {
                    prop_assert_eq!(decoded.message_id, id);
                    prop_assert_eq!(decoded.value, value);
                }
                Inbound::Notification(_) => prop_assert!(false, "classified as notification"),
            }
        }
    }
}
