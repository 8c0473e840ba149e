//! Socket.IO (Engine.IO v4) text frame decoder
//!
//! Frame grammar: `<engine digit>[<socket digit>][/namespace,][ack id][json]`.
//! Only message frames carrying an event (`42`) or an ack (`43`) produce a
//! `DecodedEvent`; transport housekeeping packets come back as
//! `DecodeError::ControlFrame` so callers can react to pings without a second
//! parsing path.

use serde_json::Value;

use crate::domain::DecodedEvent;
use crate::error::DecodeError;

/// Engine.IO pong reply
pub const PONG: &str = "3";

/// Event name given to acknowledgement frames, which carry no name of their own
pub const ACK_EVENT: &str = "ack";

/// Decode one raw frame. Exactly one attempt per frame, no fallbacks.
pub fn decode(raw: &[u8]) -> Result<DecodedEvent, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::malformed("invalid utf-8"))?;
    decode_str(text)
}

pub fn decode_str(text: &str) -> Result<DecodedEvent, DecodeError> {
    let mut chars = text.chars();
    let engine = chars
        .next()
        .ok_or_else(|| DecodeError::malformed("empty frame"))?;

    match engine {
        '0' => Err(DecodeError::ControlFrame { packet: "open" }),
        '1' => Err(DecodeError::ControlFrame { packet: "close" }),
        '2' => Err(DecodeError::ControlFrame { packet: "ping" }),
        '3' => Err(DecodeError::ControlFrame { packet: "pong" }),
        '5' => Err(DecodeError::ControlFrame { packet: "upgrade" }),
        '6' => Err(DecodeError::ControlFrame { packet: "noop" }),
        '4' => decode_message(&text[1..]),
        c if c.is_ascii_digit() => Err(DecodeError::malformed(format!(
            "unknown engine packet type '{c}'"
        ))),
        _ => Err(DecodeError::malformed("non-numeric frame-type prefix")),
    }
}

fn decode_message(body: &str) -> Result<DecodedEvent, DecodeError> {
    let socket = body
        .chars()
        .next()
        .ok_or_else(|| DecodeError::malformed("message frame without socket packet type"))?;
    let rest = &body[socket.len_utf8()..];

    match socket {
        '0' => Err(DecodeError::ControlFrame { packet: "connect" }),
        '1' => Err(DecodeError::ControlFrame {
            packet: "disconnect",
        }),
        '4' => Err(DecodeError::ControlFrame {
            packet: "connect_error",
        }),
        '2' => {
            let (namespace, ack_id, json) = split_header(rest)?;
            let (event_name, data) = parse_event_body(json)?;
            Ok(DecodedEvent {
                event_name,
                data,
                ack_id,
                namespace,
            })
        }
        '3' => {
            let (namespace, ack_id, json) = split_header(rest)?;
            if ack_id.is_none() {
                return Err(DecodeError::malformed("ack frame without ack id"));
            }
            let data = parse_array(json)?;
            Ok(DecodedEvent {
                event_name: ACK_EVENT.to_string(),
                data: Value::Array(data),
                ack_id,
                namespace,
            })
        }
        '5' | '6' => Err(DecodeError::malformed("binary attachments are not supported")),
        c if c.is_ascii_digit() => Err(DecodeError::malformed(format!(
            "unknown socket packet type '{c}'"
        ))),
        _ => Err(DecodeError::malformed("non-numeric socket packet type")),
    }
}

/// Split `[/ns,][ack id]<json>` into its parts
fn split_header(rest: &str) -> Result<(Option<String>, Option<u64>, &str), DecodeError> {
    let (namespace, rest) = if rest.starts_with('/') {
        let comma = rest
            .find(',')
            .ok_or_else(|| DecodeError::malformed("namespace without terminating comma"))?;
        (Some(rest[..comma].to_string()), &rest[comma + 1..])
    } else {
        (None, rest)
    };

    let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
    let ack_id = if digits > 0 {
        let id = rest[..digits]
            .parse::<u64>()
            .map_err(|_| DecodeError::malformed("ack id out of range"))?;
        Some(id)
    } else {
        None
    };

    Ok((namespace, ack_id, &rest[digits..]))
}

fn parse_array(json: &str) -> Result<Vec<Value>, DecodeError> {
    if json.is_empty() {
        return Err(DecodeError::malformed("truncated payload"));
    }
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(_) => Err(DecodeError::malformed("body is not a JSON array")),
        Err(e) => Err(DecodeError::malformed(format!("invalid JSON body: {e}"))),
    }
}

fn parse_event_body(json: &str) -> Result<(String, Value), DecodeError> {
    let mut items = parse_array(json)?;
    if items.len() != 2 {
        return Err(DecodeError::malformed(format!(
            "event body has {} elements, expected [event_name, data]",
            items.len()
        )));
    }

    let data = items.pop().unwrap_or(Value::Null);
    match items.pop() {
        Some(Value::String(name)) if !name.is_empty() => Ok((name, data)),
        _ => Err(DecodeError::malformed("event name is not a non-empty string")),
    }
}

/// Namespace connect packet, optionally carrying an auth payload
pub fn connect_packet(auth: Option<&Value>) -> String {
    match auth {
        Some(auth) => format!("40{}", auth),
        None => "40".to_string(),
    }
}

/// Encode an event frame as a browser client would send it
pub fn encode_event(event_name: &str, data: &Value) -> String {
    format!("42{}", Value::Array(vec![Value::String(event_name.to_string()), data.clone()]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_event() {
        let event = decode(br#"42["gameStateUpdate",{"tickCount":3}]"#).unwrap();
        assert_eq!(event.event_name, "gameStateUpdate");
        assert_eq!(event.data["tickCount"], 3);
        assert_eq!(event.ack_id, None);
        assert_eq!(event.namespace, None);
    }

    #[test]
    fn test_event_with_ack_and_namespace() {
        let event = decode(br#"42/game,17["playerUpdate",{"cash":1}]"#).unwrap();
        assert_eq!(event.namespace.as_deref(), Some("/game"));
        assert_eq!(event.ack_id, Some(17));
        assert_eq!(event.event_name, "playerUpdate");

        let event = decode(br#"4255["newTrade",{}]"#).unwrap();
        assert_eq!(event.ack_id, Some(55));
        assert_eq!(event.namespace, None);
    }

    #[test]
    fn test_ack_frame() {
        let event = decode(br#"431[{"ok":true}]"#).unwrap();
        assert_eq!(event.event_name, ACK_EVENT);
        assert_eq!(event.ack_id, Some(1));
        assert_eq!(event.data, json!([{"ok": true}]));

        assert!(decode(br#"43[{"ok":true}]"#).is_err());
    }

    #[test]
    fn test_control_frames() {
        for (raw, packet) in [
            (&b"2"[..], "ping"),
            (&b"3"[..], "pong"),
            (&br#"0{"sid":"abc"}"#[..], "open"),
            (&br#"40{"sid":"abc"}"#[..], "connect"),
        ] {
            assert_eq!(decode(raw), Err(DecodeError::ControlFrame { packet }));
        }
    }

    #[test]
    fn test_malformed_frames() {
        let cases: [&[u8]; 8] = [
            b"",
            b"x2[\"a\",1]",
            b"42",
            b"42{\"a\":1}",
            b"42[\"only-name\"]",
            b"42[\"a\",1,2]",
            b"42[\"gameStateUpdate\",{\"tick",
            b"42[7,{}]",
        ];

        for raw in cases {
            let err = decode(raw).unwrap_err();
            assert_eq!(
                err.kind(),
                "malformed_frame",
                "expected malformed for {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_binary_and_invalid_utf8_rejected() {
        assert_eq!(decode(b"451-[\"x\",{}]").unwrap_err().kind(), "malformed_frame");
        assert_eq!(decode(&[0x34, 0x32, 0xff]).unwrap_err().kind(), "malformed_frame");
    }

    #[test]
    fn test_encode_helpers() {
        assert_eq!(connect_packet(None), "40");
        assert_eq!(connect_packet(Some(&json!({"token": "t"}))), r#"40{"token":"t"}"#);

        let frame = encode_event("buyOrder", &json!({"qty": 1}));
        let event = decode_str(&frame).unwrap();
        assert_eq!(event.event_name, "buyOrder");
    }
}
