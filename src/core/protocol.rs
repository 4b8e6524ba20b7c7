//! JSON wire codec for the chat session protocol.
//!
//! Outbound frames are tagged by `action`, inbound frames by `type`. Inbound
//! decoding is done against a parsed [`sonic_rs::Value`] so that unknown
//! `type`s can be surfaced as [`Inbound::Other`] instead of failing.

use rand::Rng;
use serde::Serialize;
use sonic_rs::{JsonValueTrait, Value};

use super::frame::WsFrame;
use super::types::{SessionError, SessionResult};

const SESSION_ID_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SESSION_ID_SUFFIX_LEN: usize = 13;

/// Client → server message.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Outbound {
    Chat {
        text: String,
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
    Heartbeat {
        timestamp: i64,
    },
}

impl Outbound {
    /// Chat message without a session id; the session fills it in on send.
    pub fn chat(text: impl Into<String>) -> Self {
        Outbound::Chat {
            text: text.into(),
            session_id: None,
            meta: None,
        }
    }

    pub fn with_meta(mut self, value: Value) -> Self {
        if let Outbound::Chat { meta, .. } = &mut self {
            *meta = Some(value);
        }
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        if let Outbound::Chat { session_id, .. } = &mut self {
            *session_id = Some(id.into());
        }
        self
    }

    pub fn action(&self) -> &'static str {
        match self {
            Outbound::Chat { .. } => "chat",
            Outbound::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Set the chat session id when it is absent or empty. Heartbeats are untouched.
    pub fn fill_session_id(&mut self, id: &str) {
        if let Outbound::Chat { session_id, .. } = self {
            let missing = session_id.as_deref().is_none_or(str::is_empty);
            if missing {
                *session_id = Some(id.to_string());
            }
        }
    }
}

/// Server → client message.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    AssistantTextDelta { text: String },
    AssistantDone,
    ServerEvent { name: String, data: Option<Value> },
    Error { message: String },
    /// Well-formed frame with a `type` this client has no variant for.
    Other { kind: String, payload: Value },
}

impl Inbound {
    pub fn kind(&self) -> &str {
        match self {
            Inbound::AssistantTextDelta { .. } => "assistant_text_delta",
            Inbound::AssistantDone => "assistant_done",
            Inbound::ServerEvent { .. } => "server_event",
            Inbound::Error { .. } => "error",
            Inbound::Other { kind, .. } => kind,
        }
    }
}

pub fn encode_outbound(message: &Outbound) -> SessionResult<WsFrame> {
    let text =
        sonic_rs::to_string(message).map_err(|err| SessionError::Serialization(err.to_string()))?;
    Ok(WsFrame::text(text))
}

pub fn decode_inbound(bytes: &[u8]) -> SessionResult<Inbound> {
    let value: Value =
        sonic_rs::from_slice(bytes).map_err(|err| SessionError::ParseFailed(err.to_string()))?;
    if !value.is_object() {
        return Err(SessionError::Protocol("frame is not a JSON object".to_string()));
    }

    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SessionError::Protocol("missing string field `type`".to_string()))?;

    match kind {
        "assistant_text_delta" => Ok(Inbound::AssistantTextDelta {
            text: required_str(&value, "text", kind)?,
        }),
        "assistant_done" => Ok(Inbound::AssistantDone),
        "server_event" => Ok(Inbound::ServerEvent {
            name: required_str(&value, "name", kind)?,
            data: value.get("data").filter(|v| !v.is_null()).cloned(),
        }),
        "error" => Ok(Inbound::Error {
            message: required_str(&value, "message", kind)?,
        }),
        other => Ok(Inbound::Other {
            kind: other.to_string(),
            payload: value.clone(),
        }),
    }
}

fn required_str(value: &Value, field: &'static str, kind: &str) -> SessionResult<String> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| SessionError::Protocol(format!("`{kind}` frame missing string `{field}`")))
}

/// `session-<unix-ms>-<13 base36 chars>`, generated once per client.
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SESSION_ID_SUFFIX_LEN)
        .map(|_| SESSION_ID_ALPHABET[rng.gen_range(0..SESSION_ID_ALPHABET.len())] as char)
        .collect();
    format!("session-{}-{suffix}", super::heartbeat::now_epoch_ms())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_rs::json;

    fn encode_str(message: &Outbound) -> String {
        let frame = encode_outbound(message).unwrap();
        frame.as_text().unwrap().to_string()
    }

    #[test]
    fn chat_encodes_with_camel_case_session_id() {
        let message = Outbound::chat("hi").with_session_id("session-1-abc");
        let value: Value = sonic_rs::from_str(&encode_str(&message)).unwrap();

        assert_eq!(value.get("action").and_then(|v| v.as_str()), Some("chat"));
        assert_eq!(value.get("text").and_then(|v| v.as_str()), Some("hi"));
        assert_eq!(
            value.get("sessionId").and_then(|v| v.as_str()),
            Some("session-1-abc")
        );
        assert!(value.get("meta").is_none());
    }

    #[test]
    fn chat_meta_is_carried_verbatim() {
        let message = Outbound::chat("hi").with_meta(json!({"lang": "en", "n": 2}));
        let value: Value = sonic_rs::from_str(&encode_str(&message)).unwrap();
        assert_eq!(value.get("meta"), Some(&json!({"lang": "en", "n": 2})));
    }

    #[test]
    fn heartbeat_encodes_timestamp() {
        let text = encode_str(&Outbound::Heartbeat { timestamp: 42 });
        assert_eq!(text, r#"{"action":"heartbeat","timestamp":42}"#);
    }

    #[test]
    fn fill_session_id_only_fills_missing_or_empty() {
        let mut missing = Outbound::chat("a");
        missing.fill_session_id("s-1");
        assert_eq!(missing, Outbound::chat("a").with_session_id("s-1"));

        let mut empty = Outbound::chat("a").with_session_id("");
        empty.fill_session_id("s-1");
        assert_eq!(empty, Outbound::chat("a").with_session_id("s-1"));

        let mut present = Outbound::chat("a").with_session_id("mine");
        present.fill_session_id("s-1");
        assert_eq!(present, Outbound::chat("a").with_session_id("mine"));
    }

    #[test]
    fn decodes_known_inbound_types() {
        assert_eq!(
            decode_inbound(br#"{"type":"assistant_text_delta","text":"Hel"}"#).unwrap(),
            Inbound::AssistantTextDelta {
                text: "Hel".to_string()
            }
        );
        assert_eq!(
            decode_inbound(br#"{"type":"assistant_done"}"#).unwrap(),
            Inbound::AssistantDone
        );
        assert_eq!(
            decode_inbound(br#"{"type":"error","message":"boom"}"#).unwrap(),
            Inbound::Error {
                message: "boom".to_string()
            }
        );
        assert_eq!(
            decode_inbound(br#"{"type":"server_event","name":"tick","data":{"n":1}}"#).unwrap(),
            Inbound::ServerEvent {
                name: "tick".to_string(),
                data: Some(json!({"n": 1})),
            }
        );
        assert_eq!(
            decode_inbound(br#"{"type":"server_event","name":"tick"}"#).unwrap(),
            Inbound::ServerEvent {
                name: "tick".to_string(),
                data: None,
            }
        );
    }

    #[test]
    fn unknown_type_becomes_other() {
        let decoded = decode_inbound(br#"{"type":"set-model","model":"x"}"#).unwrap();
        assert_eq!(decoded.kind(), "set-model");
        match decoded {
            Inbound::Other { payload, .. } => {
                assert_eq!(payload.get("model").and_then(|v| v.as_str()), Some("x"));
            }
            other => panic!("expected Other, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            decode_inbound(b"not json"),
            Err(SessionError::ParseFailed(_))
        ));
        assert!(matches!(
            decode_inbound(b"[1,2,3]"),
            Err(SessionError::Protocol(_))
        ));
        assert!(matches!(
            decode_inbound(br#"{"text":"no type"}"#),
            Err(SessionError::Protocol(_))
        ));
        assert!(matches!(
            decode_inbound(br#"{"type":7}"#),
            Err(SessionError::Protocol(_))
        ));
        assert!(matches!(
            decode_inbound(br#"{"type":"assistant_text_delta"}"#),
            Err(SessionError::Protocol(_))
        ));
        assert!(matches!(
            decode_inbound(&[0xff, 0xfe, 0x7b]),
            Err(SessionError::ParseFailed(_))
        ));
    }

    #[test]
    fn session_ids_have_expected_shape() {
        let id = generate_session_id();
        let mut parts = id.splitn(3, '-');
        assert_eq!(parts.next(), Some("session"));
        assert!(parts.next().unwrap().parse::<u64>().is_ok());
        let suffix = parts.next().unwrap();
        assert_eq!(suffix.len(), 13);
        assert!(suffix.bytes().all(|b| SESSION_ID_ALPHABET.contains(&b)));

        assert_ne!(generate_session_id(), generate_session_id());
    }
}
