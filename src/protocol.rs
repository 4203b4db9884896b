//! Wire Protocol
//!
//! JSON frames exchanged over a relay connection.
//!
//! Inbound frames are validated here, at the boundary. Anything that does not
//! decode into an [`InboundEvent`] becomes [`MalformedInput`] and is dropped by
//! the dispatcher without a reply.
//!
//! ```text
//! client → relay   {"type":"subscribe","conversation_id":7}
//!                  {"type":"message","conversation_id":7,"content":"hi","from":"Alice"}
//! relay → client   {"type":"subscribed","conversation_id":7}
//!                  {"type":"message","conversation_id":7,"from":"Alice","content":"hi"}
//!                  {"type":"error","message":"not_in_conversation"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Conversation identifier (always positive once validated)
pub type ConversationId = i64;

/// Sender tag used on bot replies
pub const BOT_SENDER: &str = "bot";

/// Frame that failed boundary validation
#[derive(Debug, Error)]
#[error("malformed frame: {0}")]
pub struct MalformedInput(pub String);

/// Validated client event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Subscribe {
        conversation_id: ConversationId,
    },
    Message {
        /// `None` when the frame carried no usable id; no conversation matches it
        conversation_id: Option<ConversationId>,
        content: String,
        /// Display name supplied by the client, echoed as `from`
        from: Option<String>,
    },
}

/// Raw shape before conversation id coercion
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawInbound {
    Subscribe {
        #[serde(default)]
        conversation_id: Value,
    },
    Message {
        #[serde(default)]
        conversation_id: Value,
        content: String,
        #[serde(default)]
        from: Option<String>,
    },
}

impl InboundEvent {
    /// Parse and validate a text frame
    pub fn parse(text: &str) -> Result<Self, MalformedInput> {
        let raw: RawInbound =
            serde_json::from_str(text).map_err(|e| MalformedInput(e.to_string()))?;

        match raw {
            RawInbound::Subscribe { conversation_id } => {
                let conversation_id = coerce_conversation_id(&conversation_id)
                    .ok_or_else(|| MalformedInput(format!("invalid conversation_id: {}", conversation_id)))?;
                Ok(Self::Subscribe { conversation_id })
            }
            RawInbound::Message {
                conversation_id,
                content,
                from,
            } => Ok(Self::Message {
                conversation_id: coerce_conversation_id(&conversation_id),
                content,
                from,
            }),
        }
    }
}

/// Coerce a loosely-typed JSON value to a conversation id.
///
/// Integers pass through, floats truncate, numeric strings parse on their
/// leading digits and `true` is 1. Zero, negatives and everything else are
/// rejected.
pub fn coerce_conversation_id(value: &Value) -> Option<ConversationId> {
    let id = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))?,
        Value::String(s) => leading_integer(s.trim())?,
        Value::Bool(true) => 1,
        _ => return None,
    };

    (id > 0).then_some(id)
}

fn leading_integer(s: &str) -> Option<i64> {
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|n| sign * n)
}

/// Error codes carried by `error` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoToken,
    InvalidToken,
    Unauthenticated,
    NotInConversation,
    StoreUnavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoToken => "no_token",
            Self::InvalidToken => "invalid_token",
            Self::Unauthenticated => "unauthenticated",
            Self::NotInConversation => "not_in_conversation",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

/// Frame pushed to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundFrame {
    Error {
        message: ErrorCode,
    },
    Subscribed {
        conversation_id: ConversationId,
    },
    Message {
        conversation_id: ConversationId,
        from: String,
        content: String,
    },
}

impl OutboundFrame {
    pub fn error(code: ErrorCode) -> Self {
        Self::Error { message: code }
    }

    pub fn subscribed(conversation_id: ConversationId) -> Self {
        Self::Subscribed { conversation_id }
    }

    pub fn message(
        conversation_id: ConversationId,
        from: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::Message {
            conversation_id,
            from: from.into(),
            content: content.into(),
        }
    }

    /// Serialize to the JSON text sent on the wire
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_subscribe() {
        let event = InboundEvent::parse(r#"{"type":"subscribe","conversation_id":12}"#).unwrap();
        assert_eq!(event, InboundEvent::Subscribe { conversation_id: 12 });
    }

    #[test]
    fn test_parse_subscribe_numeric_string() {
        let event = InboundEvent::parse(r#"{"type":"subscribe","conversation_id":"12"}"#).unwrap();
        assert_eq!(event, InboundEvent::Subscribe { conversation_id: 12 });
    }

    #[test]
    fn test_parse_subscribe_zero_rejected() {
        assert!(InboundEvent::parse(r#"{"type":"subscribe","conversation_id":0}"#).is_err());
        assert!(InboundEvent::parse(r#"{"type":"subscribe"}"#).is_err());
        assert!(InboundEvent::parse(r#"{"type":"subscribe","conversation_id":"abc"}"#).is_err());
    }

    #[test]
    fn test_parse_message_with_display_name() {
        let event = InboundEvent::parse(
            r#"{"type":"message","conversation_id":3,"content":"hello","from":"Alice"}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            InboundEvent::Message {
                conversation_id: Some(3),
                content: "hello".to_string(),
                from: Some("Alice".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_message_without_usable_conversation() {
        for frame in [
            r#"{"type":"message","content":"hi"}"#,
            r#"{"type":"message","conversation_id":0,"content":"hi"}"#,
            r#"{"type":"message","conversation_id":"abc","content":"hi"}"#,
        ] {
            let event = InboundEvent::parse(frame).unwrap();
            assert!(matches!(event, InboundEvent::Message { conversation_id: None, .. }));
        }
    }

    #[test]
    fn test_parse_message_without_content_is_malformed() {
        assert!(InboundEvent::parse(r#"{"type":"message","conversation_id":3}"#).is_err());
        assert!(InboundEvent::parse(r#"{"type":"message","conversation_id":3,"content":42}"#).is_err());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(InboundEvent::parse("not json").is_err());
        assert!(InboundEvent::parse("[]").is_err());
        assert!(InboundEvent::parse(r#"{"conversation_id":3}"#).is_err());
        assert!(InboundEvent::parse(r#"{"type":"typing","conversation_id":3}"#).is_err());
    }

    #[test]
    fn test_coerce_conversation_id() {
        assert_eq!(coerce_conversation_id(&json!(5)), Some(5));
        assert_eq!(coerce_conversation_id(&json!(5.9)), Some(5));
        assert_eq!(coerce_conversation_id(&json!(" 42abc")), Some(42));
        assert_eq!(coerce_conversation_id(&json!(true)), Some(1));
        assert_eq!(coerce_conversation_id(&json!(-3)), None);
        assert_eq!(coerce_conversation_id(&json!(null)), None);
        assert_eq!(coerce_conversation_id(&json!([1])), None);
    }

    #[test]
    fn test_outbound_shapes() {
        let value: Value = serde_json::from_str(&OutboundFrame::error(ErrorCode::NoToken).to_json()).unwrap();
        assert_eq!(value, json!({"type": "error", "message": "no_token"}));

        let value: Value = serde_json::from_str(&OutboundFrame::subscribed(9).to_json()).unwrap();
        assert_eq!(value, json!({"type": "subscribed", "conversation_id": 9}));

        let value: Value = serde_json::from_str(&OutboundFrame::message(9, BOT_SENDER, "R").to_json()).unwrap();
        assert_eq!(
            value,
            json!({"type": "message", "conversation_id": 9, "from": "bot", "content": "R"})
        );
    }

    #[test]
    fn test_error_code_strings_match_wire() {
        for code in [
            ErrorCode::NoToken,
            ErrorCode::InvalidToken,
            ErrorCode::Unauthenticated,
            ErrorCode::NotInConversation,
            ErrorCode::StoreUnavailable,
        ] {
            let wire = serde_json::to_value(code).unwrap();
            assert_eq!(wire, json!(code.as_str()));
        }
    }
}
