//! Wire protocol frames.
//!
//! Every message exchanged over the socket is a JSON object with a string `type` tag.
//! [`Frame`] models the known tags as one payload struct each and keeps anything else in
//! [`Frame::Unknown`], preserving the original tag and fields so it can be routed to
//! topic subscribers and re-serialized unchanged.
//!
//! | Direction | `type`            | Fields                                     |
//! |-----------|-------------------|--------------------------------------------|
//! | S→C       | `info`            | `message`, `timestamp`                     |
//! | C→S       | `ping`            | `timestamp`                                |
//! | S→C       | `pong`            | `timestamp`                                |
//! | both      | `chat`            | `userId`, `message`, `timestamp` (S→C)     |
//! | both      | `analysis_update` | `analysisId`, `status`, `userId`/`timestamp` |
//! | S→C       | `heartbeat`       | `timestamp`                                |

use bon::Builder;
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use serde_with::{serde_as, skip_serializing_none};

use crate::Result;
use crate::error::{Error, FrameError};
use crate::serde_helpers::{LenientTimestamp, StringFromAny, decode_payload};

/// Milliseconds since [`std::time::UNIX_EPOCH`]
pub type Timestamp = i64;

/// Name of the JSON field carrying the frame tag.
pub const TYPE_FIELD: &str = "type";

/// Tags of the frames the protocol defines.
pub mod frame_type {
    pub const INFO: &str = "info";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const CHAT: &str = "chat";
    pub const ANALYSIS_UPDATE: &str = "analysis_update";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Current wall-clock time as a protocol [`Timestamp`].
#[must_use]
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Greeting sent once to a newly admitted connection.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct Info {
    #[builder(into)]
    pub message: String,
    pub timestamp: Timestamp,
}

/// Client liveness probe. The hub answers with a [`Pong`] to the sender only.
#[serde_as]
#[non_exhaustive]
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct Ping {
    #[serde_as(as = "LenientTimestamp")]
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct Pong {
    pub timestamp: Timestamp,
}

/// Chat message. Clients send `userId` + `message`; the hub rebroadcasts with its own
/// `timestamp`.
#[serde_as]
#[non_exhaustive]
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    #[serde_as(as = "Option<StringFromAny>")]
    #[builder(into)]
    pub user_id: Option<String>,
    #[builder(into)]
    pub message: String,
    #[serde_as(as = "LenientTimestamp")]
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

/// Progress notification for a document analysis job.
#[serde_as]
#[non_exhaustive]
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisUpdate {
    #[serde_as(as = "StringFromAny")]
    #[builder(into)]
    pub analysis_id: String,
    #[serde(default)]
    #[builder(into)]
    pub status: Option<String>,
    #[serde_as(as = "Option<StringFromAny>")]
    #[builder(into)]
    pub user_id: Option<String>,
    #[serde_as(as = "LenientTimestamp")]
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

/// Periodic server liveness signal, unrelated to application data.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct Heartbeat {
    pub timestamp: Timestamp,
}

/// A frame whose tag this build does not know.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownFrame {
    /// The raw `type` tag
    pub msg_type: String,
    /// Every other field of the frame
    pub payload: Map<String, Value>,
}

/// One discrete message exchanged over the connection.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Info(Info),
    Ping(Ping),
    Pong(Pong),
    Chat(Chat),
    AnalysisUpdate(AnalysisUpdate),
    Heartbeat(Heartbeat),
    Unknown(UnknownFrame),
}

impl Frame {
    /// Decode a frame from raw socket bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes).map_err(FrameError::Json)?;
        Self::from_value(value)
    }

    /// Decode a frame from an already parsed JSON value.
    ///
    /// A known tag with missing or mistyped fields is an error, never an
    /// [`Frame::Unknown`].
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut object) = value else {
            return Err(Error::malformed_frame("frame is not a JSON object"));
        };

        let msg_type = match object.get(TYPE_FIELD) {
            Some(Value::String(tag)) => tag.clone(),
            Some(_) => return Err(Error::malformed_frame("`type` tag is not a string")),
            None => return Err(Error::malformed_frame("missing `type` tag")),
        };

        let frame = match msg_type.as_str() {
            frame_type::INFO => Self::Info(decode_payload(&msg_type, object)?),
            frame_type::PING => Self::Ping(decode_payload(&msg_type, object)?),
            frame_type::PONG => Self::Pong(decode_payload(&msg_type, object)?),
            frame_type::CHAT => Self::Chat(decode_payload(&msg_type, object)?),
            frame_type::ANALYSIS_UPDATE => {
                Self::AnalysisUpdate(decode_payload(&msg_type, object)?)
            }
            frame_type::HEARTBEAT => Self::Heartbeat(decode_payload(&msg_type, object)?),
            _ => {
                object.remove(TYPE_FIELD);
                Self::Unknown(UnknownFrame {
                    msg_type,
                    payload: object,
                })
            }
        };

        Ok(frame)
    }

    /// The frame's `type` tag.
    #[must_use]
    pub fn frame_type(&self) -> &str {
        match self {
            Self::Info(_) => frame_type::INFO,
            Self::Ping(_) => frame_type::PING,
            Self::Pong(_) => frame_type::PONG,
            Self::Chat(_) => frame_type::CHAT,
            Self::AnalysisUpdate(_) => frame_type::ANALYSIS_UPDATE,
            Self::Heartbeat(_) => frame_type::HEARTBEAT,
            Self::Unknown(unknown) => &unknown.msg_type,
        }
    }

    /// The frame's timestamp, when it carries one.
    #[must_use]
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::Info(info) => Some(info.timestamp),
            Self::Ping(ping) => ping.timestamp,
            Self::Pong(pong) => Some(pong.timestamp),
            Self::Chat(chat) => chat.timestamp,
            Self::AnalysisUpdate(update) => update.timestamp,
            Self::Heartbeat(heartbeat) => Some(heartbeat.timestamp),
            Self::Unknown(unknown) => unknown
                .payload
                .get("timestamp")
                .and_then(Value::as_i64),
        }
    }

    /// Encode the frame as a JSON object with its `type` tag.
    pub fn to_value(&self) -> Result<Value> {
        let mut object = match self {
            Self::Info(payload) => payload_object(payload)?,
            Self::Ping(payload) => payload_object(payload)?,
            Self::Pong(payload) => payload_object(payload)?,
            Self::Chat(payload) => payload_object(payload)?,
            Self::AnalysisUpdate(payload) => payload_object(payload)?,
            Self::Heartbeat(payload) => payload_object(payload)?,
            Self::Unknown(unknown) => unknown.payload.clone(),
        };
        object.insert(
            TYPE_FIELD.to_owned(),
            Value::String(self.frame_type().to_owned()),
        );

        Ok(Value::Object(object))
    }

    /// Encode the frame as JSON text, ready to be written to a socket.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    #[must_use]
    pub fn info<S: Into<String>>(message: S) -> Self {
        Self::Info(Info {
            message: message.into(),
            timestamp: now_millis(),
        })
    }

    #[must_use]
    pub fn ping() -> Self {
        Self::Ping(Ping {
            timestamp: Some(now_millis()),
        })
    }

    #[must_use]
    pub fn pong() -> Self {
        Self::Pong(Pong {
            timestamp: now_millis(),
        })
    }

    #[must_use]
    pub fn heartbeat() -> Self {
        Self::Heartbeat(Heartbeat {
            timestamp: now_millis(),
        })
    }

    /// A client-originated chat message.
    #[must_use]
    pub fn chat<S: Into<String>>(user_id: Option<String>, message: S) -> Self {
        Self::Chat(Chat {
            user_id,
            message: message.into(),
            timestamp: None,
        })
    }

    /// A client-originated analysis progress notification.
    #[must_use]
    pub fn analysis_update<A: Into<String>, S: Into<String>>(
        user_id: Option<String>,
        analysis_id: A,
        status: S,
    ) -> Self {
        Self::AnalysisUpdate(AnalysisUpdate {
            analysis_id: analysis_id.into(),
            status: Some(status.into()),
            user_id,
            timestamp: None,
        })
    }
}

impl From<UnknownFrame> for Frame {
    fn from(unknown: UnknownFrame) -> Self {
        Self::Unknown(unknown)
    }
}

impl UnknownFrame {
    #[must_use]
    pub fn new<S: Into<String>>(msg_type: S, payload: Map<String, Value>) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload,
        }
    }
}

fn payload_object<T: Serialize>(payload: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(payload)? {
        Value::Object(object) => Ok(object),
        _ => Err(Error::malformed_frame("frame payload is not an object")),
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::Kind;

    #[test]
    fn parses_client_ping() {
        let frame = Frame::parse(br#"{"type":"ping","timestamp":1000}"#).unwrap();

        assert_eq!(frame, Frame::Ping(Ping::builder().timestamp(1000).build()));
        assert_eq!(frame.frame_type(), "ping");
        assert_eq!(frame.timestamp(), Some(1000));
    }

    #[test]
    fn parses_client_chat_without_timestamp() {
        let frame = Frame::parse(br#"{"type":"chat","userId":"u1","message":"hi"}"#).unwrap();

        let Frame::Chat(chat) = frame else {
            panic!("expected chat frame");
        };
        assert_eq!(chat.user_id.as_deref(), Some("u1"));
        assert_eq!(chat.message, "hi");
        assert_eq!(chat.timestamp, None);
    }

    #[test]
    fn numeric_identifiers_are_accepted() {
        let frame = Frame::parse(
            br#"{"type":"analysis_update","analysisId":981,"status":"complete","userId":7}"#,
        )
        .unwrap();

        let Frame::AnalysisUpdate(update) = frame else {
            panic!("expected analysis update");
        };
        assert_eq!(update.analysis_id, "981");
        assert_eq!(update.status.as_deref(), Some("complete"));
        assert_eq!(update.user_id.as_deref(), Some("7"));
    }

    #[test]
    fn chat_without_message_is_malformed() {
        let err = Frame::parse(br#"{"type":"chat","userId":"u1"}"#).unwrap_err();

        assert_eq!(err.kind(), Kind::Frame);
        assert!(err.to_string().contains("message"), "unexpected: {err}");
    }

    #[test]
    fn non_json_is_malformed() {
        let err = Frame::parse(b"definitely not json").unwrap_err();

        assert_eq!(err.kind(), Kind::Frame);
        assert!(matches!(
            err.downcast_ref::<FrameError>(),
            Some(FrameError::Json(_))
        ));
    }

    #[test]
    fn untagged_or_non_object_is_malformed() {
        for raw in [
            br#"{"message":"no tag"}"#.as_slice(),
            br#"{"type":42}"#.as_slice(),
            br#"["ping"]"#.as_slice(),
        ] {
            let err = Frame::parse(raw).unwrap_err();
            assert_eq!(err.kind(), Kind::Frame, "input: {}", String::from_utf8_lossy(raw));
        }
    }

    #[test]
    fn unknown_tag_keeps_its_fields() {
        let frame =
            Frame::parse(br#"{"type":"document_ready","documentId":"d-1","pages":4}"#).unwrap();

        assert_eq!(frame.frame_type(), "document_ready");
        let Frame::Unknown(unknown) = &frame else {
            panic!("expected unknown frame");
        };
        assert_eq!(unknown.payload.get("pages"), Some(&json!(4)));
        assert!(!unknown.payload.contains_key(TYPE_FIELD));

        let value = frame.to_value().unwrap();
        assert_eq!(
            value,
            json!({ "type": "document_ready", "documentId": "d-1", "pages": 4 })
        );
    }

    #[test]
    fn server_chat_serializes_camel_case() {
        let frame = Frame::Chat(
            Chat::builder()
                .user_id("u1")
                .message("hi")
                .timestamp(1_700_000_000_000)
                .build(),
        );

        assert_eq!(
            frame.to_value().unwrap(),
            json!({
                "type": "chat",
                "userId": "u1",
                "message": "hi",
                "timestamp": 1_700_000_000_000_i64
            })
        );
    }

    #[test]
    fn absent_optional_fields_are_not_serialized() {
        let frame = Frame::AnalysisUpdate(
            AnalysisUpdate::builder()
                .analysis_id("a-1")
                .timestamp(5)
                .build(),
        );

        assert_eq!(
            frame.to_value().unwrap(),
            json!({ "type": "analysis_update", "analysisId": "a-1", "timestamp": 5 })
        );
    }

    #[test]
    fn serde_impls_delegate_to_wire_format() {
        let frame: Frame = serde_json::from_value(json!({ "type": "heartbeat", "timestamp": 9 }))
            .unwrap();
        assert_eq!(frame, Frame::Heartbeat(Heartbeat { timestamp: 9 }));

        let text = serde_json::to_string(&frame).unwrap();
        assert_eq!(text, frame.to_json().unwrap());
    }

    #[test]
    fn constructors_stamp_current_time() {
        let before = now_millis();
        let frame = Frame::pong();
        let after = now_millis();

        let stamped = frame.timestamp().unwrap();
        assert!(stamped >= before && stamped <= after);
    }
}
