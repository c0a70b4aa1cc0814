//! Serde helpers for lenient frame payload decoding.
//!
//! When the `tracing` feature is enabled, fields a payload type does not capture are
//! logged at `trace` level so protocol drift between client and server builds shows up
//! in logs without failing the frame.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::Result;
use crate::error::FrameError;
#[cfg(feature = "tracing")]
use crate::types::TYPE_FIELD;

/// A `serde_as` type that deserializes strings or integers as `String`.
///
/// Identity and analysis identifiers are issued by other services; some emit them as
/// numbers. Use with `#[serde_as(as = "StringFromAny")]` for `String` fields or
/// `#[serde_as(as = "Option<StringFromAny>")]` for `Option<String>`.
pub struct StringFromAny;

impl<'de> serde_with::DeserializeAs<'de, String> for StringFromAny {
    fn deserialize_as<D>(deserializer: D) -> std::result::Result<String, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use std::fmt;

        use serde::de::{self, Visitor};

        struct StringOrNumberVisitor;

        impl Visitor<'_> for StringOrNumberVisitor {
            type Value = String;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("string or integer")
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v.to_owned())
            }

            fn visit_string<E>(self, v: String) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v)
            }

            fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v.to_string())
            }

            fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v.to_string())
            }
        }

        deserializer.deserialize_any(StringOrNumberVisitor)
    }
}

impl serde_with::SerializeAs<String> for StringFromAny {
    fn serialize_as<S>(source: &String, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(source)
    }
}

/// A `serde_as` type for client-supplied timestamps on `Option<i64>` fields.
///
/// Integers pass through, finite floats are rounded and numeric strings are parsed.
/// Any other value decodes as `None` instead of failing the frame, since the hub stamps
/// relayed frames with its own clock. Pair with `#[serde(default)]`.
pub struct LenientTimestamp;

impl<'de> serde_with::DeserializeAs<'de, Option<i64>> for LenientTimestamp {
    fn deserialize_as<D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::Deserialize as _;

        Ok(match Value::deserialize(deserializer)? {
            Value::Number(number) => number_to_millis(&number),
            Value::String(text) => {
                let text = text.trim();
                text.parse::<i64>().ok().or_else(|| {
                    text.parse::<serde_json::Number>()
                        .ok()
                        .and_then(|number| number_to_millis(&number))
                })
            }
            _ => None,
        })
    }
}

impl serde_with::SerializeAs<Option<i64>> for LenientTimestamp {
    fn serialize_as<S>(source: &Option<i64>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match source {
            Some(millis) => serializer.serialize_some(millis),
            None => serializer.serialize_none(),
        }
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "Rounded millisecond values outside the i64 range saturate, which is acceptable for an informational field"
)]
fn number_to_millis(number: &serde_json::Number) -> Option<i64> {
    if let Some(millis) = number.as_i64() {
        return Some(millis);
    }
    if let Some(millis) = number.as_u64() {
        return Some(i64::try_from(millis).unwrap_or(i64::MAX));
    }
    number
        .as_f64()
        .filter(|millis| millis.is_finite())
        .map(|millis| millis.round() as i64)
}

/// Decode the payload of a known frame type.
///
/// Failures are reported as [`FrameError::Malformed`] naming the frame type and the
/// offending field path, e.g. ``malformed frame: `chat` frame at `message`: missing field
/// `message` ``.
pub(crate) fn decode_payload<T: DeserializeOwned>(
    msg_type: &str,
    object: Map<String, Value>,
) -> Result<T> {
    let value = Value::Object(object);

    #[cfg(feature = "tracing")]
    log_unknown_fields::<T>(msg_type, &value);

    serde_path_to_error::deserialize(value).map_err(|err| {
        let path = err.path().to_string();
        let reason = if path == "." {
            format!("`{msg_type}` frame: {}", err.inner())
        } else {
            format!("`{msg_type}` frame at `{path}`: {}", err.inner())
        };
        FrameError::Malformed(reason).into()
    })
}

#[cfg(feature = "tracing")]
fn log_unknown_fields<T: DeserializeOwned>(msg_type: &str, value: &Value) {
    let mut unknown_paths: Vec<String> = Vec::new();
    let probe: std::result::Result<T, _> = serde_ignored::deserialize(value, |path| {
        let path = path.to_string();
        if path != TYPE_FIELD {
            unknown_paths.push(path);
        }
    });

    if probe.is_ok() {
        for field in unknown_paths {
            tracing::trace!(frame_type = %msg_type, %field, "unrecognized field in frame");
        }
    }
}
