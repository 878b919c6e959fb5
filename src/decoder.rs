//! Decoding of sensor notification payloads.
//!
//! The sensor sends UTF-8 JSON text such as `{"moisturePercent": 52}` on its
//! notifying characteristic. Decoding is pure: no I/O, no clamping.

use crate::reading::SensorReading;
use serde_json::Value;
use thiserror::Error;

/// JSON field carrying the moisture percentage.
pub const MOISTURE_FIELD: &str = "moisturePercent";

/// Why a payload could not be turned into a [`SensorReading`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    NotUtf8(String),
    #[error("payload is not valid JSON: {0}")]
    NotJson(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing moisturePercent field")]
    MissingField,
    #[error("moisturePercent is not an integer: {0}")]
    NotAnInteger(String),
}

/// Decode a raw notification value into a reading.
///
/// # Errors
/// Returns a [`DecodeError`] if the bytes are not UTF-8, not JSON, not a JSON
/// object, or the object lacks an integer `moisturePercent` field.
pub fn decode_payload(data: &[u8]) -> Result<SensorReading, DecodeError> {
    let text = std::str::from_utf8(data).map_err(|e| DecodeError::NotUtf8(e.to_string()))?;
    let json: Value = serde_json::from_str(text).map_err(|e| DecodeError::NotJson(e.to_string()))?;

    let object = json.as_object().ok_or(DecodeError::NotAnObject)?;
    let field = object.get(MOISTURE_FIELD).ok_or(DecodeError::MissingField)?;

    integer_value(field)
        .map(SensorReading::new)
        .ok_or_else(|| DecodeError::NotAnInteger(field.to_string()))
}

/// Whole numbers are accepted even when written as floats (`44.0`, `1e2`).
fn integer_value(value: &Value) -> Option<i64> {
    if let Some(int) = value.as_i64() {
        return Some(int);
    }
    let float = value.as_f64()?;
    // i64::MAX is not representable as f64; the bound below is 2^63.
    (float.fract() == 0.0 && float >= i64::MIN as f64 && float < i64::MAX as f64)
        .then_some(float as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::MoistureStatus;

    #[test]
    fn test_decode_optimal_boundary() {
        let reading = decode_payload(br#"{"moisturePercent": 44}"#).unwrap();
        assert_eq!(reading.moisture_percent, 44);
        assert_eq!(reading.status(), MoistureStatus::Optimal);
    }

    #[test]
    fn test_decode_under_and_over() {
        let under = decode_payload(br#"{"moisturePercent": 43}"#).unwrap();
        assert_eq!(under.status(), MoistureStatus::Underwatered);

        let over = decode_payload(br#"{"moisturePercent": 61}"#).unwrap();
        assert_eq!(over.status(), MoistureStatus::Overwatered);
    }

    #[test]
    fn test_decode_keeps_value_unmodified() {
        assert_eq!(
            decode_payload(br#"{"moisturePercent": 140}"#)
                .unwrap()
                .moisture_percent,
            140
        );
        assert_eq!(
            decode_payload(br#"{"moisturePercent": -3}"#)
                .unwrap()
                .moisture_percent,
            -3
        );
    }

    #[test]
    fn test_decode_ignores_extra_fields() {
        let reading =
            decode_payload(br#"{"sensor": "pot-1", "moisturePercent": 52, "raw": 1803}"#).unwrap();
        assert_eq!(reading.moisture_percent, 52);
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        assert!(matches!(
            decode_payload(&[0x7B, 0xFF, 0xFE, 0x7D]),
            Err(DecodeError::NotUtf8(_))
        ));
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        assert!(matches!(
            decode_payload(br#"{"moisturePercent": "#),
            Err(DecodeError::NotJson(_))
        ));
        assert!(matches!(decode_payload(b""), Err(DecodeError::NotJson(_))));
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        for payload in [&b"44"[..], b"[44]", b"\"moisturePercent\"", b"null"] {
            assert_eq!(decode_payload(payload), Err(DecodeError::NotAnObject));
        }
    }

    #[test]
    fn test_decode_rejects_missing_field() {
        assert_eq!(
            decode_payload(br#"{"moisture": 44}"#),
            Err(DecodeError::MissingField)
        );
        assert_eq!(decode_payload(b"{}"), Err(DecodeError::MissingField));
    }

    #[test]
    fn test_decode_rejects_non_integer_values() {
        for payload in [
            &br#"{"moisturePercent": 44.5}"#[..],
            br#"{"moisturePercent": 0.1}"#,
            br#"{"moisturePercent": "44"}"#,
            br#"{"moisturePercent": null}"#,
            br#"{"moisturePercent": true}"#,
            br#"{"moisturePercent": 1e40}"#,
        ] {
            assert!(
                matches!(decode_payload(payload), Err(DecodeError::NotAnInteger(_))),
                "{}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn test_decode_accepts_whole_floats() {
        assert_eq!(
            decode_payload(br#"{"moisturePercent": 44.0}"#),
            Ok(SensorReading::new(44))
        );
        assert_eq!(
            decode_payload(br#"{"moisturePercent": 1e2}"#),
            Ok(SensorReading::new(100))
        );
        assert_eq!(
            decode_payload(br#"{"moisturePercent": -3.0}"#),
            Ok(SensorReading::new(-3))
        );
    }

    #[test]
    fn test_decode_error_display() {
        assert_eq!(
            DecodeError::MissingField.to_string(),
            "missing moisturePercent field"
        );
        assert_eq!(
            DecodeError::NotAnInteger("\"44\"".into()).to_string(),
            "moisturePercent is not an integer: \"44\""
        );
        assert_eq!(
            DecodeError::NotAnObject.to_string(),
            "payload is not a JSON object"
        );
    }
}
