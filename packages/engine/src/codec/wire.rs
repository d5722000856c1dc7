// packages/engine/src/codec/wire.rs
//! Versioned envelope for everything that crosses the isolation boundary

use crate::utils::errors::{EngineError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current wire format version
pub const WIRE_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u16,
    pub body: T,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u16,
}

/// Encode a message as a single line of JSON
pub fn encode<T: Serialize>(body: &T) -> Result<String> {
    let envelope = Envelope {
        version: WIRE_VERSION,
        body,
    };
    serde_json::to_string(&envelope).map_err(|e| EngineError::Codec(e.to_string()))
}

/// Decode a message, rejecting versions this build does not understand
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
    let probe: VersionProbe = serde_json::from_str(line)
        .map_err(|e| EngineError::Codec(format!("malformed envelope: {}", e)))?;

    if probe.version != WIRE_VERSION {
        return Err(EngineError::Codec(format!(
            "unsupported wire version {} (expected {})",
            probe.version, WIRE_VERSION
        )));
    }

    let envelope: Envelope<T> = serde_json::from_str(line)
        .map_err(|e| EngineError::Codec(format!("malformed message body: {}", e)))?;
    Ok(envelope.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::{Blob, Value};

    #[test]
    fn test_envelope_carries_version() {
        let line = encode(&Value::Int(5)).unwrap();
        assert_eq!(line, r#"{"version":1,"body":{"t":"int","v":5}}"#);
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_decode_structured_value() {
        let value = Value::map([
            ("items", Value::List(vec![Value::Int(1), Value::Null])),
            ("raw", Value::Blob(Blob::new("image/png", vec![1, 2, 3]))),
        ]);
        let decoded: Value = decode(&encode(&value).unwrap()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let err = decode::<Value>(r#"{"version":2,"body":{"t":"null"}}"#).unwrap_err();
        assert!(err.to_string().contains("unsupported wire version 2"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode::<Value>("not json").is_err());
    }
}
