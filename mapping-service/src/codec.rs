//! UDP frame codec.
//!
//! A frame is the publish topic, one NUL byte, then the raw payload:
//!
//! ```text
//! device/dev-1/measure\0{"temp": 21.5}
//! ```

use thiserror::Error;

use crate::topic;

const SEPARATOR: u8 = 0;

/// One message as received from the broker side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame has no topic separator")]
    MissingSeparator,
    #[error("topic is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("topic is empty")]
    EmptyTopic,
    #[error("published topic {0:?} contains a wildcard")]
    WildcardTopic(String),
}

/// Decode a datagram into a [`Frame`]. The topic is normalised.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    let split = bytes
        .iter()
        .position(|b| *b == SEPARATOR)
        .ok_or(FrameError::MissingSeparator)?;
    let raw_topic = std::str::from_utf8(&bytes[..split])?;

    if raw_topic.trim().is_empty() {
        return Err(FrameError::EmptyTopic);
    }
    if topic::is_wildcard(raw_topic) {
        return Err(FrameError::WildcardTopic(raw_topic.to_string()));
    }

    Ok(Frame {
        topic: topic::normalize(raw_topic),
        payload: bytes[split + 1..].to_vec(),
    })
}

pub fn encode(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(topic.len() + 1 + payload.len());
    out.extend_from_slice(topic.as_bytes());
    out.push(SEPARATOR);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_valid_frame() {
        let frame = decode(b"device/dev-1/measure\0{\"temp\": 21.5}").unwrap();
        assert_eq!(frame.topic, "device/dev-1/measure");
        assert_eq!(frame.payload, b"{\"temp\": 21.5}");
    }

    #[test]
    fn payload_may_contain_nul_and_be_empty() {
        let frame = decode(&encode("bin/x", &[1, 0, 2])).unwrap();
        assert_eq!(frame.payload, vec![1, 0, 2]);
        assert!(decode(b"bin/x\0").unwrap().payload.is_empty());
    }

    #[test]
    fn topic_is_normalised() {
        assert_eq!(decode(b"//device/dev-1//\0{}").unwrap().topic, "/device/dev-1/");
    }

    #[test]
    fn decode_missing_separator() {
        assert!(matches!(decode(b"no separator"), Err(FrameError::MissingSeparator)));
    }

    #[test]
    fn decode_bad_topics() {
        assert!(matches!(decode(b"  \0{}"), Err(FrameError::EmptyTopic)));
        assert!(matches!(decode(b"device/+\0{}"), Err(FrameError::WildcardTopic(_))));
        assert!(matches!(decode(&[0xff, 0xfe, 0, b'x']), Err(FrameError::Utf8(_))));
    }
}
