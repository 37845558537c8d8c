//! Stable message ID generation.
//!
//! The message ID is a hex-encoded SHA-256 hash of the tenant, topic and raw
//! payload. It correlates the log lines and requests of one inbound message.

use sha2::{Digest, Sha256};

/// Compute a stable message ID for an inbound message.
pub fn compute(tenant: &str, topic: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant.as_bytes());
    hasher.update(b"\0");
    hasher.update(topic.as_bytes());
    hasher.update(b"\0");
    hasher.update((payload.len() as u64).to_le_bytes());
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_produce_same_id() {
        let id1 = compute("t100", "device/dev-1/temp", b"{\"t\":21.5}");
        let id2 = compute("t100", "device/dev-1/temp", b"{\"t\":21.5}");
        assert_eq!(id1, id2);
    }

    #[test]
    fn different_payload_produces_different_id() {
        let id1 = compute("t100", "device/dev-1/temp", b"{\"t\":21.5}");
        let id2 = compute("t100", "device/dev-1/temp", b"{\"t\":21.6}");
        assert_ne!(id1, id2);
    }

    #[test]
    fn different_topic_produces_different_id() {
        let id1 = compute("t100", "device/dev-1/temp", b"x");
        let id2 = compute("t100", "device/dev-2/temp", b"x");
        assert_ne!(id1, id2);
    }

    #[test]
    fn different_tenant_produces_different_id() {
        let id1 = compute("t100", "device/dev-1/temp", b"x");
        let id2 = compute("t200", "device/dev-1/temp", b"x");
        assert_ne!(id1, id2);
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let id1 = compute("t1", "00/a", b"");
        let id2 = compute("t100", "/a", b"");
        assert_ne!(id1, id2);
    }

    #[test]
    fn id_is_64_hex_chars() {
        let id = compute("t100", "device/dev-1/temp", b"x");
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
