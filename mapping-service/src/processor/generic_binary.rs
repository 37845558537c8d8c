//! Opaque binary payloads.
//!
//! The bytes are wrapped as `{"message": <hex>, "bytes": [..]}`; source
//! paths address either the hex string or single byte offsets.

use serde_json::{json, Value};

use crate::context::{Payload, ProcessingContext};
use crate::error::ProcessingError;
use crate::processor::json::{extract_substitutions, with_topic_levels};
use crate::processor::PayloadProcessor;

pub struct GenericBinaryProcessor;

impl PayloadProcessor for GenericBinaryProcessor {
    fn deserialize_payload(
        &self,
        context: &mut ProcessingContext,
        raw: &[u8],
    ) -> Result<(), ProcessingError> {
        let bytes: Vec<Value> = raw.iter().map(|b| Value::from(*b)).collect();
        let document = json!({ "message": hex::encode(raw), "bytes": bytes });
        context.payload = Payload::Json(with_topic_levels(document, &context.topic));
        Ok(())
    }

    fn extract_from_source(&self, context: &mut ProcessingContext) -> Result<(), ProcessingError> {
        extract_substitutions(context)
    }
}
