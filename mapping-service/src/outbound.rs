//! Rendering of platform payloads for re-publishing.
//!
//! Outbound rules read the platform payload with the same JSONPath
//! extraction as inbound rules. A body that ends up holding a
//! `_TOPIC_LEVEL_` entry uses it to fill the `+` levels of the publish
//! topic; the entry itself is not published.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::context::{Payload, ProcessingContext, Tenant, TOPIC_LEVEL};
use crate::error::ProcessingError;
use crate::model::{Mapping, Qos};
use crate::processor::json::extract_substitutions;
use crate::substitution::{build_bodies, target_template};
use crate::topic;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub mapping_id: String,
    pub topic: String,
    pub payload: Value,
    pub qos: Qos,
}

fn topic_levels(body: &mut Value) -> Vec<String> {
    let Some(levels) = body.as_object_mut().and_then(|m| m.remove(TOPIC_LEVEL)) else {
        return Vec::new();
    };
    let as_level = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match levels {
        Value::Array(items) => items.iter().map(as_level).collect(),
        Value::Null => Vec::new(),
        single => vec![as_level(&single)],
    }
}

/// Render one platform payload through an outbound rule; one message per
/// expanded body.
pub fn render(
    tenant: &Tenant,
    mapping: Arc<Mapping>,
    payload: &Value,
) -> Result<Vec<OutboundMessage>, ProcessingError> {
    let raw = serde_json::to_vec(payload)?;
    let mut context = ProcessingContext::new(tenant.clone(), mapping.publish_topic.clone(), Arc::clone(&mapping), &raw);
    context.payload = Payload::Json(payload.clone());
    extract_substitutions(&mut context)?;

    let template = target_template(&mapping)?;
    // No cache key is set aside as identifier on this side.
    let bodies = build_bodies(&context.post_processing_cache, &template, "");

    Ok(bodies
        .into_iter()
        .map(|prepared| {
            let mut body = prepared.body;
            let levels = topic_levels(&mut body);
            OutboundMessage {
                mapping_id: mapping.id.clone(),
                topic: topic::substitute_wildcards(&mapping.publish_topic, &levels),
                payload: body,
                qos: mapping.qos,
            }
        })
        .collect())
}
