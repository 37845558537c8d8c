//! JSON payloads addressed with JSONPath.
//!
//! Flat-file and generic-binary payloads are wrapped into JSON documents and
//! reuse [`extract_substitutions`].

use jsonpath_lib::select;
use serde_json::Value;

use crate::context::{Payload, ProcessingContext, SubstituteValue, TOPIC_LEVEL};
use crate::error::ProcessingError;
use crate::model::{RepairStrategy, Substitution};
use crate::processor::PayloadProcessor;
use crate::topic;

pub struct JsonProcessor;

impl PayloadProcessor for JsonProcessor {
    fn deserialize_payload(
        &self,
        context: &mut ProcessingContext,
        raw: &[u8],
    ) -> Result<(), ProcessingError> {
        let document: Value = serde_json::from_slice(raw)?;
        context.payload = Payload::Json(with_topic_levels(document, &context.topic));
        Ok(())
    }

    fn extract_from_source(&self, context: &mut ProcessingContext) -> Result<(), ProcessingError> {
        extract_substitutions(context)
    }
}

/// Expose the levels of `topic` under [`TOPIC_LEVEL`] on object documents.
pub fn with_topic_levels(mut document: Value, topic: &str) -> Value {
    if let Value::Object(map) = &mut document {
        let levels = topic::split_topic_excluding_separator(topic)
            .into_iter()
            .map(Value::String)
            .collect();
        map.insert(TOPIC_LEVEL.to_string(), Value::Array(levels));
    }
    document
}

/// Evaluate every substitution's source path against the JSON payload and
/// append the matches to the cache under the substitution's target path.
pub fn extract_substitutions(context: &mut ProcessingContext) -> Result<(), ProcessingError> {
    let Payload::Json(document) = &context.payload else {
        return Err(ProcessingError::UnexpectedPayload { processor: "JSON" });
    };

    let mut extracted = Vec::with_capacity(context.mapping.substitutions.len());
    for sub in &context.mapping.substitutions {
        let values = evaluate(document, sub)?;
        extracted.push((sub.path_target.clone(), values));
    }

    for (path_target, values) in extracted {
        for value in values {
            context.add_substitute(path_target.as_str(), value);
        }
    }
    Ok(())
}

/// Accepts full JSONPath (`$...`) or a bare dotted path.
pub fn json_path(path_source: &str) -> String {
    let path = path_source.trim();
    if path.starts_with('$') {
        path.to_string()
    } else {
        format!("$.{path}")
    }
}

fn evaluate(document: &Value, sub: &Substitution) -> Result<Vec<SubstituteValue>, ProcessingError> {
    let path = json_path(&sub.path_source);
    let matches = select(document, &path).map_err(|e| ProcessingError::InvalidPath {
        path: sub.path_source.clone(),
        reason: format!("{e:?}"),
    })?;
    Ok(collect_values(matches, sub))
}

fn collect_values(matches: Vec<&Value>, sub: &Substitution) -> Vec<SubstituteValue> {
    let repair = sub.repair_strategy;
    match matches.as_slice() {
        [] => vec![SubstituteValue::ignore(repair)],
        [Value::Array(items)] => {
            if sub.expand_array {
                if items.is_empty() {
                    return vec![SubstituteValue::ignore(repair)];
                }
                return items
                    .iter()
                    .map(|v| SubstituteValue::new(v.clone(), repair))
                    .collect();
            }
            let picked = match repair {
                RepairStrategy::UseFirstValueOfArray => items.first(),
                RepairStrategy::UseLastValueOfArray => items.last(),
                _ => return vec![SubstituteValue::new(Value::Array(items.clone()), repair)],
            };
            vec![picked
                .map(|v| SubstituteValue::new(v.clone(), repair))
                .unwrap_or_else(|| SubstituteValue::ignore(repair))]
        }
        many => many
            .iter()
            .map(|v| SubstituteValue::new((*v).clone(), repair))
            .collect(),
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::context::{Tenant, ValueKind};
    use crate::model::Mapping;

    fn decode(subs: Vec<Substitution>, topic: &str, payload: Value) -> ProcessingContext {
        let mapping = Mapping {
            substitutions: subs,
            ..Default::default()
        };
        let raw = serde_json::to_vec(&payload).unwrap();
        let mut ctx = ProcessingContext::new(Tenant::new("t100"), topic, Arc::new(mapping), &raw);
        JsonProcessor.decode(&mut ctx, &raw).unwrap();
        ctx
    }

    #[test]
    fn extracts_scalar_paths() {
        let ctx = decode(
            vec![
                Substitution::new("$.device", "source.id"),
                Substitution::new("temp", "c8y_Temp.T.value"),
            ],
            "device/measure",
            json!({"device": "dev-1", "temp": 21.5}),
        );
        assert_eq!(ctx.post_processing_cache["source.id"][0].value, json!("dev-1"));
        assert_eq!(ctx.post_processing_cache["c8y_Temp.T.value"][0].value, json!(21.5));
        assert_eq!(ctx.post_processing_cache["c8y_Temp.T.value"][0].kind, ValueKind::Number);
    }

    #[test]
    fn missing_path_yields_ignore_placeholder() {
        let ctx = decode(
            vec![Substitution::new("$.nope", "text")],
            "t",
            json!({"device": "dev-1"}),
        );
        let values = &ctx.post_processing_cache["text"];
        assert_eq!(values.len(), 1);
        assert!(values[0].is_ignore());
    }

    #[test]
    fn wildcard_path_appends_every_match() {
        let ctx = decode(
            vec![Substitution::new("$.readings[*].v", "value")],
            "t",
            json!({"readings": [{"v": 1}, {"v": 2}, {"v": 3}]}),
        );
        assert_eq!(ctx.post_processing_cache["value"].len(), 3);
        assert_eq!(ctx.post_processing_cache["value"][2].value, json!(3));
    }

    #[test]
    fn expand_array_splits_single_array_match() {
        let ctx = decode(
            vec![Substitution::new("$.values", "value").expanded()],
            "t",
            json!({"values": [10, 20]}),
        );
        let values = &ctx.post_processing_cache["value"];
        assert_eq!(values.len(), 2);
        assert_eq!(values[1].value, json!(20));
    }

    #[test]
    fn array_without_expansion_honours_first_and_last_strategies() {
        let ctx = decode(
            vec![
                Substitution::new("$.values", "first").with_repair(RepairStrategy::UseFirstValueOfArray),
                Substitution::new("$.values", "last").with_repair(RepairStrategy::UseLastValueOfArray),
                Substitution::new("$.values", "whole"),
            ],
            "t",
            json!({"values": [10, 20, 30]}),
        );
        assert_eq!(ctx.post_processing_cache["first"][0].value, json!(10));
        assert_eq!(ctx.post_processing_cache["last"][0].value, json!(30));
        assert_eq!(ctx.post_processing_cache["whole"][0].kind, ValueKind::Array);
    }

    #[test]
    fn topic_levels_are_addressable() {
        let ctx = decode(
            vec![Substitution::new("$._TOPIC_LEVEL_[1]", "source.id")],
            "/device/dev-7/measure",
            json!({"temp": 1}),
        );
        assert_eq!(ctx.post_processing_cache["source.id"][0].value, json!("dev-7"));
    }

    #[test]
    fn invalid_json_is_a_processing_error() {
        let mapping = Arc::new(Mapping::default());
        let mut ctx = ProcessingContext::new(Tenant::new("t100"), "t", mapping, b"not json");
        assert!(matches!(
            JsonProcessor.decode(&mut ctx, b"not json"),
            Err(ProcessingError::Json(_))
        ));
    }

    #[test]
    fn bare_paths_get_root_prefix() {
        assert_eq!(json_path("a.b"), "$.a.b");
        assert_eq!(json_path("$.a"), "$.a");
        assert_eq!(json_path(" $['a b'] "), "$['a b']");
    }
}
