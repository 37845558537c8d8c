//! Expansion of the post-processing cache into target requests.
//!
//! Body *i* is a fresh copy of the target template with element *i* of every
//! cache entry written at its target path. Entries with fewer than N values
//! fall back to their repair strategy. Each distinct device identifier is
//! resolved once per message and written at the identifier path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::context::{ProcessingContext, SubstituteValue, TargetRequest, Tenant};
use crate::error::ProcessingError;
use crate::model::{Api, Mapping, RepairStrategy};
use crate::platform::{ExternalId, PlatformError, TargetPlatform};

/// Identities looked up during one expansion; `None` records a miss.
type Identities = HashMap<ExternalId, Option<String>>;

// ------------------------------------------------------------------ //
//  Dotted paths                                                       //
// ------------------------------------------------------------------ //

/// Write `value` at a dotted path, creating (or replacing non-object)
/// intermediate levels.
pub fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut segments = path.split('.').filter(|s| !s.is_empty()).peekable();
    let mut node = target;
    while let Some(segment) = segments.next() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Remove the value at a dotted path; missing levels are a no-op.
pub fn remove_path(target: &mut Value, path: &str) {
    let Some((parent, leaf)) = path.rsplit_once('.') else {
        if let Value::Object(map) = target {
            map.remove(path);
        }
        return;
    };
    let mut node = target;
    for segment in parent.split('.').filter(|s| !s.is_empty()) {
        match node.get_mut(segment) {
            Some(next) => node = next,
            None => return,
        }
    }
    if let Value::Object(map) = node {
        map.remove(leaf);
    }
}

// ------------------------------------------------------------------ //
//  Body construction                                                  //
// ------------------------------------------------------------------ //

/// Parsed target template. Mapping types whose processors write the body
/// keys themselves tolerate an unusable template and start from `{}`.
pub fn target_template(mapping: &Mapping) -> Result<Value, ProcessingError> {
    match serde_json::from_str::<Value>(&mapping.target) {
        Ok(v @ Value::Object(_)) => Ok(v),
        _ if mapping.mapping_type.has_opaque_target() => Ok(json!({})),
        _ => Err(ProcessingError::InvalidTargetTemplate),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBody {
    pub body: Value,
    /// Device identity extracted for this body.
    pub external_id: Option<String>,
}

enum Fill<'a> {
    Write(&'a Value),
    Remove,
    Keep,
}

fn fill_for(values: &[SubstituteValue], i: usize) -> Fill<'_> {
    let Some(last) = values.last() else {
        return Fill::Keep;
    };
    let strategy = last.repair_strategy;
    if strategy == RepairStrategy::Ignore {
        return Fill::Keep;
    }

    let candidate = match values.get(i) {
        Some(v) => v,
        None => match strategy {
            RepairStrategy::UseFirstValueOfArray => &values[0],
            RepairStrategy::UseLastValueOfArray => last,
            RepairStrategy::RemoveIfMissing => return Fill::Remove,
            RepairStrategy::Default | RepairStrategy::Ignore => return Fill::Keep,
        },
    };

    match (candidate.is_ignore(), strategy) {
        (false, _) => Fill::Write(&candidate.value),
        (true, RepairStrategy::RemoveIfMissing) => Fill::Remove,
        (true, _) => Fill::Keep,
    }
}

/// Number of bodies a cache expands into.
pub fn body_count(cache: &BTreeMap<String, Vec<SubstituteValue>>) -> usize {
    cache.values().map(Vec::len).max().unwrap_or(0).max(1)
}

/// Materialise one body per cache index. The identifier entry is not
/// written; its value is returned per body for resolution.
pub fn build_bodies(
    cache: &BTreeMap<String, Vec<SubstituteValue>>,
    template: &Value,
    identifier_key: &str,
) -> Vec<PreparedBody> {
    let n = body_count(cache);
    let identities = cache.get(identifier_key);

    (0..n)
        .map(|i| {
            let mut body = template.clone();
            for (path, values) in cache {
                if path == identifier_key {
                    continue;
                }
                match fill_for(values, i) {
                    Fill::Write(v) => set_path(&mut body, path, v.clone()),
                    Fill::Remove => remove_path(&mut body, path),
                    Fill::Keep => {}
                }
            }
            let external_id = identities
                .filter(|ids| !ids.is_empty())
                .and_then(|ids| ids[i.min(ids.len() - 1)].as_identity());
            PreparedBody { body, external_id }
        })
        .collect()
}

// ------------------------------------------------------------------ //
//  Engine                                                             //
// ------------------------------------------------------------------ //

pub struct SubstitutionEngine {
    platform: Arc<dyn TargetPlatform>,
    log_substitution: bool,
}

impl SubstitutionEngine {
    pub fn new(platform: Arc<dyn TargetPlatform>) -> Self {
        Self {
            platform,
            log_substitution: false,
        }
    }

    pub fn with_substitution_logging(mut self, enabled: bool) -> Self {
        self.log_substitution = enabled;
        self
    }

    /// Build and send every request for one message. Request failures are
    /// recorded on the request; only an unusable template fails the call.
    pub async fn expand(
        &self,
        context: &mut ProcessingContext,
    ) -> Result<Vec<TargetRequest>, ProcessingError> {
        let mapping = Arc::clone(&context.mapping);
        let template = target_template(&mapping)?;
        let identifier_key = context.identifier_key().to_string();

        if context.needs_repair() {
            warn!(
                message_id = %context.message_id,
                mapping = %mapping.id,
                cardinality = ?context.cardinality(),
                "substitution cardinality mismatch, applying repair strategies"
            );
        }

        let bodies = build_bodies(&context.post_processing_cache, &template, &identifier_key);
        let mut requests = Vec::with_capacity(bodies.len());
        let mut identities = Identities::new();

        for (index, prepared) in bodies.into_iter().enumerate() {
            let mut request = TargetRequest::new(mapping.target_api, index, prepared.body);
            request.external_id = prepared.external_id;
            request.external_id_type = mapping.external_id_type().to_string();

            if self.log_substitution {
                info!(
                    message_id = %context.message_id,
                    index,
                    body = %request.body,
                    "substituted body"
                );
            }

            match self
                .send(&context.tenant, &mapping, &identifier_key, &mut request, &mut identities)
                .await
            {
                Ok(response) => request.response = Some(response),
                Err(e) => {
                    warn!(
                        message_id = %context.message_id,
                        mapping = %mapping.id,
                        index,
                        error = %e,
                        "target request failed"
                    );
                    request.error = Some(e.to_string());
                }
            }
            requests.push(request);
        }

        context.requests = requests.clone();
        Ok(requests)
    }

    async fn send(
        &self,
        tenant: &Tenant,
        mapping: &Mapping,
        identifier_key: &str,
        request: &mut TargetRequest,
        identities: &mut Identities,
    ) -> Result<Value, ProcessingError> {
        let external = request
            .external_id
            .clone()
            .ok_or(ProcessingError::MissingDeviceIdentifier)?;
        let external_id = ExternalId::new(external.as_str(), request.external_id_type.as_str());

        if mapping.target_api == Api::Inventory {
            if let Some(id) = self.resolve(tenant, &external_id, identities).await? {
                request.source_id = Some(id.clone());
                if !mapping.update_existing_device {
                    return Ok(json!({ "id": id }));
                }
            }
            let response = self.platform.create_or_update(tenant, request).await?;
            if let Some(id) = response.get("id").and_then(Value::as_str) {
                identities.insert(external_id, Some(id.to_string()));
            }
            return Ok(response);
        }

        let source_id = if mapping.map_device_identifier {
            match self.resolve(tenant, &external_id, identities).await? {
                Some(id) => id,
                None if mapping.create_non_existing_device => {
                    let id = self.create_device(tenant, &external_id).await?;
                    identities.insert(external_id, Some(id.clone()));
                    id
                }
                None => return Err(ProcessingError::DeviceNotFound(external)),
            }
        } else {
            external
        };

        set_path(&mut request.body, identifier_key, Value::String(source_id.clone()));
        request.source_id = Some(source_id);
        Ok(self.platform.create_or_update(tenant, request).await?)
    }

    /// Platform id of `external_id`, asking the platform at most once per
    /// expansion.
    async fn resolve(
        &self,
        tenant: &Tenant,
        external_id: &ExternalId,
        identities: &mut Identities,
    ) -> Result<Option<String>, PlatformError> {
        if let Some(known) = identities.get(external_id) {
            return Ok(known.clone());
        }
        let resolved = self.platform.resolve_identity(tenant, external_id).await?;
        identities.insert(external_id.clone(), resolved.clone());
        Ok(resolved)
    }

    async fn create_device(
        &self,
        tenant: &Tenant,
        external_id: &ExternalId,
    ) -> Result<String, ProcessingError> {
        let mut request = TargetRequest::new(
            Api::Inventory,
            0,
            json!({
                "name": external_id.id,
                "c8y_IsDevice": {},
            }),
        );
        request.external_id = Some(external_id.id.clone());
        request.external_id_type = external_id.id_type.clone();

        let created = self.platform.create_or_update(tenant, &request).await?;
        let id = created
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| PlatformError::Response("created device without id".to_string()))?;
        info!(tenant = %tenant, external_id = %external_id.id, id, "device created");
        Ok(id.to_string())
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MappingType, Substitution};
    use crate::platform::FakeTargetPlatform;

    fn values(raw: &[Value], strategy: RepairStrategy) -> Vec<SubstituteValue> {
        raw.iter()
            .map(|v| SubstituteValue::new(v.clone(), strategy))
            .collect()
    }

    fn cache(entries: Vec<(&str, Vec<SubstituteValue>)>) -> BTreeMap<String, Vec<SubstituteValue>> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn set_and_remove_dotted_paths() {
        let mut body = json!({"a": 1, "c8y_Temp": "scalar"});
        set_path(&mut body, "c8y_Temp.T.value", json!(21));
        set_path(&mut body, "source.id", json!("42"));
        assert_eq!(body["c8y_Temp"]["T"]["value"], json!(21));
        assert_eq!(body["source"]["id"], json!("42"));

        remove_path(&mut body, "c8y_Temp.T.value");
        remove_path(&mut body, "a");
        remove_path(&mut body, "no.such.path");
        assert_eq!(body, json!({"c8y_Temp": {"T": {}}, "source": {"id": "42"}}));
    }

    #[test]
    fn equal_cardinality_expands_one_body_per_index() {
        let d = RepairStrategy::Default;
        let c = cache(vec![
            ("v", values(&[json!(1), json!(2), json!(3)], d)),
            ("unit", values(&[json!("C"), json!("F"), json!("K")], d)),
            ("source.id", values(&[json!("dev-1")], d)),
        ]);
        let bodies = build_bodies(&c, &json!({"type": "t"}), "source.id");
        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[2].body, json!({"type": "t", "v": 3, "unit": "K"}));
        assert!(bodies.iter().all(|b| b.external_id.as_deref() == Some("dev-1")));
    }

    #[test]
    fn identifier_with_n_values_is_indexed() {
        let d = RepairStrategy::Default;
        let c = cache(vec![
            ("v", values(&[json!(1), json!(2)], d)),
            ("source.id", values(&[json!("a"), json!("b")], d)),
        ]);
        let bodies = build_bodies(&c, &json!({}), "source.id");
        assert_eq!(bodies[0].external_id.as_deref(), Some("a"));
        assert_eq!(bodies[1].external_id.as_deref(), Some("b"));
        assert!(bodies[0].body.get("source").is_none());
    }

    #[test]
    fn short_keys_follow_their_repair_strategy() {
        let c = cache(vec![
            ("v", values(&[json!(1), json!(2), json!(3)], RepairStrategy::Default)),
            ("first", values(&[json!("f1"), json!("f2")], RepairStrategy::UseFirstValueOfArray)),
            ("last", values(&[json!("l1"), json!("l2")], RepairStrategy::UseLastValueOfArray)),
            ("gone", values(&[json!("g1")], RepairStrategy::RemoveIfMissing)),
            ("kept", values(&[json!("k1")], RepairStrategy::Default)),
        ]);
        let template = json!({"gone": "tpl", "kept": "tpl"});
        let bodies = build_bodies(&c, &template, "source.id");
        assert_eq!(bodies.len(), 3);

        let third = &bodies[2].body;
        assert_eq!(third["v"], json!(3));
        assert_eq!(third["first"], json!("f1"));
        assert_eq!(third["last"], json!("l2"));
        assert!(third.get("gone").is_none());
        assert_eq!(third["kept"], json!("tpl"));

        assert_eq!(bodies[0].body["gone"], json!("g1"));
        assert!(bodies.iter().all(|b| b.external_id.is_none()));
    }

    #[test]
    fn ignore_strategy_and_missing_values() {
        let c = cache(vec![
            ("skipped", values(&[json!("x")], RepairStrategy::Ignore)),
            ("missing", vec![SubstituteValue::ignore(RepairStrategy::Default)]),
            ("dropped", vec![SubstituteValue::ignore(RepairStrategy::RemoveIfMissing)]),
        ]);
        let template = json!({"skipped": "tpl", "missing": "tpl", "dropped": "tpl"});
        let bodies = build_bodies(&c, &template, "source.id");
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].body, json!({"skipped": "tpl", "missing": "tpl"}));
    }

    #[test]
    fn empty_cache_yields_template_once() {
        let bodies = build_bodies(&BTreeMap::new(), &json!({"a": 1}), "source.id");
        assert_eq!(bodies, vec![PreparedBody { body: json!({"a": 1}), external_id: None }]);
    }

    #[test]
    fn template_parsing() {
        let mut mapping = Mapping {
            target: "[1]".into(),
            ..Default::default()
        };
        assert!(matches!(
            target_template(&mapping),
            Err(ProcessingError::InvalidTargetTemplate)
        ));
        mapping.mapping_type = MappingType::ProtobufStatic;
        assert_eq!(target_template(&mapping).unwrap(), json!({}));
    }

    // ---- engine ----------------------------------------------------- //

    fn measurement_mapping() -> Mapping {
        Mapping {
            id: "m1".into(),
            target: r#"{"type": "c8y_Temp", "c8y_Temp": {"T": {"unit": "C"}}}"#.into(),
            substitutions: vec![
                Substitution::new("$.device", "source.id"),
                Substitution::new("$.temps", "c8y_Temp.T.value").expanded(),
            ],
            ..Default::default()
        }
    }

    fn context_for(mapping: Mapping, cache_entries: Vec<(&str, Vec<SubstituteValue>)>) -> ProcessingContext {
        let mut ctx = ProcessingContext::new(Tenant::new("t100"), "t", Arc::new(mapping), b"{}");
        ctx.post_processing_cache = cache(cache_entries);
        ctx
    }

    fn temps(device: &str, values_: &[Value]) -> Vec<(&'static str, Vec<SubstituteValue>)> {
        let d = RepairStrategy::Default;
        vec![
            ("source.id", values(&[json!(device)], d)),
            ("c8y_Temp.T.value", values(values_, d)),
        ]
    }

    #[tokio::test]
    async fn resolves_identity_and_sends_every_body() {
        let platform = FakeTargetPlatform::new();
        let tenant = Tenant::new("t100");
        platform.register(&tenant, ExternalId::new("dev-1", "c8y_Serial"), "4711");
        let engine = SubstitutionEngine::new(Arc::new(platform.clone()));

        let mut ctx = context_for(measurement_mapping(), temps("dev-1", &[json!(20), json!(21)]));
        let requests = engine.expand(&mut ctx).await.unwrap();

        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| !r.failed()));
        assert_eq!(requests[1].body["source"]["id"], json!("4711"));
        assert_eq!(requests[1].body["c8y_Temp"]["T"]["value"], json!(21));
        assert_eq!(requests[1].body["c8y_Temp"]["T"]["unit"], json!("C"));
        assert_eq!(platform.snapshot().len(), 2);
        assert_eq!(ctx.requests.len(), 2);
    }

    #[tokio::test]
    async fn identity_is_resolved_once_per_message() {
        let platform = FakeTargetPlatform::new();
        let tenant = Tenant::new("t100");
        platform.register(&tenant, ExternalId::new("dev-1", "c8y_Serial"), "4711");
        let engine = SubstitutionEngine::new(Arc::new(platform.clone()));

        let mut ctx = context_for(measurement_mapping(), temps("dev-1", &[json!(1), json!(2), json!(3)]));
        let requests = engine.expand(&mut ctx).await.unwrap();

        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.source_id.as_deref() == Some("4711")));
        assert_eq!(platform.lookups(), 1);
    }

    #[tokio::test]
    async fn created_device_is_reused_by_later_bodies() {
        let platform = FakeTargetPlatform::new();
        let engine = SubstitutionEngine::new(Arc::new(platform.clone()));
        let mapping = Mapping {
            create_non_existing_device: true,
            ..measurement_mapping()
        };

        let mut ctx = context_for(mapping, temps("new-dev", &[json!(1), json!(2)]));
        let requests = engine.expand(&mut ctx).await.unwrap();

        let sent = platform.snapshot();
        assert_eq!(sent.iter().filter(|r| r.api == Api::Inventory).count(), 1);
        assert_eq!(requests[0].source_id, requests[1].source_id);
        assert_eq!(platform.lookups(), 1);
    }

    #[tokio::test]
    async fn unknown_device_fails_the_request() {
        let platform = FakeTargetPlatform::new();
        let engine = SubstitutionEngine::new(Arc::new(platform.clone()));

        let mut ctx = context_for(measurement_mapping(), temps("ghost", &[json!(1)]));
        let requests = engine.expand(&mut ctx).await.unwrap();

        assert_eq!(requests.len(), 1);
        assert!(requests[0].error.as_deref().unwrap().contains("ghost"));
        assert!(platform.snapshot().is_empty());
    }

    #[tokio::test]
    async fn unknown_device_is_created_when_allowed() {
        let platform = FakeTargetPlatform::new();
        let engine = SubstitutionEngine::new(Arc::new(platform.clone()));
        let mapping = Mapping {
            create_non_existing_device: true,
            ..measurement_mapping()
        };

        let mut ctx = context_for(mapping, temps("new-dev", &[json!(1)]));
        let requests = engine.expand(&mut ctx).await.unwrap();

        assert!(!requests[0].failed());
        let sent = platform.snapshot();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].api, Api::Inventory);
        assert_eq!(sent[1].api, Api::Measurement);
        assert_eq!(sent[1].source_id, requests[0].source_id);
    }

    #[tokio::test]
    async fn without_mapping_the_identifier_is_used_verbatim() {
        let platform = FakeTargetPlatform::new();
        let engine = SubstitutionEngine::new(Arc::new(platform.clone()));
        let mapping = Mapping {
            map_device_identifier: false,
            ..measurement_mapping()
        };

        let mut ctx = context_for(mapping, temps("9001", &[json!(1)]));
        let requests = engine.expand(&mut ctx).await.unwrap();
        assert_eq!(requests[0].body["source"]["id"], json!("9001"));
    }

    #[tokio::test]
    async fn missing_identifier_fails_each_request() {
        let engine = SubstitutionEngine::new(Arc::new(FakeTargetPlatform::new()));
        let mut ctx = context_for(
            measurement_mapping(),
            vec![
                ("source.id", vec![SubstituteValue::ignore(RepairStrategy::Default)]),
                ("c8y_Temp.T.value", values(&[json!(1)], RepairStrategy::Default)),
            ],
        );
        let requests = engine.expand(&mut ctx).await.unwrap();
        assert!(requests[0].failed());
    }

    #[tokio::test]
    async fn platform_failures_are_recorded_per_request() {
        let platform = FakeTargetPlatform::new();
        let tenant = Tenant::new("t100");
        platform.register(&tenant, ExternalId::new("dev-1", "c8y_Serial"), "1");
        platform.fail_on(Api::Measurement);
        let engine = SubstitutionEngine::new(Arc::new(platform));

        let mut ctx = context_for(measurement_mapping(), temps("dev-1", &[json!(1), json!(2)]));
        let requests = engine.expand(&mut ctx).await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(TargetRequest::failed));
    }

    #[tokio::test]
    async fn inventory_upserts_by_external_id() {
        let platform = FakeTargetPlatform::new();
        let engine = SubstitutionEngine::new(Arc::new(platform.clone()));
        let mapping = Mapping {
            target_api: Api::Inventory,
            target: r#"{"name": "tpl", "c8y_IsDevice": {}}"#.into(),
            substitutions: vec![
                Substitution::new("$.id", "_DEVICE_IDENT_"),
                Substitution::new("$.name", "name"),
            ],
            ..Default::default()
        };
        let entries = || {
            let d = RepairStrategy::Default;
            vec![
                ("_DEVICE_IDENT_", values(&[json!("inv-1")], d)),
                ("name", values(&[json!("Pump")], d)),
            ]
        };

        let mut ctx = context_for(mapping.clone(), entries());
        let created = engine.expand(&mut ctx).await.unwrap();
        assert!(created[0].body.get("_DEVICE_IDENT_").is_none());
        let id = created[0].response.as_ref().unwrap()["id"].clone();

        // Existing device without update permission is left alone.
        let mut ctx = context_for(mapping.clone(), entries());
        let skipped = engine.expand(&mut ctx).await.unwrap();
        assert_eq!(skipped[0].response.as_ref().unwrap()["id"], id);
        assert_eq!(platform.snapshot().len(), 1);

        let updating = Mapping {
            update_existing_device: true,
            ..mapping
        };
        let mut ctx = context_for(updating, entries());
        let updated = engine.expand(&mut ctx).await.unwrap();
        assert_eq!(updated[0].source_id, id.as_str().map(str::to_string));
        assert_eq!(platform.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn invalid_template_fails_the_message() {
        let engine = SubstitutionEngine::new(Arc::new(FakeTargetPlatform::new()));
        let mapping = Mapping {
            target: "not json".into(),
            ..measurement_mapping()
        };
        let mut ctx = context_for(mapping, temps("dev-1", &[json!(1)]));
        assert!(matches!(
            engine.expand(&mut ctx).await,
            Err(ProcessingError::InvalidTargetTemplate)
        ));
    }
}
