//! Per-message processing state.
//!
//! A [`ProcessingContext`] is created for one (message, mapping) pair, owned
//! by the worker handling it, and dropped once its requests are sent.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message_id;
use crate::model::{Api, Mapping, RepairStrategy};

/// Key under which topic levels are exposed to source paths.
pub const TOPIC_LEVEL: &str = "_TOPIC_LEVEL_";

// ------------------------------------------------------------------ //
//  Tenant                                                             //
// ------------------------------------------------------------------ //

/// Tenant every rule-set and platform call is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tenant(String);

impl Tenant {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ------------------------------------------------------------------ //
//  Payload and extracted values                                       //
// ------------------------------------------------------------------ //

/// Decoded payload; its shape depends on the mapping type.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Empty,
    Json(Value),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueKind {
    Textual,
    Number,
    Boolean,
    Object,
    Array,
    /// Nothing was extracted; the placeholder still counts towards
    /// cardinality.
    Ignore,
}

/// One candidate value extracted for a target path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstituteValue {
    pub value: Value,
    pub kind: ValueKind,
    pub repair_strategy: RepairStrategy,
}

impl SubstituteValue {
    /// Wrap `value`, deriving its kind. `null` becomes an ignore placeholder.
    pub fn new(value: Value, repair_strategy: RepairStrategy) -> Self {
        let kind = match &value {
            Value::Null => ValueKind::Ignore,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::Textual,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        };
        Self {
            value,
            kind,
            repair_strategy,
        }
    }

    pub fn ignore(repair_strategy: RepairStrategy) -> Self {
        Self {
            value: Value::Null,
            kind: ValueKind::Ignore,
            repair_strategy,
        }
    }

    pub fn is_ignore(&self) -> bool {
        self.kind == ValueKind::Ignore
    }

    /// Textual form used for identities: strings as-is, numbers and booleans
    /// rendered, everything else has none.
    pub fn as_identity(&self) -> Option<String> {
        match &self.value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------ //
//  Target requests                                                    //
// ------------------------------------------------------------------ //

/// One materialised request for the target platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetRequest {
    pub api: Api,
    /// Position within the expansion of one message.
    pub index: usize,
    /// Resolved internal id of the device the request belongs to.
    pub source_id: Option<String>,
    /// External id the device was resolved from.
    pub external_id: Option<String>,
    pub external_id_type: String,
    pub body: Value,
    pub response: Option<Value>,
    pub error: Option<String>,
}

impl TargetRequest {
    pub fn new(api: Api, index: usize, body: Value) -> Self {
        Self {
            api,
            index,
            source_id: None,
            external_id: None,
            external_id_type: crate::model::DEFAULT_EXTERNAL_ID_TYPE.to_string(),
            body,
            response: None,
            error: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

// ------------------------------------------------------------------ //
//  Processing context                                                 //
// ------------------------------------------------------------------ //

pub struct ProcessingContext {
    pub tenant: Tenant,
    pub message_id: String,
    pub topic: String,
    pub mapping: Arc<Mapping>,
    pub payload: Payload,
    /// Target path → extracted candidate values, in extraction order.
    pub post_processing_cache: BTreeMap<String, Vec<SubstituteValue>>,
    pub requests: Vec<TargetRequest>,
}

impl ProcessingContext {
    pub fn new(tenant: Tenant, topic: impl Into<String>, mapping: Arc<Mapping>, raw: &[u8]) -> Self {
        let topic = topic.into();
        let message_id = message_id::compute(tenant.as_str(), &topic, raw);
        Self {
            tenant,
            message_id,
            topic,
            mapping,
            payload: Payload::Empty,
            post_processing_cache: BTreeMap::new(),
            requests: Vec::new(),
        }
    }

    /// Append one candidate value for `path_target`.
    pub fn add_substitute(&mut self, path_target: impl Into<String>, value: SubstituteValue) {
        self.post_processing_cache
            .entry(path_target.into())
            .or_default()
            .push(value);
    }

    /// Replace all candidate values for `path_target`.
    pub fn put_substitutes(&mut self, path_target: impl Into<String>, values: Vec<SubstituteValue>) {
        self.post_processing_cache.insert(path_target.into(), values);
    }

    /// Cache key carrying the device identity.
    pub fn identifier_key(&self) -> &str {
        self.mapping.identifier_key()
    }

    /// Number of values extracted per target path.
    pub fn cardinality(&self) -> BTreeMap<&str, usize> {
        self.post_processing_cache
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect()
    }

    /// `true` when the non-identifier paths did not all receive the same
    /// number of values.
    pub fn needs_repair(&self) -> bool {
        needs_repair(&self.post_processing_cache, self.identifier_key())
    }
}

/// `true` when the entries other than `identifier_key` disagree on their
/// cardinality. A cache without such entries needs no repair.
pub fn needs_repair(cache: &BTreeMap<String, Vec<SubstituteValue>>, identifier_key: &str) -> bool {
    let cardinalities: BTreeSet<usize> = cache
        .iter()
        .filter(|(k, _)| k.as_str() != identifier_key)
        .map(|(_, v)| v.len())
        .collect();
    cardinalities.len() > 1
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
