//! Delimited text payloads.
//!
//! The line is wrapped as `{"message": <text>, "fields": [..]}` so source
//! paths such as `$.fields[2]` address one column.

use serde_json::{json, Value};

use crate::context::{Payload, ProcessingContext};
use crate::error::ProcessingError;
use crate::processor::json::{extract_substitutions, with_topic_levels};
use crate::processor::PayloadProcessor;

pub struct FlatFileProcessor {
    delimiter: String,
}

impl FlatFileProcessor {
    pub fn new(delimiter: impl Into<String>) -> Self {
        let delimiter = delimiter.into();
        Self {
            delimiter: if delimiter.is_empty() {
                ",".to_string()
            } else {
                delimiter
            },
        }
    }

    fn wrap(&self, text: &str) -> Value {
        let line = text.trim_end_matches(['\r', '\n']);
        let fields: Vec<Value> = line
            .split(self.delimiter.as_str())
            .map(|f| Value::String(f.trim().to_string()))
            .collect();
        json!({ "message": line, "fields": fields })
    }
}

impl PayloadProcessor for FlatFileProcessor {
    fn deserialize_payload(
        &self,
        context: &mut ProcessingContext,
        raw: &[u8],
    ) -> Result<(), ProcessingError> {
        let text = String::from_utf8(raw.to_vec())?;
        context.payload = Payload::Json(with_topic_levels(self.wrap(&text), &context.topic));
        Ok(())
    }

    fn extract_from_source(&self, context: &mut ProcessingContext) -> Result<(), ProcessingError> {
        extract_substitutions(context)
    }
}
