//! Fixed-schema protobuf measurements.
//!
//! Decodes [`proto::StaticCustomMeasurement`] and writes the measurement
//! fields straight into the cache; the rule's substitutions are not
//! consulted.

use chrono::{DateTime, SecondsFormat, Utc};
use prost::Message;
use serde_json::Value;

use crate::context::{Payload, ProcessingContext, SubstituteValue};
use crate::error::ProcessingError;
use crate::model::RepairStrategy;
use crate::processor::PayloadProcessor;

pub const KEY_TIME: &str = "time";
pub const KEY_VALUE: &str = "c8y_GenericMeasurement.Module.value";
pub const KEY_TYPE: &str = "type";
pub const KEY_UNIT: &str = "c8y_GenericMeasurement.Module.unit";

pub struct StaticProtobufProcessor;

impl PayloadProcessor for StaticProtobufProcessor {
    fn deserialize_payload(
        &self,
        context: &mut ProcessingContext,
        raw: &[u8],
    ) -> Result<(), ProcessingError> {
        context.payload = Payload::Binary(raw.to_vec());
        Ok(())
    }

    fn extract_from_source(&self, context: &mut ProcessingContext) -> Result<(), ProcessingError> {
        let Payload::Binary(bytes) = &context.payload else {
            return Err(ProcessingError::UnexpectedPayload {
                processor: "PROTOBUF_STATIC",
            });
        };
        let measurement = proto::StaticCustomMeasurement::decode(bytes.as_slice())?;
        let identifier = context.mapping.target_api.identifier();

        let d = RepairStrategy::Default;
        context.put_substitutes(
            KEY_TIME,
            vec![SubstituteValue::new(Value::String(iso_time(measurement.timestamp)), d)],
        );
        context.put_substitutes(
            KEY_VALUE,
            vec![SubstituteValue::new(Value::from(f64::from(measurement.value)), d)],
        );
        context.put_substitutes(
            KEY_TYPE,
            vec![SubstituteValue::new(Value::String(measurement.measurement_type), d)],
        );
        context.put_substitutes(
            KEY_UNIT,
            vec![SubstituteValue::new(Value::String(measurement.unit), d)],
        );
        context.put_substitutes(
            identifier,
            vec![SubstituteValue::new(Value::String(measurement.external_id), d)],
        );
        Ok(())
    }
}

/// Unix millis as RFC 3339; out-of-range timestamps fall back to now.
pub fn iso_time(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
