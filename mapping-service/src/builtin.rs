//! Extensions compiled into the service.

use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;
use serde_json::Value;

use crate::context::{Payload, ProcessingContext, SubstituteValue, Tenant};
use crate::error::ProcessingError;
use crate::extension::{
    Capability, ExtensionArtifact, ExtensionError, ExtensionLoader, ExtensionSource,
    ProcessorExtension, SymbolFactory,
};
use crate::model::RepairStrategy;
use crate::processor::protobuf_static::iso_time;

pub const BUILTIN_EXTENSION: &str = "mapping-extension-internal";
pub const CUSTOM_MEASUREMENT_SYMBOL: &str =
    "mapping.processor.extension.internal.CustomMeasurementDecoder";

const BUILTIN_MANIFEST: &str = "\
# built-in processor extensions
CustomMeasurement=mapping.processor.extension.internal.CustomMeasurementDecoder
";

// ------------------------------------------------------------------ //
//  CustomMeasurementDecoder                                           //
// ------------------------------------------------------------------ //

/// Decodes [`proto::InternalCustomMeasurement`]; the fragment name in the
/// message picks the measurement series.
pub struct CustomMeasurementDecoder;

impl ProcessorExtension for CustomMeasurementDecoder {
    fn extract_from_source(&self, context: &mut ProcessingContext) -> Result<(), ProcessingError> {
        let Payload::Binary(bytes) = &context.payload else {
            return Err(ProcessingError::UnexpectedPayload {
                processor: "CustomMeasurementDecoder",
            });
        };
        let m = proto::InternalCustomMeasurement::decode(bytes.as_slice())?;
        if m.fragment.trim().is_empty() {
            return Err(ProcessingError::Extension("fragment is empty".to_string()));
        }
        let identifier = context.mapping.target_api.identifier();
        let d = RepairStrategy::Default;
        let series = format!("{0}.{0}", m.fragment);

        context.put_substitutes("time", vec![SubstituteValue::new(Value::String(iso_time(m.timestamp)), d)]);
        context.put_substitutes("type", vec![SubstituteValue::new(Value::String(m.measurement_type), d)]);
        context.put_substitutes(
            format!("{series}.value"),
            vec![SubstituteValue::new(Value::from(f64::from(m.value)), d)],
        );
        context.put_substitutes(
            format!("{series}.unit"),
            vec![SubstituteValue::new(Value::String(m.unit), d)],
        );
        context.put_substitutes(identifier, vec![SubstituteValue::new(Value::String(m.external_id), d)]);
        Ok(())
    }
}

// ------------------------------------------------------------------ //
//  Loader and source                                                  //
// ------------------------------------------------------------------ //

/// Symbol table of the processors compiled into this crate.
pub struct BuiltinLoader;

fn custom_measurement() -> Result<Capability, String> {
    Ok(Capability::InboundProcessor(Arc::new(CustomMeasurementDecoder)))
}

impl ExtensionLoader for BuiltinLoader {
    fn resolve(&self, symbol: &str) -> Option<SymbolFactory> {
        match symbol {
            CUSTOM_MEASUREMENT_SYMBOL => Some(custom_measurement as SymbolFactory),
            _ => None,
        }
    }
}

pub fn builtin_artifact() -> ExtensionArtifact {
    ExtensionArtifact {
        id: BUILTIN_EXTENSION.to_string(),
        name: BUILTIN_EXTENSION.to_string(),
        external: false,
        manifest: Some(BUILTIN_MANIFEST.to_string()),
        loader: Arc::new(BuiltinLoader),
    }
}

/// Fixed list of artifacts, the same for every tenant.
#[derive(Clone, Default)]
pub struct StaticExtensionSource {
    artifacts: Vec<ExtensionArtifact>,
}

impl StaticExtensionSource {
    pub fn new(artifacts: Vec<ExtensionArtifact>) -> Self {
        Self { artifacts }
    }

    /// Only the built-in artifact.
    pub fn builtin() -> Self {
        Self::new(vec![builtin_artifact()])
    }

    pub fn with(mut self, artifact: ExtensionArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

#[async_trait]
impl ExtensionSource for StaticExtensionSource {
    async fn artifacts(&self, _tenant: &Tenant) -> Result<Vec<ExtensionArtifact>, ExtensionError> {
        Ok(self.artifacts.clone())
    }
}
