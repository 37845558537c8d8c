//! Payload processors.
//!
//! Each [`MappingType`] has one processor. A processor first deserialises
//! the raw bytes into the context payload, then extracts candidate values
//! into the context's post-processing cache. Undecodable input is an error;
//! paths that match too little or too much are not, they surface later as
//! repair signals.

pub mod extensible;
pub mod flat_file;
pub mod generic_binary;
pub mod json;
pub mod protobuf_static;

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::ProcessingContext;
use crate::error::ProcessingError;
use crate::extension::ExtensionRegistry;
use crate::model::MappingType;

pub use extensible::ExtensibleProcessor;
pub use flat_file::FlatFileProcessor;
pub use generic_binary::GenericBinaryProcessor;
pub use json::JsonProcessor;
pub use protobuf_static::StaticProtobufProcessor;

// ------------------------------------------------------------------ //
//  Trait                                                              //
// ------------------------------------------------------------------ //

pub trait PayloadProcessor: Send + Sync {
    /// Turn the raw message bytes into the context payload.
    fn deserialize_payload(
        &self,
        context: &mut ProcessingContext,
        raw: &[u8],
    ) -> Result<(), ProcessingError>;

    /// Populate the post-processing cache from the context payload.
    fn extract_from_source(&self, context: &mut ProcessingContext) -> Result<(), ProcessingError>;

    fn decode(&self, context: &mut ProcessingContext, raw: &[u8]) -> Result<(), ProcessingError> {
        self.deserialize_payload(context, raw)?;
        self.extract_from_source(context)
    }
}

// ------------------------------------------------------------------ //
//  Processor set                                                      //
// ------------------------------------------------------------------ //

/// Processors keyed by mapping type.
#[derive(Clone)]
pub struct ProcessorSet {
    processors: HashMap<MappingType, Arc<dyn PayloadProcessor>>,
}

impl ProcessorSet {
    /// The standard processor for every mapping type.
    pub fn new(flat_file_delimiter: &str, extensions: Arc<ExtensionRegistry>) -> Self {
        let mut processors: HashMap<MappingType, Arc<dyn PayloadProcessor>> = HashMap::new();
        processors.insert(MappingType::Json, Arc::new(JsonProcessor));
        processors.insert(
            MappingType::FlatFile,
            Arc::new(FlatFileProcessor::new(flat_file_delimiter)),
        );
        processors.insert(MappingType::GenericBinary, Arc::new(GenericBinaryProcessor));
        processors.insert(MappingType::ProtobufStatic, Arc::new(StaticProtobufProcessor));
        processors.insert(
            MappingType::ProcessorExtension,
            Arc::new(ExtensibleProcessor::new(extensions)),
        );
        Self { processors }
    }

    pub fn get(&self, mapping_type: MappingType) -> Result<Arc<dyn PayloadProcessor>, ProcessingError> {
        self.processors
            .get(&mapping_type)
            .cloned()
            .ok_or(ProcessingError::NoProcessor(mapping_type))
    }

    /// Replace the processor for one mapping type.
    pub fn with(mut self, mapping_type: MappingType, processor: Arc<dyn PayloadProcessor>) -> Self {
        self.processors.insert(mapping_type, processor);
        self
    }
}
