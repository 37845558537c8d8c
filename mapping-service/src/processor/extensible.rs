//! Delegation to processor extensions.

use std::sync::Arc;

use crate::context::{Payload, ProcessingContext};
use crate::error::ProcessingError;
use crate::extension::ExtensionRegistry;
use crate::processor::PayloadProcessor;

/// Runs the extension entry named by the rule's `extension` reference.
pub struct ExtensibleProcessor {
    registry: Arc<ExtensionRegistry>,
}

impl ExtensibleProcessor {
    pub fn new(registry: Arc<ExtensionRegistry>) -> Self {
        Self { registry }
    }
}

impl PayloadProcessor for ExtensibleProcessor {
    fn deserialize_payload(
        &self,
        context: &mut ProcessingContext,
        raw: &[u8],
    ) -> Result<(), ProcessingError> {
        context.payload = Payload::Binary(raw.to_vec());
        Ok(())
    }

    fn extract_from_source(&self, context: &mut ProcessingContext) -> Result<(), ProcessingError> {
        let reference = context
            .mapping
            .extension
            .clone()
            .ok_or(ProcessingError::MissingExtensionRef)?;
        let extension = self
            .registry
            .processor(&reference.name, &reference.event)
            .ok_or_else(|| ProcessingError::ExtensionUnavailable {
                name: reference.name.clone(),
                event: reference.event.clone(),
            })?;
        extension.extract_from_source(context)
    }
}
