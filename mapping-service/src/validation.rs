//! Mapping rule validation.
//!
//! [`validate`] never fails; it returns every problem it finds, in check
//! order. An empty list means the rule may be activated.

use serde_json::Value;

use crate::model::{Direction, Mapping, MappingType, ValidationError};
use crate::topic::{self, TopicRole};

pub fn validate(existing: &[Mapping], candidate: &Mapping) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    errors.extend(check_device_identifier(candidate));

    match candidate.direction {
        Direction::Inbound => {
            errors.extend(topic::validate_subscription_topic(&candidate.subscription_topic));
            errors.extend(topic::validate_mapping_topic(&candidate.mapping_topic));
            if !topic::topic_is_covered_by(&candidate.subscription_topic, &candidate.mapping_topic) {
                errors.push(ValidationError::MappingTopicMustMatchTheSubscriptionTopic);
            }
            if !candidate.mapping_topic_sample.is_empty() {
                errors.extend(topic::same_structure(
                    TopicRole::Mapping,
                    &candidate.mapping_topic,
                    &candidate.mapping_topic_sample,
                ));
            }
        }
        Direction::Outbound => {
            errors.extend(topic::same_structure(
                TopicRole::Publish,
                &candidate.publish_topic,
                &candidate.publish_topic_sample,
            ));
        }
    }

    errors.extend(check_templates(candidate));

    if candidate.direction == Direction::Outbound
        && existing.iter().any(|m| {
            m.direction == Direction::Outbound
                && m.id != candidate.id
                && m.filter_outbound == candidate.filter_outbound
        })
    {
        errors.push(ValidationError::FilterOutboundMustBeUnique);
    }

    errors
}

/// Exactly one substitution must define the device identifier, except where
/// the identity comes from elsewhere.
fn check_device_identifier(mapping: &Mapping) -> Option<ValidationError> {
    let exempt = mapping.is_snooping()
        || matches!(
            mapping.mapping_type,
            MappingType::ProcessorExtension | MappingType::ProtobufStatic
        )
        || mapping.direction == Direction::Outbound;
    if exempt {
        return None;
    }
    match mapping.device_identifier_substitutions().count() {
        0 => Some(ValidationError::OneSubstitutionDefiningDeviceIdentifierMustBeUsed),
        1 => None,
        _ => Some(ValidationError::OnlyOneSubstitutionDefiningDeviceIdentifierCanBeUsed),
    }
}

fn check_templates(mapping: &Mapping) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if serde_json::from_str::<Value>(&mapping.source).is_err() {
        errors.push(ValidationError::SourceTemplateMustBeValidJson);
    }
    if !mapping.mapping_type.has_opaque_target()
        && !matches!(serde_json::from_str::<Value>(&mapping.target), Ok(Value::Object(_)))
    {
        errors.push(ValidationError::TargetTemplateMustBeValidJson);
    }
    errors
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
