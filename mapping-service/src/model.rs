//! Mapping rule configuration entities.
//!
//! A [`Mapping`] binds a topic pattern to a target-platform record type and
//! carries the ordered [`Substitution`]s that move values from the inbound
//! payload into the outgoing request body. Field names serialise in
//! camelCase so stored rule sets stay compatible with the admin UI.

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------ //
//  Enumerations                                                       //
// ------------------------------------------------------------------ //

/// Whether a mapping translates broker → platform or platform → broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    #[default]
    Inbound,
    Outbound,
}

/// Selects the payload processor used to decode a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingType {
    #[default]
    Json,
    FlatFile,
    GenericBinary,
    ProtobufStatic,
    ProcessorExtension,
}

impl MappingType {
    /// Mapping types whose target template shape is opaque to validation and
    /// whose device identifier is supplied by the processor itself.
    pub fn has_opaque_target(self) -> bool {
        matches!(self, MappingType::ProtobufStatic | MappingType::ProcessorExtension)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MappingType::Json => "JSON",
            MappingType::FlatFile => "FLAT_FILE",
            MappingType::GenericBinary => "GENERIC_BINARY",
            MappingType::ProtobufStatic => "PROTOBUF_STATIC",
            MappingType::ProcessorExtension => "PROCESSOR_EXTENSION",
        }
    }
}

impl std::fmt::Display for MappingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target platform record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Api {
    Alarm,
    Event,
    #[default]
    Measurement,
    Inventory,
    Operation,
}

impl Api {
    /// Name of the target field that carries the device identity.
    pub fn identifier(self) -> &'static str {
        match self {
            Api::Alarm | Api::Event | Api::Measurement => "source.id",
            Api::Inventory => "_DEVICE_IDENT_",
            Api::Operation => "deviceId",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Api::Alarm => "ALARM",
            Api::Event => "EVENT",
            Api::Measurement => "MEASUREMENT",
            Api::Inventory => "INVENTORY",
            Api::Operation => "OPERATION",
        }
    }
}

impl std::fmt::Display for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload-learning state of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnoopStatus {
    #[default]
    None,
    Enabled,
    Started,
    Stopped,
}

impl SnoopStatus {
    /// `true` while payloads are captured instead of translated.
    pub fn is_snooping(self) -> bool {
        matches!(self, SnoopStatus::Enabled | SnoopStatus::Started)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Policy applied when a substitution path under- or over-matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairStrategy {
    /// Keep whatever the target template holds at the path.
    #[default]
    Default,
    UseFirstValueOfArray,
    UseLastValueOfArray,
    /// Never substitute this path.
    Ignore,
    RemoveIfMissing,
}

// ------------------------------------------------------------------ //
//  Validation errors                                                  //
// ------------------------------------------------------------------ //

/// Reasons a mapping is rejected. Serialised with the identifiers the
/// configuration store and UI expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationError {
    #[serde(rename = "Only_One_Substitution_Defining_Device_Identifier_Can_Be_Used")]
    OnlyOneSubstitutionDefiningDeviceIdentifierCanBeUsed,
    #[serde(rename = "One_Substitution_Defining_Device_Identifier_Must_Be_Used")]
    OneSubstitutionDefiningDeviceIdentifierMustBeUsed,
    #[serde(rename = "No_Multi_Level_Wildcard_Allowed_In_MappingTopic")]
    NoMultiLevelWildcardAllowedInMappingTopic,
    #[serde(rename = "Only_One_Multi_Level_Wildcard")]
    OnlyOneMultiLevelWildcard,
    #[serde(rename = "Multi_Level_Wildcard_Only_At_End")]
    MultiLevelWildcardOnlyAtEnd,
    #[serde(rename = "MappingTopic_Must_Match_The_SubscriptionTopic")]
    MappingTopicMustMatchTheSubscriptionTopic,
    #[serde(rename = "FilterOutbound_Must_Be_Unique")]
    FilterOutboundMustBeUnique,
    #[serde(rename = "PublishTopic_And_PublishTopicSample_Do_Not_Have_Same_Number_Of_Levels_In_Topic_Name")]
    PublishTopicAndPublishTopicSampleDoNotHaveSameNumberOfLevelsInTopicName,
    #[serde(rename = "PublishTopic_And_PublishTopicSample_Do_Not_Have_Same_Structure_In_Topic_Name")]
    PublishTopicAndPublishTopicSampleDoNotHaveSameStructureInTopicName,
    #[serde(rename = "MappingTopic_And_MappingTopicSample_Do_Not_Have_Same_Number_Of_Levels_In_Topic_Name")]
    MappingTopicAndMappingTopicSampleDoNotHaveSameNumberOfLevelsInTopicName,
    #[serde(rename = "MappingTopic_And_MappingTopicSample_Do_Not_Have_Same_Structure_In_Topic_Name")]
    MappingTopicAndMappingTopicSampleDoNotHaveSameStructureInTopicName,
    #[serde(rename = "Source_Template_Must_Be_Valid_JSON")]
    SourceTemplateMustBeValidJson,
    #[serde(rename = "Target_Template_Must_Be_Valid_JSON")]
    TargetTemplateMustBeValidJson,
}

impl ValidationError {
    pub fn as_str(self) -> &'static str {
        use ValidationError::*;
        match self {
            OnlyOneSubstitutionDefiningDeviceIdentifierCanBeUsed => {
                "Only_One_Substitution_Defining_Device_Identifier_Can_Be_Used"
            }
            OneSubstitutionDefiningDeviceIdentifierMustBeUsed => {
                "One_Substitution_Defining_Device_Identifier_Must_Be_Used"
            }
            NoMultiLevelWildcardAllowedInMappingTopic => {
                "No_Multi_Level_Wildcard_Allowed_In_MappingTopic"
            }
            OnlyOneMultiLevelWildcard => "Only_One_Multi_Level_Wildcard",
            MultiLevelWildcardOnlyAtEnd => "Multi_Level_Wildcard_Only_At_End",
            MappingTopicMustMatchTheSubscriptionTopic => {
                "MappingTopic_Must_Match_The_SubscriptionTopic"
            }
            FilterOutboundMustBeUnique => "FilterOutbound_Must_Be_Unique",
            PublishTopicAndPublishTopicSampleDoNotHaveSameNumberOfLevelsInTopicName => {
                "PublishTopic_And_PublishTopicSample_Do_Not_Have_Same_Number_Of_Levels_In_Topic_Name"
            }
            PublishTopicAndPublishTopicSampleDoNotHaveSameStructureInTopicName => {
                "PublishTopic_And_PublishTopicSample_Do_Not_Have_Same_Structure_In_Topic_Name"
            }
            MappingTopicAndMappingTopicSampleDoNotHaveSameNumberOfLevelsInTopicName => {
                "MappingTopic_And_MappingTopicSample_Do_Not_Have_Same_Number_Of_Levels_In_Topic_Name"
            }
            MappingTopicAndMappingTopicSampleDoNotHaveSameStructureInTopicName => {
                "MappingTopic_And_MappingTopicSample_Do_Not_Have_Same_Structure_In_Topic_Name"
            }
            SourceTemplateMustBeValidJson => "Source_Template_Must_Be_Valid_JSON",
            TargetTemplateMustBeValidJson => "Target_Template_Must_Be_Valid_JSON",
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ------------------------------------------------------------------ //
//  Substitution                                                       //
// ------------------------------------------------------------------ //

/// One source-path → target-path instruction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Substitution {
    /// JSONPath into the decoded payload.
    pub path_source: String,
    /// Dotted path into the target template.
    pub path_target: String,
    pub repair_strategy: RepairStrategy,
    /// Append each element of an extracted array as its own value.
    pub expand_array: bool,
}

impl Substitution {
    pub fn new(path_source: impl Into<String>, path_target: impl Into<String>) -> Self {
        Self {
            path_source: path_source.into(),
            path_target: path_target.into(),
            ..Default::default()
        }
    }

    pub fn with_repair(mut self, repair_strategy: RepairStrategy) -> Self {
        self.repair_strategy = repair_strategy;
        self
    }

    pub fn expanded(mut self) -> Self {
        self.expand_array = true;
        self
    }

    /// `true` for the substitution carrying the external device identity.
    ///
    /// Inbound rules write the identity into the target identifier field;
    /// outbound rules read it from the platform's identifier field.
    pub fn defines_device_identifier(&self, api: Api, direction: Direction) -> bool {
        match direction {
            Direction::Inbound => self.path_target == api.identifier(),
            Direction::Outbound => self.path_source == api.identifier(),
        }
    }
}

// ------------------------------------------------------------------ //
//  Mapping                                                            //
// ------------------------------------------------------------------ //

/// Reference to a processor extension entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtensionRef {
    /// Name of the extension artifact.
    pub name: String,
    /// Key of the entry within the artifact manifest.
    pub event: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Mapping {
    pub id: String,
    pub ident: String,
    pub direction: Direction,
    pub mapping_type: MappingType,
    #[serde(rename = "targetAPI")]
    pub target_api: Api,

    pub subscription_topic: String,
    pub mapping_topic: String,
    pub mapping_topic_sample: String,
    pub publish_topic: String,
    pub publish_topic_sample: String,
    pub filter_outbound: String,

    /// JSON template describing the expected payload.
    pub source: String,
    /// JSON template of the request body written to the platform.
    pub target: String,

    pub active: bool,
    pub qos: Qos,
    pub substitutions: Vec<Substitution>,

    /// Translate the extracted external id into the platform's internal id.
    pub map_device_identifier: bool,
    pub create_non_existing_device: bool,
    pub update_existing_device: bool,
    pub external_id_type: String,

    pub snoop_status: SnoopStatus,
    pub snooped_templates: Vec<String>,
    pub extension: Option<ExtensionRef>,
    /// Unix millis of the last accepted change.
    pub last_update: i64,
}

pub const DEFAULT_EXTERNAL_ID_TYPE: &str = "c8y_Serial";

impl Default for Mapping {
    fn default() -> Self {
        Self {
            id: String::new(),
            ident: String::new(),
            direction: Direction::Inbound,
            mapping_type: MappingType::Json,
            target_api: Api::Measurement,
            subscription_topic: String::new(),
            mapping_topic: String::new(),
            mapping_topic_sample: String::new(),
            publish_topic: String::new(),
            publish_topic_sample: String::new(),
            filter_outbound: String::new(),
            source: "{}".to_string(),
            target: "{}".to_string(),
            active: false,
            qos: Qos::AtMostOnce,
            substitutions: Vec::new(),
            map_device_identifier: true,
            create_non_existing_device: false,
            update_existing_device: false,
            external_id_type: DEFAULT_EXTERNAL_ID_TYPE.to_string(),
            snoop_status: SnoopStatus::None,
            snooped_templates: Vec::new(),
            extension: None,
            last_update: 0,
        }
    }
}

impl Mapping {
    /// Substitutions that define the device identifier for this mapping.
    pub fn device_identifier_substitutions(&self) -> impl Iterator<Item = &Substitution> + '_ {
        self.substitutions
            .iter()
            .filter(move |s| s.defines_device_identifier(self.target_api, self.direction))
    }

    pub fn find_device_identifier(&self) -> Option<&Substitution> {
        self.device_identifier_substitutions().next()
    }

    /// Cache key holding the device identity for this mapping.
    pub fn identifier_key(&self) -> &str {
        match self.find_device_identifier() {
            Some(sub) => &sub.path_target,
            None => self.target_api.identifier(),
        }
    }

    pub fn is_snooping(&self) -> bool {
        self.snoop_status.is_snooping()
    }

    pub fn external_id_type(&self) -> &str {
        if self.external_id_type.trim().is_empty() {
            DEFAULT_EXTERNAL_ID_TYPE
        } else {
            &self.external_id_type
        }
    }

    /// Rewrite every topic field into its normalised form.
    pub fn normalize_topics(&mut self) {
        use crate::topic::normalize;
        self.subscription_topic = normalize(self.subscription_topic.as_str());
        self.mapping_topic = normalize(self.mapping_topic.as_str());
        self.mapping_topic_sample = normalize(self.mapping_topic_sample.as_str());
        self.publish_topic = normalize(self.publish_topic.as_str());
        self.publish_topic_sample = normalize(self.publish_topic_sample.as_str());
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
