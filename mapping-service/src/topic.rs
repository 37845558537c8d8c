//! Topic grammar.
//!
//! Topics are `/`-delimited hierarchies. Patterns may contain the
//! single-level wildcard `+` (exactly one level) and the multi-level
//! wildcard `#` (any suffix, only valid as the last level of a subscription).
//! Everything here is pure.

use regex::Regex;
use tracing::warn;

use crate::model::ValidationError;

pub const TOPIC_WILDCARD_MULTI: char = '#';
pub const TOPIC_WILDCARD_SINGLE: char = '+';
pub const TOPIC_SEPARATOR: char = '/';

/// Appended to both sides of a coverage check so a trailing `+` cannot be
/// absorbed by the final separator.
const SENTINEL: char = '\u{0}';

// ------------------------------------------------------------------ //
//  Normalisation                                                      //
// ------------------------------------------------------------------ //

/// Normalise a topic.
///
/// Trims whitespace, collapses runs of two or more leading or trailing
/// separators into one, and folds a trailing `#/` into `#`. `None` is
/// treated as the empty topic.
pub fn normalize<'a>(topic: impl Into<Option<&'a str>>) -> String {
    let topic = topic.into().unwrap_or_default().trim();
    let mut nt = collapse_edge_separators(topic);
    if nt.ends_with("#/") {
        nt.pop();
    }
    nt
}

fn collapse_edge_separators(topic: &str) -> String {
    if topic.len() >= 2 && topic.chars().all(|c| c == TOPIC_SEPARATOR) {
        return TOPIC_SEPARATOR.to_string();
    }
    let leading = topic.len() - topic.trim_start_matches(TOPIC_SEPARATOR).len();
    let trailing = topic.len() - topic.trim_end_matches(TOPIC_SEPARATOR).len();
    let start = if leading >= 2 { leading - 1 } else { 0 };
    let end = if trailing >= 2 {
        topic.len() - (trailing - 1)
    } else {
        topic.len()
    };
    topic[start..end].to_string()
}

pub fn is_wildcard(topic: &str) -> bool {
    topic.contains(TOPIC_WILDCARD_MULTI) || topic.contains(TOPIC_WILDCARD_SINGLE)
}

// ------------------------------------------------------------------ //
//  Splitting                                                          //
// ------------------------------------------------------------------ //

/// Split a topic into alternating separator and level tokens.
///
/// The topic is normalised first, so joining the result reproduces
/// [`normalize`]`(topic)`.
pub fn split_topic_including_separator(topic: &str) -> Vec<String> {
    let normalized = normalize(topic);
    let mut segments = Vec::new();
    let mut level = String::new();
    for c in normalized.chars() {
        if c == TOPIC_SEPARATOR {
            if !level.is_empty() {
                segments.push(std::mem::take(&mut level));
            }
            segments.push(TOPIC_SEPARATOR.to_string());
        } else {
            level.push(c);
        }
    }
    if !level.is_empty() {
        segments.push(level);
    }
    segments
}

/// Level names only, separators dropped.
pub fn split_topic_excluding_separator(topic: &str) -> Vec<String> {
    split_topic_including_separator(topic)
        .into_iter()
        .filter(|s| !is_separator(s))
        .collect()
}

fn is_separator(token: &str) -> bool {
    token.len() == 1 && token.starts_with(TOPIC_SEPARATOR)
}

fn is_wildcard_level(token: &str) -> bool {
    token.len() == 1 && (token.starts_with(TOPIC_WILDCARD_SINGLE) || token.starts_with(TOPIC_WILDCARD_MULTI))
}

// ------------------------------------------------------------------ //
//  Validation                                                         //
// ------------------------------------------------------------------ //

/// Mapping topics select a concrete dispatch target and may not use `#`.
/// Any number of `+` is allowed.
pub fn validate_mapping_topic(topic: &str) -> Vec<ValidationError> {
    let mut result = Vec::new();
    if topic.contains(TOPIC_WILDCARD_MULTI) {
        result.push(ValidationError::NoMultiLevelWildcardAllowedInMappingTopic);
    }
    result
}

/// Subscription topics may hold at most one `#`, and only as the last
/// character. The number of `+` is not limited.
pub fn validate_subscription_topic(topic: &str) -> Vec<ValidationError> {
    let mut result = Vec::new();
    let count = topic.matches(TOPIC_WILDCARD_MULTI).count();
    if count > 1 {
        result.push(ValidationError::OnlyOneMultiLevelWildcard);
    }
    if count >= 1 && topic.find(TOPIC_WILDCARD_MULTI) != Some(topic.len() - 1) {
        result.push(ValidationError::MultiLevelWildcardOnlyAtEnd);
    }
    result
}

// ------------------------------------------------------------------ //
//  Matching                                                           //
// ------------------------------------------------------------------ //

/// `true` iff every message addressed by `candidate_topic` would also be
/// delivered to a subscription on `subscription_topic`.
pub fn topic_is_covered_by(subscription_topic: &str, candidate_topic: &str) -> bool {
    match TopicMatcher::new(subscription_topic) {
        Ok(matcher) => matcher.covers(candidate_topic),
        Err(e) => {
            warn!(subscription_topic, error = %e, "could not build topic matcher");
            false
        }
    }
}

/// Compiled form of a subscription pattern, built once per rule.
///
/// `+` becomes one-or-more non-separator characters, `#` any suffix,
/// everything else is matched literally. The sentinel closes the pattern.
#[derive(Debug, Clone)]
pub struct TopicMatcher(Regex);

impl TopicMatcher {
    pub fn new(subscription_topic: &str) -> Result<Self, regex::Error> {
        let body = subscription_topic
            .split(TOPIC_WILDCARD_SINGLE)
            .map(|part| {
                part.split(TOPIC_WILDCARD_MULTI)
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(".*")
            })
            .collect::<Vec<_>>()
            .join("[^/]+");
        Regex::new(&format!(r"(?s)\A{body}\x00\z")).map(Self)
    }

    pub fn covers(&self, candidate_topic: &str) -> bool {
        self.0.is_match(&format!("{candidate_topic}{SENTINEL}"))
    }
}

// ------------------------------------------------------------------ //
//  Structural comparison                                              //
// ------------------------------------------------------------------ //

/// Which pair of topics is being compared; selects the reported errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRole {
    /// `mappingTopic` against `mappingTopicSample`.
    Mapping,
    /// `publishTopic` against `publishTopicSample`.
    Publish,
}

impl TopicRole {
    fn levels_error(self) -> ValidationError {
        match self {
            TopicRole::Mapping => {
                ValidationError::MappingTopicAndMappingTopicSampleDoNotHaveSameNumberOfLevelsInTopicName
            }
            TopicRole::Publish => {
                ValidationError::PublishTopicAndPublishTopicSampleDoNotHaveSameNumberOfLevelsInTopicName
            }
        }
    }

    fn structure_error(self) -> ValidationError {
        match self {
            TopicRole::Mapping => {
                ValidationError::MappingTopicAndMappingTopicSampleDoNotHaveSameStructureInTopicName
            }
            TopicRole::Publish => {
                ValidationError::PublishTopicAndPublishTopicSampleDoNotHaveSameStructureInTopicName
            }
        }
    }
}

/// Compare a pattern with a concrete sample level by level.
///
/// Token counts must agree, separators must line up, and literal levels
/// must be equal wherever neither side is a wildcard. At most one error is
/// reported.
pub fn same_structure(role: TopicRole, pattern: &str, sample: &str) -> Vec<ValidationError> {
    let pattern_tokens = split_topic_including_separator(pattern);
    let sample_tokens = split_topic_including_separator(sample);

    if pattern_tokens.len() != sample_tokens.len() {
        return vec![role.levels_error()];
    }

    let mismatch = pattern_tokens.iter().zip(&sample_tokens).any(|(p, s)| {
        let (p_sep, s_sep) = (is_separator(p), is_separator(s));
        if p_sep != s_sep {
            return true;
        }
        !p_sep && !is_wildcard_level(p) && !is_wildcard_level(s) && p != s
    });

    if mismatch {
        vec![role.structure_error()]
    } else {
        Vec::new()
    }
}

/// Fill the `+` levels of `pattern` in order with `levels`. Wildcards left
/// over when `levels` runs out are kept.
pub fn substitute_wildcards(pattern: &str, levels: &[String]) -> String {
    let mut remaining = levels.iter();
    split_topic_including_separator(pattern)
        .into_iter()
        .map(|token| {
            if token.len() == 1 && token.starts_with(TOPIC_WILDCARD_SINGLE) {
                remaining.next().cloned().unwrap_or(token)
            } else {
                token
            }
        })
        .collect()
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
