use crate::constants::limits::MAX_STRING_LENGTH;
use crate::error::{MqttError, Result};

pub use crate::topic_matching::matches as topic_matches_filter;

/// Validates an MQTT topic name
///
/// # Rules:
/// - Must have at least one character
/// - Must not contain null characters (U+0000)
/// - Must not exceed maximum string length when UTF-8 encoded
/// - Must not contain wildcard characters (+, #); those belong to filters
#[must_use]
pub fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= usize::from(MAX_STRING_LENGTH)
        && !topic.contains(['\0', '+', '#'])
}

/// Validates an MQTT topic filter
///
/// # Rules:
/// - Must follow all topic name rules except wildcard usage
/// - Single-level wildcard (+) must occupy entire level
/// - Multi-level wildcard (#) must be last character and occupy entire level
/// - Examples: sport/+/player, sport/tennis/#, +/tennis/#
#[must_use]
pub fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > usize::from(MAX_STRING_LENGTH) || filter.contains('\0')
    {
        return false;
    }

    let parts: Vec<&str> = filter.split('/').collect();
    let last = parts.len() - 1;

    parts.iter().enumerate().all(|(i, part)| {
        if part.contains('#') {
            return i == last && *part == "#";
        }
        !part.contains('+') || *part == "+"
    })
}

/// Validates a topic name and returns an error if invalid
///
/// # Errors
///
/// Returns `MqttError::InvalidTopicName` if the topic name breaks any rule
/// of [`is_valid_topic_name`]
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if !is_valid_topic_name(topic) {
        return Err(MqttError::InvalidTopicName(topic.to_string()));
    }
    Ok(())
}

/// Validates a topic filter and returns an error if invalid
///
/// # Errors
///
/// Returns `MqttError::InvalidTopicFilter` if the filter breaks any rule
/// of [`is_valid_topic_filter`]
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if !is_valid_topic_filter(filter) {
        return Err(MqttError::InvalidTopicFilter(filter.to_string()));
    }
    Ok(())
}
