/// Topic matching for single filter checks
///
/// The router walks its segment tree instead; this is used where one filter
/// is compared against one topic, such as ACL rules and retained lookups.
use crate::validation::{is_valid_topic_filter, is_valid_topic_name};

/// Matches a topic name against a topic filter with wildcard support
///
/// Topics starting with `$` are never matched by a leading wildcard.
///
/// # Examples
/// ```
/// # use sentel_broker::topic_matching::matches;
/// assert!(matches("sport/tennis", "sport/tennis"));
/// assert!(matches("sport/tennis", "sport/+"));
/// assert!(matches("sport/tennis/player1", "sport/#"));
/// assert!(!matches("sport/tennis", "sport/+/player1"));
/// assert!(!matches("$SYS/uptime", "#"));
/// ```
#[must_use]
pub fn matches(topic: &str, filter: &str) -> bool {
    if !is_valid_topic_name(topic) || !is_valid_topic_filter(filter) {
        return false;
    }

    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    if topic == filter {
        return true;
    }

    let topic_parts: Vec<&str> = topic.split('/').collect();
    let filter_parts: Vec<&str> = filter.split('/').collect();

    match_parts(&topic_parts, &filter_parts)
}

fn match_parts(topic_parts: &[&str], filter_parts: &[&str]) -> bool {
    match (topic_parts.first(), filter_parts.first()) {
        (None, None) => true,
        // "sport/#" also matches the parent level "sport"
        (_, Some(&"#")) => true,
        (None, Some(_)) | (Some(_), None) => false,
        (Some(&topic_part), Some(&filter_part)) => {
            (filter_part == "+" || filter_part == topic_part)
                && match_parts(&topic_parts[1..], &filter_parts[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_wildcards() {
        assert!(matches("sensors/room1/temp", "sensors/+/temp"));
        assert!(!matches("sensors/room1/humidity", "sensors/+/temp"));
        assert!(!matches("sensors/room1/a/temp", "sensors/+/temp"));
        assert!(matches("sport", "sport/#"));
        assert!(matches("sport/tennis/player1/score", "sport/#"));
        assert!(matches("/finance", "+/+"));
        assert!(matches("/finance", "/+"));
        assert!(!matches("/finance", "+"));
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!matches("$SYS/monitor", "#"));
        assert!(!matches("$SYS/monitor", "+/monitor"));
        assert!(matches("$SYS/monitor", "$SYS/#"));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(!matches("", "#"));
        assert!(!matches("a/+", "a/+"));
        assert!(!matches("a/b", "a/#/b"));
    }
}
