//! Topic name, unit id and filter matching rules
//!
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - A unit id is exactly one topic level
//! - Filters are matched level by level, + for one level and # for the rest

/// Validate a topic name (used in PUBLISH)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a unit identifier used as a single topic level
///
/// The unit id is spliced into topics, so it must be one non-empty level
/// without wildcards.
pub fn validate_unit_id(unit: &str) -> Result<(), &'static str> {
    if unit.is_empty() {
        return Err("unit id cannot be empty");
    }

    if unit.contains('/') {
        return Err("unit id cannot contain a level separator");
    }

    if unit.contains('+') || unit.contains('#') {
        return Err("unit id cannot contain wildcards");
    }

    if unit.contains('\0') {
        return Err("unit id cannot contain null character");
    }

    Ok(())
}

/// Check if a topic filter matches a topic name
///
/// - / is the level separator
/// - + matches exactly one level
/// - # matches zero or more levels (must be last)
/// - $-topics don't match filters starting with + or #
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');

    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }

        match topic_levels.next() {
            Some(_) if filter_level == "+" => {}
            Some(level) if level == filter_level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}
