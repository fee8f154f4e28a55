/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::error::{SchistError, SchistResult};
use crate::mqtt::PacketType;
use crate::validate::*;

use log::*;

pub(crate) fn validate_string_length(value: &str, packet_type: PacketType, packet_name: &str, field_name: &str) -> SchistResult<()> {
    if value.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
        error!("{}Packet Validation - {} string field too long", packet_name, field_name);
        return Err(SchistError::new_packet_validation(packet_type, format!("{} string field too long", field_name)));
    }

    Ok(())
}

pub(crate) fn validate_optional_string_length(optional_string: &Option<String>, packet_type: PacketType, packet_name: &str, field_name: &str) -> SchistResult<()> {
    if let Some(value) = &optional_string {
        validate_string_length(value, packet_type, packet_name, field_name)?;
    }

    Ok(())
}

pub(crate) fn validate_optional_binary_length(optional_data: &Option<Vec<u8>>, packet_type: PacketType, packet_name: &str, field_name: &str) -> SchistResult<()> {
    if let Some(value) = &optional_data {
        if value.len() > MAXIMUM_BINARY_PROPERTY_LENGTH {
            error!("{}Packet Validation - {} binary field too long", packet_name, field_name);
            return Err(SchistError::new_packet_validation(packet_type, format!("{} binary field too long", field_name)));
        }
    }

    Ok(())
}

pub(crate) fn is_valid_topic(topic: &str) -> bool {
    if topic.is_empty() || topic.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
        return false;
    }

    if topic.contains(['#', '+']) {
        return false;
    }

    true
}

// if the topic filter is not valid, then the other fields are not to be trusted
pub(crate) struct TopicFilterProperties {
    pub is_valid: bool,
    pub has_wildcard: bool
}

fn compute_topic_filter_properties(topic: &str) -> TopicFilterProperties {
    let mut properties = TopicFilterProperties {
        is_valid: true,
        has_wildcard: false
    };

    if topic.is_empty() || topic.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
        properties.is_valid = false;
        return properties;
    }

    let mut seen_mlw = false;
    for segment in topic.split('/') {
        if seen_mlw {
            properties.is_valid = false;
            break;
        }

        let has_wildcard = segment.contains(['#', '+']);
        properties.has_wildcard |= has_wildcard;

        if segment.len() == 1 {
            if segment == "#" {
                seen_mlw = true;
            }
        } else if has_wildcard {
            properties.is_valid = false;
            break;
        }
    }

    properties
}

pub(crate) fn is_valid_topic_filter(filter: &str) -> bool {
    compute_topic_filter_properties(filter).is_valid
}

/// Checks whether a concrete topic falls under a (valid) topic filter.  Topics starting with
/// '$' are not matched by filters whose first level is a wildcard.
pub(crate) fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_segments = topic.split('/');
    let mut filter_segments = filter.split('/');

    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (Some("#"), _) => { return true; }
            (Some("+"), Some(_)) => {}
            (Some(filter_segment), Some(topic_segment)) => {
                if filter_segment != topic_segment {
                    return false;
                }
            }
            (None, None) => { return true; }
            _ => { return false; }
        }
    }
}
