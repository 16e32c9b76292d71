//! Channel resolution for live delivery.
//!
//! Every connected user listens on exactly one channel, `events-{userId}`.
//! Resolution classifies a payload by who it names as recipients: structured
//! notification fields win, the generic user fields are a best-effort
//! fallback, and a payload naming nobody resolves to no channel at all.

use std::fmt;

use serde_json::{Map, Value};

/// Prefix shared by all per-user channels.
pub const CHANNEL_PREFIX: &str = "events-";

/// Structured recipient fields, in resolution order.
const STRUCTURED_FIELDS: [&str; 2] = ["postAuthorId", "parentCommentAuthorId"];

/// Generic user fields; the first present one wins.
const HEURISTIC_FIELDS: [&str; 3] = ["userId", "receiverUserId", "receiverId"];

/// Name of a live-delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn for_user(user_id: impl fmt::Display) -> Self {
        ChannelKey(format!("{}{}", CHANNEL_PREFIX, user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ChannelKey> for String {
    fn from(key: ChannelKey) -> Self {
        key.0
    }
}

/// Who a payload addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// Post author and/or parent-comment author, deduplicated.
    Structured(Vec<String>),
    /// First generic user field found.
    Heuristic(String),
    /// Payload names nobody.
    Nobody,
}

impl Recipients {
    /// Classify a payload.
    pub fn classify(payload: &Map<String, Value>) -> Self {
        let mut structured: Vec<String> = Vec::with_capacity(STRUCTURED_FIELDS.len());
        for id in STRUCTURED_FIELDS.iter().filter_map(|f| identity(payload, f)) {
            if !structured.contains(&id) {
                structured.push(id);
            }
        }
        if !structured.is_empty() {
            return Recipients::Structured(structured);
        }

        HEURISTIC_FIELDS
            .iter()
            .find_map(|f| identity(payload, f))
            .map(Recipients::Heuristic)
            .unwrap_or(Recipients::Nobody)
    }

    pub fn into_channels(self) -> Vec<ChannelKey> {
        match self {
            Recipients::Structured(ids) => ids.into_iter().map(ChannelKey::for_user).collect(),
            Recipients::Heuristic(id) => vec![ChannelKey::for_user(id)],
            Recipients::Nobody => Vec::new(),
        }
    }
}

/// Resolve the channels a payload should be published to.
///
/// Pure: the same payload always yields the same channels in the same order.
pub fn resolve_channels(payload: &Map<String, Value>) -> Vec<ChannelKey> {
    Recipients::classify(payload).into_channels()
}

/// Read a user identity from a field. Strings must be non-blank; numbers are
/// accepted as-is.
fn identity(payload: &Map<String, Value>, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    fn names(channels: Vec<ChannelKey>) -> Vec<String> {
        channels.into_iter().map(String::from).collect()
    }

    #[test]
    fn test_post_and_parent_authors_resolve_to_both() {
        let p = payload(json!({"postAuthorId": "A", "parentCommentAuthorId": "B"}));

        assert_eq!(names(resolve_channels(&p)), vec!["events-A", "events-B"]);
    }

    #[test]
    fn test_same_author_twice_is_deduplicated() {
        let p = payload(json!({"postAuthorId": "A", "parentCommentAuthorId": "A"}));

        assert_eq!(names(resolve_channels(&p)), vec!["events-A"]);
    }

    #[test]
    fn test_structured_fields_take_priority_over_heuristic() {
        let p = payload(json!({"userId": "U", "parentCommentAuthorId": "B"}));

        assert_eq!(
            Recipients::classify(&p),
            Recipients::Structured(vec!["B".to_string()])
        );
    }

    #[test]
    fn test_receiver_user_id_fallback() {
        let p = payload(json!({"receiverUserId": "C"}));

        assert_eq!(names(resolve_channels(&p)), vec!["events-C"]);
    }

    #[test]
    fn test_heuristic_first_match_wins() {
        let p = payload(json!({"receiverId": "R", "userId": "U", "receiverUserId": "C"}));

        assert_eq!(Recipients::classify(&p), Recipients::Heuristic("U".to_string()));
    }

    #[test]
    fn test_numeric_identity_is_accepted() {
        let p = payload(json!({"receiverId": 42}));

        assert_eq!(names(resolve_channels(&p)), vec!["events-42"]);
    }

    #[test]
    fn test_blank_and_non_scalar_fields_are_ignored() {
        let p = payload(json!({"postAuthorId": "  ", "userId": null, "receiverId": {"id": 1}}));

        assert_eq!(Recipients::classify(&p), Recipients::Nobody);
    }

    #[test]
    fn test_unrelated_payload_resolves_to_nothing() {
        let p = payload(json!({"foo": "bar"}));

        assert!(resolve_channels(&p).is_empty());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let p = payload(json!({"parentCommentAuthorId": "B", "postAuthorId": "A", "userId": "U"}));

        let first = resolve_channels(&p);
        for _ in 0..10 {
            assert_eq!(resolve_channels(&p), first);
        }
        assert_eq!(names(first), vec!["events-A", "events-B"]);
    }

    #[test]
    fn test_channel_key_display() {
        let key = ChannelKey::for_user(uuid::Uuid::nil());

        assert_eq!(key.to_string(), "events-00000000-0000-0000-0000-000000000000");
        assert_eq!(key.as_str(), key.to_string());
    }
}
