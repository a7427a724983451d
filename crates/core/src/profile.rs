//! User profile metadata (kind 0 events).

use crate::event::{Event, KIND_METADATA};
use serde::{Deserialize, Serialize};

/// Profile fields carried in a metadata event's JSON content. All fields are
/// optional; clients populate whatever subset they care about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,

    /// DNS-based identifier, e.g. `name@example.com`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,

    /// Lightning address for tips.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
}

impl Profile {
    /// Parse a profile from a metadata event. Returns `None` for other
    /// kinds or unparseable content; stale or malformed metadata is not an
    /// error condition worth surfacing.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != KIND_METADATA {
            return None;
        }
        serde_json::from_str(&event.content).ok()
    }

    /// The name to show for this profile, preferring `display_name`.
    pub fn best_name(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.name.as_deref().filter(|s| !s.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KIND_TEXT_NOTE;

    fn metadata_event(content: &str) -> Event {
        Event {
            id: "id".to_string(),
            pubkey: "pubkey".to_string(),
            created_at: 1_700_000_000,
            kind: KIND_METADATA,
            tags: vec![],
            content: content.to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn parses_known_fields_and_ignores_extras() {
        let event = metadata_event(
            r#"{"name":"alice","about":"hi","picture":"https://example.com/a.png","custom_field":42}"#,
        );
        let profile = Profile::from_event(&event).unwrap();
        assert_eq!(profile.name.as_deref(), Some("alice"));
        assert_eq!(profile.about.as_deref(), Some("hi"));
        assert!(profile.display_name.is_none());
    }

    #[test]
    fn wrong_kind_is_none() {
        let mut event = metadata_event(r#"{"name":"alice"}"#);
        event.kind = KIND_TEXT_NOTE;
        assert!(Profile::from_event(&event).is_none());
    }

    #[test]
    fn malformed_content_is_none() {
        assert!(Profile::from_event(&metadata_event("not json")).is_none());
        assert!(Profile::from_event(&metadata_event("[1,2,3]")).is_none());
    }

    #[test]
    fn best_name_prefers_display_name() {
        let profile = Profile {
            name: Some("alice".to_string()),
            display_name: Some("Alice B".to_string()),
            ..Default::default()
        };
        assert_eq!(profile.best_name(), Some("Alice B"));

        let fallback = Profile {
            name: Some("alice".to_string()),
            display_name: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(fallback.best_name(), Some("alice"));

        assert!(Profile::default().best_name().is_none());
    }

    #[test]
    fn serialization_omits_empty_fields() {
        let profile = Profile {
            name: Some("alice".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&profile).unwrap();
        assert_eq!(json, r#"{"name":"alice"}"#);
    }
}
