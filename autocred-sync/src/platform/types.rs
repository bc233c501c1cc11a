//! External platform data types
//!
//! The platform returns subscriber tags in two shapes (bare strings on some
//! endpoints, `{id, name}` objects on others). Both are normalized into the
//! canonical [`Tag`] at deserialization; nothing downstream ever sees the raw
//! shapes.

use serde::{Deserialize, Deserializer, Serialize};

/// Canonical platform tag
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tag {
    /// Platform-internal tag id (absent when the tag arrived as a bare string)
    pub id: Option<i64>,
    /// Tag name as registered on the platform
    pub name: String,
}

/// Raw tag shape on the wire: either "tag-name" or {"id": 7, "name": "tag-name"}
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTag {
    Full { id: i64, name: String },
    Name(String),
}

impl From<RawTag> for Tag {
    fn from(raw: RawTag) -> Self {
        match raw {
            RawTag::Full { id, name } => Tag { id: Some(id), name },
            RawTag::Name(name) => Tag { id: None, name },
        }
    }
}

fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<Tag>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<RawTag>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(Tag::from)
        .collect())
}

/// Subscriber as known to the external platform
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Subscriber {
    pub id: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// WhatsApp-channel phone, when the subscriber came in over WhatsApp
    #[serde(default)]
    pub whatsapp_phone: Option<String>,
    /// Instagram username, when the subscriber came in over Instagram
    #[serde(default)]
    pub ig_username: Option<String>,
    #[serde(default, deserialize_with = "deserialize_tags")]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub custom_fields: serde_json::Value,
}

impl Subscriber {
    /// Does the live tag set contain this name? Case-insensitive, trimmed.
    pub fn has_tag(&self, name: &str) -> bool {
        let wanted = crate::tags::normalize_tag(name);
        self.tags
            .iter()
            .any(|t| crate::tags::normalize_tag(&t.name) == wanted)
    }
}

/// Identifiers for subscriber lookup, tried in priority order:
/// platform id, then phone, then email.
#[derive(Debug, Clone, Default)]
pub struct LookupIdentifiers {
    pub subscriber_id: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl LookupIdentifiers {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            subscriber_id: Some(id.into()),
            ..Default::default()
        }
    }
}

/// Messaging channel a subscriber is reachable on, used by platform-side
/// automation rules to filter flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    WhatsApp,
    Instagram,
    Messenger,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::WhatsApp => "whatsapp",
            Channel::Instagram => "instagram",
            Channel::Messenger => "messenger",
        }
    }
}

/// Detect the subscriber's channel from platform identifiers.
/// WhatsApp wins when a phone is present; Instagram when an IG username is
/// set; everything else is treated as Messenger.
pub fn detect_channel(subscriber: &Subscriber) -> Channel {
    if subscriber.whatsapp_phone.is_some() {
        return Channel::WhatsApp;
    }
    if subscriber.ig_username.is_some() {
        return Channel::Instagram;
    }
    if subscriber
        .phone
        .as_deref()
        .map(|p| p.trim_start_matches('+').chars().all(|c| c.is_ascii_digit()) && !p.is_empty())
        .unwrap_or(false)
    {
        return Channel::WhatsApp;
    }
    Channel::Messenger
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_heterogeneous_tags_normalized() {
        let subscriber: Subscriber = serde_json::from_value(json!({
            "id": "mc-1001",
            "tags": ["lead-consultando", {"id": 42, "name": "atencion-humana"}]
        }))
        .unwrap();

        assert_eq!(subscriber.tags.len(), 2);
        assert_eq!(subscriber.tags[0].name, "lead-consultando");
        assert_eq!(subscriber.tags[0].id, None);
        assert_eq!(subscriber.tags[1].name, "atencion-humana");
        assert_eq!(subscriber.tags[1].id, Some(42));
    }

    #[test]
    fn test_missing_tags_is_empty() {
        let subscriber: Subscriber =
            serde_json::from_value(json!({"id": "mc-1001"})).unwrap();
        assert!(subscriber.tags.is_empty());
    }

    #[test]
    fn test_has_tag_case_insensitive() {
        let subscriber: Subscriber = serde_json::from_value(json!({
            "id": "mc-1001",
            "tags": ["Credito-Preaprobado"]
        }))
        .unwrap();

        assert!(subscriber.has_tag("credito-preaprobado"));
        assert!(subscriber.has_tag("  CREDITO-PREAPROBADO "));
        assert!(!subscriber.has_tag("lead-consultando"));
    }

    #[test]
    fn test_channel_detection() {
        let whatsapp: Subscriber = serde_json::from_value(json!({
            "id": "1", "whatsapp_phone": "+5215512345678"
        }))
        .unwrap();
        assert_eq!(detect_channel(&whatsapp), Channel::WhatsApp);

        let instagram: Subscriber = serde_json::from_value(json!({
            "id": "2", "ig_username": "autos.mx"
        }))
        .unwrap();
        assert_eq!(detect_channel(&instagram), Channel::Instagram);

        let by_phone: Subscriber = serde_json::from_value(json!({
            "id": "3", "phone": "+5215512345678"
        }))
        .unwrap();
        assert_eq!(detect_channel(&by_phone), Channel::WhatsApp);

        let messenger: Subscriber = serde_json::from_value(json!({"id": "4"})).unwrap();
        assert_eq!(detect_channel(&messenger), Channel::Messenger);
    }
}
