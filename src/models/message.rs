//! Message index entries, message bodies and message properties.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Property types recognised out of the box.
pub mod property_types {
    pub const URGENT: &str = "URGENT";
    pub const MARK_USER: &str = "MARK_USER";
    pub const MARK_ADM: &str = "MARK_ADM";
    pub const PROCESSING_FORBIDDEN: &str = "PROCESSING_FORBIDDEN";
    pub const NIGHT_EMBARGO: &str = "NIGHT_EMBARGO";
    pub const COPYRIGHT: &str = "COPYRIGHT";
    pub const CORRUPTED_AND_RESTORED: &str = "CORRUPTED_AND_RESTORED";
    pub const CORRUPTED_AND_LOST: &str = "CORRUPTED_AND_LOST";
    pub const RELOCATED: &str = "RELOCATED";

    pub const DEFAULTS: &[&str] = &[
        URGENT,
        MARK_USER,
        MARK_ADM,
        PROCESSING_FORBIDDEN,
        NIGHT_EMBARGO,
        COPYRIGHT,
        CORRUPTED_AND_RESTORED,
        CORRUPTED_AND_LOST,
        RELOCATED,
    ];
}

/// Message identifier.
///
/// Always rendered as a fixed-width, zero-padded decimal so that string order
/// matches numeric order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MessageId(u64);

impl MessageId {
    pub const WIDTH: usize = 10;

    /// Largest id that still fits in [`Self::WIDTH`] digits.
    pub const MAX: MessageId = MessageId(9_999_999_999);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The following id, or `None` once the id space is used up.
    pub fn next(self) -> Option<Self> {
        self.0
            .checked_add(1)
            .filter(|n| *n <= Self::MAX.0)
            .map(Self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = Self::WIDTH)
    }
}

impl FromStr for MessageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > Self::WIDTH || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid message id '{}'", s));
        }
        s.parse::<u64>()
            .map(MessageId)
            .map_err(|e| format!("invalid message id '{}': {}", s, e))
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// `previousId` is stored as `-1` for original messages.
mod previous_id {
    use super::MessageId;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const ORIGINAL: &str = "-1";

    pub fn serialize<S: Serializer>(value: &Option<MessageId>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(id) => serializer.collect_str(id),
            None => serializer.serialize_str(ORIGINAL),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<MessageId>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == ORIGINAL {
            return Ok(None);
        }
        raw.parse().map(Some).map_err(serde::de::Error::custom)
    }
}

/// Marker attached to a message by a user or by the system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    #[serde(rename = "type")]
    pub kind: String,
    pub user: String,
    #[serde(default)]
    pub text: Option<String>,
    pub timestamp: String,
}

impl Property {
    pub fn new(kind: impl Into<String>, user: impl Into<String>, text: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            user: user.into(),
            text,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Index record of one published message. The body lives outside the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEntry {
    #[serde(default)]
    pub id: MessageId,
    #[serde(with = "previous_id", default)]
    pub previous_id: Option<MessageId>,
    pub topics: Vec<String>,
    pub header: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub original_author: String,
    pub current_author: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl MessageEntry {
    /// Latest property of the given type.
    pub fn property(&self, kind: &str) -> Option<&Property> {
        self.properties.iter().rev().find(|p| p.kind == kind)
    }

    pub fn has_property(&self, kind: &str) -> bool {
        self.property(kind).is_some()
    }

    pub fn add_property(&mut self, kind: &str, user: &str, text: Option<String>) {
        self.properties.push(Property::new(kind, user, text));
    }

    /// Remove the property matching both type and timestamp.
    pub fn remove_property(&mut self, kind: &str, timestamp: &str) -> bool {
        match self
            .properties
            .iter()
            .position(|p| p.kind == kind && p.timestamp == timestamp)
        {
            Some(pos) => {
                self.properties.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Drop every property except `COPYRIGHT` and `URGENT`.
    pub fn clean_properties(&mut self) {
        let copyright = self.property(property_types::COPYRIGHT).cloned();
        let urgent = self.property(property_types::URGENT).cloned();
        self.properties.clear();
        self.properties.extend(copyright);
        self.properties.extend(urgent);
    }

    pub fn copyright(&self) -> Option<&str> {
        self.property(property_types::COPYRIGHT)
            .and_then(|p| p.text.as_deref())
    }

    pub fn set_copyright(&mut self, user: &str, holder: &str) {
        self.properties
            .retain(|p| p.kind != property_types::COPYRIGHT);
        self.add_property(property_types::COPYRIGHT, user, Some(holder.to_string()));
    }

    /// Overwrite the editable fields with those of a modification template.
    ///
    /// `original_author` is never touched.
    pub fn apply_template(&mut self, template: &MessageEntry, editor: &str) {
        self.header = template.header.clone();
        self.language = template.language.clone();
        self.topics = template.topics.clone();
        self.tags = template.tags.clone();
        self.properties = template.properties.clone();
        self.current_author = editor.to_string();
    }
}

/// A message travelling through the publish pipeline: index entry plus body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(flatten)]
    pub entry: MessageEntry,
    #[serde(default)]
    pub content: String,
}

impl Message {
    pub fn new(
        header: &str,
        author: &str,
        language: &str,
        topics: &[&str],
        tags: &[&str],
        content: &str,
    ) -> Self {
        Self {
            entry: MessageEntry {
                id: MessageId::default(),
                previous_id: None,
                topics: topics.iter().map(|s| s.to_string()).collect(),
                header: header.to_string(),
                date: String::new(),
                original_author: String::new(),
                current_author: author.to_string(),
                tags: tags.iter().map(|s| s.to_string()).collect(),
                language: language.to_string(),
                properties: Vec::new(),
            },
            content: content.to_string(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.entry.id
    }
}

/// Registry of accepted property type names.
///
/// Starts with [`property_types::DEFAULTS`]; plugins may add their own.
pub struct PropertyTypes {
    known: RwLock<HashSet<String>>,
}

impl PropertyTypes {
    pub fn with_defaults() -> Self {
        Self {
            known: RwLock::new(
                property_types::DEFAULTS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
        }
    }

    /// Register a type name. Returns `true` if it was not known before.
    pub fn register(&self, kind: &str) -> bool {
        self.known.write().insert(kind.to_string())
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.known.read().contains(kind)
    }
}

impl Default for PropertyTypes {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_is_zero_padded() {
        assert_eq!(MessageId::new(42).to_string(), "0000000042");
        assert!(MessageId::new(9).to_string() < MessageId::new(10).to_string());
    }

    #[test]
    fn test_message_id_rejects_garbage() {
        assert!("-1".parse::<MessageId>().is_err());
        assert!("abc".parse::<MessageId>().is_err());
        assert_eq!("0000000007".parse::<MessageId>().unwrap(), MessageId::new(7));
        assert!("10000000000".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_message_id_space_is_bounded() {
        assert_eq!(MessageId::new(7).next(), Some(MessageId::new(8)));
        assert_eq!(MessageId::MAX.next(), None);
        assert_eq!(MessageId::new(u64::MAX).next(), None);
        assert_eq!(MessageId::MAX.to_string().len(), MessageId::WIDTH);
    }

    #[test]
    fn test_previous_id_serializes_as_minus_one() {
        let msg = Message::new("Header", "bob", "UA", &["NEWS"], &[], "body");
        let json = serde_json::to_value(&msg.entry).unwrap();
        assert_eq!(json["previousId"], "-1");

        let back: MessageEntry = serde_json::from_value(json).unwrap();
        assert!(back.previous_id.is_none());
    }

    #[test]
    fn test_clean_properties_keeps_copyright_and_urgent() {
        let mut msg = Message::new("Header", "bob", "UA", &["NEWS"], &[], "body");
        msg.entry.add_property(property_types::MARK_USER, "bob", Some("check".into()));
        msg.entry.set_copyright("bob", "Agency");
        msg.entry.add_property(property_types::URGENT, "bob", None);
        msg.entry.add_property(property_types::NIGHT_EMBARGO, "bob", None);

        msg.entry.clean_properties();

        let kinds: Vec<_> = msg.entry.properties.iter().map(|p| p.kind.as_str()).collect();
        assert_eq!(kinds, vec![property_types::COPYRIGHT, property_types::URGENT]);
        assert_eq!(msg.entry.copyright(), Some("Agency"));
    }

    #[test]
    fn test_apply_template_keeps_original_author() {
        let mut entry = Message::new("Old", "alice", "UA", &["NEWS"], &["a"], "").entry;
        entry.original_author = "alice".into();
        let template = Message::new("New", "ignored", "EN", &["NEWS.Sport"], &["b"], "").entry;

        entry.apply_template(&template, "editor");

        assert_eq!(entry.header, "New");
        assert_eq!(entry.original_author, "alice");
        assert_eq!(entry.current_author, "editor");
        assert_eq!(entry.topics, vec!["NEWS.Sport".to_string()]);
    }

    #[test]
    fn test_property_types_registration() {
        let types = PropertyTypes::with_defaults();
        assert!(types.is_registered(property_types::URGENT));
        assert!(!types.is_registered("EXPORT_MAIL"));
        assert!(types.register("EXPORT_MAIL"));
        assert!(!types.register("EXPORT_MAIL"));
        assert!(types.is_registered("EXPORT_MAIL"));
    }
}
