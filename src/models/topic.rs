//! Topic schema and permission models.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Action a principal attempts on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read = 0,
    Post = 1,
    Admin = 2,
}

impl AccessMode {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "READ",
            AccessMode::Post => "POST",
            AccessMode::Admin => "ADMIN",
        }
    }
}

/// Three-bit permission mask (READ, POST, ADMIN).
///
/// Rendered as a string of `0`/`1` characters, e.g. `"110"`. Bits missing from a
/// shorter string are denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessMask([bool; 3]);

impl AccessMask {
    pub const READ_ONLY: AccessMask = AccessMask([true, false, false]);
    pub const READ_WRITE: AccessMask = AccessMask([true, true, false]);

    pub fn new(read: bool, post: bool, admin: bool) -> Self {
        Self([read, post, admin])
    }

    pub fn allows(&self, mode: AccessMode) -> bool {
        self.0.get(mode.index()).copied().unwrap_or(false)
    }
}

impl FromStr for AccessMask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 3 {
            return Err(format!("invalid access mask '{}'", s));
        }
        let mut bits = [false; 3];
        for (slot, ch) in bits.iter_mut().zip(s.chars()) {
            *slot = match ch {
                '1' => true,
                '0' => false,
                _ => return Err(format!("invalid access mask '{}'", s)),
            };
        }
        Ok(Self(bits))
    }
}

impl fmt::Display for AccessMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in self.0 {
            f.write_str(if bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl Serialize for AccessMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AccessMask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Permission granted to a user, a group or the `ALL` pseudo-group on one topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionEntry {
    pub key: String,
    #[serde(default)]
    pub is_group: bool,
    pub mask: AccessMask,
}

impl PermissionEntry {
    pub fn new(key: impl Into<String>, is_group: bool, mask: AccessMask) -> Self {
        Self {
            key: key.into(),
            is_group,
            mask,
        }
    }

    pub fn allows(&self, mode: AccessMode) -> bool {
        self.mask.allows(mode)
    }
}

/// Persisted topic definition, one per configured topic path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSchema {
    pub full_path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub export_schemas: Vec<String>,
    /// `None` means the topic defers to the system default mask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<PermissionEntry>>,
}

impl TopicSchema {
    pub fn new(full_path: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            full_path: full_path.into(),
            description: description.into(),
            languages: Vec::new(),
            export_schemas: Vec::new(),
            permissions: None,
        }
    }

    pub fn with_permissions(mut self, permissions: Vec<PermissionEntry>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_exports(mut self, schemas: &[&str]) -> Self {
        self.export_schemas = schemas.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_parse_and_render() {
        let mask: AccessMask = "110".parse().unwrap();
        assert!(mask.allows(AccessMode::Read));
        assert!(mask.allows(AccessMode::Post));
        assert!(!mask.allows(AccessMode::Admin));
        assert_eq!(mask.to_string(), "110");
    }

    #[test]
    fn test_short_mask_denies_missing_bits() {
        let mask: AccessMask = "1".parse().unwrap();
        assert!(mask.allows(AccessMode::Read));
        assert!(!mask.allows(AccessMode::Post));
        assert_eq!(mask.to_string(), "100");
    }

    #[test]
    fn test_invalid_mask() {
        assert!("12".parse::<AccessMask>().is_err());
        assert!("".parse::<AccessMask>().is_err());
        assert!("1101".parse::<AccessMask>().is_err());
    }

    #[test]
    fn test_schema_without_permissions_round_trips_as_none() {
        let json = r#"{"fullPath":"NEWS.Sport","description":"Sport"}"#;
        let schema: TopicSchema = serde_json::from_str(json).unwrap();
        assert!(schema.permissions.is_none());
        assert!(schema.export_schemas.is_empty());
    }
}
