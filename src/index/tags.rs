//! Inverted tag index.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::models::MessageId;

/// Tag name to message ids, in filing order.
///
/// A tag is created on first use and kept even when its list empties.
#[derive(Default)]
pub struct TagIndex {
    tags: Mutex<BTreeMap<String, Vec<MessageId>>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<S: AsRef<str>>(&self, tags: &[S], id: MessageId) {
        let mut map = self.tags.lock();
        for tag in tags {
            let ids = map.entry(tag.as_ref().to_string()).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }

    pub fn remove<S: AsRef<str>>(&self, tags: &[S], id: MessageId) {
        let mut map = self.tags.lock();
        for tag in tags {
            if let Some(ids) = map.get_mut(tag.as_ref()) {
                ids.retain(|m| *m != id);
            }
        }
    }

    /// Move a message from its old tag set to a new one.
    pub fn modify<S: AsRef<str>>(&self, old: &[S], new: &[S], id: MessageId) {
        let mut map = self.tags.lock();
        for tag in old {
            if let Some(ids) = map.get_mut(tag.as_ref()) {
                ids.retain(|m| *m != id);
            }
        }
        for tag in new {
            let ids = map.entry(tag.as_ref().to_string()).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tags.lock().keys().cloned().collect()
    }

    pub fn messages_for(&self, tag: &str) -> Option<Vec<MessageId>> {
        self.tags.lock().get(tag).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modify_moves_between_tags() {
        let index = TagIndex::new();
        let id = MessageId::new(1);
        index.add(&["economy", "europe"], id);
        index.modify(&["economy", "europe"], &["europe", "energy"], id);

        assert_eq!(index.messages_for("economy"), Some(vec![]));
        assert_eq!(index.messages_for("europe"), Some(vec![id]));
        assert_eq!(index.messages_for("energy"), Some(vec![id]));
        assert_eq!(index.names(), vec!["economy", "energy", "europe"]);
    }

    #[test]
    fn test_unknown_tag() {
        let index = TagIndex::new();
        index.remove(&["ghost"], MessageId::new(1));
        assert!(index.messages_for("ghost").is_none());
    }
}
