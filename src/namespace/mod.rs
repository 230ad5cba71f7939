//! Topic namespace tree.
//!
//! Topics form a dot-separated hierarchy (`NEWS.Sport.Football`). The tree is
//! built once at startup from the persisted schemas; afterwards only message
//! membership and permission lists change. Lookups go through a full-path map,
//! the child links are kept for enumeration and deployment.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::db::Repository;
use crate::errors::AppError;
use crate::models::{MessageId, PermissionEntry, TopicSchema};

/// Description given to intermediate nodes that have no schema of their own.
pub const PLACEHOLDER_DESCRIPTION: &str = "Empty topic";

/// One node of the namespace tree.
pub struct TopicNode {
    pub name: String,
    pub full_path: String,
    pub storage_path: String,
    pub description: String,
    pub languages: Vec<String>,
    pub export_subscriptions: Vec<String>,
    permissions: RwLock<Option<Arc<[PermissionEntry]>>>,
    children: Vec<usize>,
    message_ids: Mutex<Vec<MessageId>>,
}

impl TopicNode {
    fn placeholder(name: &str, full_path: &str) -> Self {
        Self {
            name: name.to_string(),
            full_path: full_path.to_string(),
            storage_path: storage_path_for(full_path),
            description: PLACEHOLDER_DESCRIPTION.to_string(),
            languages: Vec::new(),
            export_subscriptions: Vec::new(),
            permissions: RwLock::new(None),
            children: Vec::new(),
            message_ids: Mutex::new(Vec::new()),
        }
    }

    fn apply(&mut self, schema: &TopicSchema) {
        self.description = schema.description.clone();
        self.languages = schema.languages.clone();
        self.export_subscriptions = schema.export_schemas.clone();
        *self.permissions.get_mut() = schema.permissions.clone().map(Arc::from);
    }

    /// Snapshot of the node's own permission list.
    pub fn permissions(&self) -> Option<Arc<[PermissionEntry]>> {
        self.permissions.read().clone()
    }

    /// Snapshot of the message ids filed under this topic, in publish order.
    pub fn message_ids(&self) -> Vec<MessageId> {
        self.message_ids.lock().clone()
    }

    /// Persistable form of this node.
    pub fn to_schema(&self) -> TopicSchema {
        TopicSchema {
            full_path: self.full_path.clone(),
            description: self.description.clone(),
            languages: self.languages.clone(),
            export_schemas: self.export_subscriptions.clone(),
            permissions: self.permissions().map(|p| p.to_vec()),
        }
    }
}

/// `NEWS.Sport` is stored under `news/sport`.
pub fn storage_path_for(full_path: &str) -> String {
    full_path.to_lowercase().replace('.', "/")
}

fn is_valid_path(path: &str) -> bool {
    !path.is_empty() && path.split('.').all(|seg| !seg.is_empty() && !seg.contains('/'))
}

/// Hierarchical topic catalog.
pub struct NamespaceTree {
    nodes: Vec<TopicNode>,
    by_path: HashMap<String, usize>,
    // Storage path -> full path; storage paths are lower-cased.
    by_storage: HashMap<String, String>,
}

const ROOT: usize = 0;

impl NamespaceTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![TopicNode::placeholder("", "")],
            by_path: HashMap::new(),
            by_storage: HashMap::new(),
        }
    }

    /// Build a tree from persisted schemas, in order.
    pub fn build(schemas: &[TopicSchema]) -> Self {
        let mut tree = Self::new();
        for schema in schemas {
            tree.insert(schema);
        }
        tracing::info!(topics = tree.len(), "Namespace tree built");
        tree
    }

    /// Insert one schema, creating missing intermediate nodes as placeholders.
    ///
    /// A schema for a path that already exists as a placeholder is applied to it.
    /// Paths differing from an existing topic only by case would share its
    /// storage directory and are skipped. Returns whether the schema was applied.
    pub fn insert(&mut self, schema: &TopicSchema) -> bool {
        if !is_valid_path(&schema.full_path) {
            tracing::warn!(path = %schema.full_path, "Skipping topic with invalid path");
            return false;
        }
        if let Some(existing) = self.storage_collision(&schema.full_path) {
            tracing::warn!(
                path = %schema.full_path,
                existing = %existing,
                "Skipping topic whose storage collides with another topic"
            );
            return false;
        }

        let mut parent = ROOT;
        let mut full = String::new();
        for segment in schema.full_path.split('.') {
            if !full.is_empty() {
                full.push('.');
            }
            full.push_str(segment);

            parent = match self.by_path.get(&full) {
                Some(&idx) => idx,
                None => {
                    let idx = self.nodes.len();
                    self.nodes.push(TopicNode::placeholder(segment, &full));
                    self.nodes[parent].children.push(idx);
                    self.by_path.insert(full.clone(), idx);
                    self.by_storage.insert(storage_path_for(&full), full.clone());
                    idx
                }
            };
        }

        self.nodes[parent].apply(schema);
        true
    }

    /// First prefix of `path` that is new but whose storage path is taken.
    fn storage_collision(&self, path: &str) -> Option<String> {
        let mut full = String::new();
        for segment in path.split('.') {
            if !full.is_empty() {
                full.push('.');
            }
            full.push_str(segment);
            if self.by_path.contains_key(&full) {
                continue;
            }
            if let Some(existing) = self.by_storage.get(&storage_path_for(&full)) {
                return Some(existing.clone());
            }
        }
        None
    }

    /// Number of topics, root excluded.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resolve(&self, path: &str) -> Option<&TopicNode> {
        self.by_path.get(path).map(|&idx| &self.nodes[idx])
    }

    pub fn exists(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    /// Lookup that fails with `TopicNotFound`.
    pub fn get(&self, path: &str) -> Result<&TopicNode, AppError> {
        self.resolve(path)
            .ok_or_else(|| AppError::TopicNotFound(path.to_string()))
    }

    /// File a message under a topic. Unknown paths are ignored.
    pub fn add_message(&self, path: &str, id: MessageId) {
        if let Some(node) = self.resolve(path) {
            let mut ids = node.message_ids.lock();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }

    /// Remove a message from a topic. Unknown paths are ignored.
    pub fn remove_message(&self, path: &str, id: MessageId) {
        if let Some(node) = self.resolve(path) {
            node.message_ids.lock().retain(|m| *m != id);
        }
    }

    /// Permission list attached directly to the topic.
    ///
    /// `Ok(None)` means the topic has no list of its own; ancestors are not
    /// consulted.
    pub fn permissions_for(&self, path: &str) -> Result<Option<Arc<[PermissionEntry]>>, AppError> {
        Ok(self.get(path)?.permissions())
    }

    /// Replace the permission list of a topic.
    pub fn set_permissions(
        &self,
        path: &str,
        permissions: Option<Vec<PermissionEntry>>,
    ) -> Result<(), AppError> {
        let node = self.get(path)?;
        *node.permissions.write() = permissions.map(Arc::from);
        tracing::info!(topic = %path, "Topic permissions replaced");
        Ok(())
    }

    /// All topics, depth first, parents before children.
    pub fn topics(&self) -> Vec<&TopicNode> {
        let mut out = Vec::with_capacity(self.len());
        let mut stack: Vec<usize> = self.nodes[ROOT].children.iter().rev().copied().collect();
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            out.push(node);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Indented text dump of the tree.
    pub fn tree_report(&self) -> String {
        let mut out = String::new();
        for node in self.topics() {
            let depth = node.full_path.matches('.').count();
            let _ = writeln!(
                out,
                "{}{} : {} [{} messages]",
                "  ".repeat(depth),
                node.name,
                node.description,
                node.message_ids.lock().len()
            );
            if !node.export_subscriptions.is_empty() {
                let _ = writeln!(
                    out,
                    "{}  exports: {}",
                    "  ".repeat(depth),
                    node.export_subscriptions.join(", ")
                );
            }
        }
        out
    }

    /// Create each topic's storage directory. Returns the number of topics deployed.
    pub async fn deploy(&self, repo: &Repository) -> Result<usize, AppError> {
        let topics = self.topics();
        for node in &topics {
            repo.ensure_topic_dir(&node.storage_path).await?;
        }
        tracing::info!(topics = topics.len(), "Topic storage deployed");
        Ok(topics.len())
    }
}

impl Default for NamespaceTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccessMask;
    use tempfile::TempDir;

    fn sample() -> NamespaceTree {
        NamespaceTree::build(&[
            TopicSchema::new("NEWS", "News"),
            TopicSchema::new("NEWS.Sport.Football", "Football"),
            TopicSchema::new("NEWS.Sport", "Sport").with_exports(&["wire"]),
            TopicSchema::new("ARCHIVE", "Archive"),
        ])
    }

    #[test]
    fn test_resolve_returns_matching_full_path() {
        let tree = sample();
        for path in ["NEWS", "NEWS.Sport", "NEWS.Sport.Football", "ARCHIVE"] {
            assert_eq!(tree.resolve(path).unwrap().full_path, path);
        }
        assert!(tree.resolve("NEWS.Politics").is_none());
        assert!(tree.resolve("").is_none());
    }

    #[test]
    fn test_later_schema_fills_placeholder() {
        let tree = sample();
        let sport = tree.resolve("NEWS.Sport").unwrap();
        assert_eq!(sport.description, "Sport");
        assert_eq!(sport.export_subscriptions, vec!["wire".to_string()]);
        assert_eq!(sport.storage_path, "news/sport");
    }

    #[test]
    fn test_intermediate_node_gets_placeholder() {
        let tree = NamespaceTree::build(&[TopicSchema::new("A.B.C", "leaf")]);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.resolve("A.B").unwrap().description, PLACEHOLDER_DESCRIPTION);
    }

    #[test]
    fn test_case_colliding_paths_are_skipped() {
        let mut tree = sample();
        assert!(!tree.insert(&TopicSchema::new("news.Weather", "shadow")));
        assert!(!tree.insert(&TopicSchema::new("NEWS.SPORT", "shadow")));
        assert!(!tree.exists("news.Weather"));
        assert!(!tree.exists("news"));
        assert!(!tree.exists("NEWS.SPORT"));

        assert!(tree.insert(&TopicSchema::new("NEWS.Weather", "Weather")));
        assert_eq!(tree.resolve("NEWS.Weather").unwrap().storage_path, "news/weather");
    }

    #[test]
    fn test_invalid_paths_are_skipped() {
        let tree = NamespaceTree::build(&[
            TopicSchema::new("A..B", "bad"),
            TopicSchema::new(".A", "bad"),
        ]);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_membership_add_remove() {
        let tree = sample();
        let id = MessageId::new(1);
        tree.add_message("NEWS", id);
        tree.add_message("NEWS", id);
        tree.add_message("NOWHERE", id);
        assert_eq!(tree.resolve("NEWS").unwrap().message_ids(), vec![id]);

        tree.remove_message("NEWS", id);
        tree.remove_message("NOWHERE", id);
        assert!(tree.resolve("NEWS").unwrap().message_ids().is_empty());
    }

    #[test]
    fn test_permissions_are_not_inherited() {
        let tree = NamespaceTree::build(&[
            TopicSchema::new("NEWS", "News").with_permissions(vec![PermissionEntry::new(
                "ALL",
                true,
                AccessMask::READ_ONLY,
            )]),
            TopicSchema::new("NEWS.Sport", "Sport"),
        ]);

        assert_eq!(tree.permissions_for("NEWS").unwrap().unwrap().len(), 1);
        assert!(tree.permissions_for("NEWS.Sport").unwrap().is_none());
        assert!(matches!(
            tree.permissions_for("NEWS.Weather"),
            Err(AppError::TopicNotFound(_))
        ));
    }

    #[test]
    fn test_permission_snapshot_survives_replacement() {
        let tree = sample();
        tree.set_permissions(
            "NEWS",
            Some(vec![PermissionEntry::new("ALL", true, AccessMask::READ_ONLY)]),
        )
        .unwrap();
        let before = tree.permissions_for("NEWS").unwrap().unwrap();

        tree.set_permissions("NEWS", Some(Vec::new())).unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(tree.permissions_for("NEWS").unwrap().unwrap().len(), 0);
    }

    #[test]
    fn test_topics_depth_first() {
        let tree = sample();
        let paths: Vec<_> = tree.topics().iter().map(|n| n.full_path.clone()).collect();
        assert_eq!(
            paths,
            vec!["NEWS", "NEWS.Sport", "NEWS.Sport.Football", "ARCHIVE"]
        );
    }

    #[test]
    fn test_tree_report_indents_children() {
        let report = sample().tree_report();
        assert!(report.contains("NEWS : News"));
        assert!(report.contains("\n  Sport : Sport"));
        assert!(report.contains("    Football : Football"));
        assert!(report.contains("exports: wire"));
    }

    #[tokio::test]
    async fn test_deploy_creates_storage_dirs() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::new(dir.path());
        let deployed = sample().deploy(&repo).await.unwrap();

        assert_eq!(deployed, 4);
        assert!(dir.path().join("topics/news/sport/football").is_dir());
        assert!(dir.path().join("topics/archive").is_dir());
    }
}
