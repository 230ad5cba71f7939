//! Repository for persisted records and message bodies.
//!
//! Whole-file rewrites go through a temp file and a rename.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::errors::AppError;
use crate::models::{
    ExportSchemaConfig, ImportSchemaConfig, MessageId, TopicSchema, User, UserGroup,
};

const TOPICS_FILE: &str = "topics.json";
const USERS_FILE: &str = "users.json";
const GROUPS_FILE: &str = "groups.json";
const INDEX_FILE: &str = "index/messages.json";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Storage repository for all persisted data.
///
/// Record files (topics, users, groups) are read-modify-written under
/// `records`, so clones of one repository never lose each other's updates.
#[derive(Clone)]
pub struct Repository {
    base: PathBuf,
    records: Arc<Mutex<()>>,
}

impl Repository {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            records: Arc::new(Mutex::new(())),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Location of the durable message log.
    pub fn index_path(&self) -> PathBuf {
        self.base.join(INDEX_FILE)
    }

    // ==================== TOPIC OPERATIONS ====================

    /// List all topic schemas in stored order.
    pub async fn topics(&self) -> Result<Vec<TopicSchema>, AppError> {
        read_lines(&self.base.join(TOPICS_FILE)).await
    }

    /// Insert or replace a topic schema keyed by its full path.
    pub async fn save_topic(&self, schema: &TopicSchema) -> Result<(), AppError> {
        let _guard = self.records.lock().await;
        let mut all = self.topics().await?;
        match all.iter_mut().find(|t| t.full_path == schema.full_path) {
            Some(existing) => *existing = schema.clone(),
            None => all.push(schema.clone()),
        }
        write_lines(&self.base.join(TOPICS_FILE), &all).await
    }

    // ==================== USER OPERATIONS ====================

    pub async fn users(&self) -> Result<Vec<User>, AppError> {
        read_lines(&self.base.join(USERS_FILE)).await
    }

    pub async fn save_user(&self, user: &User) -> Result<(), AppError> {
        let _guard = self.records.lock().await;
        let mut all = self.users().await?;
        match all.iter_mut().find(|u| u.login == user.login) {
            Some(existing) => *existing = user.clone(),
            None => all.push(user.clone()),
        }
        write_lines(&self.base.join(USERS_FILE), &all).await
    }

    // ==================== GROUP OPERATIONS ====================

    pub async fn groups(&self) -> Result<Vec<UserGroup>, AppError> {
        read_lines(&self.base.join(GROUPS_FILE)).await
    }

    pub async fn save_group(&self, group: &UserGroup) -> Result<(), AppError> {
        let _guard = self.records.lock().await;
        let mut all = self.groups().await?;
        match all.iter_mut().find(|g| g.name == group.name) {
            Some(existing) => *existing = group.clone(),
            None => all.push(group.clone()),
        }
        write_lines(&self.base.join(GROUPS_FILE), &all).await
    }

    // ==================== SCHEMA CONFIG OPERATIONS ====================

    /// Export schema configs, one JSON document per file under `export/`.
    pub async fn export_configs(&self) -> Result<Vec<ExportSchemaConfig>, AppError> {
        read_dir_documents(&self.base.join("export")).await
    }

    pub async fn save_export_config(&self, config: &ExportSchemaConfig) -> Result<(), AppError> {
        let path = self.base.join("export").join(format!("{}.json", config.name));
        write_document(&path, config).await
    }

    /// Import schema configs, one JSON document per file under `import/`.
    pub async fn import_configs(&self) -> Result<Vec<ImportSchemaConfig>, AppError> {
        read_dir_documents(&self.base.join("import")).await
    }

    pub async fn save_import_config(&self, config: &ImportSchemaConfig) -> Result<(), AppError> {
        let path = self.base.join("import").join(format!("{}.json", config.name));
        write_document(&path, config).await
    }

    // ==================== BODY OPERATIONS ====================

    fn body_path(&self, storage_path: &str, id: MessageId) -> PathBuf {
        self.base
            .join("topics")
            .join(storage_path)
            .join(id.to_string())
    }

    /// Create the storage directory of one topic.
    pub async fn ensure_topic_dir(&self, storage_path: &str) -> Result<(), AppError> {
        tokio::fs::create_dir_all(self.base.join("topics").join(storage_path)).await?;
        Ok(())
    }

    pub async fn write_body(
        &self,
        storage_path: &str,
        id: MessageId,
        content: &str,
    ) -> Result<(), AppError> {
        let path = self.body_path(storage_path, id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    pub async fn read_body(&self, storage_path: &str, id: MessageId) -> Result<String, AppError> {
        let path = self.body_path(storage_path, id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::NotFound(
                format!("Body of message {} not found in '{}'", id, storage_path),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a body. A missing file is not an error.
    pub async fn delete_body(&self, storage_path: &str, id: MessageId) -> Result<(), AppError> {
        match tokio::fs::remove_file(self.body_path(storage_path, id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ==================== REPORT OPERATIONS ====================

    pub async fn write_report(&self, name: &str, content: &str) -> Result<PathBuf, AppError> {
        let path = self.base.join("reports").join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }
}

// ==================== HELPERS ====================

/// Read a JSON-lines file. A missing file yields an empty list.
async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, AppError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(AppError::from))
        .collect()
}

async fn write_lines<T: Serialize>(path: &Path, records: &[T]) -> Result<(), AppError> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    replace_file(path, out.as_bytes()).await
}

async fn write_document<T: Serialize>(path: &Path, record: &T) -> Result<(), AppError> {
    let raw = serde_json::to_vec_pretty(record)?;
    replace_file(path, &raw).await
}

/// Read every `*.json` file in a directory, sorted by file name.
async fn read_dir_documents<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, AppError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = tokio::fs::read(&path).await?;
        match serde_json::from_slice(&raw) {
            Ok(record) => out.push(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable config");
            }
        }
    }
    Ok(out)
}

/// Write `content` to a uniquely named sibling temp file, then rename it over `path`.
pub(crate) async fn replace_file(path: &Path, content: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::Internal(format!("Bad record path {}", path.display())))?;
    let tmp = path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    if let Err(e) = tokio::fs::write(&tmp, content).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
