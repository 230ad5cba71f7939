//! Message index: ordered log of message entries plus the tag index.
//!
//! New entries are appended to the durable log before `append` returns.
//! Edits only change memory and schedule a full rewrite of the log in the
//! background; an edit made shortly before a crash can be lost.

mod log;
mod tags;

pub use tags::TagIndex;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::errors::AppError;
use crate::models::{MessageEntry, MessageId};

struct LogState {
    entries: Vec<MessageEntry>,
    last_id: MessageId,
}

/// Append-only message store.
pub struct MessageIndex {
    path: PathBuf,
    log: RwLock<LogState>,
    tags: TagIndex,
    // Serializes appends and rewrites against the file.
    writer: tokio::sync::Mutex<()>,
}

impl MessageIndex {
    /// Load the durable log at `path`, creating it when missing.
    pub async fn open(path: &Path) -> Result<Self, AppError> {
        let entries = log::read_log(path).await?;
        let last_id = entries
            .iter()
            .map(|e| e.id)
            .max()
            .unwrap_or_default();

        let tags = TagIndex::new();
        for entry in &entries {
            tags.add(&entry.tags, entry.id);
        }

        tracing::info!(
            path = %path.display(),
            messages = entries.len(),
            last_id = %last_id,
            "Message index loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            log: RwLock::new(LogState { entries, last_id }),
            tags,
            writer: tokio::sync::Mutex::new(()),
        })
    }

    /// Assign the next id, stamp the date and persist the entry.
    ///
    /// On a failed write the entry is rolled back and the id is reused.
    pub async fn append(&self, mut entry: MessageEntry) -> Result<MessageEntry, AppError> {
        let _writer = self.writer.lock().await;

        let previous_last = {
            let mut log = self.log.write();
            let previous_last = log.last_id;
            entry.id = previous_last.next().ok_or_else(|| {
                AppError::Storage(format!("Message id space exhausted after {}", previous_last))
            })?;
            entry.date = Utc::now().to_rfc3339();
            log.last_id = entry.id;
            log.entries.push(entry.clone());
            previous_last
        };
        self.tags.add(&entry.tags, entry.id);

        if let Err(e) = log::append_record(&self.path, &entry).await {
            tracing::error!(id = %entry.id, error = %e, "Failed to append message to log");
            self.tags.remove(&entry.tags, entry.id);
            let mut log = self.log.write();
            log.entries.retain(|m| m.id != entry.id);
            log.last_id = previous_last;
            return Err(e);
        }

        tracing::debug!(id = %entry.id, "Message appended");
        Ok(entry)
    }

    /// Linear scan by id.
    pub fn by_id(&self, id: MessageId) -> Option<MessageEntry> {
        self.log.read().entries.iter().find(|m| m.id == id).cloned()
    }

    /// Replace an entry, moving its tags. Returns the previous version.
    pub fn replace(self: &Arc<Self>, entry: MessageEntry) -> Result<MessageEntry, AppError> {
        let old = {
            let mut log = self.log.write();
            let slot = log
                .entries
                .iter_mut()
                .find(|m| m.id == entry.id)
                .ok_or_else(|| AppError::NotFound(format!("Message {} not found", entry.id)))?;
            std::mem::replace(slot, entry.clone())
        };
        self.tags.modify(&old.tags, &entry.tags, entry.id);
        self.schedule_rewrite();
        Ok(old)
    }

    /// Mutate an entry in place and schedule a rewrite.
    pub fn update<R>(
        self: &Arc<Self>,
        id: MessageId,
        f: impl FnOnce(&mut MessageEntry) -> Result<R, AppError>,
    ) -> Result<R, AppError> {
        let result = {
            let mut log = self.log.write();
            let entry = log
                .entries
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or_else(|| AppError::NotFound(format!("Message {} not found", id)))?;
            f(entry)?
        };
        self.schedule_rewrite();
        Ok(result)
    }

    /// Remove an entry and its tag references.
    pub fn delete(self: &Arc<Self>, id: MessageId) -> Result<MessageEntry, AppError> {
        let removed = {
            let mut log = self.log.write();
            let pos = log
                .entries
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| AppError::NotFound(format!("Message {} not found", id)))?;
            log.entries.remove(pos)
        };
        self.tags.remove(&removed.tags, id);
        self.schedule_rewrite();
        Ok(removed)
    }

    /// Rewrite the durable log from memory in a background task.
    pub fn schedule_rewrite(self: &Arc<Self>) -> JoinHandle<()> {
        let index = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = index.rewrite().await {
                tracing::error!(error = %e, "Message log rewrite failed");
            }
        })
    }

    /// Rewrite the durable log from a snapshot of memory.
    pub async fn rewrite(&self) -> Result<(), AppError> {
        let _writer = self.writer.lock().await;
        let snapshot = self.log.read().entries.clone();
        log::write_snapshot(&self.path, &snapshot).await?;
        tracing::debug!(messages = snapshot.len(), "Message log rewritten");
        Ok(())
    }

    /// Entries with an id greater than `after`, oldest first.
    pub fn entries_since(&self, after: Option<MessageId>) -> Vec<MessageEntry> {
        let log = self.log.read();
        match after {
            Some(after) => log.entries.iter().filter(|m| m.id > after).cloned().collect(),
            None => log.entries.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.log.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_id(&self) -> MessageId {
        self.log.read().last_id
    }

    pub fn tags(&self) -> Vec<String> {
        self.tags.names()
    }

    pub fn messages_for_tag(&self, tag: &str) -> Option<Vec<MessageId>> {
        self.tags.messages_for(tag)
    }
}
