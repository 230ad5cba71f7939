//! Importer trait and the built-in spool directory importer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::PluginError;
use crate::models::{ImportSchemaConfig, Message};

/// One fetched message plus the receipt used to settle it with its source.
#[derive(Debug, Clone)]
pub struct Imported {
    pub message: Message,
    pub receipt: String,
}

/// A polled source of messages.
///
/// `poll` must not consume anything: a message stays at the source until it
/// is acknowledged or rejected by receipt, so a message that could not be
/// published is fetched again on the next cycle.
#[async_trait]
pub trait Importer: Send + Sync {
    fn name(&self) -> &str;

    fn module_type(&self) -> &str;

    /// Stable identity of the source, part of its dirty-state key.
    fn fingerprint(&self) -> &str;

    /// Fetch whatever is waiting at the source.
    async fn poll(&self) -> Result<Vec<Imported>, PluginError>;

    /// The message was published; drop it from the source.
    async fn acknowledge(&self, _receipt: &str) -> Result<(), PluginError> {
        Ok(())
    }

    /// The message can never be published; set it aside.
    async fn reject(&self, _receipt: &str) -> Result<(), PluginError> {
        Ok(())
    }

    /// Bring a failed source back. Only called while the source is dirty.
    async fn recover(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Picks up `*.json` message documents dropped into a spool directory.
///
/// Files are deleted once acknowledged; undecodable or rejected ones are moved
/// to `rejected/`. Settings: `dir` (required), `copyright` (holder stamped on
/// messages that carry none).
pub struct SpoolImporter {
    name: String,
    fingerprint: String,
    dir: PathBuf,
    copyright: Option<String>,
}

impl SpoolImporter {
    pub const TYPE: &'static str = "spool";

    pub fn from_config(config: &ImportSchemaConfig) -> Result<Arc<dyn Importer>, PluginError> {
        let dir = config
            .settings
            .get("dir")
            .ok_or_else(|| PluginError::Config(format!("source '{}' has no 'dir'", config.name)))?;
        Ok(Arc::new(Self {
            name: config.name.clone(),
            fingerprint: config.fingerprint.clone(),
            dir: PathBuf::from(dir),
            copyright: config.settings.get("copyright").cloned(),
        }))
    }

    /// Only plain files directly inside the spool directory are valid receipts.
    fn spool_file(&self, receipt: &str) -> Result<PathBuf, PluginError> {
        let path = PathBuf::from(receipt);
        if path.parent() != Some(self.dir.as_path()) {
            return Err(PluginError::Malformed(format!(
                "receipt {} is outside {}",
                receipt,
                self.dir.display()
            )));
        }
        Ok(path)
    }

    async fn move_to_rejected(&self, path: &Path) -> Result<(), PluginError> {
        let rejected = self.dir.join("rejected");
        tokio::fs::create_dir_all(&rejected).await?;
        if let Some(file_name) = path.file_name() {
            tokio::fs::rename(path, rejected.join(file_name)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Importer for SpoolImporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn module_type(&self) -> &str {
        Self::TYPE
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    async fn poll(&self) -> Result<Vec<Imported>, PluginError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut fetched = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(source = %self.name, path = %path.display(), error = %e, "Spool file unreadable, leaving it for the next cycle");
                    continue;
                }
            };
            match serde_json::from_slice::<Message>(&raw) {
                Ok(mut message) => {
                    if let Some(holder) = &self.copyright {
                        if message.entry.copyright().is_none() {
                            message.entry.set_copyright(&self.name, holder);
                        }
                    }
                    fetched.push(Imported {
                        message,
                        receipt: path.to_string_lossy().into_owned(),
                    });
                }
                Err(e) => {
                    tracing::warn!(source = %self.name, path = %path.display(), error = %e, "Rejecting spool file");
                    if let Err(e) = self.move_to_rejected(&path).await {
                        tracing::error!(source = %self.name, path = %path.display(), error = %e, "Failed to set spool file aside");
                    }
                }
            }
        }
        Ok(fetched)
    }

    async fn acknowledge(&self, receipt: &str) -> Result<(), PluginError> {
        let path = self.spool_file(receipt)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn reject(&self, receipt: &str) -> Result<(), PluginError> {
        let path = self.spool_file(receipt)?;
        self.move_to_rejected(&path).await
    }

    async fn recover(&self) -> Result<(), PluginError> {
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(PluginError::Unavailable(format!(
                "{} is not a directory",
                self.dir.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::property_types;
    use tempfile::TempDir;

    fn importer(dir: &Path) -> Arc<dyn Importer> {
        let config = ImportSchemaConfig::new("wire", SpoolImporter::TYPE, "wire-1", 1)
            .with_setting("dir", dir.to_str().unwrap());
        SpoolImporter::from_config(&config).unwrap()
    }

    async fn drop_message(dir: &Path, file: &str, header: &str) {
        let msg = Message::new(header, "wire", "EN", &["NEWS"], &[], "text");
        tokio::fs::write(dir.join(file), serde_json::to_vec(&msg).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_poll_leaves_files_until_acknowledged() {
        let dir = TempDir::new().unwrap();
        drop_message(dir.path(), "a.json", "Imported").await;
        tokio::fs::write(dir.path().join("b.json"), b"not json").await.unwrap();
        tokio::fs::write(dir.path().join("c.txt"), b"ignored").await.unwrap();

        let source = importer(dir.path());
        let got = source.poll().await.unwrap();

        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message.entry.header, "Imported");
        assert_eq!(got[0].message.content, "text");
        assert!(dir.path().join("a.json").exists());
        assert!(dir.path().join("rejected/b.json").exists());
        assert!(dir.path().join("c.txt").exists());

        // Fetched again until settled.
        assert_eq!(source.poll().await.unwrap().len(), 1);
        source.acknowledge(&got[0].receipt).await.unwrap();
        assert!(!dir.path().join("a.json").exists());
        assert!(source.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_entry_does_not_lose_earlier_files() {
        let dir = TempDir::new().unwrap();
        drop_message(dir.path(), "a.json", "first").await;
        tokio::fs::create_dir(dir.path().join("b.json")).await.unwrap();

        let got = importer(dir.path()).poll().await.unwrap();

        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message.entry.header, "first");
        assert!(dir.path().join("a.json").exists());
        assert!(dir.path().join("b.json").is_dir());
    }

    #[tokio::test]
    async fn test_reject_moves_file_aside() {
        let dir = TempDir::new().unwrap();
        drop_message(dir.path(), "a.json", "bad").await;
        let source = importer(dir.path());
        let got = source.poll().await.unwrap();

        source.reject(&got[0].receipt).await.unwrap();
        assert!(dir.path().join("rejected/a.json").exists());
        assert!(source.poll().await.unwrap().is_empty());

        let outside = dir.path().join("rejected/a.json");
        assert!(source.acknowledge(outside.to_str().unwrap()).await.is_err());
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn test_copyright_setting_stamps_unmarked_messages() {
        let dir = TempDir::new().unwrap();
        drop_message(dir.path(), "a.json", "plain").await;
        let mut marked = Message::new("marked", "wire", "EN", &["NEWS"], &[], "");
        marked.entry.set_copyright("wire", "Original Agency");
        tokio::fs::write(dir.path().join("b.json"), serde_json::to_vec(&marked).unwrap())
            .await
            .unwrap();

        let config = ImportSchemaConfig::new("wire", SpoolImporter::TYPE, "wire-1", 1)
            .with_setting("dir", dir.path().to_str().unwrap())
            .with_setting("copyright", "Wire Agency");
        let got = SpoolImporter::from_config(&config).unwrap().poll().await.unwrap();

        assert_eq!(got[0].message.entry.copyright(), Some("Wire Agency"));
        assert_eq!(got[1].message.entry.copyright(), Some("Original Agency"));
        assert_eq!(
            got[1]
                .message
                .entry
                .properties
                .iter()
                .filter(|p| p.kind == property_types::COPYRIGHT)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_dir_fails_poll_and_recover() {
        let dir = TempDir::new().unwrap();
        let source = importer(&dir.path().join("absent"));
        assert!(source.poll().await.is_err());
        assert!(source.recover().await.is_err());
    }
}
